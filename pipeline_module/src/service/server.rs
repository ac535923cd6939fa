use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::task;
use tracing::{error, info, warn};

use send_report_module::EmailApiClient;

use crate::crm::CrmClient;
use crate::event::InboundEvent;
use crate::extraction::ExtractionClient;
use crate::file_resolver::CrmFileResolver;
use crate::orchestrator::{OrchestratorError, OrchestratorSettings, WebhookOrchestrator, WebhookOutcome};
use crate::record_store::CrmRecordStore;
use crate::task_queue::TaskQueue;

use super::config::ServiceConfig;
use super::state::AppState;
use super::BoxError;

pub async fn run_server(
    config: ServiceConfig,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), BoxError> {
    // The collaborators own blocking reqwest clients, which must not be
    // created inside the async runtime.
    type Collaborators = (
        CrmClient,
        CrmFileResolver,
        ExtractionClient,
        CrmRecordStore,
        EmailApiClient,
    );
    let (crm, resolver, extractor, store, sender) = {
        let config = config.clone();
        task::spawn_blocking(move || -> Result<Collaborators, BoxError> {
            let crm = CrmClient::new(config.crm_base_url.as_deref(), &config.crm_api_token)?;
            let resolver = CrmFileResolver::new(
                crm.clone(),
                config.download_timeout,
                config.download_max_bytes,
            )?;
            let extractor = ExtractionClient::new(
                config.extraction_base_url.as_deref(),
                &config.extraction_api_key,
                &config.extraction_model,
                config.download_max_bytes,
            )?;
            let store = CrmRecordStore::new(crm.clone(), config.field_write_delay);
            let sender = EmailApiClient::new(
                config.email_api_base_url.as_deref(),
                &config.email_server_token,
                &config.report_from_address,
            );
            Ok((crm, resolver, extractor, store, sender))
        })
        .await
        .map_err(|err| -> BoxError { err.into() })??
    };
    let queue = Arc::new(TaskQueue::new(config.queue_max_attempts));

    let settings = OrchestratorSettings {
        trigger: config.report_trigger.clone(),
        report_entity_type: config.report_entity_type.clone(),
        report_subject: config.report_subject.clone(),
        report_body: "<p>Please find your documents attached.</p>".to_string(),
        max_batch_bytes: config.max_batch_bytes,
        inter_message_delay: config.batch_delay,
    };
    let orchestrator = Arc::new(WebhookOrchestrator::new(
        Arc::new(resolver),
        Arc::new(extractor),
        Arc::new(store),
        Arc::new(crm),
        Arc::new(sender),
        queue.clone(),
        settings,
    ));

    let state = AppState {
        orchestrator,
        queue: queue.clone(),
    };

    let host: IpAddr = config
        .host
        .parse()
        .map_err(|_| format!("invalid host: {}", config.host))?;
    let addr = SocketAddr::new(host, config.port);
    info!("document pipeline service listening on {}", addr);

    let app = Router::new()
        .route("/health", get(health))
        .route("/webhooks/crm", post(receive_webhook))
        .route("/queue/status", get(queue_status))
        .with_state(state)
        .layer(DefaultBodyLimit::max(config.inbound_body_max_bytes));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;

    let dropped = queue.shutdown();
    if dropped > 0 {
        warn!("shutdown dropped {} queued report tasks", dropped);
    }
    serve_result?;
    Ok(())
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn queue_status(State(state): State<AppState>) -> impl IntoResponse {
    let queue = state.queue.clone();
    match task::spawn_blocking(move || queue.status()).await {
        Ok(status) => (StatusCode::OK, Json(json!(status))).into_response(),
        Err(err) => {
            error!("queue status task panicked: {}", err);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Webhook entry point. The payload is a single event object or an
/// array of them; only the first element is consumed. Events the
/// service does not care about are acknowledged with 204 so the sender
/// does not retry; only a malformed analyze triple earns a 400.
async fn receive_webhook(State(state): State<AppState>, body: Bytes) -> Response {
    if body.is_empty() {
        return StatusCode::NO_CONTENT.into_response();
    }
    let events = match parse_events(&body) {
        Ok(events) => events,
        Err(err) => {
            warn!("unreadable webhook payload acknowledged: {}", err);
            return StatusCode::NO_CONTENT.into_response();
        }
    };
    let Some(event) = events.into_iter().next() else {
        return StatusCode::NO_CONTENT.into_response();
    };

    let orchestrator = state.orchestrator.clone();
    let worker = task::spawn_blocking(move || orchestrator.handle_event(&event));

    match worker.await {
        Ok(Ok(WebhookOutcome::Ignored { .. })) => StatusCode::NO_CONTENT.into_response(),
        Ok(Ok(WebhookOutcome::Analyzed(result))) => (
            StatusCode::OK,
            Json(json!({ "status": "analyzed", "result": result })),
        )
            .into_response(),
        Ok(Ok(WebhookOutcome::ReportQueued { task_id })) => (
            StatusCode::ACCEPTED,
            Json(json!({ "status": "queued", "taskId": task_id })),
        )
            .into_response(),
        Ok(Err(OrchestratorError::Validation(err))) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": err.to_string() })),
        )
            .into_response(),
        Ok(Err(OrchestratorError::Queue(err))) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": err.to_string() })),
        )
            .into_response(),
        Err(err) => {
            error!("webhook task panicked: {}", err);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn parse_events(body: &[u8]) -> Result<Vec<InboundEvent>, serde_json::Error> {
    let value: Value = serde_json::from_slice(body)?;
    if value.is_array() {
        serde_json::from_value(value)
    } else {
        serde_json::from_value(value).map(|event| vec![event])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_events_accepts_single_object_and_array() {
        let single = br#"{"objectId": 1, "propertyName": "file_id"}"#;
        let parsed = parse_events(single).expect("single");
        assert_eq!(parsed.len(), 1);

        let many = br#"[{"objectId": 1}, {"objectId": "2"}]"#;
        let parsed = parse_events(many).expect("array");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1].object_id_string(), "2");
    }

    #[test]
    fn parse_events_rejects_non_event_json() {
        assert!(parse_events(b"[1, 2, 3]").is_err());
        assert!(parse_events(b"\"just a string\"").is_err());
    }
}
