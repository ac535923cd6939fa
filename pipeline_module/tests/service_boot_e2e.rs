use std::net::TcpListener;
use std::time::{Duration, Instant};

use pipeline_module::event::ReportTrigger;
use pipeline_module::service::{run_server, ServiceConfig};

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("bind")
        .local_addr()
        .expect("addr")
        .port()
}

fn test_config(port: u16) -> ServiceConfig {
    ServiceConfig {
        host: "127.0.0.1".to_string(),
        port,
        crm_base_url: None,
        crm_api_token: "crm-token".to_string(),
        extraction_base_url: None,
        extraction_api_key: "ai-key".to_string(),
        extraction_model: "test-model".to_string(),
        email_api_base_url: None,
        email_server_token: "mail-token".to_string(),
        report_from_address: "reports@example.com".to_string(),
        report_trigger: ReportTrigger {
            property_name: "send_report".to_string(),
            subscription_type: "contact.propertyChange".to_string(),
        },
        report_entity_type: "contact".to_string(),
        report_subject: "Your documents".to_string(),
        max_batch_bytes: 8 * 1024 * 1024,
        batch_delay: Duration::ZERO,
        queue_max_attempts: 1,
        download_timeout: Duration::from_secs(5),
        download_max_bytes: 1024 * 1024,
        field_write_delay: Duration::ZERO,
        inbound_body_max_bytes: 1024 * 1024,
    }
}

async fn wait_for_health(base: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(response) = reqwest::get(format!("{base}/health")).await {
            if response.status().is_success() {
                return;
            }
        }
        assert!(Instant::now() < deadline, "server did not come up");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn server_boots_and_serves_health_and_queue_status() {
    let port = free_port();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(run_server(test_config(port), async {
        stop_rx.await.ok();
    }));

    let base = format!("http://127.0.0.1:{port}");
    wait_for_health(&base).await;

    let status = reqwest::get(format!("{base}/queue/status"))
        .await
        .expect("queue status");
    assert_eq!(status.status().as_u16(), 200);
    let body: serde_json::Value = status.json().await.expect("json");
    assert_eq!(body["queued"], 0);
    assert_eq!(body["processing"], false);

    stop_tx.send(()).ok();
    server.await.expect("join").expect("server exit");
}

#[tokio::test(flavor = "multi_thread")]
async fn webhook_consumes_only_the_first_event_of_an_array() {
    let port = free_port();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(run_server(test_config(port), async {
        stop_rx.await.ok();
    }));

    let base = format!("http://127.0.0.1:{port}");
    wait_for_health(&base).await;

    // First element has no property value, so it is ignored; the report
    // trigger in the second element must never be reached.
    let payload = r#"[
        {"objectId": 1, "propertyName": "file_id", "subscriptionType": "contact.propertyChange"},
        {"objectId": 2, "propertyName": "send_report", "propertyValue": "true", "subscriptionType": "contact.propertyChange"}
    ]"#;
    let response = reqwest::Client::new()
        .post(format!("{base}/webhooks/crm"))
        .body(payload)
        .send()
        .await
        .expect("post webhook");
    assert_eq!(response.status().as_u16(), 204);

    let status: serde_json::Value = reqwest::get(format!("{base}/queue/status"))
        .await
        .expect("queue status")
        .json()
        .await
        .expect("json");
    assert_eq!(status["queued"], 0);
    assert_eq!(status["tasks"].as_array().map(Vec::len), Some(0));

    stop_tx.send(()).ok();
    server.await.expect("join").expect("server exit");
}
