use std::fs;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use send_report_module::{build_batches, dispatch, AttachmentFile, BatchSender, DispatchOptions};

use crate::crm::{CrmClient, CrmError};
use crate::event::{classify_event, AnalyzeTarget, EventError, InboundEvent, ReportTrigger, WebhookEvent};
use crate::extraction::FieldExtractor;
use crate::file_resolver::{classify, ContentCategory, FileResolver};
use crate::record_store::RecordStore;
use crate::task_queue::{QueueError, TaskQueue};

/// Collaborator lookups the email path needs: which files hang off an
/// entity and where its report should go.
pub trait EntityDirectory: Send + Sync {
    fn file_ids(&self, entity_type: &str, entity_id: &str) -> Result<Vec<String>, CrmError>;
    fn recipient(&self, entity_type: &str, entity_id: &str) -> Result<Option<String>, CrmError>;
}

impl EntityDirectory for CrmClient {
    fn file_ids(&self, entity_type: &str, entity_id: &str) -> Result<Vec<String>, CrmError> {
        self.list_file_associations(entity_type, entity_id)
    }

    fn recipient(&self, entity_type: &str, entity_id: &str) -> Result<Option<String>, CrmError> {
        self.read_property(entity_type, entity_id, "email")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Validation(#[from] EventError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Result of a synchronous analyze run. Extraction and persistence
/// failures land in `error` rather than bubbling up: model flakiness is
/// not a webhook failure.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeOutcome {
    pub file_type: &'static str,
    pub updated: bool,
    pub fields_written: usize,
    pub fields_failed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug)]
pub enum WebhookOutcome {
    Ignored { reason: &'static str },
    Analyzed(AnalyzeOutcome),
    ReportQueued { task_id: Uuid },
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub trigger: ReportTrigger,
    /// Entity type report events refer to (their payload only carries an id).
    pub report_entity_type: String,
    pub report_subject: String,
    pub report_body: String,
    pub max_batch_bytes: u64,
    pub inter_message_delay: Duration,
}

/// Top-level webhook pipeline: classify the event, run the analyze
/// pipeline inline, or queue the report pipeline and return at once.
pub struct WebhookOrchestrator<F, X, R, D, S> {
    resolver: Arc<F>,
    extractor: Arc<X>,
    store: Arc<R>,
    directory: Arc<D>,
    sender: Arc<S>,
    queue: Arc<TaskQueue>,
    settings: OrchestratorSettings,
}

impl<F, X, R, D, S> WebhookOrchestrator<F, X, R, D, S>
where
    F: FileResolver + 'static,
    X: FieldExtractor + 'static,
    R: RecordStore + 'static,
    D: EntityDirectory + 'static,
    S: BatchSender + 'static,
{
    pub fn new(
        resolver: Arc<F>,
        extractor: Arc<X>,
        store: Arc<R>,
        directory: Arc<D>,
        sender: Arc<S>,
        queue: Arc<TaskQueue>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            resolver,
            extractor,
            store,
            directory,
            sender,
            queue,
            settings,
        }
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn handle_event(&self, event: &InboundEvent) -> Result<WebhookOutcome, OrchestratorError> {
        match classify_event(event, &self.settings.trigger)? {
            WebhookEvent::Ignored { reason } => {
                info!("ignoring event for object {}: {}", event.object_id_string(), reason);
                Ok(WebhookOutcome::Ignored { reason })
            }
            WebhookEvent::Analyze(target) => Ok(WebhookOutcome::Analyzed(self.run_analyze(&target))),
            WebhookEvent::EmailReport { entity_id } => {
                let task_id = self.enqueue_report(&entity_id)?;
                Ok(WebhookOutcome::ReportQueued { task_id })
            }
        }
    }

    /// resolve → classify → extract → persist, strictly in that order.
    /// Every failure downgrades to a soft outcome plus a best-effort
    /// error-log write on the entity.
    fn run_analyze(&self, target: &AnalyzeTarget) -> AnalyzeOutcome {
        let link = match self.resolver.resolve(&target.file_id) {
            Ok(link) => link,
            Err(err) => {
                return self.soft_failure(target, "unknown", format!("file resolve failed: {err}"));
            }
        };

        let category = classify(&link.url);
        let file_type = category.as_str();
        let extracted = match category {
            ContentCategory::Image => self.extractor.extract_from_image(&link.url),
            ContentCategory::Document => self.extractor.extract_from_document(&link.url),
            ContentCategory::Unsupported => {
                return self.soft_failure(
                    target,
                    file_type,
                    format!("unsupported file type for {}", target.file_id),
                );
            }
        };
        let record = match extracted {
            Ok(record) => record,
            Err(err) => {
                return self.soft_failure(target, file_type, format!("extraction failed: {err}"));
            }
        };

        match self
            .store
            .save_extracted_record(&target.entity_type, &target.entity_id, &record)
        {
            Ok(report) => {
                info!(
                    "analyzed {} for {}/{}: {} fields written, {} failed",
                    target.file_id,
                    target.entity_type,
                    target.entity_id,
                    report.written.len(),
                    report.failed.len()
                );
                AnalyzeOutcome {
                    file_type,
                    updated: true,
                    fields_written: report.written.len(),
                    fields_failed: report.failed.len(),
                    error: None,
                }
            }
            Err(err) => self.soft_failure(target, file_type, format!("persistence failed: {err}")),
        }
    }

    fn soft_failure(
        &self,
        target: &AnalyzeTarget,
        file_type: &'static str,
        message: String,
    ) -> AnalyzeOutcome {
        warn!(
            "analyze of {} for {}/{} degraded: {}",
            target.file_id, target.entity_type, target.entity_id, message
        );
        let context = json!({ "fileId": target.file_id });
        if !self
            .store
            .log_error(&target.entity_type, &target.entity_id, &message, &context)
        {
            warn!(
                "error-log write skipped for {}/{}",
                target.entity_type, target.entity_id
            );
        }
        AnalyzeOutcome {
            file_type,
            updated: false,
            fields_written: 0,
            fields_failed: 0,
            error: Some(message),
        }
    }

    fn enqueue_report(&self, entity_id: &str) -> Result<Uuid, QueueError> {
        let resolver = Arc::clone(&self.resolver);
        let directory = Arc::clone(&self.directory);
        let sender = Arc::clone(&self.sender);
        let settings = self.settings.clone();
        let entity_id = entity_id.to_string();
        let label = format!("email-report:{entity_id}");

        self.queue.enqueue(
            &label,
            Box::new(move || {
                run_report(
                    resolver.as_ref(),
                    directory.as_ref(),
                    sender.as_ref(),
                    &settings,
                    &entity_id,
                )
            }),
        )
    }
}

/// The queued report pipeline: gather associated files, stage them in a
/// scoped temp dir, batch under the size ceiling, send. The temp dir is
/// removed on every exit path by its drop guard.
fn run_report<F: FileResolver, D: EntityDirectory, S: BatchSender>(
    resolver: &F,
    directory: &D,
    sender: &S,
    settings: &OrchestratorSettings,
    entity_id: &str,
) -> Result<(), String> {
    let entity_type = settings.report_entity_type.as_str();
    let recipient = directory
        .recipient(entity_type, entity_id)
        .map_err(|err| format!("recipient lookup failed: {err}"))?
        .ok_or_else(|| format!("no recipient address on {entity_type}/{entity_id}"))?;
    let file_ids = directory
        .file_ids(entity_type, entity_id)
        .map_err(|err| format!("association listing failed: {err}"))?;
    if file_ids.is_empty() {
        info!("no files associated with {}/{}; nothing to send", entity_type, entity_id);
        return Ok(());
    }

    let staging = tempfile::TempDir::new().map_err(|err| format!("temp dir failed: {err}"))?;
    let mut files = Vec::with_capacity(file_ids.len());
    for file_id in &file_ids {
        let link = resolver
            .resolve(file_id)
            .map_err(|err| format!("resolve of {file_id} failed: {err}"))?;
        let mut filename = attachment_filename(file_id, &link.url);
        // Two files can share a basename; keep both.
        if staging.path().join(&filename).exists() {
            filename = format!("{file_id}_{filename}");
        }
        let local_path = staging.path().join(&filename);
        resolver
            .materialize(&link.url, &local_path)
            .map_err(|err| format!("download of {file_id} failed: {err}"))?;
        let size_bytes = fs::metadata(&local_path)
            .map_err(|err| format!("stat of {filename} failed: {err}"))?
            .len();
        files.push(AttachmentFile {
            filename,
            local_path,
            size_bytes,
        });
    }

    let plan = build_batches(files, settings.max_batch_bytes);
    if plan.batches.is_empty() {
        info!(
            "all {} attachments for {}/{} were skipped; nothing to send",
            plan.skipped.len(),
            entity_type,
            entity_id
        );
        return Ok(());
    }

    let options = DispatchOptions {
        recipient,
        subject: settings.report_subject.clone(),
        html_body: settings.report_body.clone(),
        inter_message_delay: settings.inter_message_delay,
    };
    let report = dispatch(sender, &plan.batches, &options)
        .map_err(|err| format!("report dispatch failed: {err}"))?;
    info!(
        "report for {}/{}: {} messages, {} attachments, {} skipped",
        entity_type,
        entity_id,
        report.sent,
        report.total_attachments,
        plan.skipped.len()
    );
    Ok(())
}

fn attachment_filename(file_id: &str, url: &str) -> String {
    let name = url
        .split(['?', '#'])
        .next()
        .unwrap_or("")
        .rsplit('/')
        .next()
        .unwrap_or("");
    let mut cleaned = String::new();
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
            cleaned.push(ch);
        } else {
            cleaned.push('_');
        }
    }
    let cleaned = cleaned.trim_matches(&['.', '_', '-'][..]);
    if cleaned.is_empty() {
        format!("file_{file_id}")
    } else {
        cleaned.to_string()
    }
}
