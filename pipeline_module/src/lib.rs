pub mod crm;
pub mod event;
pub mod extraction;
pub mod file_resolver;
pub mod orchestrator;
pub mod record_store;
pub mod service;
pub mod task_queue;

pub use event::{classify_event, InboundEvent, ReportTrigger, WebhookEvent};
pub use extraction::{ExtractedRecord, ExtractionClient, FieldExtractor};
pub use file_resolver::{classify, ContentCategory, CrmFileResolver, FileResolver};
pub use orchestrator::{WebhookOrchestrator, WebhookOutcome};
pub use record_store::{CrmRecordStore, RecordStore};
pub use service::{run_server, ServiceConfig};
pub use task_queue::{TaskQueue, TaskStatus};
