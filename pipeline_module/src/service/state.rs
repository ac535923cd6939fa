use std::sync::Arc;

use send_report_module::EmailApiClient;

use crate::crm::CrmClient;
use crate::extraction::ExtractionClient;
use crate::file_resolver::CrmFileResolver;
use crate::orchestrator::WebhookOrchestrator;
use crate::record_store::CrmRecordStore;
use crate::task_queue::TaskQueue;

/// The orchestrator wired with the live collaborators.
pub type ProductionOrchestrator =
    WebhookOrchestrator<CrmFileResolver, ExtractionClient, CrmRecordStore, CrmClient, EmailApiClient>;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<ProductionOrchestrator>,
    pub queue: Arc<TaskQueue>,
}
