use std::thread;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::{error, warn};

use crate::crm::{CrmClient, CrmError};
use crate::extraction::ExtractedRecord;

pub const DEFAULT_FIELD_WRITE_DELAY: Duration = Duration::from_millis(100);

/// Property carrying the whole serialized record.
const RECORD_PROPERTY: &str = "extracted_document_data";
/// Property humans check when a record was not updated.
const ERROR_LOG_PROPERTY: &str = "document_processing_log";

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("crm write failed: {0}")]
    Upstream(#[from] CrmError),
    #[error("record serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldWriteFailure {
    pub property: String,
    pub error: String,
}

/// Per-field outcome of a save. The serialized record write is the hard
/// requirement; projections are best-effort and reported here.
#[derive(Debug, Clone, Default)]
pub struct FieldWriteReport {
    pub written: Vec<String>,
    pub failed: Vec<FieldWriteFailure>,
}

/// Persistence seam for extraction results and diagnostics.
pub trait RecordStore: Send + Sync {
    fn save_extracted_record(
        &self,
        entity_type: &str,
        entity_id: &str,
        record: &ExtractedRecord,
    ) -> Result<FieldWriteReport, PersistenceError>;

    /// Best-effort diagnostic write. Invoked from error-handling paths,
    /// so it must never fail: returns false instead.
    fn log_error(&self, entity_type: &str, entity_id: &str, message: &str, context: &Value)
        -> bool;
}

pub struct CrmRecordStore {
    crm: CrmClient,
    field_write_delay: Duration,
}

impl CrmRecordStore {
    pub fn new(crm: CrmClient, field_write_delay: Duration) -> Self {
        Self {
            crm,
            field_write_delay,
        }
    }

    fn write_single(
        &self,
        entity_type: &str,
        entity_id: &str,
        property: &str,
        value: String,
    ) -> Result<(), CrmError> {
        let mut properties = serde_json::Map::new();
        properties.insert(property.to_string(), Value::String(value));
        self.crm.update_properties(entity_type, entity_id, &properties)
    }
}

fn field_projections(record: &ExtractedRecord) -> Vec<(&'static str, Option<String>)> {
    vec![
        ("full_name", record.full_name()),
        ("street_address", record.street_address.clone()),
        ("date_of_birth", record.date_of_birth.clone()),
        ("nationality", record.nationality.clone()),
        ("permit_expiry_date", record.permit_expiry_date.clone()),
        ("permit_type", record.permit_type.clone()),
    ]
}

impl RecordStore for CrmRecordStore {
    fn save_extracted_record(
        &self,
        entity_type: &str,
        entity_id: &str,
        record: &ExtractedRecord,
    ) -> Result<FieldWriteReport, PersistenceError> {
        let serialized = serde_json::to_string(record)?;
        self.write_single(entity_type, entity_id, RECORD_PROPERTY, serialized)?;

        let mut report = FieldWriteReport::default();
        report.written.push(RECORD_PROPERTY.to_string());

        // One write per field with a pause in between, to stay under the
        // CRM's rate limits. A failed projection never aborts the rest.
        for (property, value) in field_projections(record) {
            let Some(value) = value else { continue };
            if !self.field_write_delay.is_zero() {
                thread::sleep(self.field_write_delay);
            }
            match self.write_single(entity_type, entity_id, property, value) {
                Ok(()) => report.written.push(property.to_string()),
                Err(err) => {
                    warn!(
                        "field projection {} failed for {}/{}: {}",
                        property, entity_type, entity_id, err
                    );
                    report.failed.push(FieldWriteFailure {
                        property: property.to_string(),
                        error: err.to_string(),
                    });
                }
            }
        }

        Ok(report)
    }

    fn log_error(
        &self,
        entity_type: &str,
        entity_id: &str,
        message: &str,
        context: &Value,
    ) -> bool {
        let mut entry = serde_json::Map::new();
        entry.insert("error".to_string(), Value::Bool(true));
        entry.insert("message".to_string(), Value::String(message.to_string()));
        entry.insert(
            "timestamp".to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );
        if let Value::Object(extra) = context {
            for (key, value) in extra {
                entry.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }

        let serialized = Value::Object(entry).to_string();
        match self.write_single(entity_type, entity_id, ERROR_LOG_PROPERTY, serialized) {
            Ok(()) => true,
            Err(err) => {
                error!(
                    "error-log write failed for {}/{}: {}",
                    entity_type, entity_id, err
                );
                false
            }
        }
    }
}
