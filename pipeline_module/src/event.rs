use serde::Deserialize;

/// One CRM change notification. The webhook transport delivers either a
/// single object or a JSON array of them; only the first element is
/// consumed.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundEvent {
    #[serde(rename = "objectId")]
    pub object_id: serde_json::Value,
    #[serde(rename = "propertyName")]
    pub property_name: Option<String>,
    #[serde(rename = "propertyValue")]
    pub property_value: Option<String>,
    #[serde(rename = "subscriptionType")]
    pub subscription_type: Option<String>,
}

impl InboundEvent {
    pub fn object_id_string(&self) -> String {
        match &self.object_id {
            serde_json::Value::String(value) => value.clone(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("invalid analyze trigger '{0}': expected 'fileId,entityType,entityId'")]
    Validation(String),
}

/// The (property name, subscription type) pair that flips an event onto
/// the email-report path.
#[derive(Debug, Clone)]
pub struct ReportTrigger {
    pub property_name: String,
    pub subscription_type: String,
}

/// Target of an analyze event, parsed from the comma-separated triple in
/// `propertyValue`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalyzeTarget {
    pub file_id: String,
    pub entity_type: String,
    pub entity_id: String,
}

/// Explicit classification of an inbound event. Matching the configured
/// report trigger wins; otherwise a present property value means analyze;
/// anything else is acknowledged and dropped.
#[derive(Debug, Clone)]
pub enum WebhookEvent {
    Analyze(AnalyzeTarget),
    EmailReport { entity_id: String },
    Ignored { reason: &'static str },
}

pub fn classify_event(
    event: &InboundEvent,
    trigger: &ReportTrigger,
) -> Result<WebhookEvent, EventError> {
    let property_name = event.property_name.as_deref().unwrap_or("");
    let subscription_type = event.subscription_type.as_deref().unwrap_or("");

    if property_name == trigger.property_name && subscription_type == trigger.subscription_type {
        return Ok(WebhookEvent::EmailReport {
            entity_id: event.object_id_string(),
        });
    }

    let Some(value) = event
        .property_value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    else {
        return Ok(WebhookEvent::Ignored {
            reason: "no property value",
        });
    };

    Ok(WebhookEvent::Analyze(parse_analyze_target(value)?))
}

fn parse_analyze_target(value: &str) -> Result<AnalyzeTarget, EventError> {
    let parts: Vec<&str> = value.split(',').map(str::trim).collect();
    if parts.len() != 3 || parts.iter().any(|part| part.is_empty()) {
        return Err(EventError::Validation(value.to_string()));
    }
    Ok(AnalyzeTarget {
        file_id: parts[0].to_string(),
        entity_type: parts[1].to_string(),
        entity_id: parts[2].to_string(),
    })
}
