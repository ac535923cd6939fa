use std::env;
use std::time::Duration;

use crate::event::ReportTrigger;
use crate::extraction::DEFAULT_EXTRACTION_MODEL;
use crate::file_resolver::{DEFAULT_DOWNLOAD_MAX_BYTES, DEFAULT_DOWNLOAD_TIMEOUT};
use crate::record_store::DEFAULT_FIELD_WRITE_DELAY;
use crate::task_queue::DEFAULT_MAX_ATTEMPTS;

use super::BoxError;

pub const DEFAULT_INBOUND_BODY_MAX_BYTES: usize = 1024 * 1024;
pub const DEFAULT_MAX_BATCH_BYTES: u64 = 8 * 1024 * 1024;
pub const DEFAULT_BATCH_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    /// Base URL overrides exist for tests; None means the live endpoints.
    pub crm_base_url: Option<String>,
    pub crm_api_token: String,
    pub extraction_base_url: Option<String>,
    pub extraction_api_key: String,
    pub extraction_model: String,
    pub email_api_base_url: Option<String>,
    pub email_server_token: String,
    pub report_from_address: String,
    pub report_trigger: ReportTrigger,
    pub report_entity_type: String,
    pub report_subject: String,
    pub max_batch_bytes: u64,
    pub batch_delay: Duration,
    pub queue_max_attempts: u32,
    pub download_timeout: Duration,
    pub download_max_bytes: u64,
    pub field_write_delay: Duration,
    pub inbound_body_max_bytes: usize,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, BoxError> {
        dotenvy::dotenv().ok();

        let host = env_var_non_empty("SERVICE_HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port = env::var("SERVICE_PORT")
            .ok()
            .and_then(|value| value.parse::<u16>().ok())
            .unwrap_or(9040);

        let crm_api_token = require_env("CRM_API_TOKEN")?;
        let extraction_api_key = require_env("EXTRACTION_API_KEY")?;
        let email_server_token = require_env("EMAIL_SERVER_TOKEN")?;
        let report_from_address = require_env("REPORT_FROM_ADDRESS")?;

        let crm_base_url = env_var_non_empty("CRM_BASE_URL");
        let extraction_base_url = env_var_non_empty("EXTRACTION_BASE_URL");
        let extraction_model = env_var_non_empty("EXTRACTION_MODEL")
            .unwrap_or_else(|| DEFAULT_EXTRACTION_MODEL.to_string());
        let email_api_base_url = env_var_non_empty("EMAIL_API_BASE_URL");

        let report_trigger = ReportTrigger {
            property_name: env_var_non_empty("REPORT_TRIGGER_PROPERTY")
                .unwrap_or_else(|| "send_report".to_string()),
            subscription_type: env_var_non_empty("REPORT_TRIGGER_SUBSCRIPTION")
                .unwrap_or_else(|| "contact.propertyChange".to_string()),
        };
        let report_entity_type =
            env_var_non_empty("REPORT_ENTITY_TYPE").unwrap_or_else(|| "contact".to_string());
        let report_subject = env_var_non_empty("REPORT_SUBJECT")
            .unwrap_or_else(|| "Your document report".to_string());

        let max_batch_bytes = env_u64("MAX_BATCH_BYTES").unwrap_or(DEFAULT_MAX_BATCH_BYTES);
        let batch_delay = env_u64("BATCH_DELAY_SECS")
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_BATCH_DELAY);
        let queue_max_attempts = env::var("QUEUE_MAX_ATTEMPTS")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_ATTEMPTS);
        let download_timeout = env_u64("DOWNLOAD_TIMEOUT_SECS")
            .filter(|value| *value > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT);
        let download_max_bytes =
            env_u64("DOWNLOAD_MAX_BYTES").unwrap_or(DEFAULT_DOWNLOAD_MAX_BYTES);
        let field_write_delay = env_u64("FIELD_WRITE_DELAY_MS")
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_FIELD_WRITE_DELAY);
        let inbound_body_max_bytes = env::var("INBOUND_BODY_MAX_BYTES")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_INBOUND_BODY_MAX_BYTES);

        Ok(Self {
            host,
            port,
            crm_base_url,
            crm_api_token,
            extraction_base_url,
            extraction_api_key,
            extraction_model,
            email_api_base_url,
            email_server_token,
            report_from_address,
            report_trigger,
            report_entity_type,
            report_subject,
            max_batch_bytes,
            batch_delay,
            queue_max_attempts,
            download_timeout,
            download_max_bytes,
            field_write_delay,
            inbound_body_max_bytes,
        })
    }
}

fn require_env(key: &str) -> Result<String, BoxError> {
    env_var_non_empty(key).ok_or_else(|| format!("{key} must be set").into())
}

fn env_var_non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|value| value.parse::<u64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    struct EnvGuard {
        key: String,
        previous: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &str, value: &str) -> Self {
            let previous = env::var(key).ok();
            env::set_var(key, value);
            Self {
                key: key.to_string(),
                previous,
            }
        }

        fn unset(key: &str) -> Self {
            let previous = env::var(key).ok();
            env::remove_var(key);
            Self {
                key: key.to_string(),
                previous,
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.previous {
                Some(value) => env::set_var(&self.key, value),
                None => env::remove_var(&self.key),
            }
        }
    }

    fn required_guards() -> Vec<EnvGuard> {
        vec![
            EnvGuard::set("CRM_API_TOKEN", "crm-token"),
            EnvGuard::set("EXTRACTION_API_KEY", "ai-key"),
            EnvGuard::set("EMAIL_SERVER_TOKEN", "mail-token"),
            EnvGuard::set("REPORT_FROM_ADDRESS", "reports@example.com"),
        ]
    }

    #[test]
    fn from_env_fails_fast_when_a_credential_is_missing() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _guards = required_guards();
        let _missing = EnvGuard::unset("CRM_API_TOKEN");

        let err = ServiceConfig::from_env().expect_err("missing credential");
        assert!(err.to_string().contains("CRM_API_TOKEN"));
    }

    #[test]
    fn from_env_applies_defaults_for_optional_knobs() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _guards = required_guards();
        let _cleared: Vec<EnvGuard> = [
            "SERVICE_HOST",
            "SERVICE_PORT",
            "MAX_BATCH_BYTES",
            "QUEUE_MAX_ATTEMPTS",
            "REPORT_TRIGGER_PROPERTY",
            "DOWNLOAD_TIMEOUT_SECS",
        ]
        .iter()
        .map(|key| EnvGuard::unset(key))
        .collect();

        let config = ServiceConfig::from_env().expect("config");
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9040);
        assert_eq!(config.max_batch_bytes, DEFAULT_MAX_BATCH_BYTES);
        assert_eq!(config.queue_max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(config.report_trigger.property_name, "send_report");
        assert_eq!(config.download_timeout, DEFAULT_DOWNLOAD_TIMEOUT);
    }

    #[test]
    fn from_env_honors_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _guards = required_guards();
        let _port = EnvGuard::set("SERVICE_PORT", "8125");
        let _batch = EnvGuard::set("MAX_BATCH_BYTES", "2097152");
        let _trigger = EnvGuard::set("REPORT_TRIGGER_PROPERTY", "email_docs");
        let _delay = EnvGuard::set("FIELD_WRITE_DELAY_MS", "250");

        let config = ServiceConfig::from_env().expect("config");
        assert_eq!(config.port, 8125);
        assert_eq!(config.max_batch_bytes, 2 * 1024 * 1024);
        assert_eq!(config.report_trigger.property_name, "email_docs");
        assert_eq!(config.field_write_delay, Duration::from_millis(250));
    }
}
