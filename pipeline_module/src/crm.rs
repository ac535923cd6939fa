use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://api.crm.example.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum CrmError {
    #[error("http error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("crm returned {status} for {operation}: {body}")]
    Upstream {
        operation: &'static str,
        status: u16,
        body: String,
    },
    #[error("crm response missing field '{0}'")]
    MissingField(&'static str),
}

/// Thin blocking client for the CRM collaborator. Only the calls the
/// pipeline depends on are exposed; everything else the CRM offers is
/// out of scope.
#[derive(Clone)]
pub struct CrmClient {
    http: reqwest::blocking::Client,
    base_url: String,
    token: String,
}

#[derive(Deserialize)]
struct SignedUrlResponse {
    url: Option<String>,
}

impl CrmClient {
    pub fn new(base_url: Option<&str>, token: &str) -> Result<Self, CrmError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            token: token.to_string(),
        })
    }

    /// Fetch a fresh time-limited download link for a stored file. Links
    /// are single-use: callers must not cache them.
    pub fn signed_download_url(&self, file_id: &str) -> Result<String, CrmError> {
        let url = format!("{}/files/{}/signed-url", self.base_url, file_id);
        let response = self.http.get(url).bearer_auth(&self.token).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(CrmError::Upstream {
                operation: "signed-url",
                status: status.as_u16(),
                body: response.text().unwrap_or_default(),
            });
        }
        let parsed: SignedUrlResponse = response.json()?;
        parsed
            .url
            .filter(|value| !value.trim().is_empty())
            .ok_or(CrmError::MissingField("url"))
    }

    /// PATCH a set of properties onto a CRM entity.
    pub fn update_properties(
        &self,
        entity_type: &str,
        entity_id: &str,
        properties: &serde_json::Map<String, Value>,
    ) -> Result<(), CrmError> {
        let url = format!(
            "{}/crm/v3/objects/{}/{}",
            self.base_url, entity_type, entity_id
        );
        let body = serde_json::json!({ "properties": properties });
        debug!(
            "patching {} properties on {}/{}",
            properties.len(),
            entity_type,
            entity_id
        );
        let response = self
            .http
            .patch(url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(CrmError::Upstream {
                operation: "update-properties",
                status: status.as_u16(),
                body: response.text().unwrap_or_default(),
            });
        }
        Ok(())
    }

    /// Read a single property value from an entity; `None` when unset.
    pub fn read_property(
        &self,
        entity_type: &str,
        entity_id: &str,
        property: &str,
    ) -> Result<Option<String>, CrmError> {
        let url = format!(
            "{}/crm/v3/objects/{}/{}?properties={}",
            self.base_url, entity_type, entity_id, property
        );
        let response = self.http.get(url).bearer_auth(&self.token).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(CrmError::Upstream {
                operation: "read-property",
                status: status.as_u16(),
                body: response.text().unwrap_or_default(),
            });
        }
        let parsed: Value = response.json()?;
        Ok(parsed["properties"][property]
            .as_str()
            .map(|value| value.to_string())
            .filter(|value| !value.is_empty()))
    }

    /// List the file ids associated with an entity (opaque JSON from the
    /// CRM's association endpoint).
    pub fn list_file_associations(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<String>, CrmError> {
        let url = format!(
            "{}/crm/v3/objects/{}/{}/associations/files",
            self.base_url, entity_type, entity_id
        );
        let response = self.http.get(url).bearer_auth(&self.token).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(CrmError::Upstream {
                operation: "list-associations",
                status: status.as_u16(),
                body: response.text().unwrap_or_default(),
            });
        }
        let parsed: Value = response.json()?;
        let results = parsed["results"].as_array().cloned().unwrap_or_default();
        Ok(results
            .iter()
            .filter_map(|entry| entry["id"].as_str().map(|id| id.to_string()))
            .collect())
    }
}
