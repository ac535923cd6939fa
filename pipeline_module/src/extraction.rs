use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::file_resolver::{download_to, DownloadError};

const DEFAULT_BASE_URL: &str = "https://api.extraction.example.com";
pub const DEFAULT_EXTRACTION_MODEL: &str = "gpt-4o-mini";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

const EXTRACTION_INSTRUCTION: &str = "Extract the holder's details from this permit document. \
Respond with only a JSON object, no prose and no code fences, with exactly these keys: \
firstName, lastName, streetAddress, dateOfBirth, nationality, permitExpiryDate, permitType. \
Use null for any field that is not visible.";

/// Structured fields pulled out of a permit document. Immutable once
/// produced; every field is optional because models routinely miss some.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedRecord {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub street_address: Option<String>,
    pub date_of_birth: Option<String>,
    pub nationality: Option<String>,
    pub permit_expiry_date: Option<String>,
    pub permit_type: Option<String>,
}

impl ExtractedRecord {
    /// First and last name joined with a space; `None` when both are
    /// missing.
    pub fn full_name(&self) -> Option<String> {
        let first = self.first_name.as_deref().unwrap_or("").trim();
        let last = self.last_name.as_deref().unwrap_or("").trim();
        let joined = [first, last]
            .iter()
            .filter(|part| !part.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join(" ");
        if joined.is_empty() {
            None
        } else {
            Some(joined)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("extraction transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("extraction service returned {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("extraction service returned an empty response")]
    EmptyResponse,
    #[error("extraction output is not usable JSON: {0}")]
    Unparseable(String),
    #[error("document download failed: {0}")]
    Download(#[from] DownloadError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Seam between the pipeline and the structured-extraction service.
pub trait FieldExtractor: Send + Sync {
    fn extract_from_image(&self, url: &str) -> Result<ExtractedRecord, ExtractionError>;
    fn extract_from_document(&self, url: &str) -> Result<ExtractedRecord, ExtractionError>;
}

/// Client for the hosted extraction model. Images go by signed URL in a
/// JSON body; documents are pulled to a scoped temp file and uploaded.
pub struct ExtractionClient {
    http: reqwest::blocking::Client,
    base_url: String,
    api_key: String,
    model: String,
    download_max_bytes: u64,
    staging_dir: PathBuf,
}

#[derive(Deserialize)]
struct AnalyzeResponse {
    output_text: Option<String>,
}

impl ExtractionClient {
    pub fn new(
        base_url: Option<&str>,
        api_key: &str,
        model: &str,
        download_max_bytes: u64,
    ) -> Result<Self, ExtractionError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            download_max_bytes,
            staging_dir: std::env::temp_dir(),
        })
    }

    /// Directory documents are staged in before upload. Defaults to the
    /// system temp dir.
    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = dir.into();
        self
    }

    fn handle_response(
        &self,
        response: reqwest::blocking::Response,
    ) -> Result<ExtractedRecord, ExtractionError> {
        let status = response.status();
        if !status.is_success() {
            return Err(ExtractionError::Upstream {
                status: status.as_u16(),
                body: response.text().unwrap_or_default(),
            });
        }
        let parsed: AnalyzeResponse = response.json()?;
        let output = parsed
            .output_text
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
            .ok_or(ExtractionError::EmptyResponse)?;
        parse_structured_response(&output)
    }
}

impl FieldExtractor for ExtractionClient {
    fn extract_from_image(&self, url: &str) -> Result<ExtractedRecord, ExtractionError> {
        let body = serde_json::json!({
            "model": self.model,
            "instruction": EXTRACTION_INSTRUCTION,
            "image_url": url,
            "response_format": "json",
        });
        let response = self
            .http
            .post(format!("{}/v1/analyze", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()?;
        self.handle_response(response)
    }

    fn extract_from_document(&self, url: &str) -> Result<ExtractedRecord, ExtractionError> {
        // NamedTempFile removes the staged copy on drop, so the file is
        // gone on every exit path below.
        let staged = tempfile::Builder::new()
            .prefix("extract_doc_")
            .suffix(&url_suffix(url))
            .tempfile_in(&self.staging_dir)?;
        download_to(&self.http, url, staged.path(), self.download_max_bytes)?;
        debug!("staged document for upload at {}", staged.path().display());

        let form = reqwest::blocking::multipart::Form::new()
            .text("model", self.model.clone())
            .text("instruction", EXTRACTION_INSTRUCTION)
            .text("response_format", "json")
            .file("file", staged.path())?;
        let response = self
            .http
            .post(format!("{}/v1/analyze", self.base_url))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()?;
        self.handle_response(response)
    }
}

fn url_suffix(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or("");
    match path.rsplit('/').next().and_then(|name| name.rsplit_once('.')) {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => format!(".{ext}"),
        _ => ".bin".to_string(),
    }
}

static JSON_OBJECT_RE: OnceLock<Regex> = OnceLock::new();

/// Normalize model output into an `ExtractedRecord`. Attempts, in order:
/// a direct parse, a parse after stripping markdown code fences, and a
/// parse of the outermost `{...}` span. Anything else is unusable.
pub fn parse_structured_response(raw: &str) -> Result<ExtractedRecord, ExtractionError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ExtractionError::EmptyResponse);
    }

    if let Ok(record) = serde_json::from_str::<ExtractedRecord>(trimmed) {
        return Ok(record);
    }

    if let Some(inner) = strip_code_fences(trimmed) {
        if let Ok(record) = serde_json::from_str::<ExtractedRecord>(inner) {
            return Ok(record);
        }
    }

    let pattern = JSON_OBJECT_RE.get_or_init(|| Regex::new(r"(?s)\{.*\}").expect("valid regex"));
    if let Some(span) = pattern.find(trimmed) {
        if let Ok(record) = serde_json::from_str::<ExtractedRecord>(span.as_str()) {
            return Ok(record);
        }
    }

    let mut preview = trimmed.chars().take(160).collect::<String>();
    if preview.len() < trimmed.len() {
        preview.push('…');
    }
    Err(ExtractionError::Unparseable(preview))
}

fn strip_code_fences(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after_fence = &text[start + 3..];
    // Skip a language tag such as "json" on the fence line.
    let content_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(0);
    let content = &after_fence[content_start..];
    let end = content.find("```")?;
    Some(content[..end].trim())
}
