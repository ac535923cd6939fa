use std::fs;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use tracing::debug;

use crate::crm::{CrmClient, CrmError};

pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_DOWNLOAD_MAX_BYTES: u64 = 10 * 1024 * 1024;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "heic"];
const DOCUMENT_EXTENSIONS: &[&str] = &["pdf", "doc", "docx"];

/// What kind of content a download link points at, judged purely from
/// the URL's path extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentCategory {
    Image,
    Document,
    Unsupported,
}

impl ContentCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentCategory::Image => "image",
            ContentCategory::Document => "document",
            ContentCategory::Unsupported => "unsupported",
        }
    }
}

/// Classify a URL by path extension, case-insensitively. Unknown or
/// missing extensions and malformed URLs are `Unsupported`; this never
/// fails.
pub fn classify(url: &str) -> ContentCategory {
    let path = url
        .split(['?', '#'])
        .next()
        .unwrap_or("")
        .rsplit('/')
        .next()
        .unwrap_or("");
    let Some((stem, extension)) = path.rsplit_once('.') else {
        return ContentCategory::Unsupported;
    };
    if stem.is_empty() {
        return ContentCategory::Unsupported;
    }
    let extension = extension.to_ascii_lowercase();
    if IMAGE_EXTENSIONS.contains(&extension.as_str()) {
        ContentCategory::Image
    } else if DOCUMENT_EXTENSIONS.contains(&extension.as_str()) {
        ContentCategory::Document
    } else {
        ContentCategory::Unsupported
    }
}

/// A fresh, time-limited download link. Fetched per operation and never
/// cached; expiry is implicit in the URL itself.
#[derive(Debug, Clone)]
pub struct SignedDownloadLink {
    pub url: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("file service error: {0}")]
    Upstream(#[from] CrmError),
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("download transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("download returned status {0}")]
    Status(u16),
    #[error("download exceeds {limit} byte limit")]
    TooLarge { limit: u64 },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Seam between the pipeline and the file service: resolving an opaque
/// file id to a signed link, and pulling remote bytes to local disk.
pub trait FileResolver: Send + Sync {
    fn resolve(&self, file_id: &str) -> Result<SignedDownloadLink, ResolveError>;
    fn materialize(&self, url: &str, dest: &Path) -> Result<(), DownloadError>;
}

/// Production resolver backed by the CRM's file service.
pub struct CrmFileResolver {
    crm: CrmClient,
    http: reqwest::blocking::Client,
    max_bytes: u64,
}

impl CrmFileResolver {
    pub fn new(crm: CrmClient, timeout: Duration, max_bytes: u64) -> Result<Self, DownloadError> {
        let http = reqwest::blocking::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            crm,
            http,
            max_bytes,
        })
    }
}

impl FileResolver for CrmFileResolver {
    fn resolve(&self, file_id: &str) -> Result<SignedDownloadLink, ResolveError> {
        let url = self.crm.signed_download_url(file_id)?;
        Ok(SignedDownloadLink { url })
    }

    fn materialize(&self, url: &str, dest: &Path) -> Result<(), DownloadError> {
        download_to(&self.http, url, dest, self.max_bytes)
    }
}

/// Stream a remote file to `dest`, creating parent directories. Bails out
/// with `TooLarge` once more than `max_bytes` arrive; the partial file is
/// removed rather than left truncated.
pub fn download_to(
    client: &reqwest::blocking::Client,
    url: &str,
    dest: &Path,
    max_bytes: u64,
) -> Result<(), DownloadError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }

    let response = client.get(url).send()?;
    let status = response.status();
    if !status.is_success() {
        return Err(DownloadError::Status(status.as_u16()));
    }

    let mut reader = response.take(max_bytes + 1);
    let mut file = fs::File::create(dest)?;
    let copied = std::io::copy(&mut reader, &mut file)?;
    drop(file);
    if copied > max_bytes {
        let _ = fs::remove_file(dest);
        return Err(DownloadError::TooLarge { limit: max_bytes });
    }

    debug!("downloaded {} bytes to {}", copied, dest.display());
    Ok(())
}
