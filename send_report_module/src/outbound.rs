use std::fs;
use std::thread;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::Serialize;
use tracing::info;

use crate::batch::AttachmentBatch;

const DEFAULT_API_BASE_URL: &str = "https://api.postmarkapp.com";

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("http error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("email api returned {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("failed to read attachment: {0}")]
    AttachmentRead(#[from] std::io::Error),
}

/// One fully assembled outbound message.
#[derive(Debug, Clone)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub html_body: String,
    pub attachments: Vec<EmailAttachment>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmailAttachment {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Content")]
    pub content: String,
    #[serde(rename = "ContentType")]
    pub content_type: String,
}

/// Transport seam for outbound messages; the orchestrator and tests swap
/// in fakes here.
pub trait BatchSender: Send + Sync {
    fn send(&self, message: &EmailMessage) -> Result<(), MailError>;
}

/// Postmark-style JSON email API client.
pub struct EmailApiClient {
    http: reqwest::blocking::Client,
    base_url: String,
    server_token: String,
    from: String,
}

impl EmailApiClient {
    pub fn new(base_url: Option<&str>, server_token: &str, from: &str) -> Self {
        Self {
            http: reqwest::blocking::Client::new(),
            base_url: base_url
                .unwrap_or(DEFAULT_API_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            server_token: server_token.to_string(),
            from: from.to_string(),
        }
    }
}

#[derive(Serialize)]
struct SendEmailRequest<'a> {
    #[serde(rename = "From")]
    from: &'a str,
    #[serde(rename = "To")]
    to: &'a str,
    #[serde(rename = "Subject")]
    subject: &'a str,
    #[serde(rename = "HtmlBody")]
    html_body: &'a str,
    #[serde(rename = "Attachments", skip_serializing_if = "Vec::is_empty")]
    attachments: &'a Vec<EmailAttachment>,
}

impl BatchSender for EmailApiClient {
    fn send(&self, message: &EmailMessage) -> Result<(), MailError> {
        let request = SendEmailRequest {
            from: &self.from,
            to: &message.to,
            subject: &message.subject,
            html_body: &message.html_body,
            attachments: &message.attachments,
        };
        let response = self
            .http
            .post(format!("{}/email", self.base_url))
            .header("X-Postmark-Server-Token", &self.server_token)
            .json(&request)
            .send()?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(MailError::Upstream {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub recipient: String,
    pub subject: String,
    pub html_body: String,
    /// Pause between consecutive messages, to respect transport rate limits.
    pub inter_message_delay: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub sent: usize,
    pub total_attachments: usize,
}

/// Send each batch as one message, strictly in order. The subject gets an
/// `(i/N)` suffix when more than one message goes out. The first send
/// failure aborts the remainder.
pub fn dispatch(
    sender: &dyn BatchSender,
    batches: &[AttachmentBatch],
    options: &DispatchOptions,
) -> Result<DispatchReport, MailError> {
    let total = batches.len();
    let mut report = DispatchReport {
        sent: 0,
        total_attachments: 0,
    };

    for (index, batch) in batches.iter().enumerate() {
        if index > 0 && !options.inter_message_delay.is_zero() {
            thread::sleep(options.inter_message_delay);
        }

        let subject = if total > 1 {
            format!("{} ({}/{})", options.subject, index + 1, total)
        } else {
            options.subject.clone()
        };

        let mut attachments = Vec::with_capacity(batch.files.len());
        for file in &batch.files {
            let bytes = fs::read(&file.local_path)?;
            let content_type = mime_guess::from_path(&file.local_path)
                .first_or_octet_stream()
                .to_string();
            attachments.push(EmailAttachment {
                name: file.filename.clone(),
                content: BASE64_STANDARD.encode(bytes),
                content_type,
            });
        }

        let message = EmailMessage {
            to: options.recipient.clone(),
            subject,
            html_body: options.html_body.clone(),
            attachments,
        };
        sender.send(&message)?;
        report.sent += 1;
        report.total_attachments += batch.files.len();
        info!(
            "sent report message {}/{} with {} attachments to {}",
            index + 1,
            total,
            batch.files.len(),
            options.recipient
        );
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::AttachmentFile;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct RecordingSender {
        messages: Mutex<Vec<EmailMessage>>,
        fail_on: Option<usize>,
    }

    impl RecordingSender {
        fn new(fail_on: Option<usize>) -> Self {
            Self {
                messages: Mutex::new(Vec::new()),
                fail_on,
            }
        }
    }

    impl BatchSender for RecordingSender {
        fn send(&self, message: &EmailMessage) -> Result<(), MailError> {
            let mut messages = self.messages.lock().unwrap();
            if self.fail_on == Some(messages.len()) {
                return Err(MailError::Upstream {
                    status: 500,
                    body: "boom".to_string(),
                });
            }
            messages.push(message.clone());
            Ok(())
        }
    }

    fn staged_batches(temp: &TempDir, sizes: &[&[usize]]) -> Vec<AttachmentBatch> {
        let mut batches = Vec::new();
        let mut counter = 0;
        for batch_sizes in sizes {
            let mut batch = AttachmentBatch::default();
            for size in batch_sizes.iter() {
                let name = format!("file{counter}.pdf");
                counter += 1;
                let path = temp.path().join(&name);
                fs::write(&path, vec![b'x'; *size]).expect("write attachment");
                batch.files.push(AttachmentFile {
                    filename: name,
                    local_path: path,
                    size_bytes: *size as u64,
                });
            }
            batches.push(batch);
        }
        batches
    }

    fn options() -> DispatchOptions {
        DispatchOptions {
            recipient: "ops@example.com".to_string(),
            subject: "Document report".to_string(),
            html_body: "<p>Attached.</p>".to_string(),
            inter_message_delay: Duration::ZERO,
        }
    }

    #[test]
    fn numbers_subjects_when_multiple_batches() {
        let temp = TempDir::new().expect("tempdir");
        let batches = staged_batches(&temp, &[&[4], &[4]]);
        let sender = RecordingSender::new(None);

        let report = dispatch(&sender, &batches, &options()).expect("dispatch");

        assert_eq!(report, DispatchReport { sent: 2, total_attachments: 2 });
        let messages = sender.messages.lock().unwrap();
        assert_eq!(messages[0].subject, "Document report (1/2)");
        assert_eq!(messages[1].subject, "Document report (2/2)");
    }

    #[test]
    fn single_batch_keeps_plain_subject() {
        let temp = TempDir::new().expect("tempdir");
        let batches = staged_batches(&temp, &[&[4, 4]]);
        let sender = RecordingSender::new(None);

        let report = dispatch(&sender, &batches, &options()).expect("dispatch");

        assert_eq!(report.sent, 1);
        assert_eq!(report.total_attachments, 2);
        let messages = sender.messages.lock().unwrap();
        assert_eq!(messages[0].subject, "Document report");
    }

    #[test]
    fn fails_fast_on_first_send_error() {
        let temp = TempDir::new().expect("tempdir");
        let batches = staged_batches(&temp, &[&[4], &[4], &[4]]);
        let sender = RecordingSender::new(Some(1));

        let err = dispatch(&sender, &batches, &options()).expect_err("should fail");

        assert!(matches!(err, MailError::Upstream { status: 500, .. }));
        assert_eq!(sender.messages.lock().unwrap().len(), 1);
    }

    #[test]
    fn encodes_attachments_with_guessed_content_type() {
        let temp = TempDir::new().expect("tempdir");
        let batches = staged_batches(&temp, &[&[3]]);
        let sender = RecordingSender::new(None);

        dispatch(&sender, &batches, &options()).expect("dispatch");

        let messages = sender.messages.lock().unwrap();
        let attachment = &messages[0].attachments[0];
        assert_eq!(attachment.content_type, "application/pdf");
        assert_eq!(attachment.content, BASE64_STANDARD.encode(b"xxx"));
    }

    #[test]
    fn email_api_client_posts_postmark_payload() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/email")
            .match_header("x-postmark-server-token", "token-123")
            .match_body(mockito::Matcher::AllOf(vec![
                mockito::Matcher::Regex("\"From\":\"reports@example.com\"".to_string()),
                mockito::Matcher::Regex("\"To\":\"ops@example.com\"".to_string()),
                mockito::Matcher::Regex("\"Subject\":\"Hi\"".to_string()),
            ]))
            .with_status(200)
            .with_body(r#"{"ErrorCode":0,"Message":"OK"}"#)
            .expect(1)
            .create();

        let client = EmailApiClient::new(Some(&server.url()), "token-123", "reports@example.com");
        let message = EmailMessage {
            to: "ops@example.com".to_string(),
            subject: "Hi".to_string(),
            html_body: "<p>hello</p>".to_string(),
            attachments: Vec::new(),
        };
        client.send(&message).expect("send");
        mock.assert();
    }

    #[test]
    fn email_api_client_surfaces_upstream_errors() {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("POST", "/email")
            .with_status(422)
            .with_body(r#"{"ErrorCode":300,"Message":"Invalid"}"#)
            .create();

        let client = EmailApiClient::new(Some(&server.url()), "token-123", "reports@example.com");
        let message = EmailMessage {
            to: "ops@example.com".to_string(),
            subject: "Hi".to_string(),
            html_body: String::new(),
            attachments: Vec::new(),
        };
        let err = client.send(&message).expect_err("should fail");
        assert!(matches!(err, MailError::Upstream { status: 422, .. }));
    }
}
