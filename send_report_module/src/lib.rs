pub mod batch;
pub mod outbound;

pub use batch::{build_batches, AttachmentBatch, AttachmentFile, BatchPlan};
pub use outbound::{
    dispatch, BatchSender, DispatchOptions, DispatchReport, EmailApiClient, EmailAttachment,
    EmailMessage, MailError,
};
