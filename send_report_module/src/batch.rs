use std::path::PathBuf;

use tracing::warn;

/// A file staged on local disk for attachment to an outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentFile {
    pub filename: String,
    pub local_path: PathBuf,
    pub size_bytes: u64,
}

/// An ordered group of attachments whose cumulative size fits one message.
#[derive(Debug, Clone, Default)]
pub struct AttachmentBatch {
    pub files: Vec<AttachmentFile>,
}

impl AttachmentBatch {
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|file| file.size_bytes).sum()
    }

    fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct BatchPlan {
    pub batches: Vec<AttachmentBatch>,
    /// Files larger than the ceiling on their own; skipped, never sent.
    pub skipped: Vec<AttachmentFile>,
}

impl BatchPlan {
    pub fn total_attachments(&self) -> usize {
        self.batches.iter().map(|batch| batch.files.len()).sum()
    }
}

/// Greedy, order-preserving packing of `files` into batches of at most
/// `max_batch_bytes` each. A batch may total exactly `max_batch_bytes`.
/// Input order is kept within and across batches.
pub fn build_batches(files: Vec<AttachmentFile>, max_batch_bytes: u64) -> BatchPlan {
    let mut plan = BatchPlan::default();
    let mut current = AttachmentBatch::default();

    for file in files {
        if file.size_bytes > max_batch_bytes {
            warn!(
                "skipping attachment {} ({} bytes): exceeds batch ceiling of {} bytes",
                file.filename, file.size_bytes, max_batch_bytes
            );
            plan.skipped.push(file);
            continue;
        }
        if !current.is_empty() && current.total_bytes() + file.size_bytes > max_batch_bytes {
            plan.batches.push(std::mem::take(&mut current));
        }
        current.files.push(file);
    }

    if !current.is_empty() {
        plan.batches.push(current);
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    fn file(name: &str, size: u64) -> AttachmentFile {
        AttachmentFile {
            filename: name.to_string(),
            local_path: PathBuf::from(format!("/tmp/{name}")),
            size_bytes: size,
        }
    }

    #[test]
    fn packs_greedily_and_skips_oversized_files() {
        let files = vec![
            file("a.pdf", MB),
            file("b.pdf", MB),
            file("c.pdf", 3 * MB),
            file("d.pdf", MB / 2),
        ];

        let plan = build_batches(files, 2 * MB);

        assert_eq!(plan.batches.len(), 2);
        assert_eq!(plan.batches[0].files.len(), 2);
        assert_eq!(plan.batches[0].total_bytes(), 2 * MB);
        assert_eq!(plan.batches[1].files.len(), 1);
        assert_eq!(plan.batches[1].files[0].filename, "d.pdf");
        assert_eq!(plan.skipped.len(), 1);
        assert_eq!(plan.skipped[0].filename, "c.pdf");
        assert_eq!(plan.total_attachments(), 3);
    }

    #[test]
    fn batch_may_total_exactly_the_ceiling() {
        let plan = build_batches(vec![file("a", MB), file("b", MB)], 2 * MB);
        assert_eq!(plan.batches.len(), 1);
        assert_eq!(plan.batches[0].total_bytes(), 2 * MB);
    }

    #[test]
    fn preserves_input_order_across_batches() {
        let files = vec![
            file("first", 3),
            file("second", 3),
            file("third", 3),
            file("fourth", 3),
        ];
        let plan = build_batches(files, 6);
        let order: Vec<&str> = plan
            .batches
            .iter()
            .flat_map(|batch| batch.files.iter().map(|f| f.filename.as_str()))
            .collect();
        assert_eq!(order, vec!["first", "second", "third", "fourth"]);
        assert_eq!(plan.batches.len(), 2);
    }

    #[test]
    fn empty_input_yields_empty_plan() {
        let plan = build_batches(Vec::new(), MB);
        assert!(plan.batches.is_empty());
        assert!(plan.skipped.is_empty());
    }

    #[test]
    fn single_file_at_ceiling_is_not_skipped() {
        let plan = build_batches(vec![file("exact", 2 * MB)], 2 * MB);
        assert_eq!(plan.batches.len(), 1);
        assert!(plan.skipped.is_empty());
    }
}
