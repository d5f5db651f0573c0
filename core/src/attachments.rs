/// Pending attachment queue and the object storage seam
use crate::error::{ChatError, Result};
use crate::types::AttachmentRef;
use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, warn};
use uuid::Uuid;

/// A file the user picked, held in memory until sent or discarded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHandle {
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub bytes: Bytes,
}

impl FileHandle {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, bytes: Bytes) -> Self {
        Self {
            name: name.into(),
            size: bytes.len() as u64,
            mime_type: mime_type.into(),
            bytes,
        }
    }

    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }

    fn extension(&self) -> &str {
        match self.name.rsplit_once('.') {
            Some((_, ext)) if !ext.is_empty() => ext,
            _ => "bin",
        }
    }

    /// Unique object name for upload: `<millis>-<uuid>.<ext>`
    pub fn object_name(&self, now_millis: u64) -> String {
        format!("{}-{}.{}", now_millis, Uuid::new_v4().simple(), self.extension())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAttachment {
    pub id: Uuid,
    pub file: FileHandle,
    /// Image preview owned by the UI until the item is sent or discarded
    pub preview: Option<Bytes>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveDirection {
    Left,
    Right,
}

/// What happened to one `add` batch
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AddOutcome {
    pub added: usize,
    pub duplicates: usize,
    /// Unique files that did not fit
    pub dropped_over_limit: usize,
}

/// Ordered, bounded queue of files waiting to be sent
#[derive(Debug, Clone)]
pub struct PendingAttachments {
    items: Vec<PendingAttachment>,
    limit: usize,
}

impl PendingAttachments {
    pub fn new(limit: usize) -> Self {
        Self {
            items: Vec::new(),
            limit,
        }
    }

    fn is_duplicate(&self, file: &FileHandle) -> bool {
        self.items
            .iter()
            .any(|p| p.file.name == file.name && p.file.size == file.size)
    }

    /// Add picked files. Same name+size as a queued file is silently dropped.
    /// Fails with `AttachmentLimit` when the queue is already full.
    pub fn add(&mut self, files: Vec<FileHandle>) -> Result<AddOutcome> {
        let total = files.len();
        let mut unique: Vec<FileHandle> = Vec::with_capacity(total);
        for file in files {
            if !self.is_duplicate(&file)
                && !unique.iter().any(|f| f.name == file.name && f.size == file.size)
            {
                unique.push(file);
            }
        }

        let mut outcome = AddOutcome {
            duplicates: total - unique.len(),
            ..Default::default()
        };
        if unique.is_empty() {
            return Ok(outcome);
        }

        let slots = self.limit.saturating_sub(self.items.len());
        if slots == 0 {
            return Err(ChatError::AttachmentLimit { limit: self.limit });
        }
        if outcome.duplicates > 0 {
            debug!("Ignored {} duplicate file(s)", outcome.duplicates);
        }

        outcome.dropped_over_limit = unique.len().saturating_sub(slots);
        for file in unique.into_iter().take(slots) {
            let preview = file.is_image().then(|| file.bytes.clone());
            self.items.push(PendingAttachment {
                id: Uuid::new_v4(),
                file,
                preview,
            });
            outcome.added += 1;
        }
        if outcome.dropped_over_limit > 0 {
            warn!("Limit reached. Only {} file(s) added", outcome.added);
        }
        Ok(outcome)
    }

    pub fn remove(&mut self, id: Uuid) -> bool {
        let before = self.items.len();
        self.items.retain(|p| p.id != id);
        self.items.len() != before
    }

    /// Swap the item at `index` with its neighbour. Out-of-range moves are no-ops.
    pub fn move_item(&mut self, index: usize, direction: MoveDirection) {
        match direction {
            MoveDirection::Left if index > 0 && index < self.items.len() => {
                self.items.swap(index, index - 1)
            }
            MoveDirection::Right if index + 1 < self.items.len() => self.items.swap(index, index + 1),
            _ => {}
        }
    }

    /// Drain the queue for a send attempt
    pub fn take(&mut self) -> Vec<PendingAttachment> {
        std::mem::take(&mut self.items)
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn items(&self) -> &[PendingAttachment] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// External file/object storage
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn upload(&self, bucket: &str, path: &str, file: &FileHandle) -> Result<()>;

    fn public_url(&self, bucket: &str, path: &str) -> String;
}

/// Upload one file and describe it for the message payload
pub async fn upload_attachment(
    storage: &dyn ObjectStorage,
    bucket: &str,
    file: &FileHandle,
    now_millis: u64,
) -> Result<AttachmentRef> {
    let path = file.object_name(now_millis);
    storage.upload(bucket, &path, file).await?;
    Ok(AttachmentRef {
        url: storage.public_url(bucket, &path),
        name: file.name.clone(),
        size: file.size,
        mime_type: file.mime_type.clone(),
    })
}
