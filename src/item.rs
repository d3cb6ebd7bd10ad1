//! # Work Item Module
//!
//! Questo modulo definisce il record per-file della pipeline e il suo state machine.
//!
//! ## Responsabilità:
//! - Definisce `WorkItem` con identità, payload, formato e stato di processing
//! - Definisce `ItemStatus` (pending → processing → completed/error)
//! - Definisce `PreviewHandle`, l'handle transiente rilasciato alla rimozione
//! - Definisce `ItemPatch` per gli update parziali applicati dallo store
//!
//! ## State machine:
//! - `pending -> processing -> completed`
//! - `pending -> processing -> error`
//! - `processing -> pending` (reset su cancellazione)
//!
//! Gli stati `completed` ed `error` sono terminali finché un reset esplicito
//! non riporta l'item a `pending`.

use crate::codec::{CodecOutput, MediaMetadata};
use crate::formats::{InputFormat, OutputFormat};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Opaque, process-unique item identity.
///
/// Monotonically assigned; a removed item's id never reappears.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ItemId(pub(crate) u64);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Processing status of a work item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Processing,
    Completed,
    Error,
}

impl ItemStatus {
    /// Terminal states are never re-dispatched without an explicit reset
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

/// Transient display handle owned by an item (e.g. a preview reference).
///
/// The release hook runs exactly once, when the handle is dropped — which the
/// store guarantees happens on item removal, batch clear, or replacement.
pub struct PreviewHandle {
    label: String,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl PreviewHandle {
    pub fn new(label: impl Into<String>, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            label: label.into(),
            release: Some(Box::new(release)),
        }
    }

    /// Handle without a release hook, for previews with no backing resource
    pub fn detached(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            release: None,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl Drop for PreviewHandle {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for PreviewHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreviewHandle")
            .field("label", &self.label)
            .field("released_on_drop", &self.release.is_some())
            .finish()
    }
}

/// One user-submitted file and its processing state
#[derive(Debug)]
pub struct WorkItem {
    pub id: ItemId,
    pub name: String,
    pub size: u64,
    pub bytes: Arc<[u8]>,
    pub input_format: InputFormat,
    pub output_format: OutputFormat,
    pub status: ItemStatus,
    pub progress: f32,
    pub error: Option<String>,
    pub result: Option<CodecOutput>,
    pub metadata: Option<MediaMetadata>,
    pub preview: Option<PreviewHandle>,
}

impl WorkItem {
    pub(crate) fn new(
        id: ItemId,
        name: String,
        bytes: Vec<u8>,
        input_format: InputFormat,
        output_format: OutputFormat,
        metadata: Option<MediaMetadata>,
    ) -> Self {
        Self {
            id,
            name,
            size: bytes.len() as u64,
            bytes: bytes.into(),
            input_format,
            output_format,
            status: ItemStatus::Pending,
            progress: 0.0,
            error: None,
            result: None,
            metadata,
            preview: None,
        }
    }

    /// Result byte length, if the item completed
    pub fn result_size(&self) -> Option<u64> {
        self.result.as_ref().map(|r| r.bytes.len() as u64)
    }
}

/// Partial update merged into an item by [`ItemStore::update`].
///
/// The store keeps status and progress consistent when applying a patch:
/// completing forces progress to 100, resetting to pending zeroes progress
/// and clears error and result.
///
/// [`ItemStore::update`]: crate::store::ItemStore::update
#[derive(Default)]
pub struct ItemPatch {
    pub status: Option<ItemStatus>,
    pub progress: Option<f32>,
    pub error: Option<String>,
    pub result: Option<CodecOutput>,
    pub output_format: Option<OutputFormat>,
    pub metadata: Option<MediaMetadata>,
    pub preview: Option<PreviewHandle>,
}

impl ItemPatch {
    pub fn status(status: ItemStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn completed(result: CodecOutput) -> Self {
        Self {
            status: Some(ItemStatus::Completed),
            result: Some(result),
            ..Self::default()
        }
    }

    pub fn errored(message: impl Into<String>) -> Self {
        Self {
            status: Some(ItemStatus::Error),
            error: Some(message.into()),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_terminal_states() {
        assert!(!ItemStatus::Pending.is_terminal());
        assert!(!ItemStatus::Processing.is_terminal());
        assert!(ItemStatus::Completed.is_terminal());
        assert!(ItemStatus::Error.is_terminal());
    }

    #[test]
    fn test_preview_handle_releases_once_on_drop() {
        static RELEASED: AtomicUsize = AtomicUsize::new(0);

        let handle = PreviewHandle::new("preview-1", || {
            RELEASED.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(handle.label(), "preview-1");
        drop(handle);
        assert_eq!(RELEASED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_detached_handle_is_inert() {
        let handle = PreviewHandle::detached("no-resource");
        drop(handle);
    }
}
