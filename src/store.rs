//! # Item Store Module
//!
//! Questo modulo gestisce la collection osservabile degli item di lavoro.
//!
//! ## Responsabilità:
//! - Intake dei file con filtering sulla allow-list del profilo
//! - Assegnazione identità e stamping del formato di output corrente
//! - Update parziali che mantengono status e progress consistenti
//! - Rilascio degli handle transienti alla rimozione o al clear
//! - Viste derivate calcolate on-read (counts, totali, progresso medio)
//! - Notifica sincrona dei subscriber dopo ogni mutazione committata
//!
//! ## Modello di concorrenza:
//! Lo store è l'unico stato condiviso mutabile della pipeline. Gli entry
//! point di mutazione sono sincroni ed eseguono fino al completamento; i
//! listener vengono invocati dopo il rilascio del data lock, prima che la
//! mutazione ritorni al chiamante.
//!
//! I listener sono viste passive: non devono richiamare l'orchestratore in
//! modo sincrono.

use crate::codec::MediaMetadata;
use crate::formats::{self, AppProfile, InputFormat, OutputFormat};
use crate::item::{ItemId, ItemPatch, ItemStatus, WorkItem};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// A file-like input handed to intake
pub struct IntakeFile {
    pub name: String,
    pub mime: Option<String>,
    pub bytes: Vec<u8>,
}

impl IntakeFile {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime: None,
            bytes,
        }
    }

    pub fn with_mime(name: impl Into<String>, mime: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime: Some(mime.into()),
            bytes,
        }
    }
}

/// Outcome of one intake call.
///
/// Rejections are a non-blocking notice, never a hard error.
#[derive(Debug, Default)]
pub struct IntakeReport {
    pub accepted: Vec<ItemId>,
    pub rejected: Vec<String>,
}

/// Mutation notification delivered to subscribers
#[derive(Debug, Clone)]
pub enum StoreEvent {
    Added(Vec<ItemId>),
    Updated(ItemId),
    Removed(ItemId),
    Cleared,
}

/// Item counts by status, computed on read
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub errored: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.errored
    }
}

/// Read-only view of one completed item, for the export boundary
#[derive(Debug, Clone)]
pub struct CompletedItem {
    pub id: ItemId,
    pub name: String,
    pub output_format: OutputFormat,
    pub bytes: Arc<[u8]>,
    pub metadata: MediaMetadata,
}

type Listener = Arc<dyn Fn(&StoreEvent) + Send + Sync>;

/// Observable, in-memory collection of work items.
///
/// One instance per app/session; items keep insertion order.
pub struct ItemStore {
    profile: AppProfile,
    items: Mutex<Vec<WorkItem>>,
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_id: AtomicU64,
    next_subscription: AtomicU64,
}

impl ItemStore {
    pub fn new(profile: AppProfile) -> Self {
        Self {
            profile,
            items: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            next_subscription: AtomicU64::new(1),
        }
    }

    pub fn profile(&self) -> AppProfile {
        self.profile
    }

    /// Intake: validate against the profile allow-list, assign identity,
    /// stamp the output format and probe cheap metadata.
    ///
    /// Returns accepted ids in insertion order; rejected names are reported
    /// (and logged), never surfaced as errors.
    pub fn add(&self, files: Vec<IntakeFile>, output_format: OutputFormat) -> IntakeReport {
        let mut report = IntakeReport::default();
        {
            let mut items = self.lock_items();
            for file in files {
                let format = match InputFormat::detect(&file.name, file.mime.as_deref()) {
                    Some(format) if self.profile.accepts(format) => format,
                    _ => {
                        debug!("Rejected unsupported file at intake: {}", file.name);
                        report.rejected.push(file.name);
                        continue;
                    }
                };

                let metadata = formats::probe_metadata(format, &file.bytes);
                let id = ItemId(self.next_id.fetch_add(1, Ordering::SeqCst));
                items.push(WorkItem::new(
                    id,
                    file.name,
                    file.bytes,
                    format,
                    output_format,
                    metadata,
                ));
                report.accepted.push(id);
            }
        }

        if !report.accepted.is_empty() {
            self.notify(&StoreEvent::Added(report.accepted.clone()));
        }
        report
    }

    /// Merge a patch into an item. No-op (returns false) if the id is absent.
    ///
    /// Status transitions keep the record consistent: completing forces
    /// progress to 100, resetting to pending zeroes progress and clears
    /// error and result. A replaced preview handle is released.
    pub fn update(&self, id: ItemId, patch: ItemPatch) -> bool {
        let mut replaced_preview = None;
        let found = {
            let mut items = self.lock_items();
            match items.iter_mut().find(|item| item.id == id) {
                Some(item) => {
                    if let Some(progress) = patch.progress {
                        item.progress = progress.clamp(0.0, 100.0);
                    }
                    if let Some(error) = patch.error {
                        item.error = Some(error);
                    }
                    if let Some(result) = patch.result {
                        item.result = Some(result);
                    }
                    if let Some(format) = patch.output_format {
                        item.output_format = format;
                    }
                    if let Some(metadata) = patch.metadata {
                        item.metadata = Some(metadata);
                    }
                    if let Some(preview) = patch.preview {
                        replaced_preview = item.preview.replace(preview);
                    }
                    if let Some(status) = patch.status {
                        item.status = status;
                        match status {
                            ItemStatus::Completed => {
                                item.progress = 100.0;
                                item.error = None;
                            }
                            ItemStatus::Pending => {
                                item.progress = 0.0;
                                item.error = None;
                                item.result = None;
                            }
                            ItemStatus::Processing | ItemStatus::Error => {}
                        }
                    }
                    true
                }
                None => false,
            }
        };
        // release hook of a replaced preview runs outside the data lock
        drop(replaced_preview);

        if found {
            self.notify(&StoreEvent::Updated(id));
        }
        found
    }

    /// Progress update that only applies while the item is processing.
    ///
    /// Stale reports against completed, errored or reset items are dropped.
    pub fn set_progress(&self, id: ItemId, progress: f32) -> bool {
        let applied = {
            let mut items = self.lock_items();
            match items.iter_mut().find(|item| item.id == id) {
                Some(item) if item.status == ItemStatus::Processing => {
                    item.progress = progress.clamp(0.0, 100.0);
                    true
                }
                _ => false,
            }
        };
        if applied {
            self.notify(&StoreEvent::Updated(id));
        }
        applied
    }

    /// Remove one item, releasing its transient handles.
    ///
    /// The id never reappears: identity is monotonic.
    pub fn remove(&self, id: ItemId) -> bool {
        let removed = {
            let mut items = self.lock_items();
            match items.iter().position(|item| item.id == id) {
                Some(index) => Some(items.remove(index)),
                None => None,
            }
        };
        match removed {
            Some(item) => {
                drop(item); // releases the preview handle
                self.notify(&StoreEvent::Removed(id));
                true
            }
            None => false,
        }
    }

    /// Drop every item, releasing all transient handles
    pub fn clear(&self) {
        let drained: Vec<WorkItem> = {
            let mut items = self.lock_items();
            items.drain(..).collect()
        };
        let had_items = !drained.is_empty();
        drop(drained);
        if had_items {
            self.notify(&StoreEvent::Cleared);
        }
    }

    /// Rewrite the stamped output format of pending items only.
    ///
    /// Items already processing, completed or errored are never touched.
    pub fn restamp_pending(&self, format: OutputFormat) {
        let restamped: Vec<ItemId> = {
            let mut items = self.lock_items();
            items
                .iter_mut()
                .filter(|item| item.status == ItemStatus::Pending && item.output_format != format)
                .map(|item| {
                    item.output_format = format;
                    item.id
                })
                .collect()
        };
        for id in restamped {
            self.notify(&StoreEvent::Updated(id));
        }
    }

    /// Borrow one item under the data lock
    pub fn with_item<R>(&self, id: ItemId, f: impl FnOnce(&WorkItem) -> R) -> Option<R> {
        let items = self.lock_items();
        items.iter().find(|item| item.id == id).map(f)
    }

    pub fn status(&self, id: ItemId) -> Option<ItemStatus> {
        self.with_item(id, |item| item.status)
    }

    pub fn ids(&self) -> Vec<ItemId> {
        self.lock_items().iter().map(|item| item.id).collect()
    }

    pub fn len(&self) -> usize {
        self.lock_items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_items().is_empty()
    }

    pub fn counts(&self) -> StatusCounts {
        let items = self.lock_items();
        let mut counts = StatusCounts::default();
        for item in items.iter() {
            match item.status {
                ItemStatus::Pending => counts.pending += 1,
                ItemStatus::Processing => counts.processing += 1,
                ItemStatus::Completed => counts.completed += 1,
                ItemStatus::Error => counts.errored += 1,
            }
        }
        counts
    }

    /// Total byte size of all inputs
    pub fn total_input_bytes(&self) -> u64 {
        self.lock_items().iter().map(|item| item.size).sum()
    }

    /// Total byte size of completed results
    pub fn total_output_bytes(&self) -> u64 {
        self.lock_items()
            .iter()
            .filter_map(|item| item.result_size())
            .sum()
    }

    /// Mean progress across all items (0 when empty)
    pub fn mean_progress(&self) -> f32 {
        let items = self.lock_items();
        if items.is_empty() {
            return 0.0;
        }
        items.iter().map(|item| item.progress).sum::<f32>() / items.len() as f32
    }

    /// True when the store is non-empty and every item is terminal
    pub fn all_settled(&self) -> bool {
        let items = self.lock_items();
        !items.is_empty() && items.iter().all(|item| item.status.is_terminal())
    }

    pub fn any_errored(&self) -> bool {
        self.lock_items()
            .iter()
            .any(|item| item.status == ItemStatus::Error)
    }

    /// Completed items in insertion order, for the export boundary
    pub fn completed_items(&self) -> Vec<CompletedItem> {
        self.lock_items()
            .iter()
            .filter(|item| item.status == ItemStatus::Completed)
            .filter_map(|item| {
                item.result.as_ref().map(|result| CompletedItem {
                    id: item.id,
                    name: item.name.clone(),
                    output_format: item.output_format,
                    bytes: result.bytes.clone(),
                    metadata: result.metadata,
                })
            })
            .collect()
    }

    /// Register a listener called synchronously after each committed mutation
    pub fn subscribe(&self, listener: impl Fn(&StoreEvent) + Send + Sync + 'static) -> u64 {
        let id = self.next_subscription.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push((id, Arc::new(listener)));
        }
        id
    }

    pub fn unsubscribe(&self, id: u64) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.retain(|(sub, _)| *sub != id);
        }
    }

    fn lock_items(&self) -> MutexGuard<'_, Vec<WorkItem>> {
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self, event: &StoreEvent) {
        let listeners: Vec<Listener> = match self.listeners.lock() {
            Ok(listeners) => listeners.iter().map(|(_, l)| l.clone()).collect(),
            Err(_) => return,
        };
        for listener in listeners {
            listener(event);
        }
    }
}
