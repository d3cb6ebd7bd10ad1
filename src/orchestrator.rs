//! # Processing Orchestrator Module
//!
//! Questo è il modulo principale che orchestra il processing del batch.
//!
//! ## Responsabilità:
//! - Coda FIFO degli item id con dedup sulla membership
//! - Drain loop: singolo coordinatore cooperativo che dispatcha sul worker pool
//! - Snapshot dei settings catturato atomicamente al momento del pop
//! - Tagging di ogni dispatch con un epoch per scartare callback stale
//! - Cancellazione cooperativa: reset degli item in processing, coda svuotata
//! - Tracking del batch corrente (start, end, item count)
//! - Retry esplicito degli item in errore
//! - Facade `Pipeline`: un'istanza per app/sessione che collega store,
//!   settings, pool e orchestratore (niente singleton di processo)
//!
//! ## State machine per item:
//! - `pending -> processing -> completed`
//! - `pending -> processing -> error`
//! - `processing -> pending` (reset su cancellazione)
//!
//! Nessuna transizione salta `processing`; `completed` ed `error` sono
//! terminali finché un reset esplicito non li riporta a `pending`.
//!
//! ## Gestione concorrenza:
//! Il drain loop acquisisce l'admission PRIMA di poppare l'id successivo:
//! così lo snapshot dei settings coincide con il momento reale del dispatch,
//! e il numero di item `processing` non supera mai il bound del pool. Le
//! mutazioni dello store partite dall'orchestratore avvengono sotto il lock
//! di stato, così il check dell'epoch e la scrittura sono atomici rispetto a
//! `cancel()`. Ordine dei lock: stato → store/settings, mai l'inverso.
//!
//! ## Error handling:
//! - Il fallimento di un item non blocca il batch (drain continua)
//! - Un fallimento di warm-up del pool è fatale per il batch corrente:
//!   la coda viene svuotata, gli item restano `pending`, re-enqueue riprova

use crate::codec::{CancelFlag, CodecOutput, CodecRegistry, CodecRequest, Operation};
use crate::error::PipelineError;
use crate::formats::AppProfile;
use crate::item::{ItemId, ItemPatch, ItemStatus};
use crate::pool::WorkerPool;
use crate::settings::{Settings, SettingsBackend, SettingsStore};
use crate::store::{IntakeFile, IntakeReport, ItemStore};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info};

/// Ephemeral record of the active or most recent batch
#[derive(Debug, Clone)]
pub struct BatchRun {
    pub started_at: Instant,
    pub finished_at: Option<Instant>,
    /// Number of items enqueued into this batch
    pub items: usize,
}

impl BatchRun {
    fn start(items: usize) -> Self {
        Self {
            started_at: Instant::now(),
            finished_at: None,
            items,
        }
    }

    pub fn duration(&self) -> Option<Duration> {
        self.finished_at.map(|end| end - self.started_at)
    }
}

struct QueueState {
    queue: VecDeque<ItemId>,
    /// Ids currently sitting in the queue
    queued: HashSet<ItemId>,
    /// Ids popped and not yet settled
    in_flight: HashSet<ItemId>,
    /// Bumped on every batch start and on cancel; stale callbacks are dropped
    epoch: u64,
    active: bool,
    batch: Option<BatchRun>,
    /// Cooperative abort flag handed to every execution of the batch
    cancel: CancelFlag,
    /// Last pool warm-up failure, surfaced once per batch
    init_error: Option<String>,
}

impl QueueState {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            queued: HashSet::new(),
            in_flight: HashSet::new(),
            epoch: 0,
            active: false,
            batch: None,
            cancel: CancelFlag::new(),
            init_error: None,
        }
    }
}

/// The scheduler tying items to worker executions.
///
/// One instance per app/session; cheap to clone (all state is shared).
///
/// Store listeners are passive views: calling back into the orchestrator
/// from a listener is not supported.
#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<ItemStore>,
    settings: Arc<SettingsStore>,
    pool: Arc<WorkerPool>,
    operation: Operation,
    state: Arc<Mutex<QueueState>>,
    /// Wakes the drain loop when work completes or arrives
    wake: Arc<Notify>,
    /// Mirrors the active flag for `wait_idle`
    active_tx: Arc<watch::Sender<bool>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<ItemStore>,
        settings: Arc<SettingsStore>,
        pool: Arc<WorkerPool>,
        operation: Operation,
    ) -> Self {
        let (active_tx, _) = watch::channel(false);
        Self {
            store,
            settings,
            pool,
            operation,
            state: Arc::new(Mutex::new(QueueState::new())),
            wake: Arc::new(Notify::new()),
            active_tx: Arc::new(active_tx),
        }
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// Append ids to the FIFO; starting from idle opens a new batch.
    ///
    /// Ids already queued or in flight are ignored, so an item can be in the
    /// dispatch queue at most once. Terminal items are skipped at pop time
    /// (idempotent re-enqueue).
    pub fn enqueue(&self, ids: &[ItemId]) {
        let drain_epoch = {
            let mut st = self.lock_state();
            let mut added = 0usize;
            for id in ids {
                if st.queued.contains(id) || st.in_flight.contains(id) {
                    continue;
                }
                st.queue.push_back(*id);
                st.queued.insert(*id);
                added += 1;
            }

            if !st.active && !st.queue.is_empty() {
                st.active = true;
                st.epoch = st.epoch.wrapping_add(1);
                st.cancel = CancelFlag::new();
                st.init_error = None;
                st.batch = Some(BatchRun::start(st.queue.len()));
                self.active_tx.send_replace(true);
                info!("Starting batch of {} item(s)", st.queue.len());
                Some(st.epoch)
            } else {
                if st.active && added > 0 {
                    if let Some(batch) = st.batch.as_mut() {
                        batch.items += added;
                    }
                }
                None
            }
        };

        match drain_epoch {
            Some(epoch) => {
                let orchestrator = self.clone();
                tokio::spawn(async move { orchestrator.drain(epoch).await });
            }
            None => self.wake.notify_one(),
        }
    }

    /// Signal a cooperative abort.
    ///
    /// Clears the FIFO, resets every in-flight item to `pending` with
    /// progress 0, flags running executions, and returns to idle. Stale
    /// results from executions that could not be interrupted are discarded
    /// by the epoch check and can never resurrect a reset item.
    pub fn cancel(&self) {
        let reset = {
            let mut st = self.lock_state();
            if !st.active && st.queue.is_empty() && st.in_flight.is_empty() {
                return;
            }
            st.epoch = st.epoch.wrapping_add(1);
            st.cancel.cancel();
            st.queue.clear();
            st.queued.clear();
            let ids: Vec<ItemId> = st.in_flight.drain().collect();
            if let Some(batch) = st.batch.as_mut() {
                batch.finished_at = Some(Instant::now());
            }
            st.active = false;
            self.active_tx.send_replace(false);
            // reset while still holding the state lock so no stale
            // completion can interleave with the epoch bump
            for id in &ids {
                self.store.update(*id, ItemPatch::status(ItemStatus::Pending));
            }
            ids.len()
        };
        info!("Batch cancelled; {} in-flight item(s) reset to pending", reset);
    }

    /// Explicit reset of errored items back to `pending`, then enqueue.
    ///
    /// The user-facing retry: terminal states never re-dispatch without it.
    pub fn retry(&self, ids: &[ItemId]) {
        let mut to_enqueue = Vec::new();
        for id in ids {
            match self.store.status(*id) {
                Some(ItemStatus::Error) => {
                    self.store.update(*id, ItemPatch::status(ItemStatus::Pending));
                    to_enqueue.push(*id);
                }
                Some(ItemStatus::Pending) => to_enqueue.push(*id),
                _ => {}
            }
        }
        if !to_enqueue.is_empty() {
            self.enqueue(&to_enqueue);
        }
    }

    pub fn is_active(&self) -> bool {
        *self.active_tx.borrow()
    }

    /// The active or most recent batch record
    pub fn last_batch(&self) -> Option<BatchRun> {
        self.lock_state().batch.clone()
    }

    /// Pool warm-up failure of the current/last batch, if any
    pub fn last_init_error(&self) -> Option<String> {
        self.lock_state().init_error.clone()
    }

    /// Resolve once the orchestrator is idle (no batch draining)
    pub async fn wait_idle(&self) {
        let mut rx = self.active_tx.subscribe();
        loop {
            if !*rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// The single cooperative coordinator for one batch epoch.
    ///
    /// Admission is acquired BEFORE the pop: the settings snapshot then
    /// coincides with the true dispatch moment, and at most `pool.size()`
    /// items are ever `processing`.
    async fn drain(self, epoch: u64) {
        enum Phase {
            NeedSlot,
            Wait,
            Done,
        }

        loop {
            let phase = {
                let mut st = self.lock_state();
                if st.epoch != epoch {
                    return;
                }
                if !st.queue.is_empty() {
                    Phase::NeedSlot
                } else if st.in_flight.is_empty() {
                    if let Some(batch) = st.batch.as_mut() {
                        batch.finished_at = Some(Instant::now());
                    }
                    st.active = false;
                    self.active_tx.send_replace(false);
                    Phase::Done
                } else {
                    Phase::Wait
                }
            };

            match phase {
                Phase::Done => {
                    let counts = self.store.counts();
                    info!(
                        "Batch complete: {} completed, {} errored",
                        counts.completed, counts.errored
                    );
                    return;
                }
                Phase::Wait => {
                    self.wake.notified().await;
                    continue;
                }
                Phase::NeedSlot => {}
            }

            let slot = match self.pool.admit().await {
                Ok(slot) => slot,
                Err(e) => {
                    self.abort_batch(epoch, &e);
                    continue;
                }
            };

            // pop + settings snapshot in one critical section: a settings
            // change landing after this point only affects later pops
            let job = {
                let mut st = self.lock_state();
                if st.epoch != epoch {
                    return; // cancelled while awaiting admission; slot drops here
                }
                let mut next = None;
                while let Some(id) = st.queue.pop_front() {
                    st.queued.remove(&id);
                    match self.store.status(id) {
                        Some(status) if !status.is_terminal() => {
                            next = Some(id);
                            break;
                        }
                        Some(_) => debug!("Skipping {}: already settled", id),
                        None => debug!("Skipping {}: no longer in store", id),
                    }
                }
                next.map(|id| {
                    st.in_flight.insert(id);
                    (id, self.settings.get(), st.cancel.clone())
                })
            };

            let Some((id, snapshot, cancel)) = job else {
                drop(slot);
                continue;
            };

            let bytes = self.store.with_item(id, |item| item.bytes.clone());
            let Some(bytes) = bytes else {
                // removed between pop and dispatch
                let mut st = self.lock_state();
                if st.epoch == epoch {
                    st.in_flight.remove(&id);
                }
                continue;
            };

            {
                let st = self.lock_state();
                if st.epoch != epoch {
                    return;
                }
                self.store.update(
                    id,
                    ItemPatch {
                        status: Some(ItemStatus::Processing),
                        progress: Some(0.0),
                        ..ItemPatch::default()
                    },
                );
                drop(st);
            }
            debug!("Dispatching {} ({})", id, self.operation.label());

            let request = CodecRequest {
                bytes,
                operation: self.operation,
                settings: snapshot,
            };
            let on_progress = {
                let orchestrator = self.clone();
                move |pct: f32| orchestrator.apply_progress(id, epoch, pct)
            };

            match self.pool.execute_on(slot, request, on_progress, cancel) {
                Ok(handle) => {
                    let orchestrator = self.clone();
                    tokio::spawn(async move {
                        let result = handle.join().await;
                        orchestrator.finish_item(id, epoch, result);
                    });
                }
                // e.g. no codec registered: the item fails, the batch goes on
                Err(e) => self.finish_item(id, epoch, Err(e)),
            }
        }
    }

    /// Map a pool progress callback into the item's progress field.
    ///
    /// Discards anything from a stale epoch; the store additionally drops
    /// reports against items that are no longer `processing`.
    fn apply_progress(&self, id: ItemId, epoch: u64, pct: f32) {
        let st = self.lock_state();
        if st.epoch != epoch {
            return;
        }
        self.store.set_progress(id, pct);
    }

    /// Settle one dispatched item with its execution result
    fn finish_item(&self, id: ItemId, epoch: u64, result: Result<CodecOutput, PipelineError>) {
        {
            let mut st = self.lock_state();
            if st.epoch != epoch {
                debug!("Discarding stale result for {}", id);
                return;
            }
            st.in_flight.remove(&id);
            match result {
                Ok(output) => {
                    self.store.update(id, ItemPatch::completed(output));
                    debug!("Item {} completed", id);
                }
                Err(e) => {
                    self.store.update(id, ItemPatch::errored(e.to_string()));
                    error!("Item {} failed: {}", id, e);
                }
            }
        }
        self.wake.notify_one();
    }

    /// Pool warm-up failure: fatal to the current batch, queued items stay
    /// `pending` so a re-enqueue retries.
    fn abort_batch(&self, epoch: u64, reason: &PipelineError) {
        let cleared = {
            let mut st = self.lock_state();
            if st.epoch != epoch {
                return;
            }
            st.init_error = Some(reason.to_string());
            let cleared = st.queue.len();
            st.queue.clear();
            st.queued.clear();
            cleared
        };
        error!(
            "Batch aborted ({} queued item(s) left pending): {}",
            cleared, reason
        );
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One app/session instance wiring store, settings, pool and orchestrator.
///
/// Owns the subscription that propagates output-format changes to still
/// pending items.
pub struct Pipeline {
    profile: AppProfile,
    store: Arc<ItemStore>,
    settings: Arc<SettingsStore>,
    pool: Arc<WorkerPool>,
    orchestrator: Orchestrator,
    settings_subscription: u64,
}

impl Pipeline {
    pub fn new(
        profile: AppProfile,
        registry: Arc<CodecRegistry>,
        backend: Arc<dyn SettingsBackend>,
    ) -> Self {
        let settings = Arc::new(SettingsStore::open(profile, backend));
        let store = Arc::new(ItemStore::new(profile));
        let pool = Arc::new(WorkerPool::new(registry, settings.get().workers));
        let orchestrator = Orchestrator::new(
            store.clone(),
            settings.clone(),
            pool.clone(),
            Operation::for_profile(profile),
        );

        // a format change only ever touches still-pending items
        let restamp_store = store.clone();
        let settings_subscription =
            settings.subscribe(move |updated: &Settings| restamp_store.restamp_pending(updated.format));

        Self {
            profile,
            store,
            settings,
            pool,
            orchestrator,
            settings_subscription,
        }
    }

    pub fn profile(&self) -> AppProfile {
        self.profile
    }

    /// Intake: new items are stamped with the current output format
    pub fn add_files(&self, files: Vec<IntakeFile>) -> IntakeReport {
        self.store.add(files, self.settings.get().format)
    }

    pub fn process(&self, ids: &[ItemId]) {
        self.orchestrator.enqueue(ids);
    }

    /// Enqueue every item currently in the store
    pub fn process_all(&self) {
        self.orchestrator.enqueue(&self.store.ids());
    }

    pub fn cancel(&self) {
        self.orchestrator.cancel();
    }

    pub fn retry(&self, ids: &[ItemId]) {
        self.orchestrator.retry(ids);
    }

    pub fn store(&self) -> &Arc<ItemStore> {
        &self.store
    }

    pub fn settings(&self) -> &Arc<SettingsStore> {
        &self.settings
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub async fn wait_idle(&self) {
        self.orchestrator.wait_idle().await;
    }

    /// Drain the pool; queued work is rejected, in-flight work completes
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.settings.unsubscribe(self.settings_subscription);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{FnCodec, MediaMetadata, ProgressSink};
    use crate::error::CodecError;
    use crate::formats::OutputFormat;
    use crate::settings::{MemoryBackend, SettingsPatch};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    fn fixture(
        registry: CodecRegistry,
        workers: usize,
    ) -> (Arc<ItemStore>, Arc<SettingsStore>, Orchestrator) {
        let store = Arc::new(ItemStore::new(AppProfile::Image));
        let settings = Arc::new(SettingsStore::open(
            AppProfile::Image,
            Arc::new(MemoryBackend::new()),
        ));
        let pool = Arc::new(WorkerPool::new(Arc::new(registry), workers));
        let orchestrator = Orchestrator::new(
            store.clone(),
            settings.clone(),
            pool,
            Operation::CompressImage,
        );
        (store, settings, orchestrator)
    }

    fn add_items(store: &ItemStore, count: u8) -> Vec<ItemId> {
        let files = (1..=count)
            .map(|i| IntakeFile::new(format!("file{}.jpg", i), vec![i]))
            .collect();
        store.add(files, OutputFormat::WebP).accepted
    }

    fn echo_output(request: &CodecRequest) -> CodecOutput {
        CodecOutput {
            bytes: request.bytes.clone(),
            metadata: MediaMetadata::default(),
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met within timeout");
    }

    #[tokio::test]
    async fn test_error_isolation_three_items_middle_fails() {
        let mut registry = CodecRegistry::new();
        registry.register(
            Operation::CompressImage,
            Arc::new(FnCodec::new("flaky", |request: CodecRequest, progress: ProgressSink, _cancel: CancelFlag| {
                async move {
                    if request.bytes[0] == 2 {
                        return Err(CodecError::new("simulated codec failure"));
                    }
                    progress.report(100.0);
                    Ok(echo_output(&request))
                }
            })),
        );
        let (store, _settings, orchestrator) = fixture(registry, 2);
        let ids = add_items(&store, 3);

        orchestrator.enqueue(&ids);
        orchestrator.wait_idle().await;

        assert_eq!(store.status(ids[0]), Some(ItemStatus::Completed));
        assert_eq!(store.status(ids[1]), Some(ItemStatus::Error));
        assert_eq!(store.status(ids[2]), Some(ItemStatus::Completed));
        let message = store.with_item(ids[1], |item| item.error.clone()).flatten();
        assert!(!message.unwrap_or_default().is_empty());

        let batch = orchestrator.last_batch().unwrap();
        assert_eq!(batch.items, 3);
        assert!(batch.finished_at.is_some());
        assert!(batch.duration().is_some());
    }

    #[tokio::test]
    async fn test_concurrency_bound_never_exceeded() {
        let mut registry = CodecRegistry::new();
        registry.register(
            Operation::CompressImage,
            Arc::new(FnCodec::new("slow", |request: CodecRequest, _progress: ProgressSink, _cancel: CancelFlag| async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(echo_output(&request))
            })),
        );
        let (store, _settings, orchestrator) = fixture(registry, 2);
        let ids = add_items(&store, 5);

        let max_processing = Arc::new(AtomicUsize::new(0));
        let observer_store = store.clone();
        let observer_max = max_processing.clone();
        store.subscribe(move |_| {
            let processing = observer_store.counts().processing;
            observer_max.fetch_max(processing, Ordering::SeqCst);
        });

        orchestrator.enqueue(&ids);
        orchestrator.wait_idle().await;

        assert!(max_processing.load(Ordering::SeqCst) <= 2);
        assert!(store.all_settled());
        assert_eq!(store.counts().completed, 5);
    }

    #[tokio::test]
    async fn test_items_dispatch_in_enqueue_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let codec_order = order.clone();
        let mut registry = CodecRegistry::new();
        registry.register(
            Operation::CompressImage,
            Arc::new(FnCodec::new("recorder", move |request: CodecRequest, _progress: ProgressSink, _cancel: CancelFlag| {
                let order = codec_order.clone();
                async move {
                    order.lock().unwrap().push(request.bytes[0]);
                    Ok(echo_output(&request))
                }
            })),
        );
        let (store, _settings, orchestrator) = fixture(registry, 1);
        let ids = add_items(&store, 4);

        orchestrator.enqueue(&ids);
        orchestrator.wait_idle().await;

        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_cancel_resets_items_and_discards_stale_results() {
        let gate = Arc::new(Semaphore::new(0));
        let codec_gate = gate.clone();
        let mut registry = CodecRegistry::new();
        registry.register(
            Operation::CompressImage,
            Arc::new(FnCodec::new("gated", move |request: CodecRequest, _progress: ProgressSink, _cancel: CancelFlag| {
                let gate = codec_gate.clone();
                async move {
                    let permit = gate.acquire_owned().await;
                    permit
                        .map_err(|_| CodecError::new("gate closed"))?
                        .forget();
                    Ok(echo_output(&request))
                }
            })),
        );
        let (store, _settings, orchestrator) = fixture(registry, 1);
        let ids = add_items(&store, 2);

        orchestrator.enqueue(&ids);
        let counting_store = store.clone();
        wait_until(move || counting_store.counts().processing == 1).await;

        orchestrator.cancel();
        assert!(!orchestrator.is_active());
        for id in &ids {
            assert_eq!(store.status(*id), Some(ItemStatus::Pending));
            assert_eq!(store.with_item(*id, |item| item.progress), Some(0.0));
        }

        // release the in-flight execution: its result must be discarded
        gate.add_permits(4);
        tokio::time::sleep(Duration::from_millis(50)).await;
        for id in &ids {
            assert_eq!(store.status(*id), Some(ItemStatus::Pending));
            assert_eq!(store.with_item(*id, |item| item.progress), Some(0.0));
        }

        // a fresh enqueue starts a clean batch that completes normally
        orchestrator.enqueue(&ids);
        orchestrator.wait_idle().await;
        assert_eq!(store.counts().completed, 2);
    }

    #[tokio::test]
    async fn test_reenqueue_of_completed_item_is_noop() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let codec_invocations = invocations.clone();
        let mut registry = CodecRegistry::new();
        registry.register(
            Operation::CompressImage,
            Arc::new(FnCodec::new("counting", move |request: CodecRequest, _progress: ProgressSink, _cancel: CancelFlag| {
                let invocations = codec_invocations.clone();
                async move {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    Ok(echo_output(&request))
                }
            })),
        );
        let (store, _settings, orchestrator) = fixture(registry, 1);
        let ids = add_items(&store, 1);

        orchestrator.enqueue(&ids);
        orchestrator.wait_idle().await;
        assert_eq!(store.status(ids[0]), Some(ItemStatus::Completed));

        orchestrator.enqueue(&ids);
        orchestrator.wait_idle().await;

        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert_eq!(store.status(ids[0]), Some(ItemStatus::Completed));
        assert_eq!(store.with_item(ids[0], |item| item.progress), Some(100.0));
    }

    #[tokio::test]
    async fn test_settings_snapshot_taken_at_pop() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let gate = Arc::new(Semaphore::new(0));
        let codec_seen = seen.clone();
        let codec_gate = gate.clone();
        let mut registry = CodecRegistry::new();
        registry.register(
            Operation::CompressImage,
            Arc::new(FnCodec::new("observer", move |request: CodecRequest, _progress: ProgressSink, _cancel: CancelFlag| {
                let seen = codec_seen.clone();
                let gate = codec_gate.clone();
                async move {
                    seen.lock()
                        .unwrap()
                        .push((request.bytes[0], request.settings.quality));
                    if request.bytes[0] == 1 {
                        let permit = gate.acquire_owned().await;
                        permit
                            .map_err(|_| CodecError::new("gate closed"))?
                            .forget();
                    }
                    Ok(echo_output(&request))
                }
            })),
        );
        let (store, settings, orchestrator) = fixture(registry, 1);
        let ids = add_items(&store, 2);

        orchestrator.enqueue(&ids);
        let counting_store = store.clone();
        wait_until(move || counting_store.counts().processing == 1).await;

        // item 1 already dispatched, item 2 still queued
        settings
            .update(SettingsPatch {
                quality: Some(55),
                ..Default::default()
            })
            .unwrap();
        gate.add_permits(1);
        orchestrator.wait_idle().await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], (1, 80));
        assert_eq!(seen[1], (2, 55));
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_and_ends_at_100() {
        let mut registry = CodecRegistry::new();
        registry.register(
            Operation::CompressImage,
            Arc::new(FnCodec::new("stepper", |request: CodecRequest, progress: ProgressSink, _cancel: CancelFlag| {
                async move {
                    for pct in [10.0, 30.0, 30.0, 60.0, 95.0] {
                        progress.report(pct);
                    }
                    Ok(echo_output(&request))
                }
            })),
        );
        let (store, _settings, orchestrator) = fixture(registry, 1);
        let ids = add_items(&store, 1);
        let id = ids[0];

        let observed = Arc::new(Mutex::new(Vec::new()));
        let observer_store = store.clone();
        let observer_seen = observed.clone();
        store.subscribe(move |_| {
            if let Some(progress) = observer_store.with_item(id, |item| item.progress) {
                observer_seen.lock().unwrap().push(progress);
            }
        });

        orchestrator.enqueue(&ids);
        orchestrator.wait_idle().await;

        let observed = observed.lock().unwrap();
        assert!(observed.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(observed.last().copied(), Some(100.0));
    }

    #[tokio::test]
    async fn test_pool_init_failure_is_fatal_but_retryable() {
        use futures::future::BoxFuture;

        struct FlakyWarmup {
            attempts: Arc<AtomicUsize>,
        }

        impl crate::codec::CodecService for FlakyWarmup {
            fn name(&self) -> &str {
                "flaky-warmup"
            }

            fn warm_up(&self) -> BoxFuture<'static, Result<(), CodecError>> {
                let attempts = self.attempts.clone();
                Box::pin(async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(CodecError::new("module load failed"))
                    } else {
                        Ok(())
                    }
                })
            }

            fn execute(
                &self,
                request: CodecRequest,
                _progress: ProgressSink,
                _cancel: CancelFlag,
            ) -> BoxFuture<'static, Result<CodecOutput, CodecError>> {
                Box::pin(async move { Ok(echo_output(&request)) })
            }
        }

        let attempts = Arc::new(AtomicUsize::new(0));
        let mut registry = CodecRegistry::new();
        registry.register(
            Operation::CompressImage,
            Arc::new(FlakyWarmup {
                attempts: attempts.clone(),
            }),
        );
        let (store, _settings, orchestrator) = fixture(registry, 1);
        let ids = add_items(&store, 2);

        orchestrator.enqueue(&ids);
        orchestrator.wait_idle().await;

        // fatal to the batch: nothing dispatched, items left pending
        assert!(orchestrator.last_init_error().is_some());
        assert_eq!(store.counts().pending, 2);

        // re-enqueueing retries the warm-up and drains normally
        orchestrator.enqueue(&ids);
        orchestrator.wait_idle().await;
        assert_eq!(store.counts().completed, 2);
        assert!(orchestrator.last_init_error().is_none());
    }

    #[tokio::test]
    async fn test_retry_resets_errored_items_only() {
        let should_fail = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let codec_should_fail = should_fail.clone();
        let mut registry = CodecRegistry::new();
        registry.register(
            Operation::CompressImage,
            Arc::new(FnCodec::new("recoverable", move |request: CodecRequest, _progress: ProgressSink, _cancel: CancelFlag| {
                let should_fail = codec_should_fail.clone();
                async move {
                    if should_fail.load(Ordering::SeqCst) {
                        Err(CodecError::new("transient failure"))
                    } else {
                        Ok(echo_output(&request))
                    }
                }
            })),
        );
        let (store, _settings, orchestrator) = fixture(registry, 1);
        let ids = add_items(&store, 1);

        orchestrator.enqueue(&ids);
        orchestrator.wait_idle().await;
        assert_eq!(store.status(ids[0]), Some(ItemStatus::Error));

        should_fail.store(false, Ordering::SeqCst);
        orchestrator.retry(&ids);
        orchestrator.wait_idle().await;

        assert_eq!(store.status(ids[0]), Some(ItemStatus::Completed));
        // retrying a completed item is a no-op
        orchestrator.retry(&ids);
        orchestrator.wait_idle().await;
        assert_eq!(store.status(ids[0]), Some(ItemStatus::Completed));
    }

    #[tokio::test]
    async fn test_pipeline_facade_wires_settings_propagation() {
        let mut registry = CodecRegistry::new();
        registry.register(
            Operation::CompressImage,
            Arc::new(FnCodec::new("echo", |request: CodecRequest, _progress: ProgressSink, _cancel: CancelFlag| async move {
                Ok(echo_output(&request))
            })),
        );
        let pipeline = Pipeline::new(
            AppProfile::Image,
            Arc::new(registry),
            Arc::new(MemoryBackend::new()),
        );

        let report = pipeline.add_files(vec![
            IntakeFile::new("a.jpg", vec![1]),
            IntakeFile::new("clip.mp4", vec![2]),
        ]);
        assert_eq!(report.accepted.len(), 1);
        assert_eq!(report.rejected, vec!["clip.mp4"]);

        // stamped from current settings
        let id = report.accepted[0];
        assert_eq!(
            pipeline.store().with_item(id, |item| item.output_format),
            Some(OutputFormat::WebP)
        );

        // format change propagates to the still-pending item
        pipeline
            .settings()
            .update(SettingsPatch {
                format: Some(OutputFormat::Png),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(
            pipeline.store().with_item(id, |item| item.output_format),
            Some(OutputFormat::Png)
        );

        pipeline.process_all();
        pipeline.wait_idle().await;
        assert_eq!(pipeline.store().counts().completed, 1);
        pipeline.shutdown().await;
    }
}
