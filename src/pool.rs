//! # Worker Pool Module
//!
//! Questo modulo fornisce gli execution context isolati per le invocazioni codec.
//!
//! ## Responsabilità:
//! - Warm-up lazy e idempotente dei codec registrati (chiamate concorrenti
//!   attendono la stessa inizializzazione in-flight)
//! - Admission FIFO con bound di concorrenza fisso o hardware-derived
//! - Esecuzione di ogni invocazione su un task isolato, fuori dal path del
//!   coordinatore
//! - Shutdown esplicito: rifiuta il lavoro in coda e attende il drain delle
//!   esecuzioni in-flight (niente viene droppato silenziosamente)
//!
//! ## Gestione concorrenza:
//! Un `Semaphore` fair limita i worker concorrenti; il permit viene mosso
//! dentro il task di esecuzione e rilasciato alla risoluzione.

use crate::codec::{CancelFlag, CodecOutput, CodecRegistry, CodecRequest, ProgressSink};
use crate::error::PipelineError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, OnceCell, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

/// One admitted execution slot.
///
/// Holding a slot reserves a worker context; dropping it un-admitted
/// releases the reservation.
pub struct WorkerSlot {
    permit: OwnedSemaphorePermit,
}

/// Handle to one in-flight codec execution
pub struct ExecutionHandle {
    task: tokio::task::JoinHandle<Result<CodecOutput, crate::error::CodecError>>,
}

impl ExecutionHandle {
    /// Await the execution's resolution
    pub async fn join(self) -> Result<CodecOutput, PipelineError> {
        match self.task.await {
            Ok(result) => result.map_err(PipelineError::from),
            Err(e) => Err(PipelineError::Codec(format!("worker task failed: {}", e))),
        }
    }
}

/// Bounded pool of isolated execution contexts for codec work
pub struct WorkerPool {
    registry: Arc<CodecRegistry>,
    semaphore: Arc<Semaphore>,
    size: usize,
    warm_up: OnceCell<()>,
    active: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl WorkerPool {
    /// Create a pool with the given concurrency bound (0 = hardware-derived)
    pub fn new(registry: Arc<CodecRegistry>, workers: usize) -> Self {
        let size = if workers == 0 {
            Self::default_workers()
        } else {
            workers
        };
        Self {
            registry,
            semaphore: Arc::new(Semaphore::new(size)),
            size,
            warm_up: OnceCell::new(),
            active: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        }
    }

    /// Hardware-derived concurrency bound, clamped to keep memory sane
    pub fn default_workers() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get().min(8))
            .unwrap_or(4)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Executions currently running
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Lazy one-time warm-up of every registered codec service.
    ///
    /// Concurrent callers await the same in-flight initialization. A failed
    /// warm-up leaves the pool uninitialized, so a later call retries.
    pub async fn initialize(&self) -> Result<(), PipelineError> {
        let registry = self.registry.clone();
        self.warm_up
            .get_or_try_init(|| async move {
                debug!("Warming up codec services");
                registry
                    .warm_up_all()
                    .await
                    .map_err(|e| PipelineError::PoolInit(e.to_string()))
            })
            .await
            .map(|_| ())
    }

    /// Await a free execution context. FIFO when saturated.
    pub async fn admit(&self) -> Result<WorkerSlot, PipelineError> {
        self.initialize().await?;
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PipelineError::PoolShutdown)?;
        Ok(WorkerSlot { permit })
    }

    /// Run one codec invocation on the admitted slot.
    ///
    /// The execution runs on its own task; the returned handle resolves with
    /// the codec's result. Progress callbacks go through a monotonic sink.
    pub fn execute_on(
        &self,
        slot: WorkerSlot,
        request: CodecRequest,
        on_progress: impl Fn(f32) + Send + Sync + 'static,
        cancel: CancelFlag,
    ) -> Result<ExecutionHandle, PipelineError> {
        let service = self.registry.get(request.operation).ok_or_else(|| {
            PipelineError::Codec(format!(
                "no codec registered for operation {}",
                request.operation.label()
            ))
        })?;

        let sink = ProgressSink::new(on_progress);
        let active = self.active.clone();
        let idle = self.idle.clone();
        active.fetch_add(1, Ordering::SeqCst);

        let task = tokio::spawn(async move {
            let _permit = slot.permit; // keep the context reserved until resolution
            let result = service.execute(request, sink, cancel).await;
            active.fetch_sub(1, Ordering::SeqCst);
            idle.notify_waiters();
            result
        });

        Ok(ExecutionHandle { task })
    }

    /// Admit, execute and await one invocation
    pub async fn execute(
        &self,
        request: CodecRequest,
        on_progress: impl Fn(f32) + Send + Sync + 'static,
        cancel: CancelFlag,
    ) -> Result<CodecOutput, PipelineError> {
        let slot = self.admit().await?;
        self.execute_on(slot, request, on_progress, cancel)?
            .join()
            .await
    }

    /// Close admission and drain in-flight executions.
    ///
    /// Queued `admit` calls fail with `PoolShutdown`; running executions are
    /// awaited, never dropped.
    pub async fn shutdown(&self) {
        self.semaphore.close();
        loop {
            let notified = self.idle.notified();
            if self.active.load(Ordering::SeqCst) == 0 {
                break;
            }
            notified.await;
        }
        info!("Worker pool drained and shut down");
    }
}
