//! # Media Batch Pipeline Library
//!
//! Questo è il modulo principale della libreria che espone tutte le API pubbliche.
//!
//! ## Responsabilità:
//! - Definisce la struttura modulare della pipeline
//! - Espone i tipi e le funzioni principali tramite re-exports
//! - Fornisce un'interfaccia pulita per il binario e per gli embedder
//!
//! ## Architettura dei moduli:
//! - `formats`: Formati supportati, profili per tool e probing metadata
//! - `error`: Tipi di errore custom per le diverse operazioni
//! - `item`: Record per-file, state machine e handle transienti
//! - `store`: Collection osservabile degli item con viste derivate
//! - `settings`: Configurazione per-app versionata e persistita
//! - `codec`: Boundary verso i codec esterni e registry delle operazioni
//! - `pool`: Worker pool bounded per le esecuzioni isolate
//! - `orchestrator`: Scheduler del batch e facade `Pipeline`
//! - `export`: Vista di export sugli item completati
//! - `progress`: Progress bar come subscriber dello store
//! - `json_output`: Mirror JSON degli eventi per host di embedding
//!
//! ## Utilizzo:
//! ```rust,ignore
//! use media_batch_pipeline::{AppProfile, CodecRegistry, Pipeline};
//!
//! let pipeline = Pipeline::new(AppProfile::Image, registry, backend);
//! let report = pipeline.add_files(files);
//! pipeline.process(&report.accepted);
//! pipeline.wait_idle().await;
//! ```

pub mod codec;
pub mod error;
pub mod export;
pub mod formats;
pub mod item;
pub mod json_output;
pub mod orchestrator;
pub mod pool;
pub mod progress;
pub mod settings;
pub mod store;

pub use codec::{
    CancelFlag, CodecOutput, CodecRegistry, CodecRequest, CodecService, FnCodec, ImageTranscoder,
    MediaMetadata, Operation, PassthroughCodec, ProgressSink,
};
pub use error::{CodecError, PipelineError};
pub use export::{completed_exports, ExportEntry};
pub use formats::{AppProfile, InputFormat, OutputFormat};
pub use item::{ItemId, ItemPatch, ItemStatus, PreviewHandle, WorkItem};
pub use orchestrator::{BatchRun, Orchestrator, Pipeline};
pub use pool::WorkerPool;
pub use settings::{
    FileBackend, MemoryBackend, ResizeMode, ResizeSpec, Settings, SettingsBackend, SettingsPatch,
    SettingsStore,
};
pub use store::{IntakeFile, IntakeReport, ItemStore, StatusCounts, StoreEvent};
