//! # Error Types Module
//!
//! Questo modulo definisce tutti i tipi di errore custom della pipeline.
//!
//! ## Responsabilità:
//! - Definisce `PipelineError` enum per categorizzare tutti gli errori possibili
//! - Definisce `CodecError` per il boundary verso i codec esterni
//! - Integra con `thiserror` per automatic error conversion
//!
//! ## Categorie di errori:
//! - `Io`: Errori di I/O (file non trovati, permessi, etc.)
//! - `Codec`: Fallimento di un codec su un singolo item (non blocca il batch)
//! - `PoolInit`: Warm-up del worker pool fallito (fatale per il batch corrente)
//! - `PoolShutdown`: Pool chiuso, lavoro in coda rifiutato esplicitamente
//! - `UnsupportedFormat`: Formato file fuori dalla allow-list di intake
//! - `Persistence`: Salvataggio settings fallito (degradato a warning)
//! - `InvalidSettings`: Errori di validazione settings
//!
//! ## Esempio:
//! ```rust,ignore
//! if !profile.accepts(format) {
//!     return Err(PipelineError::UnsupportedFormat(name.to_string()));
//! }
//! ```

/// Custom error types for the batch pipeline
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Worker pool initialization failed: {0}")]
    PoolInit(String),

    #[error("Worker pool is shut down")]
    PoolShutdown,

    #[error("Unsupported file format: {0}")]
    UnsupportedFormat(String),

    #[error("Settings persistence error: {0}")]
    Persistence(String),

    #[error("Settings validation error: {0}")]
    InvalidSettings(String),
}

/// Error returned by a codec service across the service boundary.
///
/// Opaque on purpose: the pipeline only needs a human-readable message to
/// attach to the failed item.
#[derive(thiserror::Error, Debug, Clone)]
#[error("{0}")]
pub struct CodecError(pub String);

impl CodecError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<CodecError> for PipelineError {
    fn from(err: CodecError) -> Self {
        PipelineError::Codec(err.0)
    }
}
