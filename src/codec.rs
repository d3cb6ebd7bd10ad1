//! # Codec Service Boundary Module
//!
//! Questo modulo definisce il contratto verso i codec esterni e la loro registrazione.
//!
//! ## Responsabilità:
//! - Definisce `Operation`, l'enum chiuso delle operazioni supportate
//! - Definisce il trait `CodecService` (bytes + settings → bytes + metadata)
//! - Definisce `CodecRegistry`, l'unico punto di registrazione operazione → servizio
//! - Definisce `ProgressSink` (progresso monotono 0–100) e `StagedProgress`
//!   per mappare pipeline multi-stage in un singolo range
//! - Definisce `CancelFlag` per l'abort cooperativo best-effort
//!
//! ## Implementazioni di riferimento:
//! - `ImageTranscoder`: decode + re-encode via crate `image` (JPEG/PNG/WebP)
//! - `PassthroughCodec`: copia i byte senza toccarli (modalità "copy only")
//! - `FnCodec`: adapter da closure, usato dai test per scriptare i codec
//!
//! ## Contratto di progresso:
//! Zero o più notifiche con un float in [0,100], strettamente non decrescenti
//! per invocazione. Uno stage non può riportare progresso oltre il proprio
//! boundary prima che lo stage precedente sia risolto.

use crate::error::CodecError;
use crate::formats::AppProfile;
use crate::settings::{ResizeMode, ResizeSpec, Settings};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// Closed set of operations the pipeline can dispatch.
///
/// Each variant maps to exactly one registered [`CodecService`]; there is no
/// dispatch over format strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    CompressImage,
    TranscodeVideo,
    CompressPdf,
    OptimizeGif,
}

impl Operation {
    /// The operation each tool profile dispatches
    pub fn for_profile(profile: AppProfile) -> Self {
        match profile {
            AppProfile::Image => Self::CompressImage,
            AppProfile::Video => Self::TranscodeVideo,
            AppProfile::Pdf => Self::CompressPdf,
            AppProfile::Gif => Self::OptimizeGif,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::CompressImage => "compress-image",
            Self::TranscodeVideo => "transcode-video",
            Self::CompressPdf => "compress-pdf",
            Self::OptimizeGif => "optimize-gif",
        }
    }
}

/// Minimal metadata derived from a processed payload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaMetadata {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub pages: Option<u32>,
    pub frames: Option<u32>,
}

/// One unit of work handed to a codec service.
///
/// Carries the settings snapshot taken when the item was popped from the
/// queue — never the live settings.
#[derive(Clone)]
pub struct CodecRequest {
    pub bytes: Arc<[u8]>,
    pub operation: Operation,
    pub settings: Settings,
}

/// Result of a codec invocation
#[derive(Debug, Clone)]
pub struct CodecOutput {
    pub bytes: Arc<[u8]>,
    pub metadata: MediaMetadata,
}

impl CodecOutput {
    pub fn new(bytes: Vec<u8>, metadata: MediaMetadata) -> Self {
        Self {
            bytes: bytes.into(),
            metadata,
        }
    }
}

/// Cooperative cancellation flag handed to every execution.
///
/// Best-effort: a codec that never polls it simply runs to completion, and
/// the orchestrator discards the stale result via its epoch check.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Progress reporter with a per-invocation monotonic guarantee.
///
/// Values are clamped to [0,100]; a report that does not advance past the
/// last delivered value is dropped instead of regressing.
#[derive(Clone)]
pub struct ProgressSink {
    emit: Arc<dyn Fn(f32) + Send + Sync>,
    // f32 bits; IEEE ordering matches integer ordering for non-negative values
    last: Arc<AtomicU32>,
}

impl ProgressSink {
    pub fn new(emit: impl Fn(f32) + Send + Sync + 'static) -> Self {
        Self {
            emit: Arc::new(emit),
            last: Arc::new(AtomicU32::new(0f32.to_bits())),
        }
    }

    /// Sink that discards every report
    pub fn discard() -> Self {
        Self::new(|_| {})
    }

    pub fn report(&self, pct: f32) {
        let pct = pct.clamp(0.0, 100.0);
        let prev = self.last.fetch_max(pct.to_bits(), Ordering::SeqCst);
        if pct.to_bits() > prev {
            (self.emit)(pct);
        }
    }

    /// Sub-range view for one stage of a multi-stage codec.
    ///
    /// `start`/`end` are the stage boundaries in the item's 0–100 range.
    pub fn stage(&self, start: f32, end: f32) -> StagedProgress {
        StagedProgress {
            sink: self.clone(),
            start,
            span: (end - start).max(0.0),
        }
    }
}

/// Maps a stage-local 0–100 progress into its slice of the item range.
///
/// The parent sink's monotonic clamp guarantees a stage can never report
/// behind an earlier stage's boundary.
pub struct StagedProgress {
    sink: ProgressSink,
    start: f32,
    span: f32,
}

impl StagedProgress {
    pub fn report(&self, stage_pct: f32) {
        let stage_pct = stage_pct.clamp(0.0, 100.0);
        self.sink.report(self.start + self.span * stage_pct / 100.0);
    }

    pub fn done(&self) {
        self.report(100.0);
    }
}

/// External collaborator performing the actual conversion/compression.
///
/// `execute` futures are `'static`: implementations clone what they need out
/// of `&self` so the pool can run them on detached tasks.
pub trait CodecService: Send + Sync {
    fn name(&self) -> &str;

    /// One-time expensive setup (e.g. loading codec modules). Idempotence is
    /// handled by the pool; services just do the work.
    fn warm_up(&self) -> BoxFuture<'static, Result<(), CodecError>> {
        Box::pin(futures::future::ready(Ok(())))
    }

    fn execute(
        &self,
        request: CodecRequest,
        progress: ProgressSink,
        cancel: CancelFlag,
    ) -> BoxFuture<'static, Result<CodecOutput, CodecError>>;
}

/// Single registration point mapping operations to codec services
#[derive(Default)]
pub struct CodecRegistry {
    services: HashMap<Operation, Arc<dyn CodecService>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, operation: Operation, service: Arc<dyn CodecService>) {
        self.services.insert(operation, service);
    }

    pub fn get(&self, operation: Operation) -> Option<Arc<dyn CodecService>> {
        self.services.get(&operation).cloned()
    }

    pub fn operations(&self) -> Vec<Operation> {
        self.services.keys().copied().collect()
    }

    /// Warm up every registered service, failing on the first error
    pub async fn warm_up_all(&self) -> Result<(), CodecError> {
        for service in self.services.values() {
            service.warm_up().await?;
        }
        Ok(())
    }
}

/// Codec service built from a closure.
///
/// Main use is scripting codec behavior in tests; also handy for embedders
/// that wrap an existing async function.
pub struct FnCodec<F> {
    name: String,
    f: F,
}

impl<F> FnCodec<F> {
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F, Fut> CodecService for FnCodec<F>
where
    F: Fn(CodecRequest, ProgressSink, CancelFlag) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<CodecOutput, CodecError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(
        &self,
        request: CodecRequest,
        progress: ProgressSink,
        cancel: CancelFlag,
    ) -> BoxFuture<'static, Result<CodecOutput, CodecError>> {
        Box::pin((self.f)(request, progress, cancel))
    }
}

/// Copy-only codec: returns the input bytes untouched.
///
/// The "skip compression, copy only" mode — it still exercises the full
/// progress and cancellation contract, which makes it useful as a pipeline
/// smoke codec for operations with no real service registered.
pub struct PassthroughCodec;

impl CodecService for PassthroughCodec {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn execute(
        &self,
        request: CodecRequest,
        progress: ProgressSink,
        cancel: CancelFlag,
    ) -> BoxFuture<'static, Result<CodecOutput, CodecError>> {
        Box::pin(async move {
            let read = progress.stage(0.0, 50.0);
            if cancel.is_cancelled() {
                return Err(CodecError::new("cancelled"));
            }
            read.done();

            let write = progress.stage(50.0, 100.0);
            if cancel.is_cancelled() {
                return Err(CodecError::new("cancelled"));
            }
            let output = CodecOutput {
                bytes: request.bytes.clone(),
                metadata: MediaMetadata::default(),
            };
            write.done();
            Ok(output)
        })
    }
}

/// Reference image codec: decode, optional resize, re-encode.
///
/// Stage boundaries: decode 0–40, transform 40–60, encode 60–100.
/// WebP output is lossless (the only WebP encoder the `image` crate ships).
pub struct ImageTranscoder;

impl CodecService for ImageTranscoder {
    fn name(&self) -> &str {
        "image-transcoder"
    }

    fn execute(
        &self,
        request: CodecRequest,
        progress: ProgressSink,
        cancel: CancelFlag,
    ) -> BoxFuture<'static, Result<CodecOutput, CodecError>> {
        Box::pin(async move {
            // CPU-bound work runs on the blocking pool, off the coordinator path
            let handle =
                tokio::task::spawn_blocking(move || transcode_image(request, progress, cancel));
            handle
                .await
                .map_err(|e| CodecError::new(format!("image codec task failed: {}", e)))?
        })
    }
}

fn transcode_image(
    request: CodecRequest,
    progress: ProgressSink,
    cancel: CancelFlag,
) -> Result<CodecOutput, CodecError> {
    use crate::formats::OutputFormat;
    use image::ImageEncoder;

    let decode = progress.stage(0.0, 40.0);
    if cancel.is_cancelled() {
        return Err(CodecError::new("cancelled"));
    }
    let img = image::load_from_memory(&request.bytes)
        .map_err(|e| CodecError::new(format!("decode failed: {}", e)))?;
    decode.done();

    let transform = progress.stage(40.0, 60.0);
    if cancel.is_cancelled() {
        return Err(CodecError::new("cancelled"));
    }
    let img = match &request.settings.resize {
        Some(spec) => apply_resize(img, spec),
        None => img,
    };
    transform.done();

    let encode = progress.stage(60.0, 100.0);
    if cancel.is_cancelled() {
        return Err(CodecError::new("cancelled"));
    }
    let (width, height) = (img.width(), img.height());
    let mut out = Vec::new();
    match request.settings.format {
        OutputFormat::Jpeg => {
            let rgb = img.to_rgb8();
            let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(
                Cursor::new(&mut out),
                request.settings.quality,
            );
            encoder
                .encode_image(&rgb)
                .map_err(|e| CodecError::new(format!("jpeg encode failed: {}", e)))?;
        }
        OutputFormat::Png => {
            let rgba = img.to_rgba8();
            image::codecs::png::PngEncoder::new(Cursor::new(&mut out))
                .write_image(rgba.as_raw(), width, height, image::ColorType::Rgba8)
                .map_err(|e| CodecError::new(format!("png encode failed: {}", e)))?;
        }
        OutputFormat::WebP => {
            let rgba = img.to_rgba8();
            image::codecs::webp::WebPEncoder::new_lossless(Cursor::new(&mut out))
                .write_image(rgba.as_raw(), width, height, image::ColorType::Rgba8)
                .map_err(|e| CodecError::new(format!("webp encode failed: {}", e)))?;
        }
        other => {
            return Err(CodecError::new(format!(
                "image transcoder cannot encode {}",
                other
            )));
        }
    }
    encode.done();

    Ok(CodecOutput::new(
        out,
        MediaMetadata {
            width: Some(width),
            height: Some(height),
            ..MediaMetadata::default()
        },
    ))
}

fn apply_resize(img: image::DynamicImage, spec: &ResizeSpec) -> image::DynamicImage {
    use image::imageops::FilterType;

    let (w, h) = (img.width(), img.height());
    let target = spec.target.max(1);
    match spec.mode {
        ResizeMode::LongestSide if w.max(h) > target => {
            img.resize(target, target, FilterType::Lanczos3)
        }
        ResizeMode::Width if w > target => img.resize(target, u32::MAX, FilterType::Lanczos3),
        ResizeMode::Height if h > target => img.resize(u32::MAX, target, FilterType::Lanczos3),
        _ => img,
    }
}
