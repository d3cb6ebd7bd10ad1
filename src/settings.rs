//! # Settings Store Module
//!
//! Questo modulo gestisce la configurazione per-app della pipeline.
//!
//! ## Responsabilità:
//! - Definisce la struct `Settings` con tutti i parametri di conversione
//! - Fornisce validazione robusta dei parametri
//! - Persiste il blob JSON ad ogni mutazione, con default-merge al load
//! - Notifica i subscriber dopo ogni update committato
//!
//! ## Parametri:
//! - `version`: Versione strutturale del blob (default-merge per campi ignoti)
//! - `format`: Formato di output stampato sugli item al momento dell'intake
//! - `quality`: Qualità di encoding (1-100, default: 80)
//! - `lossless`: Flag lossless per i codec che lo supportano
//! - `resize`: Ridimensionamento opzionale (modalità + target in pixel)
//! - `workers`: Numero di execution context paralleli (default: 4)
//!
//! ## Strategia di persistence:
//! - Un blob JSON per app in `~/.media-batch/settings_<app>.json`
//! - Load: merge del blob salvato sopra i default (forward/backward compatible)
//! - Save: su ogni update; un fallimento degrada a warning, il valore
//!   in-memory resta autoritativo per la sessione
//!
//! ## Esempio:
//! ```rust,ignore
//! let store = SettingsStore::open(AppProfile::Image, backend);
//! store.update(SettingsPatch { quality: Some(85), ..Default::default() })?;
//! ```

use crate::error::PipelineError;
use crate::formats::{AppProfile, OutputFormat};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Current structural version of the settings blob
pub const SETTINGS_VERSION: u32 = 1;

/// Resize strategy applied by codecs that support it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResizeMode {
    LongestSide,
    Width,
    Height,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeSpec {
    pub mode: ResizeMode,
    /// Target size in pixels for the chosen dimension
    pub target: u32,
}

/// Per-app configuration record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Structural version of the blob
    pub version: u32,
    /// Output format stamped on new items
    pub format: OutputFormat,
    /// Encoding quality (1-100)
    pub quality: u8,
    /// Prefer lossless encoding where the codec supports it
    pub lossless: bool,
    /// Optional resize applied before encoding
    pub resize: Option<ResizeSpec>,
    /// Number of parallel execution contexts
    pub workers: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            format: OutputFormat::WebP,
            quality: 80,
            lossless: false,
            resize: None,
            workers: 4,
        }
    }
}

impl Settings {
    /// Defaults for one tool profile (the output format differs per tool)
    pub fn for_profile(profile: AppProfile) -> Self {
        Self {
            format: profile.default_output(),
            ..Self::default()
        }
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.quality == 0 || self.quality > 100 {
            return Err(PipelineError::InvalidSettings(
                "quality must be between 1 and 100".to_string(),
            ));
        }

        if self.workers == 0 {
            return Err(PipelineError::InvalidSettings(
                "number of workers must be greater than 0".to_string(),
            ));
        }

        if let Some(resize) = &self.resize {
            if resize.target == 0 {
                return Err(PipelineError::InvalidSettings(
                    "resize target must be greater than 0".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Partial update merged into the current settings
#[derive(Debug, Default, Clone)]
pub struct SettingsPatch {
    pub format: Option<OutputFormat>,
    pub quality: Option<u8>,
    pub lossless: Option<bool>,
    /// `Some(None)` clears the resize spec
    pub resize: Option<Option<ResizeSpec>>,
    pub workers: Option<usize>,
}

/// Where the settings blob lives.
///
/// The store is deliberately persistence-agnostic: the file backend covers
/// the CLI, tests use the in-memory one, embedders can bring their own.
pub trait SettingsBackend: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<String>, PipelineError>;
    fn store(&self, key: &str, blob: &str) -> Result<(), PipelineError>;
}

/// JSON files under `~/.media-batch/`
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new() -> Result<Self, PipelineError> {
        let dir = dirs::home_dir()
            .ok_or_else(|| {
                PipelineError::Persistence("could not find home directory".to_string())
            })?
            .join(".media-batch");
        Ok(Self { dir })
    }

    /// Backend rooted at an explicit directory
    pub fn at(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

impl SettingsBackend for FileBackend {
    fn load(&self, key: &str) -> Result<Option<String>, PipelineError> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        let blob = std::fs::read_to_string(&path)
            .map_err(|e| PipelineError::Persistence(format!("read {}: {}", path.display(), e)))?;
        Ok(Some(blob))
    }

    fn store(&self, key: &str, blob: &str) -> Result<(), PipelineError> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| PipelineError::Persistence(format!("create settings dir: {}", e)))?;
        let path = self.path_for(key);
        std::fs::write(&path, blob)
            .map_err(|e| PipelineError::Persistence(format!("write {}: {}", path.display(), e)))
    }
}

/// In-memory backend for tests and throwaway sessions
#[derive(Default)]
pub struct MemoryBackend {
    blobs: Mutex<HashMap<String, String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsBackend for MemoryBackend {
    fn load(&self, key: &str) -> Result<Option<String>, PipelineError> {
        Ok(self.blobs.lock().map_or(None, |b| b.get(key).cloned()))
    }

    fn store(&self, key: &str, blob: &str) -> Result<(), PipelineError> {
        if let Ok(mut blobs) = self.blobs.lock() {
            blobs.insert(key.to_string(), blob.to_string());
        }
        Ok(())
    }
}

type SettingsListener = Arc<dyn Fn(&Settings) + Send + Sync>;

/// Observable, persisted settings record for one app profile
pub struct SettingsStore {
    profile: AppProfile,
    key: String,
    backend: Arc<dyn SettingsBackend>,
    current: Mutex<Settings>,
    listeners: Mutex<Vec<(u64, SettingsListener)>>,
    next_subscription: AtomicU64,
}

impl SettingsStore {
    /// Load (or default) the settings blob for an app profile.
    ///
    /// A missing, unreadable or structurally foreign blob never fails the
    /// open: stored fields are merged over the profile defaults, anything
    /// else is defaulted, and an invalid merge result falls back to defaults.
    pub fn open(profile: AppProfile, backend: Arc<dyn SettingsBackend>) -> Self {
        let key = format!("settings_{}", profile.id());
        let defaults = Settings::for_profile(profile);
        let current = match backend.load(&key) {
            Ok(Some(blob)) => merge_with_defaults(&blob, &defaults),
            Ok(None) => defaults,
            Err(e) => {
                warn!("Failed to load settings blob '{}': {}", key, e);
                defaults
            }
        };

        Self {
            profile,
            key,
            backend,
            current: Mutex::new(current),
            listeners: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
        }
    }

    /// Current settings (cheap clone)
    pub fn get(&self) -> Settings {
        self.current
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Merge a patch, persist and notify.
    ///
    /// Validation failures reject the whole patch; persistence failures are
    /// swallowed with a warning and the in-memory value stays authoritative.
    pub fn update(&self, patch: SettingsPatch) -> Result<Settings, PipelineError> {
        let updated = {
            let mut current = self
                .current
                .lock()
                .map_err(|_| PipelineError::InvalidSettings("settings lock poisoned".into()))?;

            let mut next = current.clone();
            if let Some(format) = patch.format {
                next.format = format;
            }
            if let Some(quality) = patch.quality {
                next.quality = quality;
            }
            if let Some(lossless) = patch.lossless {
                next.lossless = lossless;
            }
            if let Some(resize) = patch.resize {
                next.resize = resize;
            }
            if let Some(workers) = patch.workers {
                next.workers = workers;
            }
            next.validate()?;

            *current = next.clone();
            next
        };

        self.persist(&updated);
        self.notify(&updated);
        Ok(updated)
    }

    /// Reset to the profile defaults, persist and notify
    pub fn load_defaults(&self) -> Settings {
        let defaults = Settings::for_profile(self.profile);
        if let Ok(mut current) = self.current.lock() {
            *current = defaults.clone();
        }
        self.persist(&defaults);
        self.notify(&defaults);
        defaults
    }

    /// Register a listener called synchronously after each committed update
    pub fn subscribe(&self, listener: impl Fn(&Settings) + Send + Sync + 'static) -> u64 {
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

    fn persist(&self, settings: &Settings) {
        let blob = match serde_json::to_string_pretty(settings) {
            Ok(blob) => blob,
            Err(e) => {
                warn!("Failed to serialize settings: {}", e);
                return;
            }
        };
        if let Err(e) = self.backend.store(&self.key, &blob) {
            // session continues with the in-memory value
            warn!("Failed to persist settings '{}': {}", self.key, e);
        }
    }

    fn notify(&self, settings: &Settings) {
        let listeners: Vec<SettingsListener> = match self.listeners.lock() {
            Ok(listeners) => listeners.iter().map(|(_, l)| l.clone()).collect(),
            Err(_) => return,
        };
        for listener in listeners {
            listener(settings);
        }
    }
}

/// Merge a stored blob over the defaults, field by field.
///
/// Unknown fields are dropped, missing fields keep their default, and a
/// result that fails validation falls back to the defaults entirely.
fn merge_with_defaults(blob: &str, defaults: &Settings) -> Settings {
    let stored: Value = match serde_json::from_str(blob) {
        Ok(value) => value,
        Err(e) => {
            warn!("Settings blob is not valid JSON, using defaults: {}", e);
            return defaults.clone();
        }
    };

    let mut base = match serde_json::to_value(defaults) {
        Ok(value) => value,
        Err(_) => return defaults.clone(),
    };
    merge_values(&mut base, stored);

    match serde_json::from_value::<Settings>(base) {
        Ok(settings) => match settings.validate() {
            Ok(()) => settings,
            Err(e) => {
                warn!("Stored settings failed validation, using defaults: {}", e);
                defaults.clone()
            }
        },
        Err(e) => {
            debug!("Settings blob merge failed, using defaults: {}", e);
            defaults.clone()
        }
    }
}

fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    // unknown keys are dropped, not carried forward
                    None => {}
                }
            }
        }
        (base_slot, overlay) => *base_slot = overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct FailingBackend;

    impl SettingsBackend for FailingBackend {
        fn load(&self, _key: &str) -> Result<Option<String>, PipelineError> {
            Ok(None)
        }

        fn store(&self, _key: &str, _blob: &str) -> Result<(), PipelineError> {
            Err(PipelineError::Persistence("quota exceeded".to_string()))
        }
    }

    #[test]
    fn test_settings_validation() {
        let mut settings = Settings::default();
        assert!(settings.validate().is_ok());

        settings.quality = 0;
        assert!(settings.validate().is_err());

        settings.quality = 80;
        settings.workers = 0;
        assert!(settings.validate().is_err());

        settings.workers = 4;
        settings.resize = Some(ResizeSpec {
            mode: ResizeMode::Width,
            target: 0,
        });
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_default_merge_keeps_unknown_and_missing_fields_sane() {
        let blob = r#"{"quality": 55, "future_field": true, "format": "jpeg"}"#;
        let merged = merge_with_defaults(blob, &Settings::default());
        assert_eq!(merged.quality, 55);
        assert_eq!(merged.format, OutputFormat::Jpeg);
        // missing fields keep their defaults
        assert_eq!(merged.workers, Settings::default().workers);
        assert_eq!(merged.version, SETTINGS_VERSION);
    }

    #[test]
    fn test_garbage_blob_falls_back_to_defaults() {
        let defaults = Settings::default();
        assert_eq!(merge_with_defaults("not json", &defaults), defaults);
        assert_eq!(
            merge_with_defaults(r#"{"quality": 9000}"#, &defaults),
            defaults
        );
    }

    #[test]
    fn test_profile_defaults_pick_the_tool_output() {
        let pdf = SettingsStore::open(AppProfile::Pdf, Arc::new(MemoryBackend::new()));
        assert_eq!(pdf.get().format, OutputFormat::Pdf);
        let gif = SettingsStore::open(AppProfile::Gif, Arc::new(MemoryBackend::new()));
        assert_eq!(gif.get().format, OutputFormat::Gif);
    }

    #[test]
    fn test_update_persists_and_reloads() {
        let backend = Arc::new(MemoryBackend::new());
        let store = SettingsStore::open(AppProfile::Image, backend.clone());
        store
            .update(SettingsPatch {
                quality: Some(90),
                format: Some(OutputFormat::Png),
                ..Default::default()
            })
            .unwrap();

        let reopened = SettingsStore::open(AppProfile::Image, backend);
        assert_eq!(reopened.get().quality, 90);
        assert_eq!(reopened.get().format, OutputFormat::Png);
    }

    #[test]
    fn test_profiles_do_not_share_blobs() {
        let backend = Arc::new(MemoryBackend::new());
        let image = SettingsStore::open(AppProfile::Image, backend.clone());
        image
            .update(SettingsPatch {
                quality: Some(33),
                ..Default::default()
            })
            .unwrap();

        let pdf = SettingsStore::open(AppProfile::Pdf, backend);
        assert_eq!(pdf.get().quality, Settings::default().quality);
    }

    #[test]
    fn test_persistence_failure_is_swallowed() {
        let store = SettingsStore::open(AppProfile::Gif, Arc::new(FailingBackend));
        let updated = store
            .update(SettingsPatch {
                quality: Some(42),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(updated.quality, 42);
        // in-memory value stays authoritative
        assert_eq!(store.get().quality, 42);
    }

    #[test]
    fn test_invalid_patch_is_rejected_whole() {
        let store = SettingsStore::open(AppProfile::Image, Arc::new(MemoryBackend::new()));
        let result = store.update(SettingsPatch {
            quality: Some(0),
            format: Some(OutputFormat::Png),
            ..Default::default()
        });
        assert!(result.is_err());
        assert_eq!(store.get(), Settings::default());
    }

    #[test]
    fn test_subscribers_run_after_commit() {
        let store = SettingsStore::open(AppProfile::Image, Arc::new(MemoryBackend::new()));
        let seen = Arc::new(AtomicUsize::new(0));
        let listener_seen = seen.clone();
        store.subscribe(move |settings| {
            assert_eq!(settings.quality, 70);
            listener_seen.fetch_add(1, Ordering::SeqCst);
        });

        store
            .update(SettingsPatch {
                quality: Some(70),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_file_backend_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FileBackend::at(dir.path().to_path_buf()));
        let store = SettingsStore::open(AppProfile::Video, backend.clone());
        store
            .update(SettingsPatch {
                workers: Some(2),
                ..Default::default()
            })
            .unwrap();

        let reopened = SettingsStore::open(AppProfile::Video, backend);
        assert_eq!(reopened.get().workers, 2);
    }
}
