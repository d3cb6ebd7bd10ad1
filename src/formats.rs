//! # Format and Profile Module
//!
//! Questo modulo gestisce formati supportati, allow-list di intake e probing metadata.
//!
//! ## Responsabilità:
//! - Definisce gli enum chiusi `InputFormat` / `OutputFormat`
//! - Definisce `AppProfile` (image, video, pdf, gif) con la allow-list per tool
//! - Detection del formato da estensione o MIME type
//! - Probe best-effort dei metadata di input (dimensioni, pagine) senza full decode
//! - Formattazione human-readable delle dimensioni
//!
//! ## Formati supportati:
//! - **Immagini**: JPG, JPEG, PNG, WebP, AVIF, HEIC
//! - **Video**: MP4, MOV, AVI, MKV, WebM
//! - **Documenti**: PDF
//! - **Animazioni**: GIF
//!
//! ## Esempio:
//! ```rust,ignore
//! let profile = AppProfile::Image;
//! if let Some(format) = InputFormat::detect("photo.jpg", None) {
//!     assert!(profile.accepts(format));
//! }
//! ```

use crate::codec::MediaMetadata;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;
use std::str::FromStr;

/// Input format of a user-submitted file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputFormat {
    Jpeg,
    Png,
    WebP,
    Avif,
    Heic,
    Gif,
    Mp4,
    Mov,
    Avi,
    Mkv,
    Webm,
    Pdf,
}

impl InputFormat {
    /// Detect the format from a file name and an optional MIME type.
    ///
    /// The MIME type wins when present; the extension is the fallback.
    pub fn detect(name: &str, mime: Option<&str>) -> Option<Self> {
        if let Some(mime) = mime {
            if let Some(format) = Self::from_mime(mime) {
                return Some(format);
            }
        }
        let ext = name.rsplit_once('.').map(|(_, ext)| ext)?;
        Self::from_extension(ext)
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext_lower = ext.to_lowercase();
        match ext_lower.as_str() {
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            "webp" => Some(Self::WebP),
            "avif" => Some(Self::Avif),
            "heic" | "heif" => Some(Self::Heic),
            "gif" => Some(Self::Gif),
            "mp4" | "m4v" => Some(Self::Mp4),
            "mov" => Some(Self::Mov),
            "avi" => Some(Self::Avi),
            "mkv" => Some(Self::Mkv),
            "webm" => Some(Self::Webm),
            "pdf" => Some(Self::Pdf),
            _ => None,
        }
    }

    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime {
            "image/jpeg" => Some(Self::Jpeg),
            "image/png" => Some(Self::Png),
            "image/webp" => Some(Self::WebP),
            "image/avif" => Some(Self::Avif),
            "image/heic" | "image/heif" => Some(Self::Heic),
            "image/gif" => Some(Self::Gif),
            "video/mp4" => Some(Self::Mp4),
            "video/quicktime" => Some(Self::Mov),
            "video/x-msvideo" => Some(Self::Avi),
            "video/x-matroska" => Some(Self::Mkv),
            "video/webm" => Some(Self::Webm),
            "application/pdf" => Some(Self::Pdf),
            _ => None,
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(
            self,
            Self::Jpeg | Self::Png | Self::WebP | Self::Avif | Self::Heic
        )
    }

    pub fn is_video(&self) -> bool {
        matches!(self, Self::Mp4 | Self::Mov | Self::Avi | Self::Mkv | Self::Webm)
    }
}

/// Output format chosen for an item, stamped from the settings at intake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Jpeg,
    Png,
    WebP,
    Avif,
    Gif,
    Mp4,
    Webm,
    Pdf,
}

impl OutputFormat {
    /// File extension used when exporting results
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::WebP => "webp",
            Self::Avif => "avif",
            Self::Gif => "gif",
            Self::Mp4 => "mp4",
            Self::Webm => "webm",
            Self::Pdf => "pdf",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "jpg" | "jpeg" => Ok(Self::Jpeg),
            "png" => Ok(Self::Png),
            "webp" => Ok(Self::WebP),
            "avif" => Ok(Self::Avif),
            "gif" => Ok(Self::Gif),
            "mp4" => Ok(Self::Mp4),
            "webm" => Ok(Self::Webm),
            "pdf" => Ok(Self::Pdf),
            other => Err(format!("unknown output format: {}", other)),
        }
    }
}

/// One of the four tools the pipeline serves.
///
/// Each profile carries its own intake allow-list, default output format and
/// settings blob key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AppProfile {
    Image,
    Video,
    Pdf,
    Gif,
}

impl AppProfile {
    /// Stable identity used to key the persisted settings blob
    pub fn id(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Pdf => "pdf",
            Self::Gif => "gif",
        }
    }

    /// Check a format against this tool's intake allow-list
    pub fn accepts(&self, format: InputFormat) -> bool {
        match self {
            Self::Image => format.is_image(),
            Self::Video => format.is_video(),
            Self::Pdf => format == InputFormat::Pdf,
            Self::Gif => format == InputFormat::Gif,
        }
    }

    /// Output format stamped on new items when no settings exist yet
    pub fn default_output(&self) -> OutputFormat {
        match self {
            Self::Image => OutputFormat::WebP,
            Self::Video => OutputFormat::Mp4,
            Self::Pdf => OutputFormat::Pdf,
            Self::Gif => OutputFormat::Gif,
        }
    }
}

impl fmt::Display for AppProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for AppProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "image" => Ok(Self::Image),
            "video" => Ok(Self::Video),
            "pdf" => Ok(Self::Pdf),
            "gif" => Ok(Self::Gif),
            other => Err(format!("unknown profile: {}", other)),
        }
    }
}

/// Best-effort input metadata probe, without a full decode.
///
/// Image dimensions come from the header only; PDF page count is a byte-scan
/// heuristic. Anything the probe cannot answer cheaply stays `None`.
pub fn probe_metadata(format: InputFormat, bytes: &[u8]) -> Option<MediaMetadata> {
    if format.is_image() || format == InputFormat::Gif {
        let reader = image::io::Reader::new(Cursor::new(bytes))
            .with_guessed_format()
            .ok()?;
        let (width, height) = reader.into_dimensions().ok()?;
        return Some(MediaMetadata {
            width: Some(width),
            height: Some(height),
            ..MediaMetadata::default()
        });
    }

    if format == InputFormat::Pdf {
        let pages = count_pdf_pages(bytes);
        if pages > 0 {
            return Some(MediaMetadata {
                pages: Some(pages),
                ..MediaMetadata::default()
            });
        }
    }

    None
}

/// Count `/Type /Page` objects in a PDF body.
///
/// Heuristic: misses compressed object streams, never decodes the document.
fn count_pdf_pages(bytes: &[u8]) -> u32 {
    let mut count = 0u32;
    for pattern in [&b"/Type /Page"[..], &b"/Type/Page"[..]] {
        count += bytes
            .windows(pattern.len() + 1)
            .filter(|w| w.starts_with(pattern) && w[pattern.len()] != b's')
            .count() as u32;
    }
    count
}

/// Get human-readable file size
pub fn format_size(size: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = size as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", size as u64, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}
