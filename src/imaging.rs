//! Medical image validation, transcoding, and scratch storage.
//!
//! Uploads are validated (size, extension/MIME allow-set, decodable
//! pixel data), re-encoded to a normalized format (TIFF for TIFF and
//! DICOM-tagged inputs, high-quality progressive JPEG otherwise), and
//! paired with a 300×300 inside-fit JPEG thumbnail. Artifacts live in a scratch
//! directory under random names carrying their expiry mark; the TTL
//! timer deletes the files and the in-memory reference together, and a
//! startup sweep removes anything stale left behind by a previous run.

use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use image::codecs::tiff::TiffEncoder;
use image::{DynamicImage, GenericImageView, ImageFormat};
use serde::Serialize;
use uuid::Uuid;

use crate::audit::hash_session_id;

/// Thumbnail bounding box.
const THUMB_MAX: u32 = 300;
/// JPEG quality for normalized output.
const JPEG_QUALITY: u8 = 90;
/// Dimension thresholds for advisory warnings.
const MIN_EXPECTED_DIM: u32 = 100;
const MAX_EXPECTED_DIM: u32 = 4096;

#[derive(Debug, thiserror::Error)]
pub enum ImagingError {
    #[error("Image exceeds the {limit_bytes} byte limit")]
    TooLarge { limit_bytes: u64 },
    #[error("Unsupported image format: {0}")]
    UnsupportedFormat(String),
    #[error("Invalid image: {0}")]
    InvalidImage(String),
    #[error("Transcode failed: {0}")]
    TranscodeFailed(String),
}

/// Advisory findings that do not reject the upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImageWarning {
    /// Either axis below the expected clinical minimum.
    UnusuallySmall,
    /// Either axis above the expected clinical maximum.
    UnusuallyLarge,
}

/// Normalized output encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NormalizedFormat {
    Jpeg,
    Tiff,
}

impl NormalizedFormat {
    pub fn extension(self) -> &'static str {
        match self {
            NormalizedFormat::Jpeg => "jpg",
            NormalizedFormat::Tiff => "tiff",
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            NormalizedFormat::Jpeg => "image/jpeg",
            NormalizedFormat::Tiff => "image/tiff",
        }
    }
}

/// A validated, transcoded upload.
#[derive(Debug, Clone)]
pub struct ImageArtifact {
    pub id: Uuid,
    pub content: Vec<u8>,
    pub thumbnail: Vec<u8>,
    pub format: NormalizedFormat,
    pub width: u32,
    pub height: u32,
    /// Detected source container, e.g. "png".
    pub original_format: String,
    pub declared_mime: String,
    pub warnings: Vec<ImageWarning>,
    pub created_at_ms: i64,
    pub expires_at_ms: i64,
    /// Hash of the owning session id; raw ids stay out of artifacts.
    pub session_hash: String,
    pub file_path: PathBuf,
    pub thumb_path: PathBuf,
}

struct StoredEntry {
    file_path: PathBuf,
    thumb_path: PathBuf,
    expires_at_ms: i64,
}

/// Scratch store for transcoded uploads.
pub struct ImageStore {
    scratch_dir: PathBuf,
    max_bytes: u64,
    allowed_formats: Vec<String>,
    ttl: Duration,
    entries: Mutex<HashMap<Uuid, StoredEntry>>,
}

impl ImageStore {
    pub fn new(
        scratch_dir: &Path,
        max_bytes: u64,
        allowed_formats: Vec<String>,
        ttl: Duration,
    ) -> std::io::Result<Self> {
        std::fs::create_dir_all(scratch_dir)?;
        Ok(Self {
            scratch_dir: scratch_dir.to_path_buf(),
            max_bytes,
            allowed_formats: allowed_formats
                .into_iter()
                .map(|f| f.to_lowercase())
                .collect(),
            ttl,
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Delete stale artifact files left on disk by a previous process.
    ///
    /// File names embed their expiry mark (`{id}_{expiry_ms}[...]`),
    /// so the sweep needs nothing but the directory listing.
    pub fn startup_sweep(&self) -> usize {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let Ok(entries) = std::fs::read_dir(&self.scratch_dir) else {
            return 0;
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(expiry) = parse_expiry_mark(name) {
                if now_ms > expiry && std::fs::remove_file(entry.path()).is_ok() {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            tracing::info!(removed, "startup sweep removed stale image artifacts");
        }
        removed
    }

    /// Validate, transcode, and persist an upload.
    pub fn ingest(
        &self,
        bytes: &[u8],
        declared_mime: &str,
        original_filename: &str,
        session_id: &Uuid,
    ) -> Result<ImageArtifact, ImagingError> {
        if bytes.len() as u64 > self.max_bytes {
            return Err(ImagingError::TooLarge {
                limit_bytes: self.max_bytes,
            });
        }

        let extension = Path::new(original_filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();
        if !self.allowed_formats.contains(&extension) {
            return Err(ImagingError::UnsupportedFormat(extension));
        }
        let mime_tag = mime_subtype(declared_mime);
        if !self.allowed_formats.contains(&mime_tag) {
            return Err(ImagingError::UnsupportedFormat(declared_mime.to_string()));
        }

        let original_format = image::guess_format(bytes)
            .map(format_name)
            .unwrap_or_else(|_| extension.clone());
        let decoded = image::load_from_memory(bytes)
            .map_err(|e| ImagingError::InvalidImage(e.to_string()))?;
        let (width, height) = decoded.dimensions();
        if width == 0 || height == 0 {
            return Err(ImagingError::InvalidImage("zero-sized image".to_string()));
        }

        let mut warnings = Vec::new();
        if width < MIN_EXPECTED_DIM || height < MIN_EXPECTED_DIM {
            warnings.push(ImageWarning::UnusuallySmall);
            tracing::warn!(width, height, "image below expected clinical resolution");
        }
        if width > MAX_EXPECTED_DIM || height > MAX_EXPECTED_DIM {
            warnings.push(ImageWarning::UnusuallyLarge);
            tracing::warn!(width, height, "image above expected clinical resolution");
        }

        // TIFF and DICOM-tagged inputs stay lossless; the rest become
        // high-quality JPEG.
        let dicom_tagged = extension == "dcm" || declared_mime.to_lowercase().contains("dicom");
        let format = if dicom_tagged || extension == "tiff" || extension == "tif" {
            NormalizedFormat::Tiff
        } else {
            NormalizedFormat::Jpeg
        };

        let content = encode(&decoded, format)?;
        let thumb = decoded.thumbnail(THUMB_MAX, THUMB_MAX);
        let thumbnail = encode(&thumb, NormalizedFormat::Jpeg)?;

        let id = Uuid::new_v4();
        let created_at_ms = chrono::Utc::now().timestamp_millis();
        let expires_at_ms = created_at_ms + self.ttl.as_millis() as i64;

        let file_path = self
            .scratch_dir
            .join(format!("{id}_{expires_at_ms}.{}", format.extension()));
        let thumb_path = self
            .scratch_dir
            .join(format!("{id}_{expires_at_ms}_thumb.jpg"));
        std::fs::write(&file_path, &content)
            .map_err(|e| ImagingError::TranscodeFailed(e.to_string()))?;
        std::fs::write(&thumb_path, &thumbnail)
            .map_err(|e| ImagingError::TranscodeFailed(e.to_string()))?;

        self.entries.lock().expect("image store lock poisoned").insert(
            id,
            StoredEntry {
                file_path: file_path.clone(),
                thumb_path: thumb_path.clone(),
                expires_at_ms,
            },
        );

        Ok(ImageArtifact {
            id,
            content,
            thumbnail,
            format,
            width,
            height,
            original_format,
            declared_mime: declared_mime.to_string(),
            warnings,
            created_at_ms,
            expires_at_ms,
            session_hash: hash_session_id(session_id),
            file_path,
            thumb_path,
        })
    }

    /// Remove one artifact: both files and the in-memory reference.
    pub fn remove(&self, id: &Uuid) -> bool {
        let entry = self
            .entries
            .lock()
            .expect("image store lock poisoned")
            .remove(id);
        match entry {
            Some(entry) => {
                let _ = std::fs::remove_file(&entry.file_path);
                let _ = std::fs::remove_file(&entry.thumb_path);
                true
            }
            None => false,
        }
    }

    /// Remove every tracked artifact whose expiry has passed.
    pub fn sweep_expired(&self) -> usize {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let expired: Vec<Uuid> = {
            let entries = self.entries.lock().expect("image store lock poisoned");
            entries
                .iter()
                .filter(|(_, e)| now_ms > e.expires_at_ms)
                .map(|(id, _)| *id)
                .collect()
        };
        let mut removed = 0;
        for id in expired {
            if self.remove(&id) {
                removed += 1;
            }
        }
        removed
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.entries
            .lock()
            .expect("image store lock poisoned")
            .contains_key(id)
    }

    pub fn count(&self) -> usize {
        self.entries.lock().expect("image store lock poisoned").len()
    }
}

/// Schedule best-effort deletion of one artifact at its TTL.
pub fn spawn_expiry(store: Arc<ImageStore>, id: Uuid, ttl: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(ttl).await;
        if store.remove(&id) {
            tracing::debug!(artifact = %id, "image artifact expired");
        }
    });
}

fn encode(image: &DynamicImage, format: NormalizedFormat) -> Result<Vec<u8>, ImagingError> {
    match format {
        NormalizedFormat::Jpeg => {
            // The image crate's JPEG encoder only emits baseline
            // scans; progressive output comes from jpeg-encoder.
            // JPEG has no alpha channel.
            let rgb = image.to_rgb8();
            let width: u16 = rgb
                .width()
                .try_into()
                .map_err(|_| ImagingError::TranscodeFailed("width exceeds JPEG limit".to_string()))?;
            let height: u16 = rgb
                .height()
                .try_into()
                .map_err(|_| ImagingError::TranscodeFailed("height exceeds JPEG limit".to_string()))?;

            let mut out = Vec::new();
            let mut encoder = jpeg_encoder::Encoder::new(&mut out, JPEG_QUALITY);
            encoder.set_progressive(true);
            encoder
                .encode(rgb.as_raw(), width, height, jpeg_encoder::ColorType::Rgb)
                .map_err(|e| ImagingError::TranscodeFailed(e.to_string()))?;
            Ok(out)
        }
        NormalizedFormat::Tiff => {
            let mut buf = Cursor::new(Vec::new());
            image
                .write_with_encoder(TiffEncoder::new(&mut buf))
                .map_err(|e| ImagingError::TranscodeFailed(e.to_string()))?;
            Ok(buf.into_inner())
        }
    }
}

fn mime_subtype(mime: &str) -> String {
    let lower = mime.to_lowercase();
    let subtype = lower.rsplit('/').next().unwrap_or("").to_string();
    match subtype.as_str() {
        "jpeg" => "jpg".to_string(),
        "dicom" => "dcm".to_string(),
        other => other.to_string(),
    }
}

fn format_name(format: ImageFormat) -> String {
    format.extensions_str().first().unwrap_or(&"unknown").to_string()
}

/// Parse the `{uuid}_{expiry_ms}` prefix of a scratch file name.
fn parse_expiry_mark(file_name: &str) -> Option<i64> {
    let stem = file_name.split('.').next()?;
    let mut parts = stem.splitn(3, '_');
    let id_part = parts.next()?;
    let expiry_part = parts.next()?;
    Uuid::parse_str(id_part).ok()?;
    expiry_part.parse().ok()
}
