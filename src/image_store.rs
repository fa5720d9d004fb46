use std::path::{Path, PathBuf};

use std::fs::File;
use std::io::BufReader;

use image::{DynamicImage, ImageFormat, ImageReader};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::geometry::{Dimensions, PixelRegion};

#[derive(Debug, Error)]
pub enum ImageStoreError {
    #[error("image not found: {0}")]
    NotFound(String),
    #[error("invalid image reference: {0}")]
    InvalidReference(String),
    #[error("failed to decode image {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: image::ImageError,
    },
    #[error("failed to encode image {path}: {source}")]
    Encode {
        path: String,
        #[source]
        source: image::ImageError,
    },
    #[error("crop {region:?} exceeds image bounds {dimensions}")]
    OutOfBounds { region: PixelRegion, dimensions: Dimensions },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Immutable handle to an image held by the store.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ImageReference {
    /// File name inside the store root; unique per stored image.
    pub id: String,
    #[serde(skip)]
    pub path: PathBuf,
    pub dimensions: Dimensions,
}

impl ImageReference {
    /// Public URL under which the static file layer serves this image.
    pub fn url(&self) -> String {
        format!("/static/{}", self.id)
    }

    pub fn file_path(&self) -> String {
        self.path.to_string_lossy().to_string()
    }
}

/// Raw bytes of a stored image plus its MIME type, for inlining into a model
/// request.
#[derive(Debug, Clone)]
pub struct InlineImage {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl InlineImage {
    pub fn load(image: &ImageReference) -> Result<Self, ImageStoreError> {
        let bytes = std::fs::read(&image.path)?;
        let mime_type = image::guess_format(&bytes)
            .or_else(|_| ImageFormat::from_path(&image.path))
            .map(|f| f.to_mime_type().to_string())
            .unwrap_or_else(|_| "application/octet-stream".to_string());
        Ok(Self { mime_type, bytes })
    }
}

/// Flat directory of uploaded images and their derived crops. Files are only
/// ever added, never rewritten.
#[derive(Debug, Clone)]
pub struct ImageStore {
    root: PathBuf,
}

impl ImageStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, ImageStoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persist uploaded bytes under a fresh name and return a validated
    /// reference. Bytes that do not decode as an image are discarded.
    pub fn save_upload(&self, file_name: &str, bytes: &[u8]) -> Result<ImageReference, ImageStoreError> {
        let clean = sanitize_file_name(file_name);
        let id = format!("{}_{}", short_id(), clean);
        let path = self.root.join(&id);
        std::fs::write(&path, bytes)?;
        match self.open(&id) {
            Ok(r) => Ok(r),
            Err(e) => {
                let _ = std::fs::remove_file(&path);
                Err(e)
            }
        }
    }

    /// Resolve an observer-supplied reference (`static/x.jpg` or `x.jpg`).
    /// Only the final path component is honoured so a reference can never
    /// escape the store root.
    pub fn open(&self, reference: &str) -> Result<ImageReference, ImageStoreError> {
        let name = Path::new(reference.trim())
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ImageStoreError::InvalidReference(reference.to_string()))?;
        let path = self.root.join(name);
        if !path.is_file() {
            return Err(ImageStoreError::NotFound(reference.to_string()));
        }
        let (width, height) = reader(&path)?.into_dimensions().map_err(|source| ImageStoreError::Decode {
            path: path.to_string_lossy().to_string(),
            source,
        })?;
        Ok(ImageReference { id: name.to_string(), path, dimensions: Dimensions::new(width, height) })
    }

    /// Derive a new image from `region` of `source`. The source file is left
    /// untouched and every call yields a distinct reference.
    pub fn crop(&self, source: &ImageReference, region: PixelRegion) -> Result<ImageReference, ImageStoreError> {
        let dims = source.dimensions;
        let fits = region.w > 0
            && region.h > 0
            && u64::from(region.x) + u64::from(region.w) <= u64::from(dims.width)
            && u64::from(region.y) + u64::from(region.h) <= u64::from(dims.height);
        if !fits {
            return Err(ImageStoreError::OutOfBounds { region, dimensions: dims });
        }

        let decoder = reader(&source.path)?;
        let format = crop_format(decoder.format());
        let img = decoder.decode().map_err(|e| ImageStoreError::Decode {
            path: source.file_path(),
            source: e,
        })?;
        let cropped = img.crop_imm(region.x, region.y, region.w, region.h);
        let cropped = match format {
            ImageFormat::Jpeg => DynamicImage::ImageRgb8(cropped.to_rgb8()),
            _ => cropped,
        };

        let stem = source.path.file_stem().and_then(|s| s.to_str()).unwrap_or("image");
        let ext = format.extensions_str().first().copied().unwrap_or("png");
        let id = format!("{stem}_crop_{}_{}_{}.{ext}", region.x, region.y, short_id());
        let path = self.root.join(&id);
        cropped.save_with_format(&path, format).map_err(|e| ImageStoreError::Encode {
            path: path.to_string_lossy().to_string(),
            source: e,
        })?;
        Ok(ImageReference { id, path, dimensions: Dimensions::new(region.w, region.h) })
    }
}

/// Open `path` with its format sniffed from content; the extension is only a
/// fallback.
fn reader(path: &Path) -> Result<ImageReader<BufReader<File>>, ImageStoreError> {
    Ok(ImageReader::open(path)?.with_guessed_format()?)
}

/// Crops keep JPEG sources as JPEG and store everything else as PNG.
fn crop_format(source: Option<ImageFormat>) -> ImageFormat {
    match source {
        Some(ImageFormat::Jpeg) => ImageFormat::Jpeg,
        _ => ImageFormat::Png,
    }
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

fn sanitize_file_name(name: &str) -> String {
    let base = Path::new(name).file_name().and_then(|n| n.to_str()).unwrap_or("upload");
    let s: String = base
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let s = s.trim_start_matches('.').to_string();
    if s.is_empty() { "upload".into() } else { s }
}
