//! Image loading, hashing, and metadata extraction
//!
//! The only fatal validation in the whole pipeline happens here: an
//! image that cannot be read or is not in a supported format fails the
//! run before Perception begins. Everything downstream degrades
//! instead of failing.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use sdk::errors::GeoError;
use sdk::state::ImageRef;

use crate::llm::ImageAttachment;

pub mod exif;

/// Supported input formats, detected from magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Jpeg,
    Png,
    WebP,
}

impl ImageFormat {
    pub fn media_type(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::WebP => "image/webp",
        }
    }
}

/// A loaded, validated input image.
#[derive(Debug, Clone)]
pub struct ImageFile {
    pub path: Option<PathBuf>,
    pub bytes: Vec<u8>,
    pub format: ImageFormat,
    /// Hex sha256 of the bytes; keys the retrieval cache
    pub content_hash: String,
}

impl ImageFile {
    /// Load and validate an image from disk.
    pub fn load(path: &Path) -> Result<Self, GeoError> {
        let bytes = std::fs::read(path)
            .map_err(|e| GeoError::InvalidImage(format!("{}: {}", path.display(), e)))?;
        let mut image = Self::from_bytes(bytes)?;
        image.path = Some(path.to_path_buf());
        Ok(image)
    }

    /// Validate raw image bytes (HTTP surface input).
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, GeoError> {
        let format = sniff_format(&bytes)
            .ok_or_else(|| GeoError::InvalidImage("unrecognized image format".to_string()))?;
        let content_hash = hex::encode(Sha256::digest(&bytes));
        Ok(Self {
            path: None,
            bytes,
            format,
            content_hash,
        })
    }

    pub fn image_ref(&self) -> ImageRef {
        ImageRef {
            path: self.path.clone(),
            content_hash: self.content_hash.clone(),
        }
    }

    /// Inline attachment for vision model requests.
    pub fn attachment(&self) -> ImageAttachment {
        ImageAttachment::new(self.format.media_type(), &self.bytes)
    }

    /// Best-effort embedded metadata (EXIF GPS, timestamp, camera).
    pub fn metadata(&self) -> exif::ExifMetadata {
        match self.format {
            ImageFormat::Jpeg => exif::extract_metadata(&self.bytes),
            // EXIF extraction is JPEG-only; other formats yield nothing
            _ => exif::ExifMetadata::default(),
        }
    }
}

/// Detect the image format from magic bytes.
fn sniff_format(bytes: &[u8]) -> Option<ImageFormat> {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some(ImageFormat::Jpeg);
    }
    if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        return Some(ImageFormat::Png);
    }
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return Some(ImageFormat::WebP);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sniff_jpeg() {
        assert_eq!(
            sniff_format(&[0xFF, 0xD8, 0xFF, 0xE0, 0x00]),
            Some(ImageFormat::Jpeg)
        );
    }

    #[test]
    fn test_sniff_png() {
        let bytes = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0x00];
        assert_eq!(sniff_format(&bytes), Some(ImageFormat::Png));
    }

    #[test]
    fn test_sniff_webp() {
        let mut bytes = b"RIFF".to_vec();
        bytes.extend_from_slice(&[0, 0, 0, 0]);
        bytes.extend_from_slice(b"WEBP");
        assert_eq!(sniff_format(&bytes), Some(ImageFormat::WebP));
    }

    #[test]
    fn test_sniff_rejects_garbage() {
        assert_eq!(sniff_format(b"not an image"), None);
        assert_eq!(sniff_format(&[]), None);
    }

    #[test]
    fn test_from_bytes_validates() {
        assert!(ImageFile::from_bytes(b"garbage".to_vec()).is_err());

        let image = ImageFile::from_bytes(vec![0xFF, 0xD8, 0xFF, 0xD9]).unwrap();
        assert_eq!(image.format, ImageFormat::Jpeg);
        assert_eq!(image.content_hash.len(), 64);
    }

    #[test]
    fn test_content_hash_is_deterministic() {
        let a = ImageFile::from_bytes(vec![0xFF, 0xD8, 0xFF, 0xD9]).unwrap();
        let b = ImageFile::from_bytes(vec![0xFF, 0xD8, 0xFF, 0xD9]).unwrap();
        assert_eq!(a.content_hash, b.content_hash);
    }

    #[test]
    fn test_load_missing_file_is_invalid_image() {
        let err = ImageFile::load(Path::new("/nonexistent/image.jpg")).unwrap_err();
        assert!(matches!(err, GeoError::InvalidImage(_)));
    }
}
