use image::ImageFormat;

use crate::models::job::{ImagePayload, SourceImage};

/// MIME type assumed when neither the client nor the bytes say otherwise.
const DEFAULT_MIME: &str = "image/png";

/// A file as received from the presentation layer, before validation.
#[derive(Debug, Clone)]
pub struct Upload {
    pub display_name: String,
    pub declared_mime: Option<String>,
    pub bytes: Vec<u8>,
}

/// Per-file rejection. Never affects other files in the same batch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{name} is empty")]
    Empty { name: String },

    #[error("{name} too large ({size} bytes, limit {limit})")]
    TooLarge { name: String, size: usize, limit: usize },

    #[error("{name} is not an image ({mime})")]
    UnsupportedType { name: String, mime: String },

    #[error("{name} could not be decoded: {reason}")]
    Undecodable { name: String, reason: String },
}

impl ValidationError {
    pub fn file_name(&self) -> &str {
        match self {
            ValidationError::Empty { name }
            | ValidationError::TooLarge { name, .. }
            | ValidationError::UnsupportedType { name, .. }
            | ValidationError::Undecodable { name, .. } => name,
        }
    }
}

/// Check one upload and turn it into a [`SourceImage`].
///
/// Checks run cheapest first: emptiness, size, MIME type, then a full decode
/// to learn the pixel dimensions.
pub fn validate_upload(upload: Upload, max_bytes: usize) -> Result<SourceImage, ValidationError> {
    let name = upload.display_name;

    if upload.bytes.is_empty() {
        return Err(ValidationError::Empty { name });
    }

    if upload.bytes.len() > max_bytes {
        return Err(ValidationError::TooLarge {
            name,
            size: upload.bytes.len(),
            limit: max_bytes,
        });
    }

    let sniffed = image::guess_format(&upload.bytes).ok();
    let mime = upload
        .declared_mime
        .filter(|m| !m.trim().is_empty() && m != "application/octet-stream")
        .or_else(|| sniffed.map(|f| f.to_mime_type().to_string()))
        .unwrap_or_else(|| DEFAULT_MIME.to_string());

    if !mime.starts_with("image/") {
        return Err(ValidationError::UnsupportedType { name, mime });
    }

    let decoded = image::load_from_memory(&upload.bytes).map_err(|e| {
        ValidationError::Undecodable {
            name: name.clone(),
            reason: e.to_string(),
        }
    })?;

    Ok(SourceImage {
        width: decoded.width(),
        height: decoded.height(),
        payload: ImagePayload::new(upload.bytes, mime),
        display_name: name,
    })
}

/// Encoder format for a MIME type, if this crate can write it.
pub fn writable_format(mime: &str) -> Option<ImageFormat> {
    match ImageFormat::from_mime_type(mime)? {
        format @ (ImageFormat::Png | ImageFormat::Jpeg) => Some(format),
        _ => None,
    }
}
