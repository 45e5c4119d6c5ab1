use std::time::Duration;

use async_trait::async_trait;

use crate::models::job::ImagePayload;

/// Instruction sent when the user gave no region guide.
pub const DEFAULT_INSTRUCTION: &str = concat!(
    "Remove all watermarks, text overlays, logos, and copyright stamps from this image. ",
    "Reconstruct the background behind the removed elements seamlessly to look natural. ",
    "Return only the cleaned image."
);

/// Instruction sent alongside a composited guide image.
pub const GUIDED_INSTRUCTION: &str = concat!(
    "The first image is the original. The second image is a region guide: it is the same ",
    "picture with the watermark to remove highlighted in red. Remove everything inside the ",
    "highlighted regions from the first image and reconstruct the background there seamlessly. ",
    "Do not reproduce the red highlight. Return only the cleaned first image."
);

/// Fallback failure text when an error carries no message of its own.
pub const GENERIC_FAILURE: &str = "Processing failed";

/// One call to the watermark-removal service.
#[derive(Debug, Clone)]
pub struct TransformRequest {
    pub source: ImagePayload,
    pub guide: Option<ImagePayload>,
}

impl TransformRequest {
    pub fn instruction(&self) -> &'static str {
        if self.guide.is_some() {
            GUIDED_INSTRUCTION
        } else {
            DEFAULT_INSTRUCTION
        }
    }
}

/// Boundary to the external image transformation service.
///
/// Implementations keep no per-call state; every call is a plain
/// request/response transform.
#[async_trait]
pub trait TransformationClient: Send + Sync {
    async fn transform(&self, request: TransformRequest) -> Result<ImagePayload, TransformError>;
}

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("No image data received from the transformation service")]
    NoImageReturned,

    #[error("{0}")]
    Service(String),

    #[error("Transformation service did not respond within {0:?}")]
    Timeout(Duration),

    /// The client panicked instead of returning.
    #[error("{}", GENERIC_FAILURE)]
    Crashed,
}

impl TransformError {
    /// Human-readable reason stored on a failed job.
    pub fn failure_reason(&self) -> String {
        let message = self.to_string();
        if message.trim().is_empty() {
            GENERIC_FAILURE.to_string()
        } else {
            message
        }
    }
}

impl From<reqwest::Error> for TransformError {
    fn from(err: reqwest::Error) -> Self {
        TransformError::Service(err.to_string())
    }
}
