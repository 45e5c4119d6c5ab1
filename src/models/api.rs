use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::{JobRecord, JobStatus};
use crate::services::compositor::{BrushMode, Stroke};

/// A job as shown to the presentation layer.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobView {
    pub id: Uuid,
    pub display_name: String,
    pub status: JobStatus,
    pub width: u32,
    pub height: u32,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub attempts: u32,
    pub has_guide: bool,
    pub has_result: bool,
    pub result_mime_type: Option<String>,
    pub failure_reason: Option<String>,
}

impl From<&JobRecord> for JobView {
    fn from(job: &JobRecord) -> Self {
        let source = job.source();
        Self {
            id: job.id(),
            display_name: source.display_name.clone(),
            status: job.status(),
            width: source.width,
            height: source.height,
            submitted_at: job.submitted_at(),
            updated_at: job.updated_at(),
            attempts: job.attempts(),
            has_guide: job.guide().is_some(),
            has_result: job.result().is_some(),
            result_mime_type: job.result().map(|r| r.mime_type.clone()),
            failure_reason: job.failure_reason().map(str::to_string),
        }
    }
}

/// A file from a batch upload that did not become a job.
#[derive(Debug, Serialize, Deserialize)]
pub struct RejectedFile {
    pub file_name: String,
    pub reason: String,
}

/// Response after submitting a batch of images.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub accepted: Vec<JobView>,
    pub rejected: Vec<RejectedFile>,
}

/// One brush stroke as drawn in the browser, in source pixel coordinates.
#[derive(Debug, Deserialize, Validate)]
pub struct StrokeRequest {
    #[garde(skip)]
    pub mode: BrushMode,

    #[garde(range(min = 5.0, max = 100.0))]
    pub width: Option<f32>,

    #[garde(length(min = 1))]
    pub points: Vec<(f32, f32)>,
}

impl StrokeRequest {
    pub fn into_stroke(self, default_width: f32) -> Stroke {
        Stroke {
            mode: self.mode,
            width: self.width.unwrap_or(default_width),
            points: self.points,
        }
    }
}

/// Request to re-queue a job, optionally with a hand-drawn region guide.
#[derive(Debug, Default, Deserialize, Validate)]
pub struct ReprocessRequest {
    #[garde(dive)]
    #[serde(default)]
    pub strokes: Vec<StrokeRequest>,
}
