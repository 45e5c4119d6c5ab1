use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;
use uuid::Uuid;

/// Status of a watermark-removal job in the queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

/// Encoded image bytes together with their MIME type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePayload {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl ImagePayload {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes,
            mime_type: mime_type.into(),
        }
    }
}

/// An accepted upload. Immutable for the lifetime of its job.
#[derive(Debug, Clone)]
pub struct SourceImage {
    pub payload: ImagePayload,
    pub display_name: String,
    pub width: u32,
    pub height: u32,
}

/// Rejected status change on a [`JobRecord`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition {from} -> {to}")]
pub struct TransitionError {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// One image's journey through the pipeline.
///
/// Status only changes through the transition methods below, which reject
/// anything outside `queued -> processing -> {completed | failed}` and the
/// manual `{completed | failed} -> queued` re-submission.
#[derive(Debug, Clone)]
pub struct JobRecord {
    id: Uuid,
    source: Arc<SourceImage>,
    status: JobStatus,
    guide: Option<Arc<ImagePayload>>,
    result: Option<Arc<ImagePayload>>,
    failure_reason: Option<String>,
    attempts: u32,
    submitted_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(source: SourceImage) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            source: Arc::new(source),
            status: JobStatus::Queued,
            guide: None,
            result: None,
            failure_reason: None,
            attempts: 0,
            submitted_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn source(&self) -> &Arc<SourceImage> {
        &self.source
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn guide(&self) -> Option<&Arc<ImagePayload>> {
        self.guide.as_ref()
    }

    pub fn result(&self) -> Option<&Arc<ImagePayload>> {
        self.result.as_ref()
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    /// Number of times this record has been admitted into processing.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Admit the record and hand over its guide. A guide only exists while
    /// the record is queued.
    pub(crate) fn begin_processing(
        &mut self,
    ) -> Result<Option<Arc<ImagePayload>>, TransitionError> {
        self.expect_status(&[JobStatus::Queued], JobStatus::Processing)?;
        self.status = JobStatus::Processing;
        self.attempts += 1;
        self.touch();
        Ok(self.guide.take())
    }

    pub(crate) fn complete(&mut self, result: ImagePayload) -> Result<(), TransitionError> {
        self.expect_status(&[JobStatus::Processing], JobStatus::Completed)?;
        self.status = JobStatus::Completed;
        self.result = Some(Arc::new(result));
        self.failure_reason = None;
        self.touch();
        Ok(())
    }

    pub(crate) fn fail(&mut self, reason: String) -> Result<(), TransitionError> {
        self.expect_status(&[JobStatus::Processing], JobStatus::Failed)?;
        self.status = JobStatus::Failed;
        self.failure_reason = Some(reason);
        self.touch();
        Ok(())
    }

    /// Manual re-submission. A record already waiting in the queue only has
    /// its guide replaced.
    pub(crate) fn requeue(&mut self, guide: Option<ImagePayload>) -> Result<(), TransitionError> {
        self.expect_status(
            &[JobStatus::Queued, JobStatus::Completed, JobStatus::Failed],
            JobStatus::Queued,
        )?;
        self.status = JobStatus::Queued;
        self.guide = guide.map(Arc::new);
        self.result = None;
        self.failure_reason = None;
        self.touch();
        Ok(())
    }

    /// Swap the processed image for a re-touched one.
    pub(crate) fn replace_result(&mut self, result: ImagePayload) -> Result<(), TransitionError> {
        self.expect_status(&[JobStatus::Completed], JobStatus::Completed)?;
        self.result = Some(Arc::new(result));
        self.touch();
        Ok(())
    }

    fn expect_status(&self, allowed: &[JobStatus], to: JobStatus) -> Result<(), TransitionError> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(TransitionError {
                from: self.status,
                to,
            })
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> JobRecord {
        JobRecord::new(SourceImage {
            payload: ImagePayload::new(vec![1, 2, 3], "image/png"),
            display_name: "photo.png".to_string(),
            width: 4,
            height: 4,
        })
    }

    #[test]
    fn new_record_is_queued_without_outputs() {
        let job = record();
        assert_eq!(job.status(), JobStatus::Queued);
        assert!(job.result().is_none());
        assert!(job.guide().is_none());
        assert!(job.failure_reason().is_none());
        assert_eq!(job.attempts(), 0);
    }

    #[test]
    fn happy_path_reaches_completed() {
        let mut job = record();
        job.begin_processing().unwrap();
        assert_eq!(job.status(), JobStatus::Processing);
        assert_eq!(job.attempts(), 1);

        job.complete(ImagePayload::new(vec![9], "image/jpeg")).unwrap();
        assert_eq!(job.status(), JobStatus::Completed);
        assert_eq!(job.result().unwrap().mime_type, "image/jpeg");
    }

    #[test]
    fn queued_cannot_skip_to_terminal_states() {
        let mut job = record();
        let err = job.complete(ImagePayload::new(vec![], "image/png")).unwrap_err();
        assert_eq!(err.from, JobStatus::Queued);
        assert_eq!(err.to, JobStatus::Completed);
        assert!(job.fail("nope".to_string()).is_err());
        assert_eq!(job.status(), JobStatus::Queued);
    }

    #[test]
    fn processing_cannot_be_requeued_or_admitted_twice() {
        let mut job = record();
        job.begin_processing().unwrap();
        assert!(job.begin_processing().is_err());
        assert!(job.requeue(None).is_err());
        assert_eq!(job.status(), JobStatus::Processing);
    }

    #[test]
    fn requeue_after_failure_clears_outputs_and_attaches_guide() {
        let mut job = record();
        job.begin_processing().unwrap();
        job.fail("service unavailable".to_string()).unwrap();
        assert_eq!(job.failure_reason(), Some("service unavailable"));

        job.requeue(Some(ImagePayload::new(vec![7], "image/png"))).unwrap();
        assert_eq!(job.status(), JobStatus::Queued);
        assert!(job.failure_reason().is_none());
        assert!(job.result().is_none());
        assert_eq!(job.guide().unwrap().bytes, vec![7]);
    }

    #[test]
    fn admission_consumes_guide() {
        let mut job = record();
        job.begin_processing().unwrap();
        job.complete(ImagePayload::new(vec![1], "image/png")).unwrap();
        job.requeue(Some(ImagePayload::new(vec![2], "image/png"))).unwrap();
        assert!(job.result().is_none());

        let guide = job.begin_processing().unwrap();
        assert_eq!(guide.map(|g| g.bytes.clone()), Some(vec![2]));
        assert!(job.guide().is_none());
        job.complete(ImagePayload::new(vec![3], "image/png")).unwrap();
        assert!(job.guide().is_none());
        assert_eq!(job.attempts(), 2);
    }

    #[test]
    fn failed_guided_retry_keeps_no_guide() {
        let mut job = record();
        job.begin_processing().unwrap();
        job.fail("first".to_string()).unwrap();
        job.requeue(Some(ImagePayload::new(vec![9], "image/png"))).unwrap();

        job.begin_processing().unwrap();
        job.fail("second".to_string()).unwrap();
        assert_eq!(job.status(), JobStatus::Failed);
        assert!(job.guide().is_none());
    }

    #[test]
    fn replace_result_requires_completed() {
        let mut job = record();
        assert!(job.replace_result(ImagePayload::new(vec![1], "image/png")).is_err());

        job.begin_processing().unwrap();
        job.complete(ImagePayload::new(vec![1], "image/png")).unwrap();
        job.replace_result(ImagePayload::new(vec![2], "image/png")).unwrap();
        assert_eq!(job.result().unwrap().bytes, vec![2]);
    }

    #[test]
    fn status_display_matches_wire_format() {
        assert_eq!(JobStatus::Processing.to_string(), "processing");
        assert_eq!(
            serde_json::to_string(&JobStatus::Completed).unwrap(),
            "\"completed\""
        );
    }
}
