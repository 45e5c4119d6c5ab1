//! Single-concurrency job queue in front of the transformation service.
//!
//! The coordinator owns every [`JobRecord`]. Admission (pick the earliest
//! queued record and mark it processing) happens under the same lock that
//! guards the collection, so at most one record is ever `Processing`. The
//! external call runs on a spawned task and is folded back in on settle.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::models::job::{ImagePayload, JobRecord, JobStatus, SourceImage, TransitionError};
use crate::services::transform::{TransformError, TransformRequest, TransformationClient};

/// Buffered status changes per subscriber before it starts lagging.
const EVENT_CAPACITY: usize = 1024;

/// Timing knobs. Neither affects correctness, only latency.
#[derive(Debug, Clone, Copy)]
pub struct QueueSettings {
    /// Window in which mutations are coalesced into one admission pass.
    pub debounce: Duration,
    /// Hard limit for one external call.
    pub call_timeout: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            call_timeout: Duration::from_secs(120),
        }
    }
}

/// Rejected queue operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("Job {0} not found")]
    NotFound(Uuid),

    #[error("Job {0} is currently processing")]
    Busy(Uuid),

    #[error("Job {0} has no processed result")]
    NotCompleted(Uuid),

    #[error("Job {0} has a newer result than the one that was edited")]
    Stale(Uuid),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// Rendering view of one record, without image bytes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSummary {
    pub id: Uuid,
    pub display_name: String,
    pub status: JobStatus,
    pub has_guide: bool,
    pub has_result: bool,
    pub failure_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<&JobRecord> for JobSummary {
    fn from(job: &JobRecord) -> Self {
        Self {
            id: job.id(),
            display_name: job.source().display_name.clone(),
            status: job.status(),
            has_guide: job.guide().is_some(),
            has_result: job.result().is_some(),
            failure_reason: job.failure_reason().map(str::to_string),
            updated_at: job.updated_at(),
        }
    }
}

/// One status change, published in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    Status { id: Uuid, status: JobStatus },
    Removed { id: Uuid },
}

/// Counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Default)]
struct QueueState {
    /// Submission order; never reordered, so re-queued records keep their
    /// original place in line.
    records: Vec<JobRecord>,
    in_flight: Option<JoinHandle<()>>,
    scheduler: Option<JoinHandle<()>>,
}

impl QueueState {
    fn find_mut(&mut self, id: Uuid) -> Result<&mut JobRecord, QueueError> {
        self.records
            .iter_mut()
            .find(|job| job.id() == id)
            .ok_or(QueueError::NotFound(id))
    }

    fn stats(&self) -> QueueStats {
        self.records
            .iter()
            .fold(QueueStats::default(), |mut stats, job| {
                match job.status() {
                    JobStatus::Queued => stats.queued += 1,
                    JobStatus::Processing => stats.processing += 1,
                    JobStatus::Completed => stats.completed += 1,
                    JobStatus::Failed => stats.failed += 1,
                }
                stats
            })
    }
}

struct Inner {
    state: Mutex<QueueState>,
    client: Arc<dyn TransformationClient>,
    settings: QueueSettings,
    wake: Notify,
    snapshot: watch::Sender<Vec<JobSummary>>,
    events: broadcast::Sender<QueueEvent>,
}

/// Owns the job collection and drives it through the transformation client.
///
/// Cloning is cheap; all clones share the same queue.
#[derive(Clone)]
pub struct QueueCoordinator {
    inner: Arc<Inner>,
}

impl QueueCoordinator {
    pub fn new(client: Arc<dyn TransformationClient>, settings: QueueSettings) -> Self {
        let (snapshot, _) = watch::channel(Vec::new());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::default()),
                client,
                settings,
                wake: Notify::new(),
                snapshot,
                events,
            }),
        }
    }

    /// Spawn the background admission loop.
    ///
    /// Every mutation and every settle wakes the loop; it then waits out the
    /// debounce window so a burst of changes costs one admission pass.
    pub fn start(&self) {
        let coordinator = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                coordinator.inner.wake.notified().await;
                if !coordinator.inner.settings.debounce.is_zero() {
                    tokio::time::sleep(coordinator.inner.settings.debounce).await;
                }
                coordinator.admit_next();
            }
        });

        if let Some(previous) = self.lock().scheduler.replace(handle) {
            previous.abort();
        }
        // Records submitted before start are picked up right away.
        self.inner.wake.notify_one();
        tracing::info!(
            debounce_ms = self.inner.settings.debounce.as_millis() as u64,
            timeout_secs = self.inner.settings.call_timeout.as_secs(),
            "Queue scheduler started"
        );
    }

    /// Stop the admission loop and abandon any in-flight call.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        if let Some(scheduler) = state.scheduler.take() {
            scheduler.abort();
        }
        if let Some(call) = state.in_flight.take() {
            call.abort();
        }
        tracing::info!("Queue scheduler stopped");
    }

    /// Append one queued record per image, in order. Does not start processing
    /// directly; the admission loop is woken instead.
    pub fn submit(&self, images: Vec<SourceImage>) -> Vec<Uuid> {
        let ids = {
            let mut state = self.lock();
            let ids: Vec<Uuid> = images
                .into_iter()
                .map(|source| {
                    let job = JobRecord::new(source);
                    let id = job.id();
                    tracing::info!(
                        job_id = %id,
                        name = %job.source().display_name,
                        "Job submitted"
                    );
                    state.records.push(job);
                    self.emit(QueueEvent::Status {
                        id,
                        status: JobStatus::Queued,
                    });
                    id
                })
                .collect();
            self.publish(&state);
            ids
        };

        metrics::counter!("clearwell_jobs_submitted_total").increment(ids.len() as u64);
        self.inner.wake.notify_one();
        ids
    }

    /// Put a finished record back in line, optionally with a guide image.
    ///
    /// The result and failure reason are cleared. Rejected while the record is
    /// processing.
    pub fn request_manual_reprocess(
        &self,
        id: Uuid,
        guide: Option<ImagePayload>,
    ) -> Result<(), QueueError> {
        {
            let mut state = self.lock();
            let job = state.find_mut(id)?;
            if job.status() == JobStatus::Processing {
                return Err(QueueError::Busy(id));
            }
            let guided = guide.is_some();
            let previous = job.status();
            job.requeue(guide)?;
            tracing::info!(job_id = %id, guided, "Job re-queued for manual reprocess");
            if previous != JobStatus::Queued {
                self.emit(QueueEvent::Status {
                    id,
                    status: JobStatus::Queued,
                });
            }
            self.publish(&state);
        }

        self.inner.wake.notify_one();
        Ok(())
    }

    /// Delete a record. A call already in flight for it keeps running; its
    /// outcome is dropped when it settles.
    pub fn remove(&self, id: Uuid) -> Result<JobRecord, QueueError> {
        let removed = {
            let mut state = self.lock();
            let index = state
                .records
                .iter()
                .position(|job| job.id() == id)
                .ok_or(QueueError::NotFound(id))?;
            let removed = state.records.remove(index);
            if removed.status() == JobStatus::Processing {
                // Detached: the orphaned call finishes and is discarded.
                state.in_flight = None;
            }
            self.emit(QueueEvent::Removed { id });
            self.publish(&state);
            removed
        };

        tracing::info!(job_id = %id, status = %removed.status(), "Job removed");
        self.inner.wake.notify_one();
        Ok(removed)
    }

    /// Replace a completed record's result, e.g. after a re-touch.
    ///
    /// `based_on` is the result the replacement was derived from. If the
    /// record has been reprocessed since, the replacement is rejected.
    pub fn replace_result(
        &self,
        id: Uuid,
        based_on: &Arc<ImagePayload>,
        result: ImagePayload,
    ) -> Result<(), QueueError> {
        let mut state = self.lock();
        let job = state.find_mut(id)?;
        if job.status() != JobStatus::Completed {
            return Err(QueueError::NotCompleted(id));
        }
        if !job.result().is_some_and(|current| Arc::ptr_eq(current, based_on)) {
            return Err(QueueError::Stale(id));
        }
        job.replace_result(result)?;
        tracing::info!(job_id = %id, "Job result replaced");
        self.publish(&state);
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Option<JobRecord> {
        self.lock()
            .records
            .iter()
            .find(|job| job.id() == id)
            .cloned()
    }

    /// All records in submission order.
    pub fn jobs(&self) -> Vec<JobRecord> {
        self.lock().records.clone()
    }

    pub fn stats(&self) -> QueueStats {
        self.lock().stats()
    }

    /// Receiver that observes every change to the collection.
    pub fn subscribe(&self) -> watch::Receiver<Vec<JobSummary>> {
        self.inner.snapshot.subscribe()
    }

    /// Receiver of every status change, unlike [`subscribe`](Self::subscribe)
    /// which only keeps the latest snapshot.
    pub fn events(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// One admission pass.
    ///
    /// Does nothing while any record is processing. Otherwise marks the
    /// earliest queued record as processing and dispatches it. Returns the
    /// admitted id.
    pub fn admit_next(&self) -> Option<Uuid> {
        let mut state = self.lock();
        if state
            .records
            .iter()
            .any(|job| job.status() == JobStatus::Processing)
        {
            return None;
        }

        let job = state
            .records
            .iter_mut()
            .find(|job| job.status() == JobStatus::Queued)?;
        let guide = match job.begin_processing() {
            Ok(guide) => guide,
            Err(e) => {
                tracing::error!(job_id = %job.id(), error = %e, "Admission rejected");
                return None;
            }
        };

        let id = job.id();
        let request = TransformRequest {
            source: job.source().payload.clone(),
            guide: guide.map(Arc::unwrap_or_clone),
        };
        tracing::info!(
            job_id = %id,
            attempt = job.attempts(),
            guided = request.guide.is_some(),
            "Job admitted"
        );

        let coordinator = self.clone();
        state.in_flight = Some(tokio::spawn(async move {
            let outcome = AssertUnwindSafe(coordinator.call(request))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    tracing::error!(job_id = %id, "Transformation client panicked");
                    Err(TransformError::Crashed)
                });
            coordinator.settle(id, outcome);
        }));
        self.emit(QueueEvent::Status {
            id,
            status: JobStatus::Processing,
        });
        self.publish(&state);
        Some(id)
    }

    async fn call(&self, request: TransformRequest) -> Result<ImagePayload, TransformError> {
        let limit = self.inner.settings.call_timeout;
        match tokio::time::timeout(limit, self.inner.client.transform(request)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(TransformError::Timeout(limit)),
        }
    }

    /// Fold a finished call back into its record and wake the admission loop.
    fn settle(&self, id: Uuid, outcome: Result<ImagePayload, TransformError>) {
        self.fold_outcome(id, outcome);
        self.inner.wake.notify_one();
    }

    fn fold_outcome(&self, id: Uuid, outcome: Result<ImagePayload, TransformError>) {
        let mut state = self.lock();
        let Ok(job) = state.find_mut(id) else {
            tracing::info!(job_id = %id, "Discarding result for removed job");
            metrics::counter!("clearwell_jobs_discarded_total").increment(1);
            return;
        };

        let folded = match outcome {
            Ok(result) => {
                let mime = result.mime_type.clone();
                job.complete(result).map(|()| {
                    tracing::info!(job_id = %id, mime = %mime, "Job completed");
                    metrics::counter!("clearwell_jobs_completed_total").increment(1);
                    JobStatus::Completed
                })
            }
            Err(e) => job.fail(e.failure_reason()).map(|()| {
                tracing::warn!(job_id = %id, error = %e, "Job failed");
                metrics::counter!("clearwell_jobs_failed_total").increment(1);
                JobStatus::Failed
            }),
        };
        match folded {
            Ok(status) => self.emit(QueueEvent::Status { id, status }),
            Err(e) => tracing::error!(job_id = %id, error = %e, "Settle rejected"),
        }

        state.in_flight = None;
        self.publish(&state);
    }

    fn publish(&self, state: &QueueState) {
        let summaries: Vec<JobSummary> = state.records.iter().map(JobSummary::from).collect();
        metrics::gauge!("clearwell_queue_depth").set(state.stats().queued as f64);
        self.inner.snapshot.send_replace(summaries);
    }

    fn emit(&self, event: QueueEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Client whose calls never finish.
    struct Stalled;

    #[async_trait]
    impl TransformationClient for Stalled {
        async fn transform(&self, _: TransformRequest) -> Result<ImagePayload, TransformError> {
            std::future::pending().await
        }
    }

    /// Client that panics on every call.
    struct Panicking;

    #[async_trait]
    impl TransformationClient for Panicking {
        async fn transform(&self, _: TransformRequest) -> Result<ImagePayload, TransformError> {
            panic!("client bug")
        }
    }

    fn source(name: &str) -> SourceImage {
        SourceImage {
            payload: ImagePayload::new(vec![1], "image/png"),
            display_name: name.to_string(),
            width: 1,
            height: 1,
        }
    }

    fn coordinator() -> QueueCoordinator {
        QueueCoordinator::new(Arc::new(Stalled), QueueSettings::default())
    }

    #[tokio::test]
    async fn admission_is_fifo_and_single() {
        let queue = coordinator();
        let ids = queue.submit(vec![source("a"), source("b"), source("c")]);

        assert_eq!(queue.admit_next(), Some(ids[0]));
        assert_eq!(queue.admit_next(), None);
        assert_eq!(
            queue.stats(),
            QueueStats {
                queued: 2,
                processing: 1,
                completed: 0,
                failed: 0,
            }
        );
    }

    #[tokio::test]
    async fn removing_processing_job_frees_the_slot() {
        let queue = coordinator();
        let ids = queue.submit(vec![source("a"), source("b")]);
        queue.admit_next();

        queue.remove(ids[0]).unwrap();
        assert_eq!(queue.admit_next(), Some(ids[1]));
        assert_eq!(queue.jobs().len(), 1);
    }

    #[tokio::test]
    async fn reprocess_is_rejected_while_processing() {
        let queue = coordinator();
        let ids = queue.submit(vec![source("a")]);
        queue.admit_next();

        assert_eq!(
            queue.request_manual_reprocess(ids[0], None),
            Err(QueueError::Busy(ids[0]))
        );
        assert_eq!(queue.get(ids[0]).unwrap().status(), JobStatus::Processing);
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let queue = coordinator();
        let missing = Uuid::new_v4();
        assert_eq!(queue.remove(missing).unwrap_err(), QueueError::NotFound(missing));
        let based_on = Arc::new(ImagePayload::new(vec![], "image/png"));
        assert_eq!(
            queue.replace_result(missing, &based_on, ImagePayload::new(vec![], "image/png")),
            Err(QueueError::NotFound(missing))
        );
        assert!(queue.get(missing).is_none());
    }

    #[tokio::test]
    async fn panicking_client_fails_the_job_and_frees_the_slot() {
        let queue = QueueCoordinator::new(Arc::new(Panicking), QueueSettings::default());
        let ids = queue.submit(vec![source("a"), source("b")]);
        let mut rx = queue.subscribe();

        assert_eq!(queue.admit_next(), Some(ids[0]));
        tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|jobs| jobs[0].status == JobStatus::Failed),
        )
        .await
        .unwrap()
        .unwrap();

        let failed = queue.get(ids[0]).unwrap();
        assert_eq!(
            failed.failure_reason(),
            Some(crate::services::transform::GENERIC_FAILURE)
        );
        assert_eq!(queue.admit_next(), Some(ids[1]));
    }

    #[tokio::test]
    async fn events_follow_every_transition() {
        let queue = coordinator();
        let mut events = queue.events();
        let ids = queue.submit(vec![source("a")]);
        queue.admit_next();
        queue.remove(ids[0]).unwrap();

        let id = ids[0];
        assert_eq!(
            events.try_recv().unwrap(),
            QueueEvent::Status {
                id,
                status: JobStatus::Queued
            }
        );
        assert_eq!(
            events.try_recv().unwrap(),
            QueueEvent::Status {
                id,
                status: JobStatus::Processing
            }
        );
        assert_eq!(events.try_recv().unwrap(), QueueEvent::Removed { id });
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn snapshot_tracks_mutations() {
        let queue = coordinator();
        let rx = queue.subscribe();
        let ids = queue.submit(vec![source("a"), source("b")]);
        assert_eq!(rx.borrow().len(), 2);
        assert_eq!(rx.borrow()[0].display_name, "a");

        queue.admit_next();
        assert_eq!(rx.borrow()[0].status, JobStatus::Processing);

        queue.remove(ids[1]).unwrap();
        assert_eq!(rx.borrow().len(), 1);
    }
}
