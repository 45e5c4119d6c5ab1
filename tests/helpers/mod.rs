//! Test helper utilities: a scripted transformation client and queue waits.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clearwell::models::job::{ImagePayload, JobRecord};
use clearwell::services::queue::{JobSummary, QueueCoordinator, QueueSettings};
use clearwell::services::transform::{TransformError, TransformRequest, TransformationClient};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);

/// One outstanding call to the fake service; the test decides how it ends.
pub struct PendingCall {
    pub request: TransformRequest,
    respond: oneshot::Sender<Result<ImagePayload, TransformError>>,
}

impl PendingCall {
    pub fn succeed(self, image: ImagePayload) {
        let _ = self.respond.send(Ok(image));
    }

    pub fn fail(self, err: TransformError) {
        let _ = self.respond.send(Err(err));
    }

    /// Source bytes identify which job the call belongs to.
    pub fn tag(&self) -> u8 {
        self.request.source.bytes[0]
    }
}

/// Client that forwards every call to the test over a channel.
pub struct ScriptedClient {
    calls: mpsc::UnboundedSender<PendingCall>,
}

#[async_trait]
impl TransformationClient for ScriptedClient {
    async fn transform(&self, request: TransformRequest) -> Result<ImagePayload, TransformError> {
        let (respond, outcome) = oneshot::channel();
        self.calls
            .send(PendingCall { request, respond })
            .map_err(|_| TransformError::Service("test harness closed".to_string()))?;
        outcome
            .await
            .map_err(|_| TransformError::Service("call dropped by test".to_string()))?
    }
}

pub struct Harness {
    pub queue: QueueCoordinator,
    pub calls: mpsc::UnboundedReceiver<PendingCall>,
}

impl Harness {
    pub fn new(settings: QueueSettings) -> Self {
        let (tx, calls) = mpsc::unbounded_channel();
        let queue = QueueCoordinator::new(Arc::new(ScriptedClient { calls: tx }), settings);
        Self { queue, calls }
    }

    /// Short debounce and timeout so scheduler-driven tests run fast.
    pub fn fast() -> Self {
        Self::new(QueueSettings {
            debounce: Duration::from_millis(10),
            call_timeout: Duration::from_secs(5),
        })
    }

    pub async fn next_call(&mut self) -> PendingCall {
        timeout(WAIT, self.calls.recv())
            .await
            .expect("no call reached the service in time")
            .expect("client channel closed")
    }

    /// Assert that no call arrives within `window`.
    pub async fn expect_no_call(&mut self, window: Duration) {
        if let Ok(Some(call)) = timeout(window, self.calls.recv()).await {
            panic!("unexpected call for source tag {}", call.tag());
        }
    }

    /// Wait until the queue snapshot satisfies `predicate`.
    pub async fn wait_for<F>(&self, predicate: F)
    where
        F: FnMut(&Vec<JobSummary>) -> bool,
    {
        let mut rx = self.queue.subscribe();
        timeout(WAIT, rx.wait_for(predicate))
            .await
            .expect("queue did not reach the expected state in time")
            .expect("queue dropped");
    }

    pub fn job(&self, id: Uuid) -> JobRecord {
        self.queue.get(id).expect("job exists")
    }
}
