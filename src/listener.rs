//! Per-job subscriptions to engine notifications.
//!
//! A job owns at most one [`Subscription`] while it is processing. Opening a
//! new one closes the stale handle first and closing is always safe, so the
//! scheduler can detach on every status change away from `Processing`
//! without tracking who attached.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::engine::{Engine, EngineEvent, EngineEventKind};
use crate::registry::Registry;
use crate::{JobId, Status};

/// Handle to one job's notification subscription.
#[derive(Debug)]
pub struct Subscription {
    job_id: JobId,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl Subscription {
    /// Stops delivery; the forwarding task exits on its next poll.
    pub fn close(self) -> JoinHandle<()> {
        trace!(message = "Closing subscription", job_id = %self.job_id);
        self.token.cancel();
        self.task
    }
}

struct Inner {
    registry: Registry,
    engine: Arc<dyn Engine>,
    subscriptions: Mutex<HashMap<JobId, Subscription>>,
    cancelled: Mutex<HashSet<JobId>>,
}

#[derive(Clone)]
pub struct ListenerManager {
    inner: Arc<Inner>,
}

impl ListenerManager {
    pub fn new(registry: Registry, engine: Arc<dyn Engine>) -> Self {
        ListenerManager {
            inner: Arc::new(Inner {
                registry,
                engine,
                subscriptions: Mutex::new(HashMap::new()),
                cancelled: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Opens the progress/error/cancel subscription for `id`.
    ///
    /// The engine stream is subscribed before returning, so nothing emitted
    /// after `attach` is missed.
    pub fn attach(&self, id: JobId) {
        let mut events = self.inner.engine.events();
        let token = CancellationToken::new();

        let task = {
            let manager = self.clone();
            let token = token.clone();
            tokio::spawn(
                async move {
                    let mut last_progress = None;
                    loop {
                        tokio::select! {
                            biased;
                            _ = token.cancelled() => break,
                            event = events.recv() => match event {
                                Ok(event) if event.job_id == id => {
                                    if token.is_cancelled() {
                                        break;
                                    }
                                    manager.handle(event, &mut last_progress);
                                }
                                Ok(_) => {}
                                Err(RecvError::Lagged(skipped)) => {
                                    warn!(message = "Engine notifications lagged", job_id = %id, skipped);
                                }
                                Err(RecvError::Closed) => {
                                    debug!(message = "Engine notification stream closed", job_id = %id);
                                    break;
                                }
                            },
                        }
                    }
                    trace!(message = "Subscription task stopped", job_id = %id);
                }
                .instrument(info_span!("listener", job_id = %id)),
            )
        };

        let stale = self.inner.subscriptions.lock().insert(
            id,
            Subscription {
                job_id: id,
                token,
                task,
            },
        );
        if let Some(stale) = stale {
            debug!(message = "Replaced stale subscription", job_id = %id);
            stale.close();
        }
        debug!(message = "Attached listener", job_id = %id);
    }

    /// Closes the subscription for `id` if there is one. Once the job is gone
    /// from the registry its cancellation record is dropped too.
    pub fn detach(&self, id: JobId) -> bool {
        if self.inner.registry.status(id).is_none() {
            self.inner.cancelled.lock().remove(&id);
        }
        let subscription = self.inner.subscriptions.lock().remove(&id);
        match subscription {
            Some(subscription) => {
                subscription.close();
                debug!(message = "Detached listener", job_id = %id);
                true
            }
            None => false,
        }
    }

    pub fn is_attached(&self, id: JobId) -> bool {
        self.inner.subscriptions.lock().contains_key(&id)
    }

    pub fn attached(&self) -> Vec<JobId> {
        self.inner.subscriptions.lock().keys().copied().collect()
    }

    /// Detaches every subscription whose job is no longer processing.
    ///
    /// Used after missed registry notifications.
    pub fn reconcile(&self) -> usize {
        let stale: Vec<JobId> = self
            .attached()
            .into_iter()
            .filter(|id| self.inner.registry.status(*id) != Some(Status::Processing))
            .collect();
        for id in &stale {
            self.detach(*id);
        }
        stale.len()
    }

    /// Closes every subscription and waits for the forwarding tasks to exit.
    pub async fn shutdown(&self) {
        let subscriptions: Vec<Subscription> = self
            .inner
            .subscriptions
            .lock()
            .drain()
            .map(|(_, subscription)| subscription)
            .collect();
        let tasks = subscriptions.into_iter().map(Subscription::close);
        for result in join_all(tasks).await {
            if let Err(err) = result {
                error!(message = "Listener task failed", error = ?err);
            }
        }
    }

    fn handle(&self, event: EngineEvent, last_progress: &mut Option<i32>) {
        let id = event.job_id;
        match event.kind {
            EngineEventKind::Progress(percent) => {
                let value = percent.round().clamp(0.0, 100.0) as i32;
                if *last_progress == Some(value) {
                    return;
                }
                *last_progress = Some(value);
                if let Some(progress) = self.inner.registry.advance_progress(id, value) {
                    trace!(message = "Progress", job_id = %id, progress);
                }
            }
            EngineEventKind::Error { message, detail } => {
                error!(message = "Engine reported error", job_id = %id, error = %message, detail = ?detail);
            }
            EngineEventKind::Cancelled => {
                if !self.inner.cancelled.lock().insert(id) {
                    debug!(message = "Ignoring repeated cancellation", job_id = %id);
                    return;
                }
                info!(message = "Engine cancelled job", job_id = %id);
                self.inner.registry.set_status(id, Status::Cancelled);
                self.detach(id);
            }
            EngineEventKind::Command(command) => {
                info!(target: "compq::audit", message = "Engine command", job_id = %id, command = %command);
            }
        }
    }
}
