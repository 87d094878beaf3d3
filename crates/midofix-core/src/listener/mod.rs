//! Notification listener
//!
//! The NotificationListener is responsible for:
//! - Consuming notifications from a NotificationSource
//! - Extracting the port id from the event traits
//! - Acknowledging every notification as handled
//! - Scheduling a settle-delayed reconciliation on a bounded worker pool
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────┐
//! │ NotificationSource │─── Notification ───┐
//! └────────────────────┘                    │
//!          ▲                                ▼
//!          │ acknowledge(Handled)   ┌──────────────────────┐
//!          └────────────────────────│ NotificationListener │
//!                                   └──────────────────────┘
//!                                              │ Job { port_id, not_before }
//!                                              ▼
//!                                   ┌──────────────────────┐
//!                                   │  bounded job queue   │
//!                                   └──────────────────────┘
//!                                     │        │        │
//!                                     ▼        ▼        ▼
//!                                  worker   worker   worker ── sleep_until ── Reconciler
//! ```
//!
//! ## Event Flow
//!
//! 1. Notification received
//! 2. Traits extracted; malformed payloads are logged and dropped
//! 3. Job queued with a deadline of `now + settle_delay`
//! 4. Notification acknowledged (before the delay elapses)
//! 5. A worker waits for the deadline, then reconciles
//! 6. Outcome emitted as a [`ListenerEvent`]

pub mod payload;

pub use payload::EventTraits;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use crate::config::ListenerConfig;
use crate::error::{Error, Result};
use crate::reconciler::{ReconcileOutcome, Reconciler};
use crate::traits::{Notification, NotificationResult, NotificationSource};

/// Events emitted by the NotificationListener
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    /// Listener started consuming notifications
    Started {
        workers: usize,
    },

    /// Notification skipped by the event type filter
    NotificationIgnored {
        event_type: String,
    },

    /// Notification payload could not be interpreted
    NotificationRejected {
        delivery_tag: u64,
        reason: String,
    },

    /// Reconciliation queued
    ReconcileScheduled {
        port_id: String,
    },

    /// Reconciliation dropped (queue full or listener stopping)
    ReconcileDropped {
        port_id: String,
    },

    /// Reconciliation finished
    ReconcileFinished {
        port_id: String,
        outcome: ReconcileOutcome,
    },

    /// Reconciliation failed
    ReconcileFailed {
        port_id: String,
        error: String,
    },

    /// Listener stopped consuming notifications
    Stopped {
        reason: String,
    },

    /// Worker pool drained
    Drained {
        aborted: usize,
    },
}

/// A pending reconciliation
#[derive(Debug)]
struct Job {
    port_id: String,
    not_before: Instant,
}

/// Turns bus notifications into reconciliations
///
/// ## Lifecycle
///
/// 1. Create with [`NotificationListener::new()`]
/// 2. Consume with [`NotificationListener::run_until()`]
/// 3. Stop the notification source
/// 4. Finish queued work with [`NotificationListener::drain()`]
///
/// A listener runs once; after `drain()` every new job is dropped.
///
/// ## Load Resistance
///
/// - **Bounded job queue**: bursts beyond `queue_capacity` are dropped (logged)
/// - **Fixed worker count**: at most `workers` settle delays and reconciliations run at once
/// - **Bounded event channel**: monitoring events are dropped when nobody reads them
pub struct NotificationListener {
    source: Arc<dyn NotificationSource>,
    reconciler: Arc<Reconciler>,
    settle_delay: Duration,
    worker_count: usize,
    shutdown_grace: Duration,
    event_types: Vec<String>,
    jobs: RwLock<Option<mpsc::Sender<Job>>>,
    pending: Arc<Mutex<mpsc::Receiver<Job>>>,
    workers: Mutex<JoinSet<()>>,
    event_tx: mpsc::Sender<ListenerEvent>,
}

impl NotificationListener {
    /// Create a new listener
    ///
    /// # Returns
    ///
    /// A tuple of (listener, event_receiver) where event_receiver yields listener events
    pub fn new(
        source: Arc<dyn NotificationSource>,
        reconciler: Arc<Reconciler>,
        config: &ListenerConfig,
    ) -> Result<(Self, mpsc::Receiver<ListenerEvent>)> {
        config.validate()?;

        let (job_tx, job_rx) = mpsc::channel(config.queue_capacity);
        let (event_tx, event_rx) = mpsc::channel(config.event_channel_capacity);

        let listener = Self {
            source,
            reconciler,
            settle_delay: config.settle_delay(),
            worker_count: config.workers,
            shutdown_grace: config.shutdown_grace(),
            event_types: config.event_types.clone(),
            jobs: RwLock::new(Some(job_tx)),
            pending: Arc::new(Mutex::new(job_rx)),
            workers: Mutex::new(JoinSet::new()),
            event_tx,
        };

        Ok((listener, event_rx))
    }

    /// Consume notifications until `shutdown` completes
    ///
    /// Starts the worker pool on first call. The notification source must
    /// already be started.
    ///
    /// # Returns
    ///
    /// - `Ok(())`: `shutdown` completed
    /// - `Err(Error)`: The notification stream ended on its own
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        self.spawn_workers().await;
        emit(&self.event_tx, ListenerEvent::Started {
            workers: self.worker_count,
        });

        let mut notifications = self.source.watch();
        tokio::pin!(shutdown);

        let (reason, result) = loop {
            tokio::select! {
                next = notifications.next() => match next {
                    Some(notification) => self.dispatch(notification).await,
                    None => {
                        break (
                            "Notification stream ended",
                            Err(Error::bus(format!(
                                "{} notification stream ended",
                                self.source.source_name()
                            ))),
                        );
                    }
                },

                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break ("Shutdown signal", Ok(()));
                }
            }
        };

        emit(&self.event_tx, ListenerEvent::Stopped {
            reason: reason.to_string(),
        });
        result
    }

    /// Handle a single notification
    ///
    /// Always returns [`NotificationResult::Handled`]: a notification that
    /// cannot be acted on is logged, never redelivered.
    pub async fn handle(&self, notification: &Notification) -> NotificationResult {
        match self.extract_port_id(notification) {
            Ok(Some(port_id)) => self.schedule(port_id).await,
            Ok(None) => {}
            Err(e) => {
                warn!(
                    "Unable to handle notification: {} (payload: {})",
                    e, notification.payload
                );
                emit(&self.event_tx, ListenerEvent::NotificationRejected {
                    delivery_tag: notification.delivery_tag,
                    reason: e.to_string(),
                });
            }
        }

        NotificationResult::Handled
    }

    /// Close the job queue and wait for the workers to finish
    ///
    /// Queued reconciliations still run. Workers that have not finished
    /// within the shutdown grace period are aborted.
    pub async fn drain(&self) {
        self.jobs.write().await.take();

        let mut workers = self.workers.lock().await;
        let drained = tokio::time::timeout(self.shutdown_grace, async {
            while workers.join_next().await.is_some() {}
        })
        .await;

        let aborted = if drained.is_err() {
            let remaining = workers.len();
            warn!(
                "Shutdown grace period of {:?} elapsed, aborting {} worker(s)",
                self.shutdown_grace, remaining
            );
            workers.shutdown().await;
            remaining
        } else {
            0
        };

        debug!("Worker pool drained");
        emit(&self.event_tx, ListenerEvent::Drained { aborted });
    }

    async fn spawn_workers(&self) {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            return;
        }

        for worker in 0..self.worker_count {
            workers.spawn(run_worker(
                worker,
                Arc::clone(&self.pending),
                Arc::clone(&self.reconciler),
                self.event_tx.clone(),
            ));
        }
        debug!("Started {} reconciliation worker(s)", self.worker_count);
    }

    async fn dispatch(&self, notification: Notification) {
        let result = self.handle(&notification).await;
        if let Err(e) = self
            .source
            .acknowledge(notification.delivery_tag, result)
            .await
        {
            warn!(
                "Failed to acknowledge delivery {}: {}",
                notification.delivery_tag, e
            );
        }
    }

    fn extract_port_id(&self, notification: &Notification) -> Result<Option<String>> {
        let traits = EventTraits::from_payload(&notification.payload)?;

        let event_type = traits
            .event_type()
            .unwrap_or(notification.event_type.as_str());
        if !self.accepts(event_type) {
            debug!("Ignoring {} notification", event_type);
            emit(&self.event_tx, ListenerEvent::NotificationIgnored {
                event_type: event_type.to_string(),
            });
            return Ok(None);
        }

        let port_id = traits.resource_id()?;
        debug!("Processing notification for {}", port_id);
        Ok(Some(port_id.to_string()))
    }

    fn accepts(&self, event_type: &str) -> bool {
        self.event_types.is_empty() || self.event_types.iter().any(|t| t == event_type)
    }

    async fn schedule(&self, port_id: String) {
        let job = Job {
            port_id,
            not_before: Instant::now() + self.settle_delay,
        };

        let guard = self.jobs.read().await;
        let Some(jobs) = guard.as_ref() else {
            debug!("Listener stopping, dropping reconciliation for {}", job.port_id);
            emit(&self.event_tx, ListenerEvent::ReconcileDropped {
                port_id: job.port_id,
            });
            return;
        };

        let port_id = job.port_id.clone();
        match jobs.try_send(job) {
            Ok(()) => {
                debug!(
                    "Reconciliation for {} scheduled in {:?}",
                    port_id, self.settle_delay
                );
                emit(&self.event_tx, ListenerEvent::ReconcileScheduled { port_id });
            }
            Err(TrySendError::Full(_)) => {
                warn!(
                    "Reconciliation queue full, dropping reconciliation for {}",
                    port_id
                );
                emit(&self.event_tx, ListenerEvent::ReconcileDropped { port_id });
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Job queue closed, dropping reconciliation for {}", port_id);
                emit(&self.event_tx, ListenerEvent::ReconcileDropped { port_id });
            }
        }
    }
}

/// Worker loop: take a job, wait for its deadline, reconcile
async fn run_worker(
    worker: usize,
    pending: Arc<Mutex<mpsc::Receiver<Job>>>,
    reconciler: Arc<Reconciler>,
    event_tx: mpsc::Sender<ListenerEvent>,
) {
    loop {
        let job = pending.lock().await.recv().await;
        let Some(job) = job else {
            debug!("Worker {} exiting", worker);
            break;
        };

        tokio::time::sleep_until(job.not_before).await;

        let event = match reconciler.reconcile(&job.port_id).await {
            Ok(outcome) => {
                if outcome.deletions() > 0 {
                    info!(
                        "Removed {} stale binding(s) for port {}",
                        outcome.deletions(),
                        job.port_id
                    );
                }
                ListenerEvent::ReconcileFinished {
                    port_id: job.port_id,
                    outcome,
                }
            }
            Err(e) => {
                error!("Unable to reconcile port {}: {}", job.port_id, e);
                ListenerEvent::ReconcileFailed {
                    port_id: job.port_id,
                    error: e.to_string(),
                }
            }
        };

        emit(&event_tx, event);
    }
}

/// Emit a listener event
///
/// Dropped with a warning when the channel is full. A closed channel means
/// nobody is watching and the event is silently discarded.
fn emit(event_tx: &mpsc::Sender<ListenerEvent>, event: ListenerEvent) {
    if let Err(TrySendError::Full(_)) = event_tx.try_send(event) {
        warn!("Listener event channel full, dropping event. Consider increasing event_channel_capacity.");
    }
}
