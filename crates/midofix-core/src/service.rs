//! Service lifecycle
//!
//! Owns the shared clients and sequences startup and shutdown:
//!
//! ```text
//! Created ──connect store, start bus──► Running ──signal──► Stopping ──► Stopped
//!                                                              │
//!                                  stop bus → drain workers → close store
//! ```
//!
//! The bus is stopped before the store is closed so that no reconciliation
//! starts against a closing store session.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{error, info, warn};

use crate::config::{ListenerConfig, ReconcilerConfig};
use crate::error::{Error, Result};
use crate::listener::{ListenerEvent, NotificationListener};
use crate::reconciler::Reconciler;
use crate::traits::{CoordinationStore, NetworkDirectory, NotificationSource};

/// Lifecycle state of the service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Constructed, nothing connected
    Created,
    /// Store connected, bus subscribed, consuming notifications
    Running,
    /// Shutting down
    Stopping,
    /// Bus stopped and store closed
    Stopped,
}

/// The mido-fixer service
pub struct Service {
    store: Arc<dyn CoordinationStore>,
    source: Arc<dyn NotificationSource>,
    listener: NotificationListener,
    state: watch::Sender<ServiceState>,
}

impl Service {
    /// Create a new service from its collaborators
    ///
    /// # Returns
    ///
    /// A tuple of (service, event_receiver) where event_receiver yields listener events
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        directory: Arc<dyn NetworkDirectory>,
        source: Arc<dyn NotificationSource>,
        reconciler_config: &ReconcilerConfig,
        listener_config: &ListenerConfig,
    ) -> Result<(Self, mpsc::Receiver<ListenerEvent>)> {
        reconciler_config.validate()?;

        let reconciler = Reconciler::new(directory, Arc::clone(&store), reconciler_config.layout())
            .with_dry_run(reconciler_config.dry_run);
        let (listener, events) =
            NotificationListener::new(Arc::clone(&source), Arc::new(reconciler), listener_config)?;
        let (state, _) = watch::channel(ServiceState::Created);

        Ok((
            Self {
                store,
                source,
                listener,
                state,
            },
            events,
        ))
    }

    /// Current lifecycle state
    pub fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions
    pub fn subscribe(&self) -> watch::Receiver<ServiceState> {
        self.state.subscribe()
    }

    /// Run until SIGINT or SIGTERM
    ///
    /// # Returns
    ///
    /// - `Ok(())`: Clean shutdown
    /// - `Err(Error)`: Startup failed, or the bus went away
    pub async fn run(&self) -> Result<()> {
        self.run_internal(shutdown_signal()).await
    }

    /// Run until the given oneshot fires (or its sender is dropped)
    ///
    /// Embedders and tests use this instead of OS signals.
    pub async fn run_with_shutdown(&self, shutdown_rx: oneshot::Receiver<()>) -> Result<()> {
        self.run_internal(async {
            let _ = shutdown_rx.await;
        })
        .await
    }

    async fn run_internal<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        self.start().await?;

        info!("Waiting for notifications");
        let result = self.listener.run_until(shutdown).await;
        if let Err(ref e) = result {
            error!("Listener stopped unexpectedly: {}", e);
        }

        self.stop().await;
        result
    }

    /// Connect the store and start the bus subscription
    ///
    /// Either failure aborts startup; a connected store is closed again if
    /// the bus cannot be started.
    pub async fn start(&self) -> Result<()> {
        if self.state() != ServiceState::Created {
            return Err(Error::Other(format!(
                "service cannot start from state {:?}",
                self.state()
            )));
        }

        info!("Connecting to {} store", self.store.store_name());
        self.store.connect().await?;

        info!("Subscribing to {} notifications", self.source.source_name());
        if let Err(e) = self.source.start().await {
            if let Err(close_err) = self.store.close().await {
                warn!("Failed to close store after bus startup failure: {}", close_err);
            }
            return Err(e);
        }

        self.state.send_replace(ServiceState::Running);
        Ok(())
    }

    /// Stop the bus, drain the workers, close the store
    ///
    /// Errors are logged; shutdown always runs to completion.
    pub async fn stop(&self) {
        if self.state() != ServiceState::Running {
            return;
        }

        info!("Stopping agent");
        self.state.send_replace(ServiceState::Stopping);

        if let Err(e) = self.source.stop().await {
            warn!("Failed to stop {} subscription: {}", self.source.source_name(), e);
        }

        self.listener.drain().await;

        if let Err(e) = self.store.close().await {
            warn!("Failed to close {} store: {}", self.store.store_name(), e);
        }

        self.state.send_replace(ServiceState::Stopped);
        info!("Agent stopped");
    }
}

/// Wait for SIGTERM or SIGINT
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = sigint.recv() => info!("Received SIGINT"),
                }
                return;
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!("Failed to install signal handlers, falling back to ctrl-c: {}", e);
            }
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received SIGINT"),
        Err(e) => {
            error!("Failed to wait for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
