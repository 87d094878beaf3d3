// # ZooKeeper Coordination Store
//
// This crate provides the ZooKeeper-backed CoordinationStore used to reach
// MidoNet's ARP tables.
//
// ## Session Handling
//
// - One session per process, opened by `connect()` and dropped by `close()`
// - The session is shared by every concurrent reconciliation
// - A session that expired or was closed by the server is discarded; the
//   next operation opens a fresh one
// - Operations issued before `connect()` or after `close()` fail with a store error
//
// ## Error Mapping
//
// | ZooKeeper error                               | Operation      | Result                          |
// |-----------------------------------------------|----------------|---------------------------------|
// | `NoNode`                                      | list children  | `Ok(None)`                      |
// | `NoNode`                                      | delete         | `Ok(DeleteOutcome::Absent)`     |
// | `SessionExpired`, `ClientClosed`, `AuthFailed`| any            | `Err(Error::Store)`, new session next time |
// | anything else                                 | any            | `Err(Error::Store)`             |

use async_trait::async_trait;
use midofix_core::config::StoreConfig;
use midofix_core::traits::{CoordinationStore, DeleteOutcome};
use midofix_core::{Error, Result};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Session slot of the store
enum Slot {
    /// Never connected, or closed
    Idle,
    /// Usable session; `generation` tells replaced sessions apart
    Connected {
        generation: u64,
        client: zookeeper_client::Client,
    },
    /// The session ended on the server side and is reopened on demand
    Expired { generation: u64 },
}

/// Failure of a single ZooKeeper call
#[derive(Debug)]
enum CallError {
    /// The session can no longer be used
    SessionLost(Error),
    Other(Error),
}

impl From<CallError> for Error {
    fn from(err: CallError) -> Self {
        match err {
            CallError::SessionLost(e) | CallError::Other(e) => e,
        }
    }
}

/// ZooKeeper coordination store
pub struct ZooKeeperStore {
    hosts: String,
    session_timeout: Duration,
    slot: RwLock<Slot>,
}

impl std::fmt::Debug for ZooKeeperStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZooKeeperStore")
            .field("hosts", &self.hosts)
            .field("session_timeout", &self.session_timeout)
            .finish()
    }
}

impl ZooKeeperStore {
    /// Create a store for the given ensemble; no session is opened yet
    pub fn new(config: &StoreConfig) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            hosts: config.hosts.clone(),
            session_timeout: Duration::from_secs(config.session_timeout_secs),
            slot: RwLock::new(Slot::Idle),
        })
    }

    async fn open(&self) -> Result<zookeeper_client::Client> {
        let mut connector = zookeeper_client::Client::connector();
        connector.session_timeout(self.session_timeout);
        connector
            .connect(&self.hosts)
            .await
            .map_err(|e| Error::store(format!("failed to connect to {}: {}", self.hosts, e)))
    }

    /// Current session, reopening it if the previous one expired
    async fn client(&self) -> Result<(u64, zookeeper_client::Client)> {
        if let Slot::Connected { generation, client } = &*self.slot.read().await {
            return Ok((*generation, client.clone()));
        }

        let mut slot = self.slot.write().await;
        match &*slot {
            Slot::Connected { generation, client } => Ok((*generation, client.clone())),
            Slot::Idle => Err(Error::store(format!(
                "not connected to ZooKeeper at {}",
                self.hosts
            ))),
            Slot::Expired { generation } => {
                let generation = generation + 1;
                let client = self.open().await?;
                info!("Re-established ZooKeeper session to {}", self.hosts);
                *slot = Slot::Connected {
                    generation,
                    client: client.clone(),
                };
                Ok((generation, client))
            }
        }
    }

    /// Pass a call result through, discarding the session it ran on if
    /// the session is gone
    async fn settle<T>(
        &self,
        generation: u64,
        result: std::result::Result<T, CallError>,
    ) -> Result<T> {
        if let Err(CallError::SessionLost(ref e)) = result {
            let mut slot = self.slot.write().await;
            if matches!(&*slot, Slot::Connected { generation: current, .. } if *current == generation)
            {
                warn!("Discarding ZooKeeper session: {}", e);
                *slot = Slot::Expired { generation };
            }
        }
        result.map_err(Error::from)
    }
}

#[async_trait]
impl CoordinationStore for ZooKeeperStore {
    async fn connect(&self) -> Result<()> {
        let mut slot = self.slot.write().await;
        let generation = match &*slot {
            Slot::Connected { .. } => return Ok(()),
            Slot::Idle => 0,
            Slot::Expired { generation } => generation + 1,
        };

        let client = self.open().await?;
        info!("Connected to ZooKeeper at {}", self.hosts);
        *slot = Slot::Connected { generation, client };
        Ok(())
    }

    async fn list_children(&self, path: &str) -> Result<Option<Vec<String>>> {
        let (generation, client) = self.client().await?;
        let result = map_list_result(path, client.list_children(path).await);
        self.settle(generation, result).await
    }

    async fn delete_node(&self, path: &str) -> Result<DeleteOutcome> {
        let (generation, client) = self.client().await?;
        let result = map_delete_result(path, client.delete(path, None).await);
        self.settle(generation, result).await
    }

    async fn close(&self) -> Result<()> {
        let previous = std::mem::replace(&mut *self.slot.write().await, Slot::Idle);
        if let Slot::Connected { .. } = previous {
            debug!("Closed ZooKeeper session to {}", self.hosts);
        }
        Ok(())
    }

    fn store_name(&self) -> &'static str {
        "zookeeper"
    }
}

/// Errors after which the client never recovers
fn is_session_lost(err: &zookeeper_client::Error) -> bool {
    matches!(
        err,
        zookeeper_client::Error::SessionExpired
            | zookeeper_client::Error::ClientClosed
            | zookeeper_client::Error::AuthFailed
    )
}

fn call_error(err: zookeeper_client::Error, context: String) -> CallError {
    let lost = is_session_lost(&err);
    let err = Error::store(format!("{}: {}", context, err));
    if lost {
        CallError::SessionLost(err)
    } else {
        CallError::Other(err)
    }
}

fn map_list_result(
    path: &str,
    result: std::result::Result<Vec<String>, zookeeper_client::Error>,
) -> std::result::Result<Option<Vec<String>>, CallError> {
    match result {
        Ok(children) => Ok(Some(children)),
        Err(zookeeper_client::Error::NoNode) => Ok(None),
        Err(e) => Err(call_error(e, format!("failed to list {}", path))),
    }
}

fn map_delete_result(
    path: &str,
    result: std::result::Result<(), zookeeper_client::Error>,
) -> std::result::Result<DeleteOutcome, CallError> {
    match result {
        Ok(()) => Ok(DeleteOutcome::Deleted),
        Err(zookeeper_client::Error::NoNode) => Ok(DeleteOutcome::Absent),
        Err(e) => Err(call_error(e, format!("failed to delete {}", path))),
    }
}
