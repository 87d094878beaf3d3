//! Stale binding reconciler
//!
//! The Reconciler is responsible for:
//! - Resolving a port through the NetworkDirectory
//! - Listing the ARP table of the port's network in the CoordinationStore
//! - Deleting entries that bind one of the port's IPs to another MAC
//!
//! ## Flow
//!
//! ```text
//! port_id ──► NetworkDirectory::fetch_port ──► Port { network_id, mac, ips }
//!                                                  │
//!                     CoordinationStore::list_children(/<root>/<network_id>/<table>)
//!                                                  │
//!                     for ip in ips, for entry in entries:
//!                         entry.ip == ip && entry.mac != mac ──► delete_node
//! ```
//!
//! Every step is best-effort. A port that cannot be resolved or a network
//! without an ARP table ends the reconciliation quietly, and a failed
//! delete never stops the remaining deletes.

use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::model::{BindingEntry, BindingLayout, Port};
use crate::traits::{CoordinationStore, DeleteOutcome, NetworkDirectory};

/// What a single reconciliation did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The port could not be resolved; the store was not touched
    Unresolved {
        port_id: String,
        reason: String,
    },

    /// The port's network has no binding table yet
    NoBindingTable {
        port_id: String,
        path: String,
    },

    /// The binding table was examined
    Completed(ReconcileReport),
}

impl ReconcileOutcome {
    /// Number of nodes actually deleted
    pub fn deletions(&self) -> usize {
        match self {
            ReconcileOutcome::Completed(report) => report.deleted.len(),
            _ => 0,
        }
    }
}

/// Details of a reconciliation that reached the binding table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Port that triggered the reconciliation
    pub port_id: String,
    /// Network whose binding table was examined
    pub network_id: String,
    /// Number of entries listed under the binding table
    pub entries_examined: usize,
    /// Conflicting entry names, in evaluation order
    pub conflicts: Vec<String>,
    /// Paths removed from the store
    pub deleted: Vec<String>,
    /// Paths that were already gone when the delete was issued
    pub already_absent: Vec<String>,
    /// Paths whose delete failed, with the error message
    pub failed: Vec<(String, String)>,
    /// Whether deletes were suppressed
    pub dry_run: bool,
}

/// Removes stale IP→MAC bindings for a port
///
/// The reconciler holds no state of its own; both clients are shared with
/// every other concurrent reconciliation.
pub struct Reconciler {
    directory: Arc<dyn NetworkDirectory>,
    store: Arc<dyn CoordinationStore>,
    layout: BindingLayout,
    dry_run: bool,
}

impl Reconciler {
    /// Create a new reconciler
    pub fn new(
        directory: Arc<dyn NetworkDirectory>,
        store: Arc<dyn CoordinationStore>,
        layout: BindingLayout,
    ) -> Self {
        Self {
            directory,
            store,
            layout,
            dry_run: false,
        }
    }

    /// Report conflicts without deleting them
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Reconcile the binding table of a port's network
    ///
    /// # Returns
    ///
    /// - `Ok(ReconcileOutcome)`: What was done (possibly nothing)
    /// - `Err(Error)`: The binding table could not be listed
    ///
    /// Directory failures and per-entry delete failures are reported in the
    /// outcome rather than as errors.
    pub async fn reconcile(&self, port_id: &str) -> Result<ReconcileOutcome> {
        let port = match self.directory.fetch_port(port_id).await {
            Ok(Some(port)) => port,
            Ok(None) => {
                debug!("Port {} not found in {}, skipping", port_id, self.directory.directory_name());
                return Ok(ReconcileOutcome::Unresolved {
                    port_id: port_id.to_string(),
                    reason: "port not found".to_string(),
                });
            }
            Err(e) => {
                debug!("Unable to resolve port {}: {}", port_id, e);
                return Ok(ReconcileOutcome::Unresolved {
                    port_id: port_id.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        debug!("Network ID {}", port.network_id);
        debug!("mac_address {}", port.mac_address);
        debug!("ip_addresses {:?}", port.ip_addresses);

        let base_path = self.layout.subtree_path(&port.network_id);
        let Some(entries) = self.store.list_children(&base_path).await? else {
            debug!("No path {}, skipping", base_path);
            return Ok(ReconcileOutcome::NoBindingTable {
                port_id: port.id,
                path: base_path,
            });
        };

        let mut report = ReconcileReport {
            port_id: port.id.clone(),
            network_id: port.network_id.clone(),
            entries_examined: entries.len(),
            dry_run: self.dry_run,
            ..Default::default()
        };

        for entry in find_conflicts(&port, &entries) {
            warn!("Found duplicate at {}", entry);
            report.conflicts.push(entry.to_string());

            let path = format!("{}/{}", base_path, entry);
            if self.dry_run {
                info!("[DRY-RUN] Would delete path {}", path);
                continue;
            }

            info!("Deleting path {}", path);
            match self.store.delete_node(&path).await {
                Ok(DeleteOutcome::Deleted) => report.deleted.push(path),
                Ok(DeleteOutcome::Absent) => {
                    debug!("Path {} already removed", path);
                    report.already_absent.push(path);
                }
                Err(e) => {
                    error!("Failed to delete path {}: {}", path, e);
                    report.failed.push((path, e.to_string()));
                }
            }
        }

        Ok(ReconcileOutcome::Completed(report))
    }
}

/// Entries that bind one of the port's IPs to a different MAC
///
/// Each IP is matched against the full entry list. Entry names that do not
/// parse as bindings are ignored, and a port without a MAC conflicts with
/// nothing.
pub fn find_conflicts<'a>(port: &Port, entries: &'a [String]) -> Vec<&'a str> {
    let mut conflicts = Vec::new();
    if port.mac_address.is_empty() {
        return conflicts;
    }
    for ip in &port.ip_addresses {
        for entry in entries {
            let Some(binding) = BindingEntry::parse(entry) else {
                continue;
            };
            if binding.conflicts_with(ip, &port.mac_address) {
                conflicts.push(entry.as_str());
            }
        }
    }
    conflicts
}
