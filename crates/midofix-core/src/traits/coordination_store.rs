// # Coordination Store Trait
//
// Defines the interface to the hierarchical store holding the ARP tables.
//
// ## Purpose
//
// MidoNet keeps one node per IP→MAC binding under
// `/<root>/<network_id>/ip4_mac_table`. The reconciler only ever needs two
// operations on that tree: list the children of a table node and delete a
// single child.
//
// ## Implementations
//
// - ZooKeeper: `midofix-store-zookeeper` crate
// - In-memory: [`crate::store::MemoryCoordinationStore`]
//
// ## Usage
//
// ```rust,ignore
// use midofix_core::CoordinationStore;
//
// let store = /* CoordinationStore implementation */;
// store.connect().await?;
//
// if let Some(entries) = store.list_children("/tables/n1/ip4_mac_table").await? {
//     for entry in entries {
//         store.delete_node(&format!("/tables/n1/ip4_mac_table/{}", entry)).await?;
//     }
// }
//
// store.close().await?;
// ```

use async_trait::async_trait;

/// Outcome of a node deletion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The node existed and was removed
    Deleted,
    /// The node was already gone
    Absent,
}

/// Trait for coordination store implementations
///
/// Implementations hold a single session that is shared by every concurrent
/// reconciliation, so all methods must be safe to call from multiple tasks.
///
/// # Missing Paths
///
/// The tree is not transactionally consistent with the network directory,
/// and other reconciliations (or MidoNet itself) may remove nodes at any
/// time. A missing path is therefore never an error:
/// - `list_children` returns `Ok(None)`
/// - `delete_node` returns `Ok(DeleteOutcome::Absent)`
///
/// `Err` is reserved for session or transport failures.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Establish the store session
    ///
    /// Called once by the service at startup. A failure here is fatal.
    async fn connect(&self) -> Result<(), crate::Error>;

    /// List the immediate children of a node
    ///
    /// # Returns
    ///
    /// - `Ok(Some(names))`: Child node names (not full paths)
    /// - `Ok(None)`: The node does not exist
    /// - `Err(Error)`: Session or transport failure
    async fn list_children(&self, path: &str) -> Result<Option<Vec<String>>, crate::Error>;

    /// Delete a node unconditionally
    ///
    /// No version check is performed.
    async fn delete_node(&self, path: &str) -> Result<DeleteOutcome, crate::Error>;

    /// Close the store session
    ///
    /// Calls made after `close` fail with a store error.
    async fn close(&self) -> Result<(), crate::Error>;

    /// Name used in log lines
    fn store_name(&self) -> &'static str;
}
