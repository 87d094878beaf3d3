// # Memory Coordination Store
//
// In-memory implementation of CoordinationStore.
//
// ## Purpose
//
// Models the ZooKeeper tree as a set of absolute node paths. Useful for
// testing the reconciler and for embedding the core without a ZooKeeper
// ensemble.
//
// ## Semantics
//
// - Inserting a node creates its missing ancestors
// - Deleting a node that still has children fails, like ZooKeeper's `NotEmpty`
// - Every successful deletion is recorded in order
// - After `close()` every operation fails until `connect()` is called again

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

use crate::Error;
use crate::traits::coordination_store::{CoordinationStore, DeleteOutcome};

#[derive(Debug, Default)]
struct Tree {
    nodes: BTreeSet<String>,
    deleted: Vec<String>,
}

/// In-memory coordination store implementation
///
/// # Example
///
/// ```rust,no_run
/// use midofix_core::store::MemoryCoordinationStore;
/// use midofix_core::traits::CoordinationStore;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = MemoryCoordinationStore::new();
///     store.insert("/tables/n1/ip4_mac_table/10.0.0.5,aa:bb").await;
///
///     let children = store.list_children("/tables/n1/ip4_mac_table").await?;
///     assert_eq!(children, Some(vec!["10.0.0.5,aa:bb".to_string()]));
///
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct MemoryCoordinationStore {
    inner: Arc<RwLock<Tree>>,
    closed: Arc<AtomicBool>,
}

impl MemoryCoordinationStore {
    /// Create a new empty store (already connected)
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Tree::default())),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Insert a node and any missing ancestors
    pub async fn insert(&self, path: &str) {
        let mut guard = self.inner.write().await;
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            guard.nodes.insert(current.clone());
        }
    }

    /// Insert a binding table with the given entries
    pub async fn insert_table<I, S>(&self, table_path: &str, entries: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.insert(table_path).await;
        for entry in entries {
            self.insert(&format!("{}/{}", table_path, entry.as_ref())).await;
        }
    }

    /// Check whether a node exists
    pub async fn contains(&self, path: &str) -> bool {
        self.inner.read().await.nodes.contains(path)
    }

    /// Paths removed by `delete_node`, in deletion order
    pub async fn deleted(&self) -> Vec<String> {
        self.inner.read().await.deleted.clone()
    }

    /// Whether the store has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::store("memory store is closed"));
        }
        Ok(())
    }

    fn children_of<'a>(nodes: &'a BTreeSet<String>, path: &'a str) -> impl Iterator<Item = &'a str> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        nodes.iter().filter_map(move |node| {
            let child = node.strip_prefix(&prefix)?;
            (!child.contains('/')).then_some(child)
        })
    }
}

impl Default for MemoryCoordinationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for MemoryCoordinationStore {
    async fn connect(&self) -> Result<(), Error> {
        self.closed.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn list_children(&self, path: &str) -> Result<Option<Vec<String>>, Error> {
        self.ensure_open()?;
        let guard = self.inner.read().await;
        if !guard.nodes.contains(path) {
            return Ok(None);
        }
        Ok(Some(
            Self::children_of(&guard.nodes, path)
                .map(str::to_string)
                .collect(),
        ))
    }

    async fn delete_node(&self, path: &str) -> Result<DeleteOutcome, Error> {
        self.ensure_open()?;
        let mut guard = self.inner.write().await;
        if !guard.nodes.contains(path) {
            return Ok(DeleteOutcome::Absent);
        }
        if Self::children_of(&guard.nodes, path).next().is_some() {
            return Err(Error::store(format!("node not empty: {}", path)));
        }
        guard.nodes.remove(path);
        guard.deleted.push(path.to_string());
        Ok(DeleteOutcome::Deleted)
    }

    async fn close(&self) -> Result<(), Error> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn store_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_children() {
        let store = MemoryCoordinationStore::new();
        store
            .insert_table("/t/n1/arp", ["10.0.0.5,aa:bb", "10.0.0.6,cc:dd"])
            .await;
        store.insert("/t/n1/arp/10.0.0.6,cc:dd/nested").await;

        let children = store.list_children("/t/n1/arp").await.unwrap().unwrap();
        assert_eq!(children, vec!["10.0.0.5,aa:bb", "10.0.0.6,cc:dd"]);

        assert_eq!(store.list_children("/t/n2/arp").await.unwrap(), None);
        assert_eq!(
            store.list_children("/t/n1/arp/10.0.0.5,aa:bb").await.unwrap(),
            Some(vec![])
        );
    }

    #[tokio::test]
    async fn test_delete_node() {
        let store = MemoryCoordinationStore::new();
        store.insert_table("/t/n1/arp", ["10.0.0.5,aa:bb"]).await;

        let outcome = store.delete_node("/t/n1/arp/10.0.0.5,aa:bb").await.unwrap();
        assert_eq!(outcome, DeleteOutcome::Deleted);
        assert!(!store.contains("/t/n1/arp/10.0.0.5,aa:bb").await);

        let outcome = store.delete_node("/t/n1/arp/10.0.0.5,aa:bb").await.unwrap();
        assert_eq!(outcome, DeleteOutcome::Absent);

        assert_eq!(store.deleted().await, vec!["/t/n1/arp/10.0.0.5,aa:bb"]);
    }

    #[tokio::test]
    async fn test_delete_refuses_non_empty_node() {
        let store = MemoryCoordinationStore::new();
        store.insert_table("/t/n1/arp", ["10.0.0.5,aa:bb"]).await;

        assert!(store.delete_node("/t/n1/arp").await.is_err());
        assert!(store.contains("/t/n1/arp").await);
    }

    #[tokio::test]
    async fn test_closed_store_rejects_calls() {
        let store = MemoryCoordinationStore::new();
        store.insert("/t").await;
        store.close().await.unwrap();

        assert!(store.is_closed());
        assert!(store.list_children("/t").await.is_err());
        assert!(store.delete_node("/t").await.is_err());

        tokio_test::assert_ok!(store.connect().await);
        tokio_test::assert_ok!(store.list_children("/t").await);
    }
}
