//! Test doubles and common utilities for contract tests
//!
//! The doubles count calls and write to a shared [`Journal`] so tests can
//! check both what happened and in which order.

#![allow(dead_code)]

use midofix_core::config::{ListenerConfig, ReconcilerConfig};
use midofix_core::error::{Error, Result};
use midofix_core::traits::{
    CoordinationStore, DeleteOutcome, NetworkDirectory, Notification, NotificationResult,
    NotificationSource,
};
use midofix_core::{ListenerEvent, MemoryCoordinationStore, Port, Service};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::Stream;

/// Binding table path of network `n1` under the default layout
pub const N1_TABLE: &str = "/midonet/zoom/0/tables/Network/n1/ip4_mac_table";

/// Ordered record of lifecycle calls across doubles
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Position of the first matching entry
    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }
}

/// A NetworkDirectory serving a fixed set of ports
pub struct StaticDirectory {
    ports: HashMap<String, Port>,
    failing: AtomicBool,
    fetch_call_count: AtomicUsize,
}

impl StaticDirectory {
    pub fn new(ports: impl IntoIterator<Item = Port>) -> Self {
        Self {
            ports: ports.into_iter().map(|p| (p.id.clone(), p)).collect(),
            failing: AtomicBool::new(false),
            fetch_call_count: AtomicUsize::new(0),
        }
    }

    pub fn empty() -> Self {
        Self::new([])
    }

    /// Make every lookup fail with a transport error
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn fetch_call_count(&self) -> usize {
        self.fetch_call_count.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl NetworkDirectory for StaticDirectory {
    async fn fetch_port(&self, port_id: &str) -> Result<Option<Port>> {
        self.fetch_call_count.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::directory("connection refused"));
        }
        Ok(self.ports.get(port_id).cloned())
    }

    fn directory_name(&self) -> &'static str {
        "static"
    }
}

/// A CoordinationStore over a MemoryCoordinationStore that counts calls
/// and can inject failures
pub struct RecordingStore {
    pub tree: MemoryCoordinationStore,
    journal: Journal,
    list_call_count: AtomicUsize,
    delete_call_count: AtomicUsize,
    failing_deletes: Mutex<HashSet<String>>,
    phantom_entries: Mutex<HashMap<String, Vec<String>>>,
    fail_connect: AtomicBool,
    fail_list: AtomicBool,
}

impl RecordingStore {
    pub fn new(journal: Journal) -> Self {
        Self {
            tree: MemoryCoordinationStore::new(),
            journal,
            list_call_count: AtomicUsize::new(0),
            delete_call_count: AtomicUsize::new(0),
            failing_deletes: Mutex::new(HashSet::new()),
            phantom_entries: Mutex::new(HashMap::new()),
            fail_connect: AtomicBool::new(false),
            fail_list: AtomicBool::new(false),
        }
    }

    pub async fn with_table(journal: Journal, table: &str, entries: &[&str]) -> Self {
        let store = Self::new(journal);
        store.tree.insert_table(table, entries).await;
        store
    }

    /// Make deleting this path fail
    pub fn fail_delete(&self, path: &str) {
        self.failing_deletes.lock().unwrap().insert(path.to_string());
    }

    /// Report an entry in listings that no longer exists in the tree,
    /// as if a concurrent reconciliation removed it in between
    pub fn add_phantom_entry(&self, table: &str, entry: &str) {
        self.phantom_entries
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .push(entry.to_string());
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_list(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::SeqCst);
    }

    pub fn list_call_count(&self) -> usize {
        self.list_call_count.load(Ordering::SeqCst)
    }

    pub fn delete_call_count(&self) -> usize {
        self.delete_call_count.load(Ordering::SeqCst)
    }

    pub async fn deleted(&self) -> Vec<String> {
        self.tree.deleted().await
    }
}

#[async_trait::async_trait]
impl CoordinationStore for RecordingStore {
    async fn connect(&self) -> Result<()> {
        self.journal.record("store.connect");
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::store("connection refused"));
        }
        self.tree.connect().await
    }

    async fn list_children(&self, path: &str) -> Result<Option<Vec<String>>> {
        self.list_call_count.fetch_add(1, Ordering::SeqCst);
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(Error::store("session expired"));
        }

        let listing = self.tree.list_children(path).await?;
        let phantoms = self.phantom_entries.lock().unwrap().get(path).cloned();
        Ok(listing.map(|mut children| {
            children.extend(phantoms.unwrap_or_default());
            children
        }))
    }

    async fn delete_node(&self, path: &str) -> Result<DeleteOutcome> {
        self.delete_call_count.fetch_add(1, Ordering::SeqCst);
        self.journal.record("store.delete");
        if self.failing_deletes.lock().unwrap().contains(path) {
            return Err(Error::store(format!("connection loss deleting {}", path)));
        }
        self.tree.delete_node(path).await
    }

    async fn close(&self) -> Result<()> {
        self.journal.record("store.close");
        self.tree.close().await
    }

    fn store_name(&self) -> &'static str {
        "recording"
    }
}

/// A NotificationSource fed by the test
pub struct ControlledSource {
    rx: Mutex<Option<mpsc::UnboundedReceiver<Notification>>>,
    journal: Journal,
    acks: Mutex<Vec<(u64, NotificationResult, Instant)>>,
    fail_start: AtomicBool,
}

impl ControlledSource {
    /// Create a source and the sender that feeds it
    ///
    /// Dropping the sender ends the notification stream.
    pub fn new(journal: Journal) -> (Self, mpsc::UnboundedSender<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let source = Self {
            rx: Mutex::new(Some(rx)),
            journal,
            acks: Mutex::new(Vec::new()),
            fail_start: AtomicBool::new(false),
        };
        (source, tx)
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn acks(&self) -> Vec<(u64, NotificationResult)> {
        self.acks
            .lock()
            .unwrap()
            .iter()
            .map(|(tag, result, _)| (*tag, *result))
            .collect()
    }

    /// When the delivery was acknowledged
    pub fn acked_at(&self, delivery_tag: u64) -> Option<Instant> {
        self.acks
            .lock()
            .unwrap()
            .iter()
            .find(|(tag, _, _)| *tag == delivery_tag)
            .map(|(_, _, at)| *at)
    }
}

#[async_trait::async_trait]
impl NotificationSource for ControlledSource {
    async fn start(&self) -> Result<()> {
        self.journal.record("source.start");
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(Error::bus("broker unreachable"));
        }
        Ok(())
    }

    fn watch(&self) -> Pin<Box<dyn Stream<Item = Notification> + Send + 'static>> {
        match self.rx.lock().unwrap().take() {
            Some(rx) => Box::pin(tokio_stream::wrappers::UnboundedReceiverStream::new(rx)),
            None => Box::pin(tokio_stream::empty()),
        }
    }

    async fn acknowledge(&self, delivery_tag: u64, result: NotificationResult) -> Result<()> {
        self.acks
            .lock()
            .unwrap()
            .push((delivery_tag, result, Instant::now()));
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.journal.record("source.stop");
        Ok(())
    }

    fn source_name(&self) -> &'static str {
        "controlled"
    }
}

/// The port used by most tests: p1 on n1 with aa:bb / 10.0.0.5
pub fn port_p1() -> Port {
    Port::new("p1", "n1", "aa:bb", ["10.0.0.5"])
}

/// A ceilometer event notification for a port
pub fn port_event(delivery_tag: u64, port_id: &str) -> Notification {
    typed_event(delivery_tag, "port.create.end", port_id)
}

/// A ceilometer event notification with an explicit event type
pub fn typed_event(delivery_tag: u64, event_type: &str, port_id: &str) -> Notification {
    Notification::new(
        delivery_tag,
        event_type,
        json!([{
            "event_type": event_type,
            "message_id": format!("msg-{}", delivery_tag),
            "traits": [
                ["resource_id", 1, port_id],
                ["tenant_id", 1, "t1"],
                ["service", 1, "network.controller"]
            ]
        }]),
    )
}

/// Listener settings for tests: 2s settle delay, small pool
pub fn listener_config() -> ListenerConfig {
    ListenerConfig {
        settle_delay_ms: 2000,
        workers: 2,
        queue_capacity: 16,
        event_channel_capacity: 256,
        event_types: Vec::new(),
        shutdown_grace_secs: 5,
    }
}

/// Build a service from test doubles
pub fn service(
    store: Arc<RecordingStore>,
    directory: Arc<StaticDirectory>,
    source: Arc<ControlledSource>,
    listener: &ListenerConfig,
) -> (Service, mpsc::Receiver<ListenerEvent>) {
    Service::new(
        store,
        directory,
        source,
        &ReconcilerConfig::default(),
        listener,
    )
    .expect("service construction succeeds")
}

/// Wait for the first listener event matching `pred`
pub async fn wait_for<F>(events: &mut mpsc::Receiver<ListenerEvent>, pred: F) -> ListenerEvent
where
    F: Fn(&ListenerEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(30), async {
        while let Some(event) = events.recv().await {
            if pred(&event) {
                return event;
            }
        }
        panic!("listener event channel closed");
    })
    .await
    .expect("timed out waiting for listener event")
}
