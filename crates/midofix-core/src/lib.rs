// # midofix-core
//
// Core library for the mido-fixer reconciliation daemon.
//
// ## Architecture Overview
//
// When a Neutron port is (re)created, MidoNet may keep IP→MAC bindings in its
// ZooKeeper ARP tables that point at the port's previous MAC address. This
// library removes those stale bindings:
// - **NotificationSource**: Trait for the bus delivering port events
// - **NetworkDirectory**: Trait for resolving authoritative port attributes
// - **CoordinationStore**: Trait for the tree holding the binding entries
// - **Reconciler**: Compares a port against its network's ARP table and deletes conflicts
// - **NotificationListener**: Turns bus notifications into settle-delayed reconciliations
// - **Service**: Owns the lifecycle (connect, run, ordered shutdown)
//
// ## Design Principles
//
// 1. **Separation of Concerns**: Core logic is separate from the store, directory and bus clients
// 2. **Event-Driven**: Work is only ever triggered by a bus notification
// 3. **Best-Effort**: Failures abort a single reconciliation, never the service
// 4. **Library-First**: All core functionality can be used as a library

pub mod config;
pub mod error;
pub mod listener;
pub mod model;
pub mod reconciler;
pub mod service;
pub mod store;
pub mod traits;

// Re-export core types for convenience
pub use config::MidofixConfig;
pub use error::{Error, Result};
pub use listener::{EventTraits, ListenerEvent, NotificationListener};
pub use model::{BindingEntry, BindingLayout, Port};
pub use reconciler::{ReconcileOutcome, ReconcileReport, Reconciler};
pub use service::{Service, ServiceState};
pub use store::MemoryCoordinationStore;
pub use traits::{CoordinationStore, NetworkDirectory, NotificationSource};
