//! Core traits for the mido-fixer system
//!
//! This module defines the abstract interfaces that all client implementations must follow.
//!
//! - [`CoordinationStore`]: List and delete nodes in the binding tree
//! - [`NetworkDirectory`]: Resolve authoritative port attributes
//! - [`NotificationSource`]: Deliver and acknowledge bus notifications

pub mod coordination_store;
pub mod network_directory;
pub mod notification_source;

pub use coordination_store::{CoordinationStore, DeleteOutcome};
pub use network_directory::NetworkDirectory;
pub use notification_source::{Notification, NotificationResult, NotificationSource};
