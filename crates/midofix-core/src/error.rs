//! Error types for the mido-fixer system
//!
//! One variant per external collaborator so that log lines say which side
//! of the reconciliation failed.

use thiserror::Error;

/// Result alias used across the workspace
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the store, directory and bus clients and by the service
#[derive(Error, Debug)]
pub enum Error {
    /// Coordination store errors (connection loss, session closed, ...)
    #[error("Coordination store error: {0}")]
    Store(String),

    /// Network directory errors
    #[error("Network directory error: {0}")]
    Directory(String),

    /// Notification bus errors
    #[error("Notification bus error: {0}")]
    Bus(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Notification payload could not be interpreted
    #[error("Invalid notification payload: {0}")]
    Payload(String),

    /// Keystone rejected the credentials or Neutron rejected the token
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// HTTP 429 from the directory
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Lifecycle misuse, e.g. starting a service twice
    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn directory(msg: impl Into<String>) -> Self {
        Self::Directory(msg.into())
    }

    pub fn bus(msg: impl Into<String>) -> Self {
        Self::Bus(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn payload(msg: impl Into<String>) -> Self {
        Self::Payload(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Authentication(msg.into())
    }

    pub fn rate_limited(msg: impl Into<String>) -> Self {
        Self::RateLimited(msg.into())
    }
}
