// # Network Directory Trait
//
// Defines the interface to the authoritative source of port assignments.
//
// ## Implementations
//
// - Neutron (Keystone authenticated): `midofix-directory-neutron` crate

use async_trait::async_trait;

use crate::model::Port;

/// Trait for network directory implementations
///
/// Read-only. Implementations own their session (authentication, token
/// refresh) and must allow concurrent lookups.
///
/// The reconciler treats `Ok(None)` and `Err(_)` the same way: the port
/// cannot be resolved right now and this reconciliation is abandoned. The
/// distinction only matters for logging.
#[async_trait]
pub trait NetworkDirectory: Send + Sync {
    /// Fetch a port by id
    ///
    /// # Returns
    ///
    /// - `Ok(Some(Port))`: The port and its current attributes
    /// - `Ok(None)`: The directory has no such port
    /// - `Err(Error)`: Lookup failed (transport, authentication, rate limiting)
    async fn fetch_port(&self, port_id: &str) -> Result<Option<Port>, crate::Error>;

    /// Name used in log lines
    fn directory_name(&self) -> &'static str;
}
