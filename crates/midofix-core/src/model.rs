//! Data model shared by the reconciler and its collaborators
//!
//! - [`Port`]: authoritative port attributes fetched from the network directory
//! - [`BindingEntry`]: a parsed ARP table node name (`"<ip>,<mac>[,<rest>]"`)
//! - [`BindingLayout`]: where a network's ARP table lives in the coordination tree

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Default root of the per-network tables in the MidoNet ZooKeeper tree
pub const DEFAULT_BINDING_ROOT: &str = "/midonet/zoom/0/tables/Network";

/// Default name of the IPv4 ARP table node under each network
pub const DEFAULT_BINDING_TABLE: &str = "ip4_mac_table";

/// Separator between the fields of a binding entry node name
const ENTRY_DELIMITER: char = ',';

/// A Neutron port as seen by the reconciler
///
/// Fetched fresh for every reconciliation and never cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    /// Port UUID
    pub id: String,
    /// Network the port is attached to
    pub network_id: String,
    /// Current MAC address of the port
    pub mac_address: String,
    /// Fixed IP addresses assigned to the port
    pub ip_addresses: BTreeSet<String>,
}

impl Port {
    /// Create a new port record
    pub fn new<I, S>(
        id: impl Into<String>,
        network_id: impl Into<String>,
        mac_address: impl Into<String>,
        ip_addresses: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            network_id: network_id.into(),
            mac_address: mac_address.into(),
            ip_addresses: ip_addresses.into_iter().map(Into::into).collect(),
        }
    }
}

/// A binding entry node name split into its fields
///
/// Only the IP and MAC fields are interpreted; anything after the second
/// delimiter is opaque and preserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingEntry<'a> {
    /// IP address field
    pub ip: &'a str,
    /// MAC address field
    pub mac: &'a str,
    /// Opaque trailing data, if any
    pub rest: Option<&'a str>,
}

impl<'a> BindingEntry<'a> {
    /// Parse a node name, returning `None` if it has no delimiter at all
    pub fn parse(name: &'a str) -> Option<Self> {
        let mut fields = name.splitn(3, ENTRY_DELIMITER);
        let ip = fields.next()?;
        let mac = fields.next()?;
        let rest = fields.next();

        Some(Self { ip, mac, rest })
    }

    /// Whether this entry binds the given IP address
    pub fn is_for(&self, ip: &str) -> bool {
        self.ip == ip
    }

    /// Whether this entry binds `ip` to a MAC other than `mac`
    pub fn conflicts_with(&self, ip: &str, mac: &str) -> bool {
        self.is_for(ip) && self.mac != mac
    }
}

/// Location of the per-network binding tables in the coordination tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingLayout {
    /// Absolute path under which one node per network id lives
    pub root: String,
    /// Name of the table node under each network
    pub table: String,
}

impl BindingLayout {
    /// Create a layout from a root path and table name
    pub fn new(root: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            table: table.into(),
        }
    }

    /// Path of the binding table for a network
    ///
    /// `/<root>/<network_id>/<table>`
    pub fn subtree_path(&self, network_id: &str) -> String {
        format!(
            "{}/{}/{}",
            self.root.trim_end_matches('/'),
            network_id,
            self.table
        )
    }

    /// Path of a single entry inside a network's binding table
    pub fn entry_path(&self, network_id: &str, entry: &str) -> String {
        format!("{}/{}", self.subtree_path(network_id), entry)
    }
}

impl Default for BindingLayout {
    fn default() -> Self {
        Self::new(DEFAULT_BINDING_ROOT, DEFAULT_BINDING_TABLE)
    }
}
