//! Configuration types consumed by the tunnel subsystem

use serde::{Deserialize, Serialize};

/// Default maximum number of transit tunnels this router will carry
pub const DEFAULT_MAX_NUM_TRANSIT_TUNNELS: u32 = 5000;

/// Tunnel subsystem settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSettings {
    /// Exploratory pool configuration
    #[serde(default)]
    pub exploratory: ExploratorySettings,

    /// Maximum number of transit tunnels accepted for other routers
    #[serde(default = "default_max_transit_tunnels")]
    pub max_num_transit_tunnels: u32,
}

fn default_max_transit_tunnels() -> u32 {
    DEFAULT_MAX_NUM_TRANSIT_TUNNELS
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            exploratory: ExploratorySettings::default(),
            max_num_transit_tunnels: default_max_transit_tunnels(),
        }
    }
}

/// Exploratory pool settings: the default pool used for net-db queries
/// when no application pool exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExploratorySettings {
    /// Hops per exploratory inbound tunnel
    #[serde(default = "default_length")]
    pub inbound_length: usize,

    /// Hops per exploratory outbound tunnel
    #[serde(default = "default_length")]
    pub outbound_length: usize,

    /// Number of exploratory inbound tunnels to keep
    #[serde(default = "default_quantity")]
    pub inbound_quantity: usize,

    /// Number of exploratory outbound tunnels to keep
    #[serde(default = "default_quantity")]
    pub outbound_quantity: usize,
}

fn default_length() -> usize {
    2
}

fn default_quantity() -> usize {
    3
}

impl Default for ExploratorySettings {
    fn default() -> Self {
        Self {
            inbound_length: default_length(),
            outbound_length: default_length(),
            inbound_quantity: default_quantity(),
            outbound_quantity: default_quantity(),
        }
    }
}
