//! Narrow interfaces to the tunnel core's external collaborators
//!
//! The tunnel subsystem never talks to the wire, the net-db, or the
//! profile store directly; everything goes through these traits, bundled
//! into one [`RouterContext`] injected at construction.

use std::sync::Arc;

use garliccraft_core::{I2npMessage, RouterHash, RouterInfo};

/// Wire transport. Fire-and-forget: an accepted message must be disarmed,
/// a discarded one dropped so its `on_drop` callback fires.
pub trait Transport: Send + Sync {
    fn send_message(&self, to: &RouterHash, msg: I2npMessage);

    /// Whether any transport is currently usable
    fn is_online(&self) -> bool;

    /// Whether peer selection is restricted to a configured set
    fn routes_restricted(&self) -> bool {
        false
    }

    /// A restricted peer to route through, when restrictions apply
    fn restricted_peer(&self) -> Option<RouterInfo> {
        None
    }
}

/// Router selection from the network database
pub trait NetDb: Send + Sync {
    /// A random known router, excluding `exclude`
    fn random_router(
        &self,
        exclude: &RouterHash,
        reachable: bool,
        high_bandwidth: bool,
    ) -> Option<RouterInfo>;
}

/// Peer-profile event sink; the store records, we only emit.
pub trait ProfileEvents: Send + Sync {
    fn tunnel_build_response(&self, hash: &RouterHash, ret_code: u8);
    fn tunnel_non_replied(&self, hash: &RouterHash);
}

/// The local destination a pool serves
pub trait LocalDestination: Send + Sync {
    /// Flag the lease set as needing republication
    fn set_lease_set_updated(&self, updated: bool);

    /// Register a garlic reply key/tag for incoming build replies
    fn submit_garlic_key(&self, key: [u8; 32], tag: u64);
}

/// Local delivery of messages leaving the tunnel subsystem
pub trait I2npHandler: Send + Sync {
    fn handle_message(&self, msg: I2npMessage);
}

/// Sibling subsystem handling tunnels we are a middle hop of
pub trait TransitHandler: Send + Sync {
    fn post_transit_build(&self, msg: I2npMessage);
}

/// Everything the tunnel core needs from the rest of the router
pub struct RouterContext {
    /// Our own identity hash
    pub local_hash: RouterHash,
    pub transport: Arc<dyn Transport>,
    pub netdb: Arc<dyn NetDb>,
    pub profiles: Arc<dyn ProfileEvents>,
    /// Router-level destination: garlic key sink and lease-set flag used
    /// when a tunnel has no pool-level destination
    pub local_destination: Arc<dyn LocalDestination>,
    pub i2np: Arc<dyn I2npHandler>,
    pub transit: Arc<dyn TransitHandler>,
}
