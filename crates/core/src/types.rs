use serde::{Deserialize, Serialize};

/// 32-bit local tunnel identifier (network byte order on the wire)
pub type TunnelId = u32;

/// 32-byte router identity hash
pub type RouterHash = [u8; 32];

/// Router information needed to build a tunnel through a peer:
/// identity hash plus the static X25519 key build records are sealed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterInfo {
    pub hash: RouterHash,
    pub encryption_pubkey: [u8; 32],
}

impl RouterInfo {
    pub fn new(hash: RouterHash, encryption_pubkey: [u8; 32]) -> Self {
        Self {
            hash,
            encryption_pubkey,
        }
    }
}

/// Tunnel lifecycle state.
///
/// Transitions are monotone except `Established` → `Expiring` → terminal.
/// `BuildReplyReceived` is a transient state between locating a pending
/// tunnel by its reply message id and finishing response processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Pending,
    BuildReplyReceived,
    Established,
    Expiring,
    BuildFailed,
    Failed,
}

/// Transports the far end of a tunnel is reachable over.
///
/// Carried as a hint from the build config into the established tunnel so
/// adjacent-tunnel peer selection can prefer compatible routers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FarEndTransports {
    #[default]
    All,
    Stream,
    Datagram,
}

/// Delivery instructions for a payload entering an outbound tunnel or
/// leaving an inbound endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Deliver to the local router
    Local,
    /// Deliver to a router directly
    Router(RouterHash),
    /// Deliver into a remote tunnel via its gateway router
    Tunnel(RouterHash, TunnelId),
}

impl Delivery {
    /// Wire tag for this delivery type
    pub fn type_byte(&self) -> u8 {
        match self {
            Delivery::Local => 1,
            Delivery::Router(_) => 2,
            Delivery::Tunnel(_, _) => 3,
        }
    }
}
