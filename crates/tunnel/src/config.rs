//! Tunnel build configuration: the ordered hop chain

use rand::RngCore;

use garliccraft_core::{
    FarEndTransports, RouterHash, RouterInfo, TunnelId, SHORT_TUNNEL_BUILD_RECORD_SIZE,
    TUNNEL_BUILD_RECORD_SIZE,
};

use crate::error::{Result, TunnelError};
use crate::hop::TunnelHopConfig;

/// Ordered hop chain for one tunnel build, in traversal order
/// (gateway first, endpoint last).
pub struct TunnelConfig {
    hops: Vec<TunnelHopConfig>,
    is_inbound: bool,
    is_short: bool,
    far_end_transports: FarEndTransports,
}

impl TunnelConfig {
    /// Config for an inbound tunnel: the last hop forwards to us.
    ///
    /// `local` is our own router hash; a fresh receive id is generated for
    /// the local end.
    pub fn inbound(
        peers: Vec<RouterInfo>,
        local: RouterHash,
        is_short: bool,
        rng: &mut dyn RngCore,
    ) -> Result<Self> {
        let mut config = Self::chain(peers, is_short, true, rng)?;
        let last = config.hops.len() - 1;
        config.hops[0].is_inbound_gateway = true;
        config.hops[last].next_ident = local;
        config.hops[last].next_tunnel_id = rng.next_u32();
        Ok(config)
    }

    /// Config for an outbound tunnel: the last hop is the outbound
    /// endpoint, forwarding the build reply to `reply_gateway` /
    /// `reply_tunnel_id` (the gateway of one of our inbound tunnels).
    pub fn outbound(
        peers: Vec<RouterInfo>,
        reply_gateway: RouterHash,
        reply_tunnel_id: TunnelId,
        is_short: bool,
        rng: &mut dyn RngCore,
    ) -> Result<Self> {
        let mut config = Self::chain(peers, is_short, false, rng)?;
        let last = config.hops.len() - 1;
        config.hops[last].is_outbound_endpoint = true;
        config.hops[last].next_ident = reply_gateway;
        config.hops[last].next_tunnel_id = reply_tunnel_id;
        Ok(config)
    }

    fn chain(
        peers: Vec<RouterInfo>,
        is_short: bool,
        is_inbound: bool,
        rng: &mut dyn RngCore,
    ) -> Result<Self> {
        if peers.is_empty() {
            return Err(TunnelError::EmptyHopChain);
        }
        let mut hops: Vec<TunnelHopConfig> = peers
            .into_iter()
            .map(|peer| TunnelHopConfig::new(peer, rng))
            .collect();
        for i in 0..hops.len() - 1 {
            hops[i].next_ident = hops[i + 1].ident.hash;
            hops[i].next_tunnel_id = hops[i + 1].recv_tunnel_id;
        }
        Ok(Self {
            hops,
            is_inbound,
            is_short,
            far_end_transports: FarEndTransports::All,
        })
    }

    pub fn is_inbound(&self) -> bool {
        self.is_inbound
    }

    pub fn is_short(&self) -> bool {
        self.is_short
    }

    pub fn far_end_transports(&self) -> FarEndTransports {
        self.far_end_transports
    }

    pub fn set_far_end_transports(&mut self, transports: FarEndTransports) {
        self.far_end_transports = transports;
    }

    pub fn num_hops(&self) -> usize {
        self.hops.len()
    }

    /// Build record size for this tunnel; mixing sizes within one build
    /// is forbidden, so the choice is per-config.
    pub fn record_size(&self) -> usize {
        if self.is_short {
            SHORT_TUNNEL_BUILD_RECORD_SIZE
        } else {
            TUNNEL_BUILD_RECORD_SIZE
        }
    }

    /// Our local id for this tunnel: the id we receive on (inbound) or the
    /// first hop's receive id (outbound).
    pub fn tunnel_id(&self) -> TunnelId {
        if self.is_inbound {
            self.hops[self.hops.len() - 1].next_tunnel_id
        } else {
            self.hops[0].recv_tunnel_id
        }
    }

    /// Receive id of the first hop: where tunnel data enters the chain.
    /// For an inbound tunnel this is the gateway id remote senders use.
    pub fn next_tunnel_id(&self) -> TunnelId {
        self.hops[0].recv_tunnel_id
    }

    /// Router hash of the first hop
    pub fn next_ident(&self) -> RouterHash {
        self.hops[0].ident.hash
    }

    pub fn first_hop(&self) -> &TunnelHopConfig {
        &self.hops[0]
    }

    pub fn last_hop(&self) -> &TunnelHopConfig {
        &self.hops[self.hops.len() - 1]
    }

    pub(crate) fn hops(&self) -> &[TunnelHopConfig] {
        &self.hops
    }

    pub(crate) fn hops_mut(&mut self) -> &mut [TunnelHopConfig] {
        &mut self.hops
    }

    /// Peers in traversal order
    pub fn peers(&self) -> Vec<RouterInfo> {
        self.hops.iter().map(|h| h.ident.clone()).collect()
    }

    /// Peers in reverse traversal order (endpoint first)
    pub fn inverted_peers(&self) -> Vec<RouterInfo> {
        let mut peers = self.peers();
        peers.reverse();
        peers
    }
}
