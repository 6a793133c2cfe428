//! Tunnel pools: a set of tunnels serving one local destination
//!
//! A pool owns its tunnels (shared with the registries) and holds the
//! target hop counts and quantities. Periodic maintenance tops the pool
//! up; near-expiry tunnels ask the pool for a successor with the same
//! peers. Tunnels keep only a weak back-reference, so deactivating a pool
//! and detaching lets its tunnels age out naturally.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, warn};

use garliccraft_core::RouterInfo;

use crate::config::TunnelConfig;
use crate::inbound::InboundTunnel;
use crate::manager::Tunnels;
use crate::outbound::OutboundTunnel;
use crate::traits::LocalDestination;

pub struct TunnelPool {
    num_inbound_hops: usize,
    num_outbound_hops: usize,
    inbound_quantity: usize,
    outbound_quantity: usize,
    inbound: Mutex<Vec<Arc<InboundTunnel>>>,
    outbound: Mutex<Vec<Arc<OutboundTunnel>>>,
    pending_inbound: Mutex<Vec<Arc<InboundTunnel>>>,
    pending_outbound: Mutex<Vec<Arc<OutboundTunnel>>>,
    active: AtomicBool,
    rng: Mutex<StdRng>,
    local_destination: Mutex<Option<Arc<dyn LocalDestination>>>,
    manager: Mutex<Weak<Tunnels>>,
    self_ref: Weak<TunnelPool>,
}

impl TunnelPool {
    pub fn new(
        num_inbound_hops: usize,
        num_outbound_hops: usize,
        inbound_quantity: usize,
        outbound_quantity: usize,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            num_inbound_hops,
            num_outbound_hops,
            inbound_quantity,
            outbound_quantity,
            inbound: Mutex::new(Vec::new()),
            outbound: Mutex::new(Vec::new()),
            pending_inbound: Mutex::new(Vec::new()),
            pending_outbound: Mutex::new(Vec::new()),
            active: AtomicBool::new(true),
            rng: Mutex::new(StdRng::from_entropy()),
            local_destination: Mutex::new(None),
            manager: Mutex::new(Weak::new()),
            self_ref: me.clone(),
        })
    }

    pub(crate) fn set_manager(&self, manager: Weak<Tunnels>) {
        *self.manager.lock().unwrap() = manager;
    }

    fn manager(&self) -> Option<Arc<Tunnels>> {
        self.manager.lock().unwrap().upgrade()
    }

    fn self_arc(&self) -> Option<Arc<TunnelPool>> {
        self.self_ref.upgrade()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }

    pub fn num_inbound_hops(&self) -> usize {
        self.num_inbound_hops
    }

    pub fn num_outbound_hops(&self) -> usize {
        self.num_outbound_hops
    }

    pub fn inbound_quantity(&self) -> usize {
        self.inbound_quantity
    }

    pub fn outbound_quantity(&self) -> usize {
        self.outbound_quantity
    }

    pub fn local_destination(&self) -> Option<Arc<dyn LocalDestination>> {
        self.local_destination.lock().unwrap().clone()
    }

    pub fn set_local_destination(&self, destination: Option<Arc<dyn LocalDestination>>) {
        *self.local_destination.lock().unwrap() = destination;
    }

    /// Run a closure with the pool's RNG (used for build-record shuffles
    /// and recreation ordering)
    pub fn with_rng<R>(&self, f: impl FnOnce(&mut StdRng) -> R) -> R {
        f(&mut self.rng.lock().unwrap())
    }

    pub fn count_inbound_tunnels(&self) -> usize {
        self.inbound.lock().unwrap().len()
    }

    pub fn count_outbound_tunnels(&self) -> usize {
        self.outbound.lock().unwrap().len()
    }

    pub fn inbound_tunnel_created(&self, tunnel: &Arc<InboundTunnel>) {
        self.pending_inbound
            .lock()
            .unwrap()
            .retain(|t| !Arc::ptr_eq(t, tunnel));
        self.inbound.lock().unwrap().push(tunnel.clone());
    }

    pub fn outbound_tunnel_created(&self, tunnel: &Arc<OutboundTunnel>) {
        self.pending_outbound
            .lock()
            .unwrap()
            .retain(|t| !Arc::ptr_eq(t, tunnel));
        self.outbound.lock().unwrap().push(tunnel.clone());
    }

    pub fn inbound_tunnel_expired(&self, tunnel: &Arc<InboundTunnel>) {
        self.inbound.lock().unwrap().retain(|t| !Arc::ptr_eq(t, tunnel));
    }

    pub fn outbound_tunnel_expired(&self, tunnel: &Arc<OutboundTunnel>) {
        self.outbound.lock().unwrap().retain(|t| !Arc::ptr_eq(t, tunnel));
    }

    /// Break the back-edge from every owned tunnel so they age out under
    /// the global sweeps, then forget them.
    pub fn detach_tunnels(&self) {
        for t in self.inbound.lock().unwrap().drain(..) {
            t.core().set_tunnel_pool(None);
        }
        for t in self.outbound.lock().unwrap().drain(..) {
            t.core().set_tunnel_pool(None);
        }
        for t in self.pending_inbound.lock().unwrap().drain(..) {
            t.core().set_tunnel_pool(None);
        }
        for t in self.pending_outbound.lock().unwrap().drain(..) {
            t.core().set_tunnel_pool(None);
        }
    }

    /// Build a successor inbound tunnel through the same peers
    pub fn recreate_inbound_tunnel(&self, old: &InboundTunnel) {
        let Some(manager) = self.manager() else { return };
        let Some(this) = self.self_arc() else { return };
        let peers = old.core().peers();
        if peers.is_empty() {
            manager.create_zero_hops_inbound_tunnel(Some(this));
            return;
        }
        let config = self.with_rng(|rng| {
            TunnelConfig::inbound(
                peers,
                manager.ctx().local_hash,
                old.core().is_short_build(),
                rng,
            )
        });
        match config {
            Ok(config) => {
                debug!("Tunnel: Recreating inbound tunnel {}", old.core().tunnel_id());
                let via = manager.get_next_outbound_tunnel();
                let tunnel = manager.create_inbound_tunnel(config, Some(this), via);
                self.pending_inbound.lock().unwrap().push(tunnel);
            }
            Err(e) => warn!("Tunnel: inbound recreation failed: {}", e),
        }
    }

    /// Build a successor outbound tunnel through the same peers
    pub fn recreate_outbound_tunnel(&self, old: &OutboundTunnel) {
        let Some(manager) = self.manager() else { return };
        let Some(this) = self.self_arc() else { return };
        let peers = old.core().peers();
        if peers.is_empty() {
            manager.create_zero_hops_outbound_tunnel(Some(this));
            return;
        }
        let Some(reply) = self.select_reply_gateway(&manager) else {
            warn!("Tunnel: no inbound tunnel for outbound recreation");
            return;
        };
        let config = self.with_rng(|rng| {
            TunnelConfig::outbound(
                peers,
                reply.core().next_ident(),
                reply.core().next_tunnel_id(),
                old.core().is_short_build(),
                rng,
            )
        });
        match config {
            Ok(config) => {
                debug!(
                    "Tunnel: Recreating outbound tunnel {}",
                    old.core().tunnel_id()
                );
                let tunnel = manager.create_outbound_tunnel(config, Some(this), None);
                self.pending_outbound.lock().unwrap().push(tunnel);
            }
            Err(e) => warn!("Tunnel: outbound recreation failed: {}", e),
        }
    }

    /// An inbound tunnel whose gateway can receive our build replies:
    /// prefer the pool's own, fall back to any established inbound.
    fn select_reply_gateway(&self, manager: &Arc<Tunnels>) -> Option<Arc<InboundTunnel>> {
        self.inbound
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.is_established())
            .cloned()
            .or_else(|| manager.get_next_inbound_tunnel())
    }

    /// Top the pool up to its configured quantities
    pub fn manage_tunnels(&self, _ts: u64) {
        if !self.is_active() {
            return;
        }
        let Some(manager) = self.manager() else { return };

        self.prune_pending();

        let need_inbound = self.inbound_quantity.saturating_sub(
            self.count_inbound_tunnels() + self.pending_inbound.lock().unwrap().len(),
        );
        for _ in 0..need_inbound {
            self.create_pool_inbound(&manager);
        }

        let need_outbound = self.outbound_quantity.saturating_sub(
            self.count_outbound_tunnels() + self.pending_outbound.lock().unwrap().len(),
        );
        for _ in 0..need_outbound {
            self.create_pool_outbound(&manager);
        }
    }

    /// Forget pending builds that resolved or died; resolved ones were
    /// moved to the live lists by `*_tunnel_created`.
    fn prune_pending(&self) {
        use garliccraft_core::TunnelState::*;
        self.pending_inbound
            .lock()
            .unwrap()
            .retain(|t| matches!(t.core().state(), Pending | BuildReplyReceived));
        self.pending_outbound
            .lock()
            .unwrap()
            .retain(|t| matches!(t.core().state(), Pending | BuildReplyReceived));
    }

    fn create_pool_inbound(&self, manager: &Arc<Tunnels>) {
        let Some(this) = self.self_arc() else { return };
        if self.num_inbound_hops == 0 {
            manager.create_zero_hops_inbound_tunnel(Some(this));
            return;
        }
        let Some(peers) = self.select_peers(manager, self.num_inbound_hops) else {
            warn!("Tunnel: not enough routers for inbound pool tunnel");
            return;
        };
        let config =
            self.with_rng(|rng| TunnelConfig::inbound(peers, manager.ctx().local_hash, true, rng));
        if let Ok(config) = config {
            let via = manager.get_next_outbound_tunnel();
            let tunnel = manager.create_inbound_tunnel(config, Some(this), via);
            self.pending_inbound.lock().unwrap().push(tunnel);
        }
    }

    fn create_pool_outbound(&self, manager: &Arc<Tunnels>) {
        let Some(this) = self.self_arc() else { return };
        if self.num_outbound_hops == 0 {
            manager.create_zero_hops_outbound_tunnel(Some(this));
            return;
        }
        let Some(reply) = self.select_reply_gateway(manager) else {
            debug!("Tunnel: no inbound tunnel yet for outbound pool tunnel");
            return;
        };
        let Some(peers) = self.select_peers(manager, self.num_outbound_hops) else {
            warn!("Tunnel: not enough routers for outbound pool tunnel");
            return;
        };
        let config = self.with_rng(|rng| {
            TunnelConfig::outbound(
                peers,
                reply.core().next_ident(),
                reply.core().next_tunnel_id(),
                true,
                rng,
            )
        });
        if let Ok(config) = config {
            let tunnel = manager.create_outbound_tunnel(config, Some(this), None);
            self.pending_outbound.lock().unwrap().push(tunnel);
        }
    }

    /// Pick `n` distinct reachable routers, never ourselves
    fn select_peers(&self, manager: &Arc<Tunnels>, n: usize) -> Option<Vec<RouterInfo>> {
        let ctx = manager.ctx();
        let mut peers: Vec<RouterInfo> = Vec::with_capacity(n);
        let mut exclude = ctx.local_hash;
        let mut attempts = 0;
        while peers.len() < n && attempts < n * 8 {
            attempts += 1;
            let Some(router) = ctx.netdb.random_router(&exclude, true, false) else {
                continue;
            };
            if router.hash == ctx.local_hash || peers.iter().any(|p| p.hash == router.hash) {
                continue;
            }
            exclude = router.hash;
            peers.push(router);
        }
        (peers.len() == n).then_some(peers)
    }
}
