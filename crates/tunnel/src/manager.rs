//! Tunnel registries, dispatch pump, and maintenance
//!
//! [`Tunnels`] owns every locally known tunnel: the dispatch registry
//! keyed by tunnel id, the per-direction lists, and the pending maps
//! keyed by build reply message id. One worker task drains the inbound
//! message queue, demultiplexes by tunnel id with a rolling
//! previous-tunnel cache, and runs the periodic sweeps between drains.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{RngCore, SeedableRng};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use garliccraft_core::{
    I2npMessage, I2npMessageType, MessageBufferPool, TunnelId, TunnelSettings, TunnelState,
    TUNNEL_GATEWAY_HEADER_LENGTH_OFFSET, TUNNEL_GATEWAY_HEADER_SIZE,
};

use crate::config::TunnelConfig;
use crate::inbound::InboundTunnel;
use crate::outbound::OutboundTunnel;
use crate::pool::TunnelPool;
use crate::seconds_since_epoch;
use crate::traits::RouterContext;
use crate::tunnel::TunnelBase;
use crate::{
    MAX_TUNNEL_MSGS_BATCH_SIZE, TCSR_SMOOTHING_CONSTANT, TCSR_START_VALUE,
    TUNNEL_CREATION_TIMEOUT, TUNNEL_EXPIRATION_THRESHOLD, TUNNEL_EXPIRATION_TIMEOUT,
    TUNNEL_MANAGE_INTERVAL, TUNNEL_MEMORY_POOL_MANAGE_INTERVAL, TUNNEL_POOLS_MANAGE_INTERVAL,
    TUNNEL_RECREATION_THRESHOLD,
};

/// Dispatch counters, exposed for observability
#[derive(Default)]
pub struct TunnelStats {
    msgs_processed: AtomicU64,
    registry_lookups: AtomicU64,
    batch_flushes: AtomicU64,
}

impl TunnelStats {
    pub fn msgs_processed(&self) -> u64 {
        self.msgs_processed.load(Ordering::Relaxed)
    }

    pub fn registry_lookups(&self) -> u64 {
        self.registry_lookups.load(Ordering::Relaxed)
    }

    pub fn batch_flushes(&self) -> u64 {
        self.batch_flushes.load(Ordering::Relaxed)
    }
}

/// Rolling cache of the last tunnel a data message was dispatched to,
/// so bursts from one tunnel cost a single registry lookup and batches
/// flush on tunnel change.
#[derive(Default)]
struct PrevTunnelCache {
    tunnel_id: TunnelId,
    tunnel: Option<Arc<dyn TunnelBase>>,
}

enum RecreateCandidate {
    Inbound(Arc<InboundTunnel>),
    Outbound(Arc<OutboundTunnel>),
}

trait PendingTunnel: Send + Sync {
    fn core(&self) -> &crate::tunnel::TunnelCore;
}

impl PendingTunnel for InboundTunnel {
    fn core(&self) -> &crate::tunnel::TunnelCore {
        InboundTunnel::core(self)
    }
}

impl PendingTunnel for OutboundTunnel {
    fn core(&self) -> &crate::tunnel::TunnelCore {
        OutboundTunnel::core(self)
    }
}

/// The tunnel core: registries, dispatcher, and maintainer
pub struct Tunnels {
    ctx: Arc<RouterContext>,
    settings: TunnelSettings,
    /// Dispatch registry: every locally known tunnel reachable by id.
    /// Outbound tunnels are not here; dispatch never looks them up.
    tunnels: Mutex<HashMap<TunnelId, Arc<dyn TunnelBase>>>,
    inbound: Mutex<Vec<Arc<InboundTunnel>>>,
    outbound: Mutex<Vec<Arc<OutboundTunnel>>>,
    pending_inbound: Mutex<HashMap<u32, Arc<InboundTunnel>>>,
    pending_outbound: Mutex<HashMap<u32, Arc<OutboundTunnel>>>,
    pools: Mutex<Vec<Arc<TunnelPool>>>,
    exploratory_pool: Mutex<Option<Arc<TunnelPool>>>,
    queue_tx: mpsc::UnboundedSender<I2npMessage>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<I2npMessage>>>,
    shutdown: Notify,
    running: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    rng: Mutex<StdRng>,
    buffer_pool: Arc<MessageBufferPool>,
    max_transit_tunnels: AtomicU32,
    total_successive_creations: AtomicU64,
    total_failed_creations: AtomicU64,
    success_rate: Mutex<f64>,
    stats: TunnelStats,
    self_ref: Weak<Tunnels>,
}

impl Tunnels {
    pub fn new(ctx: Arc<RouterContext>, settings: TunnelSettings) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let max_transit = settings.max_num_transit_tunnels;
        Arc::new_cyclic(|me| Self {
            ctx,
            settings,
            tunnels: Mutex::new(HashMap::new()),
            inbound: Mutex::new(Vec::new()),
            outbound: Mutex::new(Vec::new()),
            pending_inbound: Mutex::new(HashMap::new()),
            pending_outbound: Mutex::new(HashMap::new()),
            pools: Mutex::new(Vec::new()),
            exploratory_pool: Mutex::new(None),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            shutdown: Notify::new(),
            running: AtomicBool::new(false),
            worker: Mutex::new(None),
            rng: Mutex::new(StdRng::from_entropy()),
            buffer_pool: Arc::new(MessageBufferPool::default()),
            max_transit_tunnels: AtomicU32::new(max_transit),
            total_successive_creations: AtomicU64::new(0),
            total_failed_creations: AtomicU64::new(0),
            success_rate: Mutex::new(TCSR_START_VALUE),
            stats: TunnelStats::default(),
            self_ref: me.clone(),
        })
    }

    pub(crate) fn ctx(&self) -> &Arc<RouterContext> {
        &self.ctx
    }

    pub fn stats(&self) -> &TunnelStats {
        &self.stats
    }

    // ==================== queue & worker ====================

    /// Enqueue a wire message for the dispatch worker. Callable from any
    /// thread.
    pub fn post_tunnel_data(&self, msg: I2npMessage) {
        let _ = self.queue_tx.send(msg);
    }

    pub fn post_tunnel_data_batch(&self, msgs: Vec<I2npMessage>) {
        for msg in msgs {
            self.post_tunnel_data(msg);
        }
    }

    /// Spawn the dispatch worker. Must run inside a tokio runtime.
    pub fn start(&self) {
        let Some(this) = self.self_ref.upgrade() else {
            return;
        };
        let Some(rx) = self.queue_rx.lock().unwrap().take() else {
            warn!("Tunnel: dispatcher already started");
            return;
        };
        self.running.store(true, Ordering::SeqCst);
        *self.worker.lock().unwrap() = Some(tokio::spawn(this.run(rx)));
    }

    /// Stop the worker: clear the running flag, poke the queue, join.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_one();
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Both comparisons are needed: the reverse one catches clocks that
    /// jumped backwards.
    fn interval_due(ts: u64, last: u64, interval: u64) -> bool {
        ts.wrapping_sub(last) >= interval || ts + interval < last
    }

    async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<I2npMessage>) {
        // let the rest of the router come up first
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;

        let mut last_ts = 0u64;
        let mut last_pools_ts = 0u64;
        let mut last_memory_pool_ts = 0u64;

        while self.running.load(Ordering::SeqCst) {
            let first = tokio::select! {
                msg = rx.recv() => msg,
                _ = self.shutdown.notified() => None,
                _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => None,
            };

            if let Some(first) = first {
                let mut msgs = vec![first];
                while let Ok(msg) = rx.try_recv() {
                    msgs.push(msg);
                }
                let mut cache = PrevTunnelCache::default();
                let mut num_msgs = 0;
                loop {
                    num_msgs += self.process_batch(&mut cache, msgs);
                    msgs = Vec::new();
                    if num_msgs < MAX_TUNNEL_MSGS_BATCH_SIZE {
                        while let Ok(msg) = rx.try_recv() {
                            msgs.push(msg);
                        }
                    }
                    if msgs.is_empty() {
                        break;
                    }
                }
                self.flush_prev(&mut cache);
            }

            if self.ctx.transport.is_online() {
                let ts = seconds_since_epoch();
                if Self::interval_due(ts, last_ts, TUNNEL_MANAGE_INTERVAL) {
                    self.manage_tunnels(ts);
                    last_ts = ts;
                }
                if Self::interval_due(ts, last_pools_ts, TUNNEL_POOLS_MANAGE_INTERVAL) {
                    self.manage_tunnel_pools(ts);
                    last_pools_ts = ts;
                }
                if Self::interval_due(ts, last_memory_pool_ts, TUNNEL_MEMORY_POOL_MANAGE_INTERVAL)
                {
                    self.buffer_pool.clean_up();
                    last_memory_pool_ts = ts;
                }
            }
        }

        // drain on shutdown; dropped messages fire their on_drop hooks
        while rx.try_recv().is_ok() {}
    }

    // ==================== dispatch ====================

    /// Synchronously dispatch a batch of wire messages, flushing the last
    /// touched tunnel at the end. This is the pump core the worker runs;
    /// it is public so embedders and tests can drive it directly.
    pub fn process_messages(&self, msgs: Vec<I2npMessage>) -> usize {
        let mut cache = PrevTunnelCache::default();
        let count = self.process_batch(&mut cache, msgs);
        self.flush_prev(&mut cache);
        count
    }

    fn flush_prev(&self, cache: &mut PrevTunnelCache) {
        if let Some(tunnel) = cache.tunnel.take() {
            tunnel.flush_tunnel_data_msgs();
            self.stats.batch_flushes.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn process_batch(&self, cache: &mut PrevTunnelCache, msgs: Vec<I2npMessage>) -> usize {
        let mut num_msgs = 0;
        for msg in msgs {
            match msg.type_id {
                I2npMessageType::TunnelData | I2npMessageType::TunnelGateway => {
                    let tunnel_id = match msg.tunnel_id() {
                        Ok(id) => id,
                        Err(e) => {
                            warn!("Tunnel: {}", e);
                            continue;
                        }
                    };
                    let mut tunnel = None;
                    if tunnel_id == cache.tunnel_id {
                        tunnel = cache.tunnel.clone();
                    } else if cache.tunnel.is_some() {
                        self.flush_prev(cache);
                    }
                    if tunnel.is_none() {
                        tunnel = self.get_tunnel(tunnel_id);
                    }
                    match &tunnel {
                        Some(t) => {
                            if msg.type_id == I2npMessageType::TunnelData {
                                t.clone().handle_tunnel_data_msg(msg);
                            } else {
                                self.handle_tunnel_gateway_msg(t, msg);
                            }
                        }
                        None => warn!(
                            "Tunnel: Tunnel not found, tunnel_id={} previous_tunnel_id={} type={:?}",
                            tunnel_id, cache.tunnel_id, msg.type_id
                        ),
                    }
                    cache.tunnel_id = tunnel_id;
                    cache.tunnel = tunnel;
                }
                I2npMessageType::ShortTunnelBuild | I2npMessageType::VariableTunnelBuild => {
                    self.handle_tunnel_build_msg(msg);
                    cache.tunnel = None;
                }
                I2npMessageType::ShortTunnelBuildReply => {
                    self.handle_tunnel_build_reply_msg(msg, true);
                    cache.tunnel = None;
                }
                I2npMessageType::VariableTunnelBuildReply => {
                    self.handle_tunnel_build_reply_msg(msg, false);
                    cache.tunnel = None;
                }
                I2npMessageType::TunnelBuild | I2npMessageType::TunnelBuildReply => {
                    warn!("Tunnel: TunnelBuild is too old for ECIES router");
                    cache.tunnel = None;
                }
                other => {
                    warn!("Tunnel: Unexpected message type {:?}", other);
                    cache.tunnel = None;
                }
            }
            num_msgs += 1;
            self.stats.msgs_processed.fetch_add(1, Ordering::Relaxed);
        }
        num_msgs
    }

    /// Unwrap a tunnel gateway envelope and feed the inner message into
    /// the tunnel at its gateway.
    fn handle_tunnel_gateway_msg(&self, tunnel: &Arc<dyn TunnelBase>, msg: I2npMessage) {
        let payload = &msg.payload;
        if payload.len() < TUNNEL_GATEWAY_HEADER_SIZE {
            warn!("Tunnel: gateway message too short");
            return;
        }
        let len = u16::from_be_bytes([
            payload[TUNNEL_GATEWAY_HEADER_LENGTH_OFFSET],
            payload[TUNNEL_GATEWAY_HEADER_LENGTH_OFFSET + 1],
        ]) as usize;
        if TUNNEL_GATEWAY_HEADER_SIZE + len > payload.len() {
            error!(
                "Tunnel: Gateway payload {} exceeds message length {}",
                len,
                payload.len()
            );
            return;
        }
        let inner =
            match I2npMessage::from_bytes(&payload[TUNNEL_GATEWAY_HEADER_SIZE..TUNNEL_GATEWAY_HEADER_SIZE + len]) {
                Ok(inner) => inner,
                Err(e) => {
                    warn!("Tunnel: bad gateway payload: {}", e);
                    return;
                }
            };
        debug!(
            "Tunnel: Gateway of {} bytes for tunnel {}, msg type {:?}",
            len,
            tunnel.tunnel_id(),
            inner.type_id
        );
        tunnel.clone().send_tunnel_data_msg(inner);
    }

    /// A build message either answers one of our pending inbound tunnels
    /// (we are its endpoint) or belongs to the transit subsystem.
    fn handle_tunnel_build_msg(&self, msg: I2npMessage) {
        match self.get_pending_inbound_tunnel(msg.msg_id) {
            Some(tunnel) => {
                debug!(
                    "Tunnel: Build reply for inbound tunnel {}",
                    tunnel.core().tunnel_id()
                );
                if tunnel.handle_build_response(&msg.payload) {
                    info!(
                        "Tunnel: Inbound tunnel {} has been created",
                        tunnel.core().tunnel_id()
                    );
                    self.add_inbound_tunnel(tunnel);
                } else {
                    info!(
                        "Tunnel: Inbound tunnel {} has been declined",
                        tunnel.core().tunnel_id()
                    );
                    tunnel.core().set_state(TunnelState::BuildFailed);
                }
            }
            None => self.ctx.transit.post_transit_build(msg),
        }
    }

    fn handle_tunnel_build_reply_msg(&self, msg: I2npMessage, _is_short: bool) {
        match self.get_pending_outbound_tunnel(msg.msg_id) {
            Some(tunnel) => {
                debug!(
                    "Tunnel: TunnelBuildReply for tunnel {}",
                    tunnel.core().tunnel_id()
                );
                if tunnel.handle_build_response(&msg.payload) {
                    info!(
                        "Tunnel: Outbound tunnel {} has been created",
                        tunnel.core().tunnel_id()
                    );
                    self.add_outbound_tunnel(tunnel);
                } else {
                    info!(
                        "Tunnel: Outbound tunnel {} has been declined",
                        tunnel.core().tunnel_id()
                    );
                    tunnel.core().set_state(TunnelState::BuildFailed);
                }
            }
            None => warn!(
                "Tunnel: Pending tunnel for message {} not found",
                msg.msg_id
            ),
        }
    }

    // ==================== registries ====================

    pub fn get_tunnel(&self, tunnel_id: TunnelId) -> Option<Arc<dyn TunnelBase>> {
        self.stats.registry_lookups.fetch_add(1, Ordering::Relaxed);
        self.tunnels.lock().unwrap().get(&tunnel_id).cloned()
    }

    /// Register a tunnel for dispatch; fails on a duplicate id.
    pub fn add_tunnel(&self, tunnel: Arc<dyn TunnelBase>) -> bool {
        use std::collections::hash_map::Entry;
        match self.tunnels.lock().unwrap().entry(tunnel.tunnel_id()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(tunnel);
                true
            }
        }
    }

    pub fn remove_tunnel(&self, tunnel_id: TunnelId) {
        self.tunnels.lock().unwrap().remove(&tunnel_id);
    }

    pub fn count_inbound_tunnels(&self) -> usize {
        self.inbound.lock().unwrap().len()
    }

    pub fn count_outbound_tunnels(&self) -> usize {
        self.outbound.lock().unwrap().len()
    }

    /// Track a pending tunnel under its reply message id. A colliding id
    /// overwrites: last writer wins, and the displaced entry ages out of
    /// the pending sweep. The 32-bit id has enough entropy that this is
    /// not worth hardening against.
    pub fn add_pending_inbound_tunnel(&self, reply_msg_id: u32, tunnel: Arc<InboundTunnel>) {
        self.pending_inbound
            .lock()
            .unwrap()
            .insert(reply_msg_id, tunnel);
    }

    pub fn add_pending_outbound_tunnel(&self, reply_msg_id: u32, tunnel: Arc<OutboundTunnel>) {
        self.pending_outbound
            .lock()
            .unwrap()
            .insert(reply_msg_id, tunnel);
    }

    /// Look up a pending inbound tunnel by reply id and mark the reply
    /// received. Only tunnels still in `Pending` match.
    pub fn get_pending_inbound_tunnel(&self, reply_msg_id: u32) -> Option<Arc<InboundTunnel>> {
        Self::get_pending(&self.pending_inbound, reply_msg_id)
    }

    pub fn get_pending_outbound_tunnel(&self, reply_msg_id: u32) -> Option<Arc<OutboundTunnel>> {
        Self::get_pending(&self.pending_outbound, reply_msg_id)
    }

    fn get_pending<T: PendingTunnel>(
        map: &Mutex<HashMap<u32, Arc<T>>>,
        reply_msg_id: u32,
    ) -> Option<Arc<T>> {
        let map = map.lock().unwrap();
        let tunnel = map.get(&reply_msg_id)?;
        if tunnel.core().state() == TunnelState::Pending {
            tunnel.core().set_state(TunnelState::BuildReplyReceived);
            Some(tunnel.clone())
        } else {
            None
        }
    }

    /// Least-loaded established inbound tunnel (fewest received bytes)
    pub fn get_next_inbound_tunnel(&self) -> Option<Arc<InboundTunnel>> {
        let inbound = self.inbound.lock().unwrap();
        let mut best: Option<&Arc<InboundTunnel>> = None;
        let mut min_received = 0u64;
        for tunnel in inbound.iter() {
            if !tunnel.is_established() {
                continue;
            }
            if best.is_none() || tunnel.num_received_bytes() < min_received {
                best = Some(tunnel);
                min_received = tunnel.num_received_bytes();
            }
        }
        best.cloned()
    }

    /// Uniformly random established outbound tunnel
    pub fn get_next_outbound_tunnel(&self) -> Option<Arc<OutboundTunnel>> {
        let outbound = self.outbound.lock().unwrap();
        if outbound.is_empty() {
            return None;
        }
        let ind = (self.rng.lock().unwrap().next_u32() as usize) % outbound.len();
        let mut i = 0;
        let mut tunnel = None;
        for t in outbound.iter() {
            if t.is_established() {
                tunnel = Some(t.clone());
                i += 1;
            }
            if i > ind && tunnel.is_some() {
                break;
            }
        }
        tunnel
    }

    // ==================== pools ====================

    pub fn create_tunnel_pool(
        &self,
        num_inbound_hops: usize,
        num_outbound_hops: usize,
        num_inbound_tunnels: usize,
        num_outbound_tunnels: usize,
    ) -> Arc<TunnelPool> {
        let pool = TunnelPool::new(
            num_inbound_hops,
            num_outbound_hops,
            num_inbound_tunnels,
            num_outbound_tunnels,
        );
        pool.set_manager(self.self_ref.clone());
        self.pools.lock().unwrap().push(pool.clone());
        pool
    }

    pub fn delete_tunnel_pool(&self, pool: &Arc<TunnelPool>) {
        self.stop_tunnel_pool(pool);
        self.pools.lock().unwrap().retain(|p| !Arc::ptr_eq(p, pool));
    }

    pub fn stop_tunnel_pool(&self, pool: &Arc<TunnelPool>) {
        pool.set_active(false);
        pool.detach_tunnels();
    }

    pub fn exploratory_pool(&self) -> Option<Arc<TunnelPool>> {
        self.exploratory_pool.lock().unwrap().clone()
    }

    // ==================== tunnel creation ====================

    pub fn create_inbound_tunnel(
        &self,
        config: TunnelConfig,
        pool: Option<Arc<TunnelPool>>,
        via: Option<Arc<OutboundTunnel>>,
    ) -> Arc<InboundTunnel> {
        let tunnel = InboundTunnel::new(config, self.ctx.clone(), self.buffer_pool.clone());
        tunnel.core().set_tunnel_pool(pool.as_ref());
        let reply_msg_id = self.rng.lock().unwrap().next_u32();
        self.add_pending_inbound_tunnel(reply_msg_id, tunnel.clone());
        tunnel.build(reply_msg_id, via.as_ref());
        tunnel
    }

    pub fn create_outbound_tunnel(
        &self,
        config: TunnelConfig,
        pool: Option<Arc<TunnelPool>>,
        via: Option<Arc<OutboundTunnel>>,
    ) -> Arc<OutboundTunnel> {
        let tunnel = OutboundTunnel::new(config, self.ctx.clone());
        tunnel.core().set_tunnel_pool(pool.as_ref());
        let reply_msg_id = self.rng.lock().unwrap().next_u32();
        self.add_pending_outbound_tunnel(reply_msg_id, tunnel.clone());
        tunnel.build(reply_msg_id, via.as_ref());
        tunnel
    }

    pub fn create_zero_hops_inbound_tunnel(
        &self,
        pool: Option<Arc<TunnelPool>>,
    ) -> Arc<InboundTunnel> {
        let tunnel = InboundTunnel::zero_hops(self.ctx.clone(), self.buffer_pool.clone());
        tunnel.core().set_tunnel_pool(pool.as_ref());
        tunnel.core().set_state(TunnelState::Established);
        self.inbound.lock().unwrap().push(tunnel.clone());
        if !self.add_tunnel(tunnel.clone()) {
            error!(
                "Tunnel: Tunnel with id {} already exists",
                tunnel.core().tunnel_id()
            );
        }
        tunnel
    }

    pub fn create_zero_hops_outbound_tunnel(
        &self,
        pool: Option<Arc<TunnelPool>>,
    ) -> Arc<OutboundTunnel> {
        let tunnel = OutboundTunnel::zero_hops(self.ctx.clone());
        tunnel.core().set_tunnel_pool(pool.as_ref());
        tunnel.core().set_state(TunnelState::Established);
        // not in the dispatch registry; nothing is addressed to it
        self.outbound.lock().unwrap().push(tunnel.clone());
        tunnel
    }

    /// Register an established inbound tunnel for dispatch. A pool-less
    /// tunnel triggers a symmetric outbound build through the same peers
    /// in reverse.
    pub fn add_inbound_tunnel(&self, tunnel: Arc<InboundTunnel>) {
        if self.add_tunnel(tunnel.clone()) {
            self.inbound.lock().unwrap().push(tunnel.clone());
            match tunnel.core().tunnel_pool() {
                None => {
                    let peers = tunnel.core().inverted_peers();
                    if !peers.is_empty() {
                        let config = {
                            let mut rng = self.rng.lock().unwrap();
                            TunnelConfig::outbound(
                                peers,
                                tunnel.core().next_ident(),
                                tunnel.core().next_tunnel_id(),
                                tunnel.core().is_short_build(),
                                &mut *rng,
                            )
                        };
                        match config {
                            Ok(config) => {
                                let via = self.get_next_outbound_tunnel();
                                self.create_outbound_tunnel(config, None, via);
                            }
                            Err(e) => warn!("Tunnel: symmetric outbound failed: {}", e),
                        }
                    }
                }
                Some(pool) => {
                    if pool.is_active() {
                        pool.inbound_tunnel_created(&tunnel);
                    } else {
                        tunnel.core().set_tunnel_pool(None);
                    }
                }
            }
        } else {
            error!(
                "Tunnel: Tunnel with id {} already exists",
                tunnel.core().tunnel_id()
            );
        }
    }

    /// Track an established outbound tunnel; dispatch never looks these
    /// up by id.
    pub fn add_outbound_tunnel(&self, tunnel: Arc<OutboundTunnel>) {
        self.outbound.lock().unwrap().push(tunnel.clone());
        match tunnel.core().tunnel_pool() {
            Some(pool) => {
                if pool.is_active() {
                    pool.outbound_tunnel_created(&tunnel);
                } else {
                    tunnel.core().set_tunnel_pool(None);
                }
            }
            None => {}
        }
    }

    // ==================== maintenance ====================

    /// Full sweep: pending maps, both direction lists, then recreation in
    /// random order.
    pub fn manage_tunnels(&self, ts: u64) {
        self.manage_pending_tunnels(ts);
        let mut to_recreate = Vec::new();
        self.manage_inbound_tunnels(ts, &mut to_recreate);
        self.manage_outbound_tunnels(ts, &mut to_recreate);
        if !to_recreate.is_empty() {
            if to_recreate.len() > 1 {
                to_recreate.shuffle(&mut *self.rng.lock().unwrap());
            }
            for candidate in to_recreate {
                match candidate {
                    RecreateCandidate::Inbound(t) => {
                        t.recreate();
                    }
                    RecreateCandidate::Outbound(t) => {
                        t.recreate();
                    }
                }
            }
        }
    }

    pub fn manage_tunnel_pools(&self, ts: u64) {
        let pools: Vec<_> = self.pools.lock().unwrap().clone();
        for pool in pools {
            if pool.is_active() {
                pool.manage_tunnels(ts);
            }
        }
    }

    fn manage_pending_tunnels(&self, ts: u64) {
        self.sweep_pending(&self.pending_inbound, ts);
        self.sweep_pending(&self.pending_outbound, ts);
    }

    /// Check pending tunnels: delete failed or timed out, count resolved.
    fn sweep_pending<T: PendingTunnel>(&self, map: &Mutex<HashMap<u32, Arc<T>>>, ts: u64) {
        let mut map = map.lock().unwrap();
        map.retain(|reply_msg_id, tunnel| match tunnel.core().state() {
            TunnelState::Pending => {
                let created = tunnel.core().creation_time();
                if ts > created + TUNNEL_CREATION_TIMEOUT
                    || ts + TUNNEL_CREATION_TIMEOUT < created
                {
                    debug!(
                        "Tunnel: Pending build request {} timeout, deleted",
                        reply_msg_id
                    );
                    for hash in tunnel.core().pending_hop_hashes() {
                        self.ctx.profiles.tunnel_non_replied(&hash);
                    }
                    self.failed_tunnel_creation();
                    false
                } else {
                    true
                }
            }
            TunnelState::BuildFailed => {
                debug!(
                    "Tunnel: Pending build request {} failed, deleted",
                    reply_msg_id
                );
                self.failed_tunnel_creation();
                false
            }
            // intermediate state, will become established or failed
            TunnelState::BuildReplyReceived => true,
            _ => {
                self.successive_tunnel_creation();
                false
            }
        });
    }

    fn manage_inbound_tunnels(&self, ts: u64, to_recreate: &mut Vec<RecreateCandidate>) {
        let mut expired = Vec::new();
        {
            let mut inbound = self.inbound.lock().unwrap();
            inbound.retain(|tunnel| {
                let core = tunnel.core();
                let created = core.creation_time();
                if core.is_failed()
                    || ts > created + TUNNEL_EXPIRATION_TIMEOUT
                    || ts + TUNNEL_EXPIRATION_TIMEOUT < created
                {
                    debug!(
                        "Tunnel: Tunnel with id {} expired or failed",
                        core.tunnel_id()
                    );
                    expired.push(tunnel.clone());
                    false
                } else {
                    true
                }
            });
            for tunnel in inbound.iter() {
                let core = tunnel.core();
                if core.is_established() {
                    if !core.is_recreated()
                        && ts + TUNNEL_RECREATION_THRESHOLD
                            > core.creation_time() + TUNNEL_EXPIRATION_TIMEOUT
                    {
                        // let it die if the pool was reconfigured with a
                        // different hop count
                        if let Some(pool) = core.tunnel_pool() {
                            if core.num_hops() == pool.num_inbound_hops() {
                                to_recreate.push(RecreateCandidate::Inbound(tunnel.clone()));
                            }
                        }
                    }
                    if ts + TUNNEL_EXPIRATION_THRESHOLD
                        > core.creation_time() + TUNNEL_EXPIRATION_TIMEOUT
                    {
                        core.set_state(TunnelState::Expiring);
                    } else {
                        // expiring tunnels don't need cleanup
                        tunnel.cleanup();
                    }
                }
            }
        }
        for tunnel in expired {
            if let Some(pool) = tunnel.core().tunnel_pool() {
                pool.inbound_tunnel_expired(&tunnel);
            }
            self.remove_tunnel(tunnel.core().tunnel_id());
        }

        if self.inbound.lock().unwrap().is_empty() {
            debug!("Tunnel: Creating zero hops inbound tunnel");
            self.create_zero_hops_inbound_tunnel(None);
            self.create_zero_hops_outbound_tunnel(None);
            let mut exploratory = self.exploratory_pool.lock().unwrap();
            if exploratory.is_none() {
                let e = &self.settings.exploratory;
                let pool = self.create_tunnel_pool(
                    e.inbound_length,
                    e.outbound_length,
                    e.inbound_quantity,
                    e.outbound_quantity,
                );
                pool.set_local_destination(Some(self.ctx.local_destination.clone()));
                *exploratory = Some(pool);
            }
            return;
        }

        if self.outbound.lock().unwrap().is_empty() || self.count_inbound_tunnels() < 3 {
            // build one more inbound; the request goes directly to the
            // hop, so it must be reachable by us
            let router = if self.ctx.transport.routes_restricted() {
                self.ctx.transport.restricted_peer()
            } else {
                self.ctx.netdb.random_router(&self.ctx.local_hash, true, false)
            };
            let Some(router) = router else {
                warn!("Tunnel: Can't find any router, skip creating tunnel");
                return;
            };
            debug!(
                "Tunnel: Creating one hop inbound tunnel via {}",
                hex::encode(&router.hash[..8])
            );
            let config = {
                let mut rng = self.rng.lock().unwrap();
                TunnelConfig::inbound(vec![router], self.ctx.local_hash, true, &mut *rng)
            };
            match config {
                Ok(config) => {
                    self.create_inbound_tunnel(config, None, None);
                }
                Err(e) => warn!("Tunnel: one hop inbound failed: {}", e),
            }
        }
    }

    fn manage_outbound_tunnels(
        &self,
        ts: u64,
        to_recreate: &mut Vec<RecreateCandidate>,
    ) {
        let mut expired = Vec::new();
        {
            let mut outbound = self.outbound.lock().unwrap();
            outbound.retain(|tunnel| {
                let core = tunnel.core();
                let created = core.creation_time();
                if core.is_failed()
                    || ts > created + TUNNEL_EXPIRATION_TIMEOUT
                    || ts + TUNNEL_EXPIRATION_TIMEOUT < created
                {
                    debug!(
                        "Tunnel: Tunnel with id {} expired or failed",
                        core.tunnel_id()
                    );
                    expired.push(tunnel.clone());
                    false
                } else {
                    true
                }
            });
            for tunnel in outbound.iter() {
                let core = tunnel.core();
                if core.is_established() {
                    if !core.is_recreated()
                        && ts + TUNNEL_RECREATION_THRESHOLD
                            > core.creation_time() + TUNNEL_EXPIRATION_TIMEOUT
                    {
                        if let Some(pool) = core.tunnel_pool() {
                            if core.num_hops() == pool.num_outbound_hops() {
                                to_recreate.push(RecreateCandidate::Outbound(tunnel.clone()));
                            }
                        }
                    }
                    if ts + TUNNEL_EXPIRATION_THRESHOLD
                        > core.creation_time() + TUNNEL_EXPIRATION_TIMEOUT
                    {
                        core.set_state(TunnelState::Expiring);
                    }
                }
            }
        }
        for tunnel in expired {
            if let Some(pool) = tunnel.core().tunnel_pool() {
                pool.outbound_tunnel_expired(&tunnel);
            }
            // outbound tunnels are not in the dispatch registry
        }

        if self.count_outbound_tunnels() < 3 {
            // try to create one more outbound tunnel
            let Some(inbound) = self.get_next_inbound_tunnel() else {
                return;
            };
            let router = if self.ctx.transport.routes_restricted() {
                self.ctx.transport.restricted_peer()
            } else {
                self.ctx.netdb.random_router(&self.ctx.local_hash, true, false)
            };
            let Some(router) = router else { return };
            debug!(
                "Tunnel: Creating one hop outbound tunnel via {}",
                hex::encode(&router.hash[..8])
            );
            let config = {
                let mut rng = self.rng.lock().unwrap();
                TunnelConfig::outbound(
                    vec![router],
                    inbound.core().next_ident(),
                    inbound.core().next_tunnel_id(),
                    true,
                    &mut *rng,
                )
            };
            match config {
                Ok(config) => {
                    self.create_outbound_tunnel(config, None, None);
                }
                Err(e) => warn!("Tunnel: one hop outbound failed: {}", e),
            }
        }
    }

    // ==================== creation counters ====================

    fn successive_tunnel_creation(&self) {
        self.total_successive_creations
            .fetch_add(1, Ordering::Relaxed);
        let mut rate = self.success_rate.lock().unwrap();
        *rate += TCSR_SMOOTHING_CONSTANT * (1.0 - *rate);
    }

    fn failed_tunnel_creation(&self) {
        self.total_failed_creations.fetch_add(1, Ordering::Relaxed);
        let mut rate = self.success_rate.lock().unwrap();
        *rate += TCSR_SMOOTHING_CONSTANT * (0.0 - *rate);
    }

    pub fn total_successive_tunnel_creations(&self) -> u64 {
        self.total_successive_creations.load(Ordering::Relaxed)
    }

    pub fn total_failed_tunnel_creations(&self) -> u64 {
        self.total_failed_creations.load(Ordering::Relaxed)
    }

    /// Smoothed tunnel creation success rate in `[0, 1]`
    pub fn tunnel_creation_success_rate(&self) -> f64 {
        *self.success_rate.lock().unwrap()
    }

    // ==================== transit glue ====================

    pub fn max_num_transit_tunnels(&self) -> u32 {
        self.max_transit_tunnels.load(Ordering::Relaxed)
    }

    pub fn set_max_num_transit_tunnels(&self, max: u32) {
        if max > 0 && self.max_num_transit_tunnels() != max {
            debug!("Tunnel: Max number of transit tunnels set to {}", max);
            self.max_transit_tunnels.store(max, Ordering::Relaxed);
        }
    }
}
