//! Tunnel core: shared state, build orchestration, response handling
//!
//! A tunnel is unidirectional; the local end is either the gateway
//! (outbound) or the endpoint (inbound). While pending it owns a
//! [`TunnelConfig`]; once established the per-hop layer keys are copied
//! into the runtime hop vector, stored in reverse traversal order
//! (endpoint first) so decrypting received payloads is a plain forward
//! fold.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{RngCore, SeedableRng};
use tracing::{debug, error, warn};

use garliccraft_core::{
    FarEndTransports, I2npMessage, I2npMessageType, OnDrop, RouterHash, RouterInfo, TunnelId,
    TunnelState, MAX_NUM_RECORDS, STANDARD_NUM_RECORDS,
};
use garliccraft_crypto::{wrap_for_router, LayerCipher};

use crate::config::TunnelConfig;
use crate::outbound::OutboundTunnel;
use crate::pool::TunnelPool;
use crate::seconds_since_epoch;
use crate::traits::RouterContext;
use crate::UNKNOWN_LATENCY;

/// Capability surface the dispatcher needs from any tunnel it can look up
/// by id.
pub trait TunnelBase: Send + Sync {
    fn tunnel_id(&self) -> TunnelId;

    /// A tunnel data message arrived for this tunnel
    fn handle_tunnel_data_msg(self: Arc<Self>, msg: I2npMessage);

    /// A payload should enter this tunnel at its gateway
    fn send_tunnel_data_msg(self: Arc<Self>, msg: I2npMessage);

    /// Force out any batched tunnel data
    fn flush_tunnel_data_msgs(&self);
}

/// One hop of an established tunnel
pub struct TunnelHop {
    pub ident: RouterInfo,
    pub(crate) layer: LayerCipher,
}

/// State shared by all tunnel variants
pub struct TunnelCore {
    tunnel_id: TunnelId,
    next_tunnel_id: TunnelId,
    next_ident: RouterHash,
    is_inbound: bool,
    created: AtomicU64,
    state: Mutex<TunnelState>,
    pool: Mutex<Weak<TunnelPool>>,
    config: Mutex<Option<TunnelConfig>>,
    /// Established hops, endpoint first
    hops: Mutex<Vec<TunnelHop>>,
    is_short: AtomicBool,
    far_end: Mutex<FarEndTransports>,
    recreated: AtomicBool,
    latency: AtomicU32,
    pub(crate) ctx: Arc<RouterContext>,
}

impl TunnelCore {
    pub(crate) fn from_config(config: TunnelConfig, ctx: Arc<RouterContext>) -> Self {
        Self {
            tunnel_id: config.tunnel_id(),
            next_tunnel_id: config.next_tunnel_id(),
            next_ident: config.next_ident(),
            is_inbound: config.is_inbound(),
            created: AtomicU64::new(seconds_since_epoch()),
            state: Mutex::new(TunnelState::Pending),
            pool: Mutex::new(Weak::new()),
            is_short: AtomicBool::new(config.is_short()),
            far_end: Mutex::new(config.far_end_transports()),
            config: Mutex::new(Some(config)),
            hops: Mutex::new(Vec::new()),
            recreated: AtomicBool::new(false),
            latency: AtomicU32::new(UNKNOWN_LATENCY),
            ctx,
        }
    }

    /// Core for a zero-hop tunnel: we are gateway and endpoint at once.
    pub(crate) fn zero_hops(is_inbound: bool, ctx: Arc<RouterContext>) -> Self {
        let tunnel_id = rand::thread_rng().next_u32();
        Self {
            tunnel_id,
            next_tunnel_id: tunnel_id,
            next_ident: ctx.local_hash,
            is_inbound,
            created: AtomicU64::new(seconds_since_epoch()),
            state: Mutex::new(TunnelState::Pending),
            pool: Mutex::new(Weak::new()),
            is_short: AtomicBool::new(false),
            far_end: Mutex::new(FarEndTransports::All),
            config: Mutex::new(None),
            hops: Mutex::new(Vec::new()),
            recreated: AtomicBool::new(false),
            latency: AtomicU32::new(UNKNOWN_LATENCY),
            ctx,
        }
    }

    pub fn tunnel_id(&self) -> TunnelId {
        self.tunnel_id
    }

    /// Receive id of the first hop: for an inbound tunnel, the gateway id
    /// remote senders address.
    pub fn next_tunnel_id(&self) -> TunnelId {
        self.next_tunnel_id
    }

    /// Router hash of the first hop
    pub fn next_ident(&self) -> RouterHash {
        self.next_ident
    }

    pub fn is_inbound(&self) -> bool {
        self.is_inbound
    }

    pub fn state(&self) -> TunnelState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, state: TunnelState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn is_established(&self) -> bool {
        self.state() == TunnelState::Established
    }

    pub fn is_failed(&self) -> bool {
        self.state() == TunnelState::Failed
    }

    pub fn creation_time(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    pub fn is_recreated(&self) -> bool {
        self.recreated.load(Ordering::Relaxed)
    }

    pub fn set_recreated(&self, recreated: bool) {
        self.recreated.store(recreated, Ordering::Relaxed);
    }

    pub fn is_short_build(&self) -> bool {
        self.is_short.load(Ordering::Relaxed)
    }

    pub fn far_end_transports(&self) -> FarEndTransports {
        *self.far_end.lock().unwrap()
    }

    pub fn tunnel_pool(&self) -> Option<Arc<TunnelPool>> {
        self.pool.lock().unwrap().upgrade()
    }

    /// Attach to a pool, or break the back-edge with `None` so a
    /// reconfigured pool lets this tunnel die.
    pub fn set_tunnel_pool(&self, pool: Option<&Arc<TunnelPool>>) {
        *self.pool.lock().unwrap() = match pool {
            Some(p) => Arc::downgrade(p),
            None => Weak::new(),
        };
    }

    /// Hop count: the established hop vector, or the pending config chain
    pub fn num_hops(&self) -> usize {
        let hops = self.hops.lock().unwrap();
        if hops.is_empty() {
            self.config
                .lock()
                .unwrap()
                .as_ref()
                .map(|c| c.num_hops())
                .unwrap_or(0)
        } else {
            hops.len()
        }
    }

    /// Peers in traversal order
    pub fn peers(&self) -> Vec<RouterInfo> {
        let mut peers = self.inverted_peers();
        peers.reverse();
        peers
    }

    /// Peers as stored: reverse traversal order, endpoint first
    pub fn inverted_peers(&self) -> Vec<RouterInfo> {
        let hops = self.hops.lock().unwrap();
        if hops.is_empty() {
            self.config
                .lock()
                .unwrap()
                .as_ref()
                .map(|c| c.inverted_peers())
                .unwrap_or_default()
        } else {
            hops.iter().map(|h| h.ident.clone()).collect()
        }
    }

    /// Identity hash of the tunnel's terminal hop. For a pending tunnel
    /// this comes from the config chain; for a zero-hop tunnel it is us.
    pub fn endpoint_ident(&self) -> RouterHash {
        if let Some(hop) = self.hops.lock().unwrap().first() {
            // hops are stored endpoint first
            return hop.ident.hash;
        }
        self.config
            .lock()
            .unwrap()
            .as_ref()
            .map(|c| c.last_hop().ident.hash)
            .unwrap_or(self.ctx.local_hash)
    }

    /// Hop identity hashes of a still-pending build, for profile events
    pub(crate) fn pending_hop_hashes(&self) -> Vec<RouterHash> {
        self.config
            .lock()
            .unwrap()
            .as_ref()
            .map(|c| c.hops().iter().map(|h| h.ident.hash).collect())
            .unwrap_or_default()
    }

    /// Observed mean latency in milliseconds, `UNKNOWN_LATENCY` if none
    pub fn mean_latency(&self) -> u32 {
        self.latency.load(Ordering::Relaxed)
    }

    pub fn record_latency_sample(&self, sample_ms: u32) {
        let current = self.latency.load(Ordering::Relaxed);
        let updated = if current == UNKNOWN_LATENCY {
            sample_ms
        } else {
            (current + sample_ms) / 2
        };
        self.latency.store(updated, Ordering::Relaxed);
    }

    pub fn latency_fits_range(&self, lower_ms: u32, upper_ms: u32) -> bool {
        let latency = self.mean_latency();
        latency >= lower_ms && latency <= upper_ms
    }

    /// Fold the per-hop layer ciphers over a tunnel data payload
    /// (IV + body, after the 4-byte tunnel id). Hops are stored endpoint
    /// first, so the forward fold peels inbound layers at the endpoint and
    /// builds the outbound onion at the gateway.
    pub fn encrypt_tunnel_msg(&self, payload: &mut [u8]) {
        for hop in self.hops.lock().unwrap().iter() {
            hop.layer.decrypt(payload);
        }
    }

    /// Construct, shuffle, layer, and dispatch the build message for this
    /// tunnel. The reply is matched back through `reply_msg_id`; `on_drop`
    /// fires if the transport discards the request.
    pub(crate) fn build(
        &self,
        reply_msg_id: u32,
        outbound_tunnel: Option<&Arc<OutboundTunnel>>,
        on_drop: OnDrop,
    ) {
        let pool = self.tunnel_pool();
        let mut config_guard = self.config.lock().unwrap();
        let config = match config_guard.as_mut() {
            Some(config) => config,
            None => {
                warn!("Tunnel {}: no build config", self.tunnel_id);
                return;
            }
        };

        let num_hops = config.num_hops();
        let num_records = if num_hops <= STANDARD_NUM_RECORDS {
            STANDARD_NUM_RECORDS
        } else {
            MAX_NUM_RECORDS
        };
        let record_size = config.record_size();
        let mut payload = vec![0u8; 1 + num_records * record_size];
        payload[0] = num_records as u8;

        // shuffle record slots
        let mut indices: Vec<usize> = (0..num_records).collect();
        match &pool {
            Some(pool) => pool.with_rng(|rng| indices.shuffle(rng)),
            None => indices.shuffle(&mut StdRng::from_entropy()),
        }

        // create real records; only the last hop carries the caller's
        // reply message id
        let mut rng = rand::thread_rng();
        let records = &mut payload[1..];
        for i in 0..num_hops {
            let msg_id = if i + 1 == num_hops {
                reply_msg_id
            } else {
                rng.next_u32()
            };
            config.hops_mut()[i].record_index = Some(indices[i]);
            if let Err(e) = config.hops_mut()[i].create_build_request_record(
                records,
                record_size,
                msg_id,
                &mut rng,
            ) {
                error!("Tunnel {}: build record failed: {}", self.tunnel_id, e);
                return;
            }
        }

        // fill up fake records with random data
        for &idx in indices.iter().take(num_records).skip(num_hops) {
            rng.fill_bytes(&mut records[idx * record_size..(idx + 1) * record_size]);
        }

        // pre-encrypt records of deeper hops: the last hop encrypts
        // nothing, the first hop wraps every slot after its own
        for k in (0..num_hops.saturating_sub(1)).rev() {
            for j in (k + 1)..num_hops {
                let other = config.hops()[j].record_index.expect("assigned above");
                config.hops()[k].decrypt_record(records, record_size, other);
            }
        }

        let msg_type = if config.is_short() {
            I2npMessageType::ShortTunnelBuild
        } else {
            I2npMessageType::VariableTunnelBuild
        };
        let is_short = config.is_short();
        let first_hop = config.first_hop().ident.clone();
        let last_hop_hash = config.last_hop().ident.hash;
        let last_hop_next = config.last_hop().next_ident;
        let last_hop_garlic = config.last_hop().garlic_key();
        drop(config_guard);

        let mut msg = I2npMessage::new(msg_type, rng.next_u32(), payload);
        msg.on_drop = Some(on_drop);

        if let Some(outbound) = outbound_tunnel {
            if is_short && first_hop.hash != outbound.endpoint_ident_hash() {
                // hide the request from the outbound endpoint unless it is
                // the first hop itself
                match wrap_for_router(&first_hop.encryption_pubkey, &msg.to_bytes()) {
                    Ok(wrapped) => {
                        let mut wrapped_msg =
                            I2npMessage::new(I2npMessageType::Garlic, msg.msg_id, wrapped);
                        wrapped_msg.on_drop = msg.on_drop.take();
                        msg = wrapped_msg;
                    }
                    Err(e) => warn!("Tunnel {}: garlic wrap failed: {}", self.tunnel_id, e),
                }
            }
            outbound.send_tunnel_data_msgs_to(Some(&self.next_ident), 0, msg);
        } else {
            if is_short && last_hop_hash != last_hop_next {
                // register the garlic reply key/tag so the reply can be
                // routed back to us
                let (key, tag) = last_hop_garlic;
                match pool.as_ref().and_then(|p| p.local_destination()) {
                    Some(dest) => dest.submit_garlic_key(key, tag),
                    None => self.ctx.local_destination.submit_garlic_key(key, tag),
                }
            }
            self.ctx.transport.send_message(&self.next_ident, msg);
        }
    }

    /// Process a build response: peel the reply onion last hop first,
    /// credit every hop's return code, and establish or decline.
    pub(crate) fn handle_build_response(&self, payload: &[u8]) -> bool {
        if payload.is_empty() {
            return false;
        }
        let num = payload[0] as usize;
        debug!("Tunnel: TunnelBuildResponse {} records", num);
        if num > MAX_NUM_RECORDS {
            error!("Tunnel: Too many records in TunnelBuildResponse {}", num);
            return false;
        }

        let mut config_guard = self.config.lock().unwrap();
        let config = match config_guard.as_mut() {
            Some(config) => config,
            None => {
                warn!("Tunnel {}: response without build config", self.tunnel_id);
                return false;
            }
        };
        let record_size = config.record_size();
        if payload.len() < num * record_size + 1 {
            error!(
                "Tunnel: TunnelBuildResponse of {} records is too short {}",
                num,
                payload.len()
            );
            return false;
        }
        let mut records = payload[1..1 + num * record_size].to_vec();

        let num_hops = config.num_hops();
        for h in (0..num_hops).rev() {
            // decrypt current hop's own reply slot
            match config.hops()[h].record_index {
                Some(idx) if idx < num => {}
                other => {
                    warn!("Tunnel: Hop index {:?} is out of range", other);
                    return false;
                }
            }
            if let Err(e) =
                config.hops()[h].decrypt_build_response_record(&mut records, record_size)
            {
                warn!("Tunnel {}: reply record invalid: {}", self.tunnel_id, e);
                return false;
            }
            // peel this hop's layer off the slots of hops before it
            for j in 0..h {
                match config.hops()[j].record_index {
                    Some(idx) if idx < num => {
                        config.hops()[h].decrypt_record(&mut records, record_size, idx);
                    }
                    other => warn!("Tunnel: Hop index {:?} is out of range", other),
                }
            }
        }

        let mut established = true;
        for hop in config.hops() {
            let ret = match hop.ret_code(&records, record_size) {
                Ok(ret) => ret,
                Err(_) => {
                    established = false;
                    continue;
                }
            };
            debug!("Tunnel: Build response ret code={}", ret);
            self.ctx.profiles.tunnel_build_response(&hop.ident.hash, ret);
            if ret != 0 {
                // if any participant declined the tunnel is not established
                established = false;
            }
        }

        if established {
            // materialise layer ciphers in reverse order, endpoint first
            let mut hops = Vec::with_capacity(num_hops);
            for hop in config.hops().iter().rev() {
                hops.push(TunnelHop {
                    ident: hop.ident.clone(),
                    layer: LayerCipher::new(&hop.layer_key, &hop.iv_key),
                });
            }
            self.is_short.store(config.is_short(), Ordering::Relaxed);
            *self.far_end.lock().unwrap() = config.far_end_transports();
            *self.hops.lock().unwrap() = hops;
            *config_guard = None;
            self.set_state(TunnelState::Established);
        }
        established
    }
}
