//! Inbound tunnels: the local end is the endpoint
//!
//! Regular inbound tunnels peel the accumulated hop layers off received
//! tunnel data messages and hand the plaintext to the reassembling
//! endpoint. The zero-hop variant short-circuits: we are gateway and
//! endpoint at once, so payloads go straight to the local I2NP handler.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{info, warn};

use garliccraft_core::{
    I2npMessage, MessageBufferPool, MessageSource, OnDrop, TunnelId, TunnelState,
    TUNNEL_DATA_MSG_SIZE,
};

use crate::config::TunnelConfig;
use crate::endpoint::TunnelEndpoint;
use crate::outbound::OutboundTunnel;
use crate::traits::RouterContext;
use crate::tunnel::{TunnelBase, TunnelCore};

pub struct InboundTunnel {
    core: TunnelCore,
    endpoint: Mutex<TunnelEndpoint>,
    received: AtomicU64,
    zero_hops: bool,
    /// Back-reference to our own Arc, for drop hooks and `from` stamps
    self_ref: Weak<InboundTunnel>,
}

impl InboundTunnel {
    pub fn new(
        config: TunnelConfig,
        ctx: Arc<RouterContext>,
        buffer_pool: Arc<MessageBufferPool>,
    ) -> Arc<Self> {
        debug_assert!(config.is_inbound());
        Arc::new_cyclic(|me| Self {
            core: TunnelCore::from_config(config, ctx),
            endpoint: Mutex::new(TunnelEndpoint::new(buffer_pool)),
            received: AtomicU64::new(0),
            zero_hops: false,
            self_ref: me.clone(),
        })
    }

    /// Zero-hop inbound tunnel: receives directly on our own router
    pub fn zero_hops(ctx: Arc<RouterContext>, buffer_pool: Arc<MessageBufferPool>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            core: TunnelCore::zero_hops(true, ctx),
            endpoint: Mutex::new(TunnelEndpoint::new(buffer_pool)),
            received: AtomicU64::new(0),
            zero_hops: true,
            self_ref: me.clone(),
        })
    }

    pub fn core(&self) -> &TunnelCore {
        &self.core
    }

    pub fn is_zero_hops(&self) -> bool {
        self.zero_hops
    }

    pub fn is_established(&self) -> bool {
        self.core.is_established()
    }

    pub fn num_received_bytes(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Send the build request for this pending tunnel, optionally through
    /// an existing outbound tunnel.
    pub fn build(&self, reply_msg_id: u32, outbound: Option<&Arc<OutboundTunnel>>) {
        let Some(tunnel) = self.self_ref.upgrade() else {
            return;
        };
        let on_drop = OnDrop::new(move || {
            info!(
                "Tunnel: Tunnel {} request was not sent",
                tunnel.core.tunnel_id()
            );
            tunnel.core.set_state(TunnelState::BuildFailed);
        });
        self.core.build(reply_msg_id, outbound, on_drop);
    }

    pub fn handle_build_response(&self, payload: &[u8]) -> bool {
        self.core.handle_build_response(payload)
    }

    /// Queue a successor build through the owning pool. Idempotent.
    pub fn recreate(&self) -> bool {
        if !self.core.is_recreated() {
            if let Some(pool) = self.core.tunnel_pool() {
                self.core.set_recreated(true);
                pool.recreate_inbound_tunnel(self);
                return true;
            }
        }
        false
    }

    /// Endpoint reassembly garbage collection
    pub fn cleanup(&self) {
        self.endpoint.lock().unwrap().cleanup();
    }
}

impl MessageSource for InboundTunnel {
    fn tunnel_id(&self) -> TunnelId {
        self.core.tunnel_id()
    }
}

impl TunnelBase for InboundTunnel {
    fn tunnel_id(&self) -> TunnelId {
        self.core.tunnel_id()
    }

    fn handle_tunnel_data_msg(self: Arc<Self>, mut msg: I2npMessage) {
        if !self.core.is_established() && self.core.state() != TunnelState::Expiring {
            // incoming messages mean the tunnel is alive
            self.core.set_state(TunnelState::Established);
            if let Some(pool) = self.core.tunnel_pool() {
                if let Some(dest) = pool.local_destination() {
                    dest.set_lease_set_updated(true);
                }
            }
        }
        if msg.payload.len() != TUNNEL_DATA_MSG_SIZE {
            warn!(
                "Tunnel {}: tunnel data of {} bytes dropped",
                self.core.tunnel_id(),
                msg.payload.len()
            );
            return;
        }
        self.received
            .fetch_add(msg.payload.len() as u64, Ordering::Relaxed);
        self.core.encrypt_tunnel_msg(&mut msg.payload[4..]);
        msg.from = Some(self.clone() as Arc<dyn MessageSource>);
        self.endpoint
            .lock()
            .unwrap()
            .handle_decrypted(msg, &self.core.ctx);
    }

    fn send_tunnel_data_msg(self: Arc<Self>, mut msg: I2npMessage) {
        if self.zero_hops {
            // we are our own gateway; deliver directly
            self.received
                .fetch_add(msg.payload.len() as u64, Ordering::Relaxed);
            msg.from = Some(self.clone() as Arc<dyn MessageSource>);
            self.core.ctx.i2np.handle_message(msg);
        } else {
            warn!("Tunnel: Can't send I2NP messages without delivery instructions");
        }
    }

    fn flush_tunnel_data_msgs(&self) {}
}
