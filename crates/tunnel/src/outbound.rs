//! Outbound tunnels: the local end is the gateway
//!
//! External producers enqueue payload blocks under the per-tunnel send
//! lock; the gateway batches them into fixed-size tunnel data messages
//! which are layer-encrypted and handed to the transport. The zero-hop
//! variant dispatches blocks by delivery type without any tunnel
//! encryption.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{error, info, warn};

use garliccraft_core::{
    create_tunnel_gateway_msg, Delivery, I2npMessage, OnDrop, RouterHash, TunnelId, TunnelState,
};

use crate::config::TunnelConfig;
use crate::gateway::{TunnelGateway, TunnelMessageBlock};
use crate::traits::RouterContext;
use crate::tunnel::{TunnelBase, TunnelCore};

pub struct OutboundTunnel {
    core: TunnelCore,
    /// Gateway batcher; the mutex doubles as the per-tunnel send lock
    gateway: Mutex<TunnelGateway>,
    sent: AtomicU64,
    zero_hops: bool,
    /// Back-reference to our own Arc, for drop hooks
    self_ref: Weak<OutboundTunnel>,
}

impl OutboundTunnel {
    pub fn new(config: TunnelConfig, ctx: Arc<RouterContext>) -> Arc<Self> {
        debug_assert!(!config.is_inbound());
        let next_tunnel_id = config.next_tunnel_id();
        Arc::new_cyclic(|me| Self {
            core: TunnelCore::from_config(config, ctx),
            gateway: Mutex::new(TunnelGateway::new(next_tunnel_id)),
            sent: AtomicU64::new(0),
            zero_hops: false,
            self_ref: me.clone(),
        })
    }

    /// Zero-hop outbound tunnel: delivery happens straight off this router
    pub fn zero_hops(ctx: Arc<RouterContext>) -> Arc<Self> {
        let core = TunnelCore::zero_hops(false, ctx);
        let next_tunnel_id = core.next_tunnel_id();
        Arc::new_cyclic(|me| Self {
            core,
            gateway: Mutex::new(TunnelGateway::new(next_tunnel_id)),
            sent: AtomicU64::new(0),
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

    pub fn num_sent_bytes(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Identity hash of the outbound endpoint hop
    pub fn endpoint_ident_hash(&self) -> RouterHash {
        self.core.endpoint_ident()
    }

    /// Send the build request for this pending tunnel, optionally through
    /// another, existing outbound tunnel.
    pub fn build(&self, reply_msg_id: u32, via: Option<&Arc<OutboundTunnel>>) {
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
        self.core.build(reply_msg_id, via, on_drop);
    }

    pub fn handle_build_response(&self, payload: &[u8]) -> bool {
        self.core.handle_build_response(payload)
    }

    /// Queue a successor build through the owning pool. Idempotent.
    pub fn recreate(&self) -> bool {
        if !self.core.is_recreated() {
            if let Some(pool) = self.core.tunnel_pool() {
                self.core.set_recreated(true);
                pool.recreate_outbound_tunnel(self);
                return true;
            }
        }
        false
    }

    /// Wrap one message in delivery instructions and send it through the
    /// tunnel: `None` hash is local delivery at the far end, a hash alone
    /// targets a router, hash plus nonzero tunnel id targets a remote
    /// inbound gateway.
    pub fn send_tunnel_data_msgs_to(
        &self,
        gw_hash: Option<&RouterHash>,
        gw_tunnel: TunnelId,
        msg: I2npMessage,
    ) {
        let delivery = match gw_hash {
            None => Delivery::Local,
            Some(hash) if gw_tunnel != 0 => Delivery::Tunnel(*hash, gw_tunnel),
            Some(hash) => Delivery::Router(*hash),
        };
        self.send_tunnel_data_msgs(vec![TunnelMessageBlock { delivery, msg }]);
    }

    /// Enqueue blocks and flush the gateway batch
    pub fn send_tunnel_data_msgs(&self, blocks: Vec<TunnelMessageBlock>) {
        if self.zero_hops {
            self.dispatch_zero_hops(blocks);
            return;
        }
        let mut gateway = self.gateway.lock().unwrap();
        for block in blocks {
            gateway.put_tunnel_data_msg(block);
        }
        self.emit_locked(&mut gateway);
    }

    /// Pack, encrypt, and hand the staged batch to the transport. Caller
    /// holds the send lock so per-tunnel ordering is preserved.
    fn emit_locked(&self, gateway: &mut TunnelGateway) {
        for mut msg in gateway.send_buffer() {
            self.sent.fetch_add(msg.payload.len() as u64, Ordering::Relaxed);
            self.core.encrypt_tunnel_msg(&mut msg.payload[4..]);
            self.core
                .ctx
                .transport
                .send_message(&self.core.next_ident(), msg);
        }
    }

    fn dispatch_zero_hops(&self, blocks: Vec<TunnelMessageBlock>) {
        for block in blocks {
            let mut msg = block.msg;
            self.sent.fetch_add(msg.payload.len() as u64, Ordering::Relaxed);
            match block.delivery {
                Delivery::Local => self.core.ctx.i2np.handle_message(msg),
                Delivery::Router(hash) => self.core.ctx.transport.send_message(&hash, msg),
                Delivery::Tunnel(hash, gw_tunnel) => {
                    let mut wrapped = create_tunnel_gateway_msg(gw_tunnel, &msg);
                    wrapped.on_drop = msg.on_drop.take();
                    self.core.ctx.transport.send_message(&hash, wrapped);
                }
            }
        }
    }
}

impl TunnelBase for OutboundTunnel {
    fn tunnel_id(&self) -> TunnelId {
        self.core.tunnel_id()
    }

    fn handle_tunnel_data_msg(self: Arc<Self>, _msg: I2npMessage) {
        error!(
            "Tunnel: Incoming message for outbound tunnel {}",
            self.core.tunnel_id()
        );
    }

    fn send_tunnel_data_msg(self: Arc<Self>, _msg: I2npMessage) {
        warn!("Tunnel: Can't send I2NP messages without delivery instructions");
    }

    fn flush_tunnel_data_msgs(&self) {
        let mut gateway = self.gateway.lock().unwrap();
        if gateway.has_staged() {
            self.emit_locked(&mut gateway);
        }
    }
}
