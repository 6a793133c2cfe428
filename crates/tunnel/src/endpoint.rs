//! Tunnel endpoint: reassembles decrypted inbound payloads into delivery
//! instructions
//!
//! The inverse of [`crate::gateway::TunnelGateway`]: consumes decrypted
//! tunnel data messages in arrival order, stitches blocks that straddle
//! messages back together, and dispatches each wrapped I2NP message
//! according to its delivery type.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::warn;

use garliccraft_core::{
    create_tunnel_gateway_msg, I2npMessage, MessageBufferPool, MessageSource, RouterHash,
    TunnelId, TUNNEL_DATA_IV_SIZE, TUNNEL_DATA_MSG_SIZE,
};

use crate::gateway::CONTINUATION_POINTER;
use crate::traits::RouterContext;

/// How long an incomplete cross-message block may wait for its remainder
pub const ENDPOINT_INCOMPLETE_TIMEOUT: Duration = Duration::from_secs(8);

enum ParseOutcome {
    /// All blocks consumed (or padding reached)
    Done,
    /// A block continues in the next message; unconsumed bytes start here
    Incomplete(usize),
}

/// Per-tunnel reassembly state
pub struct TunnelEndpoint {
    partial: Option<Vec<u8>>,
    partial_since: Option<Instant>,
    buffer_pool: Arc<MessageBufferPool>,
}

impl TunnelEndpoint {
    pub fn new(buffer_pool: Arc<MessageBufferPool>) -> Self {
        Self {
            partial: None,
            partial_since: None,
            buffer_pool,
        }
    }

    /// Consume one decrypted tunnel data message
    pub fn handle_decrypted(&mut self, msg: I2npMessage, ctx: &RouterContext) {
        if msg.payload.len() != TUNNEL_DATA_MSG_SIZE {
            warn!(
                "Tunnel: endpoint got {} bytes, expected {}",
                msg.payload.len(),
                TUNNEL_DATA_MSG_SIZE
            );
            return;
        }
        let from = msg.from.clone();
        let body = &msg.payload[4 + TUNNEL_DATA_IV_SIZE..];
        let pointer = u16::from_be_bytes([body[0], body[1]]);
        let chunk = &body[2..];

        let buf = match self.partial.take() {
            Some(mut partial) => {
                // the stream is contiguous per tunnel; the pointer only
                // matters for resynchronisation after loss
                partial.extend_from_slice(chunk);
                partial
            }
            None => {
                if pointer == CONTINUATION_POINTER {
                    warn!("Tunnel: continuation without pending fragment");
                    return;
                }
                let pointer = pointer as usize;
                if pointer > chunk.len() {
                    warn!("Tunnel: block pointer {} out of range", pointer);
                    return;
                }
                let mut buf = self.buffer_pool.acquire();
                buf.extend_from_slice(&chunk[pointer..]);
                buf
            }
        };

        match self.parse_blocks(&buf, from.as_ref(), ctx) {
            ParseOutcome::Done => {
                self.buffer_pool.release(buf);
                self.partial_since = None;
            }
            ParseOutcome::Incomplete(pos) => {
                let mut buf = buf;
                buf.drain(..pos);
                if self.partial_since.is_none() {
                    self.partial_since = Some(Instant::now());
                }
                self.partial = Some(buf);
            }
        }
    }

    fn parse_blocks(
        &self,
        buf: &[u8],
        from: Option<&Arc<dyn MessageSource>>,
        ctx: &RouterContext,
    ) -> ParseOutcome {
        let mut pos = 0usize;
        loop {
            if pos >= buf.len() {
                return ParseOutcome::Done;
            }
            let block_type = buf[pos];
            if block_type == 0 {
                // zero padding to the end of the message
                return ParseOutcome::Done;
            }
            let addr_len = match block_type {
                1 => 0,
                2 => 32,
                3 => 36,
                other => {
                    warn!("Tunnel: unknown delivery block type {}", other);
                    return ParseOutcome::Done;
                }
            };
            let header_len = 1 + addr_len + 2;
            if pos + header_len > buf.len() {
                return ParseOutcome::Incomplete(pos);
            }
            let len = u16::from_be_bytes([
                buf[pos + 1 + addr_len],
                buf[pos + 1 + addr_len + 1],
            ]) as usize;
            if pos + header_len + len > buf.len() {
                return ParseOutcome::Incomplete(pos);
            }

            let data = &buf[pos + header_len..pos + header_len + len];
            match I2npMessage::from_bytes(data) {
                Ok(mut inner) => match block_type {
                    1 => {
                        inner.from = from.cloned();
                        ctx.i2np.handle_message(inner);
                    }
                    2 => {
                        let hash: RouterHash = buf[pos + 1..pos + 33].try_into().unwrap();
                        if hash == ctx.local_hash {
                            inner.from = from.cloned();
                            ctx.i2np.handle_message(inner);
                        } else {
                            ctx.transport.send_message(&hash, inner);
                        }
                    }
                    _ => {
                        let hash: RouterHash = buf[pos + 1..pos + 33].try_into().unwrap();
                        let gw_tunnel: TunnelId = u32::from_be_bytes(
                            buf[pos + 33..pos + 37].try_into().unwrap(),
                        );
                        ctx.transport
                            .send_message(&hash, create_tunnel_gateway_msg(gw_tunnel, &inner));
                    }
                },
                Err(e) => warn!("Tunnel: bad wrapped message at endpoint: {}", e),
            }
            pos += header_len + len;
        }
    }

    /// Drop reassembly state that has waited too long for its remainder
    pub fn cleanup(&mut self) {
        if let Some(since) = self.partial_since {
            if since.elapsed() >= ENDPOINT_INCOMPLETE_TIMEOUT {
                warn!("Tunnel: dropping stale incomplete fragment");
                if let Some(buf) = self.partial.take() {
                    self.buffer_pool.release(buf);
                }
                self.partial_since = None;
            }
        }
    }

    pub fn has_partial(&self) -> bool {
        self.partial.is_some()
    }
}
