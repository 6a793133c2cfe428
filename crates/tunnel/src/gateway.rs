//! Tunnel gateway: batches payloads into fixed-size tunnel data messages
//!
//! Blocks are serialized as `type(1) | hash(32)? | tunnel_id(4)? |
//! length(2) | wrapped I2NP message` and packed back to back into
//! 1008-byte message bodies. Each body starts with a two-byte pointer to
//! the first block boundary inside it (`0xFFFF` when the whole body
//! continues a block from the previous message); the tail of the last
//! body is zero padding, which reads as a padding block.

use rand::RngCore;

use garliccraft_core::{
    Delivery, I2npMessage, I2npMessageType, TunnelId, TUNNEL_DATA_BODY_SIZE,
    TUNNEL_DATA_IV_SIZE, TUNNEL_DATA_MSG_SIZE,
};

/// Body pointer marking a message that only continues the previous block
pub const CONTINUATION_POINTER: u16 = 0xFFFF;

/// Stream bytes available per tunnel data message after the pointer
pub const TUNNEL_DATA_CHUNK_SIZE: usize = TUNNEL_DATA_BODY_SIZE - 2;

/// A payload with its delivery instructions, queued at a tunnel gateway
pub struct TunnelMessageBlock {
    pub delivery: Delivery,
    pub msg: I2npMessage,
}

/// Batcher producing fixed-size tunnel data messages addressed to the
/// first hop's receive id. Layer encryption happens in the owning tunnel
/// after packing.
pub struct TunnelGateway {
    next_tunnel_id: TunnelId,
    staged: Vec<Vec<u8>>,
    staged_bytes: usize,
}

impl TunnelGateway {
    pub fn new(next_tunnel_id: TunnelId) -> Self {
        Self {
            next_tunnel_id,
            staged: Vec::new(),
            staged_bytes: 0,
        }
    }

    /// Serialize a block into the staging queue
    pub fn put_tunnel_data_msg(&mut self, block: TunnelMessageBlock) {
        let mut msg = block.msg;
        let inner = msg.to_bytes();
        // the stream owns the bytes from here on
        msg.disarm();

        let mut buf = Vec::with_capacity(1 + 36 + 2 + inner.len());
        buf.push(block.delivery.type_byte());
        match block.delivery {
            Delivery::Local => {}
            Delivery::Router(hash) => buf.extend_from_slice(&hash),
            Delivery::Tunnel(hash, tunnel_id) => {
                buf.extend_from_slice(&hash);
                buf.extend_from_slice(&tunnel_id.to_be_bytes());
            }
        }
        buf.extend_from_slice(&(inner.len() as u16).to_be_bytes());
        buf.extend_from_slice(&inner);

        self.staged_bytes += buf.len();
        self.staged.push(buf);
    }

    pub fn has_staged(&self) -> bool {
        !self.staged.is_empty()
    }

    /// Drain the staging queue into one or more tunnel data messages
    pub fn send_buffer(&mut self) -> Vec<I2npMessage> {
        if self.staged.is_empty() {
            return Vec::new();
        }

        let mut stream = Vec::with_capacity(self.staged_bytes);
        let mut boundaries = Vec::with_capacity(self.staged.len());
        for block in self.staged.drain(..) {
            boundaries.push(stream.len());
            stream.extend_from_slice(&block);
        }
        self.staged_bytes = 0;

        let mut rng = rand::thread_rng();
        let mut msgs = Vec::new();
        let mut offset = 0usize;
        let mut boundary_idx = 0usize;
        while offset < stream.len() {
            let end = (offset + TUNNEL_DATA_CHUNK_SIZE).min(stream.len());
            while boundary_idx < boundaries.len() && boundaries[boundary_idx] < offset {
                boundary_idx += 1;
            }
            let pointer = if boundary_idx < boundaries.len() && boundaries[boundary_idx] < end {
                (boundaries[boundary_idx] - offset) as u16
            } else {
                CONTINUATION_POINTER
            };

            let mut payload = Vec::with_capacity(TUNNEL_DATA_MSG_SIZE);
            payload.extend_from_slice(&self.next_tunnel_id.to_be_bytes());
            let mut iv = [0u8; TUNNEL_DATA_IV_SIZE];
            rng.fill_bytes(&mut iv);
            payload.extend_from_slice(&iv);
            payload.extend_from_slice(&pointer.to_be_bytes());
            payload.extend_from_slice(&stream[offset..end]);
            payload.resize(TUNNEL_DATA_MSG_SIZE, 0);

            msgs.push(I2npMessage::new(
                I2npMessageType::TunnelData,
                rng.next_u32(),
                payload,
            ));
            offset = end;
        }
        msgs
    }
}
