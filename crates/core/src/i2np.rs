//! I2NP message model
//!
//! Messages arrive from the transport as `{type, msg_id, payload}` and are
//! framed on the wire as `type(1) | msg_id(4 BE) | length(2 BE) | payload`.
//! For `TunnelData` and `TunnelGateway` the first four payload bytes are the
//! receiving tunnel id in network byte order.

use std::sync::{Arc, Mutex};

use crate::error::{CoreError, Result};
use crate::types::TunnelId;

/// Serialized I2NP header: type(1) + msg_id(4) + length(2)
pub const I2NP_HEADER_SIZE: usize = 7;

/// Fixed size of a tunnel data message payload:
/// tunnel_id(4) + IV(16) + body(1008)
pub const TUNNEL_DATA_MSG_SIZE: usize = 1028;

/// IV length inside a tunnel data message
pub const TUNNEL_DATA_IV_SIZE: usize = 16;

/// Encrypted body length inside a tunnel data message
pub const TUNNEL_DATA_BODY_SIZE: usize = 1008;

/// Tunnel gateway payload header: tunnel_id(4) + length(2)
pub const TUNNEL_GATEWAY_HEADER_SIZE: usize = 6;

/// Offset of the inner-length field inside a tunnel gateway payload
pub const TUNNEL_GATEWAY_HEADER_LENGTH_OFFSET: usize = 4;

/// Build record size for short (ECIES) builds
pub const SHORT_TUNNEL_BUILD_RECORD_SIZE: usize = 218;

/// Build record size for legacy variable builds
pub const TUNNEL_BUILD_RECORD_SIZE: usize = 528;

/// Number of records in a standard build message
pub const STANDARD_NUM_RECORDS: usize = 4;

/// Maximum number of records in any build message
pub const MAX_NUM_RECORDS: usize = 8;

/// I2NP message types handled by the tunnel subsystem
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum I2npMessageType {
    Garlic = 11,
    TunnelData = 18,
    TunnelGateway = 19,
    TunnelBuild = 21,
    TunnelBuildReply = 22,
    VariableTunnelBuild = 23,
    VariableTunnelBuildReply = 24,
    ShortTunnelBuild = 25,
    ShortTunnelBuildReply = 26,
}

impl I2npMessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            11 => Some(Self::Garlic),
            18 => Some(Self::TunnelData),
            19 => Some(Self::TunnelGateway),
            21 => Some(Self::TunnelBuild),
            22 => Some(Self::TunnelBuildReply),
            23 => Some(Self::VariableTunnelBuild),
            24 => Some(Self::VariableTunnelBuildReply),
            25 => Some(Self::ShortTunnelBuild),
            26 => Some(Self::ShortTunnelBuildReply),
            _ => None,
        }
    }
}

/// Tag identifying which local tunnel a message came through
pub trait MessageSource: Send + Sync {
    fn tunnel_id(&self) -> TunnelId;
}

/// Callback invoked exactly once if the message is discarded before the
/// transport hands it to a live connection. Fires on drop unless disarmed;
/// a transport that accepts a message must call [`I2npMessage::disarm`].
pub struct OnDrop(Option<Box<dyn FnOnce() + Send>>);

impl OnDrop {
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(f)))
    }

    pub fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for OnDrop {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

impl std::fmt::Debug for OnDrop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(if self.0.is_some() {
            "OnDrop(armed)"
        } else {
            "OnDrop(disarmed)"
        })
    }
}

/// An I2NP message with its payload
pub struct I2npMessage {
    pub type_id: I2npMessageType,
    pub msg_id: u32,
    pub payload: Vec<u8>,
    /// Local tunnel the message was received through, stamped by the
    /// inbound handler before onward delivery
    pub from: Option<Arc<dyn MessageSource>>,
    /// Drop notification for unsent messages
    pub on_drop: Option<OnDrop>,
}

impl std::fmt::Debug for I2npMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("I2npMessage")
            .field("type_id", &self.type_id)
            .field("msg_id", &self.msg_id)
            .field("payload_len", &self.payload.len())
            .field("has_from", &self.from.is_some())
            .field("on_drop", &self.on_drop)
            .finish()
    }
}

impl I2npMessage {
    pub fn new(type_id: I2npMessageType, msg_id: u32, payload: Vec<u8>) -> Self {
        Self {
            type_id,
            msg_id,
            payload,
            from: None,
            on_drop: None,
        }
    }

    /// Tunnel id carried in the first four payload bytes
    /// (`TunnelData` / `TunnelGateway` messages)
    pub fn tunnel_id(&self) -> Result<TunnelId> {
        if self.payload.len() < 4 {
            return Err(CoreError::MessageTooShort {
                needed: 4,
                got: self.payload.len(),
            });
        }
        Ok(u32::from_be_bytes([
            self.payload[0],
            self.payload[1],
            self.payload[2],
            self.payload[3],
        ]))
    }

    /// Serialize header + payload for wrapping inside another message
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(I2NP_HEADER_SIZE + self.payload.len());
        out.push(self.type_id as u8);
        out.extend_from_slice(&self.msg_id.to_be_bytes());
        out.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse a wrapped message back out of its wire framing
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < I2NP_HEADER_SIZE {
            return Err(CoreError::MessageTooShort {
                needed: I2NP_HEADER_SIZE,
                got: bytes.len(),
            });
        }
        let type_id = I2npMessageType::from_u8(bytes[0])
            .ok_or(CoreError::UnknownMessageType(bytes[0]))?;
        let msg_id = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        let len = u16::from_be_bytes([bytes[5], bytes[6]]) as usize;
        if bytes.len() < I2NP_HEADER_SIZE + len {
            return Err(CoreError::MessageTooShort {
                needed: I2NP_HEADER_SIZE + len,
                got: bytes.len(),
            });
        }
        Ok(Self::new(
            type_id,
            msg_id,
            bytes[I2NP_HEADER_SIZE..I2NP_HEADER_SIZE + len].to_vec(),
        ))
    }

    /// Disarm the drop notification after a successful transport handoff
    pub fn disarm(&mut self) {
        if let Some(guard) = self.on_drop.as_mut() {
            guard.disarm();
        }
    }
}

/// Build a tunnel gateway message wrapping `inner` for delivery into the
/// remote tunnel `gw_tunnel_id`.
pub fn create_tunnel_gateway_msg(gw_tunnel_id: TunnelId, inner: &I2npMessage) -> I2npMessage {
    let inner_bytes = inner.to_bytes();
    let mut payload = Vec::with_capacity(TUNNEL_GATEWAY_HEADER_SIZE + inner_bytes.len());
    payload.extend_from_slice(&gw_tunnel_id.to_be_bytes());
    payload.extend_from_slice(&(inner_bytes.len() as u16).to_be_bytes());
    payload.extend_from_slice(&inner_bytes);
    I2npMessage::new(I2npMessageType::TunnelGateway, inner.msg_id, payload)
}

/// Freelist of reusable payload buffers.
///
/// Endpoint reassembly churns through staging buffers; recycling them keeps
/// steady-state allocation flat. Idle buffers are released on the slow
/// maintenance schedule.
pub struct MessageBufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    max_idle: usize,
}

impl MessageBufferPool {
    pub fn new(max_idle: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
            max_idle,
        }
    }

    /// Take a cleared buffer from the freelist, or allocate a fresh one
    pub fn acquire(&self) -> Vec<u8> {
        self.buffers.lock().unwrap().pop().unwrap_or_default()
    }

    /// Return a buffer to the freelist
    pub fn release(&self, mut buf: Vec<u8>) {
        buf.clear();
        let mut buffers = self.buffers.lock().unwrap();
        if buffers.len() < self.max_idle {
            buffers.push(buf);
        }
    }

    /// Drop all idle buffers
    pub fn clean_up(&self) {
        self.buffers.lock().unwrap().clear();
    }

    pub fn idle_count(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }
}

impl Default for MessageBufferPool {
    fn default() -> Self {
        Self::new(32)
    }
}
