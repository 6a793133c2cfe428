//! Per-hop build configuration
//!
//! A `TunnelHopConfig` exists only while its tunnel is pending. It owns
//! the hop's tunnel ids and symmetric keys, writes the hop's request into
//! its shuffled record slot, and applies the hop's layer transform to
//! other slots during pre-encryption and reply peeling. Once the tunnel
//! is established, the layer and IV keys are copied out into the runtime
//! hop vector and the config is dropped.

use rand::RngCore;

use garliccraft_core::{RouterHash, RouterInfo, TunnelId};
use garliccraft_crypto::{
    garlic_key, garlic_tag, open_reply, record_layer_transform, seal_record,
    RECORD_SEAL_OVERHEAD,
};

use crate::error::{Result, TunnelError};

/// This hop is the gateway of an inbound tunnel
pub const FLAG_INBOUND_GATEWAY: u8 = 0x80;

/// This hop is the endpoint of an outbound tunnel
pub const FLAG_OUTBOUND_ENDPOINT: u8 = 0x40;

/// Fixed portion of a build request record before padding
const REQUEST_FIXED_LEN: usize = 4 + 4 + 32 + 1 + 4 + 32 + 32 + 32;

/// Plaintext of a build request record, sealed to one hop.
///
/// The creator generates the hop's layer, IV, and reply keys and carries
/// them to the hop inside the sealed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequestRecord {
    pub receive_tunnel_id: TunnelId,
    pub next_tunnel_id: TunnelId,
    pub next_ident: RouterHash,
    pub flags: u8,
    pub reply_msg_id: u32,
    pub layer_key: [u8; 32],
    pub iv_key: [u8; 32],
    pub reply_key: [u8; 32],
}

impl BuildRequestRecord {
    /// Encode into a fixed-size plaintext, filling the tail with random
    /// padding.
    pub fn encode(&self, plaintext_len: usize, rng: &mut dyn RngCore) -> Result<Vec<u8>> {
        if plaintext_len < REQUEST_FIXED_LEN {
            return Err(TunnelError::RecordTooShort(plaintext_len));
        }
        let mut out = vec![0u8; plaintext_len];
        out[0..4].copy_from_slice(&self.receive_tunnel_id.to_be_bytes());
        out[4..8].copy_from_slice(&self.next_tunnel_id.to_be_bytes());
        out[8..40].copy_from_slice(&self.next_ident);
        out[40] = self.flags;
        out[41..45].copy_from_slice(&self.reply_msg_id.to_be_bytes());
        out[45..77].copy_from_slice(&self.layer_key);
        out[77..109].copy_from_slice(&self.iv_key);
        out[109..141].copy_from_slice(&self.reply_key);
        rng.fill_bytes(&mut out[REQUEST_FIXED_LEN..]);
        Ok(out)
    }

    /// Decode from a record plaintext (the hop side of the exchange)
    pub fn decode(plaintext: &[u8]) -> Result<Self> {
        if plaintext.len() < REQUEST_FIXED_LEN {
            return Err(TunnelError::RecordTooShort(plaintext.len()));
        }
        Ok(Self {
            receive_tunnel_id: u32::from_be_bytes(plaintext[0..4].try_into().unwrap()),
            next_tunnel_id: u32::from_be_bytes(plaintext[4..8].try_into().unwrap()),
            next_ident: plaintext[8..40].try_into().unwrap(),
            flags: plaintext[40],
            reply_msg_id: u32::from_be_bytes(plaintext[41..45].try_into().unwrap()),
            layer_key: plaintext[45..77].try_into().unwrap(),
            iv_key: plaintext[77..109].try_into().unwrap(),
            reply_key: plaintext[109..141].try_into().unwrap(),
        })
    }
}

/// Per-hop state of a pending tunnel build
#[derive(Clone)]
pub struct TunnelHopConfig {
    /// The hop's router identity and static encryption key
    pub ident: RouterInfo,
    /// Tunnel id the hop will receive messages on
    pub recv_tunnel_id: TunnelId,
    /// Tunnel id of the following hop (or our receive id at the end)
    pub next_tunnel_id: TunnelId,
    /// Router the hop forwards to
    pub next_ident: RouterHash,
    pub layer_key: [u8; 32],
    pub iv_key: [u8; 32],
    pub reply_key: [u8; 32],
    /// Slot assigned after shuffling, set during build
    pub record_index: Option<usize>,
    pub is_inbound_gateway: bool,
    pub is_outbound_endpoint: bool,
}

impl TunnelHopConfig {
    /// Create a hop with fresh ids and keys; chain links are filled in by
    /// the tunnel config.
    pub fn new(ident: RouterInfo, rng: &mut dyn RngCore) -> Self {
        let mut layer_key = [0u8; 32];
        let mut iv_key = [0u8; 32];
        let mut reply_key = [0u8; 32];
        rng.fill_bytes(&mut layer_key);
        rng.fill_bytes(&mut iv_key);
        rng.fill_bytes(&mut reply_key);
        Self {
            ident,
            recv_tunnel_id: rng.next_u32(),
            next_tunnel_id: 0,
            next_ident: [0u8; 32],
            layer_key,
            iv_key,
            reply_key,
            record_index: None,
            is_inbound_gateway: false,
            is_outbound_endpoint: false,
        }
    }

    fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.is_inbound_gateway {
            flags |= FLAG_INBOUND_GATEWAY;
        }
        if self.is_outbound_endpoint {
            flags |= FLAG_OUTBOUND_ENDPOINT;
        }
        flags
    }

    /// Write this hop's sealed build request into its assigned slot
    pub fn create_build_request_record(
        &self,
        records: &mut [u8],
        record_size: usize,
        reply_msg_id: u32,
        rng: &mut dyn RngCore,
    ) -> Result<()> {
        let idx = self.record_index.ok_or(TunnelError::RecordIndexMissing)?;
        let request = BuildRequestRecord {
            receive_tunnel_id: self.recv_tunnel_id,
            next_tunnel_id: self.next_tunnel_id,
            next_ident: self.next_ident,
            flags: self.flags(),
            reply_msg_id,
            layer_key: self.layer_key,
            iv_key: self.iv_key,
            reply_key: self.reply_key,
        };
        let plaintext = request.encode(record_size - RECORD_SEAL_OVERHEAD, rng)?;
        let sealed = seal_record(&self.ident.encryption_pubkey, idx as u8, &plaintext)?;
        records[idx * record_size..(idx + 1) * record_size].copy_from_slice(&sealed);
        Ok(())
    }

    /// Apply this hop's layer transform to the record in slot `other_idx`.
    /// Used for pre-encrypting records of deeper hops on the way out and,
    /// symmetrically, for peeling reply layers off earlier hops' slots.
    pub fn decrypt_record(&self, records: &mut [u8], record_size: usize, other_idx: usize) {
        let slot = &mut records[other_idx * record_size..(other_idx + 1) * record_size];
        record_layer_transform(&self.reply_key, other_idx as u8, slot);
    }

    /// Verify and decode this hop's own reply slot, leaving the plaintext
    /// at the front of the slot so the return code can be read back.
    pub fn decrypt_build_response_record(
        &self,
        records: &mut [u8],
        record_size: usize,
    ) -> Result<()> {
        let idx = self.record_index.ok_or(TunnelError::RecordIndexMissing)?;
        let slot = &records[idx * record_size..(idx + 1) * record_size];
        let plaintext = open_reply(&self.reply_key, idx as u8, slot)?;
        records[idx * record_size..idx * record_size + plaintext.len()]
            .copy_from_slice(&plaintext);
        Ok(())
    }

    /// Return code from this hop's decoded reply slot
    pub fn ret_code(&self, records: &[u8], record_size: usize) -> Result<u8> {
        let idx = self.record_index.ok_or(TunnelError::RecordIndexMissing)?;
        Ok(records[idx * record_size])
    }

    /// Reply-routing key and tag for this hop (short builds, last hop)
    pub fn garlic_key(&self) -> ([u8; 32], u64) {
        (garlic_key(&self.reply_key), garlic_tag(&self.reply_key))
    }
}
