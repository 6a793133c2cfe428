//! GarlicCraft cryptography
//!
//! Key handling, build-record sealing, and the tunnel-layer cipher.
//! Everything the tunnel subsystem needs from crypto goes through this
//! crate; it knows nothing about tunnels themselves.

mod encrypt;
mod keys;
mod layer;

pub use encrypt::*;
pub use keys::*;
pub use layer::*;
