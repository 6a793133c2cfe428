use thiserror::Error;

use garliccraft_crypto::EncryptError;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Record encryption error: {0}")]
    Crypto(#[from] EncryptError),

    #[error("Record index not assigned")]
    RecordIndexMissing,

    #[error("Record index {0} out of range")]
    RecordIndexOutOfRange(usize),

    #[error("Build record plaintext too short: {0} bytes")]
    RecordTooShort(usize),

    #[error("Tunnel has no build config")]
    NoBuildConfig,

    #[error("Tunnel needs at least one hop")]
    EmptyHopChain,
}

pub type Result<T> = std::result::Result<T, TunnelError>;
