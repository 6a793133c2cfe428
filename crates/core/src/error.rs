use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Unknown I2NP message type {0}")]
    UnknownMessageType(u8),

    #[error("Message too short: need {needed} bytes, got {got}")]
    MessageTooShort { needed: usize, got: usize },

    #[error("Gateway payload {inner} exceeds message length {outer}")]
    GatewayLengthExceeded { inner: usize, outer: usize },

    #[error("Record count {0} out of range")]
    RecordCountOutOfRange(usize),

    #[error("Record index {0} out of range")]
    RecordIndexOutOfRange(usize),

    #[error("Tunnel {0} already exists")]
    DuplicateTunnelId(u32),
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_unknown_type() {
        let err = CoreError::UnknownMessageType(42);
        assert_eq!(err.to_string(), "Unknown I2NP message type 42");
    }

    #[test]
    fn test_error_display_too_short() {
        let err = CoreError::MessageTooShort { needed: 7, got: 3 };
        assert_eq!(err.to_string(), "Message too short: need 7 bytes, got 3");
    }

    #[test]
    fn test_error_display_gateway_length() {
        let err = CoreError::GatewayLengthExceeded {
            inner: 2000,
            outer: 1008,
        };
        assert_eq!(
            err.to_string(),
            "Gateway payload 2000 exceeds message length 1008"
        );
    }

    #[test]
    fn test_error_display_duplicate_id() {
        let err = CoreError::DuplicateTunnelId(99);
        assert_eq!(err.to_string(), "Tunnel 99 already exists");
    }
}
