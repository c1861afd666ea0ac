//! Bridge Error Types
//!
//! Every error here is scoped to a single session. None of them may take down
//! the server or affect other sessions.

use thiserror::Error;

use crate::session::SessionId;

/// WebSocket close code for an internal server failure
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;
/// WebSocket close code asking the client to retry later
pub const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

/// Session-scoped errors
#[derive(Error, Debug)]
pub enum BridgeError {
    // Admission errors
    #[error("Unauthorized connection")]
    Unauthorized,

    #[error("Maximum sessions reached: {0}")]
    CapacityExhausted(usize),

    // Process errors
    #[error("Failed to spawn shell: {0}")]
    Spawn(String),

    // Stream errors
    #[error("Stream error: {0}")]
    Stream(String),

    // Registry errors
    #[error("Session already registered: {0}")]
    DuplicateId(SessionId),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Close code sent to a client whose session could not be opened
    pub fn close_code(&self) -> u16 {
        match self {
            Self::CapacityExhausted(_) => CLOSE_TRY_AGAIN_LATER,
            _ => CLOSE_INTERNAL_ERROR,
        }
    }
}

impl From<toml::de::Error> for BridgeError {
    fn from(err: toml::de::Error) -> Self {
        BridgeError::InvalidConfig(err.to_string())
    }
}

/// Result type alias for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_codes() {
        assert_eq!(BridgeError::CapacityExhausted(4).close_code(), CLOSE_TRY_AGAIN_LATER);
        assert_eq!(
            BridgeError::Spawn("no pty".to_string()).close_code(),
            CLOSE_INTERNAL_ERROR
        );
    }

    #[test]
    fn test_toml_error_maps_to_invalid_config() {
        let err: BridgeError = toml::from_str::<toml::Value>("= broken").unwrap_err().into();
        assert!(matches!(err, BridgeError::InvalidConfig(_)));
    }
}
