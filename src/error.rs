use thiserror::Error;

use crate::config::ConfigError;

/// Errors surfaced to callers of the control plane.
///
/// Network conditions never show up here: timeouts, dead contacts and key
/// blocks are reported through operation outcomes instead.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("zero-length values are reserved for deletion")]
    ZeroLengthValue,

    #[error("key length {actual} does not match node id length {expected}")]
    KeyLength { expected: usize, actual: usize },

    #[error("failed to encode or decode control state: {0}")]
    Persistence(#[from] bincode::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
