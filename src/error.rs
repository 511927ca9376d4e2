//! Error types for the lattice decoder

use thiserror::Error;

/// Result type alias for decoder operations
pub type DecodeResult<T> = Result<T, DecodeError>;

/// Errors that can occur during decoding
///
/// All fatal conditions terminate the current utterance; the decoder clears
/// its state and may then accept a new utterance via `begin_utterance`.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// A push would exceed a configured capacity ceiling
    #[error("capacity exceeded: {what} (capacity {capacity}) at frame {frame}")]
    CapacityExceeded {
        /// Which ceiling was hit
        what: &'static str,
        /// The configured ceiling
        capacity: u32,
        /// Frame at which the overflow was detected
        frame: i32,
    },

    /// The search graph has no arcs or no usable start state
    #[error("search graph is empty or has no start state")]
    GraphEmpty,

    /// Graph construction error
    #[error("graph error: {0}")]
    Graph(String),

    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The log-likelihood source failed to produce a frame
    #[error("log-likelihood source error: {0}")]
    Likelihood(String),

    /// An operation was called in the wrong decoder state
    #[error("decoder state error: {0}")]
    State(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DecodeError::CapacityExceeded {
            what: "lattice arcs per frame",
            capacity: 4,
            frame: 7,
        };
        assert_eq!(
            err.to_string(),
            "capacity exceeded: lattice arcs per frame (capacity 4) at frame 7"
        );
    }

    #[test]
    fn test_error_variants() {
        let graph_err = DecodeError::GraphEmpty;
        let config_err = DecodeError::Config("beam must be positive".into());
        let state_err = DecodeError::State("no active utterance");

        assert!(matches!(graph_err, DecodeError::GraphEmpty));
        assert!(matches!(config_err, DecodeError::Config(_)));
        assert!(matches!(state_err, DecodeError::State(_)));
    }
}
