//! Error types for the mesh core.
//!
//! Caller-initiated operations surface these to the caller. Internally
//! triggered failures (per-recipient send errors, adapter drops mid-send,
//! malformed frames) are logged and never tear down the node. Dedup drops,
//! TTL expiries and unrouteable forwards are normal operation, not errors.

use std::borrow::Cow;
use thiserror::Error;

/// Errors the mesh core raises.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Operation invoked before `start` or after `stop`
    #[error("node is not started")]
    NotInitialized,

    /// Explicit connect or send names a peer the local node never heard of
    #[error("peer not found: {0}")]
    PeerNotFound(String),

    /// Targeted send with no resolvable next hops
    #[error("no route to any target")]
    RoutingUnavailable,

    /// No adapter holds the needed direct peer at send time
    #[error("no transport holds direct peer {0}")]
    TransportUnavailable(String),

    /// Malformed inbound frame (swallowed internally, surfaced only from
    /// explicit decode calls)
    #[error(transparent)]
    Decode(#[from] crate::wire::WireError),

    /// Underlying transport failure
    #[error(transparent)]
    Transport(#[from] skein_transport::TransportError),

    /// Invalid lifecycle transition
    #[error("invalid state: {0}")]
    InvalidState(Cow<'static, str>),
}

impl MeshError {
    /// True when retrying the operation may succeed without intervention
    /// (routes re-learn on the next announce, adapters reconnect).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MeshError::RoutingUnavailable
                | MeshError::TransportUnavailable(_)
                | MeshError::Transport(_)
        )
    }

    /// True when retrying cannot help until the caller changes something.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            MeshError::NotInitialized
                | MeshError::PeerNotFound(_)
                | MeshError::InvalidState(_)
                | MeshError::Decode(_)
        )
    }

    /// Invalid-state error with static context, no allocation.
    #[must_use]
    pub const fn invalid_state(context: &'static str) -> Self {
        MeshError::InvalidState(Cow::Borrowed(context))
    }
}

/// Result type for mesh operations.
pub type Result<T> = std::result::Result<T, MeshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_permanent_split() {
        assert!(MeshError::RoutingUnavailable.is_transient());
        assert!(MeshError::TransportUnavailable("p".into()).is_transient());
        assert!(MeshError::NotInitialized.is_permanent());
        assert!(MeshError::PeerNotFound("p".into()).is_permanent());

        assert!(!MeshError::RoutingUnavailable.is_permanent());
        assert!(!MeshError::NotInitialized.is_transient());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            MeshError::TransportUnavailable("b".into()).to_string(),
            "no transport holds direct peer b"
        );
        assert_eq!(MeshError::NotInitialized.to_string(), "node is not started");
    }
}
