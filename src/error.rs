use thiserror::Error;

/// Crate-wide error type. Routing/policy drops (duplicate events, relay
/// messages, missing conversations) are not errors — handlers answer those
/// with a structured status string and move on.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The storage back-end is unreachable. Callers treat this as transient.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Storage document exists but cannot be parsed. Fatal.
    #[error("storage corrupt: {0}")]
    StorageCorrupt(String),

    /// The full recovery ladder was exhausted for an identity.
    #[error("identity unrecoverable: {0}")]
    IdentityUnrecoverable(String),

    /// Non-success response from the homeserver.
    #[error("homeserver error: HTTP {status} {body}")]
    Homeserver { status: u16, body: String },

    /// Derived localpart is empty or violates the `[a-z0-9_]` class.
    #[error("invalid localpart: {0}")]
    InvalidLocalpart(String),

    /// A stored room could not be joined or read.
    #[error("room unreachable: {0}")]
    RoomUnreachable(String),

    /// The parent space cannot be created or reused.
    #[error("space unavailable: {0}")]
    SpaceUnavailable(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Non-success response from the agent service.
    #[error("agent service error: {0}")]
    AgentService(String),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl BridgeError {
    /// Errors safe to retry without surfacing.
    pub fn is_transient(&self) -> bool {
        match self {
            BridgeError::StorageUnavailable(_) | BridgeError::Network(_) => true,
            BridgeError::Homeserver { status, .. } => *status >= 500,
            BridgeError::AgentService(msg) => msg.starts_with("HTTP 5"),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn homeserver_5xx_is_transient() {
        let err = BridgeError::Homeserver {
            status: 502,
            body: "gateway".into(),
        };
        assert!(err.is_transient());
    }

    #[test]
    fn homeserver_4xx_is_not_transient() {
        let err = BridgeError::Homeserver {
            status: 403,
            body: "forbidden".into(),
        };
        assert!(!err.is_transient());
    }

    #[test]
    fn storage_unavailable_is_transient() {
        assert!(BridgeError::StorageUnavailable("down".into()).is_transient());
        assert!(!BridgeError::StorageCorrupt("bad json".into()).is_transient());
    }

    #[test]
    fn unrecoverable_is_terminal() {
        assert!(!BridgeError::IdentityUnrecoverable("x".into()).is_transient());
    }
}
