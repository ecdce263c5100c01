use thiserror::Error;

/// Marker substring the backend puts in authorization denials for cloud
/// resource listings. These are downgraded to warnings at the data-model
/// layer so sibling categories still load.
const AUTHORIZATION_DENIAL: &str = "NotAuthorizedOrNotFound";

/// Top-level error type for the `shellgate-core` crate.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Transport or protocol failure from the wire layer.
    #[error(transparent)]
    Api(#[from] shellgate_api::Error),

    /// `connect` called on a session that is already connected.
    #[error("Session already connected")]
    AlreadyConnected,

    /// A requisition handler failed; the remaining chain was aborted.
    #[error("Requisition handler failed: {0}")]
    Handler(String),

    /// A backend payload did not match the expected shape.
    #[error("Unexpected payload: {0}")]
    Payload(#[from] serde_json::Error),

    /// An operation referenced a tree entry that does not exist.
    #[error("Unknown entry: {0}")]
    UnknownEntry(String),
}

impl CoreError {
    /// True for backend errors that mean "you cannot see this resource"
    /// rather than "the request was malformed".
    pub fn is_authorization_denial(&self) -> bool {
        matches!(
            self,
            Self::Api(shellgate_api::Error::Backend { message })
                if message.contains(AUTHORIZATION_DENIAL)
        )
    }
}
