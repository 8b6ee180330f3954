use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("authentication expired")]
    AuthExpired,
    #[error("command rejected: {reason}")]
    CommandRejected { reason: String },
    #[error("rate limited")]
    RateLimited,
    #[error("session is not connected")]
    NotConnected,
    #[error("no channel selected")]
    NoChannelSelected,
    #[error("not in a voice channel")]
    NotInVoice,
    #[error("transport failure: {0}")]
    Transport(String),
}

impl ClientError {
    pub(crate) fn from_collaborator(err: anyhow::Error) -> Self {
        match err.downcast::<ClientError>() {
            Ok(typed) => typed,
            Err(other) => ClientError::Transport(format!("{other:#}")),
        }
    }
}

/// Collaborators report auth expiry as a typed [`ClientError`] inside `anyhow`.
pub fn is_auth_expired(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<ClientError>(), Some(ClientError::AuthExpired))
}
