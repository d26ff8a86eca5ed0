use thiserror::Error;

/// Client-side error taxonomy. Validation errors are raised before any
/// transmission; protocol errors report a server rejection with state left
/// unchanged; transport errors force the session to `Disconnected`. None of
/// these are fatal; a fresh `connect()` recovers from all of them.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("transport: {0}")]
    Transport(String),
    #[error("storage: {0}")]
    Storage(#[from] anyhow::Error),
}

impl ClientError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}
