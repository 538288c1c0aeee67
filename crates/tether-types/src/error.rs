//! Error types shared across all tether crates.

/// Errors that can occur while driving an engine session.
///
/// `StartupFailure` and `ProcessTerminated` are terminal: once either is
/// returned the session rejects every further operation with the same
/// indication. The remaining variants fail a single operation only.
#[derive(Debug, thiserror::Error)]
pub enum TetherError {
    #[error("engine failed to start: {0}")]
    StartupFailure(String),

    #[error("engine process has terminated: {0}")]
    ProcessTerminated(String),

    #[error("attention handling is not supported over a remote shell: {0}")]
    AttentionUnsupported(String),

    #[error("unrecognized engine prompt: {0}")]
    UnknownPrompt(String),

    #[error("malformed table metadata: {0}")]
    MalformedMetadata(String),

    #[error("socket transfer failed: {0}")]
    SocketTransfer(String),

    #[error("stream i/o error: {0}")]
    Io(String),

    #[error("configuration error: {0}")]
    ConfigError(String),
}

impl TetherError {
    /// Whether the session that produced this error can never be used again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TetherError::StartupFailure(_) | TetherError::ProcessTerminated(_)
        )
    }
}

impl From<std::io::Error> for TetherError {
    fn from(err: std::io::Error) -> Self {
        TetherError::Io(err.to_string())
    }
}
