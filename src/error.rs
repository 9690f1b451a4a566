//! Error types for the init process.

/// Init error covering all failure modes.
///
/// Boot-pipeline variants marked fatal by the caller end in a kernel restart;
/// control-plane variants are surfaced to the client and the server keeps
/// serving.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("mount {target}: {detail}")]
    MountFailed { target: String, detail: String },

    #[error("root switch: {0}")]
    PivotFailed(String),

    #[error("load config: {0}")]
    ConfigLoadFailed(String),

    #[error("user {0:?} not found")]
    UserNotFound(String),

    #[error("group {0:?} not found")]
    GroupNotFound(String),

    #[error("empty argv: no command configured")]
    EmptyArgv,

    #[error("spawn: {0}")]
    SpawnFailed(String),

    #[error("network config: {0}")]
    NetworkConfigFailed(String),

    #[error("control transport: {0}")]
    ControlTransportFailed(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("stream protocol: {0}")]
    StreamProtocolError(String),
}

impl InitError {
    /// Shorthand for a mount failure at `target`.
    pub fn mount(target: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::MountFailed {
            target: target.into(),
            detail: err.to_string(),
        }
    }
}
