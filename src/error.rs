//! Error taxonomy shared by the workers and the orchestrator

/// Convenience result type used across the crate.
pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    /// Configuration values that cannot drive a pipeline.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An isolated worker thread could not be created.
    #[error("failed to spawn {kind} worker: {source}")]
    WorkerSpawn {
        kind: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The other side of a worker boundary has shut down.
    #[error("{0} worker is gone")]
    WorkerGone(&'static str),

    /// Reported by a codec inside the decode worker.
    #[error("decode error: {0}")]
    Decode(String),

    /// A fallback snapshot failed.
    #[error("capture error: {0}")]
    Capture(String),

    /// Drawing surface creation or drawing failed.
    #[error("surface error: {0}")]
    Surface(String),

    /// A stopped pipeline cannot be started again.
    #[error("pipeline already stopped")]
    Stopped,

    /// Platform lacks a capability the pipelined path needs.
    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

impl PipelineError {
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    pub fn capture(msg: impl Into<String>) -> Self {
        Self::Capture(msg.into())
    }

    pub fn surface(msg: impl Into<String>) -> Self {
        Self::Surface(msg.into())
    }
}
