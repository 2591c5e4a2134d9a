use thiserror::Error;

/// All errors produced by scriba-core.
///
/// The variants mirror the runner's retry policy: `Input` fails the job
/// outright, `EngineTransient` is retried once within the same stage,
/// `EngineUnavailable` triggers evict-then-retry and may degrade the preset,
/// `Checkpoint` is logged and swallowed, `Protocol` never touches job state.
#[derive(Debug, Error)]
pub enum ScribaError {
    #[error("input error: {0}")]
    Input(String),

    #[error("transient engine failure in {engine}: {message}")]
    EngineTransient { engine: &'static str, message: String },

    #[error("engine unavailable: {engine}: {message}")]
    EngineUnavailable { engine: &'static str, message: String },

    #[error("job {0} not found")]
    JobNotFound(String),

    #[error("invalid job state: {0}")]
    InvalidTransition(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("checkpoint IO error: {0}")]
    Checkpoint(String),

    #[error("media tool error: {0}")]
    MediaTool(String),

    #[error("job canceled")]
    Canceled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ScribaError {
    /// True for failures the runner retries once before giving up (§ error
    /// taxonomy: EngineTransient).
    pub fn is_transient(&self) -> bool {
        matches!(self, ScribaError::EngineTransient { .. })
    }
}

pub type Result<T> = std::result::Result<T, ScribaError>;
