use thiserror::Error;

/// Failures raised while harvesting one broker/symbol/timeframe.
///
/// Only [`PipelineError::Configuration`] aborts a run; every other kind is
/// recorded in the error log and the scheduler moves on.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("data error: {0}")]
    Data(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("io error: {0}")]
    Io(String),
}

impl PipelineError {
    /// Label written to the error log.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Configuration(_) => "ConfigurationError",
            PipelineError::Connection(_) => "ConnectionError",
            PipelineError::Data(_) => "DataError",
            PipelineError::Validation(_) => "ValidationError",
            PipelineError::Io(_) => "IOError",
        }
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, PipelineError::Connection(_))
    }

    /// Wraps an I/O level failure from the storage manager, keeping the context chain.
    pub fn io(err: anyhow::Error) -> Self {
        PipelineError::Io(format!("{err:#}"))
    }
}

/// Errors returned by [`MarketTerminal`](crate::terminal::MarketTerminal) implementations.
#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("terminal executable not found: {0}")]
    MissingExecutable(String),

    #[error("login rejected: {0}")]
    LoginRejected(String),

    #[error("no active session")]
    NotConnected,

    #[error("symbol {0} could not be selected")]
    SymbolUnavailable(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for TerminalError {
    fn from(err: reqwest::Error) -> Self {
        TerminalError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for TerminalError {
    fn from(err: serde_json::Error) -> Self {
        TerminalError::Malformed(err.to_string())
    }
}
