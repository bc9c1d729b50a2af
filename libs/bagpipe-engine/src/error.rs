use bagpipe_api::error::SourceError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("config error: {0}")]
    Config(String),

    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error("unknown source format '{format}' for source '{source_name}'")]
    UnknownSourceFormat { source_name: String, format: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Add context to the error.
    ///
    /// For `Source` variant, context is added to the inner `SourceError`.
    /// For `Config`, context is prepended to the message.
    pub fn with_context(self, ctx: impl std::fmt::Display) -> Self {
        match self {
            EngineError::Source(e) => EngineError::Source(e.with_context(ctx)),
            EngineError::Config(msg) => EngineError::Config(format!("{ctx}: {msg}")),
            other => other,
        }
    }
}
