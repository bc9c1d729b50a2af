use std::fmt;

/// Error kind for source errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Io,
    /// A payload or record could not be parsed.
    Format,
    /// Topic/schema tables that cannot be played together.
    Schema,
    /// The log exists but its contents are unusable.
    Corrupt,
    /// The log is valid but holds nothing to play.
    Empty,
    /// Broken internal contract (programming error).
    Logic,
}

/// Source error, returned by every source, decoder and store trait method.
///
/// `Clone` so that one failed fetch can be reported to every caller
/// waiting on it.
#[derive(Debug, Clone)]
pub struct SourceError {
    pub kind: ErrorKind,
    pub message: String,
}

impl SourceError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Config, message: msg.into() }
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Io, message: msg.into() }
    }

    pub fn format(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Format, message: msg.into() }
    }

    pub fn schema(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Schema, message: msg.into() }
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Corrupt, message: msg.into() }
    }

    pub fn empty(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Empty, message: msg.into() }
    }

    pub fn logic(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Logic, message: msg.into() }
    }

    /// Add context to the error, preserving the original ErrorKind.
    ///
    /// Produces: `"context: original message"`.
    pub fn with_context(self, ctx: impl fmt::Display) -> Self {
        Self {
            kind: self.kind,
            message: format!("{ctx}: {}", self.message),
        }
    }

    /// Errors that make a log unplayable as a whole.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Schema | ErrorKind::Corrupt | ErrorKind::Empty | ErrorKind::Config
        )
    }
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for SourceError {}

// ---------------------------------------------------------------------------
// From impls: standard error types → SourceError with correct ErrorKind
// ---------------------------------------------------------------------------

impl From<std::io::Error> for SourceError {
    fn from(e: std::io::Error) -> Self {
        Self::io(e.to_string())
    }
}

impl From<serde_json::Error> for SourceError {
    fn from(e: serde_json::Error) -> Self {
        Self::format(e.to_string())
    }
}

impl From<base64::DecodeError> for SourceError {
    fn from(e: base64::DecodeError) -> Self {
        Self::format(e.to_string())
    }
}

impl From<std::str::Utf8Error> for SourceError {
    fn from(e: std::str::Utf8Error) -> Self {
        Self::format(e.to_string())
    }
}

impl From<std::string::FromUtf8Error> for SourceError {
    fn from(e: std::string::FromUtf8Error) -> Self {
        Self::format(e.to_string())
    }
}
