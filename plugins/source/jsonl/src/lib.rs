mod format;
mod source;

pub use format::{LogHeader, LogLine, render_log};
pub use source::{JsonlLogSource, content_identity, metadata_identity};
