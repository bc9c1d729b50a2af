pub mod decoder;
pub mod error;
pub mod message;
pub mod progress;
pub mod schema;
pub mod source;
pub mod store;
pub mod subscription;
pub mod time;
pub mod topic;
pub mod util;

pub use error::{ErrorKind, SourceError};
pub use message::{IteratorResult, MessageEvent, MessagePayload, PlayerProblem, ProblemSeverity};
pub use source::{
    BackfillArgs, GetMessagesArgs, LogSource, MessageIterator, MessageIteratorArgs,
    MessagesByFormat,
};
pub use subscription::{SubscribePayload, TopicSelection, TopicsByFormat};
pub use time::Time;
pub use topic::{Initialization, MessageFormat, Topic};
