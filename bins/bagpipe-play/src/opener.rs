use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bagpipe_api::error::SourceError;
use bagpipe_engine::bootstrap::{LogOpener, OpenedLog};
use bagpipe_engine::config::{IdentityMode, SourceConfig};
use bagpipe_source_jsonl::{JsonlLogSource, content_identity, metadata_identity};

/// Opens `format = "jsonl"` sources.
pub struct JsonlOpener {
    /// Identities are only computed when a persistent cache will use them.
    pub with_identity: bool,
}

impl LogOpener for JsonlOpener {
    fn format(&self) -> &str {
        "jsonl"
    }

    fn open<'a>(
        &'a self,
        config: &'a SourceConfig,
    ) -> Pin<Box<dyn Future<Output = Result<OpenedLog, SourceError>> + Send + 'a>> {
        Box::pin(async move {
            let identity = if self.with_identity {
                Some(match config.identity {
                    IdentityMode::Metadata => metadata_identity(&config.path).await?,
                    IdentityMode::Content => content_identity(&config.path).await?,
                })
            } else {
                None
            };
            Ok(OpenedLog {
                name: config.name.clone(),
                source: Arc::new(JsonlLogSource::new(config.name.clone(), config.path.clone())),
                identity,
            })
        })
    }
}
