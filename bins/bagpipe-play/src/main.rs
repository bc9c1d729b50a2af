mod opener;
mod output;

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use bagpipe_api::source::MessageIteratorArgs;
use bagpipe_api::store::BlockStore;
use bagpipe_api::subscription::{SubscribePayload, TopicSelection, topic_selection};
use bagpipe_api::time::Time;
use bagpipe_config_hcl::HclParser;
use bagpipe_engine::bootstrap::{Pipeline, open_logs};
use bagpipe_engine::config::{PlaybackConfig, TomlParser};
use bagpipe_engine::decoder_registry::DecoderRegistry;
use bagpipe_format_json::JsonDecoderFactory;
use bagpipe_format_ros1::Ros1DecoderFactory;
use bagpipe_storage_file::FileBlockStore;

use opener::JsonlOpener;

#[derive(Parser)]
#[command(name = "bagpipe-play", about = "Play recorded logs as JSON lines")]
struct Cli {
    /// Path to the configuration file (`.toml` or `.hcl`).
    #[arg(long, default_value = "bagpipe.toml", env = "BAGPIPE_CONFIG")]
    config: String,

    /// Topic to play, `name` or `name:field1,field2`. Repeatable. Default: all.
    #[arg(long = "topic")]
    topics: Vec<String>,

    /// Start time, `sec[.nsec]`. Topics are backfilled to this point first.
    #[arg(long)]
    start: Option<Time>,

    /// Wall-clock budget of one batch, in milliseconds.
    #[arg(long, env = "BAGPIPE_BATCH_MS")]
    batch_ms: Option<u64>,

    /// Stop after this many messages.
    #[arg(long)]
    limit: Option<usize>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    tracing::info!(config = %cli.config, "loading configuration");
    let config = match PlaybackConfig::load_with(&cli.config, &[&TomlParser, &HclParser]) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let store: Option<Arc<dyn BlockStore>> = config
        .persistent_cache
        .as_ref()
        .map(|p| Arc::new(FileBlockStore::new(&p.dir)) as Arc<dyn BlockStore>);
    let opener = JsonlOpener {
        with_identity: store.is_some(),
    };
    let logs = match open_logs(&config, &[&opener]).await {
        Ok(logs) => logs,
        Err(e) => {
            tracing::error!(error = %e, "failed to open logs");
            std::process::exit(1);
        }
    };

    let decoders = DecoderRegistry::new()
        .with(Arc::new(JsonDecoderFactory))
        .with(Arc::new(Ros1DecoderFactory));
    let pipeline = match Pipeline::open(&config, logs, decoders, store).await {
        Ok(p) => p,
        Err(e) => {
            tracing::error!(error = %e, "failed to open pipeline");
            std::process::exit(1);
        }
    };

    let code = match play(&cli, &pipeline).await {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(error = %e, "playback failed");
            1
        }
    };
    pipeline.close().await;
    std::process::exit(code);
}

async fn play(cli: &Cli, pipeline: &Pipeline) -> Result<(), Box<dyn std::error::Error>> {
    let init = pipeline.initialization();
    let mut out = std::io::BufWriter::new(std::io::stdout().lock());

    for problem in &init.problems {
        writeln!(out, "{}", output::problem("initialization", problem))?;
    }

    let topics: TopicSelection = if cli.topics.is_empty() {
        topic_selection(init.topic_names().map(SubscribePayload::whole))
    } else {
        topic_selection(cli.topics.iter().map(|t| SubscribePayload::parse(t)))
    };

    if let Some(start) = cli.start {
        for event in pipeline.backfill(start, &topics).await? {
            writeln!(out, "{}", output::event(&event, true))?;
        }
    }

    let mut cursor = pipeline.cursor(MessageIteratorArgs {
        topics,
        start: cli.start,
        end: None,
    })?;
    let budget = cli
        .batch_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| pipeline.batch_budget());

    let mut played = 0usize;
    'play: loop {
        tokio::select! {
            batch = cursor.next_batch(budget) => {
                let Some(batch) = batch else {
                    tracing::info!(played, "end of log");
                    break;
                };
                for item in &batch {
                    let Some(line) = output::item(item) else {
                        continue;
                    };
                    writeln!(out, "{line}")?;
                    if item.as_message().is_some() {
                        played += 1;
                        if cli.limit.is_some_and(|limit| played >= limit) {
                            tracing::info!(played, "limit reached");
                            break 'play;
                        }
                    }
                }
                out.flush()?;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(played, "interrupted");
                break;
            }
        }
    }

    cursor.end().await;
    out.flush()?;
    Ok(())
}
