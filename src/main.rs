//! varspipe binary: wires CLI settings into an engine and runs it.

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use varspipe::reader::{self, DataReader};
use varspipe::recorder;
use varspipe::{Engine, Mapper, ReaderSettings, RecorderSettings};

/// Command-line surface for a single-recorder pipeline.
#[derive(Parser, Debug)]
#[command(
    name = "varspipe",
    about = "Scrapes JSON metric endpoints into an indexing sink"
)]
struct Cli {
    /// Reader endpoints as comma-separated name=url pairs
    #[arg(
        long,
        env = "VARSPIPE_READERS",
        default_value = "app=http://localhost:1234/debug/vars"
    )]
    readers: String,

    /// Type name scraped documents are indexed under
    #[arg(long, env = "VARSPIPE_TYPE_NAME", default_value = "expvar")]
    type_name: String,

    /// Milliseconds between scrapes
    #[arg(long, env = "VARSPIPE_INTERVAL_MS", default_value_t = 2_000)]
    interval_ms: u64,

    /// Milliseconds before an in-flight request is abandoned
    #[arg(long, env = "VARSPIPE_TIMEOUT_MS", default_value_t = 5_000)]
    timeout_ms: u64,

    /// Consecutive failures tolerated before an endpoint is retired
    #[arg(long, env = "VARSPIPE_BACKOFF", default_value_t = 5)]
    backoff_limit: u32,

    /// Indexing sink endpoint
    #[arg(long, env = "VARSPIPE_RECORDER", default_value = "http://localhost:9200")]
    recorder: String,

    /// Index documents are written into
    #[arg(long, env = "VARSPIPE_INDEX", default_value = "varspipe")]
    index_name: String,

    /// Also scrape this process's own counters
    #[arg(long, env = "VARSPIPE_SELF_METRICS", default_value_t = false)]
    self_metrics: bool,
}

impl Cli {
    fn reader_settings(&self) -> Result<Vec<ReaderSettings>> {
        let mut settings = Vec::new();
        for pair in self.readers.split(',') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let Some((name, endpoint)) = pair.split_once('=') else {
                bail!("reader {pair:?} is not a name=url pair");
            };
            settings.push(ReaderSettings {
                name: name.trim().to_string(),
                type_name: self.type_name.clone(),
                endpoint: endpoint.trim().to_string(),
                interval_ms: self.interval_ms,
                timeout_ms: self.timeout_ms,
                backoff_limit: self.backoff_limit,
                conversions: Default::default(),
            });
        }
        if settings.is_empty() {
            bail!("no readers configured");
        }
        Ok(settings)
    }

    fn recorder_settings(&self) -> RecorderSettings {
        RecorderSettings {
            name: "recorder".to_string(),
            endpoint: self.recorder.clone(),
            index_name: self.index_name.clone(),
            timeout_ms: self.timeout_ms,
            backoff_limit: self.backoff_limit,
        }
    }

    fn self_settings(&self) -> ReaderSettings {
        ReaderSettings {
            name: "self".to_string(),
            type_name: self.type_name.clone(),
            endpoint: "http://localhost.localdomain".to_string(),
            interval_ms: self.interval_ms,
            timeout_ms: self.timeout_ms,
            backoff_limit: self.backoff_limit,
            conversions: Default::default(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let shutdown = CancellationToken::new();

    let engine = build_engine(&cli, shutdown.clone())
        .await
        .context("building the pipeline")?;

    let ctrl = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            ctrl.cancel();
        }
    });

    engine.start().await;
    Ok(())
}

async fn build_engine(cli: &Cli, shutdown: CancellationToken) -> Result<Engine> {
    let reader_settings = cli.reader_settings()?;
    let recorder_settings = cli.recorder_settings();

    if !cli.self_metrics {
        return Ok(Engine::from_config(shutdown, &recorder_settings, &reader_settings).await?);
    }

    let mut readers: Vec<Box<dyn DataReader>> = Vec::with_capacity(reader_settings.len() + 1);
    for settings in &reader_settings {
        let mapper = Mapper::from_rules(&settings.conversions);
        readers.push(Box::new(reader::expvar::Reader::new(settings, mapper)?));
    }
    readers.push(Box::new(reader::self_metrics::Reader::new(
        &cli.self_settings(),
        Mapper::default(),
    )?));
    let sink = recorder::elasticsearch::Recorder::new(&recorder_settings)?;
    Ok(Engine::new(shutdown, Box::new(sink), readers).await?)
}
