//! Sink-side interfaces and shared types.
//!
//! The recorder is the single consumer of normalized documents. The engine
//! enqueues [`RecordJob`]s on the recorder's job channel; the recorder's
//! writer task persists them one HTTP request at a time and reports each
//! outcome as a [`RecordAck`]. Backoff accounting stays with the engine;
//! the recorder only reports what happened.

pub mod elasticsearch;
pub mod testing;

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::RecorderSettings;
use crate::token::JobId;
use crate::urls;

/// Bound for the job and ack channels of the recorder.
pub const CHANNEL_CAPACITY: usize = 64;

/// Backoff limit applied when the settings leave it at zero.
pub const DEFAULT_BACKOFF_LIMIT: u32 = 5;

/// Characters that may not appear in an index name.
const FORBIDDEN_INDEX_CHARS: &[char] = &['*', '\\', '<', '|', ',', '>', '/', '?', '"'];

/// A normalized document ready to be indexed.
#[derive(Debug, Clone)]
pub struct RecordJob {
    /// Correlation id of the scrape that produced this document.
    pub id: JobId,
    /// When the originating read completed.
    pub time: SystemTime,
    /// Index the document is written into.
    pub index_name: String,
    /// Type name the document is indexed under.
    pub type_name: String,
    /// Canonical JSON payload from the normalizer.
    pub payload: Bytes,
}

/// Per-job outcome reported back to the engine.
#[derive(Debug, Clone)]
pub struct RecordAck {
    /// Correlation id of the job this ack belongs to.
    pub id: JobId,
    /// The failure, if the write did not land.
    pub error: Option<Error>,
}

/// Recorder errors: configuration problems found at construction, and the
/// runtime failures a write can produce.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The recorder name is empty.
    #[error("recorder name cannot be empty")]
    EmptyName,
    /// The endpoint is empty.
    #[error("endpoint cannot be empty")]
    EmptyEndpoint,
    /// The index name is empty after defaulting.
    #[error("index name cannot be empty")]
    EmptyIndexName,
    /// The endpoint is not a usable URL.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    /// The index name contains forbidden characters.
    #[error("invalid index name: {0}")]
    InvalidIndexName(String),
    /// The timeout is below the supported minimum.
    #[error("timeout should be at least one second, got {0:?}")]
    LowTimeout(Duration),
    /// A write was attempted before a successful ping.
    #[error("endpoint was not pinged before recording")]
    PingNotCalled,
    /// The endpoint refused the connection or answered with a bad status.
    #[error("endpoint not available: {0}")]
    EndpointNotAvailable(String),
    /// The write outlived its deadline.
    #[error("write timed out")]
    WriteTimeout,
    /// The sink answered with a server error; the write may be retried.
    #[error("sink failure: {0}")]
    RemoteFailure(String),
    /// The consecutive-failure limit was reached; the sink is dead.
    #[error("backoff limit exceeded")]
    BackoffExceeded,
}

/// The single sink of normalized documents.
#[async_trait]
pub trait DataRecorder: Send {
    /// Unique name, used in logs.
    fn name(&self) -> &str;

    /// Index documents are written into.
    fn index_name(&self) -> &str;

    /// Endpoint this recorder writes to, for logs and ping errors.
    fn endpoint(&self) -> &str;

    /// Deadline applied to each write.
    fn timeout(&self) -> Duration;

    /// Consecutive failures tolerated before the engine gives up on the
    /// sink.
    fn backoff_limit(&self) -> u32;

    /// One-shot reachability check. Must succeed before the first write.
    async fn ping(&mut self) -> Result<(), Error>;

    /// Sender half of the job channel the engine enqueues into.
    fn job_sender(&self) -> mpsc::Sender<RecordJob>;

    /// Takes the ack receiver. Yields `None` after the first call.
    fn take_acks(&mut self) -> Option<mpsc::Receiver<RecordAck>>;

    /// Spawns the writer loop. The handle resolves once the loop has
    /// observed shutdown.
    fn start(&mut self, shutdown: CancellationToken) -> JoinHandle<()>;
}

/// Validated descriptor fields shared by the recorder implementations.
#[derive(Debug, Clone)]
pub(crate) struct Descriptor {
    pub(crate) name: String,
    pub(crate) index_name: String,
    pub(crate) endpoint: String,
    pub(crate) timeout: Duration,
    pub(crate) backoff_limit: u32,
}

impl Descriptor {
    pub(crate) fn from_settings(settings: &RecorderSettings) -> Result<Self, Error> {
        if settings.name.trim().is_empty() {
            return Err(Error::EmptyName);
        }
        if settings.endpoint.trim().is_empty() {
            return Err(Error::EmptyEndpoint);
        }
        let endpoint = urls::sanitise_url(&settings.endpoint)
            .map_err(|_| Error::InvalidEndpoint(settings.endpoint.clone()))?;
        // An omitted index name falls back on the recorder name.
        let index_name = if settings.index_name.is_empty() {
            settings.name.clone()
        } else {
            settings.index_name.clone()
        };
        if index_name.trim().is_empty() {
            return Err(Error::EmptyIndexName);
        }
        if index_name
            .chars()
            .any(|c| c.is_whitespace() || FORBIDDEN_INDEX_CHARS.contains(&c))
        {
            return Err(Error::InvalidIndexName(index_name));
        }
        let timeout = settings.timeout();
        if timeout < Duration::from_secs(1) {
            return Err(Error::LowTimeout(timeout));
        }
        let backoff_limit = if settings.backoff_limit == 0 {
            DEFAULT_BACKOFF_LIMIT
        } else {
            settings.backoff_limit
        };
        Ok(Self {
            name: settings.name.clone(),
            index_name,
            endpoint,
            timeout,
            backoff_limit,
        })
    }
}
