//! Scrape-side interfaces and shared types.
//!
//! A reader polls one endpoint that publishes a JSON object. The engine
//! owns the pacing: it sends a [`ReadRequest`] on the reader's job channel
//! for every tick of the reader's interval, and consumes [`ReadResult`]s
//! from the channel handed out by [`DataReader::take_results`]. Readers
//! never see a backoff counter; they only report success or failure.
//!
//! Every reader must be pinged before its first read. Reads issued before
//! a successful ping fail with [`Error::PingNotCalled`]. When the shutdown
//! token fires, a reader finishes its in-flight requests best-effort and
//! lets its task resolve; the resolved handle is the "done" signal.

pub mod expvar;
pub mod self_metrics;
pub mod testing;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::ReaderSettings;
use crate::datatype::Mapper;
use crate::stats;
use crate::token::JobId;
use crate::urls;

/// Bound for the job and result channels of a single reader.
pub const CHANNEL_CAPACITY: usize = 32;

/// Backoff limit applied when the settings leave it at zero.
pub const DEFAULT_BACKOFF_LIMIT: u32 = 5;

/// A request for one scrape, issued by the engine's ticker.
#[derive(Debug, Clone, Copy)]
pub struct ReadRequest {
    /// Correlation id assigned to this scrape.
    pub id: JobId,
}

/// Outcome of one scrape.
#[derive(Debug, Clone)]
pub struct ReadResult {
    /// Correlation id of the request that produced this result.
    pub id: JobId,
    /// When the read completed. Stamped at completion, not consumption.
    pub time: SystemTime,
    /// Type name documents from this reader are indexed under.
    pub type_name: String,
    /// Conversion rules for this reader's payloads.
    pub mapper: Mapper,
    /// Raw JSON body, or the error that prevented the read.
    pub outcome: Result<Bytes, Error>,
}

/// Reader errors: configuration problems found at construction, and the
/// runtime failures a scrape can produce.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The reader name is empty.
    #[error("reader name cannot be empty")]
    EmptyName,
    /// The type name is empty.
    #[error("type name cannot be empty")]
    EmptyTypeName,
    /// The endpoint is empty.
    #[error("endpoint cannot be empty")]
    EmptyEndpoint,
    /// The endpoint is not a usable URL.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    /// The timeout is below the supported minimum.
    #[error("timeout should be at least one second, got {0:?}")]
    LowTimeout(Duration),
    /// A read was attempted before a successful ping.
    #[error("endpoint was not pinged before reading")]
    PingNotCalled,
    /// The endpoint refused the connection or answered with a bad status.
    #[error("endpoint not available: {0}")]
    EndpointNotAvailable(String),
    /// The request outlived its deadline.
    #[error("read timed out")]
    ReadTimeout,
    /// The consecutive-failure limit was reached; the reader is retired.
    #[error("backoff limit exceeded")]
    BackoffExceeded,
}

/// A source of scraped metric payloads.
///
/// Descriptor accessors are immutable after construction. The channels are
/// single-producer single-consumer: the engine holds the job sender and the
/// result receiver, the reader's task holds the other halves.
#[async_trait]
pub trait DataReader: Send {
    /// Unique name within an engine.
    fn name(&self) -> &str;

    /// Type name documents from this reader are indexed under.
    fn type_name(&self) -> &str;

    /// Endpoint this reader scrapes, for logs and ping errors.
    fn endpoint(&self) -> &str;

    /// Tick interval between scrapes.
    fn interval(&self) -> Duration;

    /// Deadline applied to each scrape request.
    fn timeout(&self) -> Duration;

    /// Consecutive failures tolerated before the reader is retired.
    fn backoff_limit(&self) -> u32;

    /// Conversion rules applied to this reader's payloads.
    fn mapper(&self) -> Mapper;

    /// One-shot reachability check. Must succeed before the first read.
    async fn ping(&mut self) -> Result<(), Error>;

    /// Sender half of the job channel the engine ticks into.
    fn job_sender(&self) -> mpsc::Sender<ReadRequest>;

    /// Takes the result receiver. Yields `None` after the first call.
    fn take_results(&mut self) -> Option<mpsc::Receiver<ReadResult>>;

    /// Spawns the read loop. The handle resolves once the loop has
    /// observed shutdown and drained its in-flight work.
    fn start(&mut self, shutdown: CancellationToken) -> JoinHandle<()>;
}

/// Validated descriptor fields shared by the reader implementations.
#[derive(Debug, Clone)]
pub(crate) struct Descriptor {
    pub(crate) name: String,
    pub(crate) type_name: String,
    pub(crate) endpoint: String,
    pub(crate) interval: Duration,
    pub(crate) timeout: Duration,
    pub(crate) backoff_limit: u32,
}

impl Descriptor {
    pub(crate) fn from_settings(settings: &ReaderSettings) -> Result<Self, Error> {
        if settings.name.trim().is_empty() {
            return Err(Error::EmptyName);
        }
        if settings.type_name.trim().is_empty() {
            return Err(Error::EmptyTypeName);
        }
        if settings.endpoint.trim().is_empty() {
            return Err(Error::EmptyEndpoint);
        }
        let endpoint = urls::sanitise_url(&settings.endpoint)
            .map_err(|_| Error::InvalidEndpoint(settings.endpoint.clone()))?;
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
            type_name: settings.type_name.clone(),
            endpoint,
            interval: settings.interval(),
            timeout,
            backoff_limit,
        })
    }
}

/// Publishes a result without ever blocking the reader; a full channel
/// drops the result with a log event.
pub(crate) fn publish(name: &str, results: &mpsc::Sender<ReadResult>, result: ReadResult) {
    match results.try_send(result) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(reader = %name, "result channel full, dropping result");
            stats::result_dropped();
        }
        // The engine is gone; shutdown is already in progress.
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
}

/// One HEAD request against the endpoint under the given deadline.
pub(crate) async fn check_endpoint(
    client: &reqwest::Client,
    endpoint: &str,
    timeout: Duration,
) -> Result<(), Error> {
    let unavailable = |detail: String| Error::EndpointNotAvailable(format!("{endpoint}: {detail}"));
    match tokio::time::timeout(timeout, client.head(endpoint).send()).await {
        Ok(Ok(resp)) if resp.status().is_success() || resp.status().is_redirection() => Ok(()),
        Ok(Ok(resp)) => Err(unavailable(format!("status {}", resp.status()))),
        Ok(Err(err)) => Err(unavailable(err.to_string())),
        Err(_) => Err(unavailable("ping timed out".to_string())),
    }
}

/// One GET request against the endpoint under the given deadline,
/// returning the raw body.
pub(crate) async fn fetch_bytes(
    client: &reqwest::Client,
    endpoint: &str,
    timeout: Duration,
) -> Result<Bytes, Error> {
    let started = tokio::time::Instant::now();
    let response = match tokio::time::timeout(timeout, client.get(endpoint).send()).await {
        Ok(Ok(response)) => response,
        Ok(Err(err)) if err.is_timeout() => return Err(Error::ReadTimeout),
        Ok(Err(err)) => return Err(Error::EndpointNotAvailable(err.to_string())),
        Err(_) => return Err(Error::ReadTimeout),
    };
    if !response.status().is_success() {
        return Err(Error::EndpointNotAvailable(format!(
            "status {}",
            response.status()
        )));
    }
    let remaining = timeout.saturating_sub(started.elapsed());
    match tokio::time::timeout(remaining, response.bytes()).await {
        Ok(Ok(body)) => Ok(body),
        Ok(Err(err)) => Err(Error::EndpointNotAvailable(err.to_string())),
        Err(_) => Err(Error::ReadTimeout),
    }
}

/// Shared flag recording whether an endpoint has been pinged.
#[derive(Debug, Clone, Default)]
pub(crate) struct Pinged(Arc<AtomicBool>);

impl Pinged {
    pub(crate) fn mark(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub(crate) fn check(&self) -> Result<(), Error> {
        if self.0.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::PingNotCalled)
        }
    }
}
