//! Reader for endpoints publishing expvar-style JSON.
//!
//! The payload is a plain JSON object, typically a Go process's
//! `/debug/vars` output. GC and memory keys are reshaped downstream by the
//! mapper so they arrive at the sink in friendlier units.

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    check_endpoint, fetch_bytes, publish, DataReader, Descriptor, Error, Pinged, ReadRequest,
    ReadResult, CHANNEL_CAPACITY,
};
use crate::config::ReaderSettings;
use crate::datatype::Mapper;
use crate::stats;

/// HTTP reader polling one JSON metrics endpoint.
pub struct Reader {
    descriptor: Descriptor,
    mapper: Mapper,
    client: reqwest::Client,
    pinged: Pinged,
    job_tx: mpsc::Sender<ReadRequest>,
    job_rx: Option<mpsc::Receiver<ReadRequest>>,
    result_tx: mpsc::Sender<ReadResult>,
    result_rx: Option<mpsc::Receiver<ReadResult>>,
}

impl Reader {
    /// Builds a reader from its settings, validating the descriptor and
    /// sanitising the endpoint.
    pub fn new(settings: &ReaderSettings, mapper: Mapper) -> Result<Self, Error> {
        let descriptor = Descriptor::from_settings(settings)?;
        let (job_tx, job_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (result_tx, result_rx) = mpsc::channel(CHANNEL_CAPACITY);
        Ok(Self {
            descriptor,
            mapper,
            client: reqwest::Client::new(),
            pinged: Pinged::default(),
            job_tx,
            job_rx: Some(job_rx),
            result_tx,
            result_rx: Some(result_rx),
        })
    }
}

#[async_trait]
impl DataReader for Reader {
    fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn type_name(&self) -> &str {
        &self.descriptor.type_name
    }

    fn endpoint(&self) -> &str {
        &self.descriptor.endpoint
    }

    fn interval(&self) -> Duration {
        self.descriptor.interval
    }

    fn timeout(&self) -> Duration {
        self.descriptor.timeout
    }

    fn backoff_limit(&self) -> u32 {
        self.descriptor.backoff_limit
    }

    fn mapper(&self) -> Mapper {
        self.mapper.clone()
    }

    async fn ping(&mut self) -> Result<(), Error> {
        check_endpoint(&self.client, &self.descriptor.endpoint, self.descriptor.timeout).await?;
        self.pinged.mark();
        Ok(())
    }

    fn job_sender(&self) -> mpsc::Sender<ReadRequest> {
        self.job_tx.clone()
    }

    fn take_results(&mut self) -> Option<mpsc::Receiver<ReadResult>> {
        self.result_rx.take()
    }

    fn start(&mut self, shutdown: CancellationToken) -> JoinHandle<()> {
        let Some(mut jobs) = self.job_rx.take() else {
            // Already started; nothing left to run.
            return tokio::spawn(async {});
        };
        let fetcher = Fetcher {
            name: self.descriptor.name.clone(),
            type_name: self.descriptor.type_name.clone(),
            endpoint: self.descriptor.endpoint.clone(),
            timeout: self.descriptor.timeout,
            mapper: self.mapper.clone(),
            client: self.client.clone(),
            pinged: self.pinged.clone(),
            results: self.result_tx.clone(),
        };
        tokio::spawn(async move {
            let name = fetcher.name.clone();
            let mut inflight = JoinSet::new();
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    request = jobs.recv() => match request {
                        Some(request) => {
                            // Each scrape runs in its own subtask so a slow
                            // endpoint cannot delay the next tick.
                            let fetcher = fetcher.clone();
                            inflight.spawn(async move { fetcher.fetch(request).await });
                        }
                        None => break,
                    },
                    Some(_) = inflight.join_next(), if !inflight.is_empty() => {}
                }
            }
            while inflight.join_next().await.is_some() {}
            debug!(reader = %name, "read loop finished");
        })
    }
}

#[derive(Clone)]
struct Fetcher {
    name: String,
    type_name: String,
    endpoint: String,
    timeout: Duration,
    mapper: Mapper,
    client: reqwest::Client,
    pinged: Pinged,
    results: mpsc::Sender<ReadResult>,
}

impl Fetcher {
    async fn fetch(self, request: ReadRequest) {
        let outcome = self.read_once().await;
        match &outcome {
            Ok(_) => stats::read_succeeded(),
            Err(err) => {
                debug!(reader = %self.name, id = %request.id, error = %err, "scrape failed");
                stats::read_failed();
            }
        }
        let result = ReadResult {
            id: request.id,
            time: SystemTime::now(),
            type_name: self.type_name.clone(),
            mapper: self.mapper.clone(),
            outcome,
        };
        publish(&self.name, &self.results, result);
    }

    async fn read_once(&self) -> Result<Bytes, Error> {
        self.pinged.check()?;
        fetch_bytes(&self.client, &self.endpoint, self.timeout).await
    }
}
