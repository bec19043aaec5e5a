//! Channel-compatible mock reader for driving the engine without real
//! endpoints.
//!
//! The read behavior is a caller-supplied closure, so tests can inject
//! payloads, errors, and the terminal backoff signal on demand. Ping still
//! goes over the network so construction-time health checks behave like
//! the real reader's.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{
    check_endpoint, publish, DataReader, Descriptor, Error, Pinged, ReadRequest, ReadResult,
    CHANNEL_CAPACITY,
};
use crate::config::ReaderSettings;
use crate::datatype::Mapper;

/// Behavior invoked for every job request the mock receives.
pub type ReadFn = dyn Fn(ReadRequest) -> Result<Bytes, Error> + Send + Sync;

/// Mock reader with pluggable read behavior.
pub struct Reader {
    descriptor: Descriptor,
    mapper: Mapper,
    client: reqwest::Client,
    pinged: Pinged,
    read_fn: Arc<ReadFn>,
    job_tx: mpsc::Sender<ReadRequest>,
    job_rx: Option<mpsc::Receiver<ReadRequest>>,
    result_tx: mpsc::Sender<ReadResult>,
    result_rx: Option<mpsc::Receiver<ReadResult>>,
}

impl Reader {
    /// Builds a mock reader. Validation matches the HTTP reader so
    /// construction-error tests exercise the same paths.
    pub fn new(settings: &ReaderSettings) -> Result<Self, Error> {
        let descriptor = Descriptor::from_settings(settings)?;
        let (job_tx, job_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (result_tx, result_rx) = mpsc::channel(CHANNEL_CAPACITY);
        Ok(Self {
            descriptor,
            mapper: Mapper::default(),
            client: reqwest::Client::new(),
            pinged: Pinged::default(),
            read_fn: Arc::new(|_| Ok(Bytes::from_static(b"{}"))),
            job_tx,
            job_rx: Some(job_rx),
            result_tx,
            result_rx: Some(result_rx),
        })
    }

    /// Replaces the read behavior.
    pub fn set_read_fn<F>(&mut self, read_fn: F)
    where
        F: Fn(ReadRequest) -> Result<Bytes, Error> + Send + Sync + 'static,
    {
        self.read_fn = Arc::new(read_fn);
    }

    /// Replaces the mapper handed out with every result.
    pub fn set_mapper(&mut self, mapper: Mapper) {
        self.mapper = mapper;
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
            return tokio::spawn(async {});
        };
        let name = self.descriptor.name.clone();
        let type_name = self.descriptor.type_name.clone();
        let mapper = self.mapper.clone();
        let pinged = self.pinged.clone();
        let read_fn = Arc::clone(&self.read_fn);
        let results = self.result_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    request = jobs.recv() => match request {
                        Some(request) => {
                            let outcome = match pinged.check() {
                                Ok(()) => (read_fn)(request),
                                Err(err) => Err(err),
                            };
                            let result = ReadResult {
                                id: request.id,
                                time: SystemTime::now(),
                                type_name: type_name.clone(),
                                mapper: mapper.clone(),
                                outcome,
                            };
                            publish(&name, &results, result);
                        }
                        None => break,
                    },
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::JobId;
    use axum::routing::get;
    use axum::Router;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    async fn serve_empty() -> SocketAddr {
        let app = Router::new().route("/", get(|| async { "" }));
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        addr
    }

    fn settings(endpoint: &str) -> ReaderSettings {
        ReaderSettings {
            name: "mock".to_string(),
            type_name: "mock_type".to_string(),
            endpoint: endpoint.to_string(),
            interval_ms: 10,
            timeout_ms: 1_000,
            backoff_limit: 5,
            conversions: Default::default(),
        }
    }

    #[tokio::test]
    async fn injected_payloads_flow_to_the_result_channel() {
        let addr = serve_empty().await;
        let mut reader = Reader::new(&settings(&format!("http://{addr}"))).expect("reader");
        reader.set_read_fn(|_| Ok(Bytes::from_static(br#"{"devil":666}"#)));
        reader.ping().await.expect("ping");

        let shutdown = CancellationToken::new();
        let jobs = reader.job_sender();
        let mut results = reader.take_results().expect("first take");
        let handle = reader.start(shutdown.clone());

        let id = JobId::new();
        jobs.send(ReadRequest { id }).await.expect("job accepted");
        let result = results.recv().await.expect("result arrives");
        assert_eq!(result.id, id);
        assert_eq!(
            result.outcome.expect("payload"),
            Bytes::from_static(br#"{"devil":666}"#)
        );

        shutdown.cancel();
        handle.await.expect("read loop joins");
    }

    #[tokio::test]
    async fn injected_errors_flow_to_the_result_channel() {
        let addr = serve_empty().await;
        let mut reader = Reader::new(&settings(&format!("http://{addr}"))).expect("reader");
        reader.set_read_fn(|_| Err(Error::BackoffExceeded));
        reader.ping().await.expect("ping");

        let shutdown = CancellationToken::new();
        let jobs = reader.job_sender();
        let mut results = reader.take_results().expect("first take");
        let handle = reader.start(shutdown.clone());

        jobs.send(ReadRequest { id: JobId::new() })
            .await
            .expect("job accepted");
        let result = results.recv().await.expect("result arrives");
        assert_eq!(result.outcome.err(), Some(Error::BackoffExceeded));

        shutdown.cancel();
        handle.await.expect("read loop joins");
    }
}
