//! Reader that scrapes this process's own counters.
//!
//! The payload is the [`stats`] snapshot: the same flat JSON object an
//! external scraper would see. By default the snapshot is taken in-process
//! with no network involved. Test mode stands up a real HTTP server on a
//! loopback port and reads through it, so the full scrape path can be
//! exercised against this process.

use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    check_endpoint, fetch_bytes, publish, DataReader, Descriptor, Error, Pinged, ReadRequest,
    ReadResult, CHANNEL_CAPACITY,
};
use crate::config::ReaderSettings;
use crate::datatype::Mapper;
use crate::stats;

/// How the snapshot is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transport {
    /// Snapshot taken directly, no network.
    InProcess,
    /// Snapshot read over HTTP from the test-mode server.
    Http,
}

/// Reader publishing this process's own counters.
pub struct Reader {
    descriptor: Descriptor,
    mapper: Mapper,
    client: reqwest::Client,
    pinged: Pinged,
    transport: Transport,
    server: Option<JoinHandle<()>>,
    job_tx: mpsc::Sender<ReadRequest>,
    job_rx: Option<mpsc::Receiver<ReadRequest>>,
    result_tx: mpsc::Sender<ReadResult>,
    result_rx: Option<mpsc::Receiver<ReadResult>>,
}

impl Reader {
    /// Builds a self reader. The endpoint in the settings is only a label
    /// until test mode replaces it with a live loopback address.
    pub fn new(settings: &ReaderSettings, mapper: Mapper) -> Result<Self, Error> {
        let descriptor = Descriptor::from_settings(settings)?;
        let (job_tx, job_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (result_tx, result_rx) = mpsc::channel(CHANNEL_CAPACITY);
        Ok(Self {
            descriptor,
            mapper,
            client: reqwest::Client::new(),
            pinged: Pinged::default(),
            transport: Transport::InProcess,
            server: None,
            job_tx,
            job_rx: Some(job_rx),
            result_tx,
            result_rx: Some(result_rx),
        })
    }

    /// Switches the reader onto a freshly bound loopback HTTP server that
    /// serves the counter snapshot, so reads exercise the network path.
    pub async fn enable_test_mode(&mut self) -> Result<(), Error> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|err| Error::EndpointNotAvailable(err.to_string()))?;
        let addr: SocketAddr = listener
            .local_addr()
            .map_err(|err| Error::EndpointNotAvailable(err.to_string()))?;
        let app = Router::new().route("/", get(|| async { Json(stats::snapshot()) }));
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        self.descriptor.endpoint = format!("http://{addr}");
        self.transport = Transport::Http;
        self.server = Some(server);
        Ok(())
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        if let Some(server) = self.server.take() {
            server.abort();
        }
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
        if self.transport == Transport::Http {
            check_endpoint(&self.client, &self.descriptor.endpoint, self.descriptor.timeout)
                .await?;
        }
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
        let endpoint = self.descriptor.endpoint.clone();
        let timeout = self.descriptor.timeout;
        let mapper = self.mapper.clone();
        let client = self.client.clone();
        let pinged = self.pinged.clone();
        let transport = self.transport;
        let results = self.result_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    request = jobs.recv() => match request {
                        Some(request) => {
                            let outcome = match pinged.check() {
                                Ok(()) => match transport {
                                    Transport::InProcess => {
                                        stats::read_succeeded();
                                        Ok(Bytes::from(
                                            serde_json::to_vec(&stats::snapshot())
                                                .unwrap_or_default(),
                                        ))
                                    }
                                    Transport::Http => {
                                        let read = fetch_bytes(&client, &endpoint, timeout).await;
                                        match &read {
                                            Ok(_) => stats::read_succeeded(),
                                            Err(_) => stats::read_failed(),
                                        }
                                        read
                                    }
                                },
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
            debug!(reader = %name, "self read loop finished");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::JobId;

    fn settings() -> ReaderSettings {
        ReaderSettings {
            name: "self".to_string(),
            type_name: "varspipe".to_string(),
            endpoint: "http://localhost.localdomain".to_string(),
            interval_ms: 10,
            timeout_ms: 1_000,
            backoff_limit: 5,
            conversions: Default::default(),
        }
    }

    async fn one_read(reader: &mut Reader) -> ReadResult {
        reader.ping().await.expect("ping");
        let shutdown = CancellationToken::new();
        let jobs = reader.job_sender();
        let mut results = reader.take_results().expect("first take");
        let handle = reader.start(shutdown.clone());

        jobs.send(ReadRequest { id: JobId::new() })
            .await
            .expect("job accepted");
        let result = results.recv().await.expect("result arrives");

        shutdown.cancel();
        handle.await.expect("read loop joins");
        result
    }

    #[tokio::test]
    async fn in_process_snapshot_decodes_as_numbers() {
        let mut reader = Reader::new(&settings(), Mapper::default()).expect("reader");
        let result = one_read(&mut reader).await;
        let body = result.outcome.expect("snapshot read");
        let doc: serde_json::Value = serde_json::from_slice(&body).expect("snapshot is json");
        assert!(doc.get("ScrapeReads").is_some());
    }

    #[tokio::test]
    async fn test_mode_reads_over_http() {
        let mut reader = Reader::new(&settings(), Mapper::default()).expect("reader");
        reader.enable_test_mode().await.expect("test server");
        assert!(reader.endpoint().starts_with("http://127.0.0.1:"));

        let result = one_read(&mut reader).await;
        let body = result.outcome.expect("http read");
        let doc: serde_json::Value = serde_json::from_slice(&body).expect("snapshot is json");
        assert!(doc.get("Readers").is_some());
    }

    #[tokio::test]
    async fn in_process_ping_is_required_but_local() {
        let mut reader = Reader::new(&settings(), Mapper::default()).expect("reader");
        let shutdown = CancellationToken::new();
        let jobs = reader.job_sender();
        let mut results = reader.take_results().expect("first take");
        let handle = reader.start(shutdown.clone());

        jobs.send(ReadRequest { id: JobId::new() })
            .await
            .expect("job accepted");
        let result = results.recv().await.expect("result arrives");
        assert_eq!(result.outcome.err(), Some(Error::PingNotCalled));

        shutdown.cancel();
        handle.await.expect("read loop joins");
    }
}
