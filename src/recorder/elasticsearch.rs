//! HTTP recorder indexing documents into an Elasticsearch-style store.
//!
//! One document per request: the target path is
//! `{endpoint}/{index_name}/{type_name}` and the body is the normalized
//! JSON payload. Writes run sequentially on a single task so documents
//! from one reader keep their order.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    DataRecorder, Descriptor, Error, RecordAck, RecordJob, CHANNEL_CAPACITY,
};
use crate::config::RecorderSettings;
use crate::reader;
use crate::stats;

/// HTTP recorder writing one document per job.
pub struct Recorder {
    descriptor: Descriptor,
    client: reqwest::Client,
    pinged: reader::Pinged,
    job_tx: mpsc::Sender<RecordJob>,
    job_rx: Option<mpsc::Receiver<RecordJob>>,
    ack_tx: mpsc::Sender<RecordAck>,
    ack_rx: Option<mpsc::Receiver<RecordAck>>,
}

impl Recorder {
    /// Builds a recorder from its settings, validating the descriptor.
    pub fn new(settings: &RecorderSettings) -> Result<Self, Error> {
        let descriptor = Descriptor::from_settings(settings)?;
        let (job_tx, job_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (ack_tx, ack_rx) = mpsc::channel(CHANNEL_CAPACITY);
        Ok(Self {
            descriptor,
            client: reqwest::Client::new(),
            pinged: reader::Pinged::default(),
            job_tx,
            job_rx: Some(job_rx),
            ack_tx,
            ack_rx: Some(ack_rx),
        })
    }
}

#[async_trait]
impl DataRecorder for Recorder {
    fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn index_name(&self) -> &str {
        &self.descriptor.index_name
    }

    fn endpoint(&self) -> &str {
        &self.descriptor.endpoint
    }

    fn timeout(&self) -> Duration {
        self.descriptor.timeout
    }

    fn backoff_limit(&self) -> u32 {
        self.descriptor.backoff_limit
    }

    async fn ping(&mut self) -> Result<(), Error> {
        reader::check_endpoint(
            &self.client,
            &self.descriptor.endpoint,
            self.descriptor.timeout,
        )
        .await
        .map_err(translate_ping_error)?;
        self.pinged.mark();
        Ok(())
    }

    fn job_sender(&self) -> mpsc::Sender<RecordJob> {
        self.job_tx.clone()
    }

    fn take_acks(&mut self) -> Option<mpsc::Receiver<RecordAck>> {
        self.ack_rx.take()
    }

    fn start(&mut self, shutdown: CancellationToken) -> JoinHandle<()> {
        let Some(mut jobs) = self.job_rx.take() else {
            return tokio::spawn(async {});
        };
        let writer = Writer {
            name: self.descriptor.name.clone(),
            endpoint: self.descriptor.endpoint.clone(),
            timeout: self.descriptor.timeout,
            client: self.client.clone(),
            pinged: self.pinged.clone(),
        };
        let acks = self.ack_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    job = jobs.recv() => match job {
                        Some(job) => {
                            let id = job.id;
                            let error = writer.write(&job).await.err();
                            // Ack channel saturation means the engine is far
                            // behind; dropping the ack only skips one backoff
                            // update.
                            let _ = acks.try_send(RecordAck { id, error });
                        }
                        None => break,
                    },
                }
            }
            debug!(recorder = %writer.name, "writer loop finished");
        })
    }
}

fn translate_ping_error(err: reader::Error) -> Error {
    match err {
        reader::Error::EndpointNotAvailable(detail) => Error::EndpointNotAvailable(detail),
        other => Error::EndpointNotAvailable(other.to_string()),
    }
}

struct Writer {
    name: String,
    endpoint: String,
    timeout: Duration,
    client: reqwest::Client,
    pinged: reader::Pinged,
}

impl Writer {
    async fn write(&self, job: &RecordJob) -> Result<(), Error> {
        if self.pinged.check().is_err() {
            return Err(Error::PingNotCalled);
        }
        let target = format!(
            "{}/{}/{}",
            self.endpoint.trim_end_matches('/'),
            job.index_name,
            job.type_name
        );
        let send = self
            .client
            .post(&target)
            .header(CONTENT_TYPE, "application/json")
            .body(job.payload.clone())
            .send();
        let response = match tokio::time::timeout(self.timeout, send).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) if err.is_timeout() => {
                stats::record_failed();
                return Err(Error::WriteTimeout);
            }
            Ok(Err(err)) => {
                stats::record_failed();
                return Err(Error::EndpointNotAvailable(err.to_string()));
            }
            Err(_) => {
                stats::record_failed();
                return Err(Error::WriteTimeout);
            }
        };

        let status = response.status();
        if status.is_success() {
            stats::job_recorded();
            return Ok(());
        }
        if status.is_client_error() {
            // The payload is malformed; retrying cannot help, so the
            // document is dropped without touching the backoff.
            warn!(
                recorder = %self.name,
                id = %job.id,
                %status,
                "sink rejected the document, dropping it"
            );
            return Ok(());
        }
        stats::record_failed();
        Err(Error::RemoteFailure(format!("status {status}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::JobId;
    use axum::extract::{Path, State};
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::Router;
    use bytes::Bytes;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};
    use std::time::SystemTime;
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct Seen {
        requests: Mutex<Vec<(String, String, String)>>,
    }

    async fn capture(
        State(seen): State<Arc<Seen>>,
        Path((index, type_name)): Path<(String, String)>,
        body: String,
    ) -> StatusCode {
        seen.requests
            .lock()
            .expect("requests lock")
            .push((index, type_name, body));
        StatusCode::OK
    }

    async fn serve(status: Option<StatusCode>) -> (SocketAddr, Arc<Seen>) {
        let seen = Arc::new(Seen::default());
        let app = match status {
            None => Router::new()
                .route("/:index/:type_name", post(capture))
                .route("/", axum::routing::get(|| async { "" }))
                .with_state(Arc::clone(&seen)),
            Some(code) => Router::new()
                .route("/:index/:type_name", post(move || async move { code }))
                .route("/", axum::routing::get(|| async { "" }))
                .with_state(Arc::clone(&seen)),
        };
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (addr, seen)
    }

    fn settings(endpoint: &str) -> RecorderSettings {
        RecorderSettings {
            name: "sink".to_string(),
            endpoint: endpoint.to_string(),
            index_name: "metrics".to_string(),
            timeout_ms: 1_000,
            backoff_limit: 5,
        }
    }

    fn job(payload: &'static [u8]) -> RecordJob {
        RecordJob {
            id: JobId::new(),
            time: SystemTime::now(),
            index_name: "metrics".to_string(),
            type_name: "expvar".to_string(),
            payload: Bytes::from_static(payload),
        }
    }

    async fn one_write(recorder: &mut Recorder, job: RecordJob) -> RecordAck {
        recorder.ping().await.expect("ping");
        let shutdown = CancellationToken::new();
        let jobs = recorder.job_sender();
        let mut acks = recorder.take_acks().expect("first take");
        let handle = recorder.start(shutdown.clone());

        jobs.send(job).await.expect("job accepted");
        let ack = acks.recv().await.expect("ack arrives");

        shutdown.cancel();
        handle.await.expect("writer loop joins");
        ack
    }

    #[tokio::test]
    async fn documents_land_under_index_and_type() {
        let (addr, seen) = serve(None).await;
        let mut recorder = Recorder::new(&settings(&format!("http://{addr}"))).expect("recorder");

        let ack = one_write(&mut recorder, job(br#"{"devil":666.000000}"#)).await;
        assert!(ack.error.is_none());

        let requests = seen.requests.lock().expect("requests lock");
        assert_eq!(requests.len(), 1);
        let (index, type_name, body) = &requests[0];
        assert_eq!(index, "metrics");
        assert_eq!(type_name, "expvar");
        assert_eq!(body, r#"{"devil":666.000000}"#);
    }

    #[tokio::test]
    async fn client_errors_are_dropped_without_failing() {
        let (addr, _seen) = serve(Some(StatusCode::BAD_REQUEST)).await;
        let mut recorder = Recorder::new(&settings(&format!("http://{addr}"))).expect("recorder");
        let ack = one_write(&mut recorder, job(b"{}")).await;
        assert!(ack.error.is_none(), "4xx must not count toward backoff");
    }

    #[tokio::test]
    async fn server_errors_are_reported() {
        let (addr, _seen) = serve(Some(StatusCode::INTERNAL_SERVER_ERROR)).await;
        let mut recorder = Recorder::new(&settings(&format!("http://{addr}"))).expect("recorder");
        let ack = one_write(&mut recorder, job(b"{}")).await;
        assert!(matches!(ack.error, Some(Error::RemoteFailure(_))));
    }

    #[tokio::test]
    async fn writing_before_ping_fails() {
        let (addr, _seen) = serve(None).await;
        let mut recorder = Recorder::new(&settings(&format!("http://{addr}"))).expect("recorder");

        let shutdown = CancellationToken::new();
        let jobs = recorder.job_sender();
        let mut acks = recorder.take_acks().expect("first take");
        let handle = recorder.start(shutdown.clone());

        jobs.send(job(b"{}")).await.expect("job accepted");
        let ack = acks.recv().await.expect("ack arrives");
        assert_eq!(ack.error, Some(Error::PingNotCalled));

        shutdown.cancel();
        handle.await.expect("writer loop joins");
    }

    #[tokio::test]
    async fn ping_fails_against_a_closed_endpoint() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        drop(listener);

        let mut recorder = Recorder::new(&settings(&format!("http://{addr}"))).expect("recorder");
        assert!(matches!(
            recorder.ping().await,
            Err(Error::EndpointNotAvailable(_))
        ));
    }
}
