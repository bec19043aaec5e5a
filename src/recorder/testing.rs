//! Ack-compatible mock recorder for driving the engine without a sink.
//!
//! The record behavior is a caller-supplied closure; tests inspect the
//! jobs it captures and inject failures, including the terminal backoff
//! signal. Ping still goes over the network so construction-time health
//! checks behave like the real recorder's.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{DataRecorder, Descriptor, Error, RecordAck, RecordJob, CHANNEL_CAPACITY};
use crate::config::RecorderSettings;
use crate::reader;

/// Behavior invoked for every job the mock receives.
pub type RecordFn = dyn Fn(&RecordJob) -> Result<(), Error> + Send + Sync;

/// Mock recorder with pluggable record behavior.
pub struct Recorder {
    descriptor: Descriptor,
    client: reqwest::Client,
    pinged: reader::Pinged,
    record_fn: Arc<RecordFn>,
    job_tx: mpsc::Sender<RecordJob>,
    job_rx: Option<mpsc::Receiver<RecordJob>>,
    ack_tx: mpsc::Sender<RecordAck>,
    ack_rx: Option<mpsc::Receiver<RecordAck>>,
}

impl Recorder {
    /// Builds a mock recorder. Validation matches the HTTP recorder so
    /// construction-error tests exercise the same paths.
    pub fn new(settings: &RecorderSettings) -> Result<Self, Error> {
        let descriptor = Descriptor::from_settings(settings)?;
        let (job_tx, job_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (ack_tx, ack_rx) = mpsc::channel(CHANNEL_CAPACITY);
        Ok(Self {
            descriptor,
            client: reqwest::Client::new(),
            pinged: reader::Pinged::default(),
            record_fn: Arc::new(|_| Ok(())),
            job_tx,
            job_rx: Some(job_rx),
            ack_tx,
            ack_rx: Some(ack_rx),
        })
    }

    /// Replaces the record behavior.
    pub fn set_record_fn<F>(&mut self, record_fn: F)
    where
        F: Fn(&RecordJob) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.record_fn = Arc::new(record_fn);
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
        .map_err(|err| Error::EndpointNotAvailable(err.to_string()))?;
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
        let record_fn = Arc::clone(&self.record_fn);
        let acks = self.ack_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    job = jobs.recv() => match job {
                        Some(job) => {
                            let error = (record_fn)(&job).err();
                            let _ = acks.try_send(RecordAck { id: job.id, error });
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
    use bytes::Bytes;
    use std::net::SocketAddr;
    use std::sync::Mutex;
    use std::time::SystemTime;
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

    fn settings(endpoint: &str) -> RecorderSettings {
        RecorderSettings {
            name: "mock_sink".to_string(),
            endpoint: endpoint.to_string(),
            index_name: "index".to_string(),
            timeout_ms: 1_000,
            backoff_limit: 5,
        }
    }

    #[tokio::test]
    async fn captured_jobs_are_acked() {
        let addr = serve_empty().await;
        let mut recorder = Recorder::new(&settings(&format!("http://{addr}"))).expect("recorder");
        let captured = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&captured);
        recorder.set_record_fn(move |job| {
            sink.lock().expect("captured lock").push(job.clone());
            Ok(())
        });
        recorder.ping().await.expect("ping");

        let shutdown = CancellationToken::new();
        let jobs = recorder.job_sender();
        let mut acks = recorder.take_acks().expect("first take");
        let handle = recorder.start(shutdown.clone());

        let id = JobId::new();
        jobs.send(RecordJob {
            id,
            time: SystemTime::now(),
            index_name: "index".to_string(),
            type_name: "t".to_string(),
            payload: Bytes::from_static(b"{}"),
        })
        .await
        .expect("job accepted");

        let ack = acks.recv().await.expect("ack arrives");
        assert_eq!(ack.id, id);
        assert!(ack.error.is_none());
        assert_eq!(captured.lock().expect("captured lock").len(), 1);

        shutdown.cancel();
        handle.await.expect("writer loop joins");
    }

    #[tokio::test]
    async fn injected_errors_reach_the_ack_channel() {
        let addr = serve_empty().await;
        let mut recorder = Recorder::new(&settings(&format!("http://{addr}"))).expect("recorder");
        recorder.set_record_fn(|_| Err(Error::BackoffExceeded));
        recorder.ping().await.expect("ping");

        let shutdown = CancellationToken::new();
        let jobs = recorder.job_sender();
        let mut acks = recorder.take_acks().expect("first take");
        let handle = recorder.start(shutdown.clone());

        jobs.send(RecordJob {
            id: JobId::new(),
            time: SystemTime::now(),
            index_name: "index".to_string(),
            type_name: "t".to_string(),
            payload: Bytes::from_static(b"{}"),
        })
        .await
        .expect("job accepted");

        let ack = acks.recv().await.expect("ack arrives");
        assert_eq!(ack.error, Some(Error::BackoffExceeded));

        shutdown.cancel();
        handle.await.expect("writer loop joins");
    }
}
