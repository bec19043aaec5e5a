//! Pipeline supervisor owning the readers and the recorder.
//!
//! The engine drives each reader on its own interval, fans the results in
//! over a single multiplexer, pushes normalized documents at the recorder,
//! and owns every backoff counter. It stops, in an orderly fashion, when
//! its root token is cancelled, when the recorder is declared dead, or
//! when the last reader has been retired.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{StreamExt, StreamMap};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::config::{ReaderSettings, RecorderSettings};
use crate::datatype::{self, Mapper};
use crate::reader::{self, DataReader, ReadRequest, ReadResult};
use crate::recorder::{self, DataRecorder, RecordAck, RecordJob};
use crate::stats;
use crate::token::JobId;

/// Errors that abort engine construction.
#[derive(Debug, Error)]
pub enum Error {
    /// The reader set was empty.
    #[error("at least one reader is required")]
    NoReader,
    /// Two readers share a name.
    #[error("duplicate reader name: {0}")]
    DuplicateReaderName(String),
    /// The recorder, or every reader, failed its ping.
    #[error("pinging {endpoint}: {reason}")]
    Ping {
        /// The unreachable endpoint.
        endpoint: String,
        /// What the ping reported.
        reason: String,
    },
    /// A reader could not be built from its settings.
    #[error(transparent)]
    Reader(#[from] reader::Error),
    /// The recorder could not be built from its settings.
    #[error(transparent)]
    Recorder(#[from] recorder::Error),
}

/// The pipeline supervisor. Construct with [`Engine::new`] or
/// [`Engine::from_config`], then call [`Engine::start`].
pub struct Engine {
    shutdown: CancellationToken,
    recorder: Box<dyn DataRecorder>,
    readers: Vec<Box<dyn DataReader>>,
}

impl Engine {
    /// Validates the pipeline and pings every participant.
    ///
    /// The recorder must answer its ping. Readers that fail theirs are
    /// dropped with a warning; only when every reader is unreachable does
    /// construction fail. Partial observability beats none.
    pub async fn new(
        shutdown: CancellationToken,
        mut recorder: Box<dyn DataRecorder>,
        readers: Vec<Box<dyn DataReader>>,
    ) -> Result<Self, Error> {
        if readers.is_empty() {
            return Err(Error::NoReader);
        }
        let mut names = HashSet::new();
        for reader in &readers {
            if !names.insert(reader.name().to_string()) {
                return Err(Error::DuplicateReaderName(reader.name().to_string()));
            }
        }

        recorder.ping().await.map_err(|err| Error::Ping {
            endpoint: recorder.endpoint().to_string(),
            reason: err.to_string(),
        })?;

        let pings = readers.into_iter().map(|mut reader| async move {
            let outcome = reader.ping().await;
            (reader, outcome)
        });
        let mut survivors: Vec<Box<dyn DataReader>> = Vec::new();
        let mut last_failure: Option<(String, String)> = None;
        for (reader, outcome) in join_all(pings).await {
            match outcome {
                Ok(()) => survivors.push(reader),
                Err(err) => {
                    warn!(
                        reader = reader.name(),
                        endpoint = reader.endpoint(),
                        error = %err,
                        "dropping reader that failed its ping"
                    );
                    last_failure = Some((reader.endpoint().to_string(), err.to_string()));
                }
            }
        }
        if survivors.is_empty() {
            let (endpoint, reason) = last_failure.unwrap_or_default();
            return Err(Error::Ping { endpoint, reason });
        }

        Ok(Self {
            shutdown,
            recorder,
            readers: survivors,
        })
    }

    /// Builds the HTTP pipeline described by the settings and delegates to
    /// [`Engine::new`].
    pub async fn from_config(
        shutdown: CancellationToken,
        recorder_settings: &RecorderSettings,
        reader_settings: &[ReaderSettings],
    ) -> Result<Self, Error> {
        let recorder = recorder::elasticsearch::Recorder::new(recorder_settings)?;
        let mut readers: Vec<Box<dyn DataReader>> = Vec::with_capacity(reader_settings.len());
        for settings in reader_settings {
            let mapper = Mapper::from_rules(&settings.conversions);
            readers.push(Box::new(reader::expvar::Reader::new(settings, mapper)?));
        }
        Self::new(shutdown, Box::new(recorder), readers).await
    }

    /// Runs the pipeline until a fatal condition stops it.
    ///
    /// Supervised termination (recorder death, every reader retired) is
    /// logged, not returned; cancellation of the root token is the normal
    /// shutdown path. By the time this resolves every owned task has
    /// acknowledged shutdown, so no further result or job is emitted.
    pub async fn start(mut self) {
        let root = self.shutdown.clone();
        let mut results: StreamMap<String, ReceiverStream<ReadResult>> = StreamMap::new();
        let mut units: HashMap<String, ReaderUnit> = HashMap::new();
        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        for mut reader in std::mem::take(&mut self.readers) {
            let name = reader.name().to_string();
            let Some(receiver) = reader.take_results() else {
                warn!(reader = %name, "reader was already started, skipping it");
                continue;
            };
            let cancel = root.child_token();
            handles.push(reader.start(cancel.clone()));
            handles.push(spawn_ticker(
                name.clone(),
                reader.interval(),
                reader.job_sender(),
                cancel.clone(),
            ));
            results.insert(name.clone(), ReceiverStream::new(receiver));
            units.insert(
                name,
                ReaderUnit {
                    backoff: Backoff::new(reader.backoff_limit()),
                    cancel,
                },
            );
            stats::reader_started();
        }

        let index_name = self.recorder.index_name().to_string();
        let record_jobs = self.recorder.job_sender();
        let Some(mut acks) = self.recorder.take_acks() else {
            warn!("recorder was already started; engine cannot run");
            shut_down(root, units, handles, None).await;
            return;
        };
        let recorder_handle = self.recorder.start(root.child_token());
        stats::recorder_started();
        let mut recorder_backoff = Backoff::new(self.recorder.backoff_limit());

        info!(readers = results.len(), "engine running");
        loop {
            if results.is_empty() {
                info!("no active readers remain, stopping");
                break;
            }
            tokio::select! {
                _ = root.cancelled() => {
                    info!("shutdown requested");
                    break;
                }
                maybe = results.next() => {
                    let Some((name, result)) = maybe else { continue };
                    match result.outcome {
                        Ok(content) => {
                            if let Some(unit) = units.get_mut(&name) {
                                unit.backoff.success();
                            }
                            let container = datatype::decode(&result.mapper, &content);
                            if let Some(err) = container.error() {
                                warn!(
                                    reader = %name,
                                    id = %result.id,
                                    error = %err,
                                    "payload not fully decoded"
                                );
                            }
                            if container.is_empty() && container.error().is_some() {
                                // Nothing decodable to index.
                                continue;
                            }
                            let job = RecordJob {
                                id: result.id,
                                time: result.time,
                                index_name: index_name.clone(),
                                type_name: result.type_name.clone(),
                                payload: Bytes::from(container.bytes()),
                            };
                            match record_jobs.try_send(job) {
                                Ok(()) => {}
                                Err(mpsc::error::TrySendError::Full(job)) => {
                                    warn!(id = %job.id, "recorder queue full, dropping job");
                                    stats::result_dropped();
                                }
                                Err(mpsc::error::TrySendError::Closed(_)) => {
                                    warn!("recorder queue closed, stopping");
                                    break;
                                }
                            }
                        }
                        Err(reader::Error::BackoffExceeded) => {
                            warn!(reader = %name, "reader reported terminal backoff, removing it");
                            remove_reader(&mut results, &mut units, &name);
                        }
                        Err(err) => {
                            debug!(reader = %name, id = %result.id, error = %err, "read failed");
                            if let Some(unit) = units.get_mut(&name) {
                                if unit.backoff.failure() {
                                    warn!(
                                        reader = %name,
                                        failures = unit.backoff.failures(),
                                        "backoff limit reached, removing reader"
                                    );
                                    remove_reader(&mut results, &mut units, &name);
                                }
                            }
                        }
                    }
                }
                ack = acks.recv() => match ack {
                    None => {
                        warn!("recorder ack channel closed, stopping");
                        break;
                    }
                    Some(RecordAck { error: None, .. }) => recorder_backoff.success(),
                    Some(RecordAck { id, error: Some(recorder::Error::BackoffExceeded) }) => {
                        warn!(%id, "recorder reported terminal backoff, stopping");
                        break;
                    }
                    Some(RecordAck { id, error: Some(err) }) => {
                        warn!(%id, error = %err, "record failed");
                        if recorder_backoff.failure() {
                            warn!(
                                failures = recorder_backoff.failures(),
                                "recorder backoff limit reached, stopping"
                            );
                            break;
                        }
                    }
                },
            }
        }

        shut_down(root, units, handles, Some(recorder_handle)).await;
        info!("engine stopped");
    }
}

struct ReaderUnit {
    backoff: Backoff,
    cancel: CancellationToken,
}

fn remove_reader(
    results: &mut StreamMap<String, ReceiverStream<ReadResult>>,
    units: &mut HashMap<String, ReaderUnit>,
    name: &str,
) {
    results.remove(name);
    if let Some(unit) = units.remove(name) {
        unit.cancel.cancel();
        stats::reader_stopped();
    }
}

async fn shut_down(
    root: CancellationToken,
    units: HashMap<String, ReaderUnit>,
    handles: Vec<JoinHandle<()>>,
    recorder_handle: Option<JoinHandle<()>>,
) {
    root.cancel();
    for _ in units.values() {
        stats::reader_stopped();
    }
    join_all(handles).await;
    if let Some(handle) = recorder_handle {
        let _ = handle.await;
        stats::recorder_stopped();
    }
}

fn spawn_ticker(
    name: String,
    interval: Duration,
    jobs: mpsc::Sender<ReadRequest>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let request = ReadRequest { id: JobId::new() };
                    match jobs.try_send(request) {
                        Ok(()) => {}
                        // A saturated reader skips the tick rather than
                        // stalling the schedule.
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            warn!(reader = %name, "job queue full, skipping tick");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => break,
                    }
                }
            }
        }
        debug!(reader = %name, "ticker finished");
    })
}
