//! Process-wide counters describing what the pipeline has been doing.
//!
//! The counters are plain atomics: cheap to bump from any task and read
//! without coordination. [`snapshot`] renders them as a flat JSON object so
//! the self reader can scrape this process through the same normalization
//! path as any external endpoint.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{json, Value};

use crate::datatype;

static READERS_RUNNING: AtomicU64 = AtomicU64::new(0);
static RECORDERS_RUNNING: AtomicU64 = AtomicU64::new(0);
static SCRAPE_READS: AtomicU64 = AtomicU64::new(0);
static READ_ERRORS: AtomicU64 = AtomicU64::new(0);
static RECORD_JOBS: AtomicU64 = AtomicU64::new(0);
static RECORD_ERRORS: AtomicU64 = AtomicU64::new(0);
static DROPPED_RESULTS: AtomicU64 = AtomicU64::new(0);

/// Marks one reader as running.
pub fn reader_started() {
    READERS_RUNNING.fetch_add(1, Ordering::Relaxed);
}

/// Marks one reader as stopped.
pub fn reader_stopped() {
    READERS_RUNNING.fetch_sub(1, Ordering::Relaxed);
}

/// Marks the recorder as running.
pub fn recorder_started() {
    RECORDERS_RUNNING.fetch_add(1, Ordering::Relaxed);
}

/// Marks the recorder as stopped.
pub fn recorder_stopped() {
    RECORDERS_RUNNING.fetch_sub(1, Ordering::Relaxed);
}

/// Counts one completed scrape.
pub fn read_succeeded() {
    SCRAPE_READS.fetch_add(1, Ordering::Relaxed);
}

/// Counts one failed scrape.
pub fn read_failed() {
    READ_ERRORS.fetch_add(1, Ordering::Relaxed);
}

/// Counts one document accepted by the sink.
pub fn job_recorded() {
    RECORD_JOBS.fetch_add(1, Ordering::Relaxed);
}

/// Counts one failed sink write.
pub fn record_failed() {
    RECORD_ERRORS.fetch_add(1, Ordering::Relaxed);
}

/// Counts one result or job dropped on a full channel.
pub fn result_dropped() {
    DROPPED_RESULTS.fetch_add(1, Ordering::Relaxed);
}

/// Renders every counter, including the per-kind datatype counts, as a
/// flat JSON object of numbers.
pub fn snapshot() -> Value {
    let mut doc = json!({
        "Readers": READERS_RUNNING.load(Ordering::Relaxed),
        "Recorders": RECORDERS_RUNNING.load(Ordering::Relaxed),
        "ScrapeReads": SCRAPE_READS.load(Ordering::Relaxed),
        "ReadErrors": READ_ERRORS.load(Ordering::Relaxed),
        "RecordJobs": RECORD_JOBS.load(Ordering::Relaxed),
        "RecordErrors": RECORD_ERRORS.load(Ordering::Relaxed),
        "DroppedResults": DROPPED_RESULTS.load(Ordering::Relaxed),
    });
    if let Some(map) = doc.as_object_mut() {
        for (kind, count) in datatype::kind_counts() {
            map.insert(kind.to_string(), Value::from(count));
        }
    }
    doc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_is_a_flat_numeric_object() {
        read_succeeded();
        job_recorded();
        let doc = snapshot();
        let map = doc.as_object().expect("snapshot is an object");
        assert!(map.contains_key("ScrapeReads"));
        assert!(map.contains_key("RecordJobs"));
        assert!(map.values().all(Value::is_number));
    }
}
