//! Settings structs the outer configuration layer feeds into the engine.
//!
//! Parsing a configuration file is someone else's job; these structs are
//! plain `Deserialize` targets plus the conversions the components need.
//! Durations are carried in milliseconds so test setups can run on tight
//! intervals while production configs stay readable.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

fn default_interval_ms() -> u64 {
    2_000
}

fn default_timeout_ms() -> u64 {
    5_000
}

/// Descriptor for one reader, as provided by configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ReaderSettings {
    /// Unique reader name within the engine.
    pub name: String,
    /// Type name documents from this reader are indexed under.
    pub type_name: String,
    /// Endpoint publishing the JSON metrics.
    pub endpoint: String,
    /// Milliseconds between scrapes.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Milliseconds before an in-flight request is abandoned.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Consecutive failures tolerated before the reader is retired.
    /// Zero selects the default.
    #[serde(default)]
    pub backoff_limit: u32,
    /// Key to conversion-rule names for this reader's payloads
    /// (`bytes`, `kilobytes`, `megabytes`, `gc-list`, `string`, `float`).
    #[serde(default)]
    pub conversions: HashMap<String, String>,
}

impl ReaderSettings {
    /// Tick interval between scrapes.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Deadline applied to each scrape request.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Descriptor for the recorder, as provided by configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RecorderSettings {
    /// Recorder name, used in logs and as the index-name fallback.
    pub name: String,
    /// Indexing sink endpoint.
    pub endpoint: String,
    /// Index documents are written into. Empty means "use the name".
    #[serde(default)]
    pub index_name: String,
    /// Milliseconds before an in-flight write is abandoned.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Consecutive failures tolerated before the engine gives up on the
    /// sink. Zero selects the default.
    #[serde(default)]
    pub backoff_limit: u32,
}

impl RecorderSettings {
    /// Deadline applied to each write.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn reader_settings_fill_in_defaults() {
        let settings: ReaderSettings = serde_json::from_str(
            r#"{"name":"app","type_name":"expvar","endpoint":"http://localhost/debug/vars"}"#,
        )
        .expect("settings parse");
        assert_eq!(settings.interval(), Duration::from_secs(2));
        assert_eq!(settings.timeout(), Duration::from_secs(5));
        assert_eq!(settings.backoff_limit, 0);
        assert!(settings.conversions.is_empty());
    }

    #[test]
    fn reader_settings_accept_conversion_rules() {
        let settings: ReaderSettings = serde_json::from_str(
            r#"{
                "name": "app",
                "type_name": "expvar",
                "endpoint": "http://localhost/debug/vars",
                "conversions": {"Alloc": "bytes", "PauseNs": "gc-list"}
            }"#,
        )
        .expect("settings parse");
        assert_eq!(settings.conversions.len(), 2);
    }

    #[test]
    fn recorder_index_name_defaults_to_empty() {
        let settings: RecorderSettings =
            serde_json::from_str(r#"{"name":"sink","endpoint":"http://localhost:9200"}"#)
                .expect("settings parse");
        assert_eq!(settings.index_name, "");
        assert_eq!(settings.timeout(), Duration::from_secs(5));
    }
}
