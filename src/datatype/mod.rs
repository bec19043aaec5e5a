//! Typed representation of scraped JSON metrics.
//!
//! Raw payloads arrive as arbitrary JSON trees. This module flattens them
//! into an ordered list of tagged values, applying unit conversions (byte
//! amounts to megabytes or kilobytes, GC pause nanoseconds to microseconds)
//! so documents land in the index in a consistent shape.

mod decode;

pub use decode::decode;

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;

/// One kilobyte in bytes.
pub const KILOBYTE: f64 = 1024.0;
/// One megabyte in bytes.
pub const MEGABYTE: f64 = 1024.0 * KILOBYTE;

/// Errors recorded on a [`DataContainer`] during decoding. Neither is
/// fatal to the pipeline; the affected payload (or leaf) is dropped and
/// everything else continues.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// A leaf value was neither a string, a number, nor a numeric list.
    #[error("unidentified jason value ({0})")]
    UnidentifiedJason(String),
    /// The payload was not a JSON object.
    #[error("payload is not a JSON object: {0}")]
    Payload(String),
}

/// A single key plus typed value produced by [`decode`].
///
/// The set is closed: every shape a scrape can produce is enumerated here.
/// Each variant knows how to emit its `"key":value` JSON fragment and how
/// to compare itself to another value; list variants compare their values
/// as multisets.
#[derive(Debug, Clone, PartialEq)]
pub enum DataType {
    /// Verbatim string value.
    String {
        /// Flattened (dot-joined) key path.
        key: String,
        /// The string as scraped.
        value: String,
    },
    /// Plain numeric value.
    Float {
        /// Flattened key path.
        key: String,
        /// The number as scraped.
        value: f64,
    },
    /// List of numeric values, emitted unchanged.
    FloatList {
        /// Flattened key path.
        key: String,
        /// The numbers as scraped.
        values: Vec<f64>,
    },
    /// GC pause list in nanoseconds; emitted as microseconds, zeros dropped.
    GcList {
        /// Flattened key path.
        key: String,
        /// Pause durations in nanoseconds.
        values: Vec<u64>,
    },
    /// Byte amount; emitted in megabytes.
    Byte {
        /// Flattened key path.
        key: String,
        /// The amount in bytes.
        value: f64,
    },
    /// Byte amount; emitted in kilobytes.
    KiloByte {
        /// Flattened key path.
        key: String,
        /// The amount in bytes.
        value: f64,
    },
    /// Byte amount; emitted in megabytes.
    MegaByte {
        /// Flattened key path.
        key: String,
        /// The amount in bytes.
        value: f64,
    },
}

impl DataType {
    /// The flattened key this value was decoded from.
    pub fn key(&self) -> &str {
        match self {
            Self::String { key, .. }
            | Self::Float { key, .. }
            | Self::FloatList { key, .. }
            | Self::GcList { key, .. }
            | Self::Byte { key, .. }
            | Self::KiloByte { key, .. }
            | Self::MegaByte { key, .. } => key,
        }
    }

    /// Appends this value's `"key":value` JSON fragment to `out`,
    /// applying the variant's unit conversion.
    pub fn write(&self, out: &mut String) {
        match self {
            Self::String { key, value } => {
                push_json_string(out, key);
                out.push(':');
                push_json_string(out, value);
            }
            Self::Float { key, value } => {
                push_json_string(out, key);
                let _ = write!(out, ":{value:.6}");
            }
            Self::FloatList { key, values } => {
                push_json_string(out, key);
                out.push_str(":[");
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    let _ = write!(out, "{v:.6}");
                }
                out.push(']');
            }
            Self::GcList { key, values } => {
                push_json_string(out, key);
                out.push_str(":[");
                let mut first = true;
                for &v in values {
                    if v == 0 {
                        continue;
                    }
                    if !first {
                        out.push(',');
                    }
                    first = false;
                    let _ = write!(out, "{}", v / 1000);
                }
                out.push(']');
            }
            Self::Byte { key, value } | Self::MegaByte { key, value } => {
                push_json_string(out, key);
                let _ = write!(out, ":{:.6}", value / MEGABYTE);
            }
            Self::KiloByte { key, value } => {
                push_json_string(out, key);
                let _ = write!(out, ":{:.6}", value / KILOBYTE);
            }
        }
    }

    /// Compares keys and values. Variants never equal another variant, and
    /// list values are compared as multisets.
    pub fn equal(&self, other: &DataType) -> bool {
        match (self, other) {
            (Self::String { key, value }, Self::String { key: k, value: v }) => {
                key == k && value == v
            }
            (Self::Float { key, value }, Self::Float { key: k, value: v })
            | (Self::Byte { key, value }, Self::Byte { key: k, value: v })
            | (Self::KiloByte { key, value }, Self::KiloByte { key: k, value: v })
            | (Self::MegaByte { key, value }, Self::MegaByte { key: k, value: v }) => {
                key == k && value == v
            }
            (Self::FloatList { key, values }, Self::FloatList { key: k, values: v }) => {
                key == k && multiset_eq(values, v, |a, b| a == b)
            }
            (Self::GcList { key, values }, Self::GcList { key: k, values: v }) => {
                key == k && multiset_eq(values, v, |a, b| a == b)
            }
            _ => false,
        }
    }

    fn kind(&self) -> Kind {
        match self {
            Self::String { .. } => Kind::String,
            Self::Float { .. } => Kind::Float,
            Self::FloatList { .. } => Kind::FloatList,
            Self::GcList { .. } => Kind::GcList,
            Self::Byte { .. } => Kind::Byte,
            Self::KiloByte { .. } => Kind::KiloByte,
            Self::MegaByte { .. } => Kind::MegaByte,
        }
    }
}

fn multiset_eq<T: Copy>(a: &[T], b: &[T], eq: impl Fn(T, T) -> bool) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut remaining: Vec<T> = b.to_vec();
    for &item in a {
        match remaining.iter().position(|&candidate| eq(item, candidate)) {
            Some(idx) => {
                remaining.swap_remove(idx);
            }
            None => return false,
        }
    }
    true
}

fn push_json_string(out: &mut String, input: &str) {
    out.push('"');
    for c in input.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

/// Ordered collection of decoded values plus any error met on the way.
///
/// An empty payload decodes to an empty container with no error. A leaf
/// that cannot be identified sets the error but does not stop its siblings
/// from decoding.
#[derive(Debug, Clone, Default)]
pub struct DataContainer {
    list: Vec<DataType>,
    err: Option<Error>,
}

impl DataContainer {
    /// Appends a decoded value.
    pub fn push(&mut self, value: DataType) {
        self.list.push(value);
    }

    /// Records a decode error, keeping the first one observed.
    pub fn set_error(&mut self, err: Error) {
        if self.err.is_none() {
            self.err = Some(err);
        }
    }

    /// The first error observed during decoding, if any.
    pub fn error(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    /// Number of decoded values.
    pub fn len(&self) -> usize {
        self.list.len()
    }

    /// Whether the container holds no values.
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Iterates the decoded values in payload order.
    pub fn iter(&self) -> impl Iterator<Item = &DataType> {
        self.list.iter()
    }

    /// Serializes the container as a JSON object.
    pub fn bytes(&self) -> Vec<u8> {
        let mut out = String::with_capacity(2 + self.list.len() * 16);
        out.push('{');
        for (i, value) in self.list.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            value.write(&mut out);
        }
        out.push('}');
        out.into_bytes()
    }
}

/// Conversion rule a [`Mapper`] can prescribe for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conversion {
    /// Keep the value as a string.
    String,
    /// Keep the value as a plain number.
    Float,
    /// Treat the value as bytes, emit megabytes.
    Bytes,
    /// Treat the value as bytes, emit kilobytes.
    KiloBytes,
    /// Treat the value as bytes, emit megabytes.
    MegaBytes,
    /// Treat the value as a GC pause list in nanoseconds.
    GcList,
}

impl Conversion {
    /// Parses a rule name as it appears in configuration.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "string" => Some(Self::String),
            "float" => Some(Self::Float),
            "bytes" => Some(Self::Bytes),
            "kilobytes" | "kb" => Some(Self::KiloBytes),
            "megabytes" | "mb" => Some(Self::MegaBytes),
            "gc-list" | "gc_list" => Some(Self::GcList),
            _ => None,
        }
    }
}

const DEFAULT_GC_KEYS: &[&str] = &["pausens", "pauseend"];

#[derive(Debug)]
struct MapperInner {
    rules: HashMap<String, Conversion>,
    gc_keys: Vec<String>,
}

/// Key to conversion-rule lookup shared by every result a reader emits.
///
/// Lookups are case-insensitive and try the full dot-joined path first,
/// then the final path segment. Cloning is cheap; the tables sit behind an
/// `Arc`.
#[derive(Debug, Clone)]
pub struct Mapper {
    inner: Arc<MapperInner>,
}

impl Default for Mapper {
    fn default() -> Self {
        Self::new(HashMap::new())
    }
}

impl Mapper {
    /// Builds a mapper from explicit key rules, with the default GC key
    /// recognition (`PauseNs`, `PauseEnd`).
    pub fn new(rules: HashMap<String, Conversion>) -> Self {
        let rules = rules
            .into_iter()
            .map(|(key, rule)| (key.to_lowercase(), rule))
            .collect();
        Self {
            inner: Arc::new(MapperInner {
                rules,
                gc_keys: DEFAULT_GC_KEYS.iter().map(|k| k.to_string()).collect(),
            }),
        }
    }

    /// Builds a mapper from configuration rule names, skipping entries
    /// whose rule name is not recognized.
    pub fn from_rules(rules: &HashMap<String, String>) -> Self {
        let mut parsed = HashMap::with_capacity(rules.len());
        for (key, name) in rules {
            match Conversion::from_name(name) {
                Some(rule) => {
                    parsed.insert(key.clone(), rule);
                }
                None => {
                    tracing::warn!(key = %key, rule = %name, "unknown conversion rule, ignoring");
                }
            }
        }
        Self::new(parsed)
    }

    /// Looks up the rule for a flattened key.
    pub fn lookup(&self, key: &str) -> Option<Conversion> {
        let lowered = key.to_lowercase();
        if let Some(&rule) = self.inner.rules.get(&lowered) {
            return Some(rule);
        }
        let segment = lowered.rsplit('.').next().unwrap_or(&lowered);
        self.inner.rules.get(segment).copied()
    }

    /// Whether the key names a GC pause list.
    pub fn is_gc_key(&self, key: &str) -> bool {
        let lowered = key.to_lowercase();
        self.inner.gc_keys.iter().any(|gc| lowered.contains(gc))
    }
}

#[derive(Clone, Copy)]
enum Kind {
    String,
    Float,
    FloatList,
    GcList,
    Byte,
    KiloByte,
    MegaByte,
}

static STRING_VALUES: AtomicU64 = AtomicU64::new(0);
static FLOAT_VALUES: AtomicU64 = AtomicU64::new(0);
static FLOAT_LIST_VALUES: AtomicU64 = AtomicU64::new(0);
static GC_LIST_VALUES: AtomicU64 = AtomicU64::new(0);
static BYTE_VALUES: AtomicU64 = AtomicU64::new(0);
static KILOBYTE_VALUES: AtomicU64 = AtomicU64::new(0);
static MEGABYTE_VALUES: AtomicU64 = AtomicU64::new(0);
static UNIDENTIFIED_VALUES: AtomicU64 = AtomicU64::new(0);

pub(crate) fn count_decoded(value: &DataType) {
    let counter = match value.kind() {
        Kind::String => &STRING_VALUES,
        Kind::Float => &FLOAT_VALUES,
        Kind::FloatList => &FLOAT_LIST_VALUES,
        Kind::GcList => &GC_LIST_VALUES,
        Kind::Byte => &BYTE_VALUES,
        Kind::KiloByte => &KILOBYTE_VALUES,
        Kind::MegaByte => &MEGABYTE_VALUES,
    };
    counter.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn count_unidentified() {
    UNIDENTIFIED_VALUES.fetch_add(1, Ordering::Relaxed);
}

/// Process-wide totals of decoded values per kind.
pub fn kind_counts() -> Vec<(&'static str, u64)> {
    vec![
        ("StringValues", STRING_VALUES.load(Ordering::Relaxed)),
        ("FloatValues", FLOAT_VALUES.load(Ordering::Relaxed)),
        ("FloatListValues", FLOAT_LIST_VALUES.load(Ordering::Relaxed)),
        ("GcListValues", GC_LIST_VALUES.load(Ordering::Relaxed)),
        ("ByteValues", BYTE_VALUES.load(Ordering::Relaxed)),
        ("KiloByteValues", KILOBYTE_VALUES.load(Ordering::Relaxed)),
        ("MegaByteValues", MEGABYTE_VALUES.load(Ordering::Relaxed)),
        (
            "UnidentifiedValues",
            UNIDENTIFIED_VALUES.load(Ordering::Relaxed),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn rendered(value: &DataType) -> String {
        let mut out = String::new();
        value.write(&mut out);
        out
    }

    #[test]
    fn float_uses_six_decimals() {
        let value = DataType::Float {
            key: "Sys".to_string(),
            value: 6.5,
        };
        assert_eq!(rendered(&value), r#""Sys":6.500000"#);
    }

    #[test]
    fn byte_variants_convert_units() {
        let byte = DataType::Byte {
            key: "Alloc".to_string(),
            value: 5.0 * MEGABYTE,
        };
        assert_eq!(rendered(&byte), r#""Alloc":5.000000"#);

        let kilo = DataType::KiloByte {
            key: "Stack".to_string(),
            value: 2048.0,
        };
        assert_eq!(rendered(&kilo), r#""Stack":2.000000"#);

        let mega = DataType::MegaByte {
            key: "Heap".to_string(),
            value: MEGABYTE,
        };
        assert_eq!(rendered(&mega), r#""Heap":1.000000"#);
    }

    #[test]
    fn gc_list_drops_zeros_and_scales_to_micros() {
        let value = DataType::GcList {
            key: "PauseNs".to_string(),
            values: vec![1000, 0, 2000, 0],
        };
        assert_eq!(rendered(&value), r#""PauseNs":[1,2]"#);
    }

    #[test]
    fn float_list_keeps_every_element() {
        let value = DataType::FloatList {
            key: "samples".to_string(),
            values: vec![1.0, 0.0],
        };
        assert_eq!(rendered(&value), r#""samples":[1.000000,0.000000]"#);
    }

    #[test]
    fn string_values_are_escaped() {
        let value = DataType::String {
            key: "version".to_string(),
            value: "go\"1.7\"".to_string(),
        };
        assert_eq!(rendered(&value), r#""version":"go\"1.7\"""#);
    }

    #[test]
    fn lists_compare_as_multisets() {
        let a = DataType::FloatList {
            key: "k".to_string(),
            values: vec![1.0, 2.0, 2.0],
        };
        let b = DataType::FloatList {
            key: "k".to_string(),
            values: vec![2.0, 1.0, 2.0],
        };
        let c = DataType::FloatList {
            key: "k".to_string(),
            values: vec![1.0, 1.0, 2.0],
        };
        assert!(a.equal(&b));
        assert!(!a.equal(&c));
    }

    #[test]
    fn different_variants_never_compare_equal() {
        let float = DataType::Float {
            key: "k".to_string(),
            value: 1024.0,
        };
        let byte = DataType::Byte {
            key: "k".to_string(),
            value: 1024.0,
        };
        assert!(!float.equal(&byte));
    }

    #[test]
    fn empty_container_serializes_to_empty_object() {
        let container = DataContainer::default();
        assert_eq!(container.bytes(), b"{}");
        assert!(container.error().is_none());
    }

    #[test]
    fn container_keeps_first_error() {
        let mut container = DataContainer::default();
        container.set_error(Error::UnidentifiedJason("a".to_string()));
        container.set_error(Error::UnidentifiedJason("b".to_string()));
        assert_eq!(
            container.error(),
            Some(&Error::UnidentifiedJason("a".to_string()))
        );
    }

    #[test]
    fn mapper_lookup_matches_full_path_then_segment() {
        let mut rules = HashMap::new();
        rules.insert("memstats.Alloc".to_string(), Conversion::Bytes);
        rules.insert("TotalAlloc".to_string(), Conversion::MegaBytes);
        let mapper = Mapper::new(rules);

        assert_eq!(mapper.lookup("memstats.alloc"), Some(Conversion::Bytes));
        assert_eq!(
            mapper.lookup("memstats.TotalAlloc"),
            Some(Conversion::MegaBytes)
        );
        assert_eq!(mapper.lookup("unrelated"), None);
    }

    #[test]
    fn mapper_recognizes_gc_keys() {
        let mapper = Mapper::default();
        assert!(mapper.is_gc_key("memstats.PauseNs"));
        assert!(mapper.is_gc_key("pauseend"));
        assert!(!mapper.is_gc_key("Alloc"));
    }

    #[test]
    fn from_rules_skips_unknown_names() {
        let mut rules = HashMap::new();
        rules.insert("Alloc".to_string(), "bytes".to_string());
        rules.insert("Bogus".to_string(), "no-such-rule".to_string());
        let mapper = Mapper::from_rules(&rules);
        assert_eq!(mapper.lookup("Alloc"), Some(Conversion::Bytes));
        assert_eq!(mapper.lookup("Bogus"), None);
    }
}
