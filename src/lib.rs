#![warn(missing_docs)]
//! Core library entry points for the varspipe metrics pipeline.
//!
//! varspipe scrapes JSON metric endpoints (typically Go-style `/debug/vars`
//! output) on per-reader intervals, normalizes the payloads into tagged
//! typed values, and indexes the documents into an HTTP sink. The
//! [`engine::Engine`] owns the whole pipeline; [`reader`] and [`recorder`]
//! hold the endpoint implementations plus channel-compatible mocks for
//! tests.

pub mod backoff;
pub mod config;
pub mod datatype;
pub mod engine;
pub mod reader;
pub mod recorder;
pub mod stats;
pub mod token;
pub mod urls;

pub use backoff::Backoff;
pub use config::{ReaderSettings, RecorderSettings};
pub use datatype::{DataContainer, DataType, Mapper};
pub use engine::Engine;
pub use reader::{DataReader, ReadRequest, ReadResult};
pub use recorder::{DataRecorder, RecordAck, RecordJob};
pub use token::JobId;
pub use urls::sanitise_url;
