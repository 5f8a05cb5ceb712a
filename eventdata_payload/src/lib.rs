//! The eventdata payloads
//!
//! This library synthesizes nginx access-log documents and wraps them into
//! bulk indexing requests for search engine load tests. Nothing in here talks
//! to the network: callers receive serialized documents, index names and bulk
//! bodies and are responsible for shipping them.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::module_name_repetitions)]

use std::{num::NonZeroUsize, sync::Arc};

pub mod bulk;
pub mod common;
pub mod fields;
pub mod id;
pub mod interval_query;
pub mod lookup;
pub mod random_event;
pub mod sample;
pub mod timestamp;
pub mod weighted;

pub use bulk::{BulkBatcher, BulkRequest};
pub use random_event::RandomEvent;
pub use sample::SampleSource;
pub use timestamp::{TimestampClock, TimestampStruct};
pub use weighted::{WeightedSampler, WeightedTable};

/// Errors produced while constructing or running an event source
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// See [`timestamp::TimeParsingError`]
    #[error(transparent)]
    TimeParsing(#[from] timestamp::TimeParsingError),
    /// See [`timestamp::Error`]
    #[error(transparent)]
    Timestamp(#[from] timestamp::Error),
    /// See [`common::size::Error`]
    #[error(transparent)]
    Size(#[from] common::size::Error),
    /// See [`weighted::Error`]
    #[error(transparent)]
    Weighted(#[from] weighted::Error),
    /// See [`lookup::Error`]
    #[error(transparent)]
    Lookup(#[from] lookup::Error),
    /// See [`id::Error`]
    #[error(transparent)]
    Id(#[from] id::Error),
    /// See [`interval_query::Error`]
    #[error(transparent)]
    IntervalQuery(#[from] interval_query::Error),
    /// Json payload could not be encoded
    #[error("Json payload could not be encoded: {0}")]
    Json(#[from] serde_json::Error),
    /// A parameter was malformed or out of range
    #[error("Invalid configuration: {0}")]
    Configuration(String),
}

/// A single document as it leaves an [`EventSource`]
#[derive(Debug, Clone, PartialEq)]
pub enum Document {
    /// A document that has already been serialized to a json string
    Json(String),
    /// A structured json object, serialized by the caller
    Object(serde_json::Map<String, serde_json::Value>),
}

impl Document {
    /// Render this document as a single-line json string.
    ///
    /// # Errors
    ///
    /// Returns an error if a structured document cannot be serialized.
    pub fn to_json_string(&self) -> Result<String, Error> {
        match self {
            Document::Json(s) => Ok(s.clone()),
            Document::Object(m) => Ok(serde_json::to_string(m)?),
        }
    }

    /// Convert this document into a structured json value.
    ///
    /// # Errors
    ///
    /// Returns an error if a pre-serialized document is not valid json.
    pub fn into_value(self) -> Result<serde_json::Value, Error> {
        match self {
            Document::Json(s) => Ok(serde_json::from_str(&s)?),
            Document::Object(m) => Ok(serde_json::Value::Object(m)),
        }
    }
}

/// One generated document plus its routing metadata
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// The document body
    pub document: Document,
    /// The resolved index name the document belongs in
    pub index: Arc<str>,
    /// The document type tag
    pub doc_type: Arc<str>,
}

/// A source of synthetic events, driven by [`BulkBatcher`].
///
/// `generate_event` returns `Ok(None)` once the source is exhausted. That is
/// a terminal, graceful condition: every later call returns `Ok(None)` too.
pub trait EventSource {
    /// Called once before each batch of `bulk_size` documents is generated.
    ///
    /// # Errors
    ///
    /// Implementations may fail if the timestamp for the batch cannot be
    /// computed.
    fn start_bulk(&mut self, bulk_size: NonZeroUsize) -> Result<(), Error>;

    /// Produce the next event, or `None` when the source is exhausted.
    ///
    /// # Errors
    ///
    /// Errors are reserved for serialization crackups, never exhaustion.
    fn generate_event(&mut self) -> Result<Option<Event>, Error>;

    /// Progress through a bounded source in `[0, 1]`, or `None` if the source
    /// is unbounded.
    fn percent_completed(&self) -> Option<f64> {
        None
    }
}
