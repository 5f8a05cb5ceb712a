//! Bulk indexing requests.
//!
//! A [`BulkBatcher`] drives an [`EventSource`] for one batch at a time,
//! pairing every document with an action/metadata entry. A source that runs
//! dry part way through a batch yields a short batch. Only a batch that would
//! hold no document at all is reported as exhaustion.

use std::num::NonZeroUsize;

use rand::{SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::{
    Error, EventSource,
    id::{self, IdStrategy, IdType},
};

fn default_bulk_size() -> NonZeroUsize {
    NonZeroUsize::new(1_000).expect("1000 is non-zero")
}

/// Shape of a bulk body
#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BodyFormat {
    /// Newline separated json, ready for the wire
    #[default]
    Lines,
    /// A json array alternating action/metadata entries and documents
    Array,
}

/// Configuration of [`BulkBatcher`]
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Documents per bulk request
    #[serde(rename = "bulk-size", default = "default_bulk_size")]
    pub bulk_size: NonZeroUsize,
    /// Document id strategy
    #[serde(default)]
    pub id_type: IdType,
    /// See [`id::Options::seq_probability`]
    #[serde(default)]
    pub id_seq_probability: f64,
    /// See [`id::Options::seq_low_id_bias`]
    #[serde(default)]
    pub id_seq_low_id_bias: bool,
    /// See [`id::Options::delay_probability`]
    #[serde(default)]
    pub id_delay_probability: f64,
    /// See [`id::Options::delay_secs`]
    #[serde(default)]
    pub id_delay_secs: u64,
    /// Ingest pipeline echoed into every request
    #[serde(default)]
    pub pipeline: Option<String>,
    /// Shape of the request body
    #[serde(default)]
    pub body_format: BodyFormat,
    /// Add the document type to every action entry
    #[serde(default)]
    pub include_type: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bulk_size: default_bulk_size(),
            id_type: IdType::default(),
            id_seq_probability: 0.0,
            id_seq_low_id_bias: false,
            id_delay_probability: 0.0,
            id_delay_secs: 0,
            pipeline: None,
            body_format: BodyFormat::default(),
            include_type: false,
        }
    }
}

impl Config {
    fn id_options(&self) -> id::Options {
        id::Options {
            seq_probability: self.id_seq_probability,
            seq_low_id_bias: self.id_seq_low_id_bias,
            delay_probability: self.id_delay_probability,
            delay_secs: self.id_delay_secs,
        }
    }
}

/// Body of a [`BulkRequest`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Body {
    /// See [`BodyFormat::Lines`]
    Lines(String),
    /// See [`BodyFormat::Array`]
    Array(Vec<Value>),
}

impl Body {
    /// Number of action/metadata entries plus documents.
    #[must_use]
    pub fn entries(&self) -> usize {
        match self {
            Body::Lines(s) => s.lines().count(),
            Body::Array(v) => v.len(),
        }
    }
}

/// One bulk indexing request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkRequest {
    /// Action/metadata entries interleaved with documents
    pub body: Body,
    /// Always true, the body carries its own action entries
    #[serde(rename = "action-metadata-present")]
    pub action_metadata_present: bool,
    /// Number of documents in `body`
    #[serde(rename = "bulk-size")]
    pub bulk_size: usize,
    /// Unit of `bulk_size`
    pub unit: &'static str,
    /// Ingest pipeline, if configured
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<String>,
}

#[derive(Serialize)]
struct Action<'a> {
    index: Metadata<'a>,
}

#[derive(Serialize)]
struct Metadata<'a> {
    #[serde(rename = "_index")]
    index: &'a str,
    #[serde(rename = "_type", skip_serializing_if = "Option::is_none")]
    doc_type: Option<&'a str>,
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    id: Option<&'a str>,
}

/// Builds [`BulkRequest`]s from an [`EventSource`].
#[derive(Debug)]
pub struct BulkBatcher<S> {
    source: S,
    config: Config,
    ids: IdStrategy,
    rng: StdRng,
}

impl<S> BulkBatcher<S>
where
    S: EventSource,
{
    /// Create a batcher for partition `client_id`. `rng` drives the id
    /// strategy.
    ///
    /// # Errors
    ///
    /// Returns an error if an id probability is outside `[0, 1]`.
    pub fn new(source: S, config: Config, client_id: usize, rng: StdRng) -> Result<Self, Error> {
        let ids = IdStrategy::new(config.id_type, client_id, config.id_options())?;
        info!(
            bulk_size = config.bulk_size.get(),
            id_type = ?config.id_type,
            client_id,
            "bulk batcher ready"
        );
        Ok(Self {
            source,
            config,
            ids,
            rng,
        })
    }

    /// Create a batcher whose id strategy is seeded from `seed`.
    ///
    /// # Errors
    ///
    /// See [`BulkBatcher::new`].
    pub fn with_seed(source: S, config: Config, client_id: usize, seed: u64) -> Result<Self, Error> {
        Self::new(source, config, client_id, StdRng::seed_from_u64(seed))
    }

    /// Build the next bulk request, `None` once the source is exhausted.
    ///
    /// # Errors
    ///
    /// Returns an error if the source fails or a document cannot be
    /// serialized.
    pub fn params(&mut self) -> Result<Option<BulkRequest>, Error> {
        let bulk_size = self.config.bulk_size;
        self.source.start_bulk(bulk_size)?;
        let epoch_secs = OffsetDateTime::now_utc().unix_timestamp();

        let mut lines = String::new();
        let mut array = Vec::new();
        let mut docs = 0;
        for _ in 0..bulk_size.get() {
            let Some(event) = self.source.generate_event()? else {
                if docs == 0 {
                    debug!("source exhausted");
                    return Ok(None);
                }
                debug!(docs, "source exhausted, returning partial bulk");
                break;
            };

            let id = self.ids.next_id(&mut self.rng, epoch_secs);
            let action = Action {
                index: Metadata {
                    index: &event.index,
                    doc_type: self.config.include_type.then_some(&*event.doc_type),
                    id: id.as_deref(),
                },
            };
            match self.config.body_format {
                BodyFormat::Lines => {
                    if docs > 0 {
                        lines.push('\n');
                    }
                    lines.push_str(&serde_json::to_string(&action)?);
                    lines.push('\n');
                    lines.push_str(&event.document.to_json_string()?);
                }
                BodyFormat::Array => {
                    array.push(serde_json::to_value(&action)?);
                    array.push(event.document.into_value()?);
                }
            }
            docs += 1;
        }

        let body = match self.config.body_format {
            BodyFormat::Lines => Body::Lines(lines),
            BodyFormat::Array => Body::Array(array),
        };
        Ok(Some(BulkRequest {
            body,
            action_metadata_present: true,
            bulk_size: docs,
            unit: "docs",
            pipeline: self.config.pipeline.clone(),
        }))
    }

    /// Progress of the underlying source, see
    /// [`EventSource::percent_completed`].
    #[must_use]
    pub fn percent_completed(&self) -> Option<f64> {
        self.source.percent_completed()
    }

    /// The underlying source
    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }
}
