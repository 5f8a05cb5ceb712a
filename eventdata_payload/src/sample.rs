//! Events replayed from sample files.
//!
//! A [`SampleSource`] cycles through records loaded from json or json-lines
//! files, optionally stamping configured top-level fields with a generated
//! timestamp. A record's own `_index` and `_type` keys route it and are
//! stripped from the document.

use std::{num::NonZeroUsize, sync::Arc};

use rand::{SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::{
    Document, Error, Event, EventSource,
    common::template::IndexTemplate,
    lookup,
    timestamp::{RealClock, TimestampClock, WallClock},
};

const DEFAULT_INDEX: &str = "logs";
const DEFAULT_TYPE: &str = "logs";

/// A single value or a list of values
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum OneOrMany {
    /// A single value
    One(String),
    /// A list of values
    Many(Vec<String>),
}

impl Default for OneOrMany {
    fn default() -> Self {
        OneOrMany::Many(Vec::new())
    }
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        }
    }
}

fn default_starting_point() -> String {
    "now".to_string()
}

fn default_acceleration_factor() -> f64 {
    1.0
}

fn default_wrap() -> bool {
    true
}

/// Configuration of [`SampleSource`]
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Sample files, environment variables are expanded
    pub sample_file: OneOrMany,
    /// Top-level fields replaced by the event timestamp when present
    #[serde(default)]
    pub timestamp_field: OneOrMany,
    /// Index for records without `_index`, with `{{yyyy}}` style
    /// placeholders. Defaults to `logs`.
    #[serde(default)]
    pub index: Option<String>,
    /// Type for records without `_type`. Defaults to `logs`.
    #[serde(default, rename = "type")]
    pub doc_type: Option<String>,
    /// See [`crate::random_event::Config::starting_point`]
    #[serde(default = "default_starting_point")]
    pub starting_point: String,
    /// See [`crate::random_event::Config::end_point`]
    #[serde(default)]
    pub end_point: Option<String>,
    /// See [`crate::random_event::Config::acceleration_factor`]
    #[serde(default = "default_acceleration_factor")]
    pub acceleration_factor: f64,
    /// Start over once every sample was emitted. Without wrapping the
    /// source is exhausted after one pass.
    #[serde(default = "default_wrap")]
    pub wrap: bool,
}

#[derive(Debug, Clone, PartialEq)]
struct Sample {
    record: Map<String, Value>,
    index: Option<Arc<str>>,
    doc_type: Option<Arc<str>>,
}

fn take_str(record: &mut Map<String, Value>, key: &str) -> Option<Arc<str>> {
    record.remove(key).map(|value| match value {
        Value::String(s) => Arc::from(s),
        other => Arc::from(other.to_string()),
    })
}

/// Replays sample records as events.
#[derive(Debug)]
pub struct SampleSource<C = RealClock> {
    config: Config,
    samples: Arc<[Sample]>,
    timestamp_fields: Vec<String>,
    index: IndexTemplate,
    doc_type: Arc<str>,
    clock: TimestampClock<C>,
    rng: StdRng,
    next: usize,
    emitted: usize,
}

impl SampleSource<RealClock> {
    /// Load the configured sample files.
    ///
    /// # Errors
    ///
    /// Returns an error if no sample could be loaded, a sample is not a json
    /// object or a time point is malformed.
    pub fn new(config: &Config, rng: StdRng) -> Result<Self, Error> {
        Self::with_clock(config, RealClock, rng)
    }

    /// A source for partition `index` replaying the same samples from the
    /// start, seeded from `index × seed` or OS entropy.
    ///
    /// # Errors
    ///
    /// Returns an error if a time point is malformed.
    pub fn partition(&self, index: usize, seed: Option<u64>) -> Result<Self, Error> {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64((index as u64).wrapping_mul(seed)),
            None => StdRng::from_os_rng(),
        };
        Self::from_samples(&self.config, Arc::clone(&self.samples), RealClock, rng)
    }
}

impl<C> SampleSource<C>
where
    C: WallClock,
{
    /// Load the configured sample files, reading time from `clock`.
    ///
    /// # Errors
    ///
    /// See [`SampleSource::new`].
    pub fn with_clock(config: &Config, clock: C, rng: StdRng) -> Result<Self, Error> {
        let files = config.sample_file.clone().into_vec();
        let records = lookup::load_data_files(&files)?;
        info!(samples = records.len(), "samples loaded");

        let samples = records
            .into_iter()
            .enumerate()
            .map(|(position, record)| match record {
                Value::Object(mut record) => Ok(Sample {
                    doc_type: take_str(&mut record, "_type"),
                    index: take_str(&mut record, "_index"),
                    record,
                }),
                _ => Err(Error::Configuration(format!(
                    "sample {position} is not a json object"
                ))),
            })
            .collect::<Result<Vec<_>, _>>()?;
        if samples.is_empty() {
            return Err(Error::Configuration("no samples were loaded".to_string()));
        }
        Self::from_samples(config, samples.into(), clock, rng)
    }

    fn from_samples(
        config: &Config,
        samples: Arc<[Sample]>,
        clock: C,
        rng: StdRng,
    ) -> Result<Self, Error> {
        let clock = TimestampClock::with_clock(
            &config.starting_point,
            config.end_point.as_deref(),
            config.acceleration_factor,
            clock,
        )?;
        Ok(Self {
            config: config.clone(),
            samples,
            timestamp_fields: config.timestamp_field.clone().into_vec(),
            index: IndexTemplate::parse(config.index.as_deref().unwrap_or(DEFAULT_INDEX)),
            doc_type: Arc::from(config.doc_type.as_deref().unwrap_or(DEFAULT_TYPE)),
            clock,
            rng,
            next: 0,
            emitted: 0,
        })
    }

    /// Number of loaded samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Always false, an empty sample set fails construction.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl<C> EventSource for SampleSource<C>
where
    C: WallClock,
{
    fn start_bulk(&mut self, _bulk_size: NonZeroUsize) -> Result<(), Error> {
        Ok(())
    }

    fn generate_event(&mut self) -> Result<Option<Event>, Error> {
        if !self.config.wrap && self.emitted >= self.samples.len() {
            return Ok(None);
        }
        let sample = &self.samples[self.next];
        let mut record = sample.record.clone();

        let needs_time = sample.index.is_none() || !self.timestamp_fields.is_empty();
        let index = if needs_time {
            let ts = self.clock.next_timestamp(&mut self.rng);
            for field in &self.timestamp_fields {
                if let Some(value) = record.get_mut(field) {
                    *value = Value::String(ts.iso().to_string());
                }
            }
            match &sample.index {
                Some(index) => Arc::clone(index),
                None => self.index.render(ts),
            }
        } else {
            sample.index.clone().unwrap_or_else(|| Arc::from(DEFAULT_INDEX))
        };
        let doc_type = sample
            .doc_type
            .clone()
            .unwrap_or_else(|| Arc::clone(&self.doc_type));

        self.next = (self.next + 1) % self.samples.len();
        self.emitted += 1;
        Ok(Some(Event {
            document: Document::Object(record),
            index,
            doc_type,
        }))
    }

    fn percent_completed(&self) -> Option<f64> {
        (!self.config.wrap).then(|| self.emitted as f64 / self.samples.len() as f64)
    }
}

#[cfg(test)]
mod test {
    use rand::{SeedableRng, rngs::StdRng};
    use serde_json::json;
    use tempfile::TempDir;
    use time::macros::datetime;

    use super::{Config, OneOrMany, SampleSource};
    use crate::{Document, Error, EventSource, random_event::test::Frozen, timestamp};

    fn write_samples(dir: &TempDir) -> String {
        let path = dir.path().join("samples.json");
        std::fs::write(
            &path,
            json!([
                {"message": "a", "@timestamp": "", "_index": "fixed", "_type": "event"},
                {"message": "b", "@timestamp": ""},
                {"message": "c"},
            ])
            .to_string(),
        )
        .unwrap();
        path.to_str().unwrap().to_string()
    }

    fn config(file: String) -> Config {
        serde_json::from_value(json!({
            "sample_file": file,
            "timestamp_field": "@timestamp",
            "index": "samples-{{yyyy}}.{{mm}}",
            "starting_point": "2019-01-05 15:00:00",
        }))
        .unwrap()
    }

    fn source(config: &Config) -> SampleSource<Frozen> {
        SampleSource::with_clock(
            config,
            Frozen(datetime!(2019-06-17 00:00:00 UTC)),
            StdRng::seed_from_u64(0),
        )
        .unwrap()
    }

    #[test]
    fn replays_and_stamps_samples() {
        let dir = TempDir::new().unwrap();
        let config = config(write_samples(&dir));
        let mut source = source(&config);
        assert_eq!(source.len(), 3);

        let mut routes = Vec::new();
        let mut docs = Vec::new();
        for _ in 0..4 {
            let event = source.generate_event().unwrap().unwrap();
            routes.push((event.index.to_string(), event.doc_type.to_string()));
            let Document::Object(doc) = event.document else {
                panic!("samples are structured");
            };
            docs.push(serde_json::Value::Object(doc));
        }
        assert_eq!(
            routes,
            [
                ("fixed".to_string(), "event".to_string()),
                ("samples-2019.01".to_string(), "logs".to_string()),
                ("samples-2019.01".to_string(), "logs".to_string()),
                ("fixed".to_string(), "event".to_string()),
            ]
        );
        assert_eq!(
            docs[0],
            json!({"message": "a", "@timestamp": "2019-01-05T15:00:00.000Z"})
        );
        // Fields absent from a sample are not added.
        assert_eq!(docs[2], json!({"message": "c"}));
        assert_eq!(source.percent_completed(), None);
    }

    #[test]
    fn without_wrap_exhausts() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            wrap: false,
            ..config(write_samples(&dir))
        };
        let mut source = source(&config);
        for _ in 0..3 {
            assert!(source.generate_event().unwrap().is_some());
        }
        assert_eq!(source.percent_completed(), Some(1.0));
        assert!(source.generate_event().unwrap().is_none());
    }

    #[test]
    fn partitions_share_samples() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            timestamp_field: OneOrMany::Many(vec![]),
            ..config(write_samples(&dir))
        };
        let source = SampleSource::new(&config, StdRng::seed_from_u64(0)).unwrap();
        let mut other = source.partition(1, Some(3)).unwrap();
        assert_eq!(other.len(), 3);
        let event = other.generate_event().unwrap().unwrap();
        assert_eq!(&*event.index, "fixed");
    }

    #[test]
    fn rejects_bad_samples() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scalars.json");
        std::fs::write(&path, "[1, 2]").unwrap();
        let err = SampleSource::new(
            &config(path.to_str().unwrap().to_string()),
            StdRng::seed_from_u64(0),
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid configuration: sample 0 is not a json object"
        );

        let missing = SampleSource::new(
            &config(dir.path().join("absent.json").to_str().unwrap().to_string()),
            StdRng::seed_from_u64(0),
        );
        assert!(missing.is_err());
    }

    #[test]
    fn rejects_acceleration_factors() {
        let dir = TempDir::new().unwrap();
        let file = write_samples(&dir);
        for factor in [-1.0, 0.0, f64::NAN] {
            let config = Config {
                acceleration_factor: factor,
                ..config(file.clone())
            };
            let res = SampleSource::with_clock(
                &config,
                Frozen(datetime!(2019-06-17 00:00:00 UTC)),
                StdRng::seed_from_u64(0),
            );
            assert!(
                matches!(
                    res,
                    Err(Error::Timestamp(timestamp::Error::AccelerationFactor(_)))
                ),
                "{factor}"
            );
        }
    }

    #[test]
    fn rejects_out_of_range_starting_point() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            starting_point: "now+100000000d".into(),
            ..config(write_samples(&dir))
        };
        let err = SampleSource::new(&config, StdRng::seed_from_u64(0)).unwrap_err();
        assert_eq!(err.to_string(), "Invalid time format: now+100000000d");
    }
}
