//! Range-filtered dashboard queries.
//!
//! An [`IntervalQuery`] appends a range clause over a random trailing slice of
//! a field's observed `[min, max]` span to a query body. The span comes from a
//! [`FieldStatsContext`] that the caller fills in, typically from a field
//! statistics request issued earlier in the run.

use rand::{Rng, rngs::StdRng};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;

/// Errors produced by [`IntervalQuery`]
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// The query body has no `query.bool.must` key
    #[error("Parameter 'body' must contain `query.bool.must` key.")]
    MissingMust,
    /// `min_interval_size_pct` is not in `(0, 100)`
    #[error("Parameter 'min_interval_size_pct' must be > 0 and < 100, got {0}.")]
    MinIntervalSize(f64),
    /// `max_interval_size_pct` is not in `(min_interval_size_pct, 100]`
    #[error(
        "Parameter 'max_interval_size_pct' must be > 'min_interval_size_pct' and <= 100, got {0}."
    )]
    MaxIntervalSize(f64),
    /// No statistics were recorded for the queried field
    #[error("No statistics found for field `{field}` in index pattern `{index_pattern}`.")]
    NoStatistics {
        /// The queried field
        field: String,
        /// The queried index pattern
        index_pattern: String,
    },
}

/// Observed bounds of a field, in epoch milliseconds for time fields
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct FieldStats {
    /// Smallest observed value
    pub min: i64,
    /// Largest observed value
    pub max: i64,
}

/// Field statistics keyed by index pattern and field name
#[derive(Debug, Default, Clone)]
pub struct FieldStatsContext {
    stats: FxHashMap<(String, String), FieldStats>,
}

impl FieldStatsContext {
    /// Record the statistics of `field` in `index_pattern`, replacing any
    /// earlier record.
    pub fn insert(&mut self, index_pattern: &str, field: &str, stats: FieldStats) {
        self.stats
            .insert((index_pattern.to_string(), field.to_string()), stats);
    }

    /// The statistics of `field` in `index_pattern`, if recorded.
    #[must_use]
    pub fn get(&self, index_pattern: &str, field: &str) -> Option<FieldStats> {
        self.stats
            .get(&(index_pattern.to_string(), field.to_string()))
            .copied()
    }
}

fn default_index_pattern() -> String {
    "filebeat-*".to_string()
}

fn default_type() -> String {
    "*".to_string()
}

fn default_fieldname() -> String {
    "@timestamp".to_string()
}

/// Configuration of [`IntervalQuery`]
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Query body, must contain `query.bool.must`
    pub body: Value,
    /// Index pattern to query and look statistics up for
    #[serde(default = "default_index_pattern")]
    pub index_pattern: String,
    /// Document type to query
    #[serde(default = "default_type", rename = "type")]
    pub doc_type: String,
    /// Field to filter on
    #[serde(default = "default_fieldname")]
    pub fieldname: String,
    /// Smallest filtered share of the span, in percent
    pub min_interval_size_pct: f64,
    /// Largest filtered share of the span, in percent
    pub max_interval_size_pct: f64,
    /// Use the request cache
    #[serde(default)]
    pub cache: bool,
}

/// A query request ready for submission
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryRequest {
    /// Index pattern to query
    pub index: String,
    /// Document type to query
    #[serde(rename = "type")]
    pub doc_type: String,
    /// Query body including the range clause
    pub body: Value,
    /// Use the request cache
    pub cache: bool,
}

/// Generator of range-filtered queries
#[derive(Debug)]
pub struct IntervalQuery {
    config: Config,
    rng: StdRng,
}

impl IntervalQuery {
    /// Validate `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the body lacks `query.bool.must` or the interval
    /// percentages are out of range.
    pub fn new(config: Config, rng: StdRng) -> Result<Self, Error> {
        if config.body.pointer("/query/bool/must").is_none() {
            return Err(Error::MissingMust);
        }
        let min = config.min_interval_size_pct;
        if !(min > 0.0 && min < 100.0) {
            return Err(Error::MinIntervalSize(min));
        }
        let max = config.max_interval_size_pct;
        if !(max > min && max <= 100.0) {
            return Err(Error::MaxIntervalSize(max));
        }
        Ok(Self { config, rng })
    }

    /// Build the next query from the statistics in `stats`.
    ///
    /// # Errors
    ///
    /// Returns an error if `stats` holds nothing for the configured index
    /// pattern and field.
    #[allow(clippy::cast_possible_truncation)]
    pub fn params(&mut self, stats: &FieldStatsContext) -> Result<QueryRequest, Error> {
        let cfg = &self.config;
        let FieldStats { min, max } =
            stats
                .get(&cfg.index_pattern, &cfg.fieldname)
                .ok_or_else(|| Error::NoStatistics {
                    field: cfg.fieldname.clone(),
                    index_pattern: cfg.index_pattern.clone(),
                })?;

        let span = (max - min) as f64;
        let range_min_upper = (max as f64 - span * cfg.min_interval_size_pct / 100.0) as i64;
        let delta = span * (cfg.max_interval_size_pct - cfg.min_interval_size_pct) / 100.0;
        let range_min = range_min_upper - (delta * self.rng.random::<f64>()) as i64;

        let mut body = cfg.body.clone();
        if let Some(must) = body.pointer_mut("/query/bool/must") {
            if !must.is_array() {
                *must = Value::Array(vec![must.take()]);
            }
            if let Value::Array(clauses) = must {
                clauses.push(json!({
                    "range": {
                        cfg.fieldname.as_str(): {
                            "gte": range_min,
                            "lte": max,
                            "format": "epoch_millis",
                        }
                    }
                }));
            }
        }
        info!(
            field = %cfg.fieldname,
            range_min,
            min,
            range_min_upper,
            range_max = max,
            "interval generated"
        );

        Ok(QueryRequest {
            index: cfg.index_pattern.clone(),
            doc_type: cfg.doc_type.clone(),
            body,
            cache: cfg.cache,
        })
    }
}

#[cfg(test)]
mod test {
    use rand::{SeedableRng, rngs::StdRng};
    use serde_json::json;

    use super::{Config, Error, FieldStats, FieldStatsContext, IntervalQuery};

    fn config() -> Config {
        serde_json::from_value(json!({
            "body": {"query": {"bool": {"must": {"match_all": {}}}}},
            "min_interval_size_pct": 10,
            "max_interval_size_pct": 20,
        }))
        .unwrap()
    }

    #[test]
    fn appends_range_clause() {
        let mut stats = FieldStatsContext::default();
        stats.insert("filebeat-*", "@timestamp", FieldStats { min: 0, max: 1_000 });
        let mut query = IntervalQuery::new(config(), StdRng::seed_from_u64(1)).unwrap();

        for _ in 0..100 {
            let request = query.params(&stats).unwrap();
            assert_eq!(request.index, "filebeat-*");
            assert_eq!(request.doc_type, "*");
            assert!(!request.cache);

            let must = request.body["query"]["bool"]["must"].as_array().unwrap();
            assert_eq!(must.len(), 2);
            assert_eq!(must[0], json!({"match_all": {}}));
            let range = &must[1]["range"]["@timestamp"];
            assert_eq!(range["lte"], 1_000);
            assert_eq!(range["format"], "epoch_millis");
            let gte = range["gte"].as_i64().unwrap();
            assert!((801..=900).contains(&gte), "{gte}");
        }
    }

    #[test]
    fn missing_statistics() {
        let mut query = IntervalQuery::new(config(), StdRng::seed_from_u64(1)).unwrap();
        let err = query.params(&FieldStatsContext::default()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "No statistics found for field `@timestamp` in index pattern `filebeat-*`."
        );
    }

    #[test]
    fn validates_configuration() {
        let rng = || StdRng::seed_from_u64(0);
        let with = |min, max| Config {
            min_interval_size_pct: min,
            max_interval_size_pct: max,
            ..config()
        };
        assert_eq!(
            IntervalQuery::new(with(0.0, 20.0), rng()).unwrap_err(),
            Error::MinIntervalSize(0.0)
        );
        assert_eq!(
            IntervalQuery::new(with(100.0, 100.0), rng()).unwrap_err(),
            Error::MinIntervalSize(100.0)
        );
        assert_eq!(
            IntervalQuery::new(with(20.0, 20.0), rng()).unwrap_err(),
            Error::MaxIntervalSize(20.0)
        );
        assert_eq!(
            IntervalQuery::new(with(20.0, 100.5), rng()).unwrap_err(),
            Error::MaxIntervalSize(100.5)
        );
        assert!(IntervalQuery::new(with(99.0, 100.0), rng()).is_ok());

        let no_must = Config {
            body: json!({"query": {"bool": {"filter": []}}}),
            ..config()
        };
        assert_eq!(
            IntervalQuery::new(no_must, rng()).unwrap_err(),
            Error::MissingMust
        );
    }
}
