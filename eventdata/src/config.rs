//! This module controls configuration parsing from the end user, providing a
//! convenience mechanism for the rest of the program. Crashes are most likely
//! to originate from this code, intentionally.
use std::{
    fs,
    io,
    num::NonZeroUsize,
    path::{Path, PathBuf},
};

use eventdata_payload::{bulk, random_event, sample};
use serde::Deserialize;

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// Error reading config file
    #[error("Failed to read config file {path:?}: {source}")]
    ReadFile {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_clients() -> NonZeroUsize {
    NonZeroUsize::MIN
}

/// Where events come from
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// Synthetic access-log events, see [`random_event::Config`]
    RandomEvent(random_event::Config),
    /// Events replayed from sample files, see [`sample::Config`]
    SampleBased(sample::Config),
}

/// Main configuration struct for this program
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Directory holding the `*.json.gz` corpora of random events
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Number of partitions, each one a simulated client
    #[serde(default = "default_clients")]
    pub clients: NonZeroUsize,
    /// File to write bulk bodies to, stdout if absent
    #[serde(default)]
    pub output: Option<PathBuf>,
    /// Makes runs reproducible when present
    #[serde(default)]
    pub seed: Option<u64>,
    /// Stop every partition after this many bulk requests. Unbounded sources
    /// otherwise run until interrupted.
    #[serde(default)]
    pub max_bulks: Option<u64>,
    /// Bulk request shape and document ids
    #[serde(default)]
    pub bulk: bulk::Config,
    /// The event source
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub source: Source,
}

impl Config {
    /// Parse configuration from yaml.
    ///
    /// # Errors
    ///
    /// Returns an error if `contents` is not a valid configuration.
    pub fn parse(contents: &str) -> Result<Self, Error> {
        serde_yaml::from_str(contents).map_err(Error::from)
    }
}

/// Load configuration from a yaml file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or is not a valid
/// configuration.
pub fn load_config_from_path(path: &Path) -> Result<Config, Error> {
    let contents = fs::read_to_string(path).map_err(|source| Error::ReadFile {
        path: path.to_path_buf(),
        source: Box::new(source),
    })?;
    Config::parse(&contents)
}

#[cfg(test)]
mod tests {
    use std::{io::Write, num::NonZeroUsize, path::PathBuf};

    use eventdata_payload::{bulk::BodyFormat, id::IdType};

    use super::{Config, Error, Source, load_config_from_path};

    #[test]
    fn random_event_config() -> Result<(), Error> {
        let contents = r#"
data_dir: /var/lib/eventdata
clients: 8
seed: 42
bulk:
  bulk-size: 500
  id_type: seq
  id_seq_probability: 0.1
  pipeline: nginx
source:
  random_event:
    index: "elasticlogs-<yyyy>-<mm>-<dd>"
    starting_point: "2019-01-05 15:00:00"
    acceleration_factor: 3
    daily_logging_volume: 10GB
    number_of_days: 2
    cutoff_frequency: 50
"#;
        let config = Config::parse(contents)?;
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/eventdata"));
        assert_eq!(config.clients.get(), 8);
        assert_eq!(config.seed, Some(42));
        assert_eq!(config.output, None);
        assert_eq!(config.bulk.bulk_size.get(), 500);
        assert_eq!(config.bulk.id_type, IdType::Seq);
        assert_eq!(config.bulk.pipeline.as_deref(), Some("nginx"));

        let Source::RandomEvent(source) = config.source else {
            panic!("expected a random event source");
        };
        assert_eq!(source.index.as_deref(), Some("elasticlogs-<yyyy>-<mm>-<dd>"));
        assert!((source.acceleration_factor - 3.0).abs() < f64::EPSILON);
        assert_eq!(source.daily_logging_volume.as_deref(), Some("10GB"));
        assert_eq!(source.number_of_days, Some(2));
        assert_eq!(source.weighted.cutoff_frequency.get(), 50);
        Ok(())
    }

    #[test]
    fn sample_based_defaults() -> Result<(), Error> {
        let contents = r#"
source:
  sample_based:
    sample_file: [a.json, b.json.gz]
    wrap: false
"#;
        let config = Config::parse(contents)?;
        assert_eq!(config.clients, NonZeroUsize::MIN);
        assert_eq!(config.data_dir, PathBuf::from("data"));
        assert_eq!(config.bulk.bulk_size.get(), 1_000);
        assert_eq!(config.bulk.body_format, BodyFormat::Lines);
        let Source::SampleBased(source) = config.source else {
            panic!("expected a sample based source");
        };
        assert!(!source.wrap);
        Ok(())
    }

    #[test]
    fn unknown_keys_rejected() {
        let contents = r"
clientz: 3
source:
  sample_based:
    sample_file: a.json
";
        assert!(Config::parse(contents).is_err());
        assert!(Config::parse("clients: 3\n").is_err());
        assert!(Config::parse("clients: 0\nsource:\n  sample_based:\n    sample_file: a\n").is_err());
    }

    #[test]
    fn load_single_file_works() -> Result<(), Box<dyn std::error::Error>> {
        let temp_dir = tempfile::tempdir()?;
        let config_path = temp_dir.path().join("config.yaml");
        let mut file = std::fs::File::create(&config_path)?;
        file.write_all(b"output: /tmp/bulk.ndjson\nsource:\n  random_event: {}\n")?;

        let config = load_config_from_path(&config_path)?;
        assert_eq!(config.output, Some(PathBuf::from("/tmp/bulk.ndjson")));
        assert!(matches!(config.source, Source::RandomEvent(_)));

        let missing = load_config_from_path(&temp_dir.path().join("absent.yaml"));
        assert!(matches!(missing, Err(Error::ReadFile { .. })));
        Ok(())
    }
}
