//! Lookup tables and their process-wide cache.
//!
//! Field groups draw compact integer or string codes from weighted tables and
//! translate them into display strings through plain lookup tables. Both kinds
//! of table live in json files, gzip compressed when the path ends in `.gz`,
//! and both are large enough that every partition in a process must share a
//! single decoded copy. The [`Registry`] hands out that copy.

use std::{
    any::{Any, TypeId},
    borrow::Cow,
    fs::File,
    hash::{Hash, Hasher},
    io::{BufReader, Read},
    num::NonZeroU32,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use flate2::read::MultiGzDecoder;
use once_cell::sync::{Lazy, OnceCell};
use rand::{SeedableRng, rngs::StdRng};
use regex::{Captures, Regex};
use rustc_hash::{FxHashMap, FxHasher};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::Value;
use tracing::info;

use crate::weighted::{self, WeightedTable};

/// Errors produced while loading lookup data
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The file could not be opened or read
    #[error("Unable to read {}: {source}", path.display())]
    Io {
        /// The offending path
        path: PathBuf,
        /// The underlying error
        #[source]
        source: std::io::Error,
    },
    /// The file does not contain json of the expected shape
    #[error("Unable to decode {}: {source}", path.display())]
    Json {
        /// The offending path
        path: PathBuf,
        /// The underlying error
        #[source]
        source: serde_json::Error,
    },
    /// A weighted table could not be built from the file
    #[error("Unable to build weighted table from {}: {source}", path.display())]
    Weighted {
        /// The offending path
        path: PathBuf,
        /// The underlying error
        #[source]
        source: weighted::Error,
    },
    /// A code has no entry in its lookup table
    #[error("Code {code} not present in lookup table")]
    MissingCode {
        /// The missing code
        code: String,
    },
    /// A lookup table is neither a json array nor a json object
    #[error("Lookup table {} must be a json array or object", path.display())]
    Shape {
        /// The offending path
        path: PathBuf,
    },
    /// No sample files were configured
    #[error("No data files were given")]
    NoFiles,
}

/// A code drawn from a weighted table, resolved through a [`Lookup`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Code {
    /// Position in an array-shaped table
    Index(usize),
    /// Key in an object-shaped table. The empty key resolves to the empty
    /// string.
    Key(String),
}

/// A code to display-string table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// Array-shaped table, indexed by position
    List(Vec<String>),
    /// Object-shaped table, indexed by key
    Map(FxHashMap<String, String>),
}

impl Lookup {
    fn from_value(path: &Path, value: Value) -> Result<Self, Error> {
        match value {
            Value::Array(values) => Ok(Lookup::List(values.into_iter().map(display).collect())),
            Value::Object(map) => Ok(Lookup::Map(
                map.into_iter().map(|(k, v)| (k, display(v))).collect(),
            )),
            _ => Err(Error::Shape {
                path: path.to_path_buf(),
            }),
        }
    }

    /// Resolve `code` to its display string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingCode`] if `code` is absent from the table.
    pub fn get(&self, code: &Code) -> Result<&str, Error> {
        let found = match (self, code) {
            (_, Code::Key(key)) if key.is_empty() => return Ok(""),
            (Lookup::List(values), Code::Index(idx)) => values.get(*idx),
            (Lookup::List(values), Code::Key(key)) => {
                key.parse::<usize>().ok().and_then(|idx| values.get(idx))
            }
            (Lookup::Map(map), Code::Key(key)) => map.get(key),
            (Lookup::Map(map), Code::Index(idx)) => map.get(&idx.to_string()),
        };
        found.map(String::as_str).ok_or_else(|| Error::MissingCode {
            code: match code {
                Code::Index(idx) => idx.to_string(),
                Code::Key(key) => key.clone(),
            },
        })
    }
}

fn display(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

fn open(path: &Path) -> Result<Box<dyn Read>, Error> {
    let file = File::open(path).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let reader = BufReader::new(file);
    if path.extension().is_some_and(|ext| ext == "gz") {
        Ok(Box::new(MultiGzDecoder::new(reader)))
    } else {
        Ok(Box::new(reader))
    }
}

/// Decode the json document at `path`, transparently decompressing `.gz`
/// files.
///
/// # Errors
///
/// Returns an error if the file cannot be read or does not decode as `T`.
pub fn read_json<T>(path: &Path) -> Result<T, Error>
where
    T: DeserializeOwned,
{
    serde_json::from_reader(open(path)?).map_err(|source| Error::Json {
        path: path.to_path_buf(),
        source,
    })
}

static ENV_VAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$(?:\{(\w+)\}|(\w+))").expect("Invalid regex pattern provided")
});

/// Expand `$VAR` and `${VAR}` references. Unset variables are left as
/// written.
#[must_use]
pub fn expand_vars(input: &str) -> Cow<'_, str> {
    ENV_VAR.replace_all(input, |caps: &Captures<'_>| {
        let name = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
        std::env::var(name).unwrap_or_else(|_| caps[0].to_string())
    })
}

/// Load sample records from `files`.
///
/// Each file holds either a single json array of records or one record per
/// line. Environment variables in paths are expanded. Records of all files
/// are concatenated in order.
///
/// # Errors
///
/// Returns an error if `files` is empty or any file cannot be read or
/// decoded.
pub fn load_data_files<S>(files: &[S]) -> Result<Vec<Value>, Error>
where
    S: AsRef<str>,
{
    if files.is_empty() {
        return Err(Error::NoFiles);
    }
    let mut records = Vec::new();
    for file in files {
        let path = PathBuf::from(expand_vars(file.as_ref()).into_owned());
        info!(path = %path.display(), "loading sample file");

        let mut data = String::new();
        open(&path)?
            .read_to_string(&mut data)
            .map_err(|source| Error::Io {
                path: path.clone(),
                source,
            })?;

        if let Ok(array) = serde_json::from_str::<Vec<Value>>(&data) {
            info!(records = array.len(), "records read from json array");
            records.extend(array);
        } else {
            let before = records.len();
            for line in data.lines().filter(|line| !line.trim().is_empty()) {
                let record = serde_json::from_str(line).map_err(|source| Error::Json {
                    path: path.clone(),
                    source,
                })?;
                records.push(record);
            }
            info!(records = records.len() - before, "records read from json lines");
        }
    }
    Ok(records)
}

type Slot = Arc<OnceCell<Arc<dyn Any + Send + Sync>>>;

/// Everything besides the file that decides a weighted table's layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Build {
    cutoff_percent: u64,
    cutoff_frequency: NonZeroU32,
    seed: Option<u64>,
}

type Key = (PathBuf, TypeId, Option<Build>);

/// A read-only cache of decoded tables keyed by file path, table type and,
/// for weighted tables, the build parameters.
///
/// Each key is initialized at most once: concurrent callers for the same key
/// block on a per-key guard while the first one decodes the file, callers for
/// other keys proceed. Entries are never evicted.
#[derive(Debug, Default)]
pub struct Registry {
    slots: Mutex<FxHashMap<Key, Slot>>,
}

static GLOBAL: Lazy<Registry> = Lazy::new(Registry::default);

impl Registry {
    /// The process-wide registry.
    #[must_use]
    pub fn global() -> &'static Registry {
        &GLOBAL
    }

    /// Number of tables held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|slot| slot.get().is_some())
            .count()
    }

    /// True if no table has been loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get_or_try_init<T, F>(
        &self,
        path: &Path,
        build: Option<Build>,
        init: F,
    ) -> Result<Arc<T>, Error>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Result<T, Error>,
    {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(
                slots
                    .entry((path.to_path_buf(), TypeId::of::<T>(), build))
                    .or_default(),
            )
        };
        let value = slot.get_or_try_init(|| {
            init().map(|table| Arc::new(table) as Arc<dyn Any + Send + Sync>)
        })?;
        Ok(Arc::clone(value)
            .downcast::<T>()
            .unwrap_or_else(|_| unreachable!("slot keyed by TypeId")))
    }

    /// The [`Lookup`] decoded from `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a json array or
    /// object.
    pub fn lookup(&self, path: &Path) -> Result<Arc<Lookup>, Error> {
        self.get_or_try_init(path, None, || {
            let value: Value = read_json(path)?;
            let lookup = Lookup::from_value(path, value)?;
            info!(path = %path.display(), "loaded lookup table");
            Ok(lookup)
        })
    }

    /// The [`WeightedTable`] built from the `[weight, value]` pairs in
    /// `path` with `config`.
    ///
    /// With a `seed` the materialized choices are shuffled by a generator
    /// seeded from it and the file name, so the layout does not depend on
    /// which caller builds the table or where the data directory lives.
    /// Without one the shuffle draws from OS entropy.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, does not hold
    /// `[weight, value]` pairs or the table cannot be built.
    pub fn weighted<T>(
        &self,
        path: &Path,
        config: weighted::Config,
        seed: Option<u64>,
    ) -> Result<Arc<WeightedTable<T>>, Error>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        let build = Build {
            cutoff_percent: config.cutoff_percent.to_bits(),
            cutoff_frequency: config.cutoff_frequency,
            seed,
        };
        self.get_or_try_init(path, Some(build), || {
            let entries: Vec<(u64, T)> = read_json(path)?;
            let mut rng = match seed {
                Some(seed) => {
                    let mut hasher = FxHasher::default();
                    path.file_name().hash(&mut hasher);
                    StdRng::seed_from_u64(seed ^ hasher.finish())
                }
                None => StdRng::from_os_rng(),
            };
            let table =
                WeightedTable::new(&mut rng, entries, config).map_err(|source| Error::Weighted {
                    path: path.to_path_buf(),
                    source,
                })?;
            info!(path = %path.display(), entries = table.items().len(), "loaded weighted table");
            Ok(table)
        })
    }
}

#[cfg(test)]
mod test {
    use std::{io::Write, sync::Arc};

    use flate2::{Compression, write::GzEncoder};
    use serde_json::json;
    use tempfile::TempDir;

    use super::{Code, Error, Lookup, Registry, expand_vars, load_data_files};
    use crate::weighted::{self, WeightedSampler};

    fn write_gz(dir: &TempDir, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut encoder = GzEncoder::new(std::fs::File::create(&path).unwrap(), Compression::fast());
        encoder.write_all(contents.as_bytes()).unwrap();
        encoder.finish().unwrap();
        path
    }

    #[test]
    fn lookup_resolves_codes() {
        let dir = TempDir::new().unwrap();
        let list = write_gz(&dir, "list.json.gz", r#"["Firefox", "Chrome", 7]"#);
        let map = write_gz(&dir, "map.json.gz", r#"{"0": "Other", "a1": "Mac OS X"}"#);
        let registry = Registry::default();

        let list = registry.lookup(&list).unwrap();
        assert_eq!(list.get(&Code::Index(1)).unwrap(), "Chrome");
        assert_eq!(list.get(&Code::Index(2)).unwrap(), "7");
        assert_eq!(list.get(&Code::Key(String::new())).unwrap(), "");
        assert!(matches!(
            list.get(&Code::Index(3)),
            Err(Error::MissingCode { .. })
        ));

        let map = registry.lookup(&map).unwrap();
        assert_eq!(map.get(&Code::Key("a1".into())).unwrap(), "Mac OS X");
        assert_eq!(map.get(&Code::Index(0)).unwrap(), "Other");
    }

    #[test]
    fn codes_deserialize_untagged() {
        let codes: Vec<Code> = serde_json::from_value(json!([3, "x", ""])).unwrap();
        assert_eq!(
            codes,
            vec![Code::Index(3), Code::Key("x".into()), Code::Key(String::new())]
        );
    }

    #[test]
    fn registry_loads_once() {
        let dir = TempDir::new().unwrap();
        let path = write_gz(&dir, "agents.json.gz", r#"[[3, "a"], [1, "b"]]"#);
        let registry = Registry::default();

        let first = registry
            .weighted::<String>(&path, weighted::Config::default(), Some(0))
            .unwrap();
        std::fs::remove_file(&path).unwrap();
        let second = registry
            .weighted::<String>(&path, weighted::Config::default(), Some(0))
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);

        // A different table type for the same path is a distinct entry.
        assert!(matches!(registry.lookup(&path), Err(Error::Io { .. })));
    }

    #[test]
    fn weighted_tables_keyed_by_build() {
        let dir = TempDir::new().unwrap();
        let path = write_gz(&dir, "agents.json.gz", r#"[[30, "a"], [5, "b"], [1, "c"]]"#);
        let registry = Registry::default();
        let narrow = weighted::Config {
            cutoff_percent: 0.05,
            ..weighted::Config::default()
        };

        let default = registry
            .weighted::<String>(&path, weighted::Config::default(), Some(1))
            .unwrap();
        let other = registry.weighted::<String>(&path, narrow, Some(1)).unwrap();
        assert!(!Arc::ptr_eq(&default, &other));
        let reseeded = registry
            .weighted::<String>(&path, weighted::Config::default(), Some(2))
            .unwrap();
        assert!(!Arc::ptr_eq(&default, &reseeded));
        assert_eq!(registry.len(), 3);

        let again = registry.weighted::<String>(&path, narrow, Some(1)).unwrap();
        assert!(Arc::ptr_eq(&other, &again));
    }

    #[test]
    fn seeded_layout_is_stable() {
        let pairs: Vec<(u64, String)> = (1..=60).map(|i| (i % 7 + 1, format!("v{i}"))).collect();
        let contents = serde_json::to_string(&pairs).unwrap();
        let draws = |seed| {
            // A fresh directory and registry each time.
            let dir = TempDir::new().unwrap();
            let path = write_gz(&dir, "requests.json.gz", &contents);
            let table = Registry::default()
                .weighted::<String>(&path, weighted::Config::default(), Some(seed))
                .unwrap();
            let mut sampler = WeightedSampler::new(table);
            (0..500).map(|_| sampler.get_random().clone()).collect::<Vec<_>>()
        };
        assert_eq!(draws(7), draws(7));
        assert_ne!(draws(7), draws(8));
    }

    #[test]
    fn registry_rejects_bad_tables() {
        let dir = TempDir::new().unwrap();
        let scalar = write_gz(&dir, "scalar.json.gz", "42");
        let zero = write_gz(&dir, "zero.json.gz", r#"[[0, "a"]]"#);
        let registry = Registry::default();

        assert!(matches!(registry.lookup(&scalar), Err(Error::Shape { .. })));
        assert!(matches!(
            registry.weighted::<String>(&zero, weighted::Config::default(), None),
            Err(Error::Weighted { .. })
        ));
        assert!(registry.is_empty());
        assert_eq!(
            Lookup::List(vec![]).get(&Code::Key("x".into())).unwrap_err().to_string(),
            "Code x not present in lookup table"
        );
    }

    #[test]
    fn load_array_and_lines() {
        let dir = TempDir::new().unwrap();
        let array = dir.path().join("array.json");
        std::fs::write(&array, r#"[{"a": 1}, {"a": 2}]"#).unwrap();
        let lines = write_gz(&dir, "lines.json.gz", "{\"b\": 1}\n{\"b\": 2}\n\n{\"b\": 3}\n");

        let records = load_data_files(&[
            array.to_str().unwrap(),
            lines.to_str().unwrap(),
        ])
        .unwrap();
        assert_eq!(
            records,
            vec![
                json!({"a": 1}),
                json!({"a": 2}),
                json!({"b": 1}),
                json!({"b": 2}),
                json!({"b": 3}),
            ]
        );
        assert!(matches!(
            load_data_files::<&str>(&[]),
            Err(Error::NoFiles)
        ));
    }

    #[test]
    fn expands_environment() {
        // SAFETY: the variable name is unique to this test.
        unsafe { std::env::set_var("EVENTDATA_LOOKUP_TEST_DIR", "/data") };
        assert_eq!(
            expand_vars("$EVENTDATA_LOOKUP_TEST_DIR/a.json"),
            "/data/a.json"
        );
        assert_eq!(
            expand_vars("${EVENTDATA_LOOKUP_TEST_DIR}x/b"),
            "/datax/b"
        );
        assert_eq!(
            expand_vars("$EVENTDATA_LOOKUP_UNSET/c"),
            "$EVENTDATA_LOOKUP_UNSET/c"
        );
    }
}
