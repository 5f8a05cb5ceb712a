//! Synthetic nginx access-log events.
//!
//! [`RandomEvent`] composes one document per call from its field groups and
//! a [`TimestampClock`]. With a daily logging volume configured it accounts
//! the size of each event as a raw access-log line and jumps the clock to the
//! next day once the partition's share of the volume is used up.

use std::{
    fmt::{self, Write},
    num::NonZeroUsize,
    path::Path,
    sync::Arc,
};

use rand::{SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::Duration;
use tracing::{debug, info, warn};

use crate::{
    Document, Error, Event, EventSource,
    common::{size, template::IndexTemplate},
    fields::{EventRecord, FieldGroup, Fields, Loader},
    lookup::Registry,
    timestamp::{self, RealClock, TimestampClock, WallClock},
    weighted,
};

const DEFAULT_INDEX: &str = "elasticlogs";
const DOC_TYPE: &str = "doc";
/// Size assumed for every line of the emulated log file.
const TYPICAL_EVENT_SIZE: u64 = 263;
/// Emulated log files rotate at this size.
const MAX_LOG_FILE_SIZE: u64 = 4 * 1024 * 1024 * 1024;
/// Simulated time covered by one bulk, spread evenly over its documents.
const BULK_TICK_MICROS: f64 = 1_000.0;

fn default_starting_point() -> String {
    "now".to_string()
}

fn default_acceleration_factor() -> f64 {
    1.0
}

/// Configuration of [`RandomEvent`]
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Config {
    /// Index name, optionally with `<yyyy>`, `<yy>`, `<mm>`, `<dd>` and
    /// `<hh>` placeholders. Defaults to `elasticlogs`.
    #[serde(default)]
    pub index: Option<String>,
    /// Logical start of event time, see [`timestamp::Point::parse`]
    #[serde(default = "default_starting_point")]
    pub starting_point: String,
    /// If present, timestamps are drawn at random between the starting and
    /// end point.
    #[serde(default)]
    pub end_point: Option<String>,
    /// Constant shift applied to every timestamp, `[+-]<int><m|h|d>`
    #[serde(default)]
    pub offset: Option<String>,
    /// Speed of simulated time relative to the wall clock
    #[serde(default = "default_acceleration_factor")]
    pub acceleration_factor: f64,
    /// Raw log volume per simulated day across all clients, e.g. `10GB`
    #[serde(default)]
    pub daily_logging_volume: Option<String>,
    /// Number of clients sharing `daily_logging_volume`
    #[serde(default)]
    pub client_count: Option<NonZeroUsize>,
    /// Simulated days to generate before the source is exhausted
    #[serde(default)]
    pub number_of_days: Option<u32>,
    /// Add the raw access-log line size to every document
    #[serde(default)]
    pub record_raw_event_size: bool,
    /// Emit documents as json objects instead of pre-serialized strings
    #[serde(default)]
    pub structured_documents: bool,
    /// Long-tail tuning of the weighted corpora
    #[serde(flatten)]
    pub weighted: weighted::Config,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            index: None,
            starting_point: default_starting_point(),
            end_point: None,
            offset: None,
            acceleration_factor: default_acceleration_factor(),
            daily_logging_volume: None,
            client_count: None,
            number_of_days: None,
            record_raw_event_size: false,
            structured_documents: false,
            weighted: weighted::Config::default(),
        }
    }
}

/// Generator of synthetic access-log events.
#[derive(Debug)]
pub struct RandomEvent<G = Fields, C = RealClock> {
    fields: G,
    clock: TimestampClock<C>,
    rng: StdRng,
    record: EventRecord,
    timestamp: String,
    hostname: String,
    raw: String,
    index: IndexTemplate,
    index_name: Option<Arc<str>>,
    doc_type: Arc<str>,
    daily_logging_volume: Option<u64>,
    current_logging_volume: u64,
    total_days: Option<u32>,
    remaining_days: Option<u32>,
    record_raw_event_size: bool,
    structured_documents: bool,
    offset: u64,
    web_host: u8,
    tick_micros: f64,
}

impl RandomEvent<Fields, RealClock> {
    /// Create the generator for partition `index` of `total`, loading field
    /// corpora from `data_dir` through `registry`.
    ///
    /// The random source is seeded with `index × seed` when a seed is given
    /// and from OS entropy otherwise. Weighted tables shared through
    /// `registry` are laid out from `seed` alone, so a seeded partition's
    /// output does not depend on which partition loaded them first. The
    /// partition's share of the daily logging volume is `1/total`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the corpora cannot
    /// be loaded.
    pub fn partition(
        config: &Config,
        data_dir: &Path,
        registry: &Registry,
        seed: Option<u64>,
        index: usize,
        total: NonZeroUsize,
    ) -> Result<Self, Error> {
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64((index as u64).wrapping_mul(seed)),
            None => StdRng::from_os_rng(),
        };
        let fields = Fields::load(&mut Loader {
            data_dir,
            registry,
            config: config.weighted,
            seed,
            rng: &mut rng,
        })?;
        let config = Config {
            client_count: Some(total),
            ..config.clone()
        };
        info!(partition = index, total = total.get(), "constructed random event partition");
        Self::with_parts(&config, fields, RealClock, rng)
    }
}

impl<G, C> RandomEvent<G, C>
where
    G: FieldGroup,
    C: WallClock,
{
    /// Create a generator from explicit field groups, wall clock and random
    /// source.
    ///
    /// # Errors
    ///
    /// Returns an error if a time point, the offset or the daily logging
    /// volume is malformed, or if `acceleration_factor` is not positive.
    pub fn with_parts(config: &Config, fields: G, clock: C, rng: StdRng) -> Result<Self, Error> {
        let mut clock = TimestampClock::with_clock(
            &config.starting_point,
            config.end_point.as_deref(),
            config.acceleration_factor,
            clock,
        )?;
        if let Some(offset) = &config.offset {
            clock = clock.with_shift(timestamp::parse_offset(offset)?);
        }

        let index = IndexTemplate::parse(config.index.as_deref().unwrap_or(DEFAULT_INDEX));
        debug!(template = ?config.index, time_based = index.is_time_based(), "index template");

        let daily_logging_volume = match (&config.daily_logging_volume, config.client_count) {
            (Some(volume), Some(clients)) => {
                Some(size::parse(volume)?.as_u64() / clients.get() as u64)
            }
            (Some(_), None) => {
                warn!("daily_logging_volume is ignored without client_count");
                None
            }
            (None, _) => None,
        };
        if config.number_of_days.is_some() && daily_logging_volume.is_none() {
            warn!("number_of_days has no effect without a daily logging volume");
        }

        Ok(Self {
            fields,
            clock,
            rng,
            record: EventRecord::default(),
            timestamp: String::new(),
            hostname: String::new(),
            raw: String::new(),
            index,
            index_name: None,
            doc_type: Arc::from(DOC_TYPE),
            daily_logging_volume,
            current_logging_volume: 0,
            total_days: config.number_of_days,
            remaining_days: config.number_of_days,
            record_raw_event_size: config.record_raw_event_size,
            structured_documents: config.structured_documents,
            offset: 0,
            web_host: 0,
            tick_micros: 0.0,
        })
    }

    /// The raw access-log line of the last generated event.
    #[must_use]
    pub fn raw_event(&self) -> String {
        let mut line = String::new();
        write_raw(&self.record, &self.timestamp, &mut line);
        line
    }

    fn refresh(&mut self) {
        let ts = self.clock.next_timestamp(&mut self.rng);
        let name = self.index.render(ts);
        if self.index_name.as_ref() != Some(&name) {
            debug!(index = %name, "index name resolved");
        }
        self.index_name = Some(name);
    }

    fn rollover(&mut self) {
        if let Some(days) = self.remaining_days.as_mut() {
            *days = days.saturating_sub(1);
        }
        self.clock.skip(Duration::days(1));
        self.refresh();
        self.current_logging_volume = 0;
        debug!(
            index = ?self.index_name,
            remaining_days = ?self.remaining_days,
            "daily logging volume reached, rolled over"
        );
    }

    fn document(&self, raw_event_size: Option<usize>) -> NginxDocument<'_> {
        let r = &self.record;
        NginxDocument {
            timestamp: &self.timestamp,
            raw_event_size,
            offset: self.offset,
            source: "/usr/local/var/log/nginx/access.log",
            fileset: Fileset {
                module: "nginx",
                name: "access",
            },
            input: Kind { kind: "log" },
            beat: Beat {
                version: "6.3.0",
                hostname: &self.hostname,
                name: &self.hostname,
            },
            prospector: Kind { kind: "log" },
            nginx: Nginx {
                access: Access {
                    user_name: "-",
                    agent: &r.agent,
                    user_agent: UserAgent {
                        major: &r.useragent_major,
                        os: &r.useragent_os,
                        os_major: &r.useragent_os_major,
                        name: &r.useragent_name,
                        os_name: &r.useragent_os_name,
                        device: &r.useragent_device,
                    },
                    remote_ip: &r.clientip,
                    remote_ip_list: [&r.clientip],
                    geoip: GeoIp {
                        continent_name: &r.geoip_continent_name,
                        city_name: &r.geoip_city_name,
                        country_name: &r.geoip_country_name,
                        country_iso_code: &r.geoip_country_iso_code,
                        location: Location {
                            lat: &r.geoip_location_lat,
                            lon: &r.geoip_location_lon,
                        },
                    },
                    referrer: &r.referrer,
                    url: &r.request,
                    body_sent: BodySent { bytes: &r.bytes },
                    method: &r.verb,
                    response_code: &r.response,
                    http_version: &r.httpversion,
                },
            },
        }
    }
}

impl<G, C> EventSource for RandomEvent<G, C>
where
    G: FieldGroup,
    C: WallClock,
{
    fn start_bulk(&mut self, bulk_size: NonZeroUsize) -> Result<(), Error> {
        self.tick_micros = BULK_TICK_MICROS / bulk_size.get() as f64;
        self.refresh();
        Ok(())
    }

    fn generate_event(&mut self) -> Result<Option<Event>, Error> {
        if self.remaining_days == Some(0) {
            return Ok(None);
        }
        let index = match &self.index_name {
            Some(name) => Arc::clone(name),
            None => {
                self.refresh();
                self.index_name
                    .clone()
                    .ok_or_else(|| Error::Configuration("index name unresolved".to_string()))?
            }
        };

        // Only the sub-second part moves within a bulk.
        let ts = self.clock.simulate_tick(self.tick_micros);
        self.timestamp.clear();
        self.timestamp.push_str(ts.iso());

        self.offset = (self.offset + TYPICAL_EVENT_SIZE) % MAX_LOG_FILE_SIZE;
        self.fields.add_fields(&mut self.rng, &mut self.record)?;

        self.web_host = self.web_host % 3 + 1;
        self.hostname.clear();
        let _ = write!(
            self.hostname,
            "web-{}-{}.elastic.co",
            self.record.geoip_continent_code, self.web_host
        );

        let mut raw_event_size = None;
        if self.record_raw_event_size || self.daily_logging_volume.is_some() {
            write_raw(&self.record, &self.timestamp, &mut self.raw);
            raw_event_size = Some(self.raw.len());
            if let Some(daily) = self.daily_logging_volume {
                self.current_logging_volume += self.raw.len() as u64;
                if self.current_logging_volume > daily {
                    self.rollover();
                }
            }
        }

        let document = self.document(raw_event_size.filter(|_| self.record_raw_event_size));
        let document = if self.structured_documents {
            let mut value = serde_json::to_value(&document)?;
            Document::Object(value.as_object_mut().map(std::mem::take).unwrap_or_default())
        } else {
            Document::Json(serde_json::to_string(&document)?)
        };

        Ok(Some(Event {
            document,
            index,
            doc_type: Arc::clone(&self.doc_type),
        }))
    }

    fn percent_completed(&self) -> Option<f64> {
        let daily = self.daily_logging_volume? as f64;
        let total_days = self.total_days?;
        let remaining_days = self.remaining_days?;
        let full_days = f64::from(total_days - remaining_days);
        Some((daily * full_days + self.current_logging_volume as f64) / (f64::from(total_days) * daily))
    }
}

/// Displays strings bare and any other json value as json.
struct Bare<'a>(&'a Value);

impl fmt::Display for Bare<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Value::String(s) => f.write_str(s),
            other => write!(f, "{other}"),
        }
    }
}

fn write_raw(record: &EventRecord, timestamp: &str, out: &mut String) {
    out.clear();
    let _ = write!(
        out,
        "{} - - [{}] \"{} {} HTTP/{}\" {} {} \"{}\" \"{}\"",
        record.clientip,
        timestamp,
        record.verb,
        record.request,
        record.httpversion,
        Bare(&record.response),
        Bare(&record.bytes),
        record.referrer,
        record.agent,
    );
}

#[derive(Serialize)]
struct NginxDocument<'a> {
    #[serde(rename = "@timestamp")]
    timestamp: &'a str,
    #[serde(rename = "_raw_event_size", skip_serializing_if = "Option::is_none")]
    raw_event_size: Option<usize>,
    offset: u64,
    source: &'static str,
    fileset: Fileset,
    input: Kind,
    beat: Beat<'a>,
    prospector: Kind,
    nginx: Nginx<'a>,
}

#[derive(Serialize)]
struct Fileset {
    module: &'static str,
    name: &'static str,
}

#[derive(Serialize)]
struct Kind {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct Beat<'a> {
    version: &'static str,
    hostname: &'a str,
    name: &'a str,
}

#[derive(Serialize)]
struct Nginx<'a> {
    access: Access<'a>,
}

#[derive(Serialize)]
struct Access<'a> {
    user_name: &'static str,
    agent: &'a str,
    user_agent: UserAgent<'a>,
    remote_ip: &'a str,
    remote_ip_list: [&'a str; 1],
    geoip: GeoIp<'a>,
    referrer: &'a str,
    url: &'a str,
    body_sent: BodySent<'a>,
    method: &'a str,
    response_code: &'a Value,
    http_version: &'a str,
}

#[derive(Serialize)]
struct UserAgent<'a> {
    major: &'a str,
    os: &'a str,
    os_major: &'a str,
    name: &'a str,
    os_name: &'a str,
    device: &'a str,
}

#[derive(Serialize)]
struct GeoIp<'a> {
    continent_name: &'a str,
    city_name: &'a str,
    country_name: &'a str,
    country_iso_code: &'a str,
    location: Location<'a>,
}

#[derive(Serialize)]
struct Location<'a> {
    lat: &'a Value,
    lon: &'a Value,
}

#[derive(Serialize)]
struct BodySent<'a> {
    bytes: &'a Value,
}
