//! Field groups of a synthetic access-log event.
//!
//! Each group owns [`WeightedSampler`]s over the corpora in the data
//! directory and the lookup tables that turn sampled codes into display
//! strings. Groups write into a reusable [`EventRecord`], overwriting every
//! field they own on every call.

use std::{
    fmt::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use rand::Rng;
use serde_json::Value;

use crate::{
    lookup::{self, Code, Lookup, Registry},
    weighted::{self, WeightedSampler},
};

/// One sampled user agent: codes for name, os, os name, device, os major,
/// major and the full agent string.
pub type AgentEntry = [Code; 7];
/// One sampled client address: address or /16 prefix, `[lat, lon]`, then
/// codes for city, country name, country iso code and continent.
pub type ClientIpEntry = (String, [Value; 2], Code, Code, Code, Code);
/// One sampled referrer: url base code and path.
pub type ReferrerEntry = (Code, String);
/// One sampled request: url base code, path, bytes, verb, response code and
/// http version.
pub type RequestEntry = (Code, String, Value, String, Value, Value);

/// Probability that a client address is drawn from the rare table.
pub const RARE_CLIENTIP_PROBABILITY: f64 = 0.269_736_965_199;

/// The mutable record that field groups fill in.
#[derive(Debug, Clone, Default, PartialEq)]
#[allow(missing_docs)]
pub struct EventRecord {
    pub agent: String,
    pub useragent_name: String,
    pub useragent_os: String,
    pub useragent_os_name: String,
    pub useragent_device: String,
    pub useragent_os_major: String,
    pub useragent_major: String,
    pub clientip: String,
    pub geoip_location_lat: Value,
    pub geoip_location_lon: Value,
    pub geoip_city_name: String,
    pub geoip_country_name: String,
    pub geoip_country_iso_code: String,
    pub geoip_continent_name: String,
    pub geoip_continent_code: String,
    pub referrer: String,
    pub request: String,
    pub bytes: Value,
    pub verb: String,
    pub response: Value,
    pub httpversion: String,
}

fn set(field: &mut String, value: &str) {
    field.clear();
    field.push_str(value);
}

fn set_display(field: &mut String, value: &Value) {
    field.clear();
    let _ = match value {
        Value::String(s) => field.write_str(s),
        other => write!(field, "{other}"),
    };
}

/// A group of related event fields.
pub trait FieldGroup {
    /// Overwrite every field this group owns in `record`.
    ///
    /// # Errors
    ///
    /// Returns an error if a sampled code is missing from its lookup table.
    fn add_fields<R>(&mut self, rng: &mut R, record: &mut EventRecord) -> Result<(), lookup::Error>
    where
        R: Rng + ?Sized;
}

/// Where field groups find their corpora and how they are loaded.
#[derive(Debug)]
pub struct Loader<'a, R: ?Sized> {
    /// Directory holding the `*.json.gz` corpora
    pub data_dir: &'a Path,
    /// Shared table cache
    pub registry: &'a Registry,
    /// Long-tail tuning for every weighted table
    pub config: weighted::Config,
    /// Seeds the shuffle of weighted tables, see [`Registry::weighted`]
    pub seed: Option<u64>,
    /// Picks sampler start positions
    pub rng: &'a mut R,
}

impl<R> Loader<'_, R>
where
    R: Rng + ?Sized,
{
    fn path(&self, name: &str) -> PathBuf {
        self.data_dir.join(format!("{name}.json.gz"))
    }

    fn lookup(&self, name: &str) -> Result<Arc<Lookup>, lookup::Error> {
        self.registry.lookup(&self.path(name))
    }

    fn sampler<T>(&mut self, name: &str) -> Result<WeightedSampler<T>, lookup::Error>
    where
        T: serde::de::DeserializeOwned + Send + Sync + 'static,
    {
        let path = self.path(name);
        let table = self.registry.weighted(&path, self.config, self.seed)?;
        Ok(WeightedSampler::with_random_start(table, &mut *self.rng))
    }
}

/// User agent fields
#[derive(Debug, Clone)]
pub struct Agent {
    agents: WeightedSampler<AgentEntry>,
    // name, os, os_name, device, os_major, major, agent
    lookups: [Arc<Lookup>; 7],
}

impl Agent {
    /// Load the agent corpora.
    ///
    /// # Errors
    ///
    /// Returns an error if any corpus is missing or malformed.
    pub fn load<R>(loader: &mut Loader<'_, R>) -> Result<Self, lookup::Error>
    where
        R: Rng + ?Sized,
    {
        Ok(Self {
            agents: loader.sampler("agents")?,
            lookups: [
                loader.lookup("agents_name_lookup")?,
                loader.lookup("agents_os_lookup")?,
                loader.lookup("agents_os_name_lookup")?,
                loader.lookup("agents_device_lookup")?,
                loader.lookup("agents_os_major_lookup")?,
                loader.lookup("agents_major_lookup")?,
                loader.lookup("agent_lookup")?,
            ],
        })
    }
}

impl FieldGroup for Agent {
    fn add_fields<R>(&mut self, _rng: &mut R, record: &mut EventRecord) -> Result<(), lookup::Error>
    where
        R: Rng + ?Sized,
    {
        let codes = self.agents.get_random();
        let [name, os, os_name, device, os_major, major, agent] = &self.lookups;
        set(&mut record.useragent_name, name.get(&codes[0])?);
        set(&mut record.useragent_os, os.get(&codes[1])?);
        set(&mut record.useragent_os_name, os_name.get(&codes[2])?);
        set(&mut record.useragent_device, device.get(&codes[3])?);
        set(&mut record.useragent_os_major, os_major.get(&codes[4])?);
        set(&mut record.useragent_major, major.get(&codes[5])?);
        set(&mut record.agent, agent.get(&codes[6])?);
        Ok(())
    }
}

/// Client address and geo fields
#[derive(Debug, Clone)]
pub struct ClientIp {
    common: WeightedSampler<ClientIpEntry>,
    rare: WeightedSampler<ClientIpEntry>,
    city_name: Arc<Lookup>,
    country_name: Arc<Lookup>,
    country_iso_code: Arc<Lookup>,
    continent_name: Arc<Lookup>,
    continent_code: Arc<Lookup>,
}

impl ClientIp {
    /// Load the client address corpora.
    ///
    /// # Errors
    ///
    /// Returns an error if any corpus is missing or malformed.
    pub fn load<R>(loader: &mut Loader<'_, R>) -> Result<Self, lookup::Error>
    where
        R: Rng + ?Sized,
    {
        Ok(Self {
            common: loader.sampler("clientips")?,
            rare: loader.sampler("rare_clientips")?,
            city_name: loader.lookup("clientips_city_name_lookup")?,
            country_name: loader.lookup("clientips_country_name_lookup")?,
            country_iso_code: loader.lookup("clientips_country_iso_code_lookup")?,
            continent_name: loader.lookup("clientips_continent_name_lookup")?,
            continent_code: loader.lookup("clientips_continent_code_lookup")?,
        })
    }
}

/// Fill a /16 prefix out to a full address. `r·(1−r)` peaks at 0.25 so each
/// octet lands in `[0, 255]`, clustered around the middle.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn fill_out_prefix<R>(rng: &mut R, prefix: &str, out: &mut String)
where
    R: Rng + ?Sized,
{
    let mut octet = || {
        let r: f64 = rng.random();
        (r * (1.0 - r) * 255.0 * 4.0) as u32
    };
    let (k1, k2) = (octet(), octet());
    out.clear();
    let _ = write!(out, "{prefix}.{k1}.{k2}");
}

impl FieldGroup for ClientIp {
    fn add_fields<R>(&mut self, rng: &mut R, record: &mut EventRecord) -> Result<(), lookup::Error>
    where
        R: Rng + ?Sized,
    {
        let entry = if rng.random::<f64>() < RARE_CLIENTIP_PROBABILITY {
            let entry = self.rare.get_random();
            fill_out_prefix(rng, &entry.0, &mut record.clientip);
            entry
        } else {
            let entry = self.common.get_random();
            set(&mut record.clientip, &entry.0);
            entry
        };
        let (_, [lat, lon], city, country, iso_code, continent) = entry;
        record.geoip_location_lat.clone_from(lat);
        record.geoip_location_lon.clone_from(lon);
        set(&mut record.geoip_city_name, self.city_name.get(city)?);
        set(&mut record.geoip_country_name, self.country_name.get(country)?);
        set(
            &mut record.geoip_country_iso_code,
            self.country_iso_code.get(iso_code)?,
        );
        set(
            &mut record.geoip_continent_name,
            self.continent_name.get(continent)?,
        );
        set(
            &mut record.geoip_continent_code,
            self.continent_code.get(continent)?,
        );
        Ok(())
    }
}

/// Referrer field
#[derive(Debug, Clone)]
pub struct Referrer {
    referrers: WeightedSampler<ReferrerEntry>,
    url_base: Arc<Lookup>,
}

impl Referrer {
    /// Load the referrer corpora.
    ///
    /// # Errors
    ///
    /// Returns an error if any corpus is missing or malformed.
    pub fn load<R>(loader: &mut Loader<'_, R>) -> Result<Self, lookup::Error>
    where
        R: Rng + ?Sized,
    {
        Ok(Self {
            referrers: loader.sampler("referrers")?,
            url_base: loader.lookup("referrers_url_base_lookup")?,
        })
    }
}

impl FieldGroup for Referrer {
    fn add_fields<R>(&mut self, _rng: &mut R, record: &mut EventRecord) -> Result<(), lookup::Error>
    where
        R: Rng + ?Sized,
    {
        let (base, path) = self.referrers.get_random();
        set(&mut record.referrer, self.url_base.get(base)?);
        record.referrer.push_str(path);
        Ok(())
    }
}

/// Request line fields
#[derive(Debug, Clone)]
pub struct Request {
    requests: WeightedSampler<RequestEntry>,
    url_base: Arc<Lookup>,
}

impl Request {
    /// Load the request corpora.
    ///
    /// # Errors
    ///
    /// Returns an error if any corpus is missing or malformed.
    pub fn load<R>(loader: &mut Loader<'_, R>) -> Result<Self, lookup::Error>
    where
        R: Rng + ?Sized,
    {
        Ok(Self {
            requests: loader.sampler("requests")?,
            url_base: loader.lookup("requests_url_base_lookup")?,
        })
    }
}

impl FieldGroup for Request {
    fn add_fields<R>(&mut self, _rng: &mut R, record: &mut EventRecord) -> Result<(), lookup::Error>
    where
        R: Rng + ?Sized,
    {
        let (base, path, bytes, verb, response, httpversion) = self.requests.get_random();
        set(&mut record.request, self.url_base.get(base)?);
        record.request.push_str(path);
        record.bytes.clone_from(bytes);
        set(&mut record.verb, verb);
        record.response.clone_from(response);
        set_display(&mut record.httpversion, httpversion);
        Ok(())
    }
}

/// Every field group of an access-log event
#[derive(Debug, Clone)]
pub struct Fields {
    agent: Agent,
    client_ip: ClientIp,
    referrer: Referrer,
    request: Request,
}

impl Fields {
    /// Load every field group.
    ///
    /// # Errors
    ///
    /// Returns an error if any corpus is missing or malformed.
    pub fn load<R>(loader: &mut Loader<'_, R>) -> Result<Self, lookup::Error>
    where
        R: Rng + ?Sized,
    {
        Ok(Self {
            agent: Agent::load(loader)?,
            client_ip: ClientIp::load(loader)?,
            referrer: Referrer::load(loader)?,
            request: Request::load(loader)?,
        })
    }
}

impl FieldGroup for Fields {
    fn add_fields<R>(&mut self, rng: &mut R, record: &mut EventRecord) -> Result<(), lookup::Error>
    where
        R: Rng + ?Sized,
    {
        self.agent.add_fields(rng, record)?;
        self.client_ip.add_fields(rng, record)?;
        self.referrer.add_fields(rng, record)?;
        self.request.add_fields(rng, record)
    }
}
