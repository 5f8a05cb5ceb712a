//! Benchmarks for event composition and bulk batching.

use std::{num::NonZeroUsize, time::Duration};

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group};
use eventdata_payload::{
    BulkBatcher, EventSource, RandomEvent, bulk,
    fields::{EventRecord, FieldGroup},
    lookup,
    random_event::Config,
    timestamp::RealClock,
};
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde_json::json;

/// Fills a record without touching any corpus.
#[derive(Debug, Clone, Copy)]
struct FixedFields;

impl FieldGroup for FixedFields {
    fn add_fields<R>(&mut self, rng: &mut R, r: &mut EventRecord) -> Result<(), lookup::Error>
    where
        R: Rng + ?Sized,
    {
        r.useragent_name = "Firefox".into();
        r.useragent_os = "Linux".into();
        r.useragent_os_name = "Linux".into();
        r.useragent_device = "Other".into();
        r.useragent_os_major = "5".into();
        r.useragent_major = "115".into();
        r.agent = "Mozilla/5.0 (X11; Linux x86_64; rv:109.0) Gecko/20100101 Firefox/115.0".into();
        r.clientip = format!("10.0.{}.{}", rng.random::<u8>(), rng.random::<u8>());
        r.geoip_location_lat = json!(48.1374);
        r.geoip_location_lon = json!(11.5755);
        r.geoip_city_name = "Munich".into();
        r.geoip_country_name = "Germany".into();
        r.geoip_country_iso_code = "DE".into();
        r.geoip_continent_name = "Europe".into();
        r.geoip_continent_code = "EU".into();
        r.referrer = "https://www.example.com/".into();
        r.request = "/guide/index.html".into();
        r.bytes = json!(rng.random_range(100..100_000));
        r.verb = "GET".into();
        r.response = json!(200);
        r.httpversion = "1.1".into();
        Ok(())
    }
}

fn source(structured_documents: bool) -> RandomEvent<FixedFields, RealClock> {
    let config = Config {
        index: Some("elasticlogs-<yyyy>-<mm>-<dd>".into()),
        structured_documents,
        ..Config::default()
    };
    RandomEvent::with_parts(&config, FixedFields, RealClock, StdRng::seed_from_u64(19690716))
        .expect("failed to create source")
}

fn random_event_compose(c: &mut Criterion) {
    let mut group = c.benchmark_group("random_event_compose");
    for structured in [false, true] {
        group.throughput(Throughput::Elements(1_000));
        group.bench_with_input(
            BenchmarkId::from_parameter(structured),
            &structured,
            |b, &structured| {
                let mut source = source(structured);
                source
                    .start_bulk(NonZeroUsize::new(1_000).expect("non-zero"))
                    .expect("failed to start bulk");
                b.iter(|| {
                    for _ in 0..1_000 {
                        source.generate_event().expect("failed to generate event");
                    }
                });
            },
        );
    }
    group.finish();
}

fn bulk_params(c: &mut Criterion) {
    let mut group = c.benchmark_group("bulk_params");
    for size in &[100usize, 1_000, 5_000] {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let config = bulk::Config {
                bulk_size: NonZeroUsize::new(size).expect("non-zero"),
                id_type: eventdata_payload::id::IdType::Seq,
                ..bulk::Config::default()
            };
            let mut batcher =
                BulkBatcher::with_seed(source(false), config, 0, 19690716).expect("failed to batch");
            b.iter(|| batcher.params().expect("failed to build bulk"));
        });
    }
    group.finish();
}

criterion_group!(
    name = benches;
    config = Criterion::default().measurement_time(Duration::from_secs(30));
    targets = random_event_compose, bulk_params,
);
