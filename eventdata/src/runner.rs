//! Runs event source partitions and writes their output.
//!
//! Every partition is a simulated client owning its own event source and
//! [`BulkBatcher`]. Partitions generate on the blocking pool and hand finished
//! bulk bodies to a single writer.
//!
//! ## Metrics
//!
//! `events_generated`: Documents placed into bulk requests
//! `bulks_generated`: Bulk requests built
//! `bytes_written`: Bytes of bulk bodies handed to the writer
//!
//! All metrics are labelled with the `partition` that produced them.

use std::{io, num::NonZeroUsize, sync::Arc};

use eventdata_payload::{
    BulkBatcher, Event, EventSource, RandomEvent, SampleSource, bulk::Body, lookup::Registry,
};
use metrics::counter;
use rand::{SeedableRng, rngs::StdRng};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::mpsc,
    task,
};
use tracing::{debug, info};

use crate::config::{Config, Source};

#[derive(thiserror::Error, Debug)]
/// Errors produced while running partitions
pub enum Error {
    /// Event generation failed
    #[error("Event generation failed: {0}")]
    Payload(#[from] eventdata_payload::Error),
    /// Wrapper around [`std::io::Error`].
    #[error("Io error: {0}")]
    Io(#[from] io::Error),
    /// Json encoding failed
    #[error("Json encoding failed: {0}")]
    Json(#[from] serde_json::Error),
    /// A partition task panicked
    #[error("Partition task failed: {0}")]
    Join(#[from] task::JoinError),
    /// Raw access-log lines exist only for random events
    #[error("Raw events are only available from the random_event source")]
    RawUnsupported,
}

/// Totals of a completed run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    /// Bulk requests written
    pub bulks: u64,
    /// Bytes written
    pub bytes: u64,
}

fn metric_labels(partition: usize) -> Vec<(String, String)> {
    vec![
        ("component".to_string(), "eventdata".to_string()),
        ("partition".to_string(), partition.to_string()),
    ]
}

fn partition_rng(seed: Option<u64>, partition: usize) -> StdRng {
    match seed {
        // Offset from the source's own stream so ids do not mirror events.
        Some(seed) => StdRng::seed_from_u64((partition as u64).wrapping_mul(seed).wrapping_add(1)),
        None => StdRng::from_os_rng(),
    }
}

/// Render a bulk body as it is written out, newline terminated.
///
/// # Errors
///
/// Returns an error if an array body cannot be encoded.
pub fn render(body: &Body) -> Result<Vec<u8>, serde_json::Error> {
    let mut bytes = match body {
        Body::Lines(lines) => lines.as_bytes().to_vec(),
        Body::Array(entries) => serde_json::to_vec(entries)?,
    };
    bytes.push(b'\n');
    Ok(bytes)
}

struct Partition<S> {
    batcher: BulkBatcher<S>,
    index: usize,
    max_bulks: Option<u64>,
    labels: Vec<(String, String)>,
}

impl<S> Partition<S>
where
    S: EventSource,
{
    fn new(source: S, config: &Config, index: usize) -> Result<Self, Error> {
        let batcher = BulkBatcher::new(
            source,
            config.bulk.clone(),
            index,
            partition_rng(config.seed, index),
        )?;
        Ok(Self {
            batcher,
            index,
            max_bulks: config.max_bulks,
            labels: metric_labels(index),
        })
    }

    fn spin(mut self, tx: &mpsc::Sender<Result<Vec<u8>, Error>>) -> Result<u64, Error> {
        let mut bulks = 0;
        while self.max_bulks.is_none_or(|max| bulks < max) {
            let Some(request) = self.batcher.params()? else {
                info!(partition = self.index, bulks, "partition exhausted");
                break;
            };
            let bytes = render(&request.body)?;
            counter!("events_generated", &self.labels).increment(request.bulk_size as u64);
            counter!("bulks_generated", &self.labels).increment(1);
            counter!("bytes_written", &self.labels).increment(bytes.len() as u64);
            if let Some(done) = self.batcher.percent_completed() {
                debug!(partition = self.index, percent = done * 100.0, "progress");
            }
            if tx.blocking_send(Ok(bytes)).is_err() {
                debug!(partition = self.index, "writer closed");
                break;
            }
            bulks += 1;
        }
        Ok(bulks)
    }
}

fn run_partition(
    config: &Config,
    index: usize,
    shared: Option<&SampleSource>,
    tx: &mpsc::Sender<Result<Vec<u8>, Error>>,
) -> Result<u64, Error> {
    match (&config.source, shared) {
        (Source::SampleBased(_), Some(samples)) => {
            let source = samples.partition(index, config.seed)?;
            Partition::new(source, config, index)?.spin(tx)
        }
        (Source::RandomEvent(cfg), _) => {
            let source = RandomEvent::partition(
                cfg,
                &config.data_dir,
                Registry::global(),
                config.seed,
                index,
                config.clients,
            )?;
            Partition::new(source, config, index)?.spin(tx)
        }
        (Source::SampleBased(cfg), None) => {
            let source = SampleSource::new(cfg, partition_rng(config.seed, index))?;
            Partition::new(source, config, index)?.spin(tx)
        }
    }
}

/// Run every configured partition to exhaustion, or to `max_bulks` bulk
/// requests each, writing bulk bodies to `writer`.
///
/// Returns at the first failure. Partitions still running stop once they
/// notice the writer is gone.
///
/// # Errors
///
/// Returns an error if a partition cannot be constructed, generation fails or
/// `writer` fails.
pub async fn run<W>(config: Config, mut writer: W) -> Result<Summary, Error>
where
    W: AsyncWrite + Unpin,
{
    let clients = config.clients.get();
    // Sample files are loaded once and shared by every partition.
    let shared = match &config.source {
        Source::SampleBased(cfg) => {
            let cfg = cfg.clone();
            let rng = partition_rng(config.seed, 0);
            Some(Arc::new(
                task::spawn_blocking(move || SampleSource::new(&cfg, rng)).await??,
            ))
        }
        Source::RandomEvent(_) => None,
    };

    let config = Arc::new(config);
    let (tx, mut rx) = mpsc::channel(clients.saturating_mul(2));
    let mut handles = Vec::with_capacity(clients);
    for index in 0..clients {
        let config = Arc::clone(&config);
        let shared = shared.clone();
        let tx = tx.clone();
        handles.push(task::spawn_blocking(move || {
            match run_partition(&config, index, shared.as_deref(), &tx) {
                Ok(bulks) => bulks,
                Err(err) => {
                    // The writer may be gone already, the error is then moot.
                    let _ = tx.blocking_send(Err(err));
                    0
                }
            }
        }));
    }
    drop(tx);
    info!(clients, "partitions started");

    let mut summary = Summary::default();
    while let Some(bytes) = rx.recv().await {
        let bytes = bytes?;
        writer.write_all(&bytes).await?;
        summary.bulks += 1;
        summary.bytes += bytes.len() as u64;
    }
    writer.flush().await?;
    for handle in handles {
        handle.await?;
    }
    info!(bulks = summary.bulks, bytes = summary.bytes, "run complete");
    Ok(summary)
}

/// Construct the first partition's source and [`BulkBatcher`] without
/// generating anything, surfacing the errors a run would fail with at start.
///
/// # Errors
///
/// Returns an error if a time point, volume, id setting or corpus of the
/// configuration is invalid.
pub fn check(config: &Config) -> Result<(), Error> {
    match &config.source {
        Source::RandomEvent(cfg) => {
            let source = RandomEvent::partition(
                cfg,
                &config.data_dir,
                &Registry::default(),
                config.seed,
                0,
                config.clients,
            )?;
            Partition::new(source, config, 0)?;
        }
        Source::SampleBased(cfg) => {
            let source = SampleSource::new(cfg, partition_rng(config.seed, 0))?;
            Partition::new(source, config, 0)?;
        }
    }
    debug!("first partition constructed");
    Ok(())
}

fn documents<S, W, F>(
    source: &mut S,
    bulk_size: NonZeroUsize,
    count: u64,
    out: &mut W,
    mut line: F,
) -> Result<u64, Error>
where
    S: EventSource,
    W: io::Write,
    F: FnMut(&S, Event) -> Result<String, Error>,
{
    let mut written = 0;
    while written < count {
        if written % bulk_size.get() as u64 == 0 {
            source.start_bulk(bulk_size)?;
        }
        let Some(event) = source.generate_event()? else {
            debug!(written, "source exhausted");
            break;
        };
        writeln!(out, "{}", line(source, event)?)?;
        written += 1;
    }
    Ok(written)
}

/// Write up to `count` documents of the first partition to `out`, one per
/// line. With `raw` the access-log line of every event is written instead of
/// the document.
///
/// # Errors
///
/// Returns an error if the source cannot be constructed or fails, `out`
/// fails, or `raw` is requested from a source without raw events.
pub fn generate<W>(config: &Config, count: u64, raw: bool, out: &mut W) -> Result<u64, Error>
where
    W: io::Write,
{
    let bulk_size = config.bulk.bulk_size;
    match &config.source {
        Source::RandomEvent(cfg) => {
            let mut source = RandomEvent::partition(
                cfg,
                &config.data_dir,
                Registry::global(),
                config.seed,
                0,
                config.clients,
            )?;
            documents(&mut source, bulk_size, count, out, |source, event| {
                if raw {
                    Ok(source.raw_event())
                } else {
                    Ok(event.document.to_json_string()?)
                }
            })
        }
        Source::SampleBased(cfg) => {
            if raw {
                return Err(Error::RawUnsupported);
            }
            let mut source = SampleSource::new(cfg, partition_rng(config.seed, 0))?;
            documents(&mut source, bulk_size, count, out, |_, event| {
                Ok(event.document.to_json_string()?)
            })
        }
    }
}
