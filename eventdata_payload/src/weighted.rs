//! Weighted random sampling with a memory-bounded long tail.
//!
//! A [`WeightedTable`] answers "pick one of N items according to a skewed
//! frequency distribution" without computing a random number per draw. At
//! construction we materialize arrays of item indices whose frequency of
//! occurrence approximates the input weights, then draws walk those arrays
//! round-robin.
//!
//! A single array sized so that the rarest item appears at least once would
//! reach tens of millions of entries for long-tailed inputs like client
//! addresses or urls. Instead the input is split at a cutoff weight into a
//! "top" population carrying most of the mass and a "bottom" long tail, and
//! each population is materialized independently, right-sized to its own
//! least frequent member. One draw in every `cutoff_frequency` is served from
//! the bottom array, all others from the top.
//!
//! The immutable table is shared between partitions through an [`Arc`]; each
//! partition owns a [`WeightedSampler`] holding the only mutable state, the
//! round-robin cursors.

use std::{collections::BTreeMap, num::NonZeroU32, sync::Arc};

use rand::Rng;
use serde::Deserialize;
use tracing::debug;

/// Errors produced by [`WeightedTable`]
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq)]
pub enum Error {
    /// The list of weighted entries was empty
    #[error("Weighted table must contain at least one entry")]
    Empty,
    /// An entry carried a weight of zero
    #[error("Entry {position} has a weight of zero, weights must be positive")]
    ZeroWeight {
        /// The position of the offending entry in the input
        position: usize,
    },
    /// The sum of all weights does not fit in a u64
    #[error("Sum of weights overflows")]
    Overflow,
    /// The table holds more entries than can be indexed
    #[error("Weighted table holds too many entries: {0}")]
    TooManyEntries(usize),
    /// The cutoff percentage is not in `(0, 1)`
    #[error("cutoff_percent must be in the range (0, 1), got {0}")]
    CutoffPercent(f64),
}

fn default_cutoff_percent() -> f64 {
    0.01
}

fn default_cutoff_frequency() -> NonZeroU32 {
    NonZeroU32::new(100).expect("100 is non-zero")
}

/// Tuning of the long-tail split.
///
/// The defaults place roughly 1% of the weighted mass in the bottom
/// population and serve one draw in every 100 from it. Both were tuned
/// against the bundled access-log corpora; other tables may want a
/// different split.
#[derive(Debug, Deserialize, serde::Serialize, Clone, Copy, PartialEq)]
pub struct Config {
    /// Fraction of the total weighted mass that makes up the bottom
    /// population.
    #[serde(default = "default_cutoff_percent")]
    pub cutoff_percent: f64,
    /// One draw in every `cutoff_frequency` is served from the bottom
    /// population.
    #[serde(default = "default_cutoff_frequency")]
    pub cutoff_frequency: NonZeroU32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cutoff_percent: default_cutoff_percent(),
            cutoff_frequency: default_cutoff_frequency(),
        }
    }
}

impl Config {
    fn validate(&self) -> Result<(), Error> {
        if self.cutoff_percent > 0.0 && self.cutoff_percent < 1.0 {
            Ok(())
        } else {
            Err(Error::CutoffPercent(self.cutoff_percent))
        }
    }
}

#[derive(Debug)]
/// Immutable, pre-materialized weighted choices over a list of items.
pub struct WeightedTable<T> {
    items: Vec<T>,
    top: Vec<u32>,
    bottom: Vec<u32>,
    cutoff_weight: u64,
    cutoff_frequency: u32,
}

impl<T> WeightedTable<T> {
    /// Construct a new `WeightedTable` from `(weight, value)` pairs.
    ///
    /// # Errors
    ///
    /// Function will return an error if `entries` is empty, any weight is
    /// zero, the total weight overflows or `config` is out of range.
    pub fn new<R>(rng: &mut R, entries: Vec<(u64, T)>, config: Config) -> Result<Self, Error>
    where
        R: Rng + ?Sized,
    {
        config.validate()?;
        if entries.is_empty() {
            return Err(Error::Empty);
        }
        if u32::try_from(entries.len()).is_err() {
            return Err(Error::TooManyEntries(entries.len()));
        }

        let mut histogram: BTreeMap<u64, u64> = BTreeMap::new();
        let mut total: u64 = 0;
        let mut members: Vec<(u64, u32)> = Vec::with_capacity(entries.len());
        let mut items: Vec<T> = Vec::with_capacity(entries.len());
        for (position, (weight, item)) in entries.into_iter().enumerate() {
            if weight == 0 {
                return Err(Error::ZeroWeight { position });
            }
            total = total.checked_add(weight).ok_or(Error::Overflow)?;
            *histogram.entry(weight).or_default() += 1;
            #[allow(clippy::cast_possible_truncation)]
            members.push((weight, position as u32));
            items.push(item);
        }

        let cutoff_weight = cutoff_weight(&histogram, total, config.cutoff_percent);
        let (mut top, bottom): (Vec<(u64, u32)>, Vec<(u64, u32)>) =
            members.iter().copied().partition(|(weight, _)| *weight > cutoff_weight);
        if top.is_empty() {
            // Every entry sits at or below the cutoff, e.g. uniform weights.
            // Serve the whole population from both arrays.
            top.clone_from(&members);
        }

        let top = materialize(rng, &top)?;
        let bottom = materialize(rng, &bottom)?;
        debug!(
            entries = items.len(),
            cutoff_weight,
            top_choices = top.len(),
            bottom_choices = bottom.len(),
            "materialized weighted table"
        );

        Ok(Self {
            items,
            top,
            bottom,
            cutoff_weight,
            cutoff_frequency: config.cutoff_frequency.get(),
        })
    }

    /// The weight separating the bottom population (`<=`) from the top.
    #[must_use]
    pub fn cutoff_weight(&self) -> u64 {
        self.cutoff_weight
    }

    /// Number of materialized choices in the top population.
    #[must_use]
    pub fn top_len(&self) -> usize {
        self.top.len()
    }

    /// Number of materialized choices in the bottom population.
    #[must_use]
    pub fn bottom_len(&self) -> usize {
        self.bottom.len()
    }

    /// The distinct items in input order.
    #[must_use]
    pub fn items(&self) -> &[T] {
        &self.items
    }
}

/// Scan the histogram in ascending weight order, accumulating mass until it
/// exceeds `cutoff_percent` of `total`. The weight at which that happens is
/// the cutoff.
fn cutoff_weight(histogram: &BTreeMap<u64, u64>, total: u64, cutoff_percent: f64) -> u64 {
    let threshold = total as f64 * cutoff_percent;
    let mut running: u64 = 0;
    for (&weight, &frequency) in histogram {
        // weight * frequency <= total, which already fit in a u64.
        running += weight * frequency;
        if running as f64 > threshold {
            return weight;
        }
    }
    histogram.keys().next_back().copied().unwrap_or_default()
}

/// Draw `total_weight / min_weight` members with replacement, weighted by
/// cumulative sum and binary search. The least frequent member is expected
/// at least once.
fn materialize<R>(rng: &mut R, members: &[(u64, u32)]) -> Result<Vec<u32>, Error>
where
    R: Rng + ?Sized,
{
    let mut cumulative: Vec<u64> = Vec::with_capacity(members.len());
    let mut running: u64 = 0;
    let mut min_weight = u64::MAX;
    for (weight, _) in members {
        running += weight;
        min_weight = min_weight.min(*weight);
        cumulative.push(running);
    }
    if running == 0 {
        return Err(Error::Empty);
    }
    let size = usize::try_from(running / min_weight).map_err(|_| Error::Overflow)?;

    let mut choices = Vec::with_capacity(size);
    for _ in 0..size {
        let target = rng.random_range(0..running);
        let position = cumulative.partition_point(|&c| c <= target);
        choices.push(members[position].1);
    }
    Ok(choices)
}

#[derive(Debug)]
/// Per-partition cursor over a shared [`WeightedTable`].
pub struct WeightedSampler<T> {
    table: Arc<WeightedTable<T>>,
    counter: u32,
    top_cursor: usize,
    bottom_cursor: usize,
}

impl<T> Clone for WeightedSampler<T> {
    fn clone(&self) -> Self {
        Self {
            table: Arc::clone(&self.table),
            counter: self.counter,
            top_cursor: self.top_cursor,
            bottom_cursor: self.bottom_cursor,
        }
    }
}

impl<T> WeightedSampler<T> {
    /// Construct a sampler whose cursors start at the head of each array.
    #[must_use]
    pub fn new(table: Arc<WeightedTable<T>>) -> Self {
        Self {
            table,
            counter: 0,
            top_cursor: 0,
            bottom_cursor: 0,
        }
    }

    /// Construct a sampler whose cursors start at random positions. Samplers
    /// over the same table in different partitions do not walk in lockstep.
    pub fn with_random_start<R>(table: Arc<WeightedTable<T>>, rng: &mut R) -> Self
    where
        R: Rng + ?Sized,
    {
        let top_cursor = rng.random_range(0..table.top.len());
        let bottom_cursor = rng.random_range(0..table.bottom.len());
        Self {
            table,
            counter: 0,
            top_cursor,
            bottom_cursor,
        }
    }

    /// Return the next weighted choice. Never fails once constructed.
    #[inline]
    pub fn get_random(&mut self) -> &T {
        let table = &*self.table;
        self.counter = (self.counter + 1) % table.cutoff_frequency;
        let idx = if self.counter == 0 {
            let idx = table.bottom[self.bottom_cursor];
            self.bottom_cursor = (self.bottom_cursor + 1) % table.bottom.len();
            idx
        } else {
            let idx = table.top[self.top_cursor];
            self.top_cursor = (self.top_cursor + 1) % table.top.len();
            idx
        };
        &table.items[idx as usize]
    }

    /// The shared table this sampler draws from.
    #[must_use]
    pub fn table(&self) -> &Arc<WeightedTable<T>> {
        &self.table
    }
}

#[cfg(test)]
mod test {
    use std::{num::NonZeroU32, sync::Arc};

    use proptest::prelude::*;
    use rand::{SeedableRng, rngs::SmallRng};
    use rustc_hash::FxHashMap;

    use super::{Config, Error, WeightedSampler, WeightedTable};

    // 5_100 tail items of weight 1 carry just over 1% of the mass, everything
    // else lands in the top population.
    fn long_tail() -> Vec<(u64, u32)> {
        let mut entries = vec![
            (2, 0),
            (50_000, 1),
            (100_000, 2),
            (150_000, 3),
            (200_000, 4),
        ];
        for value in 100..5_200 {
            entries.push((1, value));
        }
        entries
    }

    #[test]
    fn split_at_cutoff() {
        let mut rng = SmallRng::seed_from_u64(19);
        let table = WeightedTable::new(&mut rng, long_tail(), Config::default())
            .expect("valid table");
        assert_eq!(table.cutoff_weight(), 1);
        // 500_002 / 2 and 5_100 / 1
        assert_eq!(table.top_len(), 250_001);
        assert_eq!(table.bottom_len(), 5_100);
    }

    #[test]
    fn draws_converge_to_weights() {
        let entries = long_tail();
        let total: u64 = entries.iter().map(|(w, _)| w).sum();
        let weights: FxHashMap<u32, u64> = entries.iter().map(|(w, v)| (*v, *w)).collect();

        let mut rng = SmallRng::seed_from_u64(1_024);
        let table = Arc::new(
            WeightedTable::new(&mut rng, entries, Config::default()).expect("valid table"),
        );
        let mut sampler = WeightedSampler::new(table);

        let draws: u32 = 1_000_000;
        let mut tally: FxHashMap<u32, u32> = FxHashMap::default();
        for _ in 0..draws {
            *tally.entry(*sampler.get_random()).or_default() += 1;
        }

        for value in 1..=4 {
            let expected = weights[&value] as f64 / total as f64;
            let observed = f64::from(tally[&value]) / f64::from(draws);
            let error = (observed - expected).abs() / expected;
            assert!(
                error < 0.05,
                "value {value}: expected {expected}, observed {observed}"
            );
        }

        let tail: u32 = tally
            .iter()
            .filter(|(v, _)| **v >= 100)
            .map(|(_, c)| *c)
            .sum();
        assert_eq!(tail, draws / 100);
        let expected_tail = 5_100.0 / total as f64;
        let observed_tail = f64::from(tail) / f64::from(draws);
        assert!((observed_tail - expected_tail).abs() / expected_tail < 0.05);
    }

    #[test]
    fn bottom_served_once_per_cutoff_frequency() {
        let mut rng = SmallRng::seed_from_u64(7);
        let config = Config {
            cutoff_percent: 0.01,
            cutoff_frequency: NonZeroU32::new(10).expect("non-zero"),
        };
        let table = Arc::new(WeightedTable::new(&mut rng, long_tail(), config).expect("valid"));
        let mut sampler = WeightedSampler::new(table);
        for call in 1..=1_000 {
            let value = *sampler.get_random();
            assert_eq!(call % 10 == 0, value >= 100, "call {call} drew {value}");
        }
    }

    #[test]
    fn uniform_weights_fill_both_arrays() {
        let mut rng = SmallRng::seed_from_u64(3);
        let entries: Vec<(u64, &str)> = vec![(4, "a"), (4, "b"), (4, "c")];
        let table = WeightedTable::new(&mut rng, entries, Config::default()).expect("valid");
        assert_eq!(table.top_len(), 3);
        assert_eq!(table.bottom_len(), 3);
    }

    #[test]
    fn single_entry() {
        let mut rng = SmallRng::seed_from_u64(3);
        let table = Arc::new(
            WeightedTable::new(&mut rng, vec![(17, "only")], Config::default()).expect("valid"),
        );
        let mut sampler = WeightedSampler::with_random_start(table, &mut rng);
        for _ in 0..250 {
            assert_eq!(*sampler.get_random(), "only");
        }
    }

    #[test]
    fn reject_invalid_input() {
        let mut rng = SmallRng::seed_from_u64(3);
        let empty: Vec<(u64, u8)> = Vec::new();
        assert_eq!(
            WeightedTable::new(&mut rng, empty, Config::default()).unwrap_err(),
            Error::Empty
        );
        assert_eq!(
            WeightedTable::new(&mut rng, vec![(1, 'a'), (0, 'b')], Config::default())
                .unwrap_err(),
            Error::ZeroWeight { position: 1 }
        );
        assert_eq!(
            WeightedTable::new(&mut rng, vec![(u64::MAX, 'a'), (1, 'b')], Config::default())
                .unwrap_err(),
            Error::Overflow
        );
        let config = Config {
            cutoff_percent: 1.5,
            ..Config::default()
        };
        assert_eq!(
            WeightedTable::new(&mut rng, vec![(1, 'a')], config).unwrap_err(),
            Error::CutoffPercent(1.5)
        );
    }

    // Both arrays are always populated and only ever hold valid indices; the
    // cutoff is always one of the input weights.
    proptest! {
        #[test]
        fn arrays_populated(seed: u64, weights in prop::collection::vec(1_u64..1_000, 1..50)) {
            let mut rng = SmallRng::seed_from_u64(seed);
            let entries: Vec<(u64, usize)> = weights.iter().copied().zip(0..).collect();
            let table = WeightedTable::new(&mut rng, entries, Config::default()).expect("valid");

            prop_assert!(table.top_len() >= 1);
            prop_assert!(table.bottom_len() >= 1);
            prop_assert!(weights.contains(&table.cutoff_weight()));
            for idx in table.top.iter().chain(table.bottom.iter()) {
                prop_assert!((*idx as usize) < weights.len());
            }
            for idx in &table.bottom {
                prop_assert!(weights[*idx as usize] <= table.cutoff_weight());
            }
        }
    }
}
