//! Document identifier strategies.
//!
//! The strategy is picked once at construction. `seq` ids are
//! `<12 digit sequence>-<client id>` and may re-emit an earlier id to
//! simulate an update. Every other non-`auto` strategy derives from a random
//! uuid.

use md5::Md5;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use tracing::info;

/// Errors produced when configuring an [`IdStrategy`]
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// A probability outside of `[0, 1]`
    #[error("{name} must be in the range [0.0, 1.0], got {value}")]
    Probability {
        /// The offending parameter
        name: &'static str,
        /// Its value
        value: f64,
    },
}

/// Configured kind of document id
#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IdType {
    /// Let the search engine assign ids
    #[default]
    Auto,
    /// Sequential ids, optionally re-emitting earlier ones
    Seq,
    /// 32 lowercase hex characters of a random uuid
    Uuid,
    /// Epoch seconds in hex followed by a uuid
    EpochUuid,
    /// Epoch seconds in hex followed by the md5 of a uuid
    EpochMd5,
    /// md5 of a uuid
    Md5,
    /// sha1 of a uuid
    Sha1,
    /// sha256 of a uuid
    Sha256,
    /// sha384 of a uuid
    Sha384,
    /// sha512 of a uuid
    Sha512,
}

/// Parameters shaping an [`IdStrategy`]
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Options {
    /// Probability that a `seq` id re-emits an earlier id
    pub seq_probability: f64,
    /// Bias re-emitted `seq` ids heavily towards low ids
    pub seq_low_id_bias: bool,
    /// Probability that an epoch-prefixed id is back-dated
    pub delay_probability: f64,
    /// Seconds an epoch-prefixed id is back-dated by
    pub delay_secs: u64,
}

/// Back-dating of epoch-prefixed ids
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Delay {
    /// Probability that an id is back-dated
    pub probability: f64,
    /// Seconds subtracted from the epoch prefix
    pub secs: u64,
}

/// Digest used by [`IdStrategy::Digest`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum HashKind {
    Md5,
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

/// A document id generator
#[derive(Debug, Clone, PartialEq)]
pub enum IdStrategy {
    /// No explicit ids
    Auto,
    /// Sequential ids
    Seq {
        /// The next fresh sequence number
        next: u64,
        /// Suffix identifying the generating partition
        client_id: usize,
        /// See [`Options::seq_probability`]
        update_probability: f64,
        /// See [`Options::seq_low_id_bias`]
        low_id_bias: bool,
    },
    /// Plain uuids
    Uuid,
    /// Epoch prefixed ids, hashing the uuid if `hashed`
    Epoch {
        /// Replace the uuid with its md5
        hashed: bool,
        /// Back-dating of the epoch prefix
        delay: Option<Delay>,
    },
    /// Hex digest of a uuid
    Digest(HashKind),
}

fn probability(name: &'static str, value: f64) -> Result<f64, Error> {
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(Error::Probability { name, value })
    }
}

impl IdStrategy {
    /// Build the strategy for `id_type`, generating ids for partition
    /// `client_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if a probability in `options` is outside `[0, 1]`.
    pub fn new(id_type: IdType, client_id: usize, options: Options) -> Result<Self, Error> {
        let delay = || -> Result<Option<Delay>, Error> {
            let probability = probability("id_delay_probability", options.delay_probability)?;
            Ok((probability > 0.0).then_some(Delay {
                probability,
                secs: options.delay_secs,
            }))
        };
        Ok(match id_type {
            IdType::Auto => IdStrategy::Auto,
            IdType::Seq => {
                let update_probability =
                    probability("id_seq_probability", options.seq_probability)?;
                if options.seq_low_id_bias {
                    info!("Will use low id bias for updates");
                } else {
                    info!("Will use uniform distribution for updates");
                }
                IdStrategy::Seq {
                    next: 0,
                    client_id,
                    update_probability,
                    low_id_bias: options.seq_low_id_bias,
                }
            }
            IdType::Uuid => IdStrategy::Uuid,
            IdType::EpochUuid => IdStrategy::Epoch {
                hashed: false,
                delay: delay()?,
            },
            IdType::EpochMd5 => IdStrategy::Epoch {
                hashed: true,
                delay: delay()?,
            },
            IdType::Md5 => IdStrategy::Digest(HashKind::Md5),
            IdType::Sha1 => IdStrategy::Digest(HashKind::Sha1),
            IdType::Sha256 => IdStrategy::Digest(HashKind::Sha256),
            IdType::Sha384 => IdStrategy::Digest(HashKind::Sha384),
            IdType::Sha512 => IdStrategy::Digest(HashKind::Sha512),
        })
    }

    /// Produce the id for the next document, `None` for [`IdStrategy::Auto`].
    /// `epoch_secs` is the wall-clock time used by epoch-prefixed ids.
    pub fn next_id<R>(&mut self, rng: &mut R, epoch_secs: i64) -> Option<String>
    where
        R: Rng + ?Sized,
    {
        match self {
            IdStrategy::Auto => None,
            IdStrategy::Seq {
                next,
                client_id,
                update_probability,
                low_id_bias,
            } => {
                let id = if rng.random::<f64>() < *update_probability {
                    if *low_id_bias {
                        // r^10 crowds re-emitted ids towards zero
                        low_biased(*next, rng.random())
                    } else {
                        rng.random_range(0..=next.saturating_sub(1))
                    }
                } else {
                    let id = *next;
                    *next += 1;
                    id
                };
                Some(format!("{id:012}-{client_id}"))
            }
            IdStrategy::Uuid => Some(uuid(rng)),
            IdStrategy::Epoch { hashed, delay } => {
                let mut ts = epoch_secs;
                if let Some(delay) = delay {
                    if rng.random::<f64>() < delay.probability {
                        ts -= i64::try_from(delay.secs).unwrap_or(i64::MAX);
                    }
                }
                let mut prefix = format!("{ts:x}");
                prefix.truncate(8);
                let suffix = if *hashed {
                    format!("{:x}", Md5::digest(uuid(rng).as_bytes()))
                } else {
                    uuid(rng)
                };
                Some(prefix + &suffix)
            }
            IdStrategy::Digest(hash) => {
                let input = uuid(rng);
                let input = input.as_bytes();
                Some(match hash {
                    HashKind::Md5 => format!("{:x}", Md5::digest(input)),
                    HashKind::Sha1 => format!("{:x}", Sha1::digest(input)),
                    HashKind::Sha256 => format!("{:x}", Sha256::digest(input)),
                    HashKind::Sha384 => format!("{:x}", Sha384::digest(input)),
                    HashKind::Sha512 => format!("{:x}", Sha512::digest(input)),
                })
            }
        }
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn low_biased(next: u64, r: f64) -> u64 {
    (next as f64 * r.powi(10)) as u64
}

/// A random v4 uuid as 32 lowercase hex characters.
fn uuid<R>(rng: &mut R) -> String
where
    R: Rng + ?Sized,
{
    uuid::Builder::from_random_bytes(rng.random())
        .into_uuid()
        .simple()
        .to_string()
}
