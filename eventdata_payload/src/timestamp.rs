//! Simulated event time.
//!
//! A [`TimestampClock`] turns a logical starting point into a stream of
//! timestamps. Three modes exist:
//!
//! * open relative (`now`, `now-1h`): every timestamp is the wall clock plus
//!   a fixed offset.
//! * open absolute (`2019-01-05 15:00:00`): timestamps start at the given
//!   instant and advance with the wall clock, scaled by an acceleration
//!   factor.
//! * closed interval (`end_point` present): every timestamp is an
//!   independent, uniformly random instant between the two points. These are
//!   not monotonic.
//!
//! Formatting is the dominant cost at millions of events per run. The clock
//! formats the full ISO-8601 string once and serves the `yyyy`/`mm`/`dd`/`hh`
//! components used in index names as substrings of it. Within a bulk only
//! the sub-second part is advanced, see [`TimestampClock::simulate_tick`].

use std::fmt::Write;

use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use time::{Date, Duration, Month, OffsetDateTime, PrimitiveDateTime, Time, macros::datetime};

/// Raised when a starting, end or offset point does not follow the supported
/// grammar, or resolves outside of years 0000 to 9999.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid time format: {0}")]
pub struct TimeParsingError(pub String);

/// Errors produced by [`TimestampClock`] construction
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// See [`TimeParsingError`]
    #[error(transparent)]
    Parsing(#[from] TimeParsingError),
    /// Timestamps would stand still, run backwards or overflow
    #[error("acceleration_factor must be positive and finite, got {0}")]
    AccelerationFactor(f64),
}

// Index names slice the formatted year as exactly four digits.
const EARLIEST: OffsetDateTime = datetime!(0000-01-01 00:00:00 UTC);
const LATEST: OffsetDateTime = datetime!(9999-12-31 23:59:59.999 UTC);

/// `at + delta`, saturating at the first and last representable instants.
fn offset_by(at: OffsetDateTime, delta: Duration) -> OffsetDateTime {
    match at.checked_add(delta) {
        Some(at) => at.clamp(EARLIEST, LATEST),
        None if delta.is_negative() => EARLIEST,
        None => LATEST,
    }
}

/// The source of wall-clock time for a [`TimestampClock`].
pub trait WallClock {
    /// The current instant, in UTC.
    fn now(&mut self) -> OffsetDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
/// A clock that operates with respect to real-clock time.
pub struct RealClock;

impl WallClock for RealClock {
    fn now(&mut self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

static RELATIVE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^now([+-]\d+)([hmd])$").expect("Invalid regex pattern provided"));
static OFFSET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([+-]?\d+)([hmd])$").expect("Invalid regex pattern provided"));
static DATE_TIME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{4})\D(\d{2})\D(\d{2})\D(\d{2})\D(\d{2})\D(\d{2})$")
        .expect("Invalid regex pattern provided")
});
static DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{4})\D(\d{2})\D(\d{2})$").expect("Invalid regex pattern provided"));

/// A parsed starting or end point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Point {
    /// The wall clock shifted by `offset`
    Relative {
        /// Signed shift from the wall clock
        offset: Duration,
    },
    /// A fixed instant
    Absolute {
        /// The instant, in UTC
        at: OffsetDateTime,
    },
}

impl Point {
    /// Parse a point from its textual form.
    ///
    /// Supported, in order of precedence: `now`, `now[+-]<int><m|h|d>`,
    /// `YYYY?MM?DD?HH?MM?SS` and `YYYY?MM?DD` where `?` is any non-digit
    /// separator. Absolute points are UTC.
    ///
    /// # Errors
    ///
    /// Returns [`TimeParsingError`] carrying `input` if no form matches or
    /// the matched date does not exist.
    pub fn parse(input: &str) -> Result<Self, TimeParsingError> {
        let err = || TimeParsingError(input.to_string());

        if input == "now" {
            return Ok(Point::Relative {
                offset: Duration::ZERO,
            });
        }
        if let Some(caps) = RELATIVE.captures(input) {
            let offset = duration_of(&caps[1], &caps[2]).ok_or_else(err)?;
            return Ok(Point::Relative { offset });
        }
        if let Some(caps) = DATE_TIME.captures(input) {
            let date = date_of(&caps[1], &caps[2], &caps[3]).ok_or_else(err)?;
            let time = Time::from_hms(
                caps[4].parse().map_err(|_| err())?,
                caps[5].parse().map_err(|_| err())?,
                caps[6].parse().map_err(|_| err())?,
            )
            .map_err(|_| err())?;
            return Ok(Point::Absolute {
                at: PrimitiveDateTime::new(date, time).assume_utc(),
            });
        }
        if let Some(caps) = DATE.captures(input) {
            let date = date_of(&caps[1], &caps[2], &caps[3]).ok_or_else(err)?;
            return Ok(Point::Absolute {
                at: PrimitiveDateTime::new(date, Time::MIDNIGHT).assume_utc(),
            });
        }
        Err(err())
    }

    fn resolve(&self, now: OffsetDateTime) -> OffsetDateTime {
        match self {
            Point::Relative { offset } => offset_by(now, *offset),
            Point::Absolute { at } => *at,
        }
    }

    fn shift(&mut self, delta: Duration) {
        match self {
            Point::Relative { offset } => *offset = offset.saturating_add(delta),
            Point::Absolute { at } => *at = offset_by(*at, delta),
        }
    }

    /// Parse `input` and require it to resolve against `now` to a four
    /// digit year.
    fn parse_within(input: &str, now: OffsetDateTime) -> Result<Self, TimeParsingError> {
        let point = Self::parse(input)?;
        let at = match point {
            Point::Relative { offset } => now.checked_add(offset),
            Point::Absolute { at } => Some(at),
        };
        match at {
            Some(at) if (EARLIEST..=LATEST).contains(&at) => Ok(point),
            _ => Err(TimeParsingError(input.to_string())),
        }
    }
}

/// Parse a bare signed offset like `-1d` or `+30m`.
///
/// # Errors
///
/// Returns [`TimeParsingError`] if `input` is not `[+-]<int><m|h|d>`.
pub fn parse_offset(input: &str) -> Result<Duration, TimeParsingError> {
    OFFSET
        .captures(input)
        .and_then(|caps| duration_of(&caps[1], &caps[2]))
        .ok_or_else(|| TimeParsingError(input.to_string()))
}

fn duration_of(amount: &str, unit: &str) -> Option<Duration> {
    let amount: i64 = amount.parse().ok()?;
    let seconds_per_unit = match unit {
        "m" => 60,
        "h" => 3_600,
        "d" => 86_400,
        _ => return None,
    };
    amount.checked_mul(seconds_per_unit).map(Duration::seconds)
}

fn date_of(year: &str, month: &str, day: &str) -> Option<Date> {
    let month: u8 = month.parse().ok()?;
    Date::from_calendar_date(
        year.parse().ok()?,
        Month::try_from(month).ok()?,
        day.parse().ok()?,
    )
    .ok()
}

/// A formatted timestamp with pre-sliced components for index names.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TimestampStruct {
    iso: String,
}

impl TimestampStruct {
    /// `YYYY-MM-DDTHH:MM:SS.mmmZ`
    #[must_use]
    pub fn iso(&self) -> &str {
        &self.iso
    }
    /// Four digit year
    #[must_use]
    pub fn yyyy(&self) -> &str {
        &self.iso[..4]
    }
    /// Two digit year
    #[must_use]
    pub fn yy(&self) -> &str {
        &self.iso[2..4]
    }
    /// Two digit month
    #[must_use]
    pub fn mm(&self) -> &str {
        &self.iso[5..7]
    }
    /// Two digit day of month
    #[must_use]
    pub fn dd(&self) -> &str {
        &self.iso[8..10]
    }
    /// Two digit hour of day
    #[must_use]
    pub fn hh(&self) -> &str {
        &self.iso[11..13]
    }

    // Plain integer formatting is considerably cheaper than a general date
    // formatter and the prefix is reused by `simulate_tick`.
    fn format(&mut self, dt: OffsetDateTime) {
        self.iso.clear();
        let _ = write!(
            self.iso,
            "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:03}Z",
            dt.year(),
            u8::from(dt.month()),
            dt.day(),
            dt.hour(),
            dt.minute(),
            dt.second(),
            dt.millisecond()
        );
    }

    fn set_millis(&mut self, millis: u32) {
        // Keep `YYYY-MM-DDTHH:MM:SS.` and rewrite `mmmZ`.
        self.iso.truncate(20);
        let _ = write!(self.iso, "{millis:03}Z");
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Mode {
    Relative {
        offset: Duration,
    },
    Accelerated {
        logical_start: OffsetDateTime,
        anchor: OffsetDateTime,
        acceleration_factor: f64,
    },
    Interval {
        start: Point,
        end: Point,
    },
}

/// Deterministic, skippable source of simulated event timestamps.
#[derive(Debug)]
pub struct TimestampClock<C = RealClock> {
    mode: Mode,
    shift: Duration,
    clock: C,
    current: TimestampStruct,
    /// Microseconds since the start of the second of the last full
    /// recomputation.
    base_micros: f64,
    simulated_micros: f64,
}

impl TimestampClock<RealClock> {
    /// Create a new [`TimestampClock`] driven by real wall-clock time.
    ///
    /// # Errors
    ///
    /// See [`TimestampClock::with_clock`].
    pub fn new(
        starting_point: &str,
        end_point: Option<&str>,
        acceleration_factor: f64,
    ) -> Result<Self, Error> {
        Self::with_clock(starting_point, end_point, acceleration_factor, RealClock)
    }
}

impl<C> TimestampClock<C>
where
    C: WallClock,
{
    /// Create a new [`TimestampClock`] reading wall-clock time from `clock`.
    ///
    /// With an `end_point` the clock samples the closed interval and
    /// `acceleration_factor` is unused. Otherwise a relative starting point
    /// tracks the wall clock and an absolute one advances from its instant,
    /// anchored at the time of this call. The wall clock is read exactly
    /// once here.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Parsing`] if either point is malformed or resolves
    /// outside of years 0000 to 9999 now, and [`Error::AccelerationFactor`]
    /// unless `acceleration_factor` is finite and positive.
    pub fn with_clock(
        starting_point: &str,
        end_point: Option<&str>,
        acceleration_factor: f64,
        mut clock: C,
    ) -> Result<Self, Error> {
        if !acceleration_factor.is_finite() || acceleration_factor <= 0.0 {
            return Err(Error::AccelerationFactor(acceleration_factor));
        }
        let now = clock.now();
        let start = Point::parse_within(starting_point, now)?;
        let mode = match end_point {
            Some(end_point) => Mode::Interval {
                start,
                end: Point::parse_within(end_point, now)?,
            },
            None => match start {
                Point::Relative { offset } => Mode::Relative { offset },
                Point::Absolute { at } => Mode::Accelerated {
                    logical_start: at,
                    anchor: now,
                    acceleration_factor,
                },
            },
        };
        Ok(Self {
            mode,
            shift: Duration::ZERO,
            clock,
            current: TimestampStruct::default(),
            base_micros: 0.0,
            simulated_micros: 0.0,
        })
    }

    /// Apply a constant shift to every generated instant.
    #[must_use]
    pub fn with_shift(mut self, shift: Duration) -> Self {
        self.shift = shift;
        self
    }

    /// True if timestamps are drawn at random from a closed interval.
    #[must_use]
    pub fn is_interval(&self) -> bool {
        matches!(self.mode, Mode::Interval { .. })
    }

    /// Compute a fresh timestamp. `rng` is consulted only in interval mode.
    pub fn next_timestamp<R>(&mut self, rng: &mut R) -> &TimestampStruct
    where
        R: Rng + ?Sized,
    {
        let fraction = if self.is_interval() {
            rng.random::<f64>()
        } else {
            0.0
        };
        self.timestamp_at(fraction)
    }

    /// Compute a fresh timestamp, placing interval-mode timestamps `fraction`
    /// of the way through the interval as resolved against the wall clock
    /// now. Open modes ignore `fraction`. Instants past either end of year
    /// 0000 to 9999 saturate there.
    pub(crate) fn timestamp_at(&mut self, fraction: f64) -> &TimestampStruct {
        let instant = match self.mode {
            Mode::Relative { offset } => offset_by(self.clock.now(), offset),
            Mode::Accelerated {
                logical_start,
                anchor,
                acceleration_factor,
            } => {
                let elapsed = (self.clock.now() - anchor).as_seconds_f64() * acceleration_factor;
                offset_by(logical_start, Duration::saturating_seconds_f64(elapsed))
            }
            Mode::Interval { start, end } => {
                let now = self.clock.now();
                let (a, b) = (start.resolve(now), end.resolve(now));
                let (low, high) = if a <= b { (a, b) } else { (b, a) };
                low + (high - low) * fraction
            }
        };
        self.set_instant(instant);
        &self.current
    }

    /// Advance the sub-second part of the last full timestamp by `micros`
    /// microseconds, leaving everything down to the second untouched. The
    /// sub-second part saturates at the end of the second so timestamps
    /// never run backwards.
    pub fn simulate_tick(&mut self, micros: f64) -> &TimestampStruct {
        self.simulated_micros += micros.max(0.0);
        let sub_second = (self.base_micros + self.simulated_micros).min(999_999.0);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        self.current.set_millis((sub_second / 1_000.0) as u32);
        &self.current
    }

    /// Jump the logical time forward by `delta` without waiting on the wall
    /// clock. The real-time anchor resets to now so accelerated elapsed time
    /// resumes from the new logical start.
    pub fn skip(&mut self, delta: Duration) {
        match &mut self.mode {
            Mode::Relative { offset } => *offset = offset.saturating_add(delta),
            Mode::Accelerated {
                logical_start,
                anchor,
                ..
            } => {
                *logical_start = offset_by(*logical_start, delta);
                *anchor = self.clock.now();
            }
            Mode::Interval { start, end } => {
                start.shift(delta);
                end.shift(delta);
            }
        }
    }

    /// The last computed timestamp.
    #[must_use]
    pub fn current(&self) -> &TimestampStruct {
        &self.current
    }

    fn set_instant(&mut self, instant: OffsetDateTime) {
        let instant = offset_by(instant, self.shift);
        self.current.format(instant);
        self.base_micros = f64::from(instant.microsecond());
        self.simulated_micros = 0.0;
    }
}
