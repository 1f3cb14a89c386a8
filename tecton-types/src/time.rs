//! Geological time values
//!
//! Times are in Ma (millions of years ago): larger values are further in the
//! past, zero is present day.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Times closer than this compare equal.
const TIME_RESOLUTION: f64 = 1e-6;

/// A reconstruction time that can key caches.
///
/// Equality and hashing use the time quantised to [`TIME_RESOLUTION`] so that
/// values which differ only by floating-point noise hit the same cache slot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReconstructionTime(f64);

impl ReconstructionTime {
    pub const PRESENT_DAY: ReconstructionTime = ReconstructionTime(0.0);

    pub fn new(time: f64) -> Self {
        ReconstructionTime(time)
    }

    pub fn value(self) -> f64 {
        self.0
    }

    fn quantised(self) -> i64 {
        (self.0 / TIME_RESOLUTION).round() as i64
    }
}

impl From<f64> for ReconstructionTime {
    fn from(time: f64) -> Self {
        ReconstructionTime(time)
    }
}

impl PartialEq for ReconstructionTime {
    fn eq(&self, other: &Self) -> bool {
        self.quantised() == other.quantised()
    }
}

impl Eq for ReconstructionTime {}

impl Hash for ReconstructionTime {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.quantised().hash(state);
    }
}

impl PartialOrd for ReconstructionTime {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReconstructionTime {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.quantised().cmp(&other.quantised())
    }
}

impl Default for ReconstructionTime {
    fn default() -> Self {
        Self::PRESENT_DAY
    }
}

impl fmt::Display for ReconstructionTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}Ma", self.0)
    }
}

/// The period over which a feature exists.
///
/// `begin` is the older bound, `end` the younger one. Infinite bounds stand
/// for the distant past and distant future.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimePeriod {
    pub begin: f64,
    pub end: f64,
}

impl TimePeriod {
    pub fn new(begin: f64, end: f64) -> Self {
        TimePeriod { begin, end }
    }

    /// Valid for all of time.
    pub fn always() -> Self {
        TimePeriod {
            begin: f64::INFINITY,
            end: f64::NEG_INFINITY,
        }
    }

    /// Valid from `begin` until the distant future.
    pub fn since(begin: f64) -> Self {
        TimePeriod {
            begin,
            end: f64::NEG_INFINITY,
        }
    }

    pub fn contains(&self, time: ReconstructionTime) -> bool {
        let t = time.value();
        t <= self.begin + TIME_RESOLUTION && t >= self.end - TIME_RESOLUTION
    }
}

impl Default for TimePeriod {
    fn default() -> Self {
        Self::always()
    }
}

/// A closed range of times sampled at a fixed increment.
///
/// The begin time is adjusted (moved further into the past) so that the range
/// is an integral number of increments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeSpanRange {
    begin_time: ReconstructionTime,
    end_time: ReconstructionTime,
    time_increment: ReconstructionTime,
    num_time_slots: usize,
}

impl TimeSpanRange {
    /// Create a time range.
    ///
    /// # Panics
    ///
    /// Panics if `begin_time < end_time` or `time_increment <= 0`; both are
    /// programming errors in the caller.
    pub fn new(begin_time: f64, end_time: f64, time_increment: f64) -> Self {
        assert!(begin_time >= end_time, "time range begins after it ends");
        assert!(time_increment > 0.0, "time increment must be positive");

        let intervals = ((begin_time - end_time) / time_increment - TIME_RESOLUTION).ceil();
        let intervals = intervals.max(0.0) as usize;
        let adjusted_begin = end_time + intervals as f64 * time_increment;

        TimeSpanRange {
            begin_time: ReconstructionTime::new(adjusted_begin),
            end_time: ReconstructionTime::new(end_time),
            time_increment: ReconstructionTime::new(time_increment),
            num_time_slots: intervals + 1,
        }
    }

    pub fn begin_time(&self) -> ReconstructionTime {
        self.begin_time
    }

    pub fn end_time(&self) -> ReconstructionTime {
        self.end_time
    }

    pub fn time_increment(&self) -> f64 {
        self.time_increment.value()
    }

    pub fn num_time_slots(&self) -> usize {
        self.num_time_slots
    }

    /// Time of a slot; slot zero is the begin (oldest) time.
    pub fn time_slot_time(&self, slot: usize) -> ReconstructionTime {
        ReconstructionTime::new(self.begin_time.value() - slot as f64 * self.time_increment())
    }

    /// All slot times, oldest first.
    pub fn time_slots(&self) -> impl Iterator<Item = ReconstructionTime> + '_ {
        (0..self.num_time_slots).map(move |slot| self.time_slot_time(slot))
    }

    /// The slot exactly matching `time`, if any.
    pub fn time_slot(&self, time: ReconstructionTime) -> Option<usize> {
        let offset = (self.begin_time.value() - time.value()) / self.time_increment();
        let slot = offset.round();
        if slot < 0.0 || slot as usize >= self.num_time_slots {
            return None;
        }
        let slot = slot as usize;
        (self.time_slot_time(slot) == time).then_some(slot)
    }

    pub fn contains(&self, time: ReconstructionTime) -> bool {
        time <= self.begin_time && time >= self.end_time
    }
}
