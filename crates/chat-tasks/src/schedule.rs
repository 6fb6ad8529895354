//! When a loop fires

use crate::error::{LoopError, LoopResult};
use chrono::{DateTime, NaiveTime, Utc};
use std::time::Duration;
use tokio::time::Instant;

/// Firing schedule for a [`Loop`](crate::Loop)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    /// Fixed delay between the start of consecutive iterations
    Interval(Duration),
    /// Fixed times of day (UTC), sorted ascending
    Times(Vec<NaiveTime>),
}

impl Schedule {
    /// Fire every `interval`
    #[must_use]
    pub const fn every(interval: Duration) -> Self {
        Self::Interval(interval)
    }

    #[must_use]
    pub const fn seconds(secs: u64) -> Self {
        Self::Interval(Duration::from_secs(secs))
    }

    #[must_use]
    pub const fn minutes(mins: u64) -> Self {
        Self::Interval(Duration::from_secs(mins * 60))
    }

    #[must_use]
    pub const fn hours(hours: u64) -> Self {
        Self::Interval(Duration::from_secs(hours * 3600))
    }

    /// Fire at each time of day; duplicates are dropped
    pub fn at_times(times: impl IntoIterator<Item = NaiveTime>) -> Self {
        let mut times: Vec<NaiveTime> = times.into_iter().collect();
        times.sort_unstable();
        times.dedup();
        Self::Times(times)
    }

    /// Reject schedules that would never fire or never wait
    pub fn validate(&self) -> LoopResult<()> {
        match self {
            Self::Interval(interval) if interval.is_zero() => Err(LoopError::InvalidSchedule(
                "interval must be greater than zero".to_string(),
            )),
            Self::Times(times) if times.is_empty() => Err(LoopError::InvalidSchedule(
                "at least one time of day is required".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Deadline of the firing that follows one scheduled for `previous`.
    ///
    /// Interval schedules keep a fixed cadence; an overrunning iteration makes
    /// the next one fire immediately rather than queueing missed runs.
    pub(crate) fn next_deadline(&self, previous: Instant) -> Instant {
        let now = Instant::now();
        match self {
            Self::Interval(interval) => (previous + *interval).max(now),
            Self::Times(times) => now + until_next_time(times, Utc::now()),
        }
    }

    /// Deadline of the very first firing
    pub(crate) fn first_deadline(&self) -> Instant {
        let now = Instant::now();
        match self {
            Self::Interval(_) => now,
            Self::Times(times) => now + until_next_time(times, Utc::now()),
        }
    }
}

fn until_next_time(times: &[NaiveTime], now: DateTime<Utc>) -> Duration {
    (next_time_after(times, now) - now).to_std().unwrap_or_default()
}

/// First configured time strictly after `now`, rolling over to tomorrow
pub(crate) fn next_time_after(times: &[NaiveTime], now: DateTime<Utc>) -> DateTime<Utc> {
    let today = now.date_naive();
    let current = now.time();

    if let Some(time) = times.iter().find(|time| **time > current) {
        return today.and_time(*time).and_utc();
    }

    let first = times.first().copied().unwrap_or(NaiveTime::MIN);
    let tomorrow = today.succ_opt().unwrap_or(today);
    tomorrow.and_time(first).and_utc()
}
