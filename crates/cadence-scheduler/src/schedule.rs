use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use tracing::debug;

use crate::duration::IsoDuration;
use crate::error::{Result, SchedulerError};

/// Repeat count meaning "forever" (`R/...`).
pub const REPEAT_FOREVER: i64 = -1;

const FORMAT_HINT: &str = "should look like: R/2014-03-08T20:00:00Z/PT2H";

/// A parsed `R<repeat>/<start>/<delay>` recurrence.
///
/// Derived from the raw schedule string, which stays authoritative: the same
/// string always yields the same `Recurrence`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recurrence {
    /// Runs scheduled after the first one; [`REPEAT_FOREVER`] for no limit.
    pub times_to_repeat: i64,
    /// Absolute instant of the first run.
    pub start: DateTime<Utc>,
    /// Interval between runs. `None` only for `R0` with an empty delay.
    pub delay: Option<IsoDuration>,
}

impl Recurrence {
    /// Parse a schedule string.
    ///
    /// With `check_time` set, a start instant before `now` is rejected; this is
    /// only done when a job is created, never when reloading or rescheduling.
    pub fn parse(schedule: &str, now: DateTime<Utc>, check_time: bool) -> Result<Self> {
        let parts: Vec<&str> = schedule.split('/').collect();
        let [repeat, start, delay] = parts.as_slice() else {
            return Err(SchedulerError::InvalidSchedule(format!(
                "{schedule:?} is not formatted correctly, {FORMAT_HINT}"
            )));
        };

        let times_to_repeat = parse_repeat(repeat)?;
        let start = parse_instant(start)?;

        if check_time && start < now {
            let ago = now - start;
            return Err(SchedulerError::InvalidSchedule(format!(
                "start time {start} is {}s in the past",
                ago.num_seconds()
            )));
        }

        let delay = if times_to_repeat == 0 && delay.is_empty() {
            None
        } else {
            Some(IsoDuration::parse(delay)?)
        };

        debug!(%start, times_to_repeat, "recurrence parsed");
        Ok(Self {
            times_to_repeat,
            start,
            delay,
        })
    }

    pub fn repeats_forever(&self) -> bool {
        self.times_to_repeat == REPEAT_FOREVER
    }

    /// True once a fixed-repetition job has used up all its runs.
    ///
    /// `R<n>` allows `n + 1` runs in total: the first one plus `n` repeats.
    pub fn is_exhausted(&self, finished_runs: u64) -> bool {
        !self.repeats_forever() && (self.times_to_repeat as u64) < finished_runs
    }

    /// How long to wait from `now` before the next run.
    ///
    /// The first run honours the absolute start instant. After that the wait is
    /// recomputed from the last attempted run every time, because calendar
    /// units have no fixed length. A negative result means "run now".
    pub fn wait_duration(
        &self,
        now: DateTime<Utc>,
        last_attempted_run: Option<DateTime<Utc>>,
        resume_at_next_scheduled_time: bool,
    ) -> Duration {
        let until_start = self.start - now;
        if until_start >= Duration::zero() {
            return until_start;
        }

        if self.times_to_repeat == 0 {
            return Duration::zero();
        }
        let Some(delay) = self.delay else {
            return Duration::zero();
        };

        if resume_at_next_scheduled_time {
            return self.next_point_after(delay, now) - now;
        }

        match last_attempted_run {
            None => delay.relative_to(now),
            Some(last) => delay.add_to(last) - now,
        }
    }

    /// First point of `start + k * delay` at or after `now`.
    fn next_point_after(&self, delay: IsoDuration, now: DateTime<Utc>) -> DateTime<Utc> {
        if delay.is_zero() {
            return now;
        }

        if delay.years == 0 && delay.months == 0 {
            // Fixed length: jump straight to the right multiple.
            let step = delay.relative_to(self.start).num_milliseconds();
            let elapsed = (now - self.start).num_milliseconds();
            let steps = (elapsed + step - 1) / step;
            return self.start + Duration::milliseconds(step * steps);
        }

        let mut point = self.start;
        while point < now {
            point = delay.add_to(point);
        }
        point
    }
}

fn parse_repeat(segment: &str) -> Result<i64> {
    let count = segment.strip_prefix('R').ok_or_else(|| {
        SchedulerError::InvalidSchedule(format!("repeat segment {segment:?} must start with 'R'"))
    })?;
    if count.is_empty() {
        return Ok(REPEAT_FOREVER);
    }
    let n: i64 = count.parse().map_err(|_| {
        SchedulerError::InvalidSchedule(format!("repeat count {count:?} is not an integer"))
    })?;
    if n < 0 {
        return Err(SchedulerError::InvalidSchedule(format!(
            "repeat count {n} must not be negative"
        )));
    }
    Ok(n)
}

/// RFC 3339, or a naive `YYYY-MM-DDTHH:MM:SS[.fff]` taken as UTC.
fn parse_instant(segment: &str) -> Result<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(segment) {
        return Ok(t.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(segment, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(segment, "%Y-%m-%dT%H:%M:%S%.f"))
        .map(|naive| naive.and_utc())
        .map_err(|e| {
            SchedulerError::InvalidSchedule(format!("start time {segment:?} is invalid: {e}"))
        })
}
