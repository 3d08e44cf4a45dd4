//! ISO-8601 durations (`P1Y2M3W4DT5H6M7S`).
//!
//! Years and months are calendar units: adding `P1M` to Jan 31 lands on the
//! last day of February, so the length of a duration depends on the instant it
//! is applied to. Use [`IsoDuration::add_to`] or [`IsoDuration::relative_to`]
//! instead of converting to a fixed length.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsoDuration {
    pub years: u32,
    pub months: u32,
    pub weeks: u32,
    pub days: u32,
    pub hours: u32,
    pub minutes: u32,
    pub seconds: u32,
}

impl IsoDuration {
    pub fn parse(input: &str) -> Result<Self, SchedulerError> {
        let err = |reason: &str| SchedulerError::InvalidDuration {
            input: input.to_string(),
            reason: reason.to_string(),
        };

        let rest = input
            .strip_prefix('P')
            .ok_or_else(|| err("must start with 'P'"))?;
        if rest.is_empty() {
            return Err(err("no components"));
        }

        let mut out = IsoDuration::default();
        let mut digits = String::new();
        let mut in_time = false;
        let mut time_components = 0usize;
        let mut components = 0usize;
        // Designators must appear in canonical order, each at most once.
        let mut last_rank: Option<u8> = None;

        for c in rest.chars() {
            if c.is_ascii_digit() {
                digits.push(c);
                continue;
            }
            if c == 'T' {
                if in_time || !digits.is_empty() {
                    return Err(err("misplaced 'T'"));
                }
                in_time = true;
                continue;
            }
            if digits.is_empty() {
                return Err(err("designator without a number"));
            }
            let value: u32 = digits.parse().map_err(|_| err("number out of range"))?;
            digits.clear();

            let rank = match (in_time, c) {
                (false, 'Y') => {
                    out.years = value;
                    0
                }
                (false, 'M') => {
                    out.months = value;
                    1
                }
                (false, 'W') => {
                    out.weeks = value;
                    2
                }
                (false, 'D') => {
                    out.days = value;
                    3
                }
                (true, 'H') => {
                    out.hours = value;
                    4
                }
                (true, 'M') => {
                    out.minutes = value;
                    5
                }
                (true, 'S') => {
                    out.seconds = value;
                    6
                }
                _ => return Err(err(&format!("unknown designator '{c}'"))),
            };
            if last_rank.is_some_and(|last| rank <= last) {
                return Err(err("components out of order"));
            }
            last_rank = Some(rank);
            components += 1;
            if in_time {
                time_components += 1;
            }
        }

        if !digits.is_empty() {
            return Err(err("trailing number without designator"));
        }
        if in_time && time_components == 0 {
            return Err(err("'T' without time components"));
        }
        if components == 0 {
            return Err(err("no components"));
        }
        Ok(out)
    }

    pub fn is_zero(&self) -> bool {
        *self == IsoDuration::default()
    }

    fn has_time_part(&self) -> bool {
        self.hours != 0 || self.minutes != 0 || self.seconds != 0
    }

    /// The instant `self` after `t`, saturating at the end of representable time.
    pub fn add_to(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let total_months = self.years.saturating_mul(12).saturating_add(self.months);
        let fixed = Duration::weeks(i64::from(self.weeks))
            + Duration::days(i64::from(self.days))
            + Duration::hours(i64::from(self.hours))
            + Duration::minutes(i64::from(self.minutes))
            + Duration::seconds(i64::from(self.seconds));

        t.checked_add_months(Months::new(total_months))
            .and_then(|shifted| shifted.checked_add_signed(fixed))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Length of this duration when applied at `t`.
    pub fn relative_to(&self, t: DateTime<Utc>) -> Duration {
        self.add_to(t) - t
    }
}

impl FromStr for IsoDuration {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IsoDuration::parse(s)
    }
}

impl fmt::Display for IsoDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            return write!(f, "PT0S");
        }
        write!(f, "P")?;
        for (value, unit) in [
            (self.years, 'Y'),
            (self.months, 'M'),
            (self.weeks, 'W'),
            (self.days, 'D'),
        ] {
            if value != 0 {
                write!(f, "{value}{unit}")?;
            }
        }
        if self.has_time_part() {
            write!(f, "T")?;
            for (value, unit) in [(self.hours, 'H'), (self.minutes, 'M'), (self.seconds, 'S')] {
                if value != 0 {
                    write!(f, "{value}{unit}")?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_every_component() {
        let d = IsoDuration::parse("P1Y2M3W4DT5H6M7S").unwrap();
        assert_eq!(
            d,
            IsoDuration {
                years: 1,
                months: 2,
                weeks: 3,
                days: 4,
                hours: 5,
                minutes: 6,
                seconds: 7,
            }
        );
    }

    #[test]
    fn month_and_minute_share_a_letter() {
        let d = IsoDuration::parse("P1MT1M").unwrap();
        assert_eq!(d.months, 1);
        assert_eq!(d.minutes, 1);
    }

    #[test]
    fn rejects_malformed_input() {
        for bad in ["", "P", "PT", "1D", "P1", "P1X", "PT1D", "P1DT", "P1D2Y", "P1H", "PTT1S", "P1DD"] {
            assert!(IsoDuration::parse(bad).is_err(), "{bad:?} should not parse");
        }
    }

    #[test]
    fn relative_length_of_fixed_components() {
        let d = IsoDuration::parse("P1DT10M10S").unwrap();
        let now = Utc::now();
        assert_eq!(
            d.relative_to(now),
            Duration::hours(24) + Duration::minutes(10) + Duration::seconds(10)
        );
    }

    #[test]
    fn months_clamp_to_end_of_month() {
        let jan31 = Utc.with_ymd_and_hms(2024, 1, 31, 12, 0, 0).unwrap();
        let d = IsoDuration::parse("P1M").unwrap();
        assert_eq!(d.add_to(jan31), Utc.with_ymd_and_hms(2024, 2, 29, 12, 0, 0).unwrap());
    }

    #[test]
    fn month_length_depends_on_start() {
        let d = IsoDuration::parse("P1M").unwrap();
        let feb = Utc.with_ymd_and_hms(2023, 2, 1, 0, 0, 0).unwrap();
        let mar = Utc.with_ymd_and_hms(2023, 3, 1, 0, 0, 0).unwrap();
        assert_eq!(d.relative_to(feb), Duration::days(28));
        assert_eq!(d.relative_to(mar), Duration::days(31));
    }

    #[test]
    fn display_is_canonical() {
        assert_eq!(IsoDuration::parse("PT2H").unwrap().to_string(), "PT2H");
        assert_eq!(IsoDuration::parse("P1DT10M10S").unwrap().to_string(), "P1DT10M10S");
        assert_eq!(IsoDuration::parse("P0D").unwrap().to_string(), "PT0S");
    }

    #[test]
    fn zero_components_are_zero() {
        assert!(IsoDuration::parse("PT0S").unwrap().is_zero());
        assert!(!IsoDuration::parse("PT1S").unwrap().is_zero());
    }
}
