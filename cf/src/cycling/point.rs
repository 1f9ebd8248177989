//! Cycle point type and arithmetic

use chrono::{DateTime, Datelike, Duration as ChronoDuration, FixedOffset, NaiveDate, TimeZone, Timelike, Utc};

use super::{CycleDuration, CycleError, CyclingMode};

/// A labelled repetition at which tasks are instantiated: an integer in
/// integer cycling mode, or an instant with a resolved UTC offset in
/// date-time mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CyclePoint {
    /// Integer cycling point (non-negative)
    Integer(i64),
    /// Date-time cycling point
    DateTime(DateTime<FixedOffset>),
}

impl CyclePoint {
    /// Parse a point string under the given cycling mode.
    ///
    /// Date-time forms accepted: `CCYYMMDDThhmm[ss]Z`, the same with a
    /// `±hhmm` offset, a bare `CCYYMMDD` (midnight UTC), and RFC 3339.
    pub fn parse(s: &str, mode: CyclingMode) -> Result<Self, CycleError> {
        let s = s.trim();
        match mode {
            CyclingMode::Integer => {
                let n: i64 = s.parse().map_err(|_| CycleError::ParsePoint(s.to_string()))?;
                if n < 0 {
                    return Err(CycleError::ParsePoint(format!("{} (negative)", s)));
                }
                Ok(Self::Integer(n))
            }
            CyclingMode::Gregorian => Self::parse_datetime(s),
        }
    }

    fn parse_datetime(s: &str) -> Result<Self, CycleError> {
        // RFC 3339 first: it is unambiguous
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Ok(Self::DateTime(dt));
        }

        for fmt in ["%Y%m%dT%H%M%S%#z", "%Y%m%dT%H%M%#z"] {
            if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
                return Ok(Self::DateTime(dt));
            }
        }

        // Zulu suffix and bare date resolve to a +00:00 offset
        let utc = FixedOffset::east_opt(0).expect("zero offset");
        if let Some(body) = s.strip_suffix('Z') {
            for fmt in ["%Y%m%dT%H%M%S", "%Y%m%dT%H%M"] {
                if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(body, fmt) {
                    return Ok(Self::DateTime(utc.from_utc_datetime(&naive)));
                }
            }
        }
        if let Ok(date) = NaiveDate::parse_from_str(s, "%Y%m%d") {
            let naive = date.and_hms_opt(0, 0, 0).ok_or_else(|| CycleError::ParsePoint(s.to_string()))?;
            return Ok(Self::DateTime(utc.from_utc_datetime(&naive)));
        }

        Err(CycleError::ParsePoint(s.to_string()))
    }

    /// Canonical string form; `parse(format(p)) == p` for every point
    pub fn format(&self) -> String {
        match self {
            Self::Integer(n) => n.to_string(),
            Self::DateTime(dt) => {
                let time_fmt = if dt.time().second() == 0 { "%Y%m%dT%H%M" } else { "%Y%m%dT%H%M%S" };
                let body = dt.format(time_fmt).to_string();
                if dt.offset().local_minus_utc() == 0 {
                    format!("{}Z", body)
                } else {
                    format!("{}{}", body, dt.format("%z"))
                }
            }
        }
    }

    /// Add a duration, honouring calendar clamp semantics
    pub fn add(&self, d: &CycleDuration) -> Result<Self, CycleError> {
        match (self, d) {
            (Self::Integer(n), CycleDuration::Integer(step)) => Ok(Self::Integer(n + step)),
            (Self::DateTime(dt), CycleDuration::Calendar { .. }) => Ok(Self::DateTime(add_calendar(*dt, d)?)),
            _ => Err(CycleError::ModeMismatch(format!(
                "cannot add {} to {}",
                d,
                self.format()
            ))),
        }
    }

    /// Subtract a duration
    pub fn sub(&self, d: &CycleDuration) -> Result<Self, CycleError> {
        self.add(&d.negated())
    }

    /// Signed difference `self - other` as a duration
    pub fn diff(&self, other: &Self) -> Result<CycleDuration, CycleError> {
        match (self, other) {
            (Self::Integer(a), Self::Integer(b)) => Ok(CycleDuration::Integer(a - b)),
            (Self::DateTime(a), Self::DateTime(b)) => {
                Ok(CycleDuration::from_seconds(a.signed_duration_since(*b).num_seconds()))
            }
            _ => Err(CycleError::ModeMismatch("cannot diff integer and date-time points".to_string())),
        }
    }

    /// The cycling mode this point belongs to
    pub fn mode(&self) -> CyclingMode {
        match self {
            Self::Integer(_) => CyclingMode::Integer,
            Self::DateTime(_) => CyclingMode::Gregorian,
        }
    }

    /// Current wall-clock time as a date-time point (UTC, second precision)
    pub fn now() -> Self {
        use chrono::Timelike;
        let now = Utc::now();
        let now = now.with_nanosecond(0).unwrap_or(now);
        Self::DateTime(now.fixed_offset())
    }
}

impl std::fmt::Display for CyclePoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.format())
    }
}

impl Ord for CyclePoint {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match (self, other) {
            (Self::Integer(a), Self::Integer(b)) => a.cmp(b),
            (Self::DateTime(a), Self::DateTime(b)) => a.cmp(b),
            // A workflow never mixes modes; order by discriminant for map keys
            (Self::Integer(_), Self::DateTime(_)) => std::cmp::Ordering::Less,
            (Self::DateTime(_), Self::Integer(_)) => std::cmp::Ordering::Greater,
        }
    }
}

impl PartialOrd for CyclePoint {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// ISO-8601 addition: years and months first (clamping the day into the
/// target month), then weeks/days, then the time components.
fn add_calendar(dt: DateTime<FixedOffset>, d: &CycleDuration) -> Result<DateTime<FixedOffset>, CycleError> {
    let CycleDuration::Calendar {
        years,
        months,
        weeks,
        days,
        hours,
        minutes,
        seconds,
        negative,
    } = *d
    else {
        return Err(CycleError::ModeMismatch("integer duration on date-time point".to_string()));
    };
    let sign: i64 = if negative { -1 } else { 1 };

    let mut out = dt;
    let total_months = sign * (years * 12 + months);
    if total_months != 0 {
        let zero_based = out.year() as i64 * 12 + (out.month0() as i64) + total_months;
        let year = zero_based.div_euclid(12);
        let month0 = zero_based.rem_euclid(12) as u32;
        let day = out.day().min(days_in_month(year as i32, month0 + 1));
        let date = NaiveDate::from_ymd_opt(year as i32, month0 + 1, day)
            .ok_or_else(|| CycleError::ParseDuration(format!("date out of range: {}", d)))?;
        let naive = date.and_time(out.time());
        out = out
            .offset()
            .from_local_datetime(&naive)
            .single()
            .ok_or_else(|| CycleError::ParseDuration(format!("ambiguous date: {}", d)))?;
    }

    let secs = sign * (weeks * 7 * 86_400 + days * 86_400 + hours * 3_600 + minutes * 60 + seconds);
    out += ChronoDuration::seconds(secs);
    Ok(out)
}

fn days_in_month(year: i32, month: u32) -> u32 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 => {
            if NaiveDate::from_ymd_opt(year, 2, 29).is_some() {
                29
            } else {
                28
            }
        }
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pt(s: &str) -> CyclePoint {
        CyclePoint::parse(s, CyclingMode::Gregorian).unwrap()
    }

    fn dur(s: &str) -> CycleDuration {
        CycleDuration::parse(s).unwrap()
    }

    #[test]
    fn test_integer_parse_format() {
        let p = CyclePoint::parse("5", CyclingMode::Integer).unwrap();
        assert_eq!(p, CyclePoint::Integer(5));
        assert_eq!(p.format(), "5");
        assert!(CyclePoint::parse("-1", CyclingMode::Integer).is_err());
        assert!(CyclePoint::parse("abc", CyclingMode::Integer).is_err());
    }

    #[test]
    fn test_datetime_parse_forms() {
        assert_eq!(pt("20260801T0000Z").format(), "20260801T0000Z");
        assert_eq!(pt("20260801").format(), "20260801T0000Z");
        assert_eq!(pt("20260801T120530Z").format(), "20260801T120530Z");
        assert_eq!(pt("2026-08-01T12:00:00Z").format(), "20260801T1200Z");
        assert_eq!(pt("20260801T0000+0530").format(), "20260801T0000+0530");
    }

    #[test]
    fn test_datetime_offset_compares_by_instant() {
        // Same instant, different offsets
        let a = pt("20260801T0000Z");
        let b = pt("20260801T0530+0530");
        assert_eq!(a.cmp(&b), std::cmp::Ordering::Equal);
    }

    #[test]
    fn test_integer_add_sub() {
        let p = CyclePoint::Integer(3);
        assert_eq!(p.add(&dur("P2")).unwrap(), CyclePoint::Integer(5));
        assert_eq!(p.sub(&dur("P1")).unwrap(), CyclePoint::Integer(2));
    }

    #[test]
    fn test_datetime_add_day_and_time() {
        let p = pt("20260801T0000Z");
        assert_eq!(p.add(&dur("P1D")).unwrap().format(), "20260802T0000Z");
        assert_eq!(p.add(&dur("PT6H")).unwrap().format(), "20260801T0600Z");
        assert_eq!(p.sub(&dur("PT30M")).unwrap().format(), "20260731T2330Z");
    }

    #[test]
    fn test_month_add_clamps_day() {
        // Jan 31 + P1M -> Feb 28 (2026 is not a leap year)
        let p = pt("20260131T0000Z");
        assert_eq!(p.add(&dur("P1M")).unwrap().format(), "20260228T0000Z");
        // Leap year
        let p = pt("20240131T0000Z");
        assert_eq!(p.add(&dur("P1M")).unwrap().format(), "20240229T0000Z");
    }

    #[test]
    fn test_year_add_clamps_leap_day() {
        let p = pt("20240229T0000Z");
        assert_eq!(p.add(&dur("P1Y")).unwrap().format(), "20250228T0000Z");
    }

    #[test]
    fn test_month_sub_across_year() {
        let p = pt("20260115T0600Z");
        assert_eq!(p.sub(&dur("P2M")).unwrap().format(), "20251115T0600Z");
    }

    #[test]
    fn test_mode_mismatch_errors() {
        let p = CyclePoint::Integer(1);
        assert!(p.add(&dur("P1D")).is_err());
        assert!(pt("20260801T0000Z").add(&dur("P1")).is_err());
        assert!(p.diff(&pt("20260801T0000Z")).is_err());
    }

    #[test]
    fn test_diff() {
        assert_eq!(
            CyclePoint::Integer(5).diff(&CyclePoint::Integer(2)).unwrap(),
            CycleDuration::Integer(3)
        );
        let d = pt("20260802T0000Z").diff(&pt("20260801T0000Z")).unwrap();
        assert_eq!(d.to_seconds(), Some(86_400));
    }

    proptest! {
        #[test]
        fn prop_integer_roundtrip(n in 0i64..1_000_000_000) {
            let p = CyclePoint::Integer(n);
            let back = CyclePoint::parse(&p.format(), CyclingMode::Integer).unwrap();
            prop_assert_eq!(p, back);
        }

        #[test]
        fn prop_datetime_roundtrip(secs in 0i64..4_102_444_800, offset_mins in -720i32..=720) {
            let offset = FixedOffset::east_opt(offset_mins * 60).unwrap();
            let dt = DateTime::<Utc>::from_timestamp(secs, 0).unwrap().with_timezone(&offset);
            let p = CyclePoint::DateTime(dt);
            let back = CyclePoint::parse(&p.format(), CyclingMode::Gregorian).unwrap();
            prop_assert_eq!(p, back);
        }
    }
}
