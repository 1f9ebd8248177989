//! Cycle durations: integer steps and ISO-8601 periods

use super::CycleError;

/// A duration between cycle points: a bare integer step in integer cycling
/// mode, or an ISO-8601 period in date-time mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CycleDuration {
    /// Integer-mode step, e.g. `P1` = one point
    Integer(i64),
    /// Calendar period; components are non-negative, `negative` carries the sign
    Calendar {
        years: i64,
        months: i64,
        weeks: i64,
        days: i64,
        hours: i64,
        minutes: i64,
        seconds: i64,
        negative: bool,
    },
}

impl CycleDuration {
    /// Parse an ISO-8601 duration. A bare `P<n>` with no designator is the
    /// integer-mode step `n`.
    pub fn parse(s: &str) -> Result<Self, CycleError> {
        let raw = s.trim();
        let err = || CycleError::ParseDuration(raw.to_string());

        let (negative, body) = match raw.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };
        let (explicit_plus, body) = match body.strip_prefix('+') {
            Some(rest) => (true, rest),
            None => (false, body),
        };
        if negative && explicit_plus {
            return Err(err());
        }
        let body = body.strip_prefix(['P', 'p']).ok_or_else(err)?;
        if body.is_empty() {
            return Err(err());
        }

        // Bare integer step: P1, P12
        if body.bytes().all(|b| b.is_ascii_digit()) {
            let n: i64 = body.parse().map_err(|_| err())?;
            return Ok(Self::Integer(if negative { -n } else { n }));
        }

        let (date_part, time_part) = match body.split_once(['T', 't']) {
            Some((d, t)) => (d, Some(t)),
            None => (body, None),
        };

        let mut fields = [0i64; 7]; // Y M W D h m s
        let mut any = false;

        let mut scan = |part: &str, designators: &[(char, usize)]| -> Result<(), CycleError> {
            let mut num = String::new();
            let mut last_idx: Option<usize> = None;
            for ch in part.chars() {
                if ch.is_ascii_digit() {
                    num.push(ch);
                    continue;
                }
                let (_, idx) = designators
                    .iter()
                    .find(|(d, _)| d.eq_ignore_ascii_case(&ch))
                    .ok_or_else(err)?;
                if num.is_empty() {
                    return Err(err());
                }
                // Designators must appear in ISO order, once each
                if let Some(prev) = last_idx {
                    if *idx <= prev {
                        return Err(err());
                    }
                }
                fields[*idx] = num.parse().map_err(|_| err())?;
                num.clear();
                last_idx = Some(*idx);
                any = true;
            }
            if !num.is_empty() {
                return Err(err());
            }
            Ok(())
        };

        scan(date_part, &[('Y', 0), ('M', 1), ('W', 2), ('D', 3)])?;
        if let Some(t) = time_part {
            if t.is_empty() {
                return Err(err());
            }
            scan(t, &[('H', 4), ('M', 5), ('S', 6)])?;
        }
        if !any {
            return Err(err());
        }

        Ok(Self::Calendar {
            years: fields[0],
            months: fields[1],
            weeks: fields[2],
            days: fields[3],
            hours: fields[4],
            minutes: fields[5],
            seconds: fields[6],
            negative,
        })
    }

    /// Build a pure-seconds calendar duration
    pub fn from_seconds(secs: i64) -> Self {
        Self::Calendar {
            years: 0,
            months: 0,
            weeks: 0,
            days: 0,
            hours: 0,
            minutes: 0,
            seconds: secs.unsigned_abs() as i64,
            negative: secs < 0,
        }
    }

    /// The same duration with the opposite sign
    pub fn negated(&self) -> Self {
        match *self {
            Self::Integer(n) => Self::Integer(-n),
            Self::Calendar {
                years,
                months,
                weeks,
                days,
                hours,
                minutes,
                seconds,
                negative,
            } => Self::Calendar {
                years,
                months,
                weeks,
                days,
                hours,
                minutes,
                seconds,
                negative: !negative,
            },
        }
    }

    /// True if this is a zero duration
    pub fn is_zero(&self) -> bool {
        match *self {
            Self::Integer(n) => n == 0,
            Self::Calendar {
                years,
                months,
                weeks,
                days,
                hours,
                minutes,
                seconds,
                ..
            } => years == 0 && months == 0 && weeks == 0 && days == 0 && hours == 0 && minutes == 0 && seconds == 0,
        }
    }

    /// True if the duration is negative
    pub fn is_negative(&self) -> bool {
        match *self {
            Self::Integer(n) => n < 0,
            Self::Calendar { negative, .. } => negative && !self.is_zero(),
        }
    }

    /// Exact length in seconds, when the duration has no calendar-variable
    /// components (years/months) and is not an integer step
    pub fn to_seconds(&self) -> Option<i64> {
        match *self {
            Self::Integer(_) => None,
            Self::Calendar {
                years,
                months,
                weeks,
                days,
                hours,
                minutes,
                seconds,
                negative,
            } => {
                if years != 0 || months != 0 {
                    return None;
                }
                let total = weeks * 7 * 86_400 + days * 86_400 + hours * 3_600 + minutes * 60 + seconds;
                Some(if negative { -total } else { total })
            }
        }
    }

    /// Wall-clock interpretation for timers; calendar-variable components
    /// use nominal lengths (P1M = 30 days, P1Y = 365 days)
    pub fn to_std(&self) -> Option<std::time::Duration> {
        let secs = match *self {
            Self::Integer(_) => return None,
            Self::Calendar {
                years,
                months,
                weeks,
                days,
                hours,
                minutes,
                seconds,
                negative,
            } => {
                let exact = Self::Calendar {
                    years: 0,
                    months: 0,
                    weeks,
                    days,
                    hours,
                    minutes,
                    seconds,
                    negative,
                }
                .to_seconds()?;
                exact + months * 30 * 86_400 + years * 365 * 86_400
            }
        };
        if self.is_negative() || secs < 0 {
            return None;
        }
        Some(std::time::Duration::from_secs(secs as u64))
    }
}

impl std::fmt::Display for CycleDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::Integer(n) => {
                if n < 0 {
                    write!(f, "-P{}", -n)
                } else {
                    write!(f, "P{}", n)
                }
            }
            Self::Calendar {
                years,
                months,
                weeks,
                days,
                hours,
                minutes,
                seconds,
                negative,
            } => {
                if negative && !self.is_zero() {
                    write!(f, "-")?;
                }
                write!(f, "P")?;
                if self.is_zero() {
                    return write!(f, "T0S");
                }
                for (v, d) in [(years, 'Y'), (months, 'M'), (weeks, 'W'), (days, 'D')] {
                    if v != 0 {
                        write!(f, "{}{}", v, d)?;
                    }
                }
                if hours != 0 || minutes != 0 || seconds != 0 {
                    write!(f, "T")?;
                    for (v, d) in [(hours, 'H'), (minutes, 'M'), (seconds, 'S')] {
                        if v != 0 {
                            write!(f, "{}{}", v, d)?;
                        }
                    }
                }
                Ok(())
            }
        }
    }
}

/// Parse a comma-separated delay list with multiplier syntax, e.g.
/// `PT2S, 6*PT10S, PT1M`. Used for retry delays and polling schedules.
pub fn parse_delays(s: &str) -> Result<Vec<CycleDuration>, CycleError> {
    let mut out = Vec::new();
    for item in s.split(',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let (count, dur) = match item.split_once('*') {
            Some((n, d)) => {
                let n: usize = n
                    .trim()
                    .parse()
                    .map_err(|_| CycleError::ParseDuration(item.to_string()))?;
                (n, d.trim())
            }
            None => (1, item),
        };
        let parsed = CycleDuration::parse(dur)?;
        out.extend(std::iter::repeat(parsed).take(count));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_integer_step() {
        assert_eq!(CycleDuration::parse("P1").unwrap(), CycleDuration::Integer(1));
        assert_eq!(CycleDuration::parse("P12").unwrap(), CycleDuration::Integer(12));
        assert_eq!(CycleDuration::parse("-P2").unwrap(), CycleDuration::Integer(-2));
    }

    #[test]
    fn test_parse_calendar_forms() {
        let d = CycleDuration::parse("P1DT6H30M").unwrap();
        assert_eq!(d.to_seconds(), Some(86_400 + 6 * 3_600 + 30 * 60));

        let d = CycleDuration::parse("PT15S").unwrap();
        assert_eq!(d.to_seconds(), Some(15));

        let d = CycleDuration::parse("P2W").unwrap();
        assert_eq!(d.to_seconds(), Some(14 * 86_400));

        let d = CycleDuration::parse("P1Y2M").unwrap();
        assert_eq!(d.to_seconds(), None);
        assert_eq!(d.to_string(), "P1Y2M");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["", "P", "PT", "1D", "P1X", "PD", "P1D2H", "P-1D"] {
            assert!(CycleDuration::parse(bad).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_month_designator_disambiguation() {
        // M before T is months; after T is minutes
        let d = CycleDuration::parse("P1M").unwrap();
        assert_eq!(d.to_seconds(), None);
        let d = CycleDuration::parse("PT1M").unwrap();
        assert_eq!(d.to_seconds(), Some(60));
    }

    #[test]
    fn test_display_roundtrip() {
        for s in ["P1", "-P3", "P1D", "PT6H", "P1Y2M", "P1DT30M", "PT0S"] {
            let d = CycleDuration::parse(s).unwrap();
            let back = CycleDuration::parse(&d.to_string()).unwrap();
            assert_eq!(d, back, "roundtrip {:?}", s);
        }
    }

    #[test]
    fn test_negation() {
        let d = CycleDuration::parse("PT1H").unwrap();
        assert_eq!(d.negated().to_seconds(), Some(-3_600));
        assert!(d.negated().is_negative());
        assert!(!d.is_negative());
    }

    #[test]
    fn test_parse_delays_multiplier() {
        let delays = parse_delays("PT2S, 3*PT10S, PT1M").unwrap();
        assert_eq!(delays.len(), 5);
        assert_eq!(delays[0].to_seconds(), Some(2));
        assert_eq!(delays[1].to_seconds(), Some(10));
        assert_eq!(delays[3].to_seconds(), Some(10));
        assert_eq!(delays[4].to_seconds(), Some(60));
    }

    #[test]
    fn test_parse_delays_empty() {
        assert!(parse_delays("").unwrap().is_empty());
    }

    #[test]
    fn test_to_std_nominal_months() {
        let d = CycleDuration::parse("P1M").unwrap();
        assert_eq!(d.to_std(), Some(std::time::Duration::from_secs(30 * 86_400)));
        assert_eq!(CycleDuration::parse("P1").unwrap().to_std(), None);
    }
}
