//! Recurrence expressions over cycle points
//!
//! A recurrence enumerates a lazy, totally ordered sequence of points.
//! Supported forms (ISO-8601 repeating intervals plus workflow shorthands):
//!
//! - `R[n]/start/period` - from `start`, every `period`
//! - `R[n]/start/end` - the interval repeated; period is `end - start`
//! - `R[n]/period/end` - anchored at `end`, counting back
//! - `P...` - shorthand for `R/^/P...`
//! - `R1`, `R1/point` - a single point
//! - a bare point
//!
//! `^` and `$` anchor to the initial and final cycle point, optionally with
//! `±offset`. An exclusion set (`! point` or `! (a, b, ...)`, where an item
//! may itself be a recurrence) is subtracted from the sequence.

use super::{CycleDuration, CycleError, CyclePoint, CyclingMode};

/// Safety cap for stepping through calendar periods
const ITER_CAP: u64 = 100_000;

/// Resolution context: the workflow's initial/final points and mode
#[derive(Debug, Clone)]
pub struct RecurrenceContext {
    /// Initial cycle point (`^`)
    pub initial: CyclePoint,
    /// Final cycle point (`$`), if the workflow has one
    pub final_point: Option<CyclePoint>,
    /// Cycling mode for parsing embedded points
    pub mode: CyclingMode,
}

#[derive(Debug, Clone)]
enum Exclusion {
    Point(CyclePoint),
    Recurrence(Box<Recurrence>),
}

/// A resolved recurrence: concrete start, optional period/count/end bound,
/// and an exclusion set
#[derive(Debug, Clone)]
pub struct Recurrence {
    start: CyclePoint,
    period: Option<CycleDuration>,
    count: Option<u64>,
    end: Option<CyclePoint>,
    exclude: Vec<Exclusion>,
}

impl Recurrence {
    /// Parse a recurrence expression under `ctx`
    pub fn parse(expr: &str, ctx: &RecurrenceContext) -> Result<Self, CycleError> {
        let err = || CycleError::ParseRecurrence(expr.to_string());

        // Split off the exclusion set
        let (body, exclusions) = match expr.split_once('!') {
            Some((b, e)) => (b.trim(), Some(e.trim())),
            None => (expr.trim(), None),
        };
        if body.is_empty() {
            return Err(err());
        }

        let mut rec = Self::parse_body(body, ctx)?;

        if let Some(excl) = exclusions {
            let items: Vec<&str> = match excl.strip_prefix('(') {
                Some(rest) => {
                    let inner = rest.strip_suffix(')').ok_or_else(err)?;
                    inner.split(',').map(str::trim).collect()
                }
                None => vec![excl],
            };
            for item in items {
                if item.is_empty() {
                    return Err(err());
                }
                if item.starts_with('R') || item.starts_with('P') || item.contains('/') {
                    rec.exclude
                        .push(Exclusion::Recurrence(Box::new(Self::parse_body(item, ctx)?)));
                } else {
                    rec.exclude.push(Exclusion::Point(parse_point_spec(item, ctx)?));
                }
            }
        }

        Ok(rec)
    }

    fn parse_body(body: &str, ctx: &RecurrenceContext) -> Result<Self, CycleError> {
        let err = || CycleError::ParseRecurrence(body.to_string());

        let unbounded = |start, period| Self {
            start,
            period: Some(period),
            count: None,
            end: ctx.final_point,
            exclude: Vec::new(),
        };

        if let Some(rest) = body.strip_prefix('R') {
            let (count_str, parts_str) = match rest.split_once('/') {
                Some((c, p)) => (c, Some(p)),
                None => (rest, None),
            };
            let count: Option<u64> = if count_str.is_empty() {
                None
            } else {
                Some(count_str.parse().map_err(|_| err())?)
            };
            if count == Some(0) {
                return Err(err());
            }

            let parts: Vec<&str> = match parts_str {
                Some(p) => p.split('/').collect(),
                None => Vec::new(),
            };

            return match parts.as_slice() {
                // R1 - once at the initial point
                [] => {
                    if count != Some(1) {
                        return Err(err());
                    }
                    Ok(Self {
                        start: ctx.initial,
                        period: None,
                        count: Some(1),
                        end: None,
                        exclude: Vec::new(),
                    })
                }
                // R1/point or R/period
                [single] => {
                    if looks_like_duration(single) {
                        let period = CycleDuration::parse(single)?;
                        Ok(Self {
                            count,
                            ..unbounded(ctx.initial, period)
                        })
                    } else {
                        if count != Some(1) {
                            return Err(err());
                        }
                        Ok(Self {
                            start: parse_point_spec(single, ctx)?,
                            period: None,
                            count: Some(1),
                            end: None,
                            exclude: Vec::new(),
                        })
                    }
                }
                [a, b] => {
                    match (looks_like_duration(a), looks_like_duration(b)) {
                        // R[n]/start/period
                        (false, true) => {
                            let start = parse_point_spec(a, ctx)?;
                            let period = CycleDuration::parse(b)?;
                            Ok(Self { count, ..unbounded(start, period) })
                        }
                        // R[n]/period/end - anchored at end, counting back
                        (true, false) => {
                            let period = CycleDuration::parse(a)?;
                            let end = parse_point_spec(b, ctx)?;
                            Self::from_end(period, end, count, ctx)
                        }
                        // R[n]/start/end - period is the interval length
                        (false, false) => {
                            let start = parse_point_spec(a, ctx)?;
                            let end = parse_point_spec(b, ctx)?;
                            if end <= start {
                                return Err(err());
                            }
                            let period = end.diff(&start)?;
                            Ok(Self { count, ..unbounded(start, period) })
                        }
                        (true, true) => Err(err()),
                    }
                }
                _ => Err(err()),
            };
        }

        // Shorthand: a bare period is R/^/period
        if looks_like_duration(body) {
            let period = CycleDuration::parse(body)?;
            return Ok(unbounded(ctx.initial, period));
        }

        // A bare point is R1/point
        Ok(Self {
            start: parse_point_spec(body, ctx)?,
            period: None,
            count: Some(1),
            end: None,
            exclude: Vec::new(),
        })
    }

    /// Build the `R[n]/period/end` form by walking back from the anchor
    fn from_end(
        period: CycleDuration,
        end: CyclePoint,
        count: Option<u64>,
        ctx: &RecurrenceContext,
    ) -> Result<Self, CycleError> {
        if period.is_zero() || period.is_negative() {
            return Err(CycleError::ParseRecurrence(format!("bad period {}", period)));
        }
        let mut start = end;
        let mut n: u64 = 1;
        loop {
            if let Some(c) = count {
                if n >= c {
                    break;
                }
            }
            let prev = start.sub(&period)?;
            if prev < ctx.initial {
                break;
            }
            start = prev;
            n += 1;
            if n > ITER_CAP {
                return Err(CycleError::ParseRecurrence("recurrence too long".to_string()));
            }
        }
        Ok(Self {
            start,
            period: Some(period),
            count: Some(n),
            end: Some(end),
            exclude: Vec::new(),
        })
    }

    /// The k-th raw point of the sequence (exclusions not applied)
    fn nth(&self, k: u64) -> Result<Option<CyclePoint>, CycleError> {
        if let Some(c) = self.count {
            if k >= c {
                return Ok(None);
            }
        }
        let Some(period) = self.period else {
            return Ok(if k == 0 { Some(self.start) } else { None });
        };
        let p = self.start.add(&mul(&period, k as i64))?;
        if let Some(end) = self.end {
            if p > end {
                return Ok(None);
            }
        }
        Ok(Some(p))
    }

    fn is_excluded(&self, p: &CyclePoint) -> bool {
        self.exclude.iter().any(|e| match e {
            Exclusion::Point(x) => x == p,
            Exclusion::Recurrence(r) => r.contains(p),
        })
    }

    /// First point of the sequence, if any survives exclusion
    pub fn first_point(&self) -> Option<CyclePoint> {
        self.on_or_after_inner(&self.start)
    }

    /// First point `>= p`
    pub fn first_on_or_after(&self, p: &CyclePoint) -> Option<CyclePoint> {
        self.on_or_after_inner(p)
    }

    /// First point strictly after `p`
    pub fn next_after(&self, p: &CyclePoint) -> Option<CyclePoint> {
        let candidate = self.on_or_after_inner(p)?;
        if candidate > *p {
            Some(candidate)
        } else {
            // candidate == p: step one entry further
            self.advance_past(p)
        }
    }

    /// Whether `p` is a point of this recurrence
    pub fn contains(&self, p: &CyclePoint) -> bool {
        self.first_on_or_after(p) == Some(*p)
    }

    fn on_or_after_inner(&self, p: &CyclePoint) -> Option<CyclePoint> {
        let k = self.lowest_k_at_or_after(p)?;
        self.skip_excluded_from(k)
    }

    fn advance_past(&self, p: &CyclePoint) -> Option<CyclePoint> {
        let k = self.lowest_k_at_or_after(p)?;
        self.skip_excluded_from(k + 1)
    }

    /// Binary-search the lowest k with nth(k) >= p
    fn lowest_k_at_or_after(&self, p: &CyclePoint) -> Option<u64> {
        if *p <= self.start {
            return Some(0);
        }
        self.period?;

        // Exponential search for an upper bound
        let mut hi: u64 = 1;
        loop {
            match self.nth(hi).ok()? {
                Some(point) if point < *p => {
                    hi = hi.checked_mul(2)?;
                    if hi > ITER_CAP * 2 {
                        return None;
                    }
                }
                _ => break,
            }
        }

        let mut lo: u64 = 0;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.nth(mid).ok()? {
                Some(point) if point < *p => lo = mid + 1,
                _ => hi = mid,
            }
        }
        // lo is the lowest k not < p; it may be past the sequence end,
        // which skip_excluded_from detects via nth()
        Some(lo)
    }

    fn skip_excluded_from(&self, mut k: u64) -> Option<CyclePoint> {
        for _ in 0..ITER_CAP {
            let p = self.nth(k).ok()??;
            if !self.is_excluded(&p) {
                return Some(p);
            }
            k += 1;
        }
        None
    }
}

/// Componentwise multiple of a duration (ISO repetition semantics)
fn mul(d: &CycleDuration, k: i64) -> CycleDuration {
    match *d {
        CycleDuration::Integer(n) => CycleDuration::Integer(n * k),
        CycleDuration::Calendar {
            years,
            months,
            weeks,
            days,
            hours,
            minutes,
            seconds,
            negative,
        } => CycleDuration::Calendar {
            years: years * k,
            months: months * k,
            weeks: weeks * k,
            days: days * k,
            hours: hours * k,
            minutes: minutes * k,
            seconds: seconds * k,
            negative,
        },
    }
}

/// Distinguish a duration token from a point token
fn looks_like_duration(s: &str) -> bool {
    let s = s.trim_start_matches(['+', '-']);
    s.starts_with('P') || s.starts_with('p')
}

/// Resolve `^`, `$`, `^±offset`, `$±offset`, or a literal point
fn parse_point_spec(s: &str, ctx: &RecurrenceContext) -> Result<CyclePoint, CycleError> {
    let s = s.trim();
    let (anchor, rest) = match s.chars().next() {
        Some('^') => (Some(ctx.initial), &s[1..]),
        Some('$') => {
            let f = ctx
                .final_point
                .ok_or_else(|| CycleError::ParseRecurrence("`$` used without a final cycle point".to_string()))?;
            (Some(f), &s[1..])
        }
        _ => (None, s),
    };
    match anchor {
        Some(base) => {
            if rest.is_empty() {
                Ok(base)
            } else {
                let offset = CycleDuration::parse(rest)?;
                base.add(&offset)
            }
        }
        None => CyclePoint::parse(s, ctx.mode),
    }
}

/// First point at or after `p` common to every recurrence: merge the sorted
/// streams, keeping the maximum, until all agree.
pub fn next_common_after(recs: &[Recurrence], p: &CyclePoint) -> Option<CyclePoint> {
    if recs.is_empty() {
        return None;
    }
    let mut candidate = recs[0].next_after(p)?;
    for _ in 0..ITER_CAP {
        let mut max = candidate;
        let mut all_agree = true;
        for rec in recs {
            let q = rec.first_on_or_after(&max)?;
            if q > max {
                max = q;
                all_agree = false;
            }
        }
        if all_agree {
            return Some(max);
        }
        candidate = max;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_ctx(initial: i64, final_point: Option<i64>) -> RecurrenceContext {
        RecurrenceContext {
            initial: CyclePoint::Integer(initial),
            final_point: final_point.map(CyclePoint::Integer),
            mode: CyclingMode::Integer,
        }
    }

    fn dt_ctx(initial: &str, final_point: Option<&str>) -> RecurrenceContext {
        RecurrenceContext {
            initial: CyclePoint::parse(initial, CyclingMode::Gregorian).unwrap(),
            final_point: final_point.map(|s| CyclePoint::parse(s, CyclingMode::Gregorian).unwrap()),
            mode: CyclingMode::Gregorian,
        }
    }

    fn points(rec: &Recurrence, from: CyclePoint, n: usize) -> Vec<String> {
        let mut out = Vec::new();
        let mut p = rec.first_on_or_after(&from);
        while let Some(q) = p {
            out.push(q.format());
            if out.len() >= n {
                break;
            }
            p = rec.next_after(&q);
        }
        out
    }

    #[test]
    fn test_integer_shorthand_p1() {
        let ctx = int_ctx(1, Some(3));
        let rec = Recurrence::parse("P1", &ctx).unwrap();
        assert_eq!(points(&rec, CyclePoint::Integer(1), 10), vec!["1", "2", "3"]);
    }

    #[test]
    fn test_r1_at_initial() {
        let ctx = int_ctx(2, None);
        let rec = Recurrence::parse("R1", &ctx).unwrap();
        assert_eq!(points(&rec, CyclePoint::Integer(0), 10), vec!["2"]);
        assert!(rec.next_after(&CyclePoint::Integer(2)).is_none());
    }

    #[test]
    fn test_bounded_count() {
        let ctx = int_ctx(1, None);
        let rec = Recurrence::parse("R3/^/P2", &ctx).unwrap();
        assert_eq!(points(&rec, CyclePoint::Integer(0), 10), vec!["1", "3", "5"]);
    }

    #[test]
    fn test_datetime_daily() {
        let ctx = dt_ctx("20260801T0000Z", None);
        let rec = Recurrence::parse("P1D", &ctx).unwrap();
        assert_eq!(
            points(&rec, CyclePoint::parse("20260801T0000Z", CyclingMode::Gregorian).unwrap(), 3),
            vec!["20260801T0000Z", "20260802T0000Z", "20260803T0000Z"]
        );
    }

    #[test]
    fn test_monthly_repetition_is_componentwise() {
        // From Jan 31, the k-th point is Jan 31 + P<k>M with a single clamp
        let ctx = dt_ctx("20260131T0000Z", None);
        let rec = Recurrence::parse("P1M", &ctx).unwrap();
        let got = points(&rec, ctx.initial, 4);
        assert_eq!(got, vec!["20260131T0000Z", "20260228T0000Z", "20260331T0000Z", "20260430T0000Z"]);
    }

    #[test]
    fn test_from_end_counts_back() {
        let ctx = int_ctx(1, Some(10));
        let rec = Recurrence::parse("R/P3/10", &ctx).unwrap();
        // Anchored at 10: ..., 1, 4, 7, 10
        assert_eq!(points(&rec, CyclePoint::Integer(0), 10), vec!["1", "4", "7", "10"]);
    }

    #[test]
    fn test_start_end_form() {
        let ctx = int_ctx(1, None);
        let rec = Recurrence::parse("R3/2/4", &ctx).unwrap();
        assert_eq!(points(&rec, CyclePoint::Integer(0), 10), vec!["2", "4", "6"]);
    }

    #[test]
    fn test_exclusion_point() {
        let ctx = int_ctx(1, Some(5));
        let rec = Recurrence::parse("P1 ! 3", &ctx).unwrap();
        assert_eq!(points(&rec, CyclePoint::Integer(1), 10), vec!["1", "2", "4", "5"]);
        assert!(!rec.contains(&CyclePoint::Integer(3)));
    }

    #[test]
    fn test_exclusion_list_and_recurrence() {
        let ctx = int_ctx(1, Some(8));
        let rec = Recurrence::parse("P1 ! (2, 5)", &ctx).unwrap();
        assert_eq!(points(&rec, CyclePoint::Integer(1), 10), vec!["1", "3", "4", "6", "7", "8"]);

        // Subtract every second point
        let rec = Recurrence::parse("P1 ! P2", &ctx).unwrap();
        assert_eq!(points(&rec, CyclePoint::Integer(1), 10), vec!["2", "4", "6", "8"]);
    }

    #[test]
    fn test_anchor_offsets() {
        let ctx = dt_ctx("20260801T0000Z", Some("20260810T0000Z"));
        let rec = Recurrence::parse("R1/^+P1D", &ctx).unwrap();
        assert_eq!(points(&rec, ctx.initial, 3), vec!["20260802T0000Z"]);

        let rec = Recurrence::parse("R1/$-P1D", &ctx).unwrap();
        assert_eq!(points(&rec, ctx.initial, 3), vec!["20260809T0000Z"]);
    }

    #[test]
    fn test_final_point_bounds_unbounded() {
        let ctx = dt_ctx("20260801T0000Z", Some("20260803T0000Z"));
        let rec = Recurrence::parse("P1D", &ctx).unwrap();
        assert_eq!(
            points(&rec, ctx.initial, 10),
            vec!["20260801T0000Z", "20260802T0000Z", "20260803T0000Z"]
        );
    }

    #[test]
    fn test_contains_and_next_after() {
        let ctx = int_ctx(1, None);
        let rec = Recurrence::parse("P2", &ctx).unwrap();
        assert!(rec.contains(&CyclePoint::Integer(3)));
        assert!(!rec.contains(&CyclePoint::Integer(4)));
        assert_eq!(rec.next_after(&CyclePoint::Integer(3)), Some(CyclePoint::Integer(5)));
        assert_eq!(rec.first_on_or_after(&CyclePoint::Integer(4)), Some(CyclePoint::Integer(5)));
    }

    #[test]
    fn test_next_common_after() {
        let ctx = int_ctx(0, None);
        let a = Recurrence::parse("P2", &ctx).unwrap(); // 0, 2, 4, ...
        let b = Recurrence::parse("P3", &ctx).unwrap(); // 0, 3, 6, ...
        let p = next_common_after(&[a, b], &CyclePoint::Integer(0));
        assert_eq!(p, Some(CyclePoint::Integer(6)));
    }

    #[test]
    fn test_parse_errors() {
        let ctx = int_ctx(1, None);
        for bad in ["", "R0/^/P1", "R2", "R/^/P1/extra/parts", "R5/P1/P1"] {
            assert!(Recurrence::parse(bad, &ctx).is_err(), "accepted {:?}", bad);
        }
        // `$` without a final point
        assert!(Recurrence::parse("R1/$", &ctx).is_err());
    }
}
