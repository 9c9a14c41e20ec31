//! Time gates for dialplan includes: `times|dow|dom|month`.
//!
//! Minutes are tracked at two-minute granularity (30 slots per hour), days
//! and months as plain bitmasks. A malformed field logs and falls back to
//! "no restriction" for times, "none" for list fields, matching the
//! forgiving behavior dialplan authors rely on.

use chrono::{Datelike, Local, TimeZone, Timelike};
use tracing::warn;

const DAYS: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];
const MONTHS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimeSpec {
    /// 30 two-minute slots per hour.
    minmask: [u32; 24],
    dowmask: u32,
    daymask: u32,
    monthmask: u32,
}

impl TimeSpec {
    /// Parse `times|dow|dom|month`; omitted trailing fields impose no
    /// restriction.
    pub fn parse(info: &str) -> TimeSpec {
        let mut spec = TimeSpec {
            minmask: [0; 24],
            dowmask: (1 << 7) - 1,
            daymask: (1u32 << 31) - 1,
            monthmask: (1 << 12) - 1,
        };
        let mut fields = info.split('|');

        spec.set_timerange(fields.next().unwrap_or("*"));
        if let Some(dow) = fields.next() {
            spec.dowmask = name_range_mask(dow, &DAYS);
        }
        if let Some(day) = fields.next() {
            spec.daymask = number_range_mask(day, 1, 31);
        }
        if let Some(month) = fields.next() {
            spec.monthmask = name_range_mask(month, &MONTHS);
        }
        spec
    }

    fn all_minutes(&mut self) {
        for slot in &mut self.minmask {
            *slot = (1 << 30) - 1;
        }
    }

    fn set_timerange(&mut self, times: &str) {
        self.minmask = [0; 24];
        if times.is_empty() || times == "*" {
            self.all_minutes();
            return;
        }
        let Some((start, end)) = times.split_once('-') else {
            warn!(times, "time range is not valid, assuming no restriction");
            self.all_minutes();
            return;
        };
        let (Some(s), Some(e)) = (parse_hhmm(start), parse_hhmm(end.trim_start_matches(|c: char| !c.is_ascii_digit()))) else {
            warn!(times, "invalid time range, assuming no restriction");
            self.all_minutes();
            return;
        };

        // Walk two-minute slots from start to end inclusive, wrapping
        // midnight.
        let mut x = s;
        loop {
            self.minmask[x / 30] |= 1 << (x % 30);
            if x == e {
                break;
            }
            x = (x + 1) % (24 * 30);
        }
    }

    /// Whether `now` falls inside the gate.
    pub fn check_at<Tz: TimeZone>(&self, now: chrono::DateTime<Tz>) -> bool {
        if self.monthmask & (1 << now.month0()) == 0 {
            return false;
        }
        if self.daymask & (1 << (now.day() - 1)) == 0 {
            return false;
        }
        if self.dowmask & (1 << now.weekday().num_days_from_sunday()) == 0 {
            return false;
        }
        self.minmask[now.hour() as usize] & (1 << (now.minute() / 2)) != 0
    }

    pub fn check(&self) -> bool {
        self.check_at(Local::now())
    }
}

/// `hh:mm` into a two-minute slot index.
fn parse_hhmm(s: &str) -> Option<usize> {
    let (h, m) = s.trim().split_once(':')?;
    let h: usize = h.trim().parse().ok()?;
    let m: usize = m.trim().parse().ok()?;
    let slot = h * 30 + m / 2;
    if slot >= 24 * 30 {
        return None;
    }
    Some(slot)
}

/// `mon-fri` / `jan-mar` style name ranges against `names`, wrapping.
fn name_range_mask(field: &str, names: &[&str]) -> u32 {
    if field.is_empty() || field == "*" {
        return (1u32 << names.len()) - 1;
    }
    let (start, end) = match field.split_once('-') {
        Some((s, e)) => (s, Some(e)),
        None => (field, None),
    };
    let Some(s) = names.iter().position(|n| n.eq_ignore_ascii_case(start)) else {
        warn!(field, "invalid name in range, assuming none");
        return 0;
    };
    let e = match end {
        Some(end) => match names.iter().position(|n| n.eq_ignore_ascii_case(end)) {
            Some(e) => e,
            None => {
                warn!(field, "invalid name in range, assuming none");
                return 0;
            }
        },
        None => s,
    };
    wrap_mask(s, e, names.len())
}

/// `1-15` style numeric ranges (1-based), wrapping.
fn number_range_mask(field: &str, min: u32, max: u32) -> u32 {
    if field.is_empty() || field == "*" {
        return (1u32 << max) - 1;
    }
    let (start, end) = match field.split_once('-') {
        Some((s, e)) => (s, Some(e)),
        None => (field, None),
    };
    let parse = |s: &str| -> Option<u32> {
        let v: u32 = s.trim().parse().ok()?;
        if v < min || v > max {
            return None;
        }
        Some(v - 1)
    };
    let Some(s) = parse(start) else {
        warn!(field, "invalid day, assuming none");
        return 0;
    };
    let e = match end {
        Some(end) => match parse(end) {
            Some(e) => e,
            None => {
                warn!(field, "invalid day, assuming none");
                return 0;
            }
        },
        None => s,
    };
    wrap_mask(s as usize, e as usize, max as usize)
}

fn wrap_mask(start: usize, end: usize, modulo: usize) -> u32 {
    let mut mask = 0u32;
    let mut x = start;
    loop {
        mask |= 1 << x;
        if x == end {
            break;
        }
        x = (x + 1) % modulo;
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate, Utc};

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> chrono::DateTime<Utc> {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, 0)
            .unwrap()
            .and_utc()
    }

    #[test]
    fn star_matches_always() {
        let spec = TimeSpec::parse("*");
        assert!(spec.check_at(at(2026, 8, 1, 0, 0)));
        assert!(spec.check_at(at(2026, 8, 1, 23, 59)));
    }

    #[test]
    fn office_hours_gate() {
        // Mon-Fri 09:00-17:58
        let spec = TimeSpec::parse("09:00-17:58|mon-fri");
        // 2026-08-03 is a Monday.
        assert!(spec.check_at(at(2026, 8, 3, 9, 0)));
        assert!(spec.check_at(at(2026, 8, 3, 17, 58)));
        assert!(!spec.check_at(at(2026, 8, 3, 8, 58)));
        assert!(!spec.check_at(at(2026, 8, 3, 18, 0)));
        // Saturday is outside mon-fri.
        assert!(!spec.check_at(at(2026, 8, 1, 10, 0)));
    }

    #[test]
    fn range_wraps_midnight() {
        let spec = TimeSpec::parse("22:00-02:00");
        assert!(spec.check_at(at(2026, 8, 1, 23, 30)));
        assert!(spec.check_at(at(2026, 8, 1, 1, 0)));
        assert!(!spec.check_at(at(2026, 8, 1, 12, 0)));
    }

    #[test]
    fn dow_wraps() {
        let spec = TimeSpec::parse("*|fri-mon");
        let friday = at(2026, 8, 7, 12, 0);
        let sunday = at(2026, 8, 9, 12, 0);
        let wednesday = at(2026, 8, 5, 12, 0);
        assert!(spec.check_at(friday));
        assert!(spec.check_at(sunday));
        assert!(!spec.check_at(wednesday));
    }

    #[test]
    fn day_and_month_fields() {
        let spec = TimeSpec::parse("*|*|1-10|aug");
        assert!(spec.check_at(at(2026, 8, 5, 12, 0)));
        assert!(!spec.check_at(at(2026, 8, 15, 12, 0)));
        assert!(!spec.check_at(at(2026, 7, 5, 12, 0)));
    }

    #[test]
    fn bogus_names_match_nothing() {
        let spec = TimeSpec::parse("*|nonday");
        let mut day = at(2026, 8, 1, 12, 0);
        for _ in 0..7 {
            assert!(!spec.check_at(day));
            day += Duration::days(1);
        }
    }
}
