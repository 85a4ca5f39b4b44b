//! Absolute UT timestamps as whole seconds plus a fractional part.
//!
//! A single `f64` of seconds since the epoch only resolves about 0.2 µs
//! today, which is not enough to carry sample timing through hours of
//! accumulation. Keeping the integer seconds apart keeps the fraction at
//! full double precision.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const SECONDS_PER_DAY: i64 = 86400;

/// Point in time, `secs` seconds plus `frac` after the Unix epoch.
///
/// After construction through any of the public operations the fraction
/// satisfies `0 <= frac < 1`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Timestamp {
    secs: i64,
    frac: f64,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp { secs: 0, frac: 0.0 };
    /// Sentinel for "no time available".
    pub const NONE: Timestamp = Timestamp { secs: -1, frac: 0.0 };

    pub fn compose(secs: i64, frac: f64) -> Self {
        Self { secs, frac }.normalize()
    }

    pub fn from_secs(secs: i64) -> Self {
        Self { secs, frac: 0.0 }
    }

    pub fn now() -> Self {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(since) => Self::compose(since.as_secs() as i64, since.subsec_nanos() as f64 * 1e-9),
            Err(before) => Self::ZERO.add(-before.duration().as_secs_f64()),
        }
    }

    pub fn secs(&self) -> i64 {
        self.secs
    }

    pub fn frac(&self) -> f64 {
        self.frac
    }

    pub fn is_zero(&self) -> bool {
        self.secs == 0 && self.frac == 0.0
    }

    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }

    /// Move any whole seconds out of the fraction.
    pub fn normalize(self) -> Self {
        let whole = self.frac.floor();
        let mut secs = self.secs + whole as i64;
        let mut frac = self.frac - whole;
        // a tiny negative fraction can round up to exactly 1.0 here
        if frac >= 1.0 {
            secs += 1;
            frac -= 1.0;
        }
        Self { secs, frac }
    }

    /// Offset by a (possibly negative) number of seconds.
    pub fn add(self, seconds: f64) -> Self {
        let whole = seconds.trunc();
        Self::compose(self.secs + whole as i64, self.frac + (seconds - whole))
    }

    /// Signed difference `self - other` in seconds.
    pub fn diff(self, other: Timestamp) -> f64 {
        (self.secs - other.secs) as f64 + (self.frac - other.frac)
    }

    /// Nearest whole second, ties rounding up.
    pub fn round(self) -> Self {
        let t = self.normalize();
        if t.frac >= 0.5 {
            Self::from_secs(t.secs + 1)
        } else {
            Self::from_secs(t.secs)
        }
    }

    /// Largest multiple of `step` seconds not after this time.
    pub fn truncate(self, step: f64) -> Self {
        let t = self.normalize();
        let n = (t.secs as f64 / step + t.frac / step).floor();
        let whole = (n * step).floor();
        Self::compose(whole as i64, n * step - whole)
    }

    /// Epoch seconds with a fixed number of decimals. Rounding the
    /// fraction may carry into the seconds.
    pub fn format_fixed(&self, decimals: usize) -> String {
        let t = self.normalize();
        if decimals == 0 {
            return t.round().secs.to_string();
        }
        let scale = 10u64.pow(decimals.min(18) as u32);
        let mut secs = t.secs;
        let mut digits = (0.5 + scale as f64 * t.frac) as u64;
        if digits >= scale {
            digits -= scale;
            secs += 1;
        }
        format!("{}.{:0width$}", secs, digits, width = decimals.min(18))
    }

    /// `yyyy-mm-dd_hh:mm:ss.ssssss` in UTC.
    pub fn to_utc_string(&self) -> String {
        let t = self.normalize();
        let mut secs = t.secs;
        let mut micros = (0.5 + 1e6 * t.frac) as u32;
        if micros >= 1_000_000 {
            micros -= 1_000_000;
            secs += 1;
        }
        match Utc.timestamp_opt(secs, 0).single() {
            Some(date) => format!("{}.{:06}", date.format("%Y-%m-%d_%H:%M:%S"), micros),
            None => t.format_fixed(6),
        }
    }

    /// Total order, with NaN fractions sorting last.
    pub fn total_cmp(&self, other: &Timestamp) -> Ordering {
        self.secs.cmp(&other.secs).then(self.frac.total_cmp(&other.frac))
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self::ZERO
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match self.secs.cmp(&other.secs) {
            Ordering::Equal => self.frac.partial_cmp(&other.frac),
            ord => Some(ord),
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format_fixed(6))
    }
}

/// Accepts `now`, `today`, `yesterday`, decimal epoch seconds, or a UTC
/// calendar time such as `2024-03-01_12:30:15.25` or `20240301T1230`.
impl FromStr for Timestamp {
    type Err = ConfigError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let text = text.trim();
        match text {
            "now" => return Ok(Self::now()),
            "today" => return Ok(start_of_day(Self::now(), 0)),
            "yesterday" => return Ok(start_of_day(Self::now(), -1)),
            _ => {}
        }
        if !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit() || b == b'.') {
            return parse_epoch(text);
        }
        parse_calendar(text)
    }
}

impl TryFrom<String> for Timestamp {
    type Error = ConfigError;

    fn try_from(text: String) -> Result<Self, Self::Error> {
        text.parse()
    }
}

impl From<Timestamp> for String {
    fn from(t: Timestamp) -> String {
        t.format_fixed(9)
    }
}

fn start_of_day(t: Timestamp, offset_days: i64) -> Timestamp {
    let day = t.secs.div_euclid(SECONDS_PER_DAY) + offset_days;
    Timestamp::from_secs(day * SECONDS_PER_DAY)
}

fn invalid(text: &str, reason: &str) -> ConfigError {
    ConfigError::Timestamp { text: text.to_string(), reason: reason.to_string() }
}

fn parse_epoch(text: &str) -> Result<Timestamp, ConfigError> {
    let (whole, fraction) = match text.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (text, ""),
    };
    let secs = if whole.is_empty() {
        0
    } else {
        whole.parse::<i64>().map_err(|_| invalid(text, "bad seconds"))?
    };
    if fraction.contains('.') {
        return Err(invalid(text, "more than one decimal point"));
    }
    let frac = if fraction.is_empty() {
        0.0
    } else {
        format!("0.{}", fraction).parse::<f64>().map_err(|_| invalid(text, "bad fraction"))?
    };
    Ok(Timestamp::compose(secs, frac))
}

fn all_digits(s: &[u8]) -> bool {
    s.iter().all(u8::is_ascii_digit)
}

fn number(s: &[u8]) -> u32 {
    s.iter().fold(0, |acc, d| acc * 10 + (d - b'0') as u32)
}

/// Two digits at `pos`, optionally preceded by one of `separators`.
fn field(s: &[u8], pos: &mut usize, separators: &[u8]) -> Option<u32> {
    let mut p = *pos;
    if p < s.len() && separators.contains(&s[p]) {
        p += 1;
    }
    if p + 2 <= s.len() && all_digits(&s[p..p + 2]) {
        *pos = p + 2;
        Some(number(&s[p..p + 2]))
    } else {
        None
    }
}

fn parse_calendar(text: &str) -> Result<Timestamp, ConfigError> {
    let s = text.as_bytes();
    if s.len() < 6 || !all_digits(&s[0..4]) {
        return Err(invalid(text, "invalid year"));
    }
    let year = number(&s[0..4]) as i32;
    let mut pos = 4;
    let month = field(s, &mut pos, b"-/").ok_or_else(|| invalid(text, "invalid month"))?;
    let day = field(s, &mut pos, b"-/").ok_or_else(|| invalid(text, "invalid day"))?;

    if pos < s.len() {
        match s[pos] {
            b' ' | b'_' | b'T' | b't' => pos += 1,
            _ if s[pos..].len() >= 2 && s[pos..pos + 2].eq_ignore_ascii_case(b"ut") => pos += 2,
            _ => return Err(invalid(text, "invalid date/time separator")),
        }
    }

    let mut hour = 0;
    let mut minute = 0;
    let mut seconds = 0.0;
    if pos < s.len() {
        hour = field(s, &mut pos, b"").ok_or_else(|| invalid(text, "invalid hour"))?;
    }
    if pos < s.len() {
        minute = field(s, &mut pos, b":").ok_or_else(|| invalid(text, "invalid minute"))?;
    }
    if pos < s.len() {
        if s[pos] == b':' {
            pos += 1;
        }
        let rest = &text[pos..];
        if rest.len() < 2 || !all_digits(&rest.as_bytes()[0..2]) {
            return Err(invalid(text, "invalid seconds"));
        }
        seconds = rest.parse::<f64>().map_err(|_| invalid(text, "invalid seconds"))?;
    }

    let date = NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|date| date.and_hms_opt(hour, minute, 0))
        .ok_or_else(|| invalid(text, "no such date"))?;
    Ok(Timestamp::from_secs(date.and_utc().timestamp()).add(seconds))
}

/// Parse a time range `start[,end]`. Either side may be empty and is then
/// [`Timestamp::ZERO`]. The end may be relative to the start: `+30`,
/// `+30s`, `+15m`, `+2h`, `+1d`, `+1w`.
pub fn parse_timespec(text: &str) -> Result<(Timestamp, Timestamp), ConfigError> {
    let bad = || ConfigError::Timespec(text.to_string());
    let (first, second) = match text.split_once(',') {
        Some((first, second)) => (first.trim(), Some(second.trim())),
        None => (text.trim(), None),
    };
    let start = if first.is_empty() { Timestamp::ZERO } else { first.parse()? };
    let end = match second {
        None | Some("") => Timestamp::ZERO,
        Some(relative) if relative.starts_with('+') => {
            if start.is_zero() {
                return Err(bad());
            }
            start.add(parse_duration(&relative[1..]).ok_or_else(bad)?)
        }
        Some(absolute) => absolute.parse()?,
    };
    if !start.is_zero() && !end.is_zero() && end < start {
        return Err(bad());
    }
    Ok((start, end))
}

fn parse_duration(text: &str) -> Option<f64> {
    let (number, scale) = match text.char_indices().last()? {
        (i, 's') => (&text[..i], 1.0),
        (i, 'm') => (&text[..i], 60.0),
        (i, 'h') => (&text[..i], 3600.0),
        (i, 'd') => (&text[..i], 86400.0),
        (i, 'w') => (&text[..i], 7.0 * 86400.0),
        _ => (text, 1.0),
    };
    let value = number.parse::<f64>().ok()?;
    (value.is_finite() && value >= 0.0).then_some(value * scale)
}
