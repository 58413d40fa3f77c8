//! Time and duration rendering.
//!
//! `chrono` datetimes render as RFC 3339 by default, or through a caller
//! strftime layout, or as unix seconds. Durations render either as a
//! human-readable string (`"1h3m40s"`, `"1.1µs"`) or as one of five numeric
//! scales.

use chrono::{DateTime, Datelike, SecondsFormat, TimeZone};

use crate::error::Error;
use crate::escape;
use crate::float;
use crate::opts::{EncodeOptions, TimeFormat};
use crate::writer;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// How a duration-typed leaf is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DurationFormat {
    /// `"1h3m40s"`-style string.
    #[default]
    String,
    /// Fractional minutes, as a number.
    Minutes,
    /// Fractional seconds, as a number.
    Seconds,
    /// Whole milliseconds, as an integer.
    Milliseconds,
    /// Whole microseconds, as an integer.
    Microseconds,
    /// Whole nanoseconds, as an integer.
    Nanoseconds,
}

impl std::fmt::Display for DurationFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DurationFormat::String => "str",
            DurationFormat::Minutes => "min",
            DurationFormat::Seconds => "s",
            DurationFormat::Milliseconds => "ms",
            DurationFormat::Microseconds => "µs",
            DurationFormat::Nanoseconds => "ns",
        };
        f.write_str(s)
    }
}

/// Appends a datetime according to the per-call time options.
pub(crate) fn append_datetime<Tz: TimeZone>(
    buf: &mut Vec<u8>,
    dt: &DateTime<Tz>,
    opts: &EncodeOptions,
) -> Result<(), Error>
where
    Tz::Offset: std::fmt::Display,
{
    let year = dt.year();
    if !(0..=9999).contains(&year) {
        return Err(Error::unsupported_value(format!(
            "year {year} outside of range [0,9999]"
        )));
    }
    match opts.time_format() {
        TimeFormat::Unix => {
            writer::append_int(buf, dt.timestamp() as i128, 10);
        }
        TimeFormat::Layout(layout) => {
            let rendered = dt.format(layout).to_string();
            escape::append_raw_quoted(buf, rendered.as_bytes());
        }
        TimeFormat::Rfc3339 => {
            let rendered = dt.to_rfc3339_opts(SecondsFormat::AutoSi, true);
            escape::append_raw_quoted(buf, rendered.as_bytes());
        }
    }
    Ok(())
}

/// Appends a duration given as signed nanoseconds.
pub(crate) fn append_duration(
    buf: &mut Vec<u8>,
    nanos: i128,
    format: DurationFormat,
) -> Result<(), Error> {
    match format {
        DurationFormat::String => {
            buf.push(b'"');
            append_duration_string(buf, nanos);
            buf.push(b'"');
            Ok(())
        }
        DurationFormat::Minutes => float::append_f64(buf, nanos as f64 / 60e9),
        DurationFormat::Seconds => float::append_f64(buf, nanos as f64 / 1e9),
        DurationFormat::Milliseconds => {
            writer::append_int(buf, nanos / 1_000_000, 10);
            Ok(())
        }
        DurationFormat::Microseconds => {
            writer::append_int(buf, nanos / 1_000, 10);
            Ok(())
        }
        DurationFormat::Nanoseconds => {
            writer::append_int(buf, nanos, 10);
            Ok(())
        }
    }
}

/// `"72h3m0.5s"`-style rendering. Built backwards into a scratch buffer;
/// leading units are dropped when zero and fractional seconds are trimmed
/// of trailing zeros.
fn append_duration_string(buf: &mut Vec<u8>, nanos: i128) {
    let mut scratch = [0u8; 48];
    let mut w = scratch.len();
    let neg = nanos < 0;
    let mut u = nanos.unsigned_abs();

    if u < NANOS_PER_SEC {
        // Sub-second scale: pick ns, µs or ms.
        if u == 0 {
            buf.extend_from_slice(b"0s");
            return;
        }
        w -= 1;
        scratch[w] = b's';
        let prec;
        if u < 1_000 {
            prec = 0;
            w -= 1;
            scratch[w] = b'n';
        } else if u < 1_000_000 {
            prec = 3;
            w -= 2;
            scratch[w..w + 2].copy_from_slice("µ".as_bytes());
        } else {
            prec = 6;
            w -= 1;
            scratch[w] = b'm';
        }
        let (nw, nu) = fmt_frac(&mut scratch, w, u, prec);
        w = fmt_int(&mut scratch, nw, nu);
    } else {
        w -= 1;
        scratch[w] = b's';
        let (nw, nu) = fmt_frac(&mut scratch, w, u, 9);
        w = fmt_int(&mut scratch, nw, nu % 60);
        u = nu / 60;
        if u > 0 {
            w -= 1;
            scratch[w] = b'm';
            w = fmt_int(&mut scratch, w, u % 60);
            u /= 60;
            if u > 0 {
                w -= 1;
                scratch[w] = b'h';
                w = fmt_int(&mut scratch, w, u);
            }
        }
    }
    if neg {
        w -= 1;
        scratch[w] = b'-';
    }
    buf.extend_from_slice(&scratch[w..]);
}

/// Writes the `prec` fractional digits of `v` (omitting trailing zeros and
/// the period when the fraction is zero); returns the remaining integer
/// part.
fn fmt_frac(scratch: &mut [u8; 48], mut w: usize, mut v: u128, prec: u32) -> (usize, u128) {
    let mut printed = false;
    for _ in 0..prec {
        let digit = v % 10;
        printed = printed || digit != 0;
        if printed {
            w -= 1;
            scratch[w] = b'0' + digit as u8;
        }
        v /= 10;
    }
    if printed {
        w -= 1;
        scratch[w] = b'.';
    }
    (w, v)
}

fn fmt_int(scratch: &mut [u8; 48], mut w: usize, mut v: u128) -> usize {
    if v == 0 {
        w -= 1;
        scratch[w] = b'0';
        return w;
    }
    while v > 0 {
        w -= 1;
        scratch[w] = b'0' + (v % 10) as u8;
        v /= 10;
    }
    w
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn duration_str(nanos: i128) -> String {
        let mut buf = Vec::new();
        append_duration_string(&mut buf, nanos);
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn duration_string_forms() {
        let cases: &[(&str, i128)] = &[
            ("0s", 0),
            ("1ns", 1),
            ("1.1µs", 1_100),
            ("2.2ms", 2_200_000),
            ("3.3s", 3_300_000_000),
            ("4m5s", 245_000_000_000),
            ("4m5.001s", 245_001_000_000),
            ("5h6m7.001s", 18_367_001_000_000),
            ("8m0.000000001s", 480_000_000_001),
            ("2562047h47m16.854775807s", i64::MAX as i128),
            ("-2562047h47m16.854775808s", i64::MIN as i128),
        ];
        for (want, nanos) in cases {
            assert_eq!(duration_str(*nanos), *want);
            if *nanos > 0 {
                assert_eq!(duration_str(-nanos), format!("-{want}"));
            }
        }
    }

    #[test]
    fn duration_numeric_forms() {
        // 1h3m40s
        let nanos: i128 = 3_820_000_000_000;
        let cases: &[(DurationFormat, &str)] = &[
            (DurationFormat::String, "\"1h3m40s\""),
            (DurationFormat::Minutes, "63.666666666666664"),
            (DurationFormat::Seconds, "3820"),
            (DurationFormat::Milliseconds, "3820000"),
            (DurationFormat::Microseconds, "3820000000"),
            (DurationFormat::Nanoseconds, "3820000000000"),
        ];
        for (format, want) in cases {
            let mut buf = Vec::new();
            append_duration(&mut buf, nanos, *format).unwrap();
            assert_eq!(String::from_utf8(buf).unwrap(), *want, "{format}");
        }
    }

    #[test]
    fn datetime_layouts() {
        let dt = Utc.with_ymd_and_hms(2009, 7, 12, 11, 3, 25).unwrap();

        let mut buf = Vec::new();
        append_datetime(&mut buf, &dt, &EncodeOptions::new()).unwrap();
        assert_eq!(buf, b"\"2009-07-12T11:03:25Z\"");

        let opts = EncodeOptions::new().time_layout("%a, %d %b %Y %H:%M:%S %z");
        let mut buf = Vec::new();
        append_datetime(&mut buf, &dt, &opts).unwrap();
        assert_eq!(buf, b"\"Sun, 12 Jul 2009 11:03:25 +0000\"");

        let opts = EncodeOptions::new().unix_timestamp();
        let mut buf = Vec::new();
        append_datetime(&mut buf, &dt, &opts).unwrap();
        assert_eq!(buf, b"1247396605");
    }

    #[test]
    fn out_of_range_years_are_rejected() {
        for year in [-1, 10_000] {
            let dt = Utc.with_ymd_and_hms(year, 1, 1, 0, 0, 0).unwrap();
            let mut buf = Vec::new();
            let err = append_datetime(&mut buf, &dt, &EncodeOptions::new()).unwrap_err();
            assert!(matches!(err, Error::UnsupportedValue(_)));
        }
    }
}
