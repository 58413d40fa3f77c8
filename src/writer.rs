//! Byte output: the sink contract and the low-level append primitives.
//!
//! The engine renders into an internal `Vec<u8>` and hands the finished
//! payload to the caller's [`Sink`] in one append. A sink only needs to
//! accept bytes and strings; there is no seeking and no flushing.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;

/// Destination for encoded JSON bytes.
pub trait Sink {
    /// Appends raw bytes.
    fn write(&mut self, bytes: &[u8]);

    /// Appends a string. Defaults to forwarding the UTF-8 bytes.
    fn write_str(&mut self, s: &str) {
        self.write(s.as_bytes());
    }

    /// Hints the total size of an upcoming append.
    fn reserve(&mut self, _additional: usize) {}
}

impl Sink for Vec<u8> {
    fn write(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }

    fn reserve(&mut self, additional: usize) {
        Vec::reserve(self, additional);
    }
}

impl Sink for String {
    fn write(&mut self, bytes: &[u8]) {
        // Encoded output is valid UTF-8 by construction; replacement here
        // only guards against a sink being fed from elsewhere.
        match std::str::from_utf8(bytes) {
            Ok(s) => self.push_str(s),
            Err(_) => self.push_str(&String::from_utf8_lossy(bytes)),
        }
    }

    fn reserve(&mut self, additional: usize) {
        String::reserve(self, additional);
    }
}

impl<S: Sink + ?Sized> Sink for &mut S {
    fn write(&mut self, bytes: &[u8]) {
        (**self).write(bytes);
    }

    fn write_str(&mut self, s: &str) {
        (**self).write_str(s);
    }

    fn reserve(&mut self, additional: usize) {
        (**self).reserve(additional);
    }
}

/// Adapter that turns any `std::io::Write` into a [`Sink`], holding on to
/// the first I/O error until the encode call completes.
pub struct IoSink<W: std::io::Write> {
    writer: W,
    error: Option<std::io::Error>,
}

impl<W: std::io::Write> IoSink<W> {
    /// Wraps `writer`.
    pub fn new(writer: W) -> Self {
        IoSink {
            writer,
            error: None,
        }
    }

    /// Returns the first write error, if any.
    pub fn into_result(self) -> std::io::Result<()> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<W: std::io::Write> Sink for IoSink<W> {
    fn write(&mut self, bytes: &[u8]) {
        if self.error.is_none() {
            if let Err(e) = self.writer.write_all(bytes) {
                self.error = Some(e);
            }
        }
    }
}

// ── Append primitives ────────────────────────────────────────────────

const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

pub(crate) fn append_null(buf: &mut Vec<u8>) {
    buf.extend_from_slice(b"null");
}

pub(crate) fn append_bool(buf: &mut Vec<u8>, v: bool) {
    buf.extend_from_slice(if v { b"true" } else { b"false" });
}

/// Appends a signed integer. Base 10 is the default; bases 2..=10 emit a
/// bare literal, bases 11..=36 emit a JSON string. The base has been
/// validated by the option layer.
pub(crate) fn append_int(buf: &mut Vec<u8>, v: i128, base: u32) {
    if base == 10 {
        let mut itoa_buf = itoa::Buffer::new();
        buf.extend_from_slice(itoa_buf.format(v).as_bytes());
        return;
    }
    let quoted = base > 10;
    if quoted {
        buf.push(b'"');
    }
    if v < 0 {
        buf.push(b'-');
    }
    let magnitude = v.unsigned_abs();
    append_radix(buf, magnitude, base);
    if quoted {
        buf.push(b'"');
    }
}

/// Unsigned counterpart of [`append_int`].
pub(crate) fn append_uint(buf: &mut Vec<u8>, v: u128, base: u32) {
    if base == 10 {
        let mut itoa_buf = itoa::Buffer::new();
        buf.extend_from_slice(itoa_buf.format(v).as_bytes());
        return;
    }
    let quoted = base > 10;
    if quoted {
        buf.push(b'"');
    }
    append_radix(buf, v, base);
    if quoted {
        buf.push(b'"');
    }
}

fn append_radix(buf: &mut Vec<u8>, mut v: u128, base: u32) {
    // 128 binary digits is the worst case.
    let mut scratch = [0u8; 128];
    let mut at = scratch.len();
    let base = base as u128;
    loop {
        at -= 1;
        scratch[at] = DIGITS[(v % base) as usize];
        v /= base;
        if v == 0 {
            break;
        }
    }
    buf.extend_from_slice(&scratch[at..]);
}

/// Appends `bytes` as a quoted standard base64 string (padded).
pub(crate) fn append_base64(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.push(b'"');
    let encoded_len = bytes.len().div_ceil(3) * 4;
    let start = buf.len();
    buf.resize(start + encoded_len, 0);
    let written = BASE64_STANDARD
        .encode_slice(bytes, &mut buf[start..])
        .expect("base64 output buffer sized exactly");
    buf.truncate(start + written);
    buf.push(b'"');
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_and_null_literals() {
        let mut buf = Vec::new();
        append_bool(&mut buf, true);
        buf.push(b' ');
        append_bool(&mut buf, false);
        buf.push(b' ');
        append_null(&mut buf);
        assert_eq!(buf, b"true false null");
    }

    #[test]
    fn integers_in_every_base_round_trip() {
        for v in [-128i128, -42, -1, 0, 1, 42, 127, i64::MAX as i128] {
            for base in 2u32..=36 {
                let mut buf = Vec::new();
                append_int(&mut buf, v, base);
                let s = String::from_utf8(buf).unwrap();
                let body = if base > 10 {
                    assert!(s.starts_with('"') && s.ends_with('"'), "{s}");
                    &s[1..s.len() - 1]
                } else {
                    &s[..]
                };
                assert_eq!(i128::from_str_radix(body, base), Ok(v), "base {base}");
            }
        }
    }

    #[test]
    fn unsigned_extremes() {
        let mut buf = Vec::new();
        append_uint(&mut buf, u64::MAX as u128, 10);
        assert_eq!(buf, b"18446744073709551615");

        let mut buf = Vec::new();
        append_uint(&mut buf, 0xBEEF, 10);
        assert_eq!(buf, b"48879");

        let mut buf = Vec::new();
        append_int(&mut buf, i128::MIN, 2);
        let s = String::from_utf8(buf).unwrap();
        assert!(s.starts_with('-'));
    }

    #[test]
    fn base64_slices() {
        let mut buf = Vec::new();
        append_base64(&mut buf, b"Loreum");
        assert_eq!(buf, b"\"TG9yZXVt\"");

        let mut buf = Vec::new();
        append_base64(&mut buf, b"");
        assert_eq!(buf, b"\"\"");

        // Padded lengths.
        let mut buf = Vec::new();
        append_base64(&mut buf, b"ab");
        assert_eq!(buf, b"\"YWI=\"");
    }

    #[test]
    fn io_sink_holds_first_error() {
        struct Failing;
        impl std::io::Write for Failing {
            fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
                Err(std::io::Error::other("sink closed"))
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }
        let mut sink = IoSink::new(Failing);
        sink.write(b"{}");
        sink.write(b"[]");
        assert!(sink.into_result().is_err());
    }
}
