//! Pre-rendered leaves: number literals and raw JSON passthrough.

use facet::Facet;

/// A JSON number literal kept in textual form.
///
/// The literal is validated against the JSON number grammar when encoded;
/// a malformed literal fails the encode call with an unsupported-value
/// error. Useful for round-tripping numbers whose precision exceeds the
/// native float width.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Facet)]
pub struct Number(String);

impl Number {
    /// Wraps a literal without validating it yet.
    pub fn new(literal: impl Into<String>) -> Self {
        Number(literal.into())
    }

    /// The literal text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<i64> for Number {
    fn from(v: i64) -> Self {
        let mut buf = itoa::Buffer::new();
        Number(buf.format(v).to_owned())
    }
}

impl From<u64> for Number {
    fn from(v: u64) -> Self {
        let mut buf = itoa::Buffer::new();
        Number(buf.format(v).to_owned())
    }
}

impl std::fmt::Display for Number {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A blob of JSON copied verbatim into the output.
///
/// The payload is trusted; no validation or escaping is applied.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Facet)]
pub struct RawJson(String);

impl RawJson {
    /// Wraps pre-rendered JSON.
    pub fn new(json: impl Into<String>) -> Self {
        RawJson(json.into())
    }

    /// The raw payload.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Checks `s` against the JSON number grammar:
/// `-?(0|[1-9][0-9]*)(\.[0-9]+)?([eE][+-]?[0-9]+)?`.
pub(crate) fn is_valid_number(s: &str) -> bool {
    let b = s.as_bytes();
    let mut i = 0;

    if i < b.len() && b[i] == b'-' {
        i += 1;
    }
    match b.get(i) {
        Some(b'0') => i += 1,
        Some(b'1'..=b'9') => {
            i += 1;
            while i < b.len() && b[i].is_ascii_digit() {
                i += 1;
            }
        }
        _ => return false,
    }
    if i < b.len() && b[i] == b'.' {
        i += 1;
        let frac_start = i;
        while i < b.len() && b[i].is_ascii_digit() {
            i += 1;
        }
        if i == frac_start {
            return false;
        }
    }
    if i < b.len() && (b[i] == b'e' || b[i] == b'E') {
        i += 1;
        if i < b.len() && (b[i] == b'+' || b[i] == b'-') {
            i += 1;
        }
        let exp_start = i;
        while i < b.len() && b[i].is_ascii_digit() {
            i += 1;
        }
        if i == exp_start {
            return false;
        }
    }
    i == b.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_the_json_number_grammar() {
        for ok in [
            "42", "-42", "24.42", "-666.66", "3.14", "-3.14", "1e3", "1E-6", "1E+42", "0", "0.5",
        ] {
            assert!(is_valid_number(ok), "{ok}");
        }
    }

    #[test]
    fn rejects_malformed_literals() {
        for bad in [
            "1E+4.0", "084", "-03.14", "-", "", "invalid", ".5", "1.", "1e", "1e+", "+1", "NaN",
        ] {
            assert!(!is_valid_number(bad), "{bad}");
        }
    }
}
