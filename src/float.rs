//! Float rendering.
//!
//! `ryu` supplies the shortest digit sequence that round-trips at the
//! requested width; the digits are then restyled into the conformant JSON
//! form: fixed notation while the magnitude sits inside `[1e-6, 1e21)`,
//! exponent notation outside of it, with a mandatory sign on the exponent
//! and no leading zeros in it. NaN and infinities are rejected.

use crate::error::Error;

/// Appends the JSON form of a finite `f64`.
pub(crate) fn append_f64(buf: &mut Vec<u8>, v: f64) -> Result<(), Error> {
    if v.is_nan() {
        return Err(Error::unsupported_value("NaN"));
    }
    if v.is_infinite() {
        let s = if v > 0.0 { "+Inf" } else { "-Inf" };
        return Err(Error::unsupported_value(s));
    }
    let abs = v.abs();
    let exponential = abs != 0.0 && (abs < 1e-6 || abs >= 1e21);
    let mut shortest = ryu::Buffer::new();
    restyle(buf, shortest.format_finite(v), exponential);
    Ok(())
}

/// Appends the JSON form of a finite `f32`.
pub(crate) fn append_f32(buf: &mut Vec<u8>, v: f32) -> Result<(), Error> {
    if v.is_nan() {
        return Err(Error::unsupported_value("NaN"));
    }
    if v.is_infinite() {
        let s = if v > 0.0 { "+Inf" } else { "-Inf" };
        return Err(Error::unsupported_value(s));
    }
    let abs = v.abs();
    let exponential = abs != 0.0 && (abs < 1e-6 || abs >= 1e21);
    let mut shortest = ryu::Buffer::new();
    restyle(buf, shortest.format_finite(v), exponential);
    Ok(())
}

/// Reshapes ryu output (`-?d+.d+` or `-?d+(.d+)?e-?d+`) into the target
/// form. The digit sequence is carried as `0.D × 10^dp`.
fn restyle(buf: &mut Vec<u8>, s: &str, exponential: bool) {
    let b = s.as_bytes();
    let mut pos = 0;
    if b[0] == b'-' {
        buf.push(b'-');
        pos = 1;
    }

    let (mantissa, exp) = match s[pos..].find('e') {
        Some(off) => {
            let e: i32 = s[pos + off + 1..].parse().unwrap_or(0);
            (&s[pos..pos + off], e)
        }
        None => (&s[pos..], 0),
    };
    let (int_part, frac_part) = match mantissa.find('.') {
        Some(dot) => (&mantissa[..dot], &mantissa[dot + 1..]),
        None => (mantissa, ""),
    };

    // Normalize to a bare digit string and a decimal-point offset.
    let int_trimmed = int_part.trim_start_matches('0');
    let mut digits = String::with_capacity(int_trimmed.len() + frac_part.len());
    let mut dp: i32;
    if int_trimmed.is_empty() {
        let frac_trimmed = frac_part.trim_start_matches('0');
        dp = -((frac_part.len() - frac_trimmed.len()) as i32);
        digits.push_str(frac_trimmed);
    } else {
        dp = int_trimmed.len() as i32;
        digits.push_str(int_trimmed);
        digits.push_str(frac_part);
    }
    while digits.ends_with('0') {
        digits.pop();
    }
    dp += exp;

    if digits.is_empty() {
        buf.push(b'0');
        return;
    }
    let d = digits.as_bytes();

    if exponential {
        buf.push(d[0]);
        if d.len() > 1 {
            buf.push(b'.');
            buf.extend_from_slice(&d[1..]);
        }
        buf.push(b'e');
        let e10 = dp - 1;
        if e10 >= 0 {
            buf.push(b'+');
        }
        let mut itoa_buf = itoa::Buffer::new();
        buf.extend_from_slice(itoa_buf.format(e10).as_bytes());
        return;
    }

    if dp <= 0 {
        buf.extend_from_slice(b"0.");
        for _ in 0..-dp {
            buf.push(b'0');
        }
        buf.extend_from_slice(d);
    } else if dp as usize >= d.len() {
        buf.extend_from_slice(d);
        for _ in 0..(dp as usize - d.len()) {
            buf.push(b'0');
        }
    } else {
        buf.extend_from_slice(&d[..dp as usize]);
        buf.push(b'.');
        buf.extend_from_slice(&d[dp as usize..]);
    }
}
