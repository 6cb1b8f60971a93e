//! Tick arithmetic kernel.
//!
//! Converts symbolic note lengths (`/4`, `*2`, `4.`, `4t`, `4t7:4`,
//! `4+32+1`, ...) into integer ticks at a given resolution. All arithmetic
//! inside one element is carried on exact rationals; the element is rounded
//! to integer ticks once, and a `+`-joined sum adds the integer results.

use num_rational::Ratio;

/// Powers of two accepted after `/` and `*`.
const POWERS: [i64; 6] = [1, 2, 4, 8, 16, 32];

/// Legacy digit forms, each meaning `whole / n`.
const DIGITS: [i64; 7] = [1, 2, 4, 5, 8, 16, 32];

/// Parse a length token into ticks.
///
/// `resolution` is the sequence resolution in ticks per quarter note, so a
/// whole note is `4 * resolution` ticks. Errors carry only a message; the
/// caller attaches the source location.
pub fn parse_duration(text: &str, resolution: u16) -> Result<u64, String> {
    if text.is_empty() {
        return Err("empty length".to_string());
    }

    let whole = 4 * resolution as i64;
    let mut total: u64 = 0;

    for element in text.split('+') {
        if element.is_empty() {
            return Err(format!("empty summand in length '{}'", text));
        }
        total += parse_element(element, whole)?;
    }

    Ok(total)
}

fn parse_element(element: &str, whole: i64) -> Result<u64, String> {
    let bytes = element.as_bytes();
    let mut pos = 0usize;

    let mut length: Ratio<i64> = match bytes[0] {
        b'/' => {
            pos += 1;
            let n = read_uint(bytes, &mut pos)
                .ok_or_else(|| format!("missing divisor in '{}'", element))?;
            if !POWERS.contains(&n) {
                return Err(format!("unsupported note length '/{}'", n));
            }
            Ratio::new(whole, n)
        }
        b'*' => {
            pos += 1;
            let n = read_uint(bytes, &mut pos)
                .ok_or_else(|| format!("missing factor in '{}'", element))?;
            if !POWERS.contains(&n) {
                return Err(format!("unsupported note length '*{}'", n));
            }
            Ratio::from_integer(whole * n)
        }
        b'0'..=b'9' => {
            let n = read_uint(bytes, &mut pos)
                .ok_or_else(|| format!("unsupported note length '{}'", element))?;
            if !DIGITS.contains(&n) {
                return Err(format!("unsupported note length '{}'", n));
            }
            Ratio::new(whole, n)
        }
        _ => return Err(format!("unknown length '{}'", element)),
    };

    // A run of dots adds 1/2, then 1/4, ... of the pre-dot value; a tuplet
    // marker ends the run.
    let mut dot_add: Option<Ratio<i64>> = None;

    while pos < bytes.len() {
        match bytes[pos] {
            b'.' => {
                pos += 1;
                let add = match dot_add {
                    Some(a) => a,
                    None => length / 2,
                };
                length += add;
                dot_add = Some(add / 2);
            }
            b't' => {
                pos += 1;
                dot_add = None;
                if pos < bytes.len() && bytes[pos].is_ascii_digit() {
                    let n = read_uint(bytes, &mut pos)
                        .ok_or_else(|| format!("malformed tuplet in '{}'", element))?;
                    if pos >= bytes.len() || bytes[pos] != b':' {
                        return Err(format!("malformed tuplet in '{}'", element));
                    }
                    pos += 1;
                    let m = read_uint(bytes, &mut pos)
                        .ok_or_else(|| format!("malformed tuplet in '{}'", element))?;
                    if n == 0 || m == 0 {
                        return Err(format!("malformed tuplet in '{}'", element));
                    }
                    length *= Ratio::new(m, n);
                } else {
                    length *= Ratio::new(2, 3);
                }
            }
            _ => return Err(format!("unexpected character in length '{}'", element)),
        }
    }

    // Round half-up to whole ticks.
    let rounded = length.round().to_integer();
    if rounded < 0 {
        return Err(format!("negative length '{}'", element));
    }
    Ok(rounded as u64)
}

/// Scale a tick count by a duration ratio, rounding half-up.
///
/// Used for note-off placement; the unscaled length still drives tick
/// advancement.
pub fn scale_ticks(len: u64, ratio: Ratio<u64>) -> u64 {
    let num = len * ratio.numer();
    let den = *ratio.denom();
    (2 * num + den) / (2 * den)
}

fn read_uint(bytes: &[u8], pos: &mut usize) -> Option<i64> {
    let start = *pos;
    while *pos < bytes.len() && bytes[*pos].is_ascii_digit() {
        *pos += 1;
    }
    if *pos == start || *pos - start > 6 {
        return None;
    }
    std::str::from_utf8(&bytes[start..*pos])
        .ok()
        .and_then(|s| s.parse().ok())
}
