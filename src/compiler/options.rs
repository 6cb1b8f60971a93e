//! Option list parsing and option frames.
//!
//! Every command or block header may end in a `,`-separated option list.
//! `v`, `d` and `s` are inherited by nested blocks and calls through
//! [`OptionFrame`]; `q` and `m` belong to the header they appear on.

use crate::dict::{Dict, OptKey};
use crate::error::ErrorKind;
use num_rational::Ratio;

/// Parsed options of a single header or channel command.
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub velocity: Option<u8>,
    pub duration: Option<Ratio<u64>>,
    pub quantity: Option<u64>,
    pub multiple: bool,
    pub shift: Option<i32>,
    pub lyrics: Option<String>,
    pub tremolo: Option<u32>,
}

impl Options {
    /// Merge the closing-brace options of a block into its opening ones.
    /// `q` composes multiplicatively, `m` unionally; anything else must not
    /// appear on both ends.
    pub fn merge(&mut self, other: Options) -> Result<(), (ErrorKind, String)> {
        if let Some(q) = other.quantity {
            self.quantity = Some(self.quantity.unwrap_or(1) * q);
        }
        self.multiple |= other.multiple;

        for (name, mine, theirs) in [
            ("velocity", self.velocity.is_some(), other.velocity.is_some()),
            ("duration", self.duration.is_some(), other.duration.is_some()),
            ("shift", self.shift.is_some(), other.shift.is_some()),
            ("lyrics", self.lyrics.is_some(), other.lyrics.is_some()),
            ("tremolo", self.tremolo.is_some(), other.tremolo.is_some()),
        ] {
            if mine && theirs {
                return Err((
                    ErrorKind::BadOption,
                    format!("option '{}' given more than once", name),
                ));
            }
        }
        self.velocity = self.velocity.or(other.velocity);
        self.duration = self.duration.or(other.duration);
        self.shift = self.shift.or(other.shift);
        self.lyrics = self.lyrics.take().or(other.lyrics);
        self.tremolo = self.tremolo.or(other.tremolo);
        Ok(())
    }
}

/// Effective inherited option values at one point of execution.
///
/// Child frames are flattened copies of their parent with the header's
/// explicit options folded in; looking a value up is therefore one field
/// access instead of a walk up the chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct OptionFrame {
    pub velocity: Option<u8>,
    pub duration: Option<Ratio<u64>>,
    pub shift: i32,
}

impl OptionFrame {
    pub fn root() -> Self {
        Self::default()
    }

    /// Frame for a block or call body: `v`/`d` overridden when set on the
    /// header, `s` added to the inherited shift.
    pub fn child(&self, opts: &Options) -> Self {
        Self {
            velocity: opts.velocity.or(self.velocity),
            duration: opts.duration.or(self.duration),
            shift: self.shift + opts.shift.unwrap_or(0),
        }
    }
}

/// Parse the trailing option list of a command or block header.
///
/// A leading comma is optional; entries are separated by commas outside
/// quotes. Unknown keys, malformed values and repeated keys (other than `q`
/// and `m`) are rejected.
pub fn parse_options(text: &str, dict: &Dict) -> Result<Options, (ErrorKind, String)> {
    let mut opts = Options::default();
    let text = text.trim();
    let text = text.strip_prefix(',').unwrap_or(text);

    for entry in split_list(text) {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }

        let (key_text, value) = match entry.find('=') {
            Some(pos) => (entry[..pos].trim(), Some(entry[pos + 1..].trim())),
            None => (entry, None),
        };

        let key = dict.option(key_text).ok_or_else(|| {
            (
                ErrorKind::BadOption,
                format!("unknown option '{}'", key_text),
            )
        })?;

        match key {
            OptKey::Velocity => {
                let v = require(key_text, value)?;
                let v: u8 = v.parse().map_err(|_| bad(key_text, v))?;
                if v > 127 {
                    return Err(bad(key_text, &v.to_string()));
                }
                set_once("velocity", &mut opts.velocity, v)?;
            }
            OptKey::Duration => {
                let v = require(key_text, value)?;
                let ratio = parse_ratio(v).ok_or_else(|| bad(key_text, v))?;
                set_once("duration", &mut opts.duration, ratio)?;
            }
            OptKey::Quantity => {
                let v = require(key_text, value)?;
                let q: u64 = v.parse().map_err(|_| bad(key_text, v))?;
                opts.quantity = Some(opts.quantity.unwrap_or(1) * q);
            }
            OptKey::Multiple => {
                if value.is_some() {
                    return Err((
                        ErrorKind::BadOption,
                        format!("option '{}' takes no value", key_text),
                    ));
                }
                opts.multiple = true;
            }
            OptKey::Shift => {
                let v = require(key_text, value)?;
                let s: i32 = v.parse().map_err(|_| bad(key_text, v))?;
                set_once("shift", &mut opts.shift, s)?;
            }
            OptKey::Lyrics => {
                let v = require(key_text, value)?;
                set_once("lyrics", &mut opts.lyrics, unescape_lyrics(v))?;
            }
            OptKey::Tremolo => {
                let v = require(key_text, value)?;
                let n: u32 = v.parse().map_err(|_| bad(key_text, v))?;
                if n == 0 {
                    return Err(bad(key_text, v));
                }
                set_once("tremolo", &mut opts.tremolo, n)?;
            }
        }
    }

    Ok(opts)
}

fn require<'a>(key: &str, value: Option<&'a str>) -> Result<&'a str, (ErrorKind, String)> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err((
            ErrorKind::BadOption,
            format!("option '{}' needs a value", key),
        )),
    }
}

fn bad(key: &str, value: &str) -> (ErrorKind, String) {
    (
        ErrorKind::BadOption,
        format!("invalid value '{}' for option '{}'", value, key),
    )
}

fn set_once<T>(name: &str, slot: &mut Option<T>, value: T) -> Result<(), (ErrorKind, String)> {
    if slot.is_some() {
        return Err((
            ErrorKind::BadOption,
            format!("option '{}' given more than once", name),
        ));
    }
    *slot = Some(value);
    Ok(())
}

/// Duration ratio: `75%` or a decimal like `0.5`. Must be positive.
fn parse_ratio(text: &str) -> Option<Ratio<u64>> {
    let ratio = if let Some(percent) = text.strip_suffix('%') {
        let n: u64 = percent.trim().parse().ok()?;
        Ratio::new(n, 100)
    } else if let Some(dot) = text.find('.') {
        let int: u64 = if dot == 0 { 0 } else { text[..dot].parse().ok()? };
        let frac = &text[dot + 1..];
        if frac.is_empty() || frac.len() > 6 || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let scale = 10u64.pow(frac.len() as u32);
        Ratio::new(int * scale + frac.parse::<u64>().ok()?, scale)
    } else {
        Ratio::from_integer(text.parse().ok()?)
    };
    (ratio > Ratio::from_integer(0)).then_some(ratio)
}

/// Lyrics escapes: `_` is a space, `\c` a comma.
fn unescape_lyrics(text: &str) -> String {
    text.replace("\\c", ",").replace('_', " ")
}

/// Split a list on commas that sit outside quotes.
pub fn split_list(text: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let bytes = text.as_bytes();
    let mut in_quote = false;
    let mut start = 0;
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'"' => in_quote = !in_quote,
            b',' if !in_quote => {
                parts.push(&text[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&text[start..]);
    parts
}
