//! Note, percussion, instrument and keyword dictionaries.
//!
//! Loaded once per compilation and treated as read-only afterwards, except
//! for `DEFINE` which swaps the symbol bound to a builtin keyword.

use std::collections::HashMap;

/// Builtin command keywords. `DEFINE` rebinds the symbol, not the meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Keyword {
    Function,
    End,
    Call,
    Include,
    IncludeFile,
    Instruments,
    Meta,
    SoftKaraoke,
    Chord,
    Const,
    Var,
    Define,
    Tempo,
    Time,
    Key,
}

impl Keyword {
    /// Canonical identifier used by `DEFINE` to address the keyword.
    pub fn id(&self) -> &'static str {
        match self {
            Self::Function => "FUNCTION",
            Self::End => "END",
            Self::Call => "CALL",
            Self::Include => "INCLUDE",
            Self::IncludeFile => "INCLUDEFILE",
            Self::Instruments => "INSTRUMENTS",
            Self::Meta => "META",
            Self::SoftKaraoke => "SOFT_KARAOKE",
            Self::Chord => "CHORD",
            Self::Const => "CONST",
            Self::Var => "VAR",
            Self::Define => "DEFINE",
            Self::Tempo => "TEMPO",
            Self::Time => "TIME",
            Self::Key => "KEY",
        }
    }

    fn all() -> [Keyword; 15] {
        [
            Self::Function,
            Self::End,
            Self::Call,
            Self::Include,
            Self::IncludeFile,
            Self::Instruments,
            Self::Meta,
            Self::SoftKaraoke,
            Self::Chord,
            Self::Const,
            Self::Var,
            Self::Define,
            Self::Tempo,
            Self::Time,
            Self::Key,
        ]
    }
}

/// Recognized option keys (long and short symbol each).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptKey {
    Velocity,
    Duration,
    Quantity,
    Multiple,
    Shift,
    Lyrics,
    Tremolo,
}

impl OptKey {
    pub fn id(&self) -> &'static str {
        match self {
            Self::Velocity => "VELOCITY",
            Self::Duration => "DURATION",
            Self::Quantity => "QUANTITY",
            Self::Multiple => "MULTIPLE",
            Self::Shift => "SHIFT",
            Self::Lyrics => "LYRICS",
            Self::Tremolo => "TREMOLO",
        }
    }

    fn defaults() -> [(OptKey, &'static str, &'static str); 7] {
        [
            (Self::Velocity, "velocity", "v"),
            (Self::Duration, "duration", "d"),
            (Self::Quantity, "quantity", "q"),
            (Self::Multiple, "multiple", "m"),
            (Self::Shift, "shift", "s"),
            (Self::Lyrics, "lyrics", "l"),
            (Self::Tremolo, "tremolo", "tr"),
        ]
    }
}

/// Symbol tables for one compilation.
#[derive(Debug, Clone)]
pub struct Dict {
    keywords: HashMap<Keyword, String>,
    keyword_lookup: HashMap<String, Keyword>,
    options: HashMap<OptKey, (String, String)>,
    option_lookup: HashMap<String, OptKey>,
    rest: String,
    percussion: HashMap<&'static str, u8>,
    instruments: HashMap<&'static str, u8>,
    drumkits: HashMap<&'static str, u8>,
}

impl Dict {
    pub fn new() -> Self {
        let mut dict = Self {
            keywords: HashMap::new(),
            keyword_lookup: HashMap::new(),
            options: HashMap::new(),
            option_lookup: HashMap::new(),
            rest: "-".to_string(),
            percussion: percussion_table(),
            instruments: instrument_table(),
            drumkits: drumkit_table(),
        };
        for kw in Keyword::all() {
            dict.keywords.insert(kw, kw.id().to_string());
        }
        for (key, long, short) in OptKey::defaults() {
            dict.options.insert(key, (long.to_string(), short.to_string()));
        }
        dict.rebuild_lookup();
        dict
    }

    fn rebuild_lookup(&mut self) {
        self.keyword_lookup.clear();
        for (kw, sym) in &self.keywords {
            self.keyword_lookup.insert(sym.to_lowercase(), *kw);
        }
        self.option_lookup.clear();
        for (key, (long, short)) in &self.options {
            self.option_lookup.insert(long.to_lowercase(), *key);
            self.option_lookup.insert(short.to_lowercase(), *key);
        }
    }

    /// Classify a first token as a command keyword (case-insensitive).
    pub fn keyword(&self, token: &str) -> Option<Keyword> {
        self.keyword_lookup.get(&token.to_lowercase()).copied()
    }

    /// Classify an option key (case-insensitive).
    pub fn option(&self, token: &str) -> Option<OptKey> {
        self.option_lookup.get(&token.to_lowercase()).copied()
    }

    /// Rebind the symbol of a builtin keyword or option key.
    ///
    /// `id` is the canonical identifier (e.g. `FUNCTION` or `VELOCITY`);
    /// returns false when no builtin matches.
    pub fn redefine(&mut self, id: &str, symbol: &str) -> bool {
        let id = id.to_uppercase();
        if id == "REST" {
            self.rest = symbol.to_string();
            return true;
        }
        for kw in Keyword::all() {
            if kw.id() == id {
                self.keywords.insert(kw, symbol.to_string());
                self.rebuild_lookup();
                return true;
            }
        }
        for (key, _, _) in OptKey::defaults() {
            if key.id() == id {
                let entry = self.options.get_mut(&key).unwrap();
                entry.0 = symbol.to_string();
                self.rebuild_lookup();
                return true;
            }
        }
        false
    }

    /// The rest symbol (default `-`).
    pub fn is_rest(&self, token: &str) -> bool {
        token.eq_ignore_ascii_case(&self.rest)
    }

    /// True if the token is a plain note name (no octave suffix), a
    /// percussion shortcut or an instrument name. Used to reject chord
    /// names that collide with the builtin dictionaries.
    pub fn collides(&self, name: &str) -> bool {
        let lower = name.to_lowercase();
        parse_note(&lower).is_some()
            || self.percussion.contains_key(lower.as_str())
            || self.is_rest(name)
    }

    /// Percussion shortcut on channel 9.
    pub fn percussion(&self, token: &str) -> Option<u8> {
        self.percussion.get(token.to_lowercase().as_str()).copied()
    }

    /// GM instrument name to program number.
    pub fn instrument(&self, token: &str) -> Option<u8> {
        self.instruments.get(token.to_lowercase().as_str()).copied()
    }

    /// Drumkit name to program number (channel 9).
    pub fn drumkit(&self, token: &str) -> Option<u8> {
        self.drumkits.get(token.to_lowercase().as_str()).copied()
    }
}

impl Default for Dict {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a note name with accidentals and octave marks into a MIDI number.
///
/// The base octave maps `c` to 60. `#` raises and `b` lowers by a semitone,
/// `+`/`-` shift by octaves, either repeated (`c++`) or with a count
/// (`c+2`). Returns None for anything else, including out-of-range results.
pub fn parse_note(token: &str) -> Option<u8> {
    let lower = token.to_lowercase();
    let mut chars = lower.chars().peekable();

    let letter = chars.next()?;
    let base: i32 = match letter {
        'c' => 0,
        'd' => 2,
        'e' => 4,
        'f' => 5,
        'g' => 7,
        'a' => 9,
        'b' => 11,
        _ => return None,
    };

    let mut accidental = 0i32;
    while let Some(&c) = chars.peek() {
        match c {
            '#' => {
                accidental += 1;
                chars.next();
            }
            'b' => {
                accidental -= 1;
                chars.next();
            }
            _ => break,
        }
    }

    let mut octaves = 0i32;
    if let Some(&sign) = chars.peek() {
        if sign == '+' || sign == '-' {
            let dir = if sign == '+' { 1 } else { -1 };
            let mut count = 0i32;
            while chars.peek() == Some(&sign) {
                count += 1;
                chars.next();
            }
            if chars.peek().is_some_and(|c| c.is_ascii_digit()) {
                if count != 1 {
                    return None;
                }
                let mut digits = String::new();
                while let Some(&c) = chars.peek() {
                    if !c.is_ascii_digit() {
                        break;
                    }
                    digits.push(c);
                    chars.next();
                }
                count = digits.parse().ok()?;
            }
            octaves = dir * count;
        }
    }
    if chars.next().is_some() {
        return None;
    }

    let value = 60 + base + accidental + 12 * octaves;
    u8::try_from(value).ok().filter(|&v| v <= 127)
}

/// Major/minor key signature as the number of sharps (positive) or flats
/// (negative), for the MIDI key signature meta event.
pub fn key_signature(semitone: u8, minor: bool) -> i8 {
    const MAJOR: [i8; 12] = [0, -5, 2, -3, 4, -1, 6, 1, -4, 3, -2, 5];
    const MINOR: [i8; 12] = [-3, 4, -1, -6, 1, -4, 3, -2, 5, 0, -5, 2];
    if minor {
        MINOR[(semitone % 12) as usize]
    } else {
        MAJOR[(semitone % 12) as usize]
    }
}

fn percussion_table() -> HashMap<&'static str, u8> {
    HashMap::from([
        ("bd1", 36),
        ("bd2", 35),
        ("stk", 37),
        ("sd1", 38),
        ("clp", 39),
        ("sd2", 40),
        ("hhc", 42),
        ("hhp", 44),
        ("hho", 46),
        ("to1", 50),
        ("to2", 48),
        ("to3", 47),
        ("to4", 45),
        ("to5", 43),
        ("to6", 41),
        ("cr1", 49),
        ("cr2", 57),
        ("rc1", 51),
        ("rc2", 59),
        ("rbl", 53),
        ("tam", 54),
        ("spl", 55),
        ("cow", 56),
        ("chn", 52),
        ("cab", 69),
        ("mar", 70),
        ("cla", 75),
    ])
}

fn instrument_table() -> HashMap<&'static str, u8> {
    HashMap::from([
        ("piano", 0),
        ("e_piano", 4),
        ("harpsichord", 6),
        ("celesta", 8),
        ("organ", 16),
        ("accordion", 21),
        ("guitar", 24),
        ("e_guitar", 27),
        ("bass", 32),
        ("violin", 40),
        ("viola", 41),
        ("cello", 42),
        ("contrabass", 43),
        ("harp", 46),
        ("timpani", 47),
        ("strings", 48),
        ("choir", 52),
        ("trumpet", 56),
        ("trombone", 57),
        ("tuba", 58),
        ("horn", 60),
        ("sax", 65),
        ("oboe", 68),
        ("clarinet", 71),
        ("piccolo", 72),
        ("flute", 73),
    ])
}

fn drumkit_table() -> HashMap<&'static str, u8> {
    HashMap::from([
        ("standard", 0),
        ("room", 8),
        ("power", 16),
        ("electronic", 24),
        ("tr808", 25),
        ("jazz", 32),
        ("brush", 40),
        ("orchestra", 48),
        ("sound_fx", 56),
    ])
}
