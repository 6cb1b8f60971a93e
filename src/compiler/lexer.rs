//! Logical line splitting and line classification.
//!
//! A logical line ends at a newline outside a quoted span; a trailing `\`
//! joins the next physical line. `//` at a token boundary starts a line
//! comment. The classifier only looks at the literal first token, so a line
//! whose command arrives via `$name` expansion stays deferred until pass 2.

use crate::dict::{Dict, Keyword};
use crate::error::{ErrorKind, ParseError};
use std::path::PathBuf;
use std::sync::Arc;

/// One logical source line with its origin.
#[derive(Debug, Clone)]
pub struct Line {
    pub file: Arc<PathBuf>,
    pub number: usize,
    pub text: String,
}

impl Line {
    pub fn error(&self, kind: ErrorKind, message: impl Into<String>) -> ParseError {
        ParseError::new(self.file.as_ref().clone(), self.number, kind, message)
    }
}

/// Command category of a logical line, by first token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    /// `<ch> <note|chord|rest> <length> [options]`
    ChannelCmd,
    /// tempo / time / key
    Global(Keyword),
    FunctionOpen,
    End,
    BlockOpen,
    BlockClose,
    Call,
    Include,
    IncludeFile,
    Var,
    Const,
    Chord,
    Define,
    Instruments,
    Meta,
    SoftKaraoke,
    /// First token is a `$name` reference; classified again after expansion.
    Deferred,
    Unknown,
}

/// Split source text into logical lines.
pub fn logical_lines(text: &str, file: &Arc<PathBuf>) -> Result<Vec<Line>, ParseError> {
    let mut lines = Vec::new();
    let mut buffer = String::new();
    let mut start_number = 0usize;
    let mut in_quote = false;

    for (idx, raw) in text.lines().enumerate() {
        let number = idx + 1;
        let stripped = strip_comment(raw, &mut in_quote);

        if buffer.is_empty() {
            start_number = number;
        }

        if in_quote {
            // Quoted span continues onto the next physical line.
            buffer.push_str(stripped);
            buffer.push('\n');
            continue;
        }

        let trimmed_end = stripped.trim_end();
        if let Some(continued) = trimmed_end.strip_suffix('\\') {
            buffer.push_str(continued);
            buffer.push(' ');
            continue;
        }

        buffer.push_str(trimmed_end);
        let logical = buffer.trim().to_string();
        buffer.clear();
        if !logical.is_empty() {
            lines.push(Line {
                file: Arc::clone(file),
                number: start_number,
                text: logical,
            });
        }
    }

    if in_quote {
        return Err(ParseError::new(
            file.as_ref().clone(),
            start_number,
            ErrorKind::LexError,
            "unterminated quote at end of file",
        ));
    }
    if !buffer.trim().is_empty() {
        return Err(ParseError::new(
            file.as_ref().clone(),
            start_number,
            ErrorKind::LexError,
            "line continuation at end of file",
        ));
    }

    Ok(lines)
}

/// Remove a `//` comment outside quoted spans. `in_quote` carries the quote
/// state across physical lines.
fn strip_comment<'a>(raw: &'a str, in_quote: &mut bool) -> &'a str {
    let bytes = raw.as_bytes();
    let mut prev_is_space = true;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b == b'"' {
            *in_quote = !*in_quote;
        } else if !*in_quote && prev_is_space && b == b'/' && bytes.get(i + 1) == Some(&b'/') {
            return &raw[..i];
        }
        prev_is_space = b.is_ascii_whitespace();
        i += 1;
    }
    raw
}

/// Split off the first whitespace-delimited token.
pub fn split_first_token(text: &str) -> (&str, &str) {
    let trimmed = text.trim_start();
    match trimmed.find(char::is_whitespace) {
        Some(pos) => (&trimmed[..pos], trimmed[pos..].trim_start()),
        None => (trimmed, ""),
    }
}

/// Classify a logical line by its literal first token.
pub fn classify(line: &Line, dict: &Dict) -> LineKind {
    let (first, _) = split_first_token(&line.text);

    if first.starts_with('{') {
        return LineKind::BlockOpen;
    }
    if first.starts_with('}') {
        return LineKind::BlockClose;
    }
    if first.starts_with('$') {
        return LineKind::Deferred;
    }

    if let Some(kw) = dict.keyword(first) {
        return match kw {
            Keyword::Function => LineKind::FunctionOpen,
            Keyword::End => LineKind::End,
            Keyword::Call => LineKind::Call,
            Keyword::Include => LineKind::Include,
            Keyword::IncludeFile => LineKind::IncludeFile,
            Keyword::Var => LineKind::Var,
            Keyword::Const => LineKind::Const,
            Keyword::Chord => LineKind::Chord,
            Keyword::Define => LineKind::Define,
            Keyword::Instruments => LineKind::Instruments,
            Keyword::Meta => LineKind::Meta,
            Keyword::SoftKaraoke => LineKind::SoftKaraoke,
            Keyword::Tempo | Keyword::Time | Keyword::Key => LineKind::Global(kw),
        };
    }

    if parse_channel(first).is_some() {
        return LineKind::ChannelCmd;
    }

    LineKind::Unknown
}

/// Parse a channel reference: `0`..`15` or `p` for the percussion channel.
pub fn parse_channel(token: &str) -> Option<u8> {
    if token.eq_ignore_ascii_case("p") {
        return Some(9);
    }
    token.parse::<u8>().ok().filter(|&ch| ch < 16)
}
