use std::fmt;
use std::io;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Parse(#[from] ParseError),

    #[error("MIDI parse error: {0}")]
    MidiParse(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// The closed set of compile error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    LexError,
    UnknownToken,
    BadLength,
    BadOption,
    UnknownVar,
    Redefinition,
    RecursiveCall,
    StructuralMismatch,
    ContextViolation,
    UnknownNote,
    UnknownChannelUse,
    BankOutOfRange,
    IncludeFailure,
    IncludeCycle,
    FileNotFound,
}

/// A located compile error.
///
/// Carries the source file, the 1-based line number, an optional column,
/// the error category and a short message.
#[derive(Debug, Clone)]
pub struct ParseError {
    pub file: PathBuf,
    pub line: usize,
    pub column: Option<usize>,
    pub kind: ErrorKind,
    pub message: String,
}

impl ParseError {
    pub fn new(
        file: impl Into<PathBuf>,
        line: usize,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            file: file.into(),
            line,
            column: None,
            kind,
            message: message.into(),
        }
    }

    pub fn with_column(mut self, column: usize) -> Self {
        self.column = Some(column);
        self
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.column {
            Some(col) => write!(
                f,
                "{:?} at {}:{}:{}: {}",
                self.kind,
                self.file.display(),
                self.line,
                col,
                self.message
            ),
            None => write!(
                f,
                "{:?} at {}:{}: {}",
                self.kind,
                self.file.display(),
                self.line,
                self.message
            ),
        }
    }
}

impl std::error::Error for ParseError {}

/// A non-fatal finding collected during compilation.
#[derive(Debug, Clone)]
pub struct Warning {
    pub file: PathBuf,
    pub line: usize,
    pub message: String,
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "warning at {}:{}: {}",
            self.file.display(),
            self.line,
            self.message
        )
    }
}
