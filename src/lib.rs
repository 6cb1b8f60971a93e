pub mod compiler;
pub mod dict;
pub mod error;
pub mod midi;

pub use compiler::Compiler;
pub use error::{Error, ErrorKind, ParseError, Warning};
