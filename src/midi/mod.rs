pub mod event;
pub mod json;
pub mod reader;
pub mod sequence;
pub mod writer;

pub use event::{Event, EventData, MetaKind};
pub use json::SmfJson;
pub use reader::{SmfHeader, SmfReader, TrackEvent, TrackEventKind};
pub use sequence::{Sequence, SequenceBuilder};
pub use writer::write_smf;
