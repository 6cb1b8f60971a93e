//! JSON models for decoded SMF data.

use super::reader::{SmfHeader, TrackEvent, TrackEventKind};
use serde::Serialize;

/// Top-level JSON structure for a `.mid` file.
#[derive(Debug, Serialize)]
pub struct SmfJson {
    pub format: u16,
    /// Ticks per quarter note.
    pub division: u16,
    pub tracks: Vec<TrackJson>,
}

/// One track's events.
#[derive(Debug, Serialize)]
pub struct TrackJson {
    pub events: Vec<EventJson>,
}

/// One event with absolute tick and, for text-like metas, the decoded text.
#[derive(Debug, Serialize)]
pub struct EventJson {
    pub tick: u64,
    #[serde(flatten)]
    pub kind: TrackEventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl SmfJson {
    pub fn new(header: &SmfHeader, tracks: Vec<Vec<TrackEvent>>) -> Self {
        let tracks = tracks
            .into_iter()
            .map(|events| TrackJson {
                events: events.into_iter().map(EventJson::from).collect(),
            })
            .collect();
        Self {
            format: header.format,
            division: header.division,
            tracks,
        }
    }
}

impl From<TrackEvent> for EventJson {
    fn from(event: TrackEvent) -> Self {
        let text = match &event.kind {
            // Text-carrying meta types (text .. cue point)
            TrackEventKind::Meta { meta_type, data } if (0x01..=0x07).contains(meta_type) => {
                String::from_utf8(data.clone()).ok()
            }
            _ => None,
        };
        Self {
            tick: event.tick,
            kind: event.kind,
            text,
        }
    }
}
