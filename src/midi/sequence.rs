//! Sequence builder.
//!
//! Accepts ordered channel and meta events and assembles the tick-stamped
//! sequence handed to exporters. Events are grouped per track in a
//! tick-keyed map, so equal-tick events keep their insertion order.

use super::event::{controller, Event, EventData, MetaKind};
use std::collections::BTreeMap;

/// Number of non-channel tracks: track 0 carries tempo, signatures, text
/// and markers, track 2 the lyrics timeline; track 1 is reserved for
/// karaoke-related events.
pub const NUM_META_TRACKS: usize = 3;

/// Total number of tracks (meta tracks plus sixteen channels).
pub const NUM_TRACKS: usize = NUM_META_TRACKS + 16;

/// Default sequence resolution in ticks per quarter note.
pub const DEFAULT_RESOLUTION: u16 = 480;

/// A finished, per-track tick-sorted sequence.
#[derive(Debug, Clone)]
pub struct Sequence {
    pub resolution: u16,
    /// `NUM_TRACKS` tracks; index `NUM_META_TRACKS + c` is channel `c`.
    pub tracks: Vec<Vec<Event>>,
}

impl Sequence {
    /// Events of one channel's track.
    pub fn channel_events(&self, channel: u8) -> &[Event] {
        &self.tracks[NUM_META_TRACKS + channel as usize]
    }

    /// The largest tick used by any track.
    pub fn tick_length(&self) -> u64 {
        self.tracks
            .iter()
            .filter_map(|t| t.last().map(|e| e.tick))
            .max()
            .unwrap_or(0)
    }
}

/// Collects events during compilation and produces the [`Sequence`].
#[derive(Debug)]
pub struct SequenceBuilder {
    resolution: u16,
    tracks: Vec<BTreeMap<u64, Vec<EventData>>>,
}

impl SequenceBuilder {
    pub fn new(resolution: u16) -> Self {
        Self {
            resolution,
            tracks: (0..NUM_TRACKS).map(|_| BTreeMap::new()).collect(),
        }
    }

    pub fn resolution(&self) -> u16 {
        self.resolution
    }

    fn push(&mut self, track: usize, tick: u64, data: EventData) {
        self.tracks[track].entry(tick).or_default().push(data);
    }

    fn channel_track(channel: u8) -> usize {
        NUM_META_TRACKS + channel as usize
    }

    pub fn emit_note_on(&mut self, channel: u8, note: u8, velocity: u8, tick: u64) {
        self.push(
            Self::channel_track(channel),
            tick,
            EventData::NoteOn { note, velocity },
        );
    }

    pub fn emit_note_off(&mut self, channel: u8, note: u8, tick: u64) {
        self.push(Self::channel_track(channel), tick, EventData::NoteOff { note });
    }

    pub fn emit_program_change(&mut self, channel: u8, program: u8, tick: u64) {
        self.push(
            Self::channel_track(channel),
            tick,
            EventData::ProgramChange { program },
        );
    }

    /// Bank select control change pair. The LSB message is only sent when
    /// nonzero.
    pub fn emit_bank_select(&mut self, channel: u8, msb: u8, lsb: u8, tick: u64) {
        let track = Self::channel_track(channel);
        self.push(
            track,
            tick,
            EventData::ControlChange {
                controller: controller::BANK_MSB,
                value: msb,
            },
        );
        if lsb != 0 {
            self.push(
                track,
                tick,
                EventData::ControlChange {
                    controller: controller::BANK_LSB,
                    value: lsb,
                },
            );
        }
    }

    /// Instrument name meta event on the channel's own track.
    pub fn emit_instrument_name(&mut self, channel: u8, name: &str, tick: u64) {
        self.push(
            Self::channel_track(channel),
            tick,
            EventData::Meta {
                kind: MetaKind::InstrumentName,
                data: name.as_bytes().to_vec(),
            },
        );
    }

    /// Meta event on one of the meta tracks.
    pub fn emit_meta(&mut self, track: usize, kind: MetaKind, data: Vec<u8>, tick: u64) {
        self.push(track, tick, EventData::Meta { kind, data });
    }

    /// Flatten the per-tick queues into the final sequence.
    pub fn finish(self) -> Sequence {
        let tracks = self
            .tracks
            .into_iter()
            .map(|track| {
                track
                    .into_iter()
                    .flat_map(|(tick, events)| {
                        events.into_iter().map(move |data| Event { tick, data })
                    })
                    .collect()
            })
            .collect();
        Sequence {
            resolution: self.resolution,
            tracks,
        }
    }
}
