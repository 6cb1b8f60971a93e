//! Standard MIDI File framing.
//!
//! Serializes a [`Sequence`] as a format 1 SMF: one `MThd` chunk followed by
//! one `MTrk` chunk per track, events delta-encoded in variable-length
//! quantities. Note-offs are written as status `0x8n` with velocity 0.

use super::event::{status, EventData};
use super::sequence::{Sequence, NUM_META_TRACKS};
use std::io::{self, Write};

/// End-of-track meta type byte.
const META_END_OF_TRACK: u8 = 0x2F;

/// Write a sequence as a Standard MIDI File.
pub fn write_smf<W: Write>(seq: &Sequence, out: &mut W) -> io::Result<()> {
    out.write_all(b"MThd")?;
    out.write_all(&6u32.to_be_bytes())?;
    out.write_all(&1u16.to_be_bytes())?;
    out.write_all(&(seq.tracks.len() as u16).to_be_bytes())?;
    out.write_all(&seq.resolution.to_be_bytes())?;

    for (index, track) in seq.tracks.iter().enumerate() {
        let channel = index.checked_sub(NUM_META_TRACKS).map(|c| c as u8);
        let data = encode_track(track, channel);
        out.write_all(b"MTrk")?;
        out.write_all(&(data.len() as u32).to_be_bytes())?;
        out.write_all(&data)?;
    }

    out.flush()
}

fn encode_track(track: &[super::event::Event], channel: Option<u8>) -> Vec<u8> {
    let mut data = Vec::new();
    let mut last_tick = 0u64;

    for event in track {
        write_varlen(&mut data, event.tick - last_tick);
        last_tick = event.tick;

        match &event.data {
            EventData::NoteOn { note, velocity } => {
                let ch = channel.unwrap_or(0);
                data.push(status::NOTE_ON | ch);
                data.push(*note);
                data.push(*velocity);
            }
            EventData::NoteOff { note } => {
                let ch = channel.unwrap_or(0);
                data.push(status::NOTE_OFF | ch);
                data.push(*note);
                data.push(0);
            }
            EventData::ProgramChange { program } => {
                let ch = channel.unwrap_or(0);
                data.push(status::PROGRAM_CHANGE | ch);
                data.push(*program);
            }
            EventData::ControlChange { controller, value } => {
                let ch = channel.unwrap_or(0);
                data.push(status::CONTROL_CHANGE | ch);
                data.push(*controller);
                data.push(*value);
            }
            EventData::Meta { kind, data: bytes } => {
                data.push(0xFF);
                data.push(kind.type_byte());
                write_varlen(&mut data, bytes.len() as u64);
                data.extend_from_slice(bytes);
            }
        }
    }

    // End of track
    write_varlen(&mut data, 0);
    data.push(0xFF);
    data.push(META_END_OF_TRACK);
    data.push(0);

    data
}

/// MIDI variable-length quantity, big-endian 7-bit groups.
fn write_varlen(out: &mut Vec<u8>, mut value: u64) {
    let mut stack = [0u8; 10];
    let mut n = 0;
    stack[n] = (value & 0x7F) as u8;
    n += 1;
    value >>= 7;
    while value > 0 {
        stack[n] = 0x80 | (value & 0x7F) as u8;
        n += 1;
        value >>= 7;
    }
    while n > 0 {
        n -= 1;
        out.push(stack[n]);
    }
}
