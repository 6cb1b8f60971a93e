//! Standard MIDI File reader.
//!
//! Parses the compiler's own output back into typed events. Used by the
//! integration tests and by the `mid2json` binary; handles running status
//! so foreign files also decode.

use crate::error::{Error, Result};
use serde::Serialize;

/// Parsed SMF header chunk.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SmfHeader {
    pub format: u16,
    pub ntracks: u16,
    /// Ticks per quarter note.
    pub division: u16,
}

/// One decoded track event with its absolute tick.
#[derive(Debug, Clone, Serialize)]
pub struct TrackEvent {
    pub tick: u64,
    #[serde(flatten)]
    pub kind: TrackEventKind,
}

/// Decoded event payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrackEventKind {
    NoteOn { channel: u8, note: u8, velocity: u8 },
    NoteOff { channel: u8, note: u8, velocity: u8 },
    ControlChange { channel: u8, controller: u8, value: u8 },
    ProgramChange { channel: u8, program: u8 },
    ChannelPressure { channel: u8, value: u8 },
    PolyPressure { channel: u8, note: u8, value: u8 },
    PitchBend { channel: u8, value: u16 },
    Meta { meta_type: u8, data: Vec<u8> },
    SysEx { data: Vec<u8> },
}

/// Cursor over raw SMF bytes.
pub struct SmfReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SmfReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn err(message: impl Into<String>) -> Error {
        Error::MidiParse(message.into())
    }

    fn read_u8(&mut self) -> Result<u8> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or_else(|| Self::err("unexpected end of data"))?;
        self.pos += 1;
        Ok(b)
    }

    fn read_u16_be(&mut self) -> Result<u16> {
        let hi = self.read_u8()? as u16;
        let lo = self.read_u8()? as u16;
        Ok((hi << 8) | lo)
    }

    fn read_u32_be(&mut self) -> Result<u32> {
        let hi = self.read_u16_be()? as u32;
        let lo = self.read_u16_be()? as u32;
        Ok((hi << 16) | lo)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.pos + len > self.data.len() {
            return Err(Self::err("unexpected end of data"));
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn read_varlen(&mut self) -> Result<u64> {
        let mut value = 0u64;
        for _ in 0..10 {
            let b = self.read_u8()?;
            value = (value << 7) | (b & 0x7F) as u64;
            if b & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(Self::err("variable-length quantity too long"))
    }

    /// Parse the `MThd` chunk.
    pub fn parse_header(&mut self) -> Result<SmfHeader> {
        if self.read_bytes(4)? != &b"MThd"[..] {
            return Err(Self::err("missing MThd"));
        }
        let len = self.read_u32_be()?;
        if len < 6 {
            return Err(Self::err("short MThd chunk"));
        }
        let format = self.read_u16_be()?;
        let ntracks = self.read_u16_be()?;
        let division = self.read_u16_be()?;
        self.read_bytes(len as usize - 6)?;
        Ok(SmfHeader {
            format,
            ntracks,
            division,
        })
    }

    /// Parse all `MTrk` chunks into absolute-tick event lists.
    pub fn parse_tracks(&mut self, header: &SmfHeader) -> Result<Vec<Vec<TrackEvent>>> {
        let mut tracks = Vec::with_capacity(header.ntracks as usize);
        for _ in 0..header.ntracks {
            tracks.push(self.parse_track()?);
        }
        Ok(tracks)
    }

    fn parse_track(&mut self) -> Result<Vec<TrackEvent>> {
        if self.read_bytes(4)? != &b"MTrk"[..] {
            return Err(Self::err("missing MTrk"));
        }
        let len = self.read_u32_be()? as usize;
        let end = self.pos + len;
        if end > self.data.len() {
            return Err(Self::err("truncated MTrk chunk"));
        }

        let mut events = Vec::new();
        let mut tick = 0u64;
        let mut running_status = 0u8;

        while self.pos < end {
            tick += self.read_varlen()?;
            let first = self.read_u8()?;

            let status = if first & 0x80 != 0 {
                first
            } else {
                // Running status: data byte, reuse the last status.
                self.pos -= 1;
                if running_status & 0x80 == 0 {
                    return Err(Self::err("data byte without status"));
                }
                running_status
            };

            let kind = match status {
                0xFF => {
                    let meta_type = self.read_u8()?;
                    let len = self.read_varlen()? as usize;
                    let data = self.read_bytes(len)?.to_vec();
                    if meta_type == 0x2F {
                        self.pos = end;
                        break;
                    }
                    TrackEventKind::Meta { meta_type, data }
                }
                0xF0 | 0xF7 => {
                    let len = self.read_varlen()? as usize;
                    TrackEventKind::SysEx {
                        data: self.read_bytes(len)?.to_vec(),
                    }
                }
                _ => {
                    running_status = status;
                    let channel = status & 0x0F;
                    match status & 0xF0 {
                        0x80 => TrackEventKind::NoteOff {
                            channel,
                            note: self.read_u8()?,
                            velocity: self.read_u8()?,
                        },
                        0x90 => TrackEventKind::NoteOn {
                            channel,
                            note: self.read_u8()?,
                            velocity: self.read_u8()?,
                        },
                        0xA0 => TrackEventKind::PolyPressure {
                            channel,
                            note: self.read_u8()?,
                            value: self.read_u8()?,
                        },
                        0xB0 => TrackEventKind::ControlChange {
                            channel,
                            controller: self.read_u8()?,
                            value: self.read_u8()?,
                        },
                        0xC0 => TrackEventKind::ProgramChange {
                            channel,
                            program: self.read_u8()?,
                        },
                        0xD0 => TrackEventKind::ChannelPressure {
                            channel,
                            value: self.read_u8()?,
                        },
                        0xE0 => {
                            let lo = self.read_u8()? as u16;
                            let hi = self.read_u8()? as u16;
                            TrackEventKind::PitchBend {
                                channel,
                                value: (hi << 7) | lo,
                            }
                        }
                        _ => return Err(Self::err(format!("unknown status byte {:#04x}", status))),
                    }
                }
            };

            events.push(TrackEvent { tick, kind });
        }

        self.pos = end;
        Ok(events)
    }
}
