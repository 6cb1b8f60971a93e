//! Per-channel state.

use num_rational::Ratio;

/// Default key stroke velocity.
pub const DEFAULT_VELOCITY: u8 = 64;

/// State of one of the sixteen logical MIDI channels.
///
/// Mutated only by the executor. `velocity` and `duration_ratio` are sticky
/// defaults: a channel command that sets them (explicitly or through an
/// enclosing block header) changes them for everything that follows.
#[derive(Debug, Clone)]
pub struct ChannelState {
    /// Position of the next event on this channel, in ticks.
    pub current_tick: u64,
    /// MIDI program number.
    pub program: u8,
    pub bank_msb: u8,
    pub bank_lsb: u8,
    /// Default key stroke velocity (1..127).
    pub velocity: u8,
    /// Fraction of a note's length that is actually held.
    pub duration_ratio: Ratio<u64>,
    /// Sticky semitone shift applied to every note number.
    pub octave_shift: i32,
    /// Track name from the INSTRUMENTS block.
    pub name: String,
    /// Set when the channel appears in an INSTRUMENTS block.
    pub declared: bool,
    /// Set once the channel is declared or has executed a command. Global
    /// directives synchronize only these channels.
    pub used: bool,
}

impl Default for ChannelState {
    fn default() -> Self {
        Self {
            current_tick: 0,
            program: 0,
            bank_msb: 0,
            bank_lsb: 0,
            velocity: DEFAULT_VELOCITY,
            duration_ratio: Ratio::from_integer(1),
            octave_shift: 0,
            name: String::new(),
            declared: false,
            used: false,
        }
    }
}
