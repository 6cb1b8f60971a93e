//! Integration tests for MPL compilation
//!
//! These tests compile MPL source to a sequence and verify the emitted
//! events, tick bookkeeping and error reporting. The SMF framing is
//! verified by writing a sequence out and reading it back with the crate's
//! own reader.

use std::io::Cursor;
use std::io::Write;
use tempfile::tempdir;

use mplc::compiler::length::parse_duration;
use mplc::midi::sequence::NUM_TRACKS;
use mplc::midi::{EventData, MetaKind, Sequence, SmfReader, TrackEventKind};
use mplc::{Compiler, Error, ErrorKind, ParseError};

/// Helper to compile MPL source, panicking on errors.
fn compile(mpl: &str) -> (Compiler, Sequence) {
    let mut compiler = Compiler::new();
    let seq = compiler
        .compile(Cursor::new(mpl))
        .expect("compilation failed");
    (compiler, seq)
}

/// Helper to compile MPL source that is expected to fail.
fn compile_err(mpl: &str) -> ParseError {
    let mut compiler = Compiler::new();
    match compiler.compile(Cursor::new(mpl)) {
        Err(Error::Parse(e)) => e,
        Err(other) => panic!("expected a parse error, got {:?}", other),
        Ok(_) => panic!("expected a parse error, got a sequence"),
    }
}

/// All note-on events of a channel as (tick, note, velocity).
fn note_ons(seq: &Sequence, channel: u8) -> Vec<(u64, u8, u8)> {
    seq.channel_events(channel)
        .iter()
        .filter_map(|e| match e.data {
            EventData::NoteOn { note, velocity } => Some((e.tick, note, velocity)),
            _ => None,
        })
        .collect()
}

/// All note-off events of a channel as (tick, note).
fn note_offs(seq: &Sequence, channel: u8) -> Vec<(u64, u8)> {
    seq.channel_events(channel)
        .iter()
        .filter_map(|e| match e.data {
            EventData::NoteOff { note } => Some((e.tick, note)),
            _ => None,
        })
        .collect()
}

/// All meta events of the given kind on a meta track as (tick, data).
fn meta_events(seq: &Sequence, track: usize, kind: MetaKind) -> Vec<(u64, Vec<u8>)> {
    seq.tracks[track]
        .iter()
        .filter_map(|e| match &e.data {
            EventData::Meta { kind: k, data } if *k == kind => Some((e.tick, data.clone())),
            _ => None,
        })
        .collect()
}

// =============================================================================
// Length parsing
// =============================================================================

#[test]
fn test_parse_duration() {
    assert_eq!(60, parse_duration("/32", 480).unwrap());
    assert_eq!(120, parse_duration("/16", 480).unwrap());
    assert_eq!(240, parse_duration("/8", 480).unwrap());
    assert_eq!(480, parse_duration("/4", 480).unwrap());
    assert_eq!(960, parse_duration("/2", 480).unwrap());
    assert_eq!(1920, parse_duration("/1", 480).unwrap());
    assert_eq!(1920, parse_duration("*1", 480).unwrap());
    assert_eq!(3840, parse_duration("*2", 480).unwrap());
    assert_eq!(7680, parse_duration("*4", 480).unwrap());
    assert_eq!(15360, parse_duration("*8", 480).unwrap());
    assert_eq!(30720, parse_duration("*16", 480).unwrap());
    assert_eq!(61440, parse_duration("*32", 480).unwrap());
    assert_eq!(480, parse_duration("4", 480).unwrap());
    assert_eq!(384, parse_duration("5", 480).unwrap());
    assert_eq!(11520, parse_duration("*4.", 480).unwrap());
    assert_eq!(13440, parse_duration("*4..", 480).unwrap());
    assert_eq!(14400, parse_duration("*4...", 480).unwrap());
    assert_eq!(5120, parse_duration("*4t", 480).unwrap());
    assert_eq!(3413, parse_duration("*4tt", 480).unwrap());
    assert_eq!(2276, parse_duration("*4ttt", 480).unwrap());
    assert_eq!(4389, parse_duration("*4t7:4", 480).unwrap());
    assert_eq!(2508, parse_duration("*4t7:4t7:4", 480).unwrap());
    assert_eq!(2006, parse_duration("*4t7:4t7:4t5:4", 480).unwrap());
    assert_eq!(480, parse_duration("/4t7:4t4:7t7:4t4:7", 480).unwrap());
    assert_eq!(2508 + 3413, parse_duration("*4t7:4t7:4+*4tt", 480).unwrap());
    assert_eq!(480 + 60 + 1920, parse_duration("4+32+1", 480).unwrap());

    assert!(parse_duration("/64", 480).is_err());
    assert!(parse_duration("*64", 480).is_err());
    assert!(parse_duration("xyz", 480).is_err());
    assert!(parse_duration("/4+", 480).is_err());
    assert!(parse_duration("", 480).is_err());
    assert!(parse_duration("4t7", 480).is_err());
    assert!(parse_duration("4t7:", 480).is_err());
}

// =============================================================================
// Basic channel commands
// =============================================================================

#[test]
fn test_single_note() {
    let (compiler, seq) = compile("0 c /4\n");
    assert_eq!(vec![(0, 60, 64)], note_ons(&seq, 0));
    assert_eq!(vec![(480, 60)], note_offs(&seq, 0));
    assert_eq!(480, compiler.channels[0].current_tick);
}

#[test]
fn test_note_names_and_octaves() {
    let (_, seq) = compile("0 c# /4\n0 db+ /4\n0 c+2 /4\n0 c- /4\n0 a#- /4\n");
    let ons = note_ons(&seq, 0);
    assert_eq!(
        vec![(0, 61, 64), (480, 73, 64), (960, 84, 64), (1440, 48, 64), (1920, 58, 64)],
        ons
    );
}

#[test]
fn test_numeric_note() {
    let (_, seq) = compile("3 72 /8\n");
    assert_eq!(vec![(0, 72, 64)], note_ons(&seq, 3));
    assert_eq!(vec![(240, 72)], note_offs(&seq, 3));
}

#[test]
fn test_rest_advances_without_events() {
    let (compiler, seq) = compile("0 - /2\n0 c /4\n");
    assert_eq!(vec![(960, 60, 64)], note_ons(&seq, 0));
    assert_eq!(1440, compiler.channels[0].current_tick);
}

#[test]
fn test_empty_program() {
    let (_, seq) = compile("");
    assert_eq!(0, seq.tick_length());
    assert_eq!(NUM_TRACKS, seq.tracks.len());
}

#[test]
fn test_comments_and_continuation() {
    let (_, seq) = compile("// leading comment\n0 c /4, \\\n   v=99 // trailing comment\n");
    assert_eq!(vec![(0, 60, 99)], note_ons(&seq, 0));
}

// =============================================================================
// Options
// =============================================================================

#[test]
fn test_duration_ratio() {
    let (compiler, seq) = compile("0 c /4 d=50%\n");
    assert_eq!(vec![(0, 60, 64)], note_ons(&seq, 0));
    assert_eq!(vec![(240, 60)], note_offs(&seq, 0));
    // d affects only the note-off, never the advance.
    assert_eq!(480, compiler.channels[0].current_tick);
}

#[test]
fn test_duration_ratio_is_sticky() {
    let (_, seq) = compile("0 c /4 d=50%\n0 c /4\n0 c /4 d=1.0\n");
    assert_eq!(vec![(240, 60), (720, 60), (1440, 60)], note_offs(&seq, 0));
}

#[test]
fn test_velocity_sticky_and_block_inheritance() {
    let mpl = "\
0 c /4 v=30
0 c /4
{ v=80
	0 c /4
}
0 c /4
";
    let (_, seq) = compile(mpl);
    let velocities: Vec<u8> = note_ons(&seq, 0).iter().map(|&(_, _, v)| v).collect();
    assert_eq!(vec![30, 30, 80, 80], velocities);
}

#[test]
fn test_quantity_on_channel_command() {
    let (compiler, seq) = compile("0 c /4, q=2, q=3\n");
    assert_eq!(6, note_ons(&seq, 0).len());
    assert_eq!(2880, compiler.channels[0].current_tick);
}

#[test]
fn test_quantity_zero_advances_without_events() {
    let (compiler, seq) = compile("0 c /4, q=0\n");
    assert!(note_ons(&seq, 0).is_empty());
    assert_eq!(480, compiler.channels[0].current_tick);
    assert!(!compiler.warnings().is_empty());
}

#[test]
fn test_multiple_on_channel_command_stacks_notes() {
    let (compiler, seq) = compile("0 c /4, m\n0 e /4\n");
    assert_eq!(vec![(0, 60, 64), (0, 64, 64)], note_ons(&seq, 0));
    assert_eq!(480, compiler.channels[0].current_tick);
}

#[test]
fn test_repeated_option_is_rejected() {
    let e = compile_err("0 c /4, v=10, v=20\n");
    assert_eq!(ErrorKind::BadOption, e.kind);
}

#[test]
fn test_unknown_option_is_rejected() {
    let e = compile_err("0 c /4, vel0city=10\n");
    assert_eq!(ErrorKind::BadOption, e.kind);
}

#[test]
fn test_tremolo_subdivision() {
    let (compiler, seq) = compile("0 c /2 tr=4\n");
    let ons = note_ons(&seq, 0);
    assert_eq!(vec![0, 240, 480, 720], ons.iter().map(|&(t, _, _)| t).collect::<Vec<_>>());
    assert_eq!(vec![240, 480, 720, 960], note_offs(&seq, 0).iter().map(|&(t, _)| t).collect::<Vec<_>>());
    assert_eq!(960, compiler.channels[0].current_tick);
}

#[test]
fn test_tremolo_remainder_goes_to_last_subnote() {
    let (compiler, seq) = compile("0 c /4 tr=7\n");
    assert_eq!(7, note_ons(&seq, 0).len());
    // The advance is exactly the note length despite 480 % 7 != 0.
    assert_eq!(480, compiler.channels[0].current_tick);
    assert_eq!(480, note_offs(&seq, 0).last().unwrap().0);
}

#[test]
fn test_lyrics_attach_to_events_and_rests() {
    let (_, seq) = compile("0 c /4 l=hap_py\\c\n0 - /4 l=birth_day\n");
    let lyrics = meta_events(&seq, 2, MetaKind::Lyrics);
    assert_eq!(2, lyrics.len());
    assert_eq!((0, b"hap py,".to_vec()), lyrics[0]);
    assert_eq!((480, b"birth day".to_vec()), lyrics[1]);
}

// =============================================================================
// Blocks, functions and option propagation
// =============================================================================

#[test]
fn test_nested_function_and_block_propagation() {
    let mpl = "\
FUNCTION test1
	0 c /2
	{ q=2
		0 c /2
		0 c /4, m
	}
	0 c /4, q=2
END
FUNCTION test2
	0 c *2
	CALL test1
END
FUNCTION test3
	CALL test1
	CALL test4
END
FUNCTION test4
	{ q=4
		0 c /4
	}
END
CALL test1
CALL test2, q=3, m
CALL test3
0 c /4
0 c /4, m
0 c /2
";
    let (compiler, _) = compile(mpl);
    assert_eq!(11040, compiler.channels[0].current_tick);
}

#[test]
fn test_block_with_multiple_leaves_ticks_unchanged() {
    let mpl = "\
0 c /4
{ m
	0 c /1
	1 d /2
}
";
    let (compiler, _) = compile(mpl);
    assert_eq!(480, compiler.channels[0].current_tick);
    assert_eq!(0, compiler.channels[1].current_tick);
}

#[test]
fn test_block_quantity_equals_unrolled_body() {
    let repeated = "{ q=3\n\t0 c /4\n\t0 e /8\n}\n";
    let unrolled = "0 c /4\n0 e /8\n0 c /4\n0 e /8\n0 c /4\n0 e /8\n";
    let (_, seq_a) = compile(repeated);
    let (_, seq_b) = compile(unrolled);
    assert_eq!(seq_a.tracks, seq_b.tracks);
}

#[test]
fn test_block_options_on_closing_brace() {
    let mpl = "\
{
	0 c /4
} q=2
";
    let (compiler, seq) = compile(mpl);
    assert_eq!(2, note_ons(&seq, 0).len());
    assert_eq!(960, compiler.channels[0].current_tick);
}

#[test]
fn test_block_quantity_zero_runs_nothing() {
    let mpl = "\
0 c /4
{ q=0
	0 c /1
}
";
    let (compiler, seq) = compile(mpl);
    assert_eq!(1, note_ons(&seq, 0).len());
    assert_eq!(480, compiler.channels[0].current_tick);
}

#[test]
fn test_shift_composes_through_frames() {
    let mpl = "\
FUNCTION play
	0 c /4
END
CALL play
CALL play, s=12
CALL play, s=-12
{ s=12
	CALL play, s=12
}
";
    let (_, seq) = compile(mpl);
    let notes: Vec<u8> = note_ons(&seq, 0).iter().map(|&(_, n, _)| n).collect();
    assert_eq!(vec![60, 72, 48, 84], notes);
}

#[test]
fn test_shift_on_command_is_sticky() {
    let (_, seq) = compile("0 c /4, s=12\n0 c /4\n0 c /4, s=-12\n");
    let notes: Vec<u8> = note_ons(&seq, 0).iter().map(|&(_, n, _)| n).collect();
    // s adds to the channel's octave shift and stays in effect.
    assert_eq!(vec![72, 72, 60], notes);
}

#[test]
fn test_multiple_block_keeps_shift_mutation() {
    let mpl = "\
{ m
	0 c /4, s=12
}
0 c /4
";
    let (compiler, seq) = compile(mpl);
    // m restores ticks only; the sticky shift survives the block.
    assert_eq!(vec![(0, 72, 64), (0, 72, 64)], note_ons(&seq, 0));
    assert_eq!(480, compiler.channels[0].current_tick);
    assert_eq!(12, compiler.channels[0].octave_shift);
}

#[test]
fn test_call_before_definition() {
    let mpl = "\
CALL later
FUNCTION later
	0 c /4
END
";
    let (compiler, seq) = compile(mpl);
    assert_eq!(1, note_ons(&seq, 0).len());
    assert_eq!(480, compiler.channels[0].current_tick);
}

#[test]
fn test_recursive_call_is_rejected() {
    let mpl = "\
FUNCTION a
	CALL a
END
CALL a
";
    let e = compile_err(mpl);
    assert_eq!(ErrorKind::RecursiveCall, e.kind);
}

#[test]
fn test_indirect_recursion_is_rejected() {
    let mpl = "\
FUNCTION a
	CALL b
END
FUNCTION b
	CALL a
END
CALL a
";
    let e = compile_err(mpl);
    assert_eq!(ErrorKind::RecursiveCall, e.kind);
}

#[test]
fn test_undefined_function_is_rejected() {
    let e = compile_err("CALL nothing\n");
    assert_eq!(ErrorKind::UnknownToken, e.kind);
}

#[test]
fn test_function_redefinition_is_rejected() {
    let mpl = "\
FUNCTION a
	0 c /4
END
FUNCTION a
	0 d /4
END
";
    let e = compile_err(mpl);
    assert_eq!(ErrorKind::Redefinition, e.kind);
    assert_eq!(4, e.line);
}

// =============================================================================
// Chords
// =============================================================================

#[test]
fn test_chord_events_share_ticks() {
    let mpl = "\
CHORD cmaj = c,e,g
0 cmaj /4 d=50%
";
    let (compiler, seq) = compile(mpl);
    assert_eq!(vec![(0, 60, 64), (0, 64, 64), (0, 67, 64)], note_ons(&seq, 0));
    assert_eq!(vec![(240, 60), (240, 64), (240, 67)], note_offs(&seq, 0));
    assert_eq!(480, compiler.channels[0].current_tick);
}

#[test]
fn test_chord_name_collision_is_rejected() {
    let e = compile_err("CHORD c = c,d\n");
    assert_eq!(ErrorKind::Redefinition, e.kind);
}

#[test]
fn test_chord_redefinition_is_rejected() {
    let mpl = "\
CHORD x1 = c,e
CHORD x1 = c,e
";
    let e = compile_err(mpl);
    assert_eq!(ErrorKind::Redefinition, e.kind);
    assert_eq!(2, e.line);
}

#[test]
fn test_chord_duplicate_note_is_rejected() {
    let e = compile_err("CHORD x1 = c,c\n");
    assert_eq!(ErrorKind::BadOption, e.kind);
}

#[test]
fn test_chord_with_unknown_note_is_rejected() {
    let e = compile_err("CHORD x1 = c,zz\n");
    assert_eq!(ErrorKind::UnknownNote, e.kind);
}

// =============================================================================
// Global directives
// =============================================================================

#[test]
fn test_tempo_synchronizes_channels() {
    let mpl = "\
0 c /2
1 e /4
tempo 90
0 c /4
";
    let (compiler, seq) = compile(mpl);
    let tempos = meta_events(&seq, 0, MetaKind::SetTempo);
    // 60_000_000 / 90 = 666666 microseconds per quarter.
    assert_eq!(vec![(960, vec![0x0A, 0x2C, 0x2A])], tempos);
    // The slower channel is fast-forwarded to the directive tick.
    assert_eq!(960, compiler.channels[1].current_tick);
    assert_eq!(vec![(0, 60, 64), (960, 60, 64)], note_ons(&seq, 0));
}

#[test]
fn test_time_signature() {
    let (_, seq) = compile("time 6/8\n0 c /4\n");
    assert_eq!(
        vec![(0, vec![6, 3, 24, 8])],
        meta_events(&seq, 0, MetaKind::TimeSig)
    );
}

#[test]
fn test_key_signature() {
    let (_, seq) = compile("key d/maj\n0 c /4\n");
    assert_eq!(vec![(0, vec![2, 0])], meta_events(&seq, 0, MetaKind::KeySig));

    let (_, seq) = compile("key a/min\n0 c /4\n");
    assert_eq!(vec![(0, vec![0, 1])], meta_events(&seq, 0, MetaKind::KeySig));

    let (_, seq) = compile("key bb/maj\n0 c /4\n");
    assert_eq!(vec![(0, vec![254, 0])], meta_events(&seq, 0, MetaKind::KeySig));
}

#[test]
fn test_global_directive_skips_unused_channels() {
    let mpl = "\
0 c /2
tempo 90
1 c /4
";
    let (compiler, seq) = compile(mpl);
    // Channel 1 was untouched before the directive, so its first note
    // still starts at tick 0.
    assert_eq!(vec![(0, 60, 64)], note_ons(&seq, 1));
    assert_eq!(480, compiler.channels[1].current_tick);
    assert_eq!(960, compiler.channels[0].current_tick);
}

#[test]
fn test_global_directive_synchronizes_declared_idle_channels() {
    let mpl = "\
INSTRUMENTS
	0 piano Piano
	1 violin Violin
END
0 c /2
tempo 90
1 c /4
";
    let (compiler, seq) = compile(mpl);
    // Channel 1 is declared, so it is fast-forwarded even though it has
    // not played yet.
    assert_eq!(vec![(960, 60, 64)], note_ons(&seq, 1));
    assert_eq!(1440, compiler.channels[1].current_tick);
}

#[test]
fn test_global_inside_block_is_rejected() {
    let e = compile_err("{\n\ttempo 120\n}\n");
    assert_eq!(ErrorKind::ContextViolation, e.kind);
    assert_eq!(2, e.line);
}

// =============================================================================
// INSTRUMENTS
// =============================================================================

#[test]
fn test_instruments_with_bank_numbers() {
    let mpl = "\
INSTRUMENTS
	0 piano Piano
	1 2,0/0 Second
	10 24,120/0 Tenth
	15 24,120/1 Last
END
0 c /4
";
    let (compiler, seq) = compile(mpl);
    assert_eq!(0, compiler.channels[0].program);
    assert_eq!(2, compiler.channels[1].program);
    assert_eq!(0, compiler.channels[1].bank_msb);
    assert_eq!(0, compiler.channels[1].bank_lsb);
    assert_eq!(24, compiler.channels[10].program);
    assert_eq!(120, compiler.channels[10].bank_msb);
    assert_eq!(0, compiler.channels[10].bank_lsb);
    assert_eq!(24, compiler.channels[15].program);
    assert_eq!(120, compiler.channels[15].bank_msb);
    assert_eq!(1, compiler.channels[15].bank_lsb);

    // Bank select CC pair precedes the program change on channel 15.
    let events = seq.channel_events(15);
    assert_eq!(
        EventData::ControlChange { controller: 0x00, value: 120 },
        events[0].data
    );
    assert_eq!(
        EventData::ControlChange { controller: 0x20, value: 1 },
        events[1].data
    );
    assert!(events
        .iter()
        .any(|e| e.data == EventData::ProgramChange { program: 24 }));
}

#[test]
fn test_instruments_full_bank_number_splits() {
    let mpl = "\
INSTRUMENTS
	1 2,129 Split
END
1 c /4
";
    let (compiler, _) = compile(mpl);
    assert_eq!(1, compiler.channels[1].bank_msb);
    assert_eq!(1, compiler.channels[1].bank_lsb);
}

#[test]
fn test_instruments_bank_out_of_range() {
    let e = compile_err("INSTRUMENTS\n\t1 2,200/0 X\nEND\n");
    assert_eq!(ErrorKind::BankOutOfRange, e.kind);

    let e = compile_err("INSTRUMENTS\n\t1 2,20000 X\nEND\n");
    assert_eq!(ErrorKind::BankOutOfRange, e.kind);
}

#[test]
fn test_instrument_name_meta_and_program_change() {
    let mpl = "\
INSTRUMENTS
	1 violin My Violin
END
1 c /4
";
    let (compiler, seq) = compile(mpl);
    assert_eq!(40, compiler.channels[1].program);
    assert_eq!("My Violin", compiler.channels[1].name);
    let events = seq.channel_events(1);
    assert_eq!(
        EventData::Meta {
            kind: MetaKind::InstrumentName,
            data: b"My Violin".to_vec()
        },
        events[0].data
    );
    assert_eq!(EventData::ProgramChange { program: 40 }, events[1].data);
}

#[test]
fn test_drumkit_by_name() {
    let mpl = "\
INSTRUMENTS
	p room Test Room
END
p bd1 /4
";
    let (compiler, _) = compile(mpl);
    assert_eq!(8, compiler.channels[9].program);
    assert_eq!("Test Room", compiler.channels[9].name);
}

#[test]
fn test_drumkit_by_number() {
    let mpl = "\
INSTRUMENTS
	p 123 Testing
END
p bd1 /4
";
    let (compiler, _) = compile(mpl);
    assert_eq!(123, compiler.channels[9].program);
}

#[test]
fn test_undeclared_channel_with_instruments_block() {
    let mpl = "\
INSTRUMENTS
	0 piano Piano
END
1 c /4
";
    let e = compile_err(mpl);
    assert_eq!(ErrorKind::UnknownChannelUse, e.kind);
}

#[test]
fn test_percussion_never_requires_declaration() {
    let mpl = "\
INSTRUMENTS
	0 piano Piano
END
p hhc /8
";
    let (compiler, _) = compile(mpl);
    assert_eq!(240, compiler.channels[9].current_tick);
}

#[test]
fn test_channels_default_to_piano_without_instruments() {
    let (compiler, _) = compile("5 c /4\n");
    assert_eq!(0, compiler.channels[5].program);
    assert_eq!(480, compiler.channels[5].current_tick);
}

#[test]
fn test_note_name_in_percussion_channel_is_rejected() {
    let e = compile_err("p c /4\n");
    assert_eq!(ErrorKind::UnknownNote, e.kind);
}

#[test]
fn test_percussion_shortcut_and_number() {
    let (_, seq) = compile("p bd1 /4\np 38 /4\n");
    assert_eq!(vec![(0, 36, 64), (480, 38, 64)], note_ons(&seq, 9));
}

#[test]
fn test_var_inside_instruments_is_rejected() {
    let mpl = "\
INSTRUMENTS
	0 piano Piano
	VAR $x = 1
END
";
    let e = compile_err(mpl);
    assert_eq!(ErrorKind::ContextViolation, e.kind);
    assert_eq!(3, e.line);
}

// =============================================================================
// META
// =============================================================================

#[test]
fn test_meta_block_is_one_text_event() {
    let mpl = "\
META
	copyright (c) test
	copyright 2nd line
	title My Title
	composer Me
END
0 c /4
";
    let (_, seq) = compile(mpl);
    let texts = meta_events(&seq, 0, MetaKind::Text);
    let expected = format!(
        "{{#copyright=(c) test\\r\\n2nd line}}{{#title=My Title}}{{#composer=Me}}{{#software=mplc {}}}{{#}}",
        env!("CARGO_PKG_VERSION")
    );
    assert_eq!(vec![(0, expected.into_bytes())], texts);
}

#[test]
fn test_meta_soft_karaoke_joins_the_text_event() {
    let mpl = "\
META
	title Song Title
	SOFT_KARAOKE
		version 0100
		language ENGL
		title Song
	END
END
";
    let (_, seq) = compile(mpl);
    let texts = meta_events(&seq, 0, MetaKind::Text);
    let expected = format!(
        "{{#title=Song Title}}{{#sk_version=0100}}{{#sk_language=ENGL}}{{#sk_title=Song}}{{#software=mplc {}}}{{#}}",
        env!("CARGO_PKG_VERSION")
    );
    assert_eq!(vec![(0, expected.into_bytes())], texts);
    // Everything sits in the single track-0 event.
    assert!(seq.tracks[1].is_empty());
}

#[test]
fn test_meta_in_block_is_rejected() {
    let e = compile_err("{\nMETA\nEND\n}\n");
    assert_eq!(ErrorKind::ContextViolation, e.kind);
    assert_eq!(2, e.line);
}

// =============================================================================
// Constants and variables
// =============================================================================

#[test]
fn test_constants_expand_into_options() {
    let mpl = "\
CONST $forte = v=120
0 c /4, $forte
";
    let (_, seq) = compile(mpl);
    assert_eq!(vec![(0, 60, 120)], note_ons(&seq, 0));
}

#[test]
fn test_constant_expands_to_whole_command() {
    let mpl = "\
CONST $line = 0  c  /4  duration=50%
$line
";
    let (compiler, seq) = compile(mpl);
    assert_eq!(vec![(0, 60, 64)], note_ons(&seq, 0));
    assert_eq!(vec![(240, 60)], note_offs(&seq, 0));
    assert_eq!(480, compiler.channels[0].current_tick);
}

#[test]
fn test_constant_redefinition_is_rejected() {
    let mpl = "\
CONST $x = 1
CONST $x = 2
";
    let e = compile_err(mpl);
    assert_eq!(ErrorKind::Redefinition, e.kind);
    assert_eq!(2, e.line);
}

#[test]
fn test_variables_are_reassignable() {
    let mpl = "\
VAR $note = c
VAR $len = /4
0 $note $len
VAR $note = d
0 $note $len
";
    let (_, seq) = compile(mpl);
    assert_eq!(vec![(0, 60, 64), (480, 62, 64)], note_ons(&seq, 0));
}

#[test]
fn test_variable_scope_restored_after_block() {
    let mpl = "\
VAR $x = c
{
	VAR $x = d
	0 $x /4
}
0 $x /4
";
    let (_, seq) = compile(mpl);
    assert_eq!(vec![(0, 62, 64), (480, 60, 64)], note_ons(&seq, 0));
}

#[test]
fn test_unknown_variable_is_rejected() {
    let e = compile_err("0 c $len\n");
    assert_eq!(ErrorKind::UnknownVar, e.kind);
}

// =============================================================================
// DEFINE
// =============================================================================

#[test]
fn test_define_remaps_keywords() {
    let mpl = "\
DEFINE FUNCTION func
DEFINE END stop
func play
	0 c /4
stop
CALL play
";
    let (compiler, seq) = compile(mpl);
    assert_eq!(1, note_ons(&seq, 0).len());
    assert_eq!(480, compiler.channels[0].current_tick);
}

#[test]
fn test_define_unknown_id_is_rejected() {
    let e = compile_err("DEFINE NOSUCH x\n");
    assert_eq!(ErrorKind::UnknownToken, e.kind);
}

// =============================================================================
// Structural errors
// =============================================================================

#[test]
fn test_unclosed_block_reports_opener_line() {
    let e = compile_err("0 c /4\n{\n0 c /4\n");
    assert_eq!(ErrorKind::StructuralMismatch, e.kind);
    assert_eq!(2, e.line);
}

#[test]
fn test_unclosed_function_reports_opener_line() {
    let e = compile_err("0 c /4\n0 c /4\nFUNCTION a\n0 c /4\n");
    assert_eq!(ErrorKind::StructuralMismatch, e.kind);
    assert_eq!(3, e.line);
}

#[test]
fn test_unmatched_end() {
    let e = compile_err("0 c /4\nEND\n");
    assert_eq!(ErrorKind::StructuralMismatch, e.kind);
    assert_eq!(2, e.line);
}

#[test]
fn test_unmatched_close() {
    let e = compile_err("0 c /4\n}\n");
    assert_eq!(ErrorKind::StructuralMismatch, e.kind);
    assert_eq!(2, e.line);
}

#[test]
fn test_nested_function_definition_is_rejected() {
    let e = compile_err("FUNCTION a\nFUNCTION b\nEND\nEND\n");
    assert_eq!(ErrorKind::ContextViolation, e.kind);
    assert_eq!(2, e.line);
}

#[test]
fn test_end_with_parameter_is_rejected() {
    let e = compile_err("FUNCTION a\nEND x\n");
    assert_eq!(ErrorKind::BadOption, e.kind);
    assert_eq!(2, e.line);
}

#[test]
fn test_instruments_inside_block_is_rejected() {
    let e = compile_err("{\nINSTRUMENTS\nEND\n}\n");
    assert_eq!(ErrorKind::ContextViolation, e.kind);
    assert_eq!(2, e.line);
}

#[test]
fn test_chord_inside_function_is_rejected() {
    let e = compile_err("FUNCTION a\nCHORD x1 = c,e\nEND\n");
    assert_eq!(ErrorKind::ContextViolation, e.kind);
    assert_eq!(2, e.line);
}

#[test]
fn test_unknown_command_is_rejected() {
    let e = compile_err("0 c /4\nbogus 1 2\n");
    assert_eq!(ErrorKind::UnknownToken, e.kind);
    assert_eq!(2, e.line);
}

// =============================================================================
// Includes
// =============================================================================

#[test]
fn test_includefile_splices_lines() {
    let dir = tempdir().unwrap();

    let include_path = dir.path().join("notes.mpl");
    let mut include_file = std::fs::File::create(&include_path).unwrap();
    writeln!(include_file, "0 c /4").unwrap();

    let main_path = dir.path().join("main.mpl");
    let mut main_file = std::fs::File::create(&main_path).unwrap();
    writeln!(main_file, "INCLUDEFILE notes.mpl").unwrap();
    writeln!(main_file, "0 d /4").unwrap();

    let mut compiler = Compiler::new();
    let seq = compiler.compile_file(&main_path).unwrap();
    assert_eq!(vec![(0, 60, 64), (480, 62, 64)], note_ons(&seq, 0));
}

#[test]
fn test_include_resolves_via_include_dir() {
    let dir = tempdir().unwrap();

    let include_path = dir.path().join("common.mpl");
    let mut include_file = std::fs::File::create(&include_path).unwrap();
    writeln!(include_file, "INSTRUMENTS").unwrap();
    writeln!(include_file, "\t0 violin Violin").unwrap();
    writeln!(include_file, "END").unwrap();

    let mut compiler = Compiler::new();
    compiler.set_include_dir(dir.path());
    let mpl = "INCLUDE common.mpl\n0 c /4\n";
    let seq = compiler.compile(Cursor::new(mpl)).unwrap();
    assert_eq!(40, compiler.channels[0].program);
    assert_eq!(1, note_ons(&seq, 0).len());
}

#[test]
fn test_include_cycle_is_rejected() {
    let dir = tempdir().unwrap();

    let a_path = dir.path().join("a.mpl");
    let b_path = dir.path().join("b.mpl");
    let mut a_file = std::fs::File::create(&a_path).unwrap();
    writeln!(a_file, "INCLUDEFILE b.mpl").unwrap();
    let mut b_file = std::fs::File::create(&b_path).unwrap();
    writeln!(b_file, "INCLUDEFILE a.mpl").unwrap();

    let mut compiler = Compiler::new();
    match compiler.compile_file(&a_path) {
        Err(Error::Parse(e)) => assert_eq!(ErrorKind::IncludeCycle, e.kind),
        other => panic!("expected an include cycle error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_missing_include_is_rejected() {
    let e = compile_err("INCLUDEFILE does-not-exist.mpl\n");
    assert_eq!(ErrorKind::FileNotFound, e.kind);
    assert_eq!(1, e.line);
}

#[test]
fn test_include_inside_block_is_rejected() {
    let e = compile_err("{\nINCLUDEFILE x.mpl\n}\n");
    assert_eq!(ErrorKind::ContextViolation, e.kind);
    assert_eq!(2, e.line);
}

// =============================================================================
// Event stream invariants
// =============================================================================

#[test]
fn test_compilation_is_deterministic() {
    let mpl = "\
INSTRUMENTS
	0 piano Piano
	1 violin Violin
END
CHORD cmaj = c,e,g
0 cmaj /4
1 e /8, q=3
tempo 140
0 c /2 d=75%
";
    let (_, seq_a) = compile(mpl);
    let (_, seq_b) = compile(mpl);
    assert_eq!(seq_a.tracks, seq_b.tracks);
}

#[test]
fn test_ticks_are_nondecreasing_per_track() {
    let mpl = "\
0 c /4
0 d /8, q=5
tempo 90
0 e /2 tr=3
1 c /1
";
    let (_, seq) = compile(mpl);
    for track in &seq.tracks {
        let mut last = 0;
        for event in track {
            assert!(event.tick >= last);
            last = event.tick;
        }
    }
}

#[test]
fn test_every_note_on_has_a_note_off() {
    let mpl = "\
CHORD cmaj = c,e,g
0 cmaj /4 d=50%
0 c /8 tr=2
p bd1 /4, q=3
";
    let (_, seq) = compile(mpl);
    for channel in [0u8, 9u8] {
        let mut offs = note_offs(&seq, channel);
        for (tick, note, _) in note_ons(&seq, channel) {
            let pos = offs
                .iter()
                .position(|&(off_tick, off_note)| off_note == note && off_tick >= tick)
                .expect("note-on without matching note-off");
            offs.remove(pos);
        }
    }
}

// =============================================================================
// SMF framing
// =============================================================================

#[test]
fn test_smf_roundtrip() {
    let mpl = "\
INSTRUMENTS
	0 piano Piano
END
tempo 120
0 c /4 v=100
";
    let (_, seq) = compile(mpl);

    let mut bytes = Vec::new();
    mplc::midi::write_smf(&seq, &mut bytes).unwrap();

    let mut reader = SmfReader::new(&bytes);
    let header = reader.parse_header().unwrap();
    assert_eq!(1, header.format);
    assert_eq!(NUM_TRACKS as u16, header.ntracks);
    assert_eq!(480, header.division);

    let tracks = reader.parse_tracks(&header).unwrap();
    assert_eq!(NUM_TRACKS, tracks.len());

    // Channel 0 lives on track 3.
    let channel0 = &tracks[3];
    assert!(channel0.iter().any(|e| matches!(
        e.kind,
        TrackEventKind::NoteOn { channel: 0, note: 60, velocity: 100 }
    ) && e.tick == 0));
    assert!(channel0.iter().any(|e| matches!(
        e.kind,
        TrackEventKind::NoteOff { channel: 0, note: 60, velocity: 0 }
    ) && e.tick == 480));
    assert!(channel0
        .iter()
        .any(|e| matches!(e.kind, TrackEventKind::ProgramChange { channel: 0, program: 0 })));

    // Tempo meta lives on track 0.
    assert!(tracks[0].iter().any(|e| matches!(
        &e.kind,
        TrackEventKind::Meta { meta_type: 0x51, data } if data == &vec![0x07, 0xA1, 0x20]
    )));
}

#[test]
fn test_smf_delta_times_survive_roundtrip() {
    let mpl = "0 c /4\n0 - /1\n0 d /4\n";
    let (_, seq) = compile(mpl);

    let mut bytes = Vec::new();
    mplc::midi::write_smf(&seq, &mut bytes).unwrap();

    let mut reader = SmfReader::new(&bytes);
    let header = reader.parse_header().unwrap();
    let tracks = reader.parse_tracks(&header).unwrap();

    let ticks: Vec<u64> = tracks[3]
        .iter()
        .filter(|e| matches!(e.kind, TrackEventKind::NoteOn { .. }))
        .map(|e| e.tick)
        .collect();
    assert_eq!(vec![0, 480 + 1920], ticks);
}
