//! End-to-end scenarios through the fan-in pipeline, driven synchronously
//! against the realtime bus.

mod common;

use common::{ms, offs, ons, raw, RecordingRenderer, TestPipeline};
use evdev::Key;
use keysynth::bus::note_channel;
use keysynth::engine::{AudioSharedFlags, RendererAdapter};
use keysynth::event::{DeviceId, EventOrigin, InputEvent, NoteEvent};
use keysynth::time::SampleRate;
use keysynth::velocity::VelocityMode;

const Z: u16 = 44; // C3 at octave 4
const X: u16 = 45; // D3
const C: u16 = 46; // E3
const V: u16 = 47; // F3
const B: u16 = 48; // G3
const A: u16 = 30; // C4
const S: u16 = 31; // D4
const Q: u16 = 16; // C5
const COMMA: u16 = 51; // C4, overlapping the home row
const TAB: u16 = 15;
const SPACE: u16 = 57;
const ESC: u16 = 1;

fn arp_ons(events: &[NoteEvent]) -> Vec<u8> {
    events
        .iter()
        .filter_map(|ev| match ev {
            NoteEvent::On { pitch, origin: EventOrigin::Arp, .. } => Some(*pitch),
            _ => None,
        })
        .collect()
}

#[test]
fn s1_single_note_timing_mode() {
    let mut p = TestPipeline::with_defaults(VelocityMode::Timing, 16);

    p.key_down(Z, 0);
    p.key_up(Z, 120);

    let events = p.drain();
    assert_eq!(ons(&events), vec![(48, 80, 0)], "first note plays the baseline velocity");
    assert_eq!(offs(&events), vec![(48, 0)]);
}

#[test]
fn s2_two_fast_notes_timing_mode() {
    let mut p = TestPipeline::with_defaults(VelocityMode::Timing, 16);

    p.key_down(A, 0);
    p.key_down(S, 50);
    p.key_up(A, 60);
    p.key_up(S, 90);

    let events = p.drain();
    let on_list = ons(&events);
    assert_eq!(on_list.len(), 2);
    assert_eq!(on_list[0], (60, 80, 0));
    let (pitch, velocity, _) = on_list[1];
    assert_eq!(pitch, 62);
    assert!(velocity > 80, "a 50 ms gap should strike louder than the baseline, got {velocity}");
    assert!(velocity <= 127);

    assert_eq!(offs(&events), vec![(60, 0), (62, 0)], "offs in matching order");
    assert!(p.engine.allocator().voice_count() <= 2);
}

#[test]
fn s3_sustain_defers_release_until_pedal_up() {
    let mut p = TestPipeline::with_defaults(VelocityMode::Timing, 16);

    p.key_down(Q, 0);
    p.midi(0xb0, 64, 127, 10);
    p.key_up(Q, 50);

    let mid = p.drain();
    assert_eq!(ons(&mid).len(), 1);
    assert!(offs(&mid).is_empty(), "no off while the pedal is down");

    p.midi(0xb0, 64, 0, 200);
    let end = p.drain();
    assert_eq!(offs(&end), vec![(72, 0)]);
}

#[test]
fn s4_five_note_chord_at_polyphony_four() {
    let mut p = TestPipeline::with_defaults(VelocityMode::Timing, 4);

    for (i, key) in [Z, X, C, V, B].iter().enumerate() {
        p.key_down(*key, i as u64);
    }

    let events = p.drain();
    assert_eq!(ons(&events).len(), 5, "all five strikes reach the bus");
    // Exactly one renderer-level off, for the earliest-struck voice.
    assert_eq!(offs(&events), vec![(48, 0)]);
    assert_eq!(p.engine.allocator().voice_count(), 4);
}

#[test]
fn s4_renderer_stabilizes_at_four_voices() {
    let mut p = TestPipeline::with_defaults(VelocityMode::Timing, 4);
    for (i, key) in [Z, X, C, V, B].iter().enumerate() {
        p.key_down(*key, i as u64);
    }
    let events = p.drain();

    // Replay the bus traffic through the renderer adapter.
    let (mut replay_tx, replay_rx) = note_channel(64);
    for ev in &events {
        replay_tx.push(*ev);
    }
    let recorder = RecordingRenderer::new();
    let handle = recorder.clone();
    let (tick_tx, _tick_rx) = rtrb::RingBuffer::new(8);
    let (latency_tx, _latency_rx) = rtrb::RingBuffer::new(8);
    let mut adapter = RendererAdapter::new(
        Some(Box::new(recorder)),
        replay_rx,
        tick_tx,
        latency_tx,
        AudioSharedFlags::new(),
        SampleRate(48_000),
        128,
        6_000,
    );

    let mut out = [0.0f32; 64 * 2];
    adapter.process(&mut out, 2);
    assert_eq!(handle.active_notes(), 4);
}

#[test]
fn s5_hot_unplug_releases_held_keys() {
    let mut p = TestPipeline::with_defaults(VelocityMode::Timing, 16);

    p.key_down(A, 0);
    p.key_down(S, 10);
    p.drain();

    p.engine.handle_input(InputEvent::DeviceGone { id: common::KBD });
    let events = p.drain();
    let mut released = offs(&events);
    released.sort_unstable();
    assert_eq!(released, vec![(60, 0), (62, 0)]);
    assert_eq!(p.engine.allocator().held_count(), 0);

    // Stale key-ups from the removed device do nothing.
    p.key_up(A, 30);
    assert!(p.drain().is_empty());

    // The same hardware coming back is a fresh device with no ghost notes.
    p.engine.handle_input(InputEvent::KeyDown {
        raw: keysynth::event::RawKey { device: DeviceId(7), code: A },
        t: ms(100),
    });
    let events = p.drain();
    assert_eq!(ons(&events).len(), 1);
    assert!(offs(&events).is_empty());
}

#[test]
fn s6_arp_up_cycles_a_held_triad() {
    let mut p = TestPipeline::with_defaults(VelocityMode::Timing, 16);

    p.key_down(TAB, 0); // arp: off -> up
    p.key_up(TAB, 2);
    p.key_down(Z, 5); // C3
    p.key_down(C, 6); // E3
    p.key_down(B, 7); // G3

    // The first step fires as soon as the run starts.
    assert_eq!(arp_ons(&p.drain()), vec![48]);

    let mut sequence = vec![48u8];
    for _ in 0..7 {
        p.tick();
        let step = p.drain();
        let step_ons = arp_ons(&step);
        assert_eq!(step_ons.len(), 1, "one arp note per tick");
        // Each step releases the previous arp note first.
        assert_eq!(offs(&step).len(), 1);
        assert_eq!(offs(&step)[0].0, *sequence.last().unwrap());
        sequence.push(step_ons[0]);
    }
    assert_eq!(sequence, vec![48, 52, 55, 48, 52, 55, 48, 52]);

    // Releasing every key releases the sounding arp note immediately.
    p.key_up(Z, 900);
    p.key_up(C, 901);
    p.key_up(B, 902);
    let end = p.drain();
    assert_eq!(offs(&end), vec![(52, 0)]);
    p.tick();
    assert!(p.drain().is_empty(), "no steps after the held set empties");
}

#[test]
fn arp_up_sequence_is_nondecreasing_between_wraps() {
    let mut p = TestPipeline::with_defaults(VelocityMode::Timing, 16);
    p.key_down(TAB, 0);
    p.key_up(TAB, 2);
    p.key_down(Z, 5);
    p.key_down(C, 6);
    p.key_down(B, 7);
    p.drain();

    let mut prev = 0u8;
    for _ in 0..12 {
        p.tick();
        let pitch = arp_ons(&p.drain())[0];
        if pitch >= prev {
            // ascending within a pass
        } else {
            assert_eq!(pitch, 48, "a drop in pitch is only ever the wrap to the lowest");
        }
        prev = pitch;
    }
}

#[test]
fn every_on_gets_exactly_one_off() {
    let mut p = TestPipeline::with_defaults(VelocityMode::Combined, 8);

    p.key_down(A, 0);
    p.key_down(S, 10);
    p.key_down(SPACE, 20); // sustain down
    p.key_up(A, 30); // deferred
    p.key_down(Z, 40);
    p.key_up(SPACE, 50); // pedal up: releases A
    p.key_up(S, 60);
    p.key_up(Z, 70);

    let events = p.drain();
    let on_count = ons(&events).len();
    let off_count = offs(&events).len();
    assert_eq!(on_count, 3);
    assert_eq!(off_count, 3);
    assert_eq!(p.engine.allocator().held_count(), 0);
}

#[test]
fn velocities_always_land_in_midi_range() {
    for mode in [
        VelocityMode::Timing,
        VelocityMode::Pressure,
        VelocityMode::Position,
        VelocityMode::Combined,
        VelocityMode::Fixed,
    ] {
        let mut p = TestPipeline::with_defaults(mode, 32);
        for (i, key) in [Z, X, C, V, B, A, S, Q].iter().enumerate() {
            p.key_down(*key, i as u64 * 3);
        }
        for (pitch, velocity, _) in ons(&p.drain()) {
            assert!((1..=127).contains(&velocity), "{mode:?} gave {velocity} for pitch {pitch}");
        }
    }
}

#[test]
fn same_pitch_from_two_keys_retriggers_instead_of_colliding() {
    let mut p = TestPipeline::with_defaults(VelocityMode::Timing, 16);

    p.key_down(A, 0); // C4
    p.key_down(COMMA, 10); // also C4
    let events = p.drain();

    // The second strike steals the first voice: off for the old, on for
    // the new, never two held notes on one pitch.
    assert_eq!(ons(&events).len(), 2);
    assert_eq!(offs(&events), vec![(60, 0)]);
    assert_eq!(p.engine.allocator().held_count(), 1);

    // The first key's release is stale now.
    p.key_up(A, 20);
    assert!(p.drain().is_empty());
    p.key_up(COMMA, 30);
    assert_eq!(offs(&p.drain()), vec![(60, 0)]);
}

#[test]
fn layer_doubles_notes_on_its_own_channel() {
    use keysynth::engine::InputEngineParams;
    use keysynth::input::keymap::KeyMap;
    use keysynth::state::LayerState;
    use keysynth::velocity::VelocityConfig;

    let mut p = TestPipeline::new(InputEngineParams {
        keymap: KeyMap::default_layout(),
        velocity: VelocityConfig { mode: VelocityMode::Fixed, ..VelocityConfig::default() },
        max_polyphony: 8,
        octave: 4,
        program: 0,
        layer: LayerState { enabled: true, program: 48, channel: 1 },
        primary_channel: 0,
        arp_seed: 42,
    });

    p.key_down(A, 0);
    let events = p.drain();
    assert_eq!(ons(&events), vec![(60, 100, 0), (60, 100, 1)]);
    assert_eq!(p.engine.allocator().voice_count(), 2, "the copy takes its own polyphony slot");

    p.key_up(A, 50);
    let events = p.drain();
    assert_eq!(offs(&events), vec![(60, 0), (60, 1)], "off copies stay paired");

    // Toggling the layer off releases layer-origin notes only.
    p.key_down(S, 100);
    p.drain();
    p.key_down(Key::KEY_BACKSLASH.code(), 110);
    let events = p.drain();
    assert_eq!(offs(&events), vec![(62, 1)]);
    assert!(p.engine.allocator().held_note(0, 62).is_some());
}

#[test]
fn sustain_pedal_spam_is_idempotent() {
    let mut p = TestPipeline::with_defaults(VelocityMode::Timing, 16);

    p.key_down(A, 0);
    p.drain();
    for i in 0..10 {
        p.key_down(SPACE, 10 + i * 4);
        p.key_up(SPACE, 12 + i * 4);
    }
    assert!(p.drain().is_empty(), "pedal churn with no key-ups emits nothing");
    assert_eq!(p.engine.allocator().held_count(), 1);
}

#[test]
fn panic_key_clears_everything() {
    let mut p = TestPipeline::with_defaults(VelocityMode::Timing, 16);

    p.key_down(A, 0);
    p.key_down(S, 5);
    p.drain();

    p.key_down(ESC, 10);
    let events = p.drain();
    assert_eq!(offs(&events).len(), 2);
    assert!(events.iter().any(|e| matches!(e, NoteEvent::Panic)));
    assert_eq!(p.engine.allocator().voice_count(), 0);
    assert_eq!(p.engine.allocator().held_count(), 0);
}

#[test]
fn octave_shift_between_press_and_release_stays_paired() {
    let mut p = TestPipeline::with_defaults(VelocityMode::Timing, 16);

    p.key_down(A, 0); // C4
    p.key_down(Key::KEY_UP.code(), 10); // octave up
    p.key_up(Key::KEY_UP.code(), 12);
    p.key_down(S, 20); // now D5
    p.key_up(A, 30); // still releases C4
    p.key_up(S, 40);

    let events = p.drain();
    assert_eq!(ons(&events).iter().map(|&(pitch, ..)| pitch).collect::<Vec<_>>(), vec![60, 74]);
    assert_eq!(offs(&events), vec![(60, 0), (74, 0)]);
}

#[test]
fn ghost_flurry_plays_one_note() {
    let mut p = TestPipeline::with_defaults(VelocityMode::Timing, 16);

    // Sub-millisecond down/up/down/up on one scan-code.
    p.engine.handle_input(InputEvent::KeyDown { raw: raw(A), t: ms(0) });
    p.engine.handle_input(InputEvent::KeyUp {
        raw: raw(A),
        t: keysynth::time::MonotonicNanos(300_000),
    });
    p.engine.handle_input(InputEvent::KeyDown {
        raw: raw(A),
        t: keysynth::time::MonotonicNanos(500_000),
    });
    p.engine.handle_input(InputEvent::KeyUp {
        raw: raw(A),
        t: keysynth::time::MonotonicNanos(700_000),
    });

    let events = p.drain();
    assert_eq!(ons(&events).len(), 1, "only the first down plays");
    assert!(offs(&events).is_empty(), "the bouncing up edges are suppressed");

    // Once the flurry settles, the trailing up edge is emitted.
    p.engine.flush_settled(ms(5));
    let settled = p.drain();
    assert_eq!(offs(&settled), vec![(60, 0)]);
}
