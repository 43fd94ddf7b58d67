//! Shared test harness: a synchronous pipeline (no threads) and a renderer
//! double that records every call.
#![allow(dead_code)]

use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex};

use keysynth::bus::{self, note_channel, BusConsumer};
use keysynth::engine::{AudioSharedFlags, EngineCommand, InputEngine, InputEngineParams};
use keysynth::event::{DeviceId, InputEvent, NoteEvent, RawKey};
use keysynth::input::keymap::KeyMap;
use keysynth::render::Renderer;
use keysynth::state::LayerState;
use keysynth::time::MonotonicNanos;
use keysynth::velocity::{VelocityConfig, VelocityMode};

pub const KBD: DeviceId = DeviceId(1);

pub fn ms(v: u64) -> MonotonicNanos {
    MonotonicNanos(v * 1_000_000)
}

pub fn raw(code: u16) -> RawKey {
    RawKey { device: KBD, code }
}

/// The fan-in engine driven synchronously, with both ends of every ring in
/// hand.
pub struct TestPipeline {
    pub engine: InputEngine,
    pub bus_rx: BusConsumer,
    pub tick_tx: rtrb::Producer<u64>,
    tick_serial: u64,
    _input_tx: crossbeam_channel::Sender<InputEvent>,
    _ctrl_tx: crossbeam_channel::Sender<EngineCommand>,
}

impl TestPipeline {
    pub fn new(params: InputEngineParams) -> Self {
        let (input_tx, input_rx) = crossbeam_channel::bounded(64);
        let (ctrl_tx, ctrl_rx) = crossbeam_channel::unbounded();
        let (tick_tx, tick_rx) = rtrb::RingBuffer::new(64);
        let (bus_tx, bus_rx) = note_channel(bus::DEFAULT_CAPACITY);
        let (telemetry, _telemetry_rx) = bus::telemetry_channel(4096);

        let engine = InputEngine::new(
            params,
            input_rx,
            ctrl_rx,
            tick_rx,
            bus_tx,
            telemetry,
            AudioSharedFlags::new(),
            Arc::new(AtomicUsize::new(0)),
        );

        Self { engine, bus_rx, tick_tx, tick_serial: 0, _input_tx: input_tx, _ctrl_tx: ctrl_tx }
    }

    pub fn with_defaults(mode: VelocityMode, max_polyphony: usize) -> Self {
        Self::new(InputEngineParams {
            keymap: KeyMap::default_layout(),
            velocity: VelocityConfig { mode, ..VelocityConfig::default() },
            max_polyphony,
            octave: 4,
            program: 0,
            layer: LayerState { enabled: false, program: 48, channel: 1 },
            primary_channel: 0,
            arp_seed: 42,
        })
    }

    pub fn key_down(&mut self, code: u16, at_ms: u64) {
        self.engine.handle_input(InputEvent::KeyDown { raw: raw(code), t: ms(at_ms) });
    }

    pub fn key_up(&mut self, code: u16, at_ms: u64) {
        self.engine.handle_input(InputEvent::KeyUp { raw: raw(code), t: ms(at_ms) });
    }

    pub fn midi(&mut self, status: u8, d1: u8, d2: u8, at_ms: u64) {
        self.engine.handle_input(InputEvent::Midi {
            device: DeviceId(9),
            status,
            d1,
            d2,
            t: ms(at_ms),
        });
    }

    /// One arp clock tick, as the audio thread would deliver it.
    pub fn tick(&mut self) {
        self.tick_serial += 1;
        self.tick_tx.push(self.tick_serial).unwrap();
        self.engine.drain_ticks();
    }

    pub fn drain(&mut self) -> Vec<NoteEvent> {
        let mut out = Vec::new();
        while let Some(ev) = self.bus_rx.pop() {
            out.push(ev);
        }
        out
    }
}

pub fn ons(events: &[NoteEvent]) -> Vec<(u8, u8, u8)> {
    events
        .iter()
        .filter_map(|ev| match ev {
            NoteEvent::On { pitch, velocity, channel, .. } => Some((*pitch, *velocity, *channel)),
            _ => None,
        })
        .collect()
}

pub fn offs(events: &[NoteEvent]) -> Vec<(u8, u8)> {
    events
        .iter()
        .filter_map(|ev| match ev {
            NoteEvent::Off { pitch, channel, .. } => Some((*pitch, *channel)),
            _ => None,
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    ProgramChange(u8, u8),
    NoteOn(u8, u8, u8),
    NoteOff(u8, u8),
    Cc(u8, u8, u8),
    Bend(u8, i16),
    Panic,
}

/// Renderer double that records every call; `render` writes a constant so
/// output routing is observable.
#[derive(Clone, Default)]
pub struct RecordingRenderer {
    pub calls: Arc<Mutex<Vec<Call>>>,
}

impl RecordingRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn active_notes(&self) -> usize {
        let mut active = 0usize;
        for call in self.calls.lock().unwrap().iter() {
            match call {
                Call::NoteOn(..) => active += 1,
                Call::NoteOff(..) => active = active.saturating_sub(1),
                Call::Panic => active = 0,
                _ => {}
            }
        }
        active
    }
}

impl Renderer for RecordingRenderer {
    fn program_change(&mut self, channel: u8, program: u8) {
        self.calls.lock().unwrap().push(Call::ProgramChange(channel, program));
    }
    fn note_on(&mut self, channel: u8, pitch: u8, velocity: u8) {
        self.calls.lock().unwrap().push(Call::NoteOn(channel, pitch, velocity));
    }
    fn note_off(&mut self, channel: u8, pitch: u8) {
        self.calls.lock().unwrap().push(Call::NoteOff(channel, pitch));
    }
    fn cc(&mut self, channel: u8, controller: u8, value: u8) {
        self.calls.lock().unwrap().push(Call::Cc(channel, controller, value));
    }
    fn pitch_bend(&mut self, channel: u8, value: i16) {
        self.calls.lock().unwrap().push(Call::Bend(channel, value));
    }
    fn panic(&mut self) {
        self.calls.lock().unwrap().push(Call::Panic);
    }
    fn render(&mut self, out: &mut [f32]) {
        out.fill(0.5);
    }
}
