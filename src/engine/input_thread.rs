//! The fan-in task: the input context's single thread of control.
//!
//! Owns the state core, velocity computer, voice allocator and the
//! arpeggiator/layer transforms. Reader threads feed it over one merged
//! channel; arp clock ticks arrive from the audio thread over an rtrb ring;
//! everything it decides lands on the realtime bus as value-typed events.
//! Nothing else in the process mutates note state.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use fnv::FnvHashMap;
use rtrb::Consumer;
use smallvec::SmallVec;

use crate::arp::{ArpBatch, ArpEvent, Arpeggiator};
use crate::bus::{BusProducer, TelemetrySender};
use crate::event::{
    DeviceId, EventOrigin, InputAxis, InputEvent, NoteEvent, RawKey, TelemetryEvent, TouchState,
};
use crate::input::debounce::FilterDecision;
use crate::input::keymap::{ControlRole, KeyMap, KeyRow, MappedKey};
use crate::layer;
use crate::state::{LayerState, StateCore};
use crate::time::{self, MonotonicNanos};
use crate::velocity::{StrikeContext, VelocityComputer, VelocityConfig};
use crate::voices::{EventBatch, VoiceAllocator};

use super::audio_thread::AudioSharedFlags;

/// How long the fan-in loop parks between wakeups. Bounds the latency of
/// arp ticks and ghost-filter settles when no input events arrive.
const FAN_IN_TICK: Duration = Duration::from_millis(1);

const MOD_WHEEL_CC: u8 = 1;
const SUSTAIN_CC: u8 = 64;

/// Control messages from the supervisory side.
pub enum EngineCommand {
    /// The audio stream was rebuilt; use these rings from now on.
    ReplaceAudioLink { bus: BusProducer, ticks: Consumer<u64> },
    /// Health-probe-triggered full panic.
    Panic,
}

/// Final performance state, reported once when the fan-in task exits so the
/// session file reflects what the player last had.
#[derive(Debug, Clone, Copy)]
pub struct StateSnapshot {
    pub octave: u8,
    pub program: u8,
    pub layer_enabled: bool,
    pub arp_mode: crate::arp::ArpMode,
}

pub struct InputEngineParams {
    pub keymap: KeyMap,
    pub velocity: VelocityConfig,
    pub max_polyphony: usize,
    pub octave: u8,
    pub program: u8,
    pub layer: LayerState,
    pub primary_channel: u8,
    pub arp_seed: u64,
}

pub struct InputEngine {
    input_rx: Receiver<InputEvent>,
    ctrl_rx: Receiver<EngineCommand>,
    tick_rx: Consumer<u64>,
    bus: BusProducer,
    telemetry: TelemetrySender,
    flags: AudioSharedFlags,
    voice_gauge: Arc<AtomicUsize>,

    state: StateCore,
    keymap: KeyMap,
    velocity: VelocityComputer,
    allocator: VoiceAllocator,
    arp: Arpeggiator,
    /// Keys currently feeding the arp's held set, so a key-up (or device
    /// loss) maps back to the pitch it contributed.
    arp_keys: FnvHashMap<RawKey, u8>,
    primary_channel: u8,
}

impl InputEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        params: InputEngineParams,
        input_rx: Receiver<InputEvent>,
        ctrl_rx: Receiver<EngineCommand>,
        tick_rx: Consumer<u64>,
        bus: BusProducer,
        telemetry: TelemetrySender,
        flags: AudioSharedFlags,
        voice_gauge: Arc<AtomicUsize>,
    ) -> Self {
        let mut state = StateCore::new(params.octave, params.program);
        state.layer = params.layer;

        Self {
            input_rx,
            ctrl_rx,
            tick_rx,
            bus,
            telemetry,
            flags,
            voice_gauge,
            state,
            keymap: params.keymap,
            velocity: VelocityComputer::new(params.velocity),
            allocator: VoiceAllocator::new(params.max_polyphony),
            arp: Arpeggiator::new(params.arp_seed),
            arp_keys: FnvHashMap::default(),
            primary_channel: params.primary_channel,
        }
    }

    pub fn state(&self) -> &StateCore {
        &self.state
    }

    pub fn allocator(&self) -> &VoiceAllocator {
        &self.allocator
    }

    pub fn run(&mut self, run: Arc<AtomicBool>) {
        self.emit_initial_programs();

        while run.load(Ordering::Relaxed) {
            match self.input_rx.recv_timeout(FAN_IN_TICK) {
                Ok(ev) => {
                    self.handle_input(ev);
                    while let Ok(ev) = self.input_rx.try_recv() {
                        self.handle_input(ev);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            while let Ok(cmd) = self.ctrl_rx.try_recv() {
                self.handle_command(cmd);
            }
            self.drain_ticks();
            self.flush_settled(time::now());
        }

        // Drain whatever the readers managed to send before they stopped so
        // the last keystroke still plays, then silence the renderer.
        while let Ok(ev) = self.input_rx.try_recv() {
            self.handle_input(ev);
        }
        let batch = self.allocator.panic();
        self.forward(batch);
    }

    pub fn emit_initial_programs(&mut self) {
        let program = self.state.program;
        self.forward_single(NoteEvent::Program { channel: self.primary_channel, program });
        if self.state.layer.enabled {
            self.forward_single(NoteEvent::Program {
                channel: self.state.layer.channel,
                program: self.state.layer.program,
            });
        }
    }

    pub fn handle_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::ReplaceAudioLink { bus, ticks } => {
                self.bus = bus;
                self.tick_rx = ticks;
            }
            EngineCommand::Panic => self.do_panic(),
        }
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            octave: self.state.octave,
            program: self.state.program,
            layer_enabled: self.state.layer.enabled,
            arp_mode: self.state.arp_mode,
        }
    }

    pub fn handle_input(&mut self, ev: InputEvent) {
        match ev {
            InputEvent::KeyDown { raw, t } => {
                if self.state.key_filter.filter(raw, true, t) == FilterDecision::Emit {
                    self.key_edge(raw, true, t);
                }
            }
            InputEvent::KeyUp { raw, t } => {
                if self.state.key_filter.filter(raw, false, t) == FilterDecision::Emit {
                    self.key_edge(raw, false, t);
                }
            }
            InputEvent::Axis { axis, normalized, .. } => self.handle_axis(axis, normalized),
            InputEvent::Touch { state, .. } => self.handle_touch(state),
            InputEvent::Midi { status, d1, d2, t, .. } => self.handle_midi(status, d1, d2, t),
            InputEvent::DeviceGone { id } => self.handle_device_gone(id),
        }
    }

    /// Service pending arp clock ticks from the audio thread.
    pub fn drain_ticks(&mut self) {
        while self.tick_rx.pop().is_ok() {
            if self.arp.is_active() && self.arp.held_len() > 0 {
                let batch = self.arp.tick();
                self.apply_arp(batch, time::now());
            }
        }
    }

    /// Emit trailing edges the ghost filter held back.
    pub fn flush_settled(&mut self, now: MonotonicNanos) {
        let edges = self.state.key_filter.settle(now);
        for (raw, down, t) in edges {
            self.key_edge(raw, down, t);
        }
    }

    fn key_edge(&mut self, raw: RawKey, down: bool, t: MonotonicNanos) {
        match self.keymap.lookup(raw.code) {
            Some(MappedKey::Note { row, .. }) => {
                if down {
                    self.note_key_down(raw, row, t);
                } else {
                    self.note_key_up(raw, t);
                }
            }
            Some(MappedKey::Control(role)) => self.control_edge(role, down, t),
            None => {}
        }
    }

    fn note_key_down(&mut self, raw: RawKey, row: KeyRow, t: MonotonicNanos) {
        let pitch = match self.keymap.pitch(raw.code, self.state.octave, self.state.transpose) {
            Some(pitch) => pitch,
            None => return,
        };
        let info = self.velocity.compute(StrikeContext {
            t,
            row: Some(row),
            accent: self.state.accent_held,
            soft: self.state.soft_held,
            touch_active: self.state.touch_active,
        });

        if self.arp.is_active() {
            let was_empty = self.arp.held_len() == 0;
            self.arp.note_down(pitch, info.value);
            self.arp_keys.insert(raw, pitch);
            if was_empty {
                self.start_arp_run(t);
            }
        } else {
            self.submit_on(pitch, info.value, EventOrigin::Keyboard, Some(raw), t);
        }
    }

    fn note_key_up(&mut self, raw: RawKey, t: MonotonicNanos) {
        if let Some(pitch) = self.arp_keys.remove(&raw) {
            let batch = self.arp.note_up(pitch);
            self.apply_arp(batch, t);
            return;
        }
        if let Some((channel, pitch)) = self.allocator.raw_lookup(raw) {
            self.submit_off(pitch, channel, t);
        }
    }

    fn control_edge(&mut self, role: ControlRole, down: bool, t: MonotonicNanos) {
        match role {
            ControlRole::Sustain => {
                if self.state.sustain_pressed != down {
                    self.state.sustain_pressed = down;
                    let batch = self.allocator.set_sustain(down, t);
                    self.forward(batch);
                }
            }
            ControlRole::AccentModifier => self.state.accent_held = down,
            ControlRole::SoftModifier => self.state.soft_held = down,
            _ if !down => {}
            ControlRole::Panic => self.do_panic(),
            ControlRole::OctaveUp => {
                self.state.octave_up();
            }
            ControlRole::OctaveDown => {
                self.state.octave_down();
            }
            ControlRole::TransposeUp => {
                self.state.transpose_up();
            }
            ControlRole::TransposeDown => {
                self.state.transpose_down();
            }
            ControlRole::ProgramUp => {
                let program = self.state.program_up();
                self.forward_single(NoteEvent::Program { channel: self.primary_channel, program });
            }
            ControlRole::ProgramDown => {
                let program = self.state.program_down();
                self.forward_single(NoteEvent::Program { channel: self.primary_channel, program });
            }
            ControlRole::ArpCycle => self.cycle_arp(t),
            ControlRole::LayerToggle => self.toggle_layer(t),
        }
    }

    fn handle_axis(&mut self, axis: InputAxis, normalized: f32) {
        match axis {
            InputAxis::Pressure => self.velocity.set_pressure(normalized),
            InputAxis::X => {
                let value = ((f64::from(normalized) * 2.0 - 1.0) * 8191.0) as i16;
                self.forward_single(NoteEvent::Bend { channel: self.primary_channel, value });
            }
            InputAxis::Y => {
                let value = (normalized * 127.0) as u8 & 0x7f;
                self.forward_single(NoteEvent::Cc {
                    channel: self.primary_channel,
                    controller: MOD_WHEEL_CC,
                    value,
                });
            }
        }
    }

    fn handle_touch(&mut self, state: TouchState) {
        match state {
            TouchState::On => self.state.touch_active = true,
            TouchState::Off => {
                self.state.touch_active = false;
                self.velocity.set_pressure(0.0);
                // Recenter the bend when the finger lifts.
                self.forward_single(NoteEvent::Bend { channel: self.primary_channel, value: 0 });
            }
        }
    }

    fn handle_midi(&mut self, status: u8, d1: u8, d2: u8, t: MonotonicNanos) {
        let d1 = d1 & 0x7f;
        let d2 = d2 & 0x7f;
        match status & 0xf0 {
            0x90 if d2 > 0 => {
                if self.arp.is_active() {
                    let was_empty = self.arp.held_len() == 0;
                    self.arp.note_down(d1, d2);
                    if was_empty {
                        self.start_arp_run(t);
                    }
                } else {
                    self.submit_on(d1, d2, EventOrigin::MidiIn, None, t);
                }
            }
            0x80 | 0x90 => {
                // The pitch may predate an arp toggle; release whichever
                // side is actually holding it.
                let held_midi = self
                    .allocator
                    .held_note(self.primary_channel, d1)
                    .map(|h| h.origin == EventOrigin::MidiIn)
                    .unwrap_or(false);
                if held_midi {
                    self.submit_off(d1, self.primary_channel, t);
                } else if self.arp.is_active() {
                    let batch = self.arp.note_up(d1);
                    self.apply_arp(batch, t);
                }
            }
            0xb0 if d1 == SUSTAIN_CC => {
                let on = d2 >= 64;
                if self.state.sustain_pressed != on {
                    self.state.sustain_pressed = on;
                    let batch = self.allocator.set_sustain(on, t);
                    self.forward(batch);
                }
            }
            0xb0 => {
                self.forward_single(NoteEvent::Cc {
                    channel: self.primary_channel,
                    controller: d1,
                    value: d2,
                });
            }
            0xe0 => {
                let value = ((i32::from(d2) << 7 | i32::from(d1)) - 8192) as i16;
                self.forward_single(NoteEvent::Bend { channel: self.primary_channel, value });
            }
            0xc0 => {
                self.state.program = d1;
                self.forward_single(NoteEvent::Program {
                    channel: self.primary_channel,
                    program: d1,
                });
            }
            _ => {}
        }
    }

    /// Device removal: release everything the device was holding, on both
    /// the primary channel and the layer, and forget its filter state. A
    /// later arrival of the same hardware starts from scratch.
    fn handle_device_gone(&mut self, id: DeviceId) {
        let now = time::now();

        let gone: SmallVec<[(RawKey, u8); 8]> = self
            .arp_keys
            .iter()
            .filter(|(raw, _)| raw.device == id)
            .map(|(&raw, &pitch)| (raw, pitch))
            .collect();
        for (raw, pitch) in gone {
            self.arp_keys.remove(&raw);
            let batch = self.arp.note_up(pitch);
            self.apply_arp(batch, now);
        }

        let offs = self.allocator.release_device(id, now);
        for ev in offs {
            self.forward_single(ev);
            if let NoteEvent::Off { pitch, channel, .. } = ev {
                if channel == self.primary_channel && self.state.layer.enabled {
                    let twin = self.allocator.force_off(pitch, self.state.layer.channel, now);
                    self.forward(twin);
                }
            }
        }

        self.state.key_filter.purge_device(id);
    }

    fn cycle_arp(&mut self, t: MonotonicNanos) {
        let was_active = self.arp.is_active();
        let batch = self.arp.cycle_mode();
        self.state.arp_mode = self.arp.mode();
        self.apply_arp(batch, t);
        log::info!("Arpeggiator mode: {}", self.arp.mode());

        if !was_active && self.arp.is_active() {
            // Keys already down migrate into the arp's held set: their
            // voices stop and the arp takes over their pitches.
            let migrate: SmallVec<[(RawKey, u8, u8); 8]> = self
                .allocator
                .held_notes()
                .filter(|h| {
                    h.channel == self.primary_channel && h.origin == EventOrigin::Keyboard
                })
                .filter_map(|h| h.raw.map(|raw| (raw, h.pitch, h.velocity_at_strike)))
                .collect();

            for (raw, pitch, vel) in migrate {
                let batch = self.allocator.force_off(pitch, self.primary_channel, t);
                self.forward(batch);
                if self.state.layer.enabled {
                    let twin = self.allocator.force_off(pitch, self.state.layer.channel, t);
                    self.forward(twin);
                }
                self.arp.note_down(pitch, vel);
                self.arp_keys.insert(raw, pitch);
            }

            if self.arp.held_len() > 0 {
                self.start_arp_run(t);
            }
        }

        if was_active && !self.arp.is_active() {
            self.arp_keys.clear();
        }
    }

    fn toggle_layer(&mut self, t: MonotonicNanos) {
        self.state.layer.enabled = !self.state.layer.enabled;
        if self.state.layer.enabled {
            log::info!(
                "Layer on: program {} on channel {}",
                self.state.layer.program,
                self.state.layer.channel
            );
            self.forward_single(NoteEvent::Program {
                channel: self.state.layer.channel,
                program: self.state.layer.program,
            });
        } else {
            log::info!("Layer off");
            let batch = self.allocator.release_origin(EventOrigin::Layer, t);
            self.forward(batch);
        }
    }

    fn do_panic(&mut self) {
        let batch = self.allocator.panic();
        self.forward(batch);
        self.arp.clear();
        self.arp_keys.clear();
    }

    /// First step of a fresh arp run plays immediately; the audio-side
    /// clock restarts so the second step lands a full period later.
    fn start_arp_run(&mut self, t: MonotonicNanos) {
        self.flags.clock_reset.store(true, Ordering::SeqCst);
        let batch = self.arp.tick();
        self.apply_arp(batch, t);
    }

    fn apply_arp(&mut self, batch: ArpBatch, t: MonotonicNanos) {
        for ev in batch {
            match ev {
                ArpEvent::On { pitch, velocity } => {
                    self.submit_on(pitch, velocity, EventOrigin::Arp, None, t);
                }
                ArpEvent::Off { pitch } => self.submit_off(pitch, self.primary_channel, t),
            }
        }
    }

    /// A logical note-on: through the allocator on the primary channel,
    /// then its layer copy, each with their own voice bookkeeping.
    fn submit_on(
        &mut self,
        pitch: u8,
        velocity: u8,
        origin: EventOrigin,
        raw: Option<RawKey>,
        t: MonotonicNanos,
    ) {
        let batch = self.allocator.note_on(pitch, velocity, self.primary_channel, origin, raw, t);
        self.forward(batch);

        let primary = NoteEvent::On { pitch, velocity, channel: self.primary_channel, origin };
        if let Some(NoteEvent::On { pitch, velocity, channel, origin }) =
            layer::duplicate(&self.state.layer, self.primary_channel, &primary)
        {
            let batch = self.allocator.note_on(pitch, velocity, channel, origin, None, t);
            self.forward(batch);
        }
    }

    fn submit_off(&mut self, pitch: u8, channel: u8, t: MonotonicNanos) {
        let batch = self.allocator.note_off(pitch, channel, t);
        self.forward(batch);

        if channel == self.primary_channel && self.state.layer.enabled {
            let batch = self.allocator.note_off(pitch, self.state.layer.channel, t);
            self.forward(batch);
        }
    }

    fn forward(&mut self, batch: EventBatch) {
        for ev in batch {
            self.bus.push(ev);
            self.telemetry.send(TelemetryEvent::Note(ev));
        }
        self.voice_gauge.store(self.allocator.voice_count(), Ordering::Relaxed);
    }

    fn forward_single(&mut self, ev: NoteEvent) {
        self.bus.push(ev);
        self.telemetry.send(TelemetryEvent::Note(ev));
    }
}
