//! The renderer adapter: everything the audio callback runs.
//!
//! One adapter instance lives inside the cpal callback closure. Per buffer it
//! advances the arpeggiator clock, drains a bounded slice of the realtime
//! bus into the renderer, renders, and records its own wall-clock span for
//! the health probe. It owns no other state and never allocates; replacement
//! adapters arrive whole over an rtrb ring and the old one is reclaimed
//! through basedrop.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use cpal::{FromSample, SizedSample};
use rtrb::Producer;

use crate::bus::BusConsumer;
use crate::event::NoteEvent;
use crate::render::Renderer;
use crate::time::SampleRate;

/// Bound on bus events applied per render call, so an event storm degrades
/// into latency rather than a missed deadline.
pub const MAX_EVENTS_PER_CYCLE: usize = 256;

/// Atomics shared between the audio context and the rest of the system.
#[derive(Clone)]
pub struct AudioSharedFlags {
    /// Set by the fan-in task when an arp run starts, so the first step it
    /// just played gets a full period before the next tick.
    pub clock_reset: Arc<AtomicBool>,
    /// Render calls that overran their buffer period.
    pub xruns: Arc<AtomicU64>,
}

impl AudioSharedFlags {
    pub fn new() -> Self {
        Self { clock_reset: Arc::new(AtomicBool::new(false)), xruns: Arc::new(AtomicU64::new(0)) }
    }
}

impl Default for AudioSharedFlags {
    fn default() -> Self {
        Self::new()
    }
}

pub struct RendererAdapter {
    /// `None` is silent mode: the bus still drains and the clock still runs,
    /// but output is zeros.
    renderer: Option<Box<dyn Renderer>>,
    bus: BusConsumer,
    tick_tx: Producer<u64>,
    latency_tx: Producer<u64>,
    flags: AudioSharedFlags,

    period_frames: u64,
    frames_into_period: u64,
    tick_serial: u64,

    sample_rate_recip: f64,
    scratch: Vec<f32>,
}

impl RendererAdapter {
    pub fn new(
        renderer: Option<Box<dyn Renderer>>,
        bus: BusConsumer,
        tick_tx: Producer<u64>,
        latency_tx: Producer<u64>,
        flags: AudioSharedFlags,
        sample_rate: SampleRate,
        max_frames: usize,
        arp_period_frames: u64,
    ) -> Self {
        Self {
            renderer,
            bus,
            tick_tx,
            latency_tx,
            flags,
            period_frames: arp_period_frames.max(1),
            frames_into_period: 0,
            tick_serial: 0,
            sample_rate_recip: sample_rate.recip(),
            scratch: vec![0.0; max_frames.max(64) * 2],
        }
    }

    pub fn is_silent(&self) -> bool {
        self.renderer.is_none()
    }

    /// One audio callback: apply pending events, then fill `out`.
    pub fn process<T: SizedSample + FromSample<f32>>(
        &mut self,
        out: &mut [T],
        out_channels: usize,
    ) {
        let proc_start = Instant::now();

        if out_channels == 0 || out.len() < out_channels {
            for s in out.iter_mut() {
                *s = T::from_sample(0.0f32);
            }
            return;
        }
        let frames = out.len() / out_channels;

        self.advance_clock(frames as u64);
        self.apply_pending();
        self.fill(out, out_channels, frames);

        let span = proc_start.elapsed().as_nanos() as u64;
        let _ = self.latency_tx.push(span);

        let budget = (frames as f64 * self.sample_rate_recip * 1e9) as u64;
        if span > budget {
            self.flags.xruns.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn advance_clock(&mut self, frames: u64) {
        if self.flags.clock_reset.swap(false, Ordering::SeqCst) {
            self.frames_into_period = 0;
        }
        self.frames_into_period += frames;
        while self.frames_into_period >= self.period_frames {
            self.frames_into_period -= self.period_frames;
            self.tick_serial += 1;
            // A full tick queue means the fan-in task is stalled; skipping
            // beats blocking the callback.
            let _ = self.tick_tx.push(self.tick_serial);
        }
    }

    fn apply_pending(&mut self) {
        for _ in 0..MAX_EVENTS_PER_CYCLE {
            let ev = match self.bus.pop() {
                Some(ev) => ev,
                None => break,
            };
            let renderer = match self.renderer.as_mut() {
                Some(r) => r,
                None => continue,
            };
            match ev {
                NoteEvent::On { pitch, velocity, channel, .. } => {
                    renderer.note_on(channel, pitch, velocity.max(1));
                }
                NoteEvent::Off { pitch, channel, .. } => renderer.note_off(channel, pitch),
                NoteEvent::Cc { channel, controller, value } => {
                    renderer.cc(channel, controller, value);
                }
                NoteEvent::Bend { channel, value } => renderer.pitch_bend(channel, value),
                NoteEvent::Program { channel, program } => {
                    renderer.program_change(channel, program);
                }
                NoteEvent::Panic => renderer.panic(),
            }
        }
    }

    fn fill<T: SizedSample + FromSample<f32>>(
        &mut self,
        out: &mut [T],
        out_channels: usize,
        frames: usize,
    ) {
        let mut frame_off = 0;
        while frame_off < frames {
            let chunk = (frames - frame_off).min(self.scratch.len() / 2);
            let scratch = &mut self.scratch[..chunk * 2];
            match self.renderer.as_mut() {
                Some(r) => r.render(scratch),
                None => scratch.fill(0.0),
            }

            for i in 0..chunk {
                let base = (frame_off + i) * out_channels;
                for ch in 0..out_channels {
                    let s = if ch < 2 { scratch[i * 2 + ch] } else { 0.0 };
                    out[base + ch] = T::from_sample(s);
                }
            }
            frame_off += chunk;
        }
    }
}
