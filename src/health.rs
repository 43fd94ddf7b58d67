//! Non-realtime watchdog.
//!
//! Ten times a second the probe reads the render-latency ring, the bus drop
//! counter, the voice gauge and the per-device error counters, publishes a
//! telemetry summary, and kicks off recovery when a threshold is crossed:
//! render overruns trigger a panic plus a doubled-buffer stream rebuild,
//! noisy devices get their reader reopened, and sustained bus drops are
//! reported but deliberately left alone.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use fnv::FnvHashMap;
use rtrb::Consumer;
use smallvec::SmallVec;

use crate::bus::{BusMetrics, TelemetrySender};
use crate::engine::audio_thread::AudioSharedFlags;
use crate::engine::input_thread::EngineCommand;
use crate::event::{DeviceId, TelemetryEvent};
use crate::input::supervisor::SupervisorCommand;

pub const PROBE_INTERVAL: Duration = Duration::from_millis(100);

const DEVICE_ERROR_LIMIT_PER_MINUTE: u32 = 10;
const BUS_DROP_LIMIT_PER_SECOND: u64 = 100;
/// Probe ticks per device-error accounting window (one minute).
const TICKS_PER_MINUTE: u32 = 600;
/// Probe ticks per bus-drop rate sample (one second).
const TICKS_PER_SECOND: u32 = 10;
/// Minimum spacing between stream-rebuild requests.
const REBUILD_COOLDOWN: Duration = Duration::from_secs(5);

const LATENCY_DRAIN_LIMIT: usize = 1024;

/// Shared per-device error tally, bumped by readers and the supervisor,
/// drained once a minute by the probe.
#[derive(Clone, Default)]
pub struct DeviceErrors {
    counts: Arc<Mutex<FnvHashMap<u32, u32>>>,
}

impl DeviceErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bump(&self, id: DeviceId) {
        let mut counts = self.counts.lock().unwrap();
        *counts.entry(id.0).or_insert(0) += 1;
    }

    pub fn drain(&self) -> SmallVec<[(DeviceId, u32); 4]> {
        let mut counts = self.counts.lock().unwrap();
        counts.drain().map(|(id, n)| (DeviceId(id), n)).collect()
    }
}

/// Recovery the probe cannot perform itself; the app main loop executes it.
#[derive(Debug, Clone, Copy)]
pub enum HealthAction {
    /// Render calls are overrunning the buffer period: rebuild the audio
    /// stream with twice the buffer.
    RebuildStreamDoubled,
}

pub enum HealthCommand {
    /// The stream was rebuilt; watch the new ring and budget.
    StreamRebuilt { metrics: BusMetrics, latency_rx: Consumer<u64>, buffer_period_nanos: u64 },
}

pub struct HealthProbe {
    latency_rx: Consumer<u64>,
    metrics: BusMetrics,
    /// Drops accumulated on rings that were retired by stream rebuilds, so
    /// the exported total stays monotonic.
    drop_base: u64,
    buffer_period_nanos: u64,

    voice_gauge: Arc<AtomicUsize>,
    flags: AudioSharedFlags,
    errors: DeviceErrors,

    engine_tx: Sender<EngineCommand>,
    supervisor_tx: Sender<SupervisorCommand>,
    action_tx: Sender<HealthAction>,
    telemetry: TelemetrySender,
    cmd_rx: Receiver<HealthCommand>,

    window: Vec<u64>,
    last_xruns: u64,
    last_drop_total: u64,
    drops_this_second: u64,
    drop_seconds_over: u32,
    tick: u32,
    last_rebuild: Option<Instant>,
}

impl HealthProbe {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        latency_rx: Consumer<u64>,
        metrics: BusMetrics,
        buffer_period_nanos: u64,
        voice_gauge: Arc<AtomicUsize>,
        flags: AudioSharedFlags,
        errors: DeviceErrors,
        engine_tx: Sender<EngineCommand>,
        supervisor_tx: Sender<SupervisorCommand>,
        action_tx: Sender<HealthAction>,
        telemetry: TelemetrySender,
        cmd_rx: Receiver<HealthCommand>,
    ) -> Self {
        Self {
            latency_rx,
            metrics,
            drop_base: 0,
            buffer_period_nanos,
            voice_gauge,
            flags,
            errors,
            engine_tx,
            supervisor_tx,
            action_tx,
            telemetry,
            cmd_rx,
            window: Vec::with_capacity(LATENCY_DRAIN_LIMIT),
            last_xruns: 0,
            last_drop_total: 0,
            drops_this_second: 0,
            drop_seconds_over: 0,
            tick: 0,
            last_rebuild: None,
        }
    }

    pub fn run(&mut self, run: Arc<AtomicBool>) {
        while run.load(Ordering::Relaxed) {
            std::thread::sleep(PROBE_INTERVAL);
            self.tick();
        }
    }

    pub fn tick(&mut self) {
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            match cmd {
                HealthCommand::StreamRebuilt { metrics, latency_rx, buffer_period_nanos } => {
                    self.drop_base += self.metrics.dropped();
                    self.metrics = metrics;
                    self.latency_rx = latency_rx;
                    self.buffer_period_nanos = buffer_period_nanos;
                }
            }
        }

        self.tick = self.tick.wrapping_add(1);

        self.sample_latency();
        self.check_xruns();
        self.check_bus_drops();
        if self.tick % TICKS_PER_MINUTE == 0 {
            self.check_device_errors();
        }

        self.telemetry
            .send(TelemetryEvent::VoiceCount(self.voice_gauge.load(Ordering::Relaxed)));
    }

    fn sample_latency(&mut self) {
        self.window.clear();
        while self.window.len() < LATENCY_DRAIN_LIMIT {
            match self.latency_rx.pop() {
                Ok(ns) => self.window.push(ns),
                Err(_) => break,
            }
        }
        if self.window.is_empty() {
            return;
        }

        let sum: u64 = self.window.iter().sum();
        let avg_ns = sum / self.window.len() as u64;
        self.window.sort_unstable();
        let p95_ns = self.window[(self.window.len() * 95 / 100).min(self.window.len() - 1)];
        self.telemetry.send(TelemetryEvent::RenderLatency { avg_ns, p95_ns });

        if p95_ns > self.buffer_period_nanos {
            self.overrun_recovery("p95 render latency above the buffer period");
        }
    }

    fn check_xruns(&mut self) {
        let xruns = self.flags.xruns.load(Ordering::Relaxed);
        if xruns > self.last_xruns {
            self.telemetry.send(TelemetryEvent::XrunCount(xruns));
            self.overrun_recovery("render overrun");
        }
        self.last_xruns = xruns;
    }

    /// Panic the pipeline and ask the app for a bigger buffer, at most once
    /// per cooldown window.
    fn overrun_recovery(&mut self, reason: &str) {
        let now = Instant::now();
        if let Some(last) = self.last_rebuild {
            if now.duration_since(last) < REBUILD_COOLDOWN {
                return;
            }
        }
        self.last_rebuild = Some(now);

        log::warn!("Audio overrun ({}); requesting panic and a doubled buffer", reason);
        let _ = self.engine_tx.send(EngineCommand::Panic);
        let _ = self.action_tx.send(HealthAction::RebuildStreamDoubled);
    }

    fn check_bus_drops(&mut self) {
        let total = self.drop_base + self.metrics.dropped();
        self.drops_this_second += total - self.last_drop_total;
        self.last_drop_total = total;
        self.telemetry.send(TelemetryEvent::BusDropTotal(total));

        if self.tick % TICKS_PER_SECOND == 0 {
            if self.drops_this_second > BUS_DROP_LIMIT_PER_SECOND {
                self.drop_seconds_over += 1;
                // An event storm the user should see; hiding it by resizing
                // would only mask the cause.
                if self.drop_seconds_over >= 2 {
                    log::warn!(
                        "Realtime bus shedding {} events/s (total {})",
                        self.drops_this_second,
                        total
                    );
                }
            } else {
                self.drop_seconds_over = 0;
            }
            self.drops_this_second = 0;
        }
    }

    fn check_device_errors(&mut self) {
        for (id, count) in self.errors.drain() {
            if count > DEVICE_ERROR_LIMIT_PER_MINUTE {
                log::warn!(
                    "Device {:?}: {} errors in the last minute; reopening its reader",
                    id,
                    count
                );
                let _ = self.supervisor_tx.send(SupervisorCommand::ReopenDevice(id));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{note_channel, telemetry_channel};
    use crate::event::NoteEvent;

    fn probe_parts() -> (
        HealthProbe,
        rtrb::Producer<u64>,
        Receiver<EngineCommand>,
        Receiver<SupervisorCommand>,
        Receiver<HealthAction>,
    ) {
        let (lat_tx, lat_rx) = rtrb::RingBuffer::new(2048);
        let (bus_tx, _bus_rx) = note_channel(16);
        let (engine_tx, engine_rx) = crossbeam_channel::unbounded();
        let (sup_tx, sup_rx) = crossbeam_channel::unbounded();
        let (action_tx, action_rx) = crossbeam_channel::unbounded();
        let (telemetry, _telemetry_rx) = telemetry_channel(64);
        let (_cmd_tx, cmd_rx) = crossbeam_channel::unbounded();

        let probe = HealthProbe::new(
            lat_rx,
            bus_tx.metrics(),
            5_000_000, // 5 ms budget
            Arc::new(AtomicUsize::new(0)),
            AudioSharedFlags::new(),
            DeviceErrors::new(),
            engine_tx,
            sup_tx,
            action_tx,
            telemetry,
            cmd_rx,
        );
        // Keep the producer alive so the ring has two ends.
        std::mem::forget(bus_tx);
        (probe, lat_tx, engine_rx, sup_rx, action_rx)
    }

    #[test]
    fn healthy_latency_triggers_nothing() {
        let (mut probe, mut lat_tx, engine_rx, _sup, action_rx) = probe_parts();
        for _ in 0..32 {
            lat_tx.push(1_000_000).unwrap();
        }
        probe.tick();
        assert!(engine_rx.try_recv().is_err());
        assert!(action_rx.try_recv().is_err());
    }

    #[test]
    fn overrun_latency_requests_panic_and_rebuild() {
        let (mut probe, mut lat_tx, engine_rx, _sup, action_rx) = probe_parts();
        for _ in 0..32 {
            lat_tx.push(9_000_000).unwrap();
        }
        probe.tick();
        assert!(matches!(engine_rx.try_recv(), Ok(EngineCommand::Panic)));
        assert!(matches!(action_rx.try_recv(), Ok(HealthAction::RebuildStreamDoubled)));
    }

    #[test]
    fn rebuild_requests_are_rate_limited() {
        let (mut probe, mut lat_tx, _engine, _sup, action_rx) = probe_parts();
        for _ in 0..8 {
            lat_tx.push(9_000_000).unwrap();
        }
        probe.tick();
        for _ in 0..8 {
            lat_tx.push(9_000_000).unwrap();
        }
        probe.tick();
        assert!(action_rx.try_recv().is_ok());
        assert!(action_rx.try_recv().is_err());
    }

    #[test]
    fn noisy_device_gets_reopened_after_a_minute() {
        let (mut probe, _lat, _engine, sup_rx, _action) = probe_parts();
        for _ in 0..20 {
            probe.errors.bump(DeviceId(3));
        }
        for _ in 0..TICKS_PER_MINUTE {
            probe.tick();
        }
        assert!(matches!(sup_rx.try_recv(), Ok(SupervisorCommand::ReopenDevice(DeviceId(3)))));
    }

    #[test]
    fn device_error_counts_reset_each_minute() {
        let errors = DeviceErrors::new();
        for _ in 0..5 {
            errors.bump(DeviceId(1));
        }
        let drained = errors.drain();
        assert_eq!(drained.as_slice(), &[(DeviceId(1), 5)]);
        assert!(errors.drain().is_empty());
    }

    #[test]
    fn drop_totals_stay_monotonic_across_ring_swaps() {
        let (mut probe, _lat, _engine, _sup, _action) = probe_parts();

        let (mut old_tx, mut old_rx) = note_channel(2);
        for p in 0..8 {
            old_tx.push(NoteEvent::Off {
                pitch: p,
                channel: 0,
                origin: crate::event::EventOrigin::Keyboard,
            });
        }
        let _ = old_rx.pop();
        probe.metrics = old_tx.metrics();
        probe.tick();
        let total_before = probe.last_drop_total;
        assert!(total_before > 0);

        let (new_tx, _new_rx) = note_channel(16);
        let (new_lat_tx, new_lat_rx) = rtrb::RingBuffer::new(16);
        std::mem::forget(new_lat_tx);
        probe.cmd_rx = {
            let (tx, rx) = crossbeam_channel::unbounded();
            tx.send(HealthCommand::StreamRebuilt {
                metrics: new_tx.metrics(),
                latency_rx: new_lat_rx,
                buffer_period_nanos: 5_000_000,
            })
            .unwrap();
            rx
        };
        probe.tick();
        assert!(probe.last_drop_total >= total_before);
    }
}
