//! Process wiring: builds the pipeline, owns the cpal stream, runs the
//! supervisory loop, and orchestrates shutdown.
//!
//! Thread layout follows the concurrency model: reader threads and the
//! fan-in thread form the input context, the cpal callback is the audio
//! context, and the supervisor/health/telemetry threads plus this loop are
//! supervisory. The cpal `Stream` is not `Send`, so every stream build and
//! rebuild happens here on the main thread.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use basedrop::{Collector, Owned};
use clap::ValueEnum;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, FromSample, SampleFormat, SizedSample, StreamConfig};
use crossbeam_channel::{Receiver, Sender};
use thread_priority::ThreadPriority;

use crate::arp::tick_period_frames;
use crate::bus::{self, note_channel, BusConsumer, TelemetrySender};
use crate::config::{Config, SessionState, PRIMARY_CHANNEL};
use crate::engine::{
    AudioSharedFlags, EngineCommand, InputEngine, InputEngineParams, RendererAdapter,
    StateSnapshot,
};
use crate::error::{AudioError, StartupError};
use crate::event::TelemetryEvent;
use crate::health::{DeviceErrors, HealthAction, HealthCommand, HealthProbe};
use crate::input::{DeviceSupervisor, SupervisorConfig};
use crate::render::{Renderer, SoundFontRenderer};
use crate::state::LayerState;
use crate::time::SampleRate;
use crate::velocity::VelocityMode;

const INPUT_CHANNEL_CAPACITY: usize = 8192;
const TICK_RING_CAPACITY: usize = 64;
const LATENCY_RING_CAPACITY: usize = 2048;
/// Scratch sizing bound when the driver picks the buffer size itself.
const MAX_EXPECTED_FRAMES: usize = 8192;
const DEFAULT_REBUILD_FRAMES: u32 = 256;

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(2);
/// Fan-in thread priority, below the audio thread but above the desktop.
const INPUT_THREAD_PRIORITY: u8 = 70;

/// Well-known system soundfont locations, used when nothing is configured.
const SOUNDFONT_FALLBACK_DIRS: &[&str] =
    &["/usr/share/sounds/sf2", "/usr/share/soundfonts", "/usr/local/share/soundfonts"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Driver {
    Auto,
    Alsa,
    #[cfg(feature = "jack")]
    Jack,
}

/// Everything resolved from CLI flags, environment and config before the
/// pipeline starts.
pub struct AppOptions {
    pub config: Config,
    pub soundfont: Option<PathBuf>,
    pub driver: Driver,
    /// Resolved against the persisted session when absent.
    pub octave: Option<u8>,
    pub program: Option<u8>,
    pub velocity_mode: Option<VelocityMode>,
    pub fixed_velocity: Option<u8>,
    pub midi_port: Option<String>,
    pub headless: bool,
    pub session_path: PathBuf,
}

pub struct App {
    collector: Collector,
    session: SessionState,
    session_path: PathBuf,
    soundfont: PathBuf,

    device: cpal::Device,
    sample_rate: SampleRate,
    channels: usize,
    sample_format: SampleFormat,
    buffer_frames: Option<u32>,
    arp_period_frames: u64,
    max_polyphony: usize,

    stream: Option<cpal::Stream>,
    renderer_failures: u32,

    flags: AudioSharedFlags,
    telemetry: TelemetrySender,
    engine_tx: Sender<EngineCommand>,
    health_cmd_tx: Sender<HealthCommand>,
    action_rx: Receiver<HealthAction>,
    snapshot_rx: Receiver<StateSnapshot>,

    run_input: Arc<AtomicBool>,
    run_supervisor: Arc<AtomicBool>,
    run_health: Arc<AtomicBool>,
    input_join: Option<JoinHandle<()>>,
    supervisor_join: Option<JoinHandle<()>>,
    health_join: Option<JoinHandle<()>>,
    telemetry_join: Option<JoinHandle<()>>,
}

impl App {
    /// Builds and starts the whole pipeline. On success the synth is live.
    pub fn bootstrap(options: AppOptions) -> Result<App, StartupError> {
        let AppOptions {
            mut config,
            soundfont,
            driver,
            octave,
            program,
            velocity_mode,
            fixed_velocity,
            midi_port,
            headless,
            session_path,
        } = options;

        if let Some(mode) = velocity_mode {
            config.velocity.mode = mode;
        }
        if let Some(fixed) = fixed_velocity {
            config.velocity.fixed = fixed;
        }
        config.validate()?;

        let mut session = SessionState::load(&session_path);
        let soundfont = resolve_soundfont(soundfont, &session)?;
        session.remember_favorite(&soundfont);

        let octave = octave.unwrap_or(session.last_octave);
        let program = program.unwrap_or(session.last_program);

        // ---  Audio device  --------------------------------------------------

        let (device, supported) = open_output(driver)?;
        let sample_rate = SampleRate(supported.sample_rate().0);
        let channels = usize::from(supported.channels());
        let sample_format = supported.sample_format();
        let buffer_frames = config.audio.buffer_frames;

        log::info!(
            "Audio output: {} ch, {} Hz, {:?}",
            channels,
            sample_rate.0,
            sample_format
        );

        let arp_period_frames =
            tick_period_frames(sample_rate, config.audio.bpm, config.audio.subdivision);
        let max_polyphony = config.audio.max_polyphony;

        // ---  Channels and shared state  -------------------------------------

        let collector = Collector::new();
        let flags = AudioSharedFlags::new();
        let voice_gauge = Arc::new(AtomicUsize::new(0));
        let errors = DeviceErrors::new();

        let (telemetry, telemetry_rx) = bus::telemetry_channel(bus::DEFAULT_TELEMETRY_CAPACITY);
        let (input_tx, input_rx) = crossbeam_channel::bounded(INPUT_CHANNEL_CAPACITY);
        let (engine_tx, engine_rx) = crossbeam_channel::unbounded();
        let (supervisor_cmd_tx, supervisor_cmd_rx) = crossbeam_channel::unbounded();
        let (health_cmd_tx, health_cmd_rx) = crossbeam_channel::unbounded();
        let (action_tx, action_rx) = crossbeam_channel::unbounded();
        let (snapshot_tx, snapshot_rx) = crossbeam_channel::bounded(1);

        let (bus_tx, bus_rx) = note_channel(bus::DEFAULT_CAPACITY);
        let bus_metrics = bus_tx.metrics();
        let (tick_tx, tick_rx) = rtrb::RingBuffer::new(TICK_RING_CAPACITY);
        let (latency_tx, latency_rx) = rtrb::RingBuffer::new(LATENCY_RING_CAPACITY);

        // ---  Device supervisor  ---------------------------------------------

        let mut supervisor = DeviceSupervisor::new(
            SupervisorConfig {
                grab_keyboards: config.input.grab_keyboards,
                grab_touchpads: config.input.grab_touchpads,
            },
            input_tx.clone(),
            telemetry.clone(),
            errors.clone(),
            supervisor_cmd_rx,
        );

        let reader_count = supervisor.initial_discovery()?;
        if let Some(wanted) = &midi_port {
            supervisor.connect_midi(wanted)?;
        }
        if reader_count == 0 && !supervisor.has_midi() {
            return Err(StartupError::NoInputDevices);
        }

        // ---  Fan-in (input context)  ----------------------------------------

        let params = InputEngineParams {
            keymap: config.build_keymap()?,
            velocity: config.velocity.clone(),
            max_polyphony,
            octave,
            program,
            layer: LayerState {
                enabled: config.layer.enabled,
                program: config.layer.program,
                channel: config.layer.channel,
            },
            primary_channel: PRIMARY_CHANNEL,
            arp_seed: crate::time::now().0 | 1,
        };
        let mut engine = InputEngine::new(
            params,
            input_rx,
            engine_rx,
            tick_rx,
            bus_tx,
            telemetry.clone(),
            flags.clone(),
            Arc::clone(&voice_gauge),
        );

        let run_input = Arc::new(AtomicBool::new(true));
        let run_input_clone = Arc::clone(&run_input);
        let input_join = thread_priority::spawn(
            ThreadPriority::Crossplatform(INPUT_THREAD_PRIORITY.try_into().unwrap()),
            move |priority_res| {
                if let Err(e) = priority_res {
                    log::warn!("Could not raise input thread priority: {:?}", e);
                }
                engine.run(run_input_clone);
                let _ = snapshot_tx.send(engine.snapshot());
            },
        );

        // ---  Supervisory context  -------------------------------------------

        let run_supervisor = Arc::new(AtomicBool::new(true));
        let run_supervisor_clone = Arc::clone(&run_supervisor);
        let supervisor_join = std::thread::Builder::new()
            .name("keysynth-supervisor".into())
            .spawn(move || supervisor.run(run_supervisor_clone))
            .expect("failed to spawn supervisor thread");

        let buffer_period_nanos = buffer_period_nanos(sample_rate, buffer_frames);
        let mut probe = HealthProbe::new(
            latency_rx,
            bus_metrics,
            buffer_period_nanos,
            voice_gauge,
            flags.clone(),
            errors,
            engine_tx.clone(),
            supervisor_cmd_tx,
            action_tx,
            telemetry.clone(),
            health_cmd_rx,
        );
        let run_health = Arc::new(AtomicBool::new(true));
        let run_health_clone = Arc::clone(&run_health);
        let health_join = std::thread::Builder::new()
            .name("keysynth-health".into())
            .spawn(move || probe.run(run_health_clone))
            .expect("failed to spawn health thread");

        let telemetry_join = if headless {
            drop(telemetry_rx);
            None
        } else {
            Some(spawn_telemetry_logger(telemetry_rx))
        };

        let mut app = App {
            collector,
            session,
            session_path,
            soundfont,
            device,
            sample_rate,
            channels,
            sample_format,
            buffer_frames,
            arp_period_frames,
            max_polyphony,
            stream: None,
            renderer_failures: 0,
            flags,
            telemetry,
            engine_tx,
            health_cmd_tx,
            action_rx,
            snapshot_rx,
            run_input,
            run_supervisor,
            run_health,
            input_join: Some(input_join),
            supervisor_join: Some(supervisor_join),
            health_join: Some(health_join),
            telemetry_join,
        };

        // ---  Audio stream (audio context)  ----------------------------------

        let renderer = app.build_renderer();
        app.start_stream(renderer, bus_rx, tick_tx, latency_tx)?;

        Ok(app)
    }

    /// Supervisory loop until the shutdown flag flips.
    pub fn run(&mut self, shutdown: Arc<AtomicBool>) {
        while !shutdown.load(Ordering::Relaxed) {
            if let Ok(action) = self.action_rx.recv_timeout(Duration::from_millis(100)) {
                match action {
                    HealthAction::RebuildStreamDoubled => self.rebuild_stream(),
                }
            }
            self.collector.collect();
        }
        self.shutdown();
    }

    fn build_renderer(&mut self) -> Option<Box<dyn Renderer>> {
        match SoundFontRenderer::load(
            &self.soundfont,
            self.sample_rate,
            self.max_polyphony,
            self.max_frames(),
        ) {
            Ok(renderer) => Some(Box::new(renderer)),
            Err(e) => {
                self.renderer_failures += 1;
                if self.renderer_failures == 1 {
                    log::error!("Renderer failed ({}); will retry once on rebuild", e);
                } else {
                    // Second failure: keep the pipeline alive in silent
                    // mode rather than flapping.
                    log::error!("Renderer failed again ({}); continuing silent", e);
                    self.telemetry.send(TelemetryEvent::SilentMode);
                }
                None
            }
        }
    }

    fn max_frames(&self) -> usize {
        self.buffer_frames.map(|f| f as usize * 2).unwrap_or(MAX_EXPECTED_FRAMES)
    }

    fn start_stream(
        &mut self,
        renderer: Option<Box<dyn Renderer>>,
        bus_rx: BusConsumer,
        tick_tx: rtrb::Producer<u64>,
        latency_tx: rtrb::Producer<u64>,
    ) -> Result<(), AudioError> {
        let adapter = RendererAdapter::new(
            renderer,
            bus_rx,
            tick_tx,
            latency_tx,
            self.flags.clone(),
            self.sample_rate,
            self.max_frames(),
            self.arp_period_frames,
        );
        let adapter = Owned::new(&self.collector.handle(), adapter);

        let (mut adapter_tx, adapter_rx) = rtrb::RingBuffer::new(2);
        if adapter_tx.push(adapter).is_err() {
            return Err(AudioError::BuildStream("adapter handoff ring full".into()));
        }

        let config = StreamConfig {
            channels: self.channels as u16,
            sample_rate: cpal::SampleRate(self.sample_rate.0),
            buffer_size: match self.buffer_frames {
                Some(frames) => BufferSize::Fixed(frames),
                None => BufferSize::Default,
            },
        };

        let stream = match self.sample_format {
            SampleFormat::F32 => build_stream::<f32>(&self.device, &config, adapter_rx),
            SampleFormat::I16 => build_stream::<i16>(&self.device, &config, adapter_rx),
            SampleFormat::U16 => build_stream::<u16>(&self.device, &config, adapter_rx),
            _ => Err(AudioError::NoUsableConfig),
        }?;

        stream.play().map_err(|e| AudioError::Play(e.to_string()))?;
        self.stream = Some(stream);
        Ok(())
    }

    /// Tear the stream down and bring it back with twice the buffer. Fresh
    /// rings on both sides; the fan-in task and the health probe are handed
    /// their new ends.
    fn rebuild_stream(&mut self) {
        let doubled = match self.buffer_frames {
            Some(frames) => (frames * 2).min(8192),
            None => DEFAULT_REBUILD_FRAMES,
        };
        log::warn!("Rebuilding audio stream with buffer of {} frames", doubled);
        self.buffer_frames = Some(doubled);

        // Dropping the old stream drops its adapter; basedrop hands the
        // carcass back to our collector.
        self.stream = None;

        let (bus_tx, bus_rx) = note_channel(bus::DEFAULT_CAPACITY);
        let bus_metrics = bus_tx.metrics();
        let (tick_tx, tick_rx) = rtrb::RingBuffer::new(TICK_RING_CAPACITY);
        let (latency_tx, latency_rx) = rtrb::RingBuffer::new(LATENCY_RING_CAPACITY);

        let _ = self
            .engine_tx
            .send(EngineCommand::ReplaceAudioLink { bus: bus_tx, ticks: tick_rx });
        let _ = self.health_cmd_tx.send(HealthCommand::StreamRebuilt {
            metrics: bus_metrics,
            latency_rx,
            buffer_period_nanos: buffer_period_nanos(self.sample_rate, self.buffer_frames),
        });

        let renderer = self.build_renderer();
        if let Err(e) = self.start_stream(renderer, bus_rx, tick_tx, latency_tx) {
            log::error!("Stream rebuild failed: {}; audio is down until the next attempt", e);
        }
        self.collector.collect();
    }

    /// Ordered shutdown: input context first so the last keystroke plays,
    /// then panic into the audio context, then the supervisory tasks. A
    /// watchdog enforces the hard deadline.
    fn shutdown(&mut self) {
        log::info!("Shutting down");

        std::thread::Builder::new()
            .name("keysynth-shutdown-watchdog".into())
            .spawn(|| {
                std::thread::sleep(SHUTDOWN_DEADLINE);
                log::error!("Shutdown deadline exceeded; terminating");
                std::process::exit(130);
            })
            .ok();

        // Readers stop and flush their terminal events into the fan-in
        // channel.
        self.run_supervisor.store(false, Ordering::Relaxed);
        if let Some(join) = self.supervisor_join.take() {
            let _ = join.join();
        }

        // The fan-in task drains what is left, then pushes a panic onto the
        // bus.
        self.run_input.store(false, Ordering::Relaxed);
        if let Some(join) = self.input_join.take() {
            let _ = join.join();
        }
        if let Ok(snapshot) = self.snapshot_rx.recv_timeout(Duration::from_millis(100)) {
            self.session.last_octave = snapshot.octave;
            self.session.last_program = snapshot.program;
            self.session.layer_enabled = snapshot.layer_enabled;
            self.session.arp_mode = snapshot.arp_mode;
        }

        // A couple of buffers for the panic to reach the renderer, then the
        // stream goes away.
        std::thread::sleep(Duration::from_millis(50));
        self.stream = None;

        self.run_health.store(false, Ordering::Relaxed);
        if let Some(join) = self.health_join.take() {
            let _ = join.join();
        }
        // The telemetry logger parks on the channel until every sender is
        // gone; it dies with the process rather than being joined here.
        drop(self.telemetry_join.take());

        if let Err(e) = self.session.save(&self.session_path) {
            log::warn!("Could not save session state: {}", e);
        }
        self.collector.collect();
    }
}

fn buffer_period_nanos(sample_rate: SampleRate, buffer_frames: Option<u32>) -> u64 {
    let frames = buffer_frames.unwrap_or(1024);
    (f64::from(frames) * sample_rate.recip() * 1e9) as u64
}

fn open_output(driver: Driver) -> Result<(cpal::Device, cpal::SupportedStreamConfig), AudioError> {
    let host = match driver {
        Driver::Auto => cpal::default_host(),
        Driver::Alsa => cpal::host_from_id(cpal::HostId::Alsa)
            .map_err(|_| AudioError::UnknownDriver("alsa".into()))?,
        #[cfg(feature = "jack")]
        Driver::Jack => cpal::host_from_id(cpal::HostId::Jack)
            .map_err(|_| AudioError::UnknownDriver("jack".into()))?,
    };

    let device = host.default_output_device().ok_or(AudioError::NoOutputDevice)?;
    let supported = device.default_output_config().map_err(|_| AudioError::NoUsableConfig)?;
    Ok((device, supported))
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut adapter_rx: rtrb::Consumer<Owned<RendererAdapter>>,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = usize::from(config.channels);
    let mut adapter: Option<Owned<RendererAdapter>> = None;

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                while let Ok(new) = adapter_rx.pop() {
                    adapter = Some(new);
                }
                match adapter.as_mut() {
                    Some(a) => a.process(data, channels),
                    None => data.fill(T::from_sample(0.0f32)),
                }
            },
            |e| log::error!("Audio stream error: {}", e),
            None,
        )
        .map_err(|e| AudioError::BuildStream(e.to_string()))
}

/// Soundfont resolution: explicit path, then session favorites, then the
/// well-known system directories.
fn resolve_soundfont(
    explicit: Option<PathBuf>,
    session: &SessionState,
) -> Result<PathBuf, StartupError> {
    if let Some(path) = explicit {
        if path.is_file() {
            return Ok(path);
        }
        return Err(StartupError::Renderer(crate::error::RendererError::SoundFontOpen {
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
            path,
        }));
    }

    for favorite in &session.soundfont_favorites {
        if favorite.is_file() {
            log::info!("Using favorite soundfont {}", favorite.display());
            return Ok(favorite.clone());
        }
    }

    for dir in SOUNDFONT_FALLBACK_DIRS {
        if let Ok(entries) = std::fs::read_dir(dir) {
            let mut candidates: Vec<PathBuf> = entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| {
                    p.extension().map(|ext| ext.eq_ignore_ascii_case("sf2")).unwrap_or(false)
                })
                .collect();
            candidates.sort();
            if let Some(found) = candidates.into_iter().next() {
                log::info!("Using system soundfont {}", found.display());
                return Ok(found);
            }
        }
    }

    Err(StartupError::Renderer(crate::error::RendererError::SoundFontOpen {
        source: std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no soundfont given and none found in the system directories",
        ),
        path: Path::new("(none)").to_path_buf(),
    }))
}

/// The "UI" of the headful mode: a plain consumer of the telemetry feed.
fn spawn_telemetry_logger(rx: Receiver<TelemetryEvent>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("keysynth-telemetry".into())
        .spawn(move || {
            for ev in rx.iter() {
                match ev {
                    TelemetryEvent::Note(note) => log::trace!("note: {:?}", note),
                    TelemetryEvent::DeviceArrived { name, class, .. } => {
                        log::debug!("device arrived: {} ({})", name, class);
                    }
                    TelemetryEvent::DeviceRemoved { id } => {
                        log::debug!("device removed: {:?}", id);
                    }
                    TelemetryEvent::RenderLatency { avg_ns, p95_ns } => {
                        log::trace!(
                            "render latency avg {:.2} ms, p95 {:.2} ms",
                            avg_ns as f64 / 1e6,
                            p95_ns as f64 / 1e6
                        );
                    }
                    TelemetryEvent::BusDropTotal(0) => {}
                    TelemetryEvent::BusDropTotal(n) => log::debug!("bus drops: {}", n),
                    TelemetryEvent::VoiceCount(n) => log::trace!("voices: {}", n),
                    TelemetryEvent::XrunCount(n) => log::debug!("xruns: {}", n),
                    TelemetryEvent::SilentMode => log::warn!("renderer down; running silent"),
                }
            }
        })
        .expect("failed to spawn telemetry thread")
}
