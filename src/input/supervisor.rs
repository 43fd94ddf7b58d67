//! Device discovery, classification and hot-plug supervision.
//!
//! The supervisor owns every reader. It rescans `/dev/input` on a timer,
//! classifies devices by capability (never by name), grabs and spawns
//! readers with exponential backoff, reaps readers that hit terminal
//! errors, and hands out a fresh device id on every arrival so state never
//! leaks across an unplug/replug cycle. Optional external MIDI input is
//! bridged in through `midir` and treated as one more device.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use crossbeam_channel::{Receiver, Sender};
use evdev::{AbsoluteAxisType, Device, Key};
use fnv::{FnvHashMap, FnvHashSet};
use midir::{Ignore, MidiInput, MidiInputConnection};

use crate::bus::TelemetrySender;
use crate::error::StartupError;
use crate::event::{DeviceClass, DeviceId, InputEvent, TelemetryEvent};
use crate::health::DeviceErrors;
use crate::input::reader::{spawn_reader, ReaderExited, ReaderHandle};
use crate::time;

const RESCAN_INTERVAL: Duration = Duration::from_secs(1);
const SUPERVISOR_TICK: Duration = Duration::from_millis(100);

const GRAB_BACKOFF_BASE: Duration = Duration::from_millis(100);
const GRAB_BACKOFF_CAP: Duration = Duration::from_secs(5);
const GRAB_MAX_ATTEMPTS: u32 = 5;

bitflags! {
    struct Caps: u8 {
        const LETTER_KEYS = 1 << 0;
        const SPACE_KEY = 1 << 1;
        const ABS_POINTER = 1 << 2;
        const TOUCH_BUTTON = 1 << 3;
    }
}

/// Commands from the health probe and the app.
#[derive(Debug, Clone, Copy)]
pub enum SupervisorCommand {
    /// Close and re-open the reader for a misbehaving device.
    ReopenDevice(DeviceId),
}

#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub name: String,
    pub class: DeviceClass,
    pub path: PathBuf,
}

struct PendingGrab {
    path: PathBuf,
    attempts: u32,
    next_try: Instant,
}

pub struct SupervisorConfig {
    /// Grab keyboards exclusively so playing does not type into the desktop.
    pub grab_keyboards: bool,
    pub grab_touchpads: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self { grab_keyboards: true, grab_touchpads: false }
    }
}

pub struct DeviceSupervisor {
    cfg: SupervisorConfig,
    input_tx: Sender<InputEvent>,
    telemetry: TelemetrySender,
    errors: DeviceErrors,
    cmd_rx: Receiver<SupervisorCommand>,

    status_tx: Sender<ReaderExited>,
    status_rx: Receiver<ReaderExited>,

    known_paths: FnvHashMap<PathBuf, DeviceId>,
    readers: FnvHashMap<u32, (ReaderHandle, DeviceInfo)>,
    /// Paths that exhausted their grab attempts; retried only after they
    /// disappear and come back.
    abandoned: FnvHashSet<PathBuf>,
    pending: Vec<PendingGrab>,
    next_id: u32,
    last_scan: Instant,

    midi_conn: Option<MidiInputConnection<()>>,
}

impl DeviceSupervisor {
    pub fn new(
        cfg: SupervisorConfig,
        input_tx: Sender<InputEvent>,
        telemetry: TelemetrySender,
        errors: DeviceErrors,
        cmd_rx: Receiver<SupervisorCommand>,
    ) -> Self {
        let (status_tx, status_rx) = crossbeam_channel::unbounded();
        Self {
            cfg,
            input_tx,
            telemetry,
            errors,
            cmd_rx,
            status_tx,
            status_rx,
            known_paths: FnvHashMap::default(),
            readers: FnvHashMap::default(),
            abandoned: FnvHashSet::default(),
            pending: Vec::new(),
            next_id: 0,
            last_scan: Instant::now(),
            midi_conn: None,
        }
    }

    /// First scan, before the pipeline starts. Distinguishes "nothing there"
    /// from "everything there is unreadable", which gets the actionable
    /// permission message.
    pub fn initial_discovery(&mut self) -> Result<usize, StartupError> {
        let mut candidates = 0usize;
        let mut permission_failures = 0usize;

        for (path, device) in evdev::enumerate() {
            match classify(&device) {
                Some(_) => {
                    candidates += 1;
                    match self.adopt(path.clone(), device) {
                        Ok(()) => {}
                        Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                            permission_failures += 1;
                        }
                        Err(e) => {
                            log::warn!("Could not adopt {}: {}", path.display(), e);
                            self.schedule_retry(path, 0);
                        }
                    }
                }
                None => {}
            }
        }

        if candidates > 0 && permission_failures == candidates {
            return Err(StartupError::InputPermission {
                detail: format!("{} device(s) refused", permission_failures),
            });
        }
        Ok(self.readers.len())
    }

    /// Connects the named MIDI input port (substring match) and bridges its
    /// messages into the input stream.
    pub fn connect_midi(&mut self, wanted: &str) -> Result<String, StartupError> {
        let mut midi_in = MidiInput::new("keysynth").map_err(|e| {
            StartupError::MidiPortNotFound { wanted: format!("{} ({})", wanted, e) }
        })?;
        midi_in.ignore(Ignore::None);

        let port = midi_in
            .ports()
            .into_iter()
            .find(|p| {
                midi_in.port_name(p).map(|name| name.contains(wanted)).unwrap_or(false)
            })
            .ok_or_else(|| StartupError::MidiPortNotFound { wanted: wanted.to_string() })?;

        let name = midi_in.port_name(&port).unwrap_or_else(|_| wanted.to_string());
        let id = self.alloc_id();
        let tx = self.input_tx.clone();

        let conn = midi_in
            .connect(
                &port,
                "keysynth-in",
                move |_stamp, message, _| {
                    if message.len() < 2 {
                        return;
                    }
                    let d2 = if message.len() > 2 { message[2] } else { 0 };
                    let _ = tx.send_timeout(
                        InputEvent::Midi {
                            device: id,
                            status: message[0],
                            d1: message[1],
                            d2,
                            t: time::now(),
                        },
                        Duration::from_millis(5),
                    );
                },
                (),
            )
            .map_err(|e| StartupError::MidiPortNotFound {
                wanted: format!("{} ({})", wanted, e),
            })?;

        self.midi_conn = Some(conn);
        self.telemetry.send(TelemetryEvent::DeviceArrived {
            id,
            name: name.clone(),
            class: DeviceClass::Midi,
        });
        log::info!("MIDI input connected: {}", name);
        Ok(name)
    }

    pub fn has_midi(&self) -> bool {
        self.midi_conn.is_some()
    }

    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.readers.values().map(|(_, info)| info.clone()).collect()
    }

    pub fn run(&mut self, run: Arc<AtomicBool>) {
        while run.load(Ordering::Relaxed) {
            self.reap_exited();
            self.process_commands();
            self.retry_pending();
            if self.last_scan.elapsed() >= RESCAN_INTERVAL {
                self.rescan();
                self.last_scan = Instant::now();
            }
            std::thread::sleep(SUPERVISOR_TICK);
        }
        self.shutdown();
    }

    /// Stop every reader. File descriptors close with the readers; each one
    /// emits its terminal `DeviceGone` on the way out.
    pub fn shutdown(&mut self) {
        for (_, (mut handle, info)) in self.readers.drain() {
            handle.stop();
            log::debug!("Stopped reader for {}", info.name);
        }
        self.known_paths.clear();
        self.midi_conn = None;
    }

    fn reap_exited(&mut self) {
        while let Ok(ReaderExited { id }) = self.status_rx.try_recv() {
            if let Some((mut handle, info)) = self.readers.remove(&id.0) {
                handle.stop();
                self.known_paths.remove(&info.path);
                self.telemetry.send(TelemetryEvent::DeviceRemoved { id });
                log::info!("Device removed: {} ({})", info.name, info.class);
            }
        }
    }

    fn process_commands(&mut self) {
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            match cmd {
                SupervisorCommand::ReopenDevice(id) => {
                    if let Some((mut handle, info)) = self.readers.remove(&id.0) {
                        log::info!("Reopening reader for {}", info.name);
                        handle.stop();
                        self.known_paths.remove(&info.path);
                        self.schedule_retry(info.path, 0);
                    }
                }
            }
        }
    }

    fn retry_pending(&mut self) {
        let now = Instant::now();
        let due: Vec<PendingGrab> = {
            let mut due = Vec::new();
            let mut keep = Vec::new();
            for p in self.pending.drain(..) {
                if p.next_try <= now {
                    due.push(p);
                } else {
                    keep.push(p);
                }
            }
            self.pending = keep;
            due
        };

        for grab in due {
            match Device::open(&grab.path) {
                Ok(device) => match self.adopt(grab.path.clone(), device) {
                    Ok(()) => {}
                    Err(e) => self.retry_or_abandon(grab, e),
                },
                Err(e) => self.retry_or_abandon(grab, e),
            }
        }
    }

    fn retry_or_abandon(&mut self, grab: PendingGrab, error: std::io::Error) {
        let attempts = grab.attempts + 1;
        if attempts >= GRAB_MAX_ATTEMPTS {
            log::warn!(
                "Giving up on {} after {} attempts: {}",
                grab.path.display(),
                attempts,
                error
            );
            self.abandoned.insert(grab.path);
            return;
        }
        self.schedule_retry(grab.path, attempts);
    }

    fn schedule_retry(&mut self, path: PathBuf, attempts: u32) {
        // 100 ms, 200 ms, 400 ms ... capped at 5 s.
        let backoff = GRAB_BACKOFF_BASE
            .saturating_mul(1u32 << attempts.min(8))
            .min(GRAB_BACKOFF_CAP);
        self.pending.push(PendingGrab { path, attempts, next_try: Instant::now() + backoff });
    }

    fn rescan(&mut self) {
        let mut present: FnvHashSet<PathBuf> = FnvHashSet::default();

        for (path, device) in evdev::enumerate() {
            present.insert(path.clone());
            if self.known_paths.contains_key(&path)
                || self.abandoned.contains(&path)
                || self.pending.iter().any(|p| p.path == path)
            {
                continue;
            }
            if classify(&device).is_none() {
                continue;
            }
            if let Err(e) = self.adopt(path.clone(), device) {
                log::debug!("Arrival {} not adopted yet: {}", path.display(), e);
                self.schedule_retry(path, 0);
            }
        }

        // A path that vanished may be retried when the hardware returns.
        self.abandoned.retain(|path| present.contains(path));
        self.pending.retain(|p| present.contains(&p.path));
    }

    /// Classify, optionally grab, and spawn the reader. A re-plugged device
    /// goes through here again and starts from a blank slate.
    fn adopt(&mut self, path: PathBuf, mut device: Device) -> std::io::Result<()> {
        let class = match classify(&device) {
            Some(class) => class,
            None => return Ok(()),
        };

        let wants_grab = match class {
            DeviceClass::Keyboard => self.cfg.grab_keyboards,
            DeviceClass::Touchpad => self.cfg.grab_touchpads,
            DeviceClass::Midi => false,
        };
        if wants_grab {
            device.grab()?;
        }

        let id = self.alloc_id();
        let name = device.name().unwrap_or("unnamed device").to_string();
        let info = DeviceInfo { id, name: name.clone(), class, path: path.clone() };

        let handle = spawn_reader(
            id,
            class,
            device,
            self.input_tx.clone(),
            self.status_tx.clone(),
            self.errors.clone(),
        );

        self.known_paths.insert(path, id);
        self.readers.insert(id.0, (handle, info));
        self.telemetry.send(TelemetryEvent::DeviceArrived { id, name: name.clone(), class });
        log::info!("Device attached: {} ({}, grabbed: {})", name, class, wants_grab);
        Ok(())
    }

    fn alloc_id(&mut self) -> DeviceId {
        let id = DeviceId(self.next_id);
        self.next_id += 1;
        id
    }
}

fn capabilities(device: &Device) -> Caps {
    let mut caps = Caps::empty();

    if let Some(keys) = device.supported_keys() {
        if keys.contains(Key::KEY_A) && keys.contains(Key::KEY_Q) && keys.contains(Key::KEY_Z) {
            caps |= Caps::LETTER_KEYS;
        }
        if keys.contains(Key::KEY_SPACE) {
            caps |= Caps::SPACE_KEY;
        }
        if keys.contains(Key::BTN_TOUCH) {
            caps |= Caps::TOUCH_BUTTON;
        }
    }

    if let Some(axes) = device.supported_absolute_axes() {
        if axes.contains(AbsoluteAxisType::ABS_X) && axes.contains(AbsoluteAxisType::ABS_Y) {
            caps |= Caps::ABS_POINTER;
        }
    }

    caps
}

/// Capability-based classification; device names are never consulted.
pub fn classify(device: &Device) -> Option<DeviceClass> {
    let caps = capabilities(device);
    if caps.contains(Caps::LETTER_KEYS | Caps::SPACE_KEY) {
        Some(DeviceClass::Keyboard)
    } else if caps.contains(Caps::ABS_POINTER | Caps::TOUCH_BUTTON) {
        Some(DeviceClass::Touchpad)
    } else {
        None
    }
}
