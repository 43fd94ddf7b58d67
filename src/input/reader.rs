//! One reader per device file.
//!
//! A reader thread parks on `poll(2)` with a 5 ms timeout, drains the
//! kernel's event queue into a pre-sized batch, normalizes each event and
//! hands it to the fan-in channel. Timestamps come from the kernel event,
//! rebased onto the process monotonic timeline. Any read error other than
//! EAGAIN is terminal: the reader emits `DeviceGone` and exits.

use std::os::fd::BorrowedFd;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::Sender;
use evdev::{AbsoluteAxisType, Device, InputEventKind, Key};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use smallvec::SmallVec;

use crate::event::{DeviceClass, DeviceId, InputAxis, InputEvent, RawKey, TouchState};
use crate::health::DeviceErrors;
use crate::time::WallRebase;

const READ_POLL_MS: u8 = 5;

/// If the fan-in task stalls longer than this, events are shed rather than
/// wedging the reader against a dead consumer.
const SEND_TIMEOUT: Duration = Duration::from_millis(5);

const BATCH_CAPACITY: usize = 64;

/// Sent to the supervisor when a reader thread exits, for any reason.
#[derive(Debug, Clone, Copy)]
pub struct ReaderExited {
    pub id: DeviceId,
}

pub struct ReaderHandle {
    pub id: DeviceId,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ReaderHandle {
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::error!("Reader thread for device {:?} panicked", self.id);
            }
        }
    }
}

impl Drop for ReaderHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Debug, Clone, Copy)]
struct AxisRange {
    min: i32,
    max: i32,
}

impl AxisRange {
    fn normalize(&self, value: i32) -> f32 {
        let span = self.max - self.min;
        if span <= 0 {
            return 0.0;
        }
        ((value - self.min) as f32 / span as f32).clamp(0.0, 1.0)
    }
}

/// Spawns the reader thread for an already-opened (and possibly grabbed)
/// device.
pub fn spawn_reader(
    id: DeviceId,
    class: DeviceClass,
    device: Device,
    tx: Sender<InputEvent>,
    status_tx: Sender<ReaderExited>,
    errors: DeviceErrors,
) -> ReaderHandle {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_clone = Arc::clone(&stop);

    let task = ReaderTask::new(id, class, device, tx, status_tx, errors);
    let join = std::thread::Builder::new()
        .name(format!("keysynth-reader-{}", id.0))
        .spawn(move || task.run(stop_clone))
        .expect("failed to spawn reader thread");

    ReaderHandle { id, stop, join: Some(join) }
}

struct ReaderTask {
    id: DeviceId,
    class: DeviceClass,
    device: Device,
    tx: Sender<InputEvent>,
    status_tx: Sender<ReaderExited>,
    errors: DeviceErrors,
    rebase: WallRebase,
    x_range: AxisRange,
    y_range: AxisRange,
    pressure_range: AxisRange,
    batch: SmallVec<[InputEvent; BATCH_CAPACITY]>,
}

impl ReaderTask {
    fn new(
        id: DeviceId,
        class: DeviceClass,
        device: Device,
        tx: Sender<InputEvent>,
        status_tx: Sender<ReaderExited>,
        errors: DeviceErrors,
    ) -> Self {
        let (x_range, y_range, pressure_range) = axis_ranges(&device);
        Self {
            id,
            class,
            device,
            tx,
            status_tx,
            errors,
            rebase: WallRebase::new(),
            x_range,
            y_range,
            pressure_range,
            batch: SmallVec::new(),
        }
    }

    fn run(mut self, stop: Arc<AtomicBool>) {
        while !stop.load(Ordering::Relaxed) {
            match self.poll_readable() {
                Ok(false) => continue,
                Ok(true) => {}
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    log::warn!("Device {:?}: poll failed: {}", self.id, e);
                    break;
                }
            }

            match self.drain_kernel_queue() {
                Ok(()) => self.flush_batch(),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    // Spurious wakeup; worth counting if it keeps happening.
                    self.errors.bump(self.id);
                }
                Err(e) => {
                    // EIO / ENODEV on unplug lands here.
                    log::info!("Device {:?} read ended: {}", self.id, e);
                    break;
                }
            }
        }

        // Terminal in every exit path, so held notes never outlive their
        // keyboard.
        let _ = self.tx.send(InputEvent::DeviceGone { id: self.id });
        let _ = self.status_tx.send(ReaderExited { id: self.id });
    }

    /// Bounded wait for input. Never blocks longer than [`READ_POLL_MS`].
    fn poll_readable(&self) -> Result<bool, nix::errno::Errno> {
        let fd = unsafe { BorrowedFd::borrow_raw(self.device.as_raw_fd()) };
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        let n = poll(&mut fds, PollTimeout::from(READ_POLL_MS))?;
        Ok(n > 0)
    }

    fn drain_kernel_queue(&mut self) -> std::io::Result<()> {
        let id = self.id;
        let class = self.class;
        let ranges = (self.x_range, self.y_range, self.pressure_range);
        let rebase = &self.rebase;
        let batch = &mut self.batch;
        let tx = &self.tx;
        let errors = &self.errors;

        for ev in self.device.fetch_events()? {
            let t = rebase.rebase(ev.timestamp());
            if let Some(out) = normalize_event(id, class, ranges, ev.kind(), ev.value(), t) {
                if batch.len() == BATCH_CAPACITY {
                    send_batch(batch, tx, errors, id);
                }
                batch.push(out);
            }
        }
        Ok(())
    }

    fn flush_batch(&mut self) {
        send_batch(&mut self.batch, &self.tx, &self.errors, self.id);
    }
}

fn normalize_event(
    id: DeviceId,
    class: DeviceClass,
    (x_range, y_range, pressure_range): (AxisRange, AxisRange, AxisRange),
    kind: InputEventKind,
    value: i32,
    t: crate::time::MonotonicNanos,
) -> Option<InputEvent> {
    match kind {
        InputEventKind::Key(key) => {
            if class == DeviceClass::Touchpad {
                if key == Key::BTN_TOUCH {
                    let state = if value != 0 { TouchState::On } else { TouchState::Off };
                    return Some(InputEvent::Touch { device: id, state, t });
                }
                return None;
            }
            let raw = RawKey { device: id, code: key.code() };
            match value {
                1 => Some(InputEvent::KeyDown { raw, t }),
                0 => Some(InputEvent::KeyUp { raw, t }),
                // Kernel autorepeat; note retriggering is the allocator's call.
                _ => None,
            }
        }
        InputEventKind::AbsAxis(axis) => {
            if class != DeviceClass::Touchpad {
                return None;
            }
            let (axis, range) = match axis {
                AbsoluteAxisType::ABS_X => (InputAxis::X, x_range),
                AbsoluteAxisType::ABS_Y => (InputAxis::Y, y_range),
                AbsoluteAxisType::ABS_PRESSURE | AbsoluteAxisType::ABS_MT_PRESSURE => {
                    (InputAxis::Pressure, pressure_range)
                }
                _ => return None,
            };
            Some(InputEvent::Axis { device: id, axis, normalized: range.normalize(value), t })
        }
        _ => None,
    }
}

fn send_batch(
    batch: &mut SmallVec<[InputEvent; BATCH_CAPACITY]>,
    tx: &Sender<InputEvent>,
    errors: &DeviceErrors,
    id: DeviceId,
) {
    for ev in batch.drain(..) {
        if tx.send_timeout(ev, SEND_TIMEOUT).is_err() {
            errors.bump(id);
        }
    }
}

/// Axis limits from the kernel's advertised ranges, with conservative
/// fallbacks when the ioctl fails or the device never declared them.
fn axis_ranges(device: &Device) -> (AxisRange, AxisRange, AxisRange) {
    let fallback_xy = AxisRange { min: 0, max: 1024 };
    let fallback_pressure = AxisRange { min: 0, max: 255 };

    match device.get_abs_state() {
        Ok(abs) => {
            let range = |axis: AbsoluteAxisType, fallback: AxisRange| {
                let info = abs[axis.0 as usize];
                if info.maximum > info.minimum {
                    AxisRange { min: info.minimum, max: info.maximum }
                } else {
                    fallback
                }
            };
            let pressure = {
                let direct = range(AbsoluteAxisType::ABS_PRESSURE, fallback_pressure);
                if direct.max > direct.min && direct.max != fallback_pressure.max {
                    direct
                } else {
                    range(AbsoluteAxisType::ABS_MT_PRESSURE, direct)
                }
            };
            (
                range(AbsoluteAxisType::ABS_X, fallback_xy),
                range(AbsoluteAxisType::ABS_Y, fallback_xy),
                pressure,
            )
        }
        Err(_) => (fallback_xy, fallback_xy, fallback_pressure),
    }
}
