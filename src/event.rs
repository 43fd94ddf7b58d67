use crate::time::MonotonicNanos;

/// Handle for one physical input device, assigned by the supervisor. A device
/// that is unplugged and re-plugged receives a fresh id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(pub u32);

/// A device-qualified scan-code. Key-state bookkeeping is keyed on this so a
/// key-up (or a device removal) always finds the note its key-down created,
/// even with two keyboards mapped to the same codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawKey {
    pub device: DeviceId,
    pub code: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Keyboard,
    Touchpad,
    Midi,
}

impl std::fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceClass::Keyboard => write!(f, "keyboard"),
            DeviceClass::Touchpad => write!(f, "touchpad"),
            DeviceClass::Midi => write!(f, "midi"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputAxis {
    X,
    Y,
    Pressure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchState {
    On,
    Off,
}

/// A normalized event from one device reader, stamped on the monotonic
/// timeline as close to the kernel as possible.
#[derive(Debug, Clone, Copy)]
pub enum InputEvent {
    KeyDown { raw: RawKey, t: MonotonicNanos },
    KeyUp { raw: RawKey, t: MonotonicNanos },
    Axis { device: DeviceId, axis: InputAxis, normalized: f32, t: MonotonicNanos },
    Touch { device: DeviceId, state: TouchState, t: MonotonicNanos },
    Midi { device: DeviceId, status: u8, d1: u8, d2: u8, t: MonotonicNanos },
    /// Terminal event: the reader hit an unrecoverable error or the device
    /// node vanished. Always the last event a reader emits.
    DeviceGone { id: DeviceId },
}

/// The logical source of a note event. Never interpreted by the renderer;
/// retained for telemetry and for double-trigger suppression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOrigin {
    Keyboard,
    MidiIn,
    Arp,
    Layer,
}

/// Payload of the realtime bus. `Copy` and exactly one machine word when
/// packed, so the bus never touches the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoteEvent {
    On { pitch: u8, velocity: u8, channel: u8, origin: EventOrigin },
    Off { pitch: u8, channel: u8, origin: EventOrigin },
    Cc { channel: u8, controller: u8, value: u8 },
    Bend { channel: u8, value: i16 },
    Program { channel: u8, program: u8 },
    Panic,
}

const TAG_ON: u8 = 1;
const TAG_OFF: u8 = 2;
const TAG_CC: u8 = 3;
const TAG_BEND: u8 = 4;
const TAG_PROGRAM: u8 = 5;
const TAG_PANIC: u8 = 6;

fn origin_to_bits(origin: EventOrigin) -> u8 {
    match origin {
        EventOrigin::Keyboard => 0,
        EventOrigin::MidiIn => 1,
        EventOrigin::Arp => 2,
        EventOrigin::Layer => 3,
    }
}

fn origin_from_bits(bits: u8) -> EventOrigin {
    match bits & 0x3 {
        0 => EventOrigin::Keyboard,
        1 => EventOrigin::MidiIn,
        2 => EventOrigin::Arp,
        _ => EventOrigin::Layer,
    }
}

impl NoteEvent {
    /// Packs the event into one `u64` for transit through the realtime ring.
    ///
    /// Layout (LSB first): tag, channel, data1, data2, 16-bit bend, origin.
    /// An all-zero word is never produced (tags start at 1), so a zeroed slot
    /// can never be mistaken for a real event.
    pub fn pack(&self) -> u64 {
        let (tag, ch, d1, d2, bend, origin) = match *self {
            NoteEvent::On { pitch, velocity, channel, origin } => {
                (TAG_ON, channel, pitch, velocity, 0i16, origin_to_bits(origin))
            }
            NoteEvent::Off { pitch, channel, origin } => {
                (TAG_OFF, channel, pitch, 0, 0, origin_to_bits(origin))
            }
            NoteEvent::Cc { channel, controller, value } => {
                (TAG_CC, channel, controller, value, 0, 0)
            }
            NoteEvent::Bend { channel, value } => (TAG_BEND, channel, 0, 0, value, 0),
            NoteEvent::Program { channel, program } => (TAG_PROGRAM, channel, program, 0, 0, 0),
            NoteEvent::Panic => (TAG_PANIC, 0, 0, 0, 0, 0),
        };

        u64::from(tag)
            | u64::from(ch) << 8
            | u64::from(d1) << 16
            | u64::from(d2) << 24
            | u64::from(bend as u16) << 32
            | u64::from(origin) << 48
    }

    /// Inverse of [`NoteEvent::pack`]. Returns `None` for a word that does not
    /// carry a known tag (e.g. a zeroed slot).
    pub fn unpack(word: u64) -> Option<NoteEvent> {
        let tag = (word & 0xff) as u8;
        let ch = (word >> 8 & 0xff) as u8;
        let d1 = (word >> 16 & 0xff) as u8;
        let d2 = (word >> 24 & 0xff) as u8;
        let bend = (word >> 32 & 0xffff) as u16 as i16;
        let origin = origin_from_bits((word >> 48 & 0xff) as u8);

        match tag {
            TAG_ON => Some(NoteEvent::On { pitch: d1, velocity: d2, channel: ch, origin }),
            TAG_OFF => Some(NoteEvent::Off { pitch: d1, channel: ch, origin }),
            TAG_CC => Some(NoteEvent::Cc { channel: ch, controller: d1, value: d2 }),
            TAG_BEND => Some(NoteEvent::Bend { channel: ch, value: bend }),
            TAG_PROGRAM => Some(NoteEvent::Program { channel: ch, program: d1 }),
            TAG_PANIC => Some(NoteEvent::Panic),
            _ => None,
        }
    }

    #[inline]
    pub fn is_panic(&self) -> bool {
        matches!(self, NoteEvent::Panic)
    }
}

/// Lossy UI/diagnostics feed. Everything here is informational; dropping a
/// telemetry event never affects the pipeline.
#[derive(Debug, Clone)]
pub enum TelemetryEvent {
    Note(NoteEvent),
    DeviceArrived { id: DeviceId, name: String, class: DeviceClass },
    DeviceRemoved { id: DeviceId },
    BusDropTotal(u64),
    RenderLatency { avg_ns: u64, p95_ns: u64 },
    VoiceCount(usize),
    XrunCount(u64),
    SilentMode,
}
