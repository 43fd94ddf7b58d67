//! Polyphonic voice allocation and note-lifecycle bookkeeping.
//!
//! The allocator is the only owner of voices and held notes. Every operation
//! returns the renderer-bound events it decided on (in order), which the
//! fan-in task pushes onto the realtime bus. The voice table is allocated
//! once at startup and reused; nothing here allocates per note.

use fnv::FnvHashMap;
use smallvec::SmallVec;

use crate::event::{DeviceId, EventOrigin, NoteEvent, RawKey};
use crate::time::MonotonicNanos;

pub const DEFAULT_MAX_POLYPHONY: usize = 64;

/// Stable only for the lifetime of one voice; the generation guards against
/// a recycled slot masquerading as its previous occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VoiceId {
    slot: u16,
    generation: u32,
}

#[derive(Debug, Clone)]
pub struct Voice {
    pub id: VoiceId,
    pub pitch: u8,
    pub velocity: u8,
    pub channel: u8,
    pub start_time: MonotonicNanos,
    /// Set when the note-off was forwarded; the voice keeps its slot for the
    /// renderer's release tail until it is stolen.
    pub released_at: Option<MonotonicNanos>,
}

#[derive(Debug, Clone)]
pub struct HeldNote {
    pub pitch: u8,
    pub velocity_at_strike: u8,
    pub strike_time: MonotonicNanos,
    pub origin: EventOrigin,
    /// Key released while the sustain pedal was down; the voice keeps
    /// sounding until the pedal lifts.
    pub sustained: bool,
    /// The physical key behind this note, when there is one. MIDI-in, arp
    /// and layer-copy notes have none.
    pub raw: Option<RawKey>,
    pub channel: u8,
    voice: VoiceId,
}

pub type EventBatch = SmallVec<[NoteEvent; 4]>;

pub struct VoiceAllocator {
    slots: Vec<Option<Voice>>,
    active: usize,
    next_generation: u32,
    /// One held note per (channel, pitch). A layer copy is an independent
    /// note on its own channel.
    held: FnvHashMap<(u8, u8), HeldNote>,
    /// Raw-key index so a key-up finds its note without a scan, and keeps
    /// finding it after the octave shifts under the player's fingers.
    held_by_raw: FnvHashMap<RawKey, (u8, u8)>,
    sustain: bool,
}

impl VoiceAllocator {
    pub fn new(max_polyphony: usize) -> Self {
        let max_polyphony = max_polyphony.max(1);
        let mut slots = Vec::with_capacity(max_polyphony);
        slots.resize_with(max_polyphony, || None);

        Self {
            slots,
            active: 0,
            next_generation: 0,
            held: FnvHashMap::with_capacity_and_hasher(max_polyphony * 2, Default::default()),
            held_by_raw: FnvHashMap::with_capacity_and_hasher(
                max_polyphony * 2,
                Default::default(),
            ),
            sustain: false,
        }
    }

    pub fn max_polyphony(&self) -> usize {
        self.slots.len()
    }

    pub fn voice_count(&self) -> usize {
        self.active
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    pub fn sustain_active(&self) -> bool {
        self.sustain
    }

    pub fn held_note(&self, channel: u8, pitch: u8) -> Option<&HeldNote> {
        self.held.get(&(channel, pitch))
    }

    pub fn held_notes(&self) -> impl Iterator<Item = &HeldNote> {
        self.held.values()
    }

    /// The note a physical key is currently holding, if any.
    pub fn raw_lookup(&self, raw: RawKey) -> Option<(u8, u8)> {
        self.held_by_raw.get(&raw).copied()
    }

    /// Strike a note. A second down on an already-held pitch re-triggers:
    /// the old voice is stolen and a fresh one allocated.
    pub fn note_on(
        &mut self,
        pitch: u8,
        velocity: u8,
        channel: u8,
        origin: EventOrigin,
        raw: Option<RawKey>,
        now: MonotonicNanos,
    ) -> EventBatch {
        let mut out = EventBatch::new();

        if let Some(held) = self.held.remove(&(channel, pitch)) {
            if let Some(old_raw) = held.raw {
                self.held_by_raw.remove(&old_raw);
            }
            self.free_slot(held.voice);
            out.push(NoteEvent::Off { pitch, channel, origin: held.origin });
        }

        if self.active == self.slots.len() {
            if let Some(victim) = self.pick_victim() {
                out.push(self.evict(victim));
            }
        }

        let id = self.claim_slot(pitch, velocity, channel, now);
        self.held.insert(
            (channel, pitch),
            HeldNote {
                pitch,
                velocity_at_strike: velocity,
                strike_time: now,
                origin,
                sustained: false,
                raw,
                channel,
                voice: id,
            },
        );
        if let Some(raw) = raw {
            self.held_by_raw.insert(raw, (channel, pitch));
        }

        out.push(NoteEvent::On { pitch, velocity, channel, origin });
        out
    }

    /// Release a note. With the sustain pedal down the release is deferred;
    /// unknown pitches are dropped silently, so a stale key-up after
    /// stealing or device loss is harmless.
    pub fn note_off(&mut self, pitch: u8, channel: u8, now: MonotonicNanos) -> EventBatch {
        if self.sustain {
            if let Some(held) = self.held.get_mut(&(channel, pitch)) {
                held.sustained = true;
            }
            return EventBatch::new();
        }
        self.force_off(pitch, channel, now)
    }

    /// Release a note regardless of the sustain pedal. Used for device loss
    /// and mode toggles, where no later key-up will ever arrive.
    pub fn force_off(&mut self, pitch: u8, channel: u8, now: MonotonicNanos) -> EventBatch {
        let mut out = EventBatch::new();
        if let Some(held) = self.held.remove(&(channel, pitch)) {
            if let Some(raw) = held.raw {
                self.held_by_raw.remove(&raw);
            }
            self.release_voice(held.voice, now);
            out.push(NoteEvent::Off { pitch, channel, origin: held.origin });
        }
        out
    }

    /// Sustain pedal transition. Releasing the pedal lets go of every note
    /// whose key already came up; pressing it again is idempotent.
    pub fn set_sustain(&mut self, on: bool, now: MonotonicNanos) -> EventBatch {
        let mut out = EventBatch::new();
        if self.sustain == on {
            return out;
        }
        self.sustain = on;

        if !on {
            let deferred: SmallVec<[(u8, u8); 16]> = self
                .held
                .iter()
                .filter(|(_, h)| h.sustained)
                .map(|(&key, _)| key)
                .collect();
            for (channel, pitch) in deferred {
                out.extend(self.force_off(pitch, channel, now));
            }
        }
        out
    }

    /// Release everything, forwarding a note-off per live voice and a final
    /// panic marker for the renderer's own state.
    pub fn panic(&mut self) -> EventBatch {
        let mut out = EventBatch::new();
        for slot in self.slots.iter_mut() {
            if let Some(voice) = slot.take() {
                if voice.released_at.is_none() {
                    let origin = self
                        .held
                        .get(&(voice.channel, voice.pitch))
                        .map(|h| h.origin)
                        .unwrap_or(EventOrigin::Keyboard);
                    out.push(NoteEvent::Off {
                        pitch: voice.pitch,
                        channel: voice.channel,
                        origin,
                    });
                }
            }
        }
        self.active = 0;
        self.held.clear();
        self.held_by_raw.clear();
        out.push(NoteEvent::Panic);
        out
    }

    /// Force-release every note struck from `device`. Sustain does not
    /// defer these, because the keys that would eventually release them no
    /// longer exist.
    pub fn release_device(&mut self, device: DeviceId, now: MonotonicNanos) -> EventBatch {
        let keys: SmallVec<[(u8, u8); 16]> = self
            .held
            .values()
            .filter(|h| h.raw.map(|r| r.device) == Some(device))
            .map(|h| (h.channel, h.pitch))
            .collect();

        let mut out = EventBatch::new();
        for (channel, pitch) in keys {
            out.extend(self.force_off(pitch, channel, now));
        }
        out
    }

    /// Force-release every note of one origin. Used when the layer is
    /// toggled off.
    pub fn release_origin(&mut self, origin: EventOrigin, now: MonotonicNanos) -> EventBatch {
        let keys: SmallVec<[(u8, u8); 16]> = self
            .held
            .values()
            .filter(|h| h.origin == origin)
            .map(|h| (h.channel, h.pitch))
            .collect();

        let mut out = EventBatch::new();
        for (channel, pitch) in keys {
            out.extend(self.force_off(pitch, channel, now));
        }
        out
    }

    fn claim_slot(
        &mut self,
        pitch: u8,
        velocity: u8,
        channel: u8,
        now: MonotonicNanos,
    ) -> VoiceId {
        let slot = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .expect("voice table full after eviction");
        self.next_generation = self.next_generation.wrapping_add(1);
        let id = VoiceId { slot: slot as u16, generation: self.next_generation };
        self.slots[slot] = Some(Voice {
            id,
            pitch,
            velocity,
            channel,
            start_time: now,
            released_at: None,
        });
        self.active += 1;
        id
    }

    fn free_slot(&mut self, id: VoiceId) {
        if let Some(slot) = self.slots.get_mut(usize::from(id.slot)) {
            if slot.as_ref().map(|v| v.id) == Some(id) {
                *slot = None;
                self.active -= 1;
            }
        }
    }

    fn release_voice(&mut self, id: VoiceId, now: MonotonicNanos) {
        if let Some(voice) = self.slots.get_mut(usize::from(id.slot)).and_then(|s| s.as_mut()) {
            if voice.id == id && voice.released_at.is_none() {
                voice.released_at = Some(now);
            }
        }
    }

    /// Stealing order: released tails first, then pedal-sustained notes,
    /// then whatever has been sounding longest.
    fn pick_victim(&self) -> Option<VoiceId> {
        self.slots
            .iter()
            .flatten()
            .min_by_key(|voice| {
                let rank = if voice.released_at.is_some() {
                    0u8
                } else if self
                    .held
                    .get(&(voice.channel, voice.pitch))
                    .map(|h| h.sustained)
                    .unwrap_or(false)
                {
                    1
                } else {
                    2
                };
                (rank, voice.released_at.unwrap_or(MonotonicNanos(u64::MAX)), voice.start_time)
            })
            .map(|voice| voice.id)
    }

    /// Exactly one renderer-level off per stolen voice; its held note (if
    /// any) goes with it so a later key-up is a no-op.
    fn evict(&mut self, id: VoiceId) -> NoteEvent {
        let voice = self.slots[usize::from(id.slot)]
            .take()
            .expect("victim voice vanished before eviction");
        self.active -= 1;

        let origin = match self.held.remove(&(voice.channel, voice.pitch)) {
            Some(held) => {
                if let Some(raw) = held.raw {
                    self.held_by_raw.remove(&raw);
                }
                held.origin
            }
            None => EventOrigin::Keyboard,
        };

        NoteEvent::Off { pitch: voice.pitch, channel: voice.channel, origin }
    }
}
