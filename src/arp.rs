//! The arpeggiator transform.
//!
//! Owned by the fan-in task: key events feed the held set, and clock ticks
//! (produced sample-accurately by the audio thread) pull synthesized steps
//! out. Synthesized events carry their own pitches and never re-enter the
//! arpeggiator.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::time::SampleRate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArpMode {
    Off,
    Up,
    Down,
    UpDown,
    Random,
}

impl ArpMode {
    /// The cycle order the arp toggle key walks through.
    pub fn next(self) -> ArpMode {
        match self {
            ArpMode::Off => ArpMode::Up,
            ArpMode::Up => ArpMode::Down,
            ArpMode::Down => ArpMode::UpDown,
            ArpMode::UpDown => ArpMode::Random,
            ArpMode::Random => ArpMode::Off,
        }
    }
}

impl std::fmt::Display for ArpMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArpMode::Off => write!(f, "off"),
            ArpMode::Up => write!(f, "up"),
            ArpMode::Down => write!(f, "down"),
            ArpMode::UpDown => write!(f, "up-down"),
            ArpMode::Random => write!(f, "random"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subdivision {
    Quarter,
    Eighth,
    Sixteenth,
    ThirtySecond,
}

impl Subdivision {
    fn per_beat(self) -> f64 {
        match self {
            Subdivision::Quarter => 1.0,
            Subdivision::Eighth => 2.0,
            Subdivision::Sixteenth => 4.0,
            Subdivision::ThirtySecond => 8.0,
        }
    }
}

/// Arp step period in frames. The audio thread counts rendered frames
/// against this, so tempo holds steady regardless of UI or input load.
pub fn tick_period_frames(sample_rate: SampleRate, bpm: f64, subdivision: Subdivision) -> u64 {
    let seconds = 60.0 / bpm.max(1.0) / subdivision.per_beat();
    (seconds * sample_rate.as_f64()).round().max(1.0) as u64
}

/// What one clock tick (or a held-set change) decided to play.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpEvent {
    On { pitch: u8, velocity: u8 },
    Off { pitch: u8 },
}

pub type ArpBatch = SmallVec<[ArpEvent; 2]>;

pub struct Arpeggiator {
    mode: ArpMode,
    /// Held pitches with their strike velocities, sorted by pitch.
    held: Vec<(u8, u8)>,
    sounding: Option<u8>,
    ascending: bool,
    rng: u64,
}

impl Arpeggiator {
    pub fn new(seed: u64) -> Self {
        Self {
            mode: ArpMode::Off,
            held: Vec::with_capacity(16),
            sounding: None,
            ascending: true,
            rng: seed | 1,
        }
    }

    pub fn mode(&self) -> ArpMode {
        self.mode
    }

    pub fn is_active(&self) -> bool {
        self.mode != ArpMode::Off
    }

    pub fn held_len(&self) -> usize {
        self.held.len()
    }

    /// Switch mode. Turning the arp off releases whatever it is sounding.
    pub fn set_mode(&mut self, mode: ArpMode) -> ArpBatch {
        let mut out = ArpBatch::new();
        if mode == self.mode {
            return out;
        }
        self.mode = mode;
        self.ascending = true;
        if mode == ArpMode::Off {
            if let Some(pitch) = self.sounding.take() {
                out.push(ArpEvent::Off { pitch });
            }
            self.held.clear();
        }
        out
    }

    pub fn cycle_mode(&mut self) -> ArpBatch {
        self.set_mode(self.mode.next())
    }

    /// Drop all note state without emitting anything. Used after a panic,
    /// which already silenced whatever the arp was sounding.
    pub fn clear(&mut self) {
        self.held.clear();
        self.sounding = None;
        self.ascending = true;
    }

    pub fn note_down(&mut self, pitch: u8, velocity: u8) {
        match self.held.binary_search_by_key(&pitch, |&(p, _)| p) {
            Ok(i) => self.held[i].1 = velocity,
            Err(i) => self.held.insert(i, (pitch, velocity)),
        }
    }

    /// Remove a pitch from the held set. When the set empties, the note the
    /// arp is holding is released immediately rather than on the next tick.
    pub fn note_up(&mut self, pitch: u8) -> ArpBatch {
        let mut out = ArpBatch::new();
        if let Ok(i) = self.held.binary_search_by_key(&pitch, |&(p, _)| p) {
            self.held.remove(i);
        }
        if self.held.is_empty() {
            if let Some(p) = self.sounding.take() {
                out.push(ArpEvent::Off { pitch: p });
            }
        }
        out
    }

    /// Advance one clock tick: off for the previous step, on for the next
    /// pitch under the current mode's ordering.
    pub fn tick(&mut self) -> ArpBatch {
        let mut out = ArpBatch::new();
        if self.mode == ArpMode::Off || self.held.is_empty() {
            return out;
        }

        let next = match self.mode {
            ArpMode::Up => self.next_up(),
            ArpMode::Down => self.next_down(),
            ArpMode::UpDown => self.next_up_down(),
            ArpMode::Random => self.next_random(),
            ArpMode::Off => unreachable!(),
        };

        if let Some(prev) = self.sounding.take() {
            out.push(ArpEvent::Off { pitch: prev });
        }
        let (pitch, velocity) = next;
        self.sounding = Some(pitch);
        out.push(ArpEvent::On { pitch, velocity });
        out
    }

    fn lowest(&self) -> (u8, u8) {
        self.held[0]
    }

    fn highest(&self) -> (u8, u8) {
        self.held[self.held.len() - 1]
    }

    fn next_up(&self) -> (u8, u8) {
        match self.sounding {
            Some(last) => self
                .held
                .iter()
                .copied()
                .find(|&(p, _)| p > last)
                .unwrap_or_else(|| self.lowest()),
            None => self.lowest(),
        }
    }

    fn next_down(&self) -> (u8, u8) {
        match self.sounding {
            Some(last) => self
                .held
                .iter()
                .rev()
                .copied()
                .find(|&(p, _)| p < last)
                .unwrap_or_else(|| self.highest()),
            None => self.highest(),
        }
    }

    /// Ascending then descending without repeating the endpoints.
    fn next_up_down(&mut self) -> (u8, u8) {
        let last = match self.sounding {
            Some(last) => last,
            None => {
                self.ascending = true;
                return self.lowest();
            }
        };

        if self.held.len() == 1 {
            return self.lowest();
        }

        if self.ascending {
            match self.held.iter().copied().find(|&(p, _)| p > last) {
                Some(step) => step,
                None => {
                    self.ascending = false;
                    self.held
                        .iter()
                        .rev()
                        .copied()
                        .find(|&(p, _)| p < last)
                        .unwrap_or_else(|| self.lowest())
                }
            }
        } else {
            match self.held.iter().rev().copied().find(|&(p, _)| p < last) {
                Some(step) => step,
                None => {
                    self.ascending = true;
                    self.held
                        .iter()
                        .copied()
                        .find(|&(p, _)| p > last)
                        .unwrap_or_else(|| self.highest())
                }
            }
        }
    }

    fn next_random(&mut self) -> (u8, u8) {
        let len = self.held.len();
        let mut index = (self.next_rand() % len as u64) as usize;
        // Uniform over the set, but never the same pitch twice in a row
        // when there is a choice.
        if len > 1 && Some(self.held[index].0) == self.sounding {
            index = (index + 1) % len;
        }
        self.held[index]
    }

    fn next_rand(&mut self) -> u64 {
        // xorshift64
        let mut x = self.rng;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng = x;
        x
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pitches(arp: &mut Arpeggiator, ticks: usize) -> Vec<u8> {
        (0..ticks)
            .filter_map(|_| {
                arp.tick().into_iter().find_map(|e| match e {
                    ArpEvent::On { pitch, .. } => Some(pitch),
                    ArpEvent::Off { .. } => None,
                })
            })
            .collect()
    }

    fn triad() -> Arpeggiator {
        let mut arp = Arpeggiator::new(7);
        arp.set_mode(ArpMode::Up);
        arp.note_down(48, 90);
        arp.note_down(52, 90);
        arp.note_down(55, 90);
        arp
    }

    #[test]
    fn up_cycles_ascending_with_wrap() {
        let mut arp = triad();
        assert_eq!(pitches(&mut arp, 8), vec![48, 52, 55, 48, 52, 55, 48, 52]);
    }

    #[test]
    fn each_step_releases_the_previous_note() {
        let mut arp = triad();
        arp.tick();
        let second = arp.tick();
        assert_eq!(second[0], ArpEvent::Off { pitch: 48 });
        assert_eq!(second[1], ArpEvent::On { pitch: 52, velocity: 90 });
    }

    #[test]
    fn down_cycles_descending_with_wrap() {
        let mut arp = triad();
        arp.set_mode(ArpMode::Down);
        // Mode switch kept the held set; restart from the top.
        assert_eq!(pitches(&mut arp, 5), vec![55, 52, 48, 55, 52]);
    }

    #[test]
    fn up_down_does_not_repeat_endpoints() {
        let mut arp = triad();
        arp.set_mode(ArpMode::UpDown);
        assert_eq!(pitches(&mut arp, 9), vec![48, 52, 55, 52, 48, 52, 55, 52, 48]);
    }

    #[test]
    fn random_never_repeats_immediately_with_multiple_held() {
        let mut arp = triad();
        arp.set_mode(ArpMode::Random);
        let seq = pitches(&mut arp, 64);
        for pair in seq.windows(2) {
            assert_ne!(pair[0], pair[1]);
        }
    }

    #[test]
    fn emptying_the_held_set_releases_the_sounding_note() {
        let mut arp = triad();
        arp.tick();
        arp.note_up(52);
        arp.note_up(55);
        let batch = arp.note_up(48);
        assert_eq!(batch.as_slice(), &[ArpEvent::Off { pitch: 48 }]);
        assert!(arp.tick().is_empty());
    }

    #[test]
    fn turning_off_releases_and_clears() {
        let mut arp = triad();
        arp.tick();
        let batch = arp.set_mode(ArpMode::Off);
        assert_eq!(batch.as_slice(), &[ArpEvent::Off { pitch: 48 }]);
        assert_eq!(arp.held_len(), 0);
    }

    #[test]
    fn sixteenths_at_120_bpm_are_an_eighth_of_a_second() {
        let frames = tick_period_frames(SampleRate(48_000), 120.0, Subdivision::Sixteenth);
        assert_eq!(frames, 6_000);
    }

    #[test]
    fn single_held_note_repeats_in_every_mode() {
        for mode in [ArpMode::Up, ArpMode::Down, ArpMode::UpDown, ArpMode::Random] {
            let mut arp = Arpeggiator::new(3);
            arp.set_mode(mode);
            arp.note_down(60, 80);
            assert_eq!(pitches(&mut arp, 3), vec![60, 60, 60], "{mode:?}");
        }
    }
}
