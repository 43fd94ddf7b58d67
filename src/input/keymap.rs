//! Scan-code to pitch-offset mapping.
//!
//! The mapper itself is a pure function of `(code, octave, transpose)`. The
//! table behind it is loaded from the config file at startup; the compiled-in
//! default lays three overlapping octaves across the QWERTY rows with the
//! treble sharps on the number row.

use evdev::Key;
use fnv::FnvHashMap;

/// Which physical row a note key sits on. Feeds the position velocity source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRow {
    Bottom,
    Home,
    Top,
}

/// Non-note roles a key can carry. Handled by the fan-in task's control
/// dispatch, never mapped to a pitch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRole {
    Sustain,
    Panic,
    OctaveUp,
    OctaveDown,
    TransposeUp,
    TransposeDown,
    ProgramUp,
    ProgramDown,
    ArpCycle,
    LayerToggle,
    /// Held Shift: position velocity +20.
    AccentModifier,
    /// Held Ctrl: position velocity -20.
    SoftModifier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappedKey {
    Note { offset: i8, row: KeyRow },
    Control(ControlRole),
}

/// Pitch offsets are bounded so every octave setting keeps the table inside
/// sensible MIDI territory.
pub const MIN_OFFSET: i8 = -24;
pub const MAX_OFFSET: i8 = 24;

#[derive(Debug)]
pub struct KeyMap {
    table: FnvHashMap<u16, MappedKey>,
}

impl KeyMap {
    pub fn empty() -> Self {
        Self { table: FnvHashMap::default() }
    }

    /// The built-in layout: bottom row = C3 whites, home row = C4 whites,
    /// top row = C5 whites, number row = sharps for the top row.
    pub fn default_layout() -> Self {
        let mut map = Self::empty();

        let bottom: [(Key, i8); 10] = [
            (Key::KEY_Z, -12),
            (Key::KEY_X, -10),
            (Key::KEY_C, -8),
            (Key::KEY_V, -7),
            (Key::KEY_B, -5),
            (Key::KEY_N, -3),
            (Key::KEY_M, -1),
            (Key::KEY_COMMA, 0),
            (Key::KEY_DOT, 2),
            (Key::KEY_SLASH, 4),
        ];
        let home: [(Key, i8); 10] = [
            (Key::KEY_A, 0),
            (Key::KEY_S, 2),
            (Key::KEY_D, 4),
            (Key::KEY_F, 5),
            (Key::KEY_G, 7),
            (Key::KEY_H, 9),
            (Key::KEY_J, 11),
            (Key::KEY_K, 12),
            (Key::KEY_L, 14),
            (Key::KEY_SEMICOLON, 16),
        ];
        let top: [(Key, i8); 8] = [
            (Key::KEY_Q, 12),
            (Key::KEY_W, 14),
            (Key::KEY_E, 16),
            (Key::KEY_R, 17),
            (Key::KEY_T, 19),
            (Key::KEY_Y, 21),
            (Key::KEY_U, 23),
            (Key::KEY_I, 24),
        ];
        // Sharps for the treble octave. 9 and 0 would land past the offset
        // bound, so the last treble sharp is A#.
        let sharps: [(Key, i8); 5] = [
            (Key::KEY_2, 13),
            (Key::KEY_3, 15),
            (Key::KEY_5, 18),
            (Key::KEY_6, 20),
            (Key::KEY_7, 22),
        ];

        for (key, offset) in bottom {
            map.insert_note(key.code(), offset, KeyRow::Bottom).unwrap();
        }
        for (key, offset) in home {
            map.insert_note(key.code(), offset, KeyRow::Home).unwrap();
        }
        for (key, offset) in top {
            map.insert_note(key.code(), offset, KeyRow::Top).unwrap();
        }
        for (key, offset) in sharps {
            map.insert_note(key.code(), offset, KeyRow::Top).unwrap();
        }

        let controls: [(Key, ControlRole); 14] = [
            (Key::KEY_SPACE, ControlRole::Sustain),
            (Key::KEY_ESC, ControlRole::Panic),
            (Key::KEY_UP, ControlRole::OctaveUp),
            (Key::KEY_DOWN, ControlRole::OctaveDown),
            (Key::KEY_RIGHT, ControlRole::TransposeUp),
            (Key::KEY_LEFT, ControlRole::TransposeDown),
            (Key::KEY_EQUAL, ControlRole::ProgramUp),
            (Key::KEY_MINUS, ControlRole::ProgramDown),
            (Key::KEY_TAB, ControlRole::ArpCycle),
            (Key::KEY_BACKSLASH, ControlRole::LayerToggle),
            (Key::KEY_LEFTSHIFT, ControlRole::AccentModifier),
            (Key::KEY_RIGHTSHIFT, ControlRole::AccentModifier),
            (Key::KEY_LEFTCTRL, ControlRole::SoftModifier),
            (Key::KEY_RIGHTCTRL, ControlRole::SoftModifier),
        ];
        for (key, role) in controls {
            map.insert_control(key.code(), role);
        }

        map
    }

    /// Returns `Err` with the offending offset when it falls outside
    /// [`MIN_OFFSET`]..=[`MAX_OFFSET`].
    pub fn insert_note(&mut self, code: u16, offset: i8, row: KeyRow) -> Result<(), i8> {
        if !(MIN_OFFSET..=MAX_OFFSET).contains(&offset) {
            return Err(offset);
        }
        self.table.insert(code, MappedKey::Note { offset, row });
        Ok(())
    }

    pub fn insert_control(&mut self, code: u16, role: ControlRole) {
        self.table.insert(code, MappedKey::Control(role));
    }

    #[inline]
    pub fn lookup(&self, code: u16) -> Option<MappedKey> {
        self.table.get(&code).copied()
    }

    /// The pure mapping function: scan-code plus the current octave and
    /// transpose to a MIDI pitch. Control keys and unmapped codes yield
    /// `None`; results land in [0, 127].
    pub fn pitch(&self, code: u16, octave: u8, transpose: i8) -> Option<u8> {
        match self.lookup(code)? {
            MappedKey::Note { offset, .. } => {
                let pitch =
                    12 * i32::from(octave) + 12 + i32::from(offset) + i32::from(transpose);
                Some(pitch.clamp(0, 127) as u8)
            }
            MappedKey::Control(_) => None,
        }
    }

    pub fn row_of(&self, code: u16) -> Option<KeyRow> {
        match self.lookup(code)? {
            MappedKey::Note { row, .. } => Some(row),
            MappedKey::Control(_) => None,
        }
    }
}

impl Default for KeyMap {
    fn default() -> Self {
        Self::default_layout()
    }
}

/// Resolves a config-file key name ("Z", "semicolon", "comma", ...) to its
/// evdev scan-code.
pub fn key_code_by_name(name: &str) -> Option<u16> {
    let upper = name.trim().to_ascii_uppercase();
    let key = match upper.as_str() {
        "A" => Key::KEY_A,
        "B" => Key::KEY_B,
        "C" => Key::KEY_C,
        "D" => Key::KEY_D,
        "E" => Key::KEY_E,
        "F" => Key::KEY_F,
        "G" => Key::KEY_G,
        "H" => Key::KEY_H,
        "I" => Key::KEY_I,
        "J" => Key::KEY_J,
        "K" => Key::KEY_K,
        "L" => Key::KEY_L,
        "M" => Key::KEY_M,
        "N" => Key::KEY_N,
        "O" => Key::KEY_O,
        "P" => Key::KEY_P,
        "Q" => Key::KEY_Q,
        "R" => Key::KEY_R,
        "S" => Key::KEY_S,
        "T" => Key::KEY_T,
        "U" => Key::KEY_U,
        "V" => Key::KEY_V,
        "W" => Key::KEY_W,
        "X" => Key::KEY_X,
        "Y" => Key::KEY_Y,
        "Z" => Key::KEY_Z,
        "0" => Key::KEY_0,
        "1" => Key::KEY_1,
        "2" => Key::KEY_2,
        "3" => Key::KEY_3,
        "4" => Key::KEY_4,
        "5" => Key::KEY_5,
        "6" => Key::KEY_6,
        "7" => Key::KEY_7,
        "8" => Key::KEY_8,
        "9" => Key::KEY_9,
        "COMMA" => Key::KEY_COMMA,
        "DOT" | "PERIOD" => Key::KEY_DOT,
        "SLASH" => Key::KEY_SLASH,
        "SEMICOLON" => Key::KEY_SEMICOLON,
        "APOSTROPHE" => Key::KEY_APOSTROPHE,
        "MINUS" => Key::KEY_MINUS,
        "EQUAL" => Key::KEY_EQUAL,
        "BACKSLASH" => Key::KEY_BACKSLASH,
        "SPACE" => Key::KEY_SPACE,
        "TAB" => Key::KEY_TAB,
        "ESC" | "ESCAPE" => Key::KEY_ESC,
        "ENTER" => Key::KEY_ENTER,
        "BACKSPACE" => Key::KEY_BACKSPACE,
        "CAPSLOCK" => Key::KEY_CAPSLOCK,
        "UP" => Key::KEY_UP,
        "DOWN" => Key::KEY_DOWN,
        "LEFT" => Key::KEY_LEFT,
        "RIGHT" => Key::KEY_RIGHT,
        "LEFTSHIFT" => Key::KEY_LEFTSHIFT,
        "RIGHTSHIFT" => Key::KEY_RIGHTSHIFT,
        "LEFTCTRL" => Key::KEY_LEFTCTRL,
        "RIGHTCTRL" => Key::KEY_RIGHTCTRL,
        "LEFTALT" => Key::KEY_LEFTALT,
        "RIGHTALT" => Key::KEY_RIGHTALT,
        "GRAVE" => Key::KEY_GRAVE,
        "LEFTBRACE" => Key::KEY_LEFTBRACE,
        "RIGHTBRACE" => Key::KEY_RIGHTBRACE,
        _ => return None,
    };
    Some(key.code())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_rows_land_on_their_octaves() {
        let map = KeyMap::default_layout();
        // Octave 4: bottom row starts at C3, home at C4, top at C5.
        assert_eq!(map.pitch(Key::KEY_Z.code(), 4, 0), Some(48));
        assert_eq!(map.pitch(Key::KEY_A.code(), 4, 0), Some(60));
        assert_eq!(map.pitch(Key::KEY_S.code(), 4, 0), Some(62));
        assert_eq!(map.pitch(Key::KEY_Q.code(), 4, 0), Some(72));
        assert_eq!(map.pitch(Key::KEY_2.code(), 4, 0), Some(73));
    }

    #[test]
    fn transpose_and_octave_shift_pitches() {
        let map = KeyMap::default_layout();
        assert_eq!(map.pitch(Key::KEY_A.code(), 5, 0), Some(72));
        assert_eq!(map.pitch(Key::KEY_A.code(), 4, 7), Some(67));
        assert_eq!(map.pitch(Key::KEY_A.code(), 4, -12), Some(48));
    }

    #[test]
    fn results_clamp_to_midi_range() {
        let map = KeyMap::default_layout();
        assert_eq!(map.pitch(Key::KEY_I.code(), 8, 12), Some(127));
        assert_eq!(map.pitch(Key::KEY_Z.code(), 0, -12), Some(0));
    }

    #[test]
    fn control_keys_have_no_pitch() {
        let map = KeyMap::default_layout();
        assert_eq!(map.pitch(Key::KEY_SPACE.code(), 4, 0), None);
        assert_eq!(
            map.lookup(Key::KEY_SPACE.code()),
            Some(MappedKey::Control(ControlRole::Sustain))
        );
        assert_eq!(map.lookup(Key::KEY_F24.code()), None);
    }

    #[test]
    fn out_of_range_offsets_are_rejected() {
        let mut map = KeyMap::empty();
        assert_eq!(map.insert_note(10, 25, KeyRow::Top), Err(25));
        assert_eq!(map.insert_note(10, -25, KeyRow::Bottom), Err(-25));
        assert!(map.insert_note(10, 24, KeyRow::Top).is_ok());
    }

    #[test]
    fn key_names_resolve() {
        assert_eq!(key_code_by_name("z"), Some(Key::KEY_Z.code()));
        assert_eq!(key_code_by_name("semicolon"), Some(Key::KEY_SEMICOLON.code()));
        assert_eq!(key_code_by_name("not-a-key"), None);
    }
}
