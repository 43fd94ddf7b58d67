//! Configuration file, validation, and the persisted session record.
//!
//! Config is JSON in the user config directory. Validation is strict: an
//! out-of-range value refuses startup with a message naming the field;
//! nothing is silently clamped. The session record (last program, octave,
//! modes, favorites) is written atomically on shutdown.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::arp::{ArpMode, Subdivision};
use crate::error::ConfigError;
use crate::input::keymap::{key_code_by_name, ControlRole, KeyMap, KeyRow};
use crate::velocity::{VelocityConfig, VelocityMode};

pub const APP_DIR: &str = "keysynth";
pub const CONFIG_FILE: &str = "config.json";
pub const SESSION_FILE: &str = "session.json";

pub const PRIMARY_CHANNEL: u8 = 0;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Frames per buffer; `None` lets the driver choose.
    pub buffer_frames: Option<u32>,
    pub bpm: f64,
    pub subdivision: Subdivision,
    pub max_polyphony: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            buffer_frames: None,
            bpm: 120.0,
            subdivision: Subdivision::Sixteenth,
            max_polyphony: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerConfig {
    pub enabled: bool,
    pub program: u8,
    pub channel: u8,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self { enabled: false, program: 48, channel: 1 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    pub grab_keyboards: bool,
    pub grab_touchpads: bool,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self { grab_keyboards: true, grab_touchpads: false }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteKeyEntry {
    pub key: String,
    pub offset: i8,
    pub row: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlKeyEntry {
    pub key: String,
    pub role: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeymapConfig {
    /// When empty, the built-in three-octave QWERTY layout applies.
    pub notes: Vec<NoteKeyEntry>,
    pub controls: Vec<ControlKeyEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub audio: AudioConfig,
    pub velocity: VelocityConfig,
    pub layer: LayerConfig,
    pub input: InputConfig,
    pub keymap: KeymapConfig,
}

impl Config {
    /// Loads the config file, or the defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Config::default());
            }
            Err(source) => return Err(ConfigError::Io { path: path.to_path_buf(), source }),
        };

        let config: Config = serde_json::from_str(&text)
            .map_err(|e| ConfigError::Parse { path: path.to_path_buf(), message: e.to_string() })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &str, value: String, expected: &'static str| {
            Err(ConfigError::InvalidField { field: field.to_string(), value, expected })
        };

        let v = &self.velocity;
        if v.vmin < 1 || v.vmin > 127 {
            return invalid("velocity.vmin", v.vmin.to_string(), "a value in 1..=127");
        }
        if v.vmax < v.vmin || v.vmax > 127 {
            return invalid("velocity.vmax", v.vmax.to_string(), "a value in vmin..=127");
        }
        if v.baseline < 1 || v.baseline > 127 {
            return invalid("velocity.baseline", v.baseline.to_string(), "a value in 1..=127");
        }
        if v.fixed < 1 || v.fixed > 127 {
            return invalid("velocity.fixed", v.fixed.to_string(), "a value in 1..=127");
        }
        if v.window_ms == 0 {
            return invalid("velocity.window_ms", v.window_ms.to_string(), "a positive number");
        }
        if !(0.0..=1.0).contains(&v.pressure_threshold) {
            return invalid(
                "velocity.pressure_threshold",
                v.pressure_threshold.to_string(),
                "a value in 0.0..=1.0",
            );
        }
        if !(0.0..1.0).contains(&v.smoothing) {
            return invalid("velocity.smoothing", v.smoothing.to_string(), "a value in 0.0..1.0");
        }
        for (field, value) in [
            ("velocity.row_bottom", v.row_bottom),
            ("velocity.row_home", v.row_home),
            ("velocity.row_top", v.row_top),
        ] {
            if value < 1 || value > 127 {
                return invalid(field, value.to_string(), "a value in 1..=127");
            }
        }

        if !(10.0..=1000.0).contains(&self.audio.bpm) {
            return invalid("audio.bpm", self.audio.bpm.to_string(), "a tempo in 10..=1000");
        }
        if self.audio.max_polyphony < 1 || self.audio.max_polyphony > 256 {
            return invalid(
                "audio.max_polyphony",
                self.audio.max_polyphony.to_string(),
                "a value in 1..=256",
            );
        }
        if let Some(frames) = self.audio.buffer_frames {
            if !(16..=8192).contains(&frames) {
                return invalid(
                    "audio.buffer_frames",
                    frames.to_string(),
                    "a frame count in 16..=8192",
                );
            }
        }

        if self.layer.program > 127 {
            return invalid("layer.program", self.layer.program.to_string(), "a value in 0..=127");
        }
        if self.layer.channel == PRIMARY_CHANNEL || self.layer.channel > 15 {
            return invalid(
                "layer.channel",
                self.layer.channel.to_string(),
                "a MIDI channel in 1..=15",
            );
        }

        Ok(())
    }

    /// Builds the runtime key table: the built-in layout when the config
    /// names no keys, otherwise exactly what the config says.
    pub fn build_keymap(&self) -> Result<KeyMap, ConfigError> {
        if self.keymap.notes.is_empty() && self.keymap.controls.is_empty() {
            return Ok(KeyMap::default_layout());
        }

        let mut map =
            if self.keymap.notes.is_empty() { KeyMap::default_layout() } else { KeyMap::empty() };

        for entry in &self.keymap.notes {
            let code = key_code_by_name(&entry.key).ok_or_else(|| ConfigError::InvalidField {
                field: "keymap.notes.key".to_string(),
                value: entry.key.clone(),
                expected: "a known key name",
            })?;
            let row = parse_row(&entry.row).ok_or_else(|| ConfigError::InvalidField {
                field: "keymap.notes.row".to_string(),
                value: entry.row.clone(),
                expected: "one of bottom, home, top",
            })?;
            map.insert_note(code, entry.offset, row).map_err(|offset| {
                ConfigError::InvalidField {
                    field: "keymap.notes.offset".to_string(),
                    value: offset.to_string(),
                    expected: "an offset in -24..=24",
                }
            })?;
        }

        for entry in &self.keymap.controls {
            let code = key_code_by_name(&entry.key).ok_or_else(|| ConfigError::InvalidField {
                field: "keymap.controls.key".to_string(),
                value: entry.key.clone(),
                expected: "a known key name",
            })?;
            let role = parse_role(&entry.role).ok_or_else(|| ConfigError::InvalidField {
                field: "keymap.controls.role".to_string(),
                value: entry.role.clone(),
                expected: "a known control role",
            })?;
            map.insert_control(code, role);
        }

        Ok(map)
    }
}

fn parse_row(name: &str) -> Option<KeyRow> {
    match name.to_ascii_lowercase().as_str() {
        "bottom" => Some(KeyRow::Bottom),
        "home" => Some(KeyRow::Home),
        "top" => Some(KeyRow::Top),
        _ => None,
    }
}

fn parse_role(name: &str) -> Option<ControlRole> {
    match name.to_ascii_lowercase().as_str() {
        "sustain" => Some(ControlRole::Sustain),
        "panic" => Some(ControlRole::Panic),
        "octave_up" => Some(ControlRole::OctaveUp),
        "octave_down" => Some(ControlRole::OctaveDown),
        "transpose_up" => Some(ControlRole::TransposeUp),
        "transpose_down" => Some(ControlRole::TransposeDown),
        "program_up" => Some(ControlRole::ProgramUp),
        "program_down" => Some(ControlRole::ProgramDown),
        "arp_cycle" => Some(ControlRole::ArpCycle),
        "layer_toggle" => Some(ControlRole::LayerToggle),
        "accent" => Some(ControlRole::AccentModifier),
        "soft" => Some(ControlRole::SoftModifier),
        _ => None,
    }
}

/// What survives across runs. Written atomically on shutdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionState {
    pub last_program: u8,
    pub last_octave: u8,
    pub layer_enabled: bool,
    pub arp_mode: ArpMode,
    pub velocity_mode: VelocityMode,
    pub soundfont_favorites: Vec<PathBuf>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            last_program: 0,
            last_octave: 4,
            layer_enabled: false,
            arp_mode: ArpMode::Off,
            velocity_mode: VelocityMode::Combined,
            soundfont_favorites: Vec::new(),
        }
    }
}

impl SessionState {
    pub fn load(path: &Path) -> SessionState {
        match fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                log::warn!("Ignoring unreadable session state {}: {}", path.display(), e);
                SessionState::default()
            }),
            Err(_) => SessionState::default(),
        }
    }

    /// Write-temp-then-rename so a crash mid-write never corrupts the
    /// previous session.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let tmp = path.with_extension("json.tmp");
        let text = serde_json::to_string_pretty(self).expect("session state serializes");
        fs::write(&tmp, text)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn remember_favorite(&mut self, soundfont: &Path) {
        if !self.soundfont_favorites.iter().any(|p| p == soundfont) {
            self.soundfont_favorites.push(soundfont.to_path_buf());
        }
    }
}

/// `~/.config/keysynth/<file>`, or a bare relative path when no config
/// directory exists (containers, odd setups).
pub fn default_path(file: &str) -> PathBuf {
    match dirs::config_dir() {
        Some(dir) => dir.join(APP_DIR).join(file),
        None => PathBuf::from(file),
    }
}
