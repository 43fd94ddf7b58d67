use std::error::Error;
use std::path::PathBuf;

/// Invalid configuration refuses to start; there is no silent clamping.
#[derive(Debug)]
pub enum ConfigError {
    InvalidField { field: String, value: String, expected: &'static str },
    Io { path: PathBuf, source: std::io::Error },
    Parse { path: PathBuf, message: String },
}

impl Error for ConfigError {}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidField { field, value, expected } => {
                write!(f, "Invalid config value for `{}`: got `{}`, expected {}.", field, value, expected)
            }
            ConfigError::Io { path, source } => {
                write!(f, "Could not read config file {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, message } => {
                write!(f, "Could not parse config file {}: {}", path.display(), message)
            }
        }
    }
}

#[derive(Debug)]
pub enum RendererError {
    SoundFontOpen { path: PathBuf, source: std::io::Error },
    SoundFontParse { path: PathBuf, message: String },
    Synthesizer { message: String },
}

impl Error for RendererError {}

impl std::fmt::Display for RendererError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RendererError::SoundFontOpen { path, source } => {
                write!(f, "Could not open soundfont {}: {}", path.display(), source)
            }
            RendererError::SoundFontParse { path, message } => {
                write!(f, "Could not parse soundfont {}: {}", path.display(), message)
            }
            RendererError::Synthesizer { message } => {
                write!(f, "Could not initialize the synthesizer: {}", message)
            }
        }
    }
}

#[derive(Debug)]
pub enum AudioError {
    UnknownDriver(String),
    NoOutputDevice,
    NoUsableConfig,
    BuildStream(String),
    Play(String),
}

impl Error for AudioError {}

impl std::fmt::Display for AudioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioError::UnknownDriver(name) => {
                write!(f, "Audio driver `{}` is not available on this system.", name)
            }
            AudioError::NoOutputDevice => write!(f, "No audio output device available."),
            AudioError::NoUsableConfig => {
                write!(f, "The audio device offers no usable output format.")
            }
            AudioError::BuildStream(msg) => write!(f, "Could not open the audio stream: {}", msg),
            AudioError::Play(msg) => write!(f, "Could not start the audio stream: {}", msg),
        }
    }
}

/// Fatal initialization failure. Maps onto the documented exit codes: 2 for
/// argument-shaped problems, 1 for everything else.
#[derive(Debug)]
pub enum StartupError {
    Config(ConfigError),
    Renderer(RendererError),
    Audio(AudioError),
    NoInputDevices,
    InputPermission { detail: String },
    MidiPortNotFound { wanted: String },
    InvalidArgument { flag: &'static str, value: String, expected: &'static str },
}

impl StartupError {
    pub fn exit_code(&self) -> i32 {
        match self {
            StartupError::InvalidArgument { .. } => 2,
            StartupError::Config(_) => 2,
            _ => 1,
        }
    }
}

impl Error for StartupError {}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartupError::Config(e) => write!(f, "{}", e),
            StartupError::Renderer(e) => write!(f, "{}", e),
            StartupError::Audio(e) => write!(f, "{}", e),
            StartupError::NoInputDevices => {
                write!(
                    f,
                    "No input devices found. If /dev/input/event* exists, add yourself to the \
                     `input` group: sudo usermod -aG input $USER (then log out and back in)."
                )
            }
            StartupError::InputPermission { detail } => {
                write!(
                    f,
                    "Permission denied opening input devices ({}). Add yourself to the `input` \
                     group: sudo usermod -aG input $USER (then log out and back in).",
                    detail
                )
            }
            StartupError::MidiPortNotFound { wanted } => {
                write!(f, "MIDI input port `{}` not found.", wanted)
            }
            StartupError::InvalidArgument { flag, value, expected } => {
                write!(f, "Invalid value `{}` for {}: expected {}.", value, flag, expected)
            }
        }
    }
}

impl From<ConfigError> for StartupError {
    fn from(e: ConfigError) -> Self {
        StartupError::Config(e)
    }
}

impl From<RendererError> for StartupError {
    fn from(e: RendererError) -> Self {
        StartupError::Renderer(e)
    }
}

impl From<AudioError> for StartupError {
    fn from(e: AudioError) -> Self {
        StartupError::Audio(e)
    }
}
