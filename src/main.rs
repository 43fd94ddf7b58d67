use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use fern::colors::ColoredLevelConfig;
use log::LevelFilter;

use keysynth::app::{App, AppOptions, Driver};
use keysynth::config::{self, Config};
use keysynth::error::StartupError;
use keysynth::input::supervisor::classify;
use keysynth::velocity::VelocityMode;

/// Play your laptop keyboard and touchpad as a polyphonic SoundFont
/// instrument.
#[derive(Parser, Debug)]
#[command(name = "keysynth", version, about)]
struct Cli {
    /// Audio driver to use.
    #[arg(long, value_enum)]
    driver: Option<Driver>,

    /// Path to a .sf2 soundfont. Falls back to session favorites, then the
    /// system soundfont directories.
    #[arg(short, long)]
    soundfont: Option<PathBuf>,

    /// Starting octave, 0..=8.
    #[arg(long)]
    octave: Option<u8>,

    /// Starting General MIDI program, 0..=127.
    #[arg(long)]
    program: Option<u8>,

    /// Velocity source.
    #[arg(long, value_enum)]
    velocity_mode: Option<VelocityMode>,

    /// Velocity for --velocity-mode fixed, 1..=127.
    #[arg(long)]
    fixed_velocity: Option<u8>,

    /// Bridge an external MIDI input port (substring match on the port
    /// name).
    #[arg(long)]
    midi_input: Option<String>,

    /// Config file path.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run without the telemetry log feed.
    #[arg(long)]
    headless: bool,

    /// Enable debug logging.
    #[arg(short, long)]
    verbose: bool,

    /// List input devices and MIDI ports, then exit.
    #[arg(long)]
    list_devices: bool,
}

fn main() {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    if cli.list_devices {
        list_devices();
        return;
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || shutdown.store(true, Ordering::SeqCst))
            .expect("failed to install the interrupt handler");
    }

    match run(cli, Arc::clone(&shutdown)) {
        Ok(()) => {
            if shutdown.load(Ordering::SeqCst) {
                std::process::exit(130);
            }
        }
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(e.exit_code());
        }
    }
}

fn run(cli: Cli, shutdown: Arc<AtomicBool>) -> Result<(), StartupError> {
    let config_path =
        cli.config.clone().unwrap_or_else(|| config::default_path(config::CONFIG_FILE));
    let config = Config::load(&config_path)?;

    let driver = match cli.driver {
        Some(driver) => driver,
        None => env_enum::<Driver>("KEYSYNTH_DRIVER")?.unwrap_or(Driver::Auto),
    };
    let soundfont = cli
        .soundfont
        .clone()
        .or_else(|| std::env::var_os("KEYSYNTH_SOUNDFONT").map(PathBuf::from));
    let octave = match cli.octave {
        Some(octave) => Some(octave),
        None => env_number("KEYSYNTH_OCTAVE", "an octave in 0..=8", 0, 8)?,
    };
    let velocity_mode = match cli.velocity_mode {
        Some(mode) => Some(mode),
        None => env_enum::<VelocityMode>("KEYSYNTH_VELOCITY")?,
    };

    if let Some(octave) = octave {
        if octave > 8 {
            return Err(StartupError::InvalidArgument {
                flag: "--octave",
                value: octave.to_string(),
                expected: "an octave in 0..=8",
            });
        }
    }
    if let Some(program) = cli.program {
        if program > 127 {
            return Err(StartupError::InvalidArgument {
                flag: "--program",
                value: program.to_string(),
                expected: "a program in 0..=127",
            });
        }
    }
    if let Some(fixed) = cli.fixed_velocity {
        if !(1..=127).contains(&fixed) {
            return Err(StartupError::InvalidArgument {
                flag: "--fixed-velocity",
                value: fixed.to_string(),
                expected: "a velocity in 1..=127",
            });
        }
    }

    let options = AppOptions {
        config,
        soundfont,
        driver,
        octave,
        program: cli.program,
        velocity_mode,
        fixed_velocity: cli.fixed_velocity,
        midi_port: cli.midi_input.clone(),
        headless: cli.headless,
        session_path: config::default_path(config::SESSION_FILE),
    };

    let mut app = App::bootstrap(options)?;
    log::info!("keysynth is live. Esc panics; Ctrl+C quits.");
    app.run(shutdown);
    Ok(())
}

/// Environment overrides are read once at startup and behave exactly like
/// their CLI flags, including the argument-error exit code.
fn env_enum<T: ValueEnum>(name: &'static str) -> Result<Option<T>, StartupError> {
    match std::env::var(name) {
        Ok(value) => T::from_str(&value, true).map(Some).map_err(|_| {
            StartupError::InvalidArgument { flag: name, value, expected: "a known variant" }
        }),
        Err(_) => Ok(None),
    }
}

fn env_number(
    name: &'static str,
    expected: &'static str,
    min: u8,
    max: u8,
) -> Result<Option<u8>, StartupError> {
    match std::env::var(name) {
        Ok(value) => match value.parse::<u8>() {
            Ok(n) if n >= min && n <= max => Ok(Some(n)),
            _ => Err(StartupError::InvalidArgument { flag: name, value, expected }),
        },
        Err(_) => Ok(None),
    }
}

fn list_devices() {
    println!("Input devices:");
    let mut any = false;
    for (path, device) in evdev::enumerate() {
        if let Some(class) = classify(&device) {
            any = true;
            println!(
                "  {}  {}  ({})",
                path.display(),
                device.name().unwrap_or("unnamed device"),
                class
            );
        }
    }
    if !any {
        println!("  (none visible; are you in the `input` group?)");
    }

    println!("MIDI input ports:");
    match midir::MidiInput::new("keysynth") {
        Ok(midi_in) => {
            let ports = midi_in.ports();
            if ports.is_empty() {
                println!("  (none)");
            }
            for port in &ports {
                if let Ok(name) = midi_in.port_name(port) {
                    println!("  {}", name);
                }
            }
        }
        Err(e) => println!("  (unavailable: {})", e),
    }
}

fn setup_logging(verbose: bool) {
    let log_colors = ColoredLevelConfig::default();
    let level = if verbose { LevelFilter::Debug } else { LevelFilter::Info };

    fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%H:%M:%S]"),
                record.target(),
                log_colors.color(record.level()),
                message
            ))
        })
        .level(level)
        .chain(std::io::stdout())
        .apply()
        .expect("logging initialized twice");
}
