//! Real-time laptop-keyboard synthesizer pipeline.
//!
//! evdev readers feed a single fan-in task that owns all note state; it
//! produces value-typed events onto a wait-free ring consumed by the audio
//! callback. See `DESIGN.md` for the module map.

pub mod app;
pub mod arp;
pub mod bus;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod health;
pub mod input;
pub mod layer;
pub mod render;
pub mod state;
pub mod time;
pub mod velocity;
pub mod voices;

pub use arp::{ArpMode, Arpeggiator, Subdivision};
pub use bus::{note_channel, BusConsumer, BusMetrics, BusProducer};
pub use engine::{AudioSharedFlags, EngineCommand, InputEngine, InputEngineParams, RendererAdapter};
pub use event::{DeviceClass, DeviceId, EventOrigin, InputEvent, NoteEvent, RawKey};
pub use render::Renderer;
pub use state::StateCore;
pub use time::{MonotonicNanos, SampleRate};
pub use velocity::{VelocityComputer, VelocityConfig, VelocityMode};
pub use voices::VoiceAllocator;
