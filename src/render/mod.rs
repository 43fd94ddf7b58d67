//! The sample-renderer contract.
//!
//! Everything above this trait treats synthesis as an opaque "apply these
//! events, then fill a stereo buffer" service. The production implementation
//! wraps a SoundFont synthesizer; tests substitute a recording double.

pub mod soundfont;

pub use soundfont::SoundFontRenderer;

/// Consumed from the audio context: no method may block, and `render` may
/// not allocate.
pub trait Renderer: Send {
    fn program_change(&mut self, channel: u8, program: u8);

    /// `velocity` is always >= 1; a zero-velocity note-on never reaches the
    /// renderer.
    fn note_on(&mut self, channel: u8, pitch: u8, velocity: u8);

    fn note_off(&mut self, channel: u8, pitch: u8);

    fn cc(&mut self, channel: u8, controller: u8, value: u8);

    /// `value` in [-8192, 8191].
    fn pitch_bend(&mut self, channel: u8, value: i16);

    /// Immediately silence every voice and reset held controller state.
    fn panic(&mut self);

    /// Fill `out` with interleaved stereo; `out.len() / 2` frames.
    fn render(&mut self, out: &mut [f32]);
}
