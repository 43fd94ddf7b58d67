//! SoundFont renderer backed by `rustysynth`.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use rustysynth::{SoundFont, Synthesizer, SynthesizerSettings};

use crate::error::RendererError;
use crate::render::Renderer;
use crate::time::SampleRate;

const MIDI_CC: i32 = 0xB0;
const MIDI_PROGRAM: i32 = 0xC0;
const MIDI_BEND: i32 = 0xE0;

pub struct SoundFontRenderer {
    synth: Synthesizer,
    /// De-interleave scratch, sized once for the largest buffer the audio
    /// backend will ever ask for.
    left: Vec<f32>,
    right: Vec<f32>,
}

impl SoundFontRenderer {
    pub fn load(
        path: &Path,
        sample_rate: SampleRate,
        max_polyphony: usize,
        max_frames: usize,
    ) -> Result<Self, RendererError> {
        let mut file = File::open(path)
            .map_err(|source| RendererError::SoundFontOpen { path: path.to_path_buf(), source })?;

        let sound_font = SoundFont::new(&mut file).map_err(|e| RendererError::SoundFontParse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let sound_font = Arc::new(sound_font);

        let mut settings = SynthesizerSettings::new(sample_rate.0 as i32);
        settings.maximum_polyphony = max_polyphony.max(1);

        let synth = Synthesizer::new(&sound_font, &settings)
            .map_err(|e| RendererError::Synthesizer { message: e.to_string() })?;

        log::info!(
            "Loaded soundfont {} ({} presets)",
            path.display(),
            sound_font.get_presets().len()
        );

        Ok(Self { synth, left: vec![0.0; max_frames], right: vec![0.0; max_frames] })
    }
}

impl Renderer for SoundFontRenderer {
    fn program_change(&mut self, channel: u8, program: u8) {
        self.synth.process_midi_message(
            i32::from(channel),
            MIDI_PROGRAM,
            i32::from(program & 0x7f),
            0,
        );
    }

    fn note_on(&mut self, channel: u8, pitch: u8, velocity: u8) {
        self.synth.note_on(i32::from(channel), i32::from(pitch), i32::from(velocity));
    }

    fn note_off(&mut self, channel: u8, pitch: u8) {
        self.synth.note_off(i32::from(channel), i32::from(pitch));
    }

    fn cc(&mut self, channel: u8, controller: u8, value: u8) {
        self.synth.process_midi_message(
            i32::from(channel),
            MIDI_CC,
            i32::from(controller & 0x7f),
            i32::from(value & 0x7f),
        );
    }

    fn pitch_bend(&mut self, channel: u8, value: i16) {
        let raw = (i32::from(value) + 8192).clamp(0, 16383);
        self.synth.process_midi_message(i32::from(channel), MIDI_BEND, raw & 0x7f, raw >> 7);
    }

    fn panic(&mut self) {
        self.synth.note_off_all(true);
    }

    fn render(&mut self, out: &mut [f32]) {
        let mut frames_left = out.len() / 2;
        let mut offset = 0;
        // The scratch buffers bound each synthesizer call; anything larger
        // renders in passes.
        while frames_left > 0 {
            let chunk = frames_left.min(self.left.len());
            self.synth.render(&mut self.left[..chunk], &mut self.right[..chunk]);
            for i in 0..chunk {
                out[(offset + i) * 2] = self.left[i];
                out[(offset + i) * 2 + 1] = self.right[i];
            }
            offset += chunk;
            frames_left -= chunk;
        }
    }
}
