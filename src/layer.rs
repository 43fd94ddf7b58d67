//! Layer duplication: a second program sounding in unison with the primary.
//!
//! When enabled, every primary-channel note-on/off is mirrored onto the
//! layer channel, velocity and pitch untouched. The duplicate carries
//! `origin=Layer` and lives its own life in the voice allocator, so it is
//! always paired with its primary event even with the arpeggiator running.

use crate::event::{EventOrigin, NoteEvent};
use crate::state::LayerState;

/// The layer copy of one primary-channel event, if it gets one.
pub fn duplicate(layer: &LayerState, primary_channel: u8, ev: &NoteEvent) -> Option<NoteEvent> {
    if !layer.enabled {
        return None;
    }
    match *ev {
        NoteEvent::On { pitch, velocity, channel, .. } if channel == primary_channel => {
            Some(NoteEvent::On {
                pitch,
                velocity,
                channel: layer.channel,
                origin: EventOrigin::Layer,
            })
        }
        NoteEvent::Off { pitch, channel, .. } if channel == primary_channel => {
            Some(NoteEvent::Off { pitch, channel: layer.channel, origin: EventOrigin::Layer })
        }
        _ => None,
    }
}
