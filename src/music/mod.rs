//! Scale and chord helpers used by the note router.

mod chord;
mod scale;

pub use chord::{expand_chord, Voicing};
pub use scale::{ScaleMode, ScaleSettings, ScaleType};
