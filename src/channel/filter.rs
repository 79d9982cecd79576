use serde::{Deserialize, Serialize};

use crate::midi::Source;

pub const OMNI: u8 = 0;

/// Which events a channel listens to.
#[derive(Debug, PartialEq, Eq, Clone, Default, Serialize, Deserialize)]
pub struct RouteFilter {
    /// 0 = omni, 1..=16 = that MIDI channel only.
    pub midi_channel: u8,
    /// `None` = any source.
    pub source: Option<String>,
}

impl RouteFilter {
    /// `channel` is the raw nibble of the message (0..=15).
    pub fn does_pass(&self, source: &Source, channel: u8) -> bool {
        self.does_channel_pass(channel) && self.does_source_pass(source)
    }

    fn does_channel_pass(&self, channel: u8) -> bool {
        self.midi_channel == OMNI || self.midi_channel == channel + 1
    }

    fn does_source_pass(&self, source: &Source) -> bool {
        match &self.source {
            Some(name) => name == source.name(),
            None => true,
        }
    }
}
