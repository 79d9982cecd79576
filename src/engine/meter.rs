use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::channel::ChannelId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMeter {
    pub channel: ChannelId,
    pub peak: f32,
}

/// One reading of every level meter plus the render load.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeterSnapshot {
    pub master: f32,
    pub channels: Vec<ChannelMeter>,
    pub cpu_load: f32,
}

/// Peak hold with a per-tick fall-off, so short transients stay visible
/// between sampling ticks.
#[derive(Debug)]
pub struct Ballistics {
    decay: f32,
    master: f32,
    channels: HashMap<ChannelId, f32>,
}

impl Ballistics {
    pub fn new(decay: f32) -> Self {
        Self {
            decay: decay.clamp(0.0, 1.0),
            master: 0.0,
            channels: HashMap::new(),
        }
    }

    pub fn apply(&mut self, mut snapshot: MeterSnapshot) -> MeterSnapshot {
        self.master = f32::max(snapshot.master, self.master * self.decay);
        snapshot.master = self.master;

        let mut held = HashMap::with_capacity(snapshot.channels.len());
        for meter in &mut snapshot.channels {
            let previous = self.channels.get(&meter.channel).copied().unwrap_or(0.0);
            meter.peak = f32::max(meter.peak, previous * self.decay);
            held.insert(meter.channel, meter.peak);
        }
        // Channels that went away are forgotten.
        self.channels = held;
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(master: f32, peak: f32) -> MeterSnapshot {
        MeterSnapshot {
            master,
            channels: vec![ChannelMeter {
                channel: ChannelId(1),
                peak,
            }],
            cpu_load: 0.0,
        }
    }

    #[test]
    fn peaks_fall_off_gradually() {
        let mut ballistics = Ballistics::new(0.5);
        assert_eq!(ballistics.apply(snapshot(0.8, 1.0)), snapshot(0.8, 1.0));
        assert_eq!(ballistics.apply(snapshot(0.0, 0.0)), snapshot(0.4, 0.5));
        assert_eq!(ballistics.apply(snapshot(0.9, 0.1)), snapshot(0.9, 0.25));
    }

    #[test]
    fn removed_channels_start_from_silence() {
        let mut ballistics = Ballistics::new(0.5);
        ballistics.apply(snapshot(0.0, 1.0));
        ballistics.apply(MeterSnapshot::default());
        assert_eq!(ballistics.apply(snapshot(0.0, 0.0)), snapshot(0.0, 0.0));
    }
}
