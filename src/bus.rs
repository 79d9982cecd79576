//! Typed fan-out of engine events to any number of listeners.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::{
    channel::ChannelId, engine::MeterSnapshot, mapping::Mapping, restore::RestoreProgress,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineEvent {
    EngineStarted,
    EngineStopped,
    ChannelAdded(ChannelId),
    ChannelRemoved(ChannelId),
    VolumeChanged {
        channel: ChannelId,
        index: usize,
        volume: f32,
    },
    PanChanged {
        channel: ChannelId,
        index: usize,
        pan: f32,
    },
    MuteChanged {
        channel: ChannelId,
        index: usize,
        muted: bool,
    },
    MasterVolumeChanged(f32),
    PresetSelected(usize),
    PresetList(Vec<String>),
    /// A CC no mapping claimed.
    ControlPassthrough {
        source: String,
        channel: u8,
        controller: u8,
        value: u8,
    },
    MappingLearned(Mapping),
    PluginFailed {
        channel: ChannelId,
        plugin: String,
        reason: String,
    },
    RestoreProgress(RestoreProgress),
    RestoreFinished {
        succeeded: usize,
        failed: usize,
    },
    Meters(MeterSnapshot),
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Never blocks. Events published while nobody listens are dropped.
    pub fn publish(&self, event: EngineEvent) {
        if self.tx.receiver_count() == 0 {
            return;
        }
        _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_subscriber_gets_every_event() {
        let bus = EventBus::default();
        bus.publish(EngineEvent::EngineStarted);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        bus.publish(EngineEvent::PresetSelected(2));
        assert_eq!(first.recv().await.unwrap(), EngineEvent::PresetSelected(2));
        assert_eq!(second.recv().await.unwrap(), EngineEvent::PresetSelected(2));
        assert!(first.try_recv().is_err());
    }
}
