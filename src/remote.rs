//! Message shapes exchanged with a remote controller. The transport lives elsewhere.

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use crate::bus::EngineEvent;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RemoteCommand {
    SelectPreset(usize),
    SetChannelVolume { index: usize, value: u8 },
    SetChannelMute { index: usize, muted: bool },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RemoteUpdate {
    PresetSelected(usize),
    ChannelVolume { index: usize, value: u8 },
    ChannelMute { index: usize, muted: bool },
    PresetListSnapshot(Vec<String>),
}

pub fn value_to_volume(value: u8) -> f32 {
    value.min(127) as f32 / 127.0
}

pub fn volume_to_value(volume: f32) -> u8 {
    (volume.clamp(0.0, 1.0) * 127.0).round() as u8
}

/// The outgoing mirror of an engine event, if the remote cares about it.
pub fn update_for(event: &EngineEvent) -> Option<RemoteUpdate> {
    match event {
        EngineEvent::PresetSelected(preset) => Some(RemoteUpdate::PresetSelected(*preset)),
        EngineEvent::VolumeChanged { index, volume, .. } => Some(RemoteUpdate::ChannelVolume {
            index: *index,
            value: volume_to_value(*volume),
        }),
        EngineEvent::MuteChanged { index, muted, .. } => Some(RemoteUpdate::ChannelMute {
            index: *index,
            muted: *muted,
        }),
        EngineEvent::PresetList(names) => Some(RemoteUpdate::PresetListSnapshot(names.clone())),
        _ => None,
    }
}

/// Forwards remote-relevant bus events until either side goes away.
pub async fn run_update_forwarder(
    mut events: broadcast::Receiver<EngineEvent>,
    tx: mpsc::UnboundedSender<RemoteUpdate>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if let Some(update) = update_for(&event) {
                    if tx.send(update).is_err() {
                        return;
                    }
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Remote update forwarder lagged, {n} events skipped")
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bus::EventBus, channel::ChannelId};

    #[test]
    fn volume_scaling() {
        assert_eq!(value_to_volume(127), 1.0);
        assert_eq!(value_to_volume(0), 0.0);
        assert_eq!(volume_to_value(value_to_volume(100)), 100);
        assert_eq!(volume_to_value(2.0), 127);
    }

    #[test]
    fn mirrors_only_remote_events() {
        let event = EngineEvent::MuteChanged {
            channel: ChannelId(7),
            index: 1,
            muted: true,
        };
        assert_eq!(
            update_for(&event),
            Some(RemoteUpdate::ChannelMute {
                index: 1,
                muted: true
            })
        );
        assert_eq!(update_for(&EngineEvent::MasterVolumeChanged(0.5)), None);
    }

    #[tokio::test]
    async fn forwarder_translates_bus_events() {
        let bus = EventBus::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_update_forwarder(bus.subscribe(), tx));
        bus.publish(EngineEvent::EngineStarted);
        bus.publish(EngineEvent::PresetSelected(4));
        assert_eq!(rx.recv().await, Some(RemoteUpdate::PresetSelected(4)));
        drop(bus);
        task.await.unwrap();
    }
}
