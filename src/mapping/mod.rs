//! MIDI learn and the mappings it produces.

mod learn;

use serde::{Deserialize, Serialize};
use tracing::info;

pub use learn::{LearnEngine, PRESET_CC_RANGE};

use crate::{
    channel::ChannelId,
    midi::{MessageKind, MidiEvent},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MappingId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerKind {
    ControlChange,
    ProgramChange,
    NoteOn,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerSpec {
    pub kind: TriggerKind,
    pub number: u8,
    /// Raw channel nibble, `None` = any channel.
    #[serde(default)]
    pub channel: Option<u8>,
    #[serde(default)]
    pub source: Option<String>,
    /// Inclusive range the value (CC value or velocity) has to fall in.
    #[serde(default)]
    pub value_range: Option<(u8, u8)>,
}

impl TriggerSpec {
    /// Trigger bound to the channel and source the event came from.
    pub fn learned(kind: TriggerKind, number: u8, event: &MidiEvent) -> Self {
        Self {
            kind,
            number,
            channel: Some(event.message.channel),
            source: Some(event.source.name().to_owned()),
            value_range: None,
        }
    }

    pub fn matches(&self, event: &MidiEvent) -> bool {
        let (kind, number, value) = match event.message.kind {
            MessageKind::ControlChange { controller, value } => {
                (TriggerKind::ControlChange, controller, value)
            }
            MessageKind::ProgramChange { program } => (TriggerKind::ProgramChange, program, 0),
            MessageKind::NoteOn { note, velocity } => (TriggerKind::NoteOn, note, velocity),
            _ => return false,
        };
        kind == self.kind
            && number == self.number
            && self.channel.map_or(true, |ch| ch == event.message.channel)
            && self
                .source
                .as_deref()
                .map_or(true, |name| name == event.source.name())
            && self
                .value_range
                .map_or(true, |(low, high)| (low..=high).contains(&value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ControlTarget {
    ChannelVolume(ChannelId),
    ChannelPan(ChannelId),
    ChannelMute(ChannelId),
    MasterVolume,
}

impl ControlTarget {
    pub fn channel(&self) -> Option<ChannelId> {
        match *self {
            ControlTarget::ChannelVolume(id)
            | ControlTarget::ChannelPan(id)
            | ControlTarget::ChannelMute(id) => Some(id),
            ControlTarget::MasterVolume => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum MappingTarget {
    Control(ControlTarget),
    Preset(usize),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mapping {
    pub id: MappingId,
    pub trigger: TriggerSpec,
    pub target: MappingTarget,
}

#[derive(Debug, Clone, Default)]
pub struct MappingStore {
    mappings: Vec<Mapping>,
    next_id: u32,
}

impl MappingStore {
    pub fn new(mappings: Vec<Mapping>) -> Self {
        let next_id = mappings.iter().map(|m| m.id.0 + 1).max().unwrap_or(0);
        Self { mappings, next_id }
    }

    /// Adds a mapping. A target is driven by one trigger, so older mappings
    /// to the same target are replaced.
    pub fn insert(&mut self, trigger: TriggerSpec, target: MappingTarget) -> Mapping {
        self.mappings.retain(|m| m.target != target);
        let mapping = Mapping {
            id: MappingId(self.next_id),
            trigger,
            target,
        };
        self.next_id += 1;
        self.mappings.push(mapping.clone());
        mapping
    }

    pub fn remove(&mut self, id: MappingId) -> Option<Mapping> {
        let index = self.mappings.iter().position(|m| m.id == id)?;
        Some(self.mappings.remove(index))
    }

    pub fn remove_for_channel(&mut self, channel: ChannelId) -> usize {
        let len = self.mappings.len();
        self.mappings.retain(|m| match m.target {
            MappingTarget::Control(target) => target.channel() != Some(channel),
            MappingTarget::Preset(_) => true,
        });
        len - self.mappings.len()
    }

    pub fn clear(&mut self) {
        self.mappings.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mapping> {
        self.mappings.iter()
    }

    pub fn find<'a>(&'a self, event: &'a MidiEvent) -> impl Iterator<Item = &'a Mapping> + 'a {
        self.mappings
            .iter()
            .filter(move |m| m.trigger.matches(event))
    }
}

/// Learn slots plus the mappings they produced.
#[derive(Debug, Clone, Default)]
pub struct MappingEngine {
    store: MappingStore,
    learn: LearnEngine,
}

impl MappingEngine {
    pub fn new(mappings: Vec<Mapping>) -> Self {
        Self {
            store: MappingStore::new(mappings),
            learn: Default::default(),
        }
    }

    pub fn store(&self) -> &MappingStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut MappingStore {
        &mut self.store
    }

    pub fn learn(&self) -> &LearnEngine {
        &self.learn
    }

    pub fn learn_mut(&mut self) -> &mut LearnEngine {
        &mut self.learn
    }

    /// Turns the event into a mapping if a learn slot is armed for it.
    pub fn capture(&mut self, event: &MidiEvent) -> Option<Mapping> {
        let (trigger, target) = self.learn.capture(event)?;
        let mapping = self.store.insert(trigger, target);
        info!(
            "Learned mapping {:?}: {:?} {} -> {:?}",
            mapping.id, mapping.trigger.kind, mapping.trigger.number, mapping.target
        );
        Some(mapping)
    }

    pub fn preset_for(&self, event: &MidiEvent) -> Option<usize> {
        self.store.find(event).find_map(|m| match m.target {
            MappingTarget::Preset(preset) => Some(preset),
            MappingTarget::Control(_) => None,
        })
    }

    pub fn controls_for(&self, event: &MidiEvent) -> Vec<ControlTarget> {
        self.store
            .find(event)
            .filter_map(|m| match m.target {
                MappingTarget::Control(target) => Some(target),
                MappingTarget::Preset(_) => None,
            })
            .collect()
    }
}
