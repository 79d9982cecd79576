//! A rack channel: routing filters, note transforms, fader state and its signal chain.

mod filter;
mod graph;
mod spillover;
mod zone;

use std::{error, fmt};

use serde::{Deserialize, Serialize};

pub use filter::RouteFilter;
pub use graph::{ChannelGraph, EffectSlot, InstrumentSlot, SlotRef};
pub use spillover::{PendingChange, Spillover};
pub use zone::{apply_zones, KeyboardZone};

use crate::{
    audio::graph::{GraphError, MixerNode, MixerParams},
    config::ChannelConfig,
    host,
    midi::{Message, CC_ALL_NOTES_OFF},
};

pub const MAX_EFFECTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(pub u32);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "channel {}", self.0)
    }
}

#[derive(Debug)]
pub enum Error {
    Plugin(host::Error),
    CapacityExceeded,
    EngineUnavailable,
    Graph(GraphError),
    InvalidSlot(usize),
    EmptySlot(SlotRef),
    NoSuchChannel(ChannelId),
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Plugin(e) => write!(f, "{e}"),
            Error::CapacityExceeded => {
                write!(f, "Effect chain is full ({MAX_EFFECTS} slots)")
            }
            Error::EngineUnavailable => write!(f, "Audio engine is unavailable."),
            Error::Graph(e) => write!(f, "Audio graph error: {e}"),
            Error::InvalidSlot(index) => write!(f, "Invalid effect slot: {index}"),
            Error::EmptySlot(slot) => write!(f, "Slot is empty: {slot:?}"),
            Error::NoSuchChannel(id) => write!(f, "No such channel: {id}"),
        }
    }
}

impl From<host::Error> for Error {
    fn from(e: host::Error) -> Self {
        Error::Plugin(e)
    }
}

impl From<GraphError> for Error {
    fn from(e: GraphError) -> Self {
        match e {
            GraphError::Unavailable => Error::EngineUnavailable,
            e => Error::Graph(e),
        }
    }
}

/// Hold count per output note. The same note can be held by several input notes.
#[derive(Debug, Clone)]
pub struct HeldNotes {
    counts: [u16; 128],
    total: usize,
}

impl HeldNotes {
    pub fn press(&mut self, note: u8) {
        let count = &mut self.counts[note as usize & 0x7F];
        // The total only follows holds the per-note count could record.
        if let Some(next) = count.checked_add(1) {
            *count = next;
            self.total += 1;
        }
    }

    /// Returns true when the last hold of `note` was released.
    pub fn release(&mut self, note: u8) -> bool {
        let count = &mut self.counts[note as usize & 0x7F];
        if *count == 0 {
            return false;
        }
        *count -= 1;
        self.total -= 1;
        *count == 0
    }

    pub fn clear(&mut self) {
        self.counts = [0; 128];
        self.total = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn count(&self) -> usize {
        self.total
    }
}

impl Default for HeldNotes {
    fn default() -> Self {
        Self {
            counts: [0; 128],
            total: 0,
        }
    }
}

pub struct Channel {
    id: ChannelId,
    pub name: String,
    pub filter: RouteFilter,
    pub scale_filter_enabled: bool,
    pub is_chord_target: bool,
    pub zones: Vec<KeyboardZone>,
    held: HeldNotes,
    spillover: Spillover,
    graph: ChannelGraph,
}

impl Channel {
    pub fn new(id: ChannelId, name: &str, mixer: MixerNode) -> Self {
        Self {
            id,
            name: name.into(),
            filter: Default::default(),
            scale_filter_enabled: false,
            is_chord_target: false,
            zones: vec![],
            held: Default::default(),
            spillover: Default::default(),
            graph: ChannelGraph::new(mixer),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn graph(&self) -> &ChannelGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut ChannelGraph {
        &mut self.graph
    }

    fn params(&self) -> &MixerParams {
        self.graph.mixer().params()
    }

    pub fn volume(&self) -> f32 {
        self.params().volume()
    }

    pub fn pan(&self) -> f32 {
        self.params().pan()
    }

    pub fn muted(&self) -> bool {
        self.params().muted()
    }

    pub fn soloed(&self) -> bool {
        self.params().soloed()
    }

    pub fn set_soloed(&self, soloed: bool) {
        self.params().set_soloed(soloed)
    }

    pub fn held_notes(&self) -> &HeldNotes {
        &self.held
    }

    pub fn pending_change(&self) -> Option<&PendingChange> {
        self.spillover.pending()
    }

    /// Applies the change now, or queues it while notes are held and `spillover` is on.
    /// Returns what was applied.
    pub fn submit_change(
        &mut self,
        change: PendingChange,
        spillover: bool,
    ) -> Option<PendingChange> {
        let defer = spillover && !self.held.is_empty();
        let applied = self.spillover.submit(change, defer)?;
        self.apply(&applied);
        Some(applied)
    }

    pub fn discard_pending(&mut self) {
        self.spillover.discard();
    }

    /// Applies and clears everything queued.
    pub fn flush_pending(&mut self) -> Option<PendingChange> {
        let pending = self.spillover.release()?;
        self.apply(&pending);
        Some(pending)
    }

    fn apply(&self, change: &PendingChange) {
        let params = self.params();
        if let Some(volume) = change.volume {
            params.set_volume(volume.clamp(0.0, 1.0));
        }
        if let Some(pan) = change.pan {
            params.set_pan(pan.clamp(-1.0, 1.0));
        }
        if let Some(muted) = change.muted {
            params.set_muted(muted);
        }
    }

    pub fn note_on(&mut self, note: u8, velocity: u8) {
        self.held.press(note);
        self.graph.send_midi(&Message::note_on(0, note, velocity));
    }

    /// Releases one hold of `note`. The instrument sees the note-off once the
    /// last hold is gone, and pending changes land once nothing is held.
    pub fn note_off(&mut self, note: u8) -> Option<PendingChange> {
        if self.held.release(note) {
            self.graph.send_midi(&Message::note_off(0, note));
        }
        if self.held.is_empty() {
            self.flush_pending()
        } else {
            None
        }
    }

    pub fn all_notes_off(&mut self) -> Option<PendingChange> {
        self.held.clear();
        self.graph
            .send_midi(&Message::control_change(0, CC_ALL_NOTES_OFF, 0));
        self.flush_pending()
    }

    pub fn apply_config(&mut self, config: &ChannelConfig) {
        self.name = config.name.clone();
        self.filter = RouteFilter {
            midi_channel: config.midi_channel,
            source: config.source.clone(),
        };
        self.scale_filter_enabled = config.scale_filter_enabled;
        self.is_chord_target = config.is_chord_target;
        self.zones = config.zones.clone();
        self.spillover.discard();
        self.apply(&PendingChange {
            volume: Some(config.volume),
            pan: Some(config.pan),
            muted: Some(config.muted),
        });
    }

    pub fn snapshot(&self) -> ChannelConfig {
        let (instrument, effects) = self.graph.snapshot();
        ChannelConfig {
            name: self.name.clone(),
            midi_channel: self.filter.midi_channel,
            source: self.filter.source.clone(),
            scale_filter_enabled: self.scale_filter_enabled,
            is_chord_target: self.is_chord_target,
            zones: self.zones.clone(),
            instrument,
            effects,
            volume: self.volume(),
            pan: self.pan(),
            muted: self.muted(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> Channel {
        Channel::new(ChannelId(0), "Keys", MixerNode::new())
    }

    #[test]
    fn held_notes_empty_out_after_many_stacked_holds() {
        let mut held = HeldNotes::default();
        for _ in 0..300 {
            held.press(60);
        }
        for _ in 0..299 {
            assert!(!held.release(60));
        }
        assert!(!held.is_empty());
        assert!(held.release(60));
        assert!(held.is_empty());

        for _ in 0..70_000 {
            held.press(61);
        }
        for _ in 0..70_000 {
            held.release(61);
        }
        assert!(held.is_empty());
        assert_eq!(held.count(), 0);
    }

    #[test]
    fn pending_volume_waits_for_both_notes() {
        let mut channel = channel();
        channel.note_on(60, 100);
        channel.note_on(64, 100);
        assert_eq!(channel.submit_change(PendingChange::volume(0.2), true), None);
        assert_eq!(channel.volume(), 1.0);

        assert_eq!(channel.note_off(60), None);
        assert_eq!(channel.volume(), 1.0);
        assert_eq!(channel.note_off(64), Some(PendingChange::volume(0.2)));
        assert_eq!(channel.volume(), 0.2);
        assert!(channel.pending_change().is_none());
    }

    #[test]
    fn changes_apply_immediately_without_spillover_or_notes() {
        let mut channel = channel();
        assert!(channel.submit_change(PendingChange::pan(2.0), true).is_some());
        assert_eq!(channel.pan(), 1.0);
        channel.note_on(60, 100);
        assert!(channel.submit_change(PendingChange::muted(true), false).is_some());
        assert!(channel.muted());
    }

    #[test]
    fn shared_note_needs_every_release() {
        let mut held = HeldNotes::default();
        held.press(60);
        held.press(60);
        assert!(!held.release(60));
        assert!(held.release(60));
        assert!(!held.release(60));
        assert!(held.is_empty());
    }

    #[test]
    fn all_notes_off_flushes_pending() {
        let mut channel = channel();
        channel.note_on(60, 100);
        channel.submit_change(PendingChange::muted(true), true);
        assert!(!channel.muted());
        assert_eq!(channel.all_notes_off(), Some(PendingChange::muted(true)));
        assert!(channel.muted());
        assert_eq!(channel.held_notes().count(), 0);
    }

    #[test]
    fn discarded_changes_never_apply() {
        let mut channel = channel();
        channel.note_on(60, 100);
        channel.submit_change(PendingChange::volume(0.1), true);
        channel.discard_pending();
        assert_eq!(channel.note_off(60), None);
        assert_eq!(channel.volume(), 1.0);
    }
}
