//! Turns incoming MIDI into notes and messages for the rack's channels.

mod ledger;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

pub use ledger::{Dispatch, Ledger, NoteKey};

use crate::{
    bus::{EngineEvent, EventBus},
    channel::{apply_zones, ChannelId, KeyboardZone, RouteFilter},
    mapping::{ControlTarget, MappingEngine},
    midi::{Message, MessageKind, MidiEvent, CC_ALL_NOTES_OFF},
    music::{expand_chord, ScaleSettings, Voicing},
};

/// Routing view of one channel.
pub struct Route<'a> {
    pub id: ChannelId,
    pub filter: &'a RouteFilter,
    pub zones: &'a [KeyboardZone],
    pub scale_filter_enabled: bool,
    pub is_chord_target: bool,
}

/// The only way the router reaches channels. Everything here must be cheap
/// and non-blocking, it runs for every incoming event.
pub trait RackAccess {
    fn channel_count(&self) -> usize;
    fn route(&self, index: usize) -> Option<Route<'_>>;
    fn play_note(&mut self, channel: ChannelId, note: u8, velocity: u8);
    fn release_note(&mut self, channel: ChannelId, note: u8);
    fn send_message(&mut self, channel: ChannelId, message: &Message);
    fn set_volume(&mut self, channel: ChannelId, volume: f32);
    fn set_pan(&mut self, channel: ChannelId, pan: f32);
    fn set_muted(&mut self, channel: ChannelId, muted: bool);
    fn set_master_volume(&mut self, volume: f32);
    fn all_notes_off(&mut self, channel: ChannelId);
    /// False when the rack knows no such preset.
    fn select_preset(&mut self, preset: usize) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChordButton {
    pub note: u8,
    /// 0-based scale degree the button plays.
    pub degree: u8,
}

/// A pad controller whose notes play diatonic chords on the chord-target channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChordPad {
    pub source: String,
    /// 1..=16, no omni.
    pub midi_channel: u8,
    pub base_note: u8,
    #[serde(default)]
    pub voicing: Voicing,
    pub buttons: Vec<ChordButton>,
}

impl ChordPad {
    pub fn is_pad(&self, event: &MidiEvent) -> bool {
        event.source.name() == self.source && event.message.channel + 1 == self.midi_channel
    }

    pub fn degree_for(&self, note: u8) -> Option<u8> {
        self.buttons
            .iter()
            .find(|button| button.note == note)
            .map(|button| button.degree)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouterSettings {
    pub scale: ScaleSettings,
    pub chord_pad: Option<ChordPad>,
}

type Outputs = Vec<(ChannelId, Vec<(u8, u8)>)>;

pub struct NoteRouter {
    ledger: Ledger,
    settings: RouterSettings,
    bus: EventBus,
}

impl NoteRouter {
    pub fn new(settings: RouterSettings, bus: EventBus) -> Self {
        Self {
            ledger: Default::default(),
            settings,
            bus,
        }
    }

    pub fn settings(&self) -> &RouterSettings {
        &self.settings
    }

    /// New settings only affect notes played from now on.
    pub fn set_settings(&mut self, settings: RouterSettings) {
        self.settings = settings;
    }

    pub fn set_scale(&mut self, scale: ScaleSettings) {
        self.settings.scale = scale;
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn process(
        &mut self,
        event: &MidiEvent,
        rack: &mut dyn RackAccess,
        mappings: &mut MappingEngine,
    ) {
        if let Some(mapping) = mappings.capture(event) {
            self.bus.publish(EngineEvent::MappingLearned(mapping));
            return;
        }
        match event.message.kind {
            MessageKind::NoteOn { note, velocity } => {
                if !self.select_mapped_preset(event, mappings, rack) {
                    self.note_on(event, note, velocity, rack);
                }
            }
            MessageKind::NoteOff { note, .. } => self.note_off(event, note, rack),
            MessageKind::ControlChange { controller, value } => {
                if !self.select_mapped_preset(event, mappings, rack) {
                    self.control_change(event, controller, value, rack, mappings);
                }
            }
            MessageKind::ProgramChange { .. } => {
                if !self.select_mapped_preset(event, mappings, rack) {
                    self.pass_through(event, rack);
                }
            }
            MessageKind::PitchBend { .. }
            | MessageKind::ChannelAftertouch { .. }
            | MessageKind::PolyphonicAftertouch { .. } => self.pass_through(event, rack),
        }
    }

    /// Clears held notes on `channel`, or on every channel.
    pub fn all_notes_off(&mut self, rack: &mut dyn RackAccess, channel: Option<ChannelId>) {
        match channel {
            Some(id) => {
                self.ledger.clear_channel(id);
                rack.all_notes_off(id);
            }
            None => {
                self.ledger.clear();
                let ids: Vec<ChannelId> = (0..rack.channel_count())
                    .filter_map(|index| rack.route(index).map(|route| route.id))
                    .collect();
                for id in ids {
                    rack.all_notes_off(id);
                }
            }
        }
    }

    pub fn forget_channel(&mut self, channel: ChannelId) {
        self.ledger.clear_channel(channel);
    }

    /// A matched trigger is consumed even when the rack refuses the preset.
    fn select_mapped_preset(
        &self,
        event: &MidiEvent,
        mappings: &MappingEngine,
        rack: &mut dyn RackAccess,
    ) -> bool {
        let Some(preset) = mappings.preset_for(event) else {
            return false;
        };
        if rack.select_preset(preset) {
            debug!("Preset {preset} triggered by {}", event.source);
        } else {
            warn!("Trigger from {} names unknown preset {preset}", event.source);
        }
        true
    }

    fn note_on(&mut self, event: &MidiEvent, note: u8, velocity: u8, rack: &mut dyn RackAccess) {
        let key = NoteKey::new(&event.source, event.message.channel, note);
        if let Some(previous) = self.ledger.take(key) {
            release(previous, rack);
        }

        let outputs = match &self.settings.chord_pad {
            Some(pad) if pad.is_pad(event) => match pad.degree_for(note) {
                Some(degree) => self.chord_outputs(pad, degree, velocity, rack),
                None => {
                    trace!("Unmapped chord pad note {note} swallowed");
                    return;
                }
            },
            _ => self.channel_outputs(event, note, velocity, rack),
        };

        let mut dispatch = Dispatch::with_capacity(outputs.len());
        for (id, notes) in outputs {
            for &(note, velocity) in &notes {
                rack.play_note(id, note, velocity);
            }
            dispatch.push((id, notes.into_iter().map(|(note, _)| note).collect()));
        }
        self.ledger.record(key, dispatch);
    }

    fn note_off(&mut self, event: &MidiEvent, note: u8, rack: &mut dyn RackAccess) {
        let key = NoteKey::new(&event.source, event.message.channel, note);
        if let Some(dispatch) = self.ledger.take(key) {
            release(dispatch, rack);
        }
    }

    fn chord_outputs(
        &self,
        pad: &ChordPad,
        degree: u8,
        velocity: u8,
        rack: &dyn RackAccess,
    ) -> Outputs {
        let scale = &self.settings.scale;
        let chord = expand_chord(pad.base_note, scale.root, scale.scale, degree, pad.voicing);
        (0..rack.channel_count())
            .filter_map(|index| rack.route(index))
            .filter(|route| route.is_chord_target)
            .map(|route| {
                let notes = chord.iter().map(|note| (*note, velocity)).collect::<Vec<_>>();
                (route.id, notes)
            })
            .collect()
    }

    fn channel_outputs(
        &self,
        event: &MidiEvent,
        note: u8,
        velocity: u8,
        rack: &dyn RackAccess,
    ) -> Outputs {
        let scale = &self.settings.scale;
        let mut outputs = Outputs::new();
        for index in 0..rack.channel_count() {
            let Some(route) = rack.route(index) else {
                continue;
            };
            if !route.filter.does_pass(&event.source, event.message.channel) {
                continue;
            }
            let mut notes: Vec<(u8, u8)> = vec![];
            for (note, velocity) in apply_zones(route.zones, note, velocity) {
                let note = if scale.enabled && route.scale_filter_enabled {
                    match scale.apply(note) {
                        Some(note) => note,
                        None => continue,
                    }
                } else {
                    note
                };
                if !notes.iter().any(|(n, _)| *n == note) {
                    notes.push((note, velocity));
                }
            }
            if !notes.is_empty() {
                outputs.push((route.id, notes));
            }
        }
        outputs
    }

    fn control_change(
        &mut self,
        event: &MidiEvent,
        controller: u8,
        value: u8,
        rack: &mut dyn RackAccess,
        mappings: &MappingEngine,
    ) {
        let targets = mappings.controls_for(event);
        if !targets.is_empty() {
            for target in targets {
                apply_control(target, value, rack);
            }
            return;
        }
        if controller == CC_ALL_NOTES_OFF {
            for id in matching_channels(event, rack) {
                self.all_notes_off(rack, Some(id));
            }
            return;
        }
        self.pass_through(event, rack);
        self.bus.publish(EngineEvent::ControlPassthrough {
            source: event.source.name().to_owned(),
            channel: event.message.channel,
            controller,
            value,
        });
    }

    fn pass_through(&self, event: &MidiEvent, rack: &mut dyn RackAccess) {
        let message = Message {
            channel: 0,
            ..event.message
        };
        for id in matching_channels(event, rack) {
            rack.send_message(id, &message);
        }
    }
}

fn release(dispatch: Dispatch, rack: &mut dyn RackAccess) {
    for (id, notes) in dispatch {
        for note in notes {
            rack.release_note(id, note);
        }
    }
}

fn matching_channels(event: &MidiEvent, rack: &dyn RackAccess) -> Vec<ChannelId> {
    (0..rack.channel_count())
        .filter_map(|index| rack.route(index))
        .filter(|route| route.filter.does_pass(&event.source, event.message.channel))
        .map(|route| route.id)
        .collect()
}

pub fn apply_control(target: ControlTarget, value: u8, rack: &mut dyn RackAccess) {
    let value = value.min(127);
    match target {
        ControlTarget::ChannelVolume(id) => rack.set_volume(id, value as f32 / 127.0),
        ControlTarget::ChannelPan(id) => {
            rack.set_pan(id, ((value as f32 - 64.0) / 63.0).clamp(-1.0, 1.0))
        }
        ControlTarget::ChannelMute(id) => rack.set_muted(id, value >= 64),
        ControlTarget::MasterVolume => rack.set_master_volume(value as f32 / 127.0),
    }
}
