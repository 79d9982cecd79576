//! The engine, router and mappings behind the one lock the MIDI dispatcher and
//! the control surface share.

use std::{sync::Arc, time::Duration};

use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use crate::{
    bus::EngineEvent,
    channel::{self, ChannelId},
    config::RackConfig,
    engine::{Ballistics, Engine},
    mapping::{ControlTarget, Mapping, MappingEngine, MappingId},
    midi::{self, MidiEvent},
    music::ScaleSettings,
    router::{ChordPad, NoteRouter, RouterSettings},
};

const METER_DECAY: f32 = 0.7;

pub struct Stage {
    pub engine: Engine,
    pub router: NoteRouter,
    pub mappings: MappingEngine,
}

pub type SharedStage = Arc<Mutex<Stage>>;

impl Stage {
    pub fn new(engine: Engine) -> Self {
        let router = NoteRouter::new(Default::default(), engine.bus().clone());
        Self {
            engine,
            router,
            mappings: Default::default(),
        }
    }

    pub fn shared(self) -> SharedStage {
        Arc::new(Mutex::new(self))
    }

    pub fn handle_midi(&mut self, event: &MidiEvent) {
        self.router
            .process(event, &mut self.engine, &mut self.mappings);
    }

    /// Silences every channel and forgets every held note.
    pub fn panic(&mut self) {
        info!("All notes off");
        self.router.all_notes_off(&mut self.engine, None);
    }

    pub fn all_notes_off(&mut self, id: ChannelId) {
        self.router.all_notes_off(&mut self.engine, Some(id));
    }

    /// Releases the channel's notes, then drops it with everything that refers to it.
    pub fn remove_channel(&mut self, id: ChannelId) -> Result<(), channel::Error> {
        if self.engine.channel(id).is_none() {
            return Err(channel::Error::NoSuchChannel(id));
        }
        self.router.all_notes_off(&mut self.engine, Some(id));
        self.router.forget_channel(id);
        let removed = self.mappings.store_mut().remove_for_channel(id);
        if removed > 0 {
            debug!("Dropped {removed} mappings of {id}");
        }
        let learn = self.mappings.learn_mut();
        if learn.control_target().and_then(|target| target.channel()) == Some(id) {
            learn.cancel_control();
        }
        self.engine.remove_channel(id)
    }

    pub fn start_control_learn(&mut self, target: ControlTarget) {
        self.mappings.learn_mut().start_control(target);
    }

    /// Refuses a preset outside the known preset list.
    pub fn start_preset_learn(&mut self, preset: usize) -> bool {
        let known = self.engine.presets().len();
        if known > 0 && preset >= known {
            warn!("Cannot learn unknown preset {preset}");
            return false;
        }
        self.mappings.learn_mut().start_preset(preset);
        true
    }

    pub fn cancel_control_learn(&mut self) {
        self.mappings.learn_mut().cancel_control();
    }

    pub fn cancel_preset_learn(&mut self) {
        self.mappings.learn_mut().cancel_preset();
    }

    pub fn remove_mapping(&mut self, id: MappingId) -> Option<Mapping> {
        self.mappings.store_mut().remove(id)
    }

    pub fn clear_mappings(&mut self) {
        self.mappings.store_mut().clear();
    }

    pub fn set_scale(&mut self, scale: ScaleSettings) {
        self.router.set_scale(scale);
    }

    pub fn set_chord_pad(&mut self, chord_pad: Option<ChordPad>) {
        let scale = self.router.settings().scale;
        self.router.set_settings(RouterSettings { scale, chord_pad });
    }

    /// Applies the rack-wide part of a configuration. Channels are brought back
    /// by the restore coordinator.
    pub fn apply_settings(&mut self, config: &RackConfig) {
        self.router.set_settings(RouterSettings {
            scale: config.scale,
            chord_pad: config.chord_pad.clone(),
        });
        self.engine.set_spillover(config.spillover);
        self.engine.set_master_volume(config.master_volume);
        self.mappings = MappingEngine::new(config.mappings.clone());
        self.engine.set_preset_names(config.presets.clone());
    }

    pub fn snapshot_config(&self) -> RackConfig {
        let settings = self.router.settings();
        RackConfig {
            channels: self.engine.snapshot_channels(),
            scale: settings.scale,
            chord_pad: settings.chord_pad.clone(),
            spillover: self.engine.spillover(),
            master_volume: self.engine.master_volume(),
            mappings: self.mappings.store().iter().cloned().collect(),
            presets: self.engine.presets().to_vec(),
        }
    }
}

/// Routes every event to completion, in arrival order, until all senders are gone.
pub async fn run_midi_dispatcher(mut rx: midi::Receiver, stage: SharedStage) {
    while let Some(event) = rx.recv().await {
        trace!("{}: {:?}", event.source, event.message);
        stage.lock().await.handle_midi(&event);
    }
    debug!("MIDI dispatcher stopped");
}

/// Publishes smoothed meter readings on the bus every `period`.
pub async fn run_meter_sampler(stage: SharedStage, period: Duration) {
    let mut ballistics = Ballistics::new(METER_DECAY);
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        let (snapshot, bus) = {
            let stage = stage.lock().await;
            (stage.engine.sample_meters(), stage.engine.bus().clone())
        };
        bus.publish(EngineEvent::Meters(ballistics.apply(snapshot)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::graph::testing::RecordingGraph,
        bus::EventBus,
        host::{testing::TestHost, PluginDescriptor},
        mapping::{MappingTarget, TriggerKind, TriggerSpec},
        midi::{Message, MessageKind, Source},
        music::{ScaleMode, ScaleType},
    };

    fn stage(host: Arc<TestHost>) -> Stage {
        let engine =
            Engine::with_graph(Box::<RecordingGraph>::default(), host, EventBus::default());
        Stage::new(engine)
    }

    fn synth() -> PluginDescriptor {
        PluginDescriptor::instrument("synth", "Test")
    }

    #[tokio::test]
    async fn learned_fader_waits_for_held_notes() {
        let host = Arc::new(TestHost::default());
        let mut stage = stage(host.clone());
        let keys = Source::new("Keys");
        let id = stage.engine.add_channel("Piano").unwrap();
        let piano = stage.engine.load_instrument(id, &synth(), "Piano").await.unwrap();
        stage.engine.set_spillover(true);

        stage.start_control_learn(ControlTarget::ChannelVolume(id));
        stage.handle_midi(&MidiEvent::new(&keys, Message::control_change(0, 20, 90)));
        assert_eq!(stage.mappings.store().iter().count(), 1);
        assert!(!stage.mappings.learn().is_active());

        stage.handle_midi(&MidiEvent::new(&keys, Message::note_on(0, 60, 100)));
        stage.handle_midi(&MidiEvent::new(&keys, Message::note_on(0, 64, 100)));
        stage.handle_midi(&MidiEvent::new(&keys, Message::control_change(0, 20, 0)));
        assert_eq!(stage.engine.channel(id).unwrap().volume(), 1.0);

        stage.handle_midi(&MidiEvent::new(&keys, Message::note_off(0, 60)));
        assert_eq!(stage.engine.channel(id).unwrap().volume(), 1.0);
        stage.handle_midi(&MidiEvent::new(&keys, Message::note_off(0, 64)));
        assert_eq!(stage.engine.channel(id).unwrap().volume(), 0.0);

        let plugin = host.plugin(piano.node()).unwrap();
        assert!(plugin.sounding_notes().is_empty());
        assert!(!plugin.midi().iter().any(|(status, ..)| status & 0xF0 == 0xB0));
    }

    #[tokio::test]
    async fn removing_a_channel_drops_its_mappings_and_notes() {
        let mut stage = stage(Arc::new(TestHost::default()));
        let keys = Source::new("Keys");
        let a = stage.engine.add_channel("A").unwrap();
        let b = stage.engine.add_channel("B").unwrap();
        stage.start_control_learn(ControlTarget::ChannelPan(a));
        stage.handle_midi(&MidiEvent::new(&keys, Message::control_change(0, 10, 0)));
        stage.start_control_learn(ControlTarget::ChannelMute(b));
        stage.handle_midi(&MidiEvent::new(&keys, Message::control_change(0, 11, 0)));
        stage.handle_midi(&MidiEvent::new(&keys, Message::note_on(0, 60, 100)));
        assert_eq!(stage.router.ledger().len(), 1);

        stage.start_control_learn(ControlTarget::ChannelVolume(a));
        stage.remove_channel(a).unwrap();
        assert!(!stage.mappings.learn().is_active());
        assert_eq!(stage.mappings.store().iter().count(), 1);
        assert!(matches!(
            stage.remove_channel(a),
            Err(channel::Error::NoSuchChannel(_))
        ));

        stage.panic();
        assert!(stage.router.ledger().is_empty());
    }

    #[tokio::test]
    async fn settings_survive_a_snapshot() {
        let mut stage = stage(Arc::new(TestHost::default()));
        let mut config = RackConfig {
            spillover: true,
            master_volume: 0.5,
            presets: vec!["Intro".into()],
            ..Default::default()
        };
        config.scale = ScaleSettings {
            enabled: true,
            mode: ScaleMode::Snap,
            root: 2,
            scale: ScaleType::Dorian,
        };
        stage.apply_settings(&config);
        assert_eq!(stage.snapshot_config(), config);
    }

    #[tokio::test]
    async fn learn_slots_cancel_and_mappings_can_be_dropped() {
        let mut stage = stage(Arc::new(TestHost::default()));
        let mut events = stage.engine.bus().subscribe();
        let pads = Source::new("Pads");
        let hit = MidiEvent::new(&pads, Message::note_on(9, 36, 100));

        stage.start_preset_learn(1);
        stage.cancel_preset_learn();
        stage.handle_midi(&hit);
        assert_eq!(stage.mappings.store().iter().count(), 0);

        stage.start_preset_learn(1);
        stage.handle_midi(&hit);
        let learned = stage.mappings.store().iter().next().cloned().unwrap();
        stage.handle_midi(&hit);
        let mut selected = vec![];
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::PresetSelected(preset) = event {
                selected.push(preset);
            }
        }
        assert_eq!(selected, vec![1]);

        assert_eq!(stage.remove_mapping(learned.id), Some(learned.clone()));
        assert_eq!(stage.remove_mapping(learned.id), None);

        let id = stage.engine.add_channel("Bass").unwrap();
        stage.start_control_learn(ControlTarget::ChannelVolume(id));
        stage.cancel_control_learn();
        assert!(!stage.mappings.learn().is_active());
        stage.start_control_learn(ControlTarget::ChannelVolume(id));
        stage.handle_midi(&MidiEvent::new(&pads, Message::control_change(0, 7, 10)));
        assert_eq!(stage.mappings.store().iter().count(), 1);
        stage.clear_mappings();
        assert_eq!(stage.mappings.store().iter().count(), 0);
    }

    #[tokio::test]
    async fn preset_triggers_respect_the_known_presets() {
        let mut stage = stage(Arc::new(TestHost::default()));
        stage.engine.set_preset_names(vec!["A".into(), "B".into()]);
        let mut events = stage.engine.bus().subscribe();
        let keys = Source::new("Keys");
        let pc = |program| Message {
            kind: MessageKind::ProgramChange { program },
            channel: 0,
        };

        assert!(!stage.start_preset_learn(7));
        assert!(!stage.mappings.learn().is_active());

        // A hand-edited rack file can still carry a stale trigger.
        for (program, preset) in [(3, 7), (4, 1)] {
            stage.mappings.store_mut().insert(
                TriggerSpec {
                    kind: TriggerKind::ProgramChange,
                    number: program,
                    channel: None,
                    source: None,
                    value_range: None,
                },
                MappingTarget::Preset(preset),
            );
        }
        stage.handle_midi(&MidiEvent::new(&keys, pc(3)));
        stage.handle_midi(&MidiEvent::new(&keys, pc(4)));

        let mut selected = vec![];
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::PresetSelected(preset) = event {
                selected.push(preset);
            }
        }
        assert_eq!(selected, vec![1]);
    }

    #[tokio::test]
    async fn chord_pad_change_keeps_scale() {
        let mut stage = stage(Arc::new(TestHost::default()));
        let scale = ScaleSettings {
            enabled: true,
            mode: ScaleMode::Block,
            root: 7,
            scale: ScaleType::Major,
        };
        stage.set_scale(scale);
        stage.set_chord_pad(Some(ChordPad {
            source: "Pads".into(),
            midi_channel: 10,
            base_note: 48,
            voicing: Default::default(),
            buttons: vec![],
        }));
        stage.set_chord_pad(None);
        assert_eq!(stage.router.settings().scale, scale);
        assert_eq!(stage.router.settings().chord_pad, None);
    }

    #[tokio::test]
    async fn dispatcher_routes_in_arrival_order() {
        let host = Arc::new(TestHost::default());
        let stage = stage(host.clone()).shared();
        let piano = {
            let mut stage = stage.lock().await;
            let id = stage.engine.add_channel("Piano").unwrap();
            stage.engine.load_instrument(id, &synth(), "Piano").await.unwrap()
        };

        let (tx, rx) = midi::create_channel();
        let keys = Source::new("Keys");
        for message in [
            Message::note_on(3, 60, 100),
            Message::note_on(3, 67, 90),
            Message::note_off(3, 60),
        ] {
            tx.send(MidiEvent::new(&keys, message)).unwrap();
        }
        drop(tx);
        run_midi_dispatcher(rx, Arc::clone(&stage)).await;

        let plugin = host.plugin(piano.node()).unwrap();
        assert_eq!(
            plugin.midi(),
            vec![(0x90, 60, 100), (0x90, 67, 90), (0x80, 60, 0)]
        );
    }
}
