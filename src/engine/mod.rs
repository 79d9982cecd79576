//! The rack's owner: channel list, master bus, audio output lifecycle and metering.

pub mod meter;
mod transport;

use std::{error, fmt, sync::Arc};

use tracing::{debug, error, info, warn};

pub use meter::{Ballistics, ChannelMeter, MeterSnapshot};
pub use transport::{Transport, TransportHost};

use crate::{
    audio::{
        graph::{AudioGraph, Format, GraphNode, MasterBus, MixerNode, RenderGraph},
        output::{self, AudioOutput, OutputControl, OutputParams, Taps},
        AtomicF32,
    },
    bus::{EngineEvent, EventBus},
    channel::{self, Channel, ChannelId, EffectSlot, InstrumentSlot, PendingChange, SlotRef},
    config::ChannelConfig,
    host::{PluginDescriptor, PluginHandle, SharedHost, ViewHandle},
    midi::Message,
    remote::{self, RemoteCommand},
    router::{RackAccess, Route},
};

/// The engine could not bring up its audio output. It stays stopped.
#[derive(Debug)]
pub struct StartFailure(pub output::Error);

impl error::Error for StartFailure {}

impl fmt::Display for StartFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Engine failed to start: {}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    pub output: OutputParams,
    /// Without a device the engine runs silently.
    pub audio: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            output: Default::default(),
            audio: true,
        }
    }
}

pub struct Engine {
    channels: Vec<Channel>,
    next_id: u32,
    graph: Box<dyn AudioGraph>,
    renderer: Option<RenderGraph>,
    host: SharedHost,
    master: Arc<MasterBus>,
    transport: Arc<Transport>,
    master_peak: Arc<AtomicF32>,
    cpu_load: Arc<AtomicF32>,
    bus: EventBus,
    params: OutputParams,
    output: Option<Box<dyn OutputControl>>,
    running: bool,
    spillover: bool,
    presets: Vec<String>,
}

impl Engine {
    pub fn new(host: SharedHost, settings: EngineSettings, bus: EventBus) -> Self {
        let master = Arc::new(MasterBus::default());
        let format = Format {
            sample_rate: settings.output.sample_rate,
            channels: 2,
        };
        let renderer = RenderGraph::new(format, Arc::clone(&master));
        let mut engine = Self::with_graph(Box::new(renderer.clone()), host, bus);
        engine.master = master;
        engine.params = settings.output;
        engine.transport = Arc::new(Transport::new(settings.output.sample_rate));
        engine.host = Arc::new(TransportHost::new(
            Arc::clone(&engine.host),
            Arc::clone(&engine.transport),
        ));
        if settings.audio {
            engine.renderer = Some(renderer);
        }
        engine
    }

    /// An engine over any graph implementation. It never opens a device.
    pub fn with_graph(graph: Box<dyn AudioGraph>, host: SharedHost, bus: EventBus) -> Self {
        let params = OutputParams::default();
        Self {
            channels: vec![],
            next_id: 1,
            graph,
            renderer: None,
            host,
            master: Default::default(),
            transport: Arc::new(Transport::new(params.sample_rate)),
            master_peak: Default::default(),
            cpu_load: Default::default(),
            bus,
            params,
            output: None,
            running: false,
            spillover: false,
            presets: vec![],
        }
    }

    pub fn start(&mut self) -> Result<(), StartFailure> {
        if self.running {
            return Ok(());
        }
        if let Some(renderer) = &self.renderer {
            let taps = Taps {
                master_peak: Arc::clone(&self.master_peak),
                cpu_load: Arc::clone(&self.cpu_load),
                transport: Arc::clone(&self.transport),
            };
            match AudioOutput::start(renderer.clone(), self.params, taps) {
                Ok(output) => self.output = Some(Box::new(output)),
                Err(e) => {
                    let failure = StartFailure(e);
                    error!("{failure}");
                    return Err(failure);
                }
            }
        } else {
            info!("Engine running without audio output");
        }
        self.running = true;
        self.bus.publish(EngineEvent::EngineStarted);
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(output) = self.output.take() {
            output.stop();
        }
        if self.running {
            self.running = false;
            self.bus.publish(EngineEvent::EngineStopped);
            info!("Engine stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn host(&self) -> SharedHost {
        Arc::clone(&self.host)
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Runs `f` with both audio threads held outside the graph.
    fn with_output_paused<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        if let Some(output) = &self.output {
            output.pause();
        }
        let result = f(self);
        if let Some(output) = &self.output {
            output.resume();
        }
        result
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn index_of(&self, id: ChannelId) -> Option<usize> {
        self.channels.iter().position(|channel| channel.id() == id)
    }

    pub fn id_at(&self, index: usize) -> Option<ChannelId> {
        self.channels.get(index).map(Channel::id)
    }

    pub fn channel(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.iter().find(|channel| channel.id() == id)
    }

    pub fn channel_mut(&mut self, id: ChannelId) -> Option<&mut Channel> {
        self.channels.iter_mut().find(|channel| channel.id() == id)
    }

    fn checked_index(&self, id: ChannelId) -> Result<usize, channel::Error> {
        self.index_of(id).ok_or(channel::Error::NoSuchChannel(id))
    }

    pub fn add_channel(&mut self, name: &str) -> Result<ChannelId, channel::Error> {
        let mixer = MixerNode::new();
        let node = GraphNode::Mixer(mixer.clone());
        self.with_output_paused(|engine| engine.graph.attach(node))?;

        let id = ChannelId(self.next_id);
        self.next_id += 1;
        self.channels.push(Channel::new(id, name, mixer));
        info!("Added {id} ({name})");
        self.bus.publish(EngineEvent::ChannelAdded(id));
        Ok(id)
    }

    /// Adds channels until there are at least `count`.
    pub fn ensure_channels(&mut self, count: usize) -> Result<(), channel::Error> {
        while self.channels.len() < count {
            let name = format!("Channel {}", self.channels.len() + 1);
            self.add_channel(&name)?;
        }
        Ok(())
    }

    pub fn remove_channel(&mut self, id: ChannelId) -> Result<(), channel::Error> {
        let index = self.checked_index(id)?;
        let mut channel = self.channels.remove(index);
        let result =
            self.with_output_paused(|engine| channel.graph_mut().teardown(engine.graph.as_mut()));
        info!("Removed {id} ({})", channel.name);
        self.bus.publish(EngineEvent::ChannelRemoved(id));
        result
    }

    pub fn apply_channel_config(
        &mut self,
        id: ChannelId,
        config: &ChannelConfig,
    ) -> Result<(), channel::Error> {
        let index = self.checked_index(id)?;
        self.channels[index].apply_config(config);
        Ok(())
    }

    /// Unloads the instrument and every effect, leaving the mixer in place.
    pub fn clear_plugins(&mut self, id: ChannelId) -> Result<(), channel::Error> {
        let index = self.checked_index(id)?;
        let chain = self.channels[index].graph_mut();
        chain.unload_instrument(self.graph.as_mut())?;
        while let Some(last) = chain.effects().len().checked_sub(1) {
            chain.remove_effect(self.graph.as_mut(), last)?;
        }
        Ok(())
    }

    pub fn snapshot_channels(&self) -> Vec<ChannelConfig> {
        self.channels.iter().map(Channel::snapshot).collect()
    }

    fn report_plugin_failure(
        &self,
        id: ChannelId,
        descriptor: &PluginDescriptor,
        e: &channel::Error,
    ) {
        warn!("Failed to load {descriptor} on {id}: {e}");
        self.bus.publish(EngineEvent::PluginFailed {
            channel: id,
            plugin: descriptor.to_string(),
            reason: e.to_string(),
        });
    }

    pub async fn load_instrument(
        &mut self,
        id: ChannelId,
        descriptor: &PluginDescriptor,
        name: &str,
    ) -> Result<PluginHandle, channel::Error> {
        let index = self.checked_index(id)?;
        let host = Arc::clone(&self.host);
        let result = self.channels[index]
            .graph_mut()
            .load_instrument(host.as_ref(), self.graph.as_mut(), descriptor, name)
            .await;
        match &result {
            Ok(handle) => info!("Loaded {descriptor} on {id} as {}", handle.node()),
            Err(e) => self.report_plugin_failure(id, descriptor, e),
        }
        result
    }

    pub async fn add_effect(
        &mut self,
        id: ChannelId,
        descriptor: &PluginDescriptor,
        name: &str,
    ) -> Result<PluginHandle, channel::Error> {
        let index = self.checked_index(id)?;
        let host = Arc::clone(&self.host);
        let result = self.channels[index]
            .graph_mut()
            .add_effect(host.as_ref(), self.graph.as_mut(), descriptor, name)
            .await;
        match &result {
            Ok(handle) => info!("Added {descriptor} to {id} as {}", handle.node()),
            Err(e) => self.report_plugin_failure(id, descriptor, e),
        }
        result
    }

    pub fn install_instrument(
        &mut self,
        id: ChannelId,
        slot: InstrumentSlot,
    ) -> Result<(), channel::Error> {
        let index = self.checked_index(id)?;
        self.channels[index]
            .graph_mut()
            .install_instrument(self.graph.as_mut(), slot)
    }

    pub fn insert_effect(
        &mut self,
        id: ChannelId,
        position: usize,
        slot: EffectSlot,
    ) -> Result<(), channel::Error> {
        let index = self.checked_index(id)?;
        self.channels[index]
            .graph_mut()
            .insert_effect(self.graph.as_mut(), position, slot)
    }

    pub fn remove_effect(&mut self, id: ChannelId, slot: usize) -> Result<(), channel::Error> {
        let index = self.checked_index(id)?;
        let removed = self.channels[index]
            .graph_mut()
            .remove_effect(self.graph.as_mut(), slot)?;
        info!("Removed {} from {id}", removed.descriptor);
        Ok(())
    }

    pub fn set_effect_bypass(
        &mut self,
        id: ChannelId,
        slot: usize,
        bypass: bool,
    ) -> Result<(), channel::Error> {
        let index = self.checked_index(id)?;
        self.channels[index].graph_mut().set_effect_bypass(slot, bypass)
    }

    pub async fn open_editor(
        &self,
        id: ChannelId,
        slot: SlotRef,
    ) -> Result<Option<ViewHandle>, channel::Error> {
        let channel = self.channel(id).ok_or(channel::Error::NoSuchChannel(id))?;
        channel.graph().open_editor(slot).await
    }

    pub fn set_channel_volume(&mut self, id: ChannelId, volume: f32) -> Result<(), channel::Error> {
        self.submit_change(id, PendingChange::volume(volume))
    }

    pub fn set_channel_pan(&mut self, id: ChannelId, pan: f32) -> Result<(), channel::Error> {
        self.submit_change(id, PendingChange::pan(pan))
    }

    pub fn set_channel_muted(&mut self, id: ChannelId, muted: bool) -> Result<(), channel::Error> {
        self.submit_change(id, PendingChange::muted(muted))
    }

    pub fn set_soloed(&mut self, id: ChannelId, soloed: bool) -> Result<(), channel::Error> {
        let index = self.checked_index(id)?;
        self.channels[index].set_soloed(soloed);
        Ok(())
    }

    pub fn discard_pending(&mut self, id: ChannelId) -> Result<(), channel::Error> {
        let index = self.checked_index(id)?;
        self.channels[index].discard_pending();
        Ok(())
    }

    fn submit_change(
        &mut self,
        id: ChannelId,
        change: PendingChange,
    ) -> Result<(), channel::Error> {
        let index = self.checked_index(id)?;
        match self.channels[index].submit_change(change, self.spillover) {
            Some(applied) => self.publish_applied(index, &applied),
            None => debug!("Change on {id} deferred until notes are released"),
        }
        Ok(())
    }

    fn publish_applied(&self, index: usize, change: &PendingChange) {
        let channel = &self.channels[index];
        let id = channel.id();
        if change.volume.is_some() {
            self.bus.publish(EngineEvent::VolumeChanged {
                channel: id,
                index,
                volume: channel.volume(),
            });
        }
        if change.pan.is_some() {
            self.bus.publish(EngineEvent::PanChanged {
                channel: id,
                index,
                pan: channel.pan(),
            });
        }
        if change.muted.is_some() {
            self.bus.publish(EngineEvent::MuteChanged {
                channel: id,
                index,
                muted: channel.muted(),
            });
        }
    }

    pub fn master_volume(&self) -> f32 {
        self.master.volume()
    }

    pub fn set_master_volume(&mut self, volume: f32) {
        let volume = volume.clamp(0.0, 1.0);
        self.master.set_volume(volume);
        self.bus.publish(EngineEvent::MasterVolumeChanged(volume));
    }

    pub fn spillover(&self) -> bool {
        self.spillover
    }

    /// Turning spillover off applies everything still queued.
    pub fn set_spillover(&mut self, enabled: bool) {
        self.spillover = enabled;
        if enabled {
            return;
        }
        for index in 0..self.channels.len() {
            if let Some(applied) = self.channels[index].flush_pending() {
                self.publish_applied(index, &applied);
            }
        }
    }

    pub fn sample_meters(&self) -> MeterSnapshot {
        MeterSnapshot {
            master: self.master_peak.load(),
            channels: self
                .channels
                .iter()
                .map(|channel| ChannelMeter {
                    channel: channel.id(),
                    peak: channel.graph().mixer().params().peak(),
                })
                .collect(),
            cpu_load: self.sample_cpu_load(),
        }
    }

    pub fn sample_cpu_load(&self) -> f32 {
        self.cpu_load.load()
    }

    pub fn presets(&self) -> &[String] {
        &self.presets
    }

    pub fn set_preset_names(&mut self, names: Vec<String>) {
        self.presets = names;
        self.bus.publish(EngineEvent::PresetList(self.presets.clone()));
    }

    /// An unknown preset is refused once the preset list is known.
    pub fn select_preset(&mut self, preset: usize) -> bool {
        if !self.presets.is_empty() && preset >= self.presets.len() {
            warn!("No preset at index {preset}");
            return false;
        }
        self.bus.publish(EngineEvent::PresetSelected(preset));
        true
    }

    pub fn apply_remote(&mut self, command: RemoteCommand) {
        debug!("Remote command: {command:?}");
        let result = match command {
            RemoteCommand::SelectPreset(preset) => {
                self.select_preset(preset);
                Ok(())
            }
            RemoteCommand::SetChannelVolume { index, value } => match self.id_at(index) {
                Some(id) => self.set_channel_volume(id, remote::value_to_volume(value)),
                None => {
                    warn!("Remote addressed missing channel {index}");
                    Ok(())
                }
            },
            RemoteCommand::SetChannelMute { index, muted } => match self.id_at(index) {
                Some(id) => self.set_channel_muted(id, muted),
                None => {
                    warn!("Remote addressed missing channel {index}");
                    Ok(())
                }
            },
        };
        if let Err(e) = result {
            warn!("Remote command failed: {e}");
        }
    }
}

impl RackAccess for Engine {
    fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn route(&self, index: usize) -> Option<Route<'_>> {
        let channel = self.channels.get(index)?;
        Some(Route {
            id: channel.id(),
            filter: &channel.filter,
            zones: &channel.zones,
            scale_filter_enabled: channel.scale_filter_enabled,
            is_chord_target: channel.is_chord_target,
        })
    }

    fn play_note(&mut self, channel: ChannelId, note: u8, velocity: u8) {
        if let Some(channel) = self.channel_mut(channel) {
            channel.note_on(note, velocity);
        }
    }

    fn release_note(&mut self, channel: ChannelId, note: u8) {
        let Some(index) = self.index_of(channel) else {
            return;
        };
        if let Some(applied) = self.channels[index].note_off(note) {
            self.publish_applied(index, &applied);
        }
    }

    fn send_message(&mut self, channel: ChannelId, message: &Message) {
        if let Some(channel) = self.channel(channel) {
            channel.graph().send_midi(message);
        }
    }

    fn set_volume(&mut self, channel: ChannelId, volume: f32) {
        if let Err(e) = self.set_channel_volume(channel, volume) {
            debug!("{e}");
        }
    }

    fn set_pan(&mut self, channel: ChannelId, pan: f32) {
        if let Err(e) = self.set_channel_pan(channel, pan) {
            debug!("{e}");
        }
    }

    fn set_muted(&mut self, channel: ChannelId, muted: bool) {
        if let Err(e) = self.set_channel_muted(channel, muted) {
            debug!("{e}");
        }
    }

    fn set_master_volume(&mut self, volume: f32) {
        Engine::set_master_volume(self, volume)
    }

    fn all_notes_off(&mut self, channel: ChannelId) {
        let Some(index) = self.index_of(channel) else {
            return;
        };
        if let Some(applied) = self.channels[index].all_notes_off() {
            self.publish_applied(index, &applied);
        }
    }

    fn select_preset(&mut self, preset: usize) -> bool {
        Engine::select_preset(self, preset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::graph::{testing::RecordingGraph, GraphError, NodeId},
        host::testing::TestHost,
    };

    fn engine() -> (Arc<TestHost>, Engine) {
        let host = Arc::new(TestHost::default());
        let engine = Engine::with_graph(
            Box::<RecordingGraph>::default(),
            host.clone(),
            EventBus::default(),
        );
        (host, engine)
    }

    type Log = Arc<std::sync::Mutex<Vec<&'static str>>>;

    struct LoggedOutput(Log);

    impl OutputControl for LoggedOutput {
        fn pause(&self) {
            self.0.lock().unwrap().push("pause");
        }

        fn resume(&self) {
            self.0.lock().unwrap().push("resume");
        }

        fn stop(self: Box<Self>) {
            self.0.lock().unwrap().push("stop");
        }
    }

    struct LoggedGraph {
        inner: RecordingGraph,
        log: Log,
    }

    impl AudioGraph for LoggedGraph {
        fn attach(&mut self, node: GraphNode) -> Result<(), GraphError> {
            self.log.lock().unwrap().push("attach");
            self.inner.attach(node)
        }

        fn detach(&mut self, node: NodeId) -> Result<(), GraphError> {
            self.log.lock().unwrap().push("detach");
            self.inner.detach(node)
        }

        fn connect(&mut self, src: NodeId, dst: NodeId, format: Format) -> Result<(), GraphError> {
            self.inner.connect(src, dst, format)
        }

        fn disconnect_all_outputs(&mut self, node: NodeId) -> Result<(), GraphError> {
            self.inner.disconnect_all_outputs(node)
        }

        fn disconnect_all_inputs(&mut self, node: NodeId) -> Result<(), GraphError> {
            self.inner.disconnect_all_inputs(node)
        }

        fn canonical_output_format(&self) -> Format {
            self.inner.canonical_output_format()
        }
    }

    #[test]
    fn channel_topology_changes_happen_while_output_is_held() {
        let log = Log::default();
        let graph = LoggedGraph {
            inner: Default::default(),
            log: Arc::clone(&log),
        };
        let mut engine = Engine::with_graph(
            Box::new(graph),
            Arc::new(TestHost::default()),
            EventBus::default(),
        );
        engine.output = Some(Box::new(LoggedOutput(Arc::clone(&log))));

        let id = engine.add_channel("Piano").unwrap();
        engine.remove_channel(id).unwrap();
        engine.stop();
        assert_eq!(
            *log.lock().unwrap(),
            ["pause", "attach", "resume", "pause", "detach", "resume", "stop"]
        );
    }

    #[test]
    fn channels_get_fresh_ids() {
        let (_, mut engine) = engine();
        let a = engine.add_channel("A").unwrap();
        let b = engine.add_channel("B").unwrap();
        engine.remove_channel(a).unwrap();
        let c = engine.add_channel("C").unwrap();
        assert_ne!(b, c);
        assert_ne!(a, c);
        assert_eq!(engine.index_of(c), Some(1));
        assert!(matches!(
            engine.remove_channel(a),
            Err(channel::Error::NoSuchChannel(_))
        ));
    }

    #[test]
    fn start_without_device_runs_silently() {
        let (_, mut engine) = engine();
        let mut events = engine.bus().subscribe();
        engine.start().unwrap();
        assert!(engine.is_running());
        engine.stop();
        assert!(!engine.is_running());
        assert_eq!(events.try_recv().unwrap(), EngineEvent::EngineStarted);
        assert_eq!(events.try_recv().unwrap(), EngineEvent::EngineStopped);
    }

    #[tokio::test]
    async fn failed_load_is_published() {
        let broken = PluginDescriptor::instrument("broken", "Test");
        let host = Arc::new(TestHost::default().failing(broken.clone()));
        let mut engine =
            Engine::with_graph(Box::<RecordingGraph>::default(), host, EventBus::default());
        let id = engine.add_channel("Keys").unwrap();
        let mut events = engine.bus().subscribe();

        let result = engine.load_instrument(id, &broken, "Broken").await;
        assert!(matches!(result, Err(channel::Error::Plugin(_))));
        assert!(matches!(
            events.try_recv().unwrap(),
            EngineEvent::PluginFailed { channel, .. } if channel == id
        ));
    }

    #[tokio::test]
    async fn spillover_holds_fader_until_notes_released() {
        let (host, mut engine) = engine();
        let id = engine.add_channel("Keys").unwrap();
        let synth = engine
            .load_instrument(id, &PluginDescriptor::instrument("synth", "Test"), "Synth")
            .await
            .unwrap();
        engine.set_spillover(true);
        let mut events = engine.bus().subscribe();

        engine.play_note(id, 60, 100);
        engine.play_note(id, 64, 100);
        engine.set_channel_volume(id, 0.3).unwrap();
        assert_eq!(engine.channel(id).unwrap().volume(), 1.0);

        engine.release_note(id, 60);
        assert_eq!(engine.channel(id).unwrap().volume(), 1.0);
        assert!(events.try_recv().is_err());

        engine.release_note(id, 64);
        assert_eq!(engine.channel(id).unwrap().volume(), 0.3);
        assert_eq!(
            events.try_recv().unwrap(),
            EngineEvent::VolumeChanged {
                channel: id,
                index: 0,
                volume: 0.3
            }
        );
        assert_eq!(host.plugin(synth.node()).unwrap().sounding_notes(), Vec::<u8>::new());
    }

    #[test]
    fn disabling_spillover_flushes_queued_changes() {
        let (_, mut engine) = engine();
        let id = engine.add_channel("Keys").unwrap();
        engine.set_spillover(true);
        engine.play_note(id, 60, 100);
        engine.set_channel_muted(id, true).unwrap();
        assert!(!engine.channel(id).unwrap().muted());
        engine.set_spillover(false);
        assert!(engine.channel(id).unwrap().muted());
    }

    #[test]
    fn remote_commands_address_channels_by_position() {
        let (_, mut engine) = engine();
        engine.add_channel("A").unwrap();
        let b = engine.add_channel("B").unwrap();
        engine.apply_remote(RemoteCommand::SetChannelVolume {
            index: 1,
            value: 0,
        });
        engine.apply_remote(RemoteCommand::SetChannelMute {
            index: 1,
            muted: true,
        });
        engine.apply_remote(RemoteCommand::SetChannelMute {
            index: 9,
            muted: true,
        });
        let channel = engine.channel(b).unwrap();
        assert_eq!(channel.volume(), 0.0);
        assert!(channel.muted());
    }

    #[test]
    fn presets_are_checked_against_known_names() {
        let (_, mut engine) = engine();
        assert!(engine.select_preset(12));
        engine.set_preset_names(vec!["Intro".into(), "Outro".into()]);
        assert!(engine.select_preset(1));
        assert!(!engine.select_preset(2));
    }

    #[test]
    fn meters_list_every_channel() {
        let (_, mut engine) = engine();
        let a = engine.add_channel("A").unwrap();
        engine.set_master_volume(2.0);
        assert_eq!(engine.master_volume(), 1.0);
        let meters = engine.sample_meters();
        assert_eq!(meters.channels.len(), 1);
        assert_eq!(meters.channels[0].channel, a);
        assert_eq!(meters.master, 0.0);
    }
}
