use tracing::{debug, warn};

use super::{Error, MAX_EFFECTS};
use crate::{
    audio::graph::{AudioGraph, GraphNode, MixerNode, NodeId},
    config::PluginConfig,
    host::{PluginDescriptor, PluginHandle, PluginHost, ViewHandle},
    midi::Message,
};

#[derive(Clone)]
pub struct InstrumentSlot {
    pub handle: PluginHandle,
    pub descriptor: PluginDescriptor,
    pub name: String,
}

impl InstrumentSlot {
    pub fn new(handle: PluginHandle, name: &str) -> Self {
        Self {
            descriptor: handle.descriptor().clone(),
            handle,
            name: name.into(),
        }
    }
}

/// Handle and metadata of one effect, always replaced together.
#[derive(Clone)]
pub struct EffectSlot {
    pub handle: PluginHandle,
    pub descriptor: PluginDescriptor,
    pub name: String,
    pub bypassed: bool,
}

impl EffectSlot {
    pub fn new(handle: PluginHandle, name: &str, bypassed: bool) -> Self {
        handle.set_bypass(bypassed);
        Self {
            descriptor: handle.descriptor().clone(),
            handle,
            name: name.into(),
            bypassed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRef {
    Instrument,
    Effect(usize),
}

/// Signal chain of one channel: instrument, up to four effects, mixer.
pub struct ChannelGraph {
    mixer: MixerNode,
    instrument: Option<InstrumentSlot>,
    effects: Vec<EffectSlot>,
}

impl ChannelGraph {
    pub fn new(mixer: MixerNode) -> Self {
        Self {
            mixer,
            instrument: None,
            effects: Vec::with_capacity(MAX_EFFECTS),
        }
    }

    pub fn mixer(&self) -> &MixerNode {
        &self.mixer
    }

    pub fn instrument(&self) -> Option<&InstrumentSlot> {
        self.instrument.as_ref()
    }

    pub fn effects(&self) -> &[EffectSlot] {
        &self.effects
    }

    /// Replaces the instrument. The old one is gone even if the new one fails to load.
    pub async fn load_instrument(
        &mut self,
        host: &dyn PluginHost,
        graph: &mut dyn AudioGraph,
        descriptor: &PluginDescriptor,
        name: &str,
    ) -> Result<PluginHandle, Error> {
        self.unload_instrument(graph)?;
        let handle = host.instantiate(descriptor).await?;
        self.install_instrument(graph, InstrumentSlot::new(handle.clone(), name))?;
        Ok(handle)
    }

    pub fn install_instrument(
        &mut self,
        graph: &mut dyn AudioGraph,
        slot: InstrumentSlot,
    ) -> Result<(), Error> {
        self.unload_instrument(graph)?;
        graph.attach(GraphNode::Plugin(slot.handle.clone()))?;
        debug!("Instrument {} installed as {}", slot.descriptor, slot.handle.node());
        self.instrument = Some(slot);
        self.rebuild_chain(graph)
    }

    pub fn unload_instrument(&mut self, graph: &mut dyn AudioGraph) -> Result<(), Error> {
        let Some(slot) = self.instrument.take() else {
            return Ok(());
        };
        let node = slot.handle.node();
        graph.disconnect_all_outputs(node)?;
        graph.detach(node)?;
        self.rebuild_chain(graph)
    }

    pub async fn add_effect(
        &mut self,
        host: &dyn PluginHost,
        graph: &mut dyn AudioGraph,
        descriptor: &PluginDescriptor,
        name: &str,
    ) -> Result<PluginHandle, Error> {
        if self.effects.len() >= MAX_EFFECTS {
            return Err(Error::CapacityExceeded);
        }
        let handle = host.instantiate(descriptor).await?;
        let position = self.effects.len();
        self.insert_effect(graph, position, EffectSlot::new(handle.clone(), name, false))?;
        Ok(handle)
    }

    /// Inserts an already instantiated effect. `position` is clamped to the chain length.
    pub fn insert_effect(
        &mut self,
        graph: &mut dyn AudioGraph,
        position: usize,
        slot: EffectSlot,
    ) -> Result<(), Error> {
        if self.effects.len() >= MAX_EFFECTS {
            return Err(Error::CapacityExceeded);
        }
        graph.attach(GraphNode::Plugin(slot.handle.clone()))?;
        let position = position.min(self.effects.len());
        debug!("Effect {} inserted at {position}", slot.descriptor);
        self.effects.insert(position, slot);
        self.rebuild_chain(graph)
    }

    pub fn remove_effect(
        &mut self,
        graph: &mut dyn AudioGraph,
        index: usize,
    ) -> Result<EffectSlot, Error> {
        if index >= self.effects.len() {
            return Err(Error::InvalidSlot(index));
        }
        let slot = self.effects.remove(index);
        let node = slot.handle.node();
        graph.disconnect_all_outputs(node)?;
        graph.detach(node)?;
        self.rebuild_chain(graph)?;
        Ok(slot)
    }

    pub fn set_effect_bypass(&mut self, index: usize, bypass: bool) -> Result<(), Error> {
        let slot = self
            .effects
            .get_mut(index)
            .ok_or(Error::InvalidSlot(index))?;
        slot.bypassed = bypass;
        slot.handle.set_bypass(bypass);
        Ok(())
    }

    /// Drops every edge of the chain and reconnects it in slot order.
    pub fn rebuild_chain(&mut self, graph: &mut dyn AudioGraph) -> Result<(), Error> {
        let format = graph.canonical_output_format();
        for node in self.plugin_nodes() {
            graph.disconnect_all_outputs(node)?;
        }
        graph.disconnect_all_inputs(self.mixer.id())?;

        let Some(instrument) = &self.instrument else {
            return Ok(());
        };
        let mut prev = instrument.handle.node();
        for effect in &self.effects {
            let node = effect.handle.node();
            graph.connect(prev, node, format)?;
            prev = node;
        }
        graph.connect(prev, self.mixer.id(), format)?;
        Ok(())
    }

    /// Detaches every node of the chain, the mixer included.
    pub fn teardown(&mut self, graph: &mut dyn AudioGraph) -> Result<(), Error> {
        let mut result = Ok(());
        let nodes: Vec<NodeId> = self.plugin_nodes().chain([self.mixer.id()]).collect();
        self.instrument = None;
        self.effects.clear();
        for node in nodes {
            if let Err(e) = graph.detach(node) {
                warn!("Failed to detach {node}: {e}");
                result = Err(e.into());
            }
        }
        result
    }

    pub fn send_midi(&self, message: &Message) {
        if let Some(instrument) = &self.instrument {
            let (status, data1, data2) = message.encode();
            instrument
                .handle
                .schedule_midi_event(status, data1, data2, 0);
        }
    }

    pub fn snapshot(&self) -> (Option<PluginConfig>, Vec<PluginConfig>) {
        let instrument = self.instrument.as_ref().map(|slot| PluginConfig {
            descriptor: slot.descriptor.clone(),
            name: slot.name.clone(),
            state: slot.handle.full_state(),
            bypassed: false,
        });
        let effects = self
            .effects
            .iter()
            .map(|slot| PluginConfig {
                descriptor: slot.descriptor.clone(),
                name: slot.name.clone(),
                state: slot.handle.full_state(),
                bypassed: slot.bypassed,
            })
            .collect();
        (instrument, effects)
    }

    pub async fn open_editor(&self, slot: SlotRef) -> Result<Option<ViewHandle>, Error> {
        let handle = match slot {
            SlotRef::Instrument => self.instrument.as_ref().map(|s| &s.handle),
            SlotRef::Effect(index) => self.effects.get(index).map(|s| &s.handle),
        };
        match handle {
            Some(handle) => Ok(handle.request_editor_view().await),
            None => Err(Error::EmptySlot(slot)),
        }
    }

    fn plugin_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.instrument
            .iter()
            .map(|slot| slot.handle.node())
            .chain(self.effects.iter().map(|slot| slot.handle.node()))
    }
}
