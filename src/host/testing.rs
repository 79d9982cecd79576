use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;

use super::*;

/// Scriptable host: records what plugins receive and fails or delays chosen descriptors.
#[derive(Default)]
pub struct TestHost {
    failing: Vec<PluginDescriptor>,
    delays: HashMap<PluginDescriptor, Duration>,
    instances: Mutex<Vec<Arc<TestPlugin>>>,
}

impl TestHost {
    pub fn failing(mut self, descriptor: PluginDescriptor) -> Self {
        self.failing.push(descriptor);
        self
    }

    pub fn delayed(mut self, descriptor: PluginDescriptor, millis: u64) -> Self {
        self.delays.insert(descriptor, Duration::from_millis(millis));
        self
    }

    pub fn plugin(&self, node: NodeId) -> Option<Arc<TestPlugin>> {
        self.instances
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.node == node)
            .cloned()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.lock().unwrap().len()
    }
}

#[async_trait]
impl PluginHost for TestHost {
    async fn instantiate(&self, descriptor: &PluginDescriptor) -> Result<PluginHandle, Error> {
        if let Some(delay) = self.delays.get(descriptor) {
            tokio::time::sleep(*delay).await;
        }
        if self.failing.contains(descriptor) {
            return Err(Error::PluginUnavailable(descriptor.to_string()));
        }
        let plugin = Arc::new(TestPlugin {
            node: NodeId::allocate(),
            descriptor: descriptor.clone(),
            midi: Default::default(),
            bypassed: AtomicBool::new(false),
            state: Default::default(),
            has_providers: AtomicBool::new(false),
        });
        self.instances.lock().unwrap().push(Arc::clone(&plugin));
        Ok(plugin)
    }
}

pub struct TestPlugin {
    pub node: NodeId,
    pub descriptor: PluginDescriptor,
    pub midi: Mutex<Vec<(u8, u8, u8)>>,
    pub bypassed: AtomicBool,
    pub state: Mutex<Vec<u8>>,
    pub has_providers: AtomicBool,
}

impl TestPlugin {
    pub fn midi(&self) -> Vec<(u8, u8, u8)> {
        self.midi.lock().unwrap().clone()
    }

    /// Notes that got a note-on and no note-off yet, in arrival order.
    pub fn sounding_notes(&self) -> Vec<u8> {
        let mut notes = vec![];
        for (status, note, velocity) in self.midi() {
            match status & 0xF0 {
                0x90 if velocity > 0 => notes.push(note),
                0x80 | 0x90 => {
                    if let Some(pos) = notes.iter().position(|n| *n == note) {
                        notes.remove(pos);
                    }
                }
                _ => {}
            }
        }
        notes
    }

    pub fn is_bypassed(&self) -> bool {
        self.bypassed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Plugin for TestPlugin {
    fn node(&self) -> NodeId {
        self.node
    }

    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    fn schedule_midi_event(&self, status: u8, data1: u8, data2: u8, _: u32) {
        self.midi.lock().unwrap().push((status, data1, data2));
    }

    fn set_bypass(&self, bypass: bool) {
        self.bypassed.store(bypass, Ordering::Relaxed);
    }

    fn full_state(&self) -> Vec<u8> {
        self.state.lock().unwrap().clone()
    }

    fn set_full_state(&self, state: &[u8]) -> Result<(), Error> {
        *self.state.lock().unwrap() = state.to_vec();
        Ok(())
    }

    fn set_musical_context_provider(&self, _: MusicalContextProvider) {
        self.has_providers.store(true, Ordering::Relaxed);
    }

    fn set_transport_state_provider(&self, _: TransportStateProvider) {
        self.has_providers.store(true, Ordering::Relaxed);
    }

    async fn request_editor_view(&self) -> Option<ViewHandle> {
        Some(ViewHandle {
            node: self.node,
            title: self.descriptor.to_string(),
        })
    }

    fn render(&self, lbuf: &mut [f32], rbuf: &mut [f32]) {
        if self.descriptor.kind == PluginKind::Instrument {
            lbuf.iter_mut().for_each(|x| *x += 1.0);
            rbuf.iter_mut().for_each(|x| *x += 1.0);
        }
    }
}
