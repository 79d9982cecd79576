use std::{
    error::Error,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use serde::{Deserialize, Serialize};

use super::AtomicF32;
use crate::host::PluginHandle;

const MAX_CHAIN_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    pub fn allocate() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Format {
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for Format {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            channels: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    NotAttached(NodeId),
    AlreadyAttached(NodeId),
    PortInUse(NodeId),
    FormatMismatch { expected: Format, got: Format },
    Unavailable,
}

impl Error for GraphError {}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            GraphError::NotAttached(id) => write!(f, "Node {id} is not attached"),
            GraphError::AlreadyAttached(id) => write!(f, "Node {id} is already attached"),
            GraphError::PortInUse(id) => write!(f, "Node {id} is already connected"),
            GraphError::FormatMismatch { expected, got } => write!(
                f,
                "Format mismatch: expected {}Hz/{}ch, got {}Hz/{}ch",
                expected.sample_rate, expected.channels, got.sample_rate, got.channels
            ),
            GraphError::Unavailable => write!(f, "Audio graph is unavailable."),
        }
    }
}

/// Fader state of one channel. Written by the control and MIDI paths, read by the renderer.
#[derive(Debug)]
pub struct MixerParams {
    volume: AtomicF32,
    pan: AtomicF32,
    muted: AtomicBool,
    soloed: AtomicBool,
    peak: AtomicF32,
}

impl MixerParams {
    pub fn volume(&self) -> f32 {
        self.volume.load()
    }

    pub fn set_volume(&self, volume: f32) {
        self.volume.store(volume)
    }

    pub fn pan(&self) -> f32 {
        self.pan.load()
    }

    pub fn set_pan(&self, pan: f32) {
        self.pan.store(pan)
    }

    pub fn muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed)
    }

    pub fn soloed(&self) -> bool {
        self.soloed.load(Ordering::Relaxed)
    }

    pub fn set_soloed(&self, soloed: bool) {
        self.soloed.store(soloed, Ordering::Relaxed)
    }

    pub fn peak(&self) -> f32 {
        self.peak.load()
    }

    fn gains(&self, any_solo: bool) -> (f32, f32) {
        if self.muted() || (any_solo && !self.soloed()) {
            return (0.0, 0.0);
        }
        let volume = self.volume();
        let pan = self.pan().clamp(-1.0, 1.0);
        (volume * (1.0 - pan).min(1.0), volume * (1.0 + pan).min(1.0))
    }
}

impl Default for MixerParams {
    fn default() -> Self {
        Self {
            volume: AtomicF32::new(1.0),
            pan: AtomicF32::new(0.0),
            muted: AtomicBool::new(false),
            soloed: AtomicBool::new(false),
            peak: AtomicF32::new(0.0),
        }
    }
}

/// The output bus a channel's chain ends in.
#[derive(Debug, Clone)]
pub struct MixerNode {
    id: NodeId,
    params: Arc<MixerParams>,
}

impl MixerNode {
    pub fn new() -> Self {
        Self {
            id: NodeId::allocate(),
            params: Default::default(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn params(&self) -> &MixerParams {
        &self.params
    }
}

impl Default for MixerNode {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub enum GraphNode {
    Plugin(PluginHandle),
    Mixer(MixerNode),
}

impl GraphNode {
    pub fn id(&self) -> NodeId {
        match self {
            GraphNode::Plugin(handle) => handle.node(),
            GraphNode::Mixer(mixer) => mixer.id(),
        }
    }
}

/// Topology primitives of the audio engine. Every mutation reports failure explicitly.
pub trait AudioGraph: Send {
    fn attach(&mut self, node: GraphNode) -> Result<(), GraphError>;
    fn detach(&mut self, node: NodeId) -> Result<(), GraphError>;
    fn connect(&mut self, src: NodeId, dst: NodeId, format: Format) -> Result<(), GraphError>;
    fn disconnect_all_outputs(&mut self, node: NodeId) -> Result<(), GraphError>;
    fn disconnect_all_inputs(&mut self, node: NodeId) -> Result<(), GraphError>;
    fn canonical_output_format(&self) -> Format;
}

#[derive(Debug)]
pub struct MasterBus {
    volume: AtomicF32,
}

impl MasterBus {
    pub fn volume(&self) -> f32 {
        self.volume.load()
    }

    pub fn set_volume(&self, volume: f32) {
        self.volume.store(volume)
    }
}

impl Default for MasterBus {
    fn default() -> Self {
        Self {
            volume: AtomicF32::new(1.0),
        }
    }
}

#[derive(Default)]
struct GraphState {
    nodes: Vec<GraphNode>,
    edges: Vec<(NodeId, NodeId)>,
    chain: Vec<NodeId>,
    tmp_lbuf: Vec<f32>,
    tmp_rbuf: Vec<f32>,
}

impl GraphState {
    fn is_attached(&self, id: NodeId) -> bool {
        self.nodes.iter().any(|node| node.id() == id)
    }

    fn ensure_attached(&self, id: NodeId) -> Result<(), GraphError> {
        if self.is_attached(id) {
            Ok(())
        } else {
            Err(GraphError::NotAttached(id))
        }
    }

    fn input_of(&self, id: NodeId) -> Option<NodeId> {
        self.edges
            .iter()
            .find(|(_, dst)| *dst == id)
            .map(|(src, _)| *src)
    }

    fn plugin(&self, id: NodeId) -> Option<&PluginHandle> {
        self.nodes.iter().find_map(|node| match node {
            GraphNode::Plugin(handle) if handle.node() == id => Some(handle),
            _ => None,
        })
    }

    fn resize_buffers(&mut self, min_size: usize) {
        if self.tmp_lbuf.len() < min_size {
            self.tmp_lbuf.resize(min_size, 0.0);
            self.tmp_rbuf.resize(min_size, 0.0);
        }
    }

    fn render(&mut self, master: &MasterBus, lbuf: &mut [f32], rbuf: &mut [f32]) {
        lbuf.fill(0.0);
        rbuf.fill(0.0);
        let len = usize::min(lbuf.len(), rbuf.len());
        self.resize_buffers(len);

        let any_solo = self.nodes.iter().any(|node| match node {
            GraphNode::Mixer(mixer) => mixer.params().soloed(),
            _ => false,
        });

        for index in 0..self.nodes.len() {
            let GraphNode::Mixer(mixer) = &self.nodes[index] else {
                continue;
            };
            let mixer = mixer.clone();

            self.chain.clear();
            let mut cursor = mixer.id();
            while let Some(src) = self.input_of(cursor) {
                if self.chain.len() >= MAX_CHAIN_LEN {
                    break;
                }
                self.chain.push(src);
                cursor = src;
            }
            if self.chain.is_empty() {
                mixer.params.peak.store(0.0);
                continue;
            }

            let mut tmp_lbuf = std::mem::take(&mut self.tmp_lbuf);
            let mut tmp_rbuf = std::mem::take(&mut self.tmp_rbuf);
            let (l, r) = (&mut tmp_lbuf[..len], &mut tmp_rbuf[..len]);
            l.fill(0.0);
            r.fill(0.0);
            for id in self.chain.iter().rev() {
                if let Some(plugin) = self.plugin(*id) {
                    plugin.render(l, r);
                }
            }

            let (lgain, rgain) = mixer.params.gains(any_solo);
            super::amplify_buffer(l, lgain);
            super::amplify_buffer(r, rgain);
            mixer
                .params
                .peak
                .store(f32::max(super::peak(l), super::peak(r)));
            super::add_buf_to_buf(&mut lbuf[..len], l);
            super::add_buf_to_buf(&mut rbuf[..len], r);
            self.tmp_lbuf = tmp_lbuf;
            self.tmp_rbuf = tmp_rbuf;
        }

        let master_volume = master.volume();
        super::amplify_buffer(lbuf, master_volume);
        super::amplify_buffer(rbuf, master_volume);
    }
}

/// The engine's graph. Cloned handles share one topology, so the control path can
/// edit it while the render thread pulls audio through it.
#[derive(Clone)]
pub struct RenderGraph {
    state: Arc<Mutex<GraphState>>,
    master: Arc<MasterBus>,
    format: Format,
}

impl RenderGraph {
    pub fn new(format: Format, master: Arc<MasterBus>) -> Self {
        Self {
            state: Default::default(),
            master,
            format,
        }
    }

    pub fn render(&self, lbuf: &mut [f32], rbuf: &mut [f32]) {
        match self.state.lock() {
            Ok(mut state) => state.render(&self.master, lbuf, rbuf),
            Err(_) => {
                lbuf.fill(0.0);
                rbuf.fill(0.0);
            }
        }
    }

    fn with_state<T>(
        &self,
        f: impl FnOnce(&mut GraphState) -> Result<T, GraphError>,
    ) -> Result<T, GraphError> {
        let mut state = self.state.lock().map_err(|_| GraphError::Unavailable)?;
        f(&mut state)
    }
}

impl AudioGraph for RenderGraph {
    fn attach(&mut self, node: GraphNode) -> Result<(), GraphError> {
        self.with_state(|state| {
            if state.is_attached(node.id()) {
                return Err(GraphError::AlreadyAttached(node.id()));
            }
            state.nodes.push(node);
            Ok(())
        })
    }

    fn detach(&mut self, node: NodeId) -> Result<(), GraphError> {
        self.with_state(|state| {
            state.ensure_attached(node)?;
            state.nodes.retain(|n| n.id() != node);
            state.edges.retain(|(src, dst)| *src != node && *dst != node);
            Ok(())
        })
    }

    fn connect(&mut self, src: NodeId, dst: NodeId, format: Format) -> Result<(), GraphError> {
        let expected = self.format;
        self.with_state(|state| {
            state.ensure_attached(src)?;
            state.ensure_attached(dst)?;
            if format != expected {
                return Err(GraphError::FormatMismatch {
                    expected,
                    got: format,
                });
            }
            if state.edges.iter().any(|(s, _)| *s == src) {
                return Err(GraphError::PortInUse(src));
            }
            if state.edges.iter().any(|(_, d)| *d == dst) {
                return Err(GraphError::PortInUse(dst));
            }
            state.edges.push((src, dst));
            Ok(())
        })
    }

    fn disconnect_all_outputs(&mut self, node: NodeId) -> Result<(), GraphError> {
        self.with_state(|state| {
            state.ensure_attached(node)?;
            state.edges.retain(|(src, _)| *src != node);
            Ok(())
        })
    }

    fn disconnect_all_inputs(&mut self, node: NodeId) -> Result<(), GraphError> {
        self.with_state(|state| {
            state.ensure_attached(node)?;
            state.edges.retain(|(_, dst)| *dst != node);
            Ok(())
        })
    }

    fn canonical_output_format(&self) -> Format {
        self.format
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;

    /// Graph double that keeps the topology and can be told to fail connections.
    #[derive(Default)]
    pub struct RecordingGraph {
        pub attached: Vec<NodeId>,
        pub edges: Vec<(NodeId, NodeId)>,
        pub fail_connect: bool,
        pub format: Format,
    }

    impl RecordingGraph {
        pub fn input_of(&self, id: NodeId) -> Option<NodeId> {
            self.edges
                .iter()
                .find(|(_, dst)| *dst == id)
                .map(|(src, _)| *src)
        }

        /// Walks back from `end` to the head of its chain.
        pub fn chain_into(&self, end: NodeId) -> Vec<NodeId> {
            let mut chain = vec![];
            let mut cursor = end;
            while let Some(src) = self.input_of(cursor) {
                chain.push(src);
                cursor = src;
            }
            chain.reverse();
            chain
        }
    }

    impl AudioGraph for RecordingGraph {
        fn attach(&mut self, node: GraphNode) -> Result<(), GraphError> {
            if self.attached.contains(&node.id()) {
                return Err(GraphError::AlreadyAttached(node.id()));
            }
            self.attached.push(node.id());
            Ok(())
        }

        fn detach(&mut self, node: NodeId) -> Result<(), GraphError> {
            if !self.attached.contains(&node) {
                return Err(GraphError::NotAttached(node));
            }
            self.attached.retain(|n| *n != node);
            self.edges.retain(|(s, d)| *s != node && *d != node);
            Ok(())
        }

        fn connect(&mut self, src: NodeId, dst: NodeId, _: Format) -> Result<(), GraphError> {
            if self.fail_connect {
                return Err(GraphError::Unavailable);
            }
            for id in [src, dst] {
                if !self.attached.contains(&id) {
                    return Err(GraphError::NotAttached(id));
                }
            }
            self.edges.push((src, dst));
            Ok(())
        }

        fn disconnect_all_outputs(&mut self, node: NodeId) -> Result<(), GraphError> {
            self.edges.retain(|(s, _)| *s != node);
            Ok(())
        }

        fn disconnect_all_inputs(&mut self, node: NodeId) -> Result<(), GraphError> {
            self.edges.retain(|(_, d)| *d != node);
            Ok(())
        }

        fn canonical_output_format(&self) -> Format {
            self.format
        }
    }
}
