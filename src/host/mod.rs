//! Bridge to hosted audio plugins.
//!
//! The engine only ever talks to plugins through [`Plugin`] and creates them
//! through a [`PluginHost`]. The built-in host provides a SoundFont player and a
//! gain stage; other hosts can be plugged in behind the same traits.

pub mod builtin;
#[cfg(test)]
pub mod testing;

use std::{error, fmt, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::audio::graph::NodeId;

pub use builtin::BuiltinHost;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PluginKind {
    Instrument,
    Effect,
}

/// Identifies a plugin to its host. The fields are opaque to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub kind: PluginKind,
    pub subtype: String,
    pub manufacturer: String,
}

impl PluginDescriptor {
    pub fn instrument(subtype: &str, manufacturer: &str) -> Self {
        Self {
            kind: PluginKind::Instrument,
            subtype: subtype.into(),
            manufacturer: manufacturer.into(),
        }
    }

    pub fn effect(subtype: &str, manufacturer: &str) -> Self {
        Self {
            kind: PluginKind::Effect,
            subtype: subtype.into(),
            manufacturer: manufacturer.into(),
        }
    }
}

impl fmt::Display for PluginDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind = match self.kind {
            PluginKind::Instrument => "instrument",
            PluginKind::Effect => "effect",
        };
        write!(f, "{kind}/{}/{}", self.subtype, self.manufacturer)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MusicalContext {
    pub tempo: f64,
    pub beat_position: f64,
    pub time_sig_numerator: u8,
    pub time_sig_denominator: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportState {
    pub is_playing: bool,
    pub sample_position: u64,
}

pub type MusicalContextProvider = Arc<dyn Fn() -> MusicalContext + Send + Sync>;
pub type TransportStateProvider = Arc<dyn Fn() -> TransportState + Send + Sync>;

/// Editor window handed out by the host. Window management happens elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewHandle {
    pub node: NodeId,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    PluginUnavailable(String),
    InvalidState(String),
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::PluginUnavailable(plugin) => write!(f, "Plugin unavailable: {plugin}"),
            Error::InvalidState(reason) => write!(f, "Invalid plugin state: {reason}"),
        }
    }
}

#[async_trait]
pub trait Plugin: Send + Sync {
    fn node(&self) -> NodeId;

    fn descriptor(&self) -> &PluginDescriptor;

    /// Queues a raw MIDI message. Never blocks, so it is safe on the MIDI path.
    fn schedule_midi_event(&self, status: u8, data1: u8, data2: u8, sample_offset: u32);

    fn set_bypass(&self, bypass: bool);

    fn full_state(&self) -> Vec<u8>;

    /// May block while resources are loaded. Callers on the async runtime go
    /// through `spawn_blocking`.
    fn set_full_state(&self, state: &[u8]) -> Result<(), Error>;

    fn set_musical_context_provider(&self, provider: MusicalContextProvider);

    fn set_transport_state_provider(&self, provider: TransportStateProvider);

    async fn request_editor_view(&self) -> Option<ViewHandle>;

    /// Instruments add their output to the buffers, effects process them in place.
    fn render(&self, lbuf: &mut [f32], rbuf: &mut [f32]);
}

pub type PluginHandle = Arc<dyn Plugin>;

#[async_trait]
pub trait PluginHost: Send + Sync {
    async fn instantiate(&self, descriptor: &PluginDescriptor) -> Result<PluginHandle, Error>;
}

pub type SharedHost = Arc<dyn PluginHost>;

/// Applies saved state on the blocking pool.
pub async fn restore_state(plugin: PluginHandle, state: Vec<u8>) -> Result<(), Error> {
    if state.is_empty() {
        return Ok(());
    }
    tokio::task::spawn_blocking(move || plugin.set_full_state(&state))
        .await
        .map_err(|e| Error::InvalidState(e.to_string()))?
}
