use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    Arc,
};

use async_trait::async_trait;
use tracing::trace;

use crate::{
    audio::AtomicF32,
    host::{
        Error, MusicalContext, PluginDescriptor, PluginHandle, PluginHost, SharedHost,
        TransportState,
    },
};

/// Song position and tempo shared with hosted plugins.
#[derive(Debug)]
pub struct Transport {
    sample_rate: u32,
    tempo: AtomicF32,
    playing: AtomicBool,
    sample_position: AtomicU64,
    time_signature: AtomicU32,
}

impl Transport {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            tempo: AtomicF32::new(120.0),
            playing: AtomicBool::new(false),
            sample_position: AtomicU64::new(0),
            time_signature: AtomicU32::new(pack_signature(4, 4)),
        }
    }

    pub fn tempo(&self) -> f32 {
        self.tempo.load()
    }

    pub fn set_tempo(&self, bpm: f32) {
        self.tempo.store(bpm.clamp(20.0, 400.0))
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Relaxed)
    }

    pub fn set_playing(&self, playing: bool) {
        self.playing.store(playing, Ordering::Relaxed)
    }

    pub fn set_time_signature(&self, numerator: u8, denominator: u8) {
        self.time_signature
            .store(pack_signature(numerator, denominator), Ordering::Relaxed)
    }

    pub fn rewind(&self) {
        self.sample_position.store(0, Ordering::Relaxed)
    }

    /// Called by the render thread after each block. Position only moves while playing.
    pub fn advance(&self, frames: u64) {
        if self.is_playing() {
            self.sample_position.fetch_add(frames, Ordering::Relaxed);
        }
    }

    pub fn musical_context(&self) -> MusicalContext {
        let [numerator, denominator, ..] =
            self.time_signature.load(Ordering::Relaxed).to_le_bytes();
        let position = self.sample_position.load(Ordering::Relaxed);
        let seconds = position as f64 / self.sample_rate as f64;
        let tempo = self.tempo() as f64;
        MusicalContext {
            tempo,
            beat_position: seconds * tempo / 60.0,
            time_sig_numerator: numerator,
            time_sig_denominator: denominator,
        }
    }

    pub fn transport_state(&self) -> TransportState {
        TransportState {
            is_playing: self.is_playing(),
            sample_position: self.sample_position.load(Ordering::Relaxed),
        }
    }

    /// Hands both providers to a freshly created plugin.
    pub fn attach(self: &Arc<Self>, plugin: &PluginHandle) {
        let transport = Arc::clone(self);
        plugin.set_musical_context_provider(Arc::new(move || transport.musical_context()));
        let transport = Arc::clone(self);
        plugin.set_transport_state_provider(Arc::new(move || transport.transport_state()));
    }
}

fn pack_signature(numerator: u8, denominator: u8) -> u32 {
    u32::from_le_bytes([numerator.max(1), denominator.max(1), 0, 0])
}

/// Host wrapper that connects every instantiated plugin to the transport.
pub struct TransportHost {
    inner: SharedHost,
    transport: Arc<Transport>,
}

impl TransportHost {
    pub fn new(inner: SharedHost, transport: Arc<Transport>) -> Self {
        Self { inner, transport }
    }
}

#[async_trait]
impl PluginHost for TransportHost {
    async fn instantiate(&self, descriptor: &PluginDescriptor) -> Result<PluginHandle, Error> {
        let plugin = self.inner.instantiate(descriptor).await?;
        self.transport.attach(&plugin);
        trace!("Transport attached to {}", plugin.node());
        Ok(plugin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::testing::TestHost;

    #[test]
    fn position_moves_only_while_playing() {
        let transport = Transport::new(48000);
        transport.advance(480);
        assert_eq!(transport.transport_state().sample_position, 0);

        transport.set_playing(true);
        transport.set_tempo(90.0);
        transport.advance(48000);
        let context = transport.musical_context();
        assert_eq!(context.beat_position, 1.5);
        assert_eq!(
            (context.time_sig_numerator, context.time_sig_denominator),
            (4, 4)
        );

        transport.set_time_signature(7, 8);
        assert_eq!(transport.musical_context().time_sig_numerator, 7);
        transport.rewind();
        assert_eq!(transport.transport_state().sample_position, 0);
    }

    #[tokio::test]
    async fn wrapped_host_attaches_providers() {
        let inner = Arc::new(TestHost::default());
        let host = TransportHost::new(inner.clone(), Arc::new(Transport::new(44100)));
        let plugin = host
            .instantiate(&PluginDescriptor::instrument("synth", "Test"))
            .await
            .unwrap();
        let plugin = inner.plugin(plugin.node()).unwrap();
        assert!(plugin.has_providers.load(Ordering::Relaxed));
    }
}
