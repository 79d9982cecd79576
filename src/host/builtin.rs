use std::{
    fs::File,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use rustysynth::{SoundFont, Synthesizer, SynthesizerSettings};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{
    Error, MusicalContextProvider, Plugin, PluginDescriptor, PluginHandle, PluginHost,
    PluginKind, TransportStateProvider, ViewHandle,
};
use crate::audio::{self, graph::NodeId, AtomicF32};

pub const MANUFACTURER: &str = "Srak";
pub const SF2_SUBTYPE: &str = "sf2 ";
pub const GAIN_SUBTYPE: &str = "gain";

const MIDI_QUEUE_LEN: usize = 256;
const MAX_POLYPHONY: usize = 64;

/// Host for the plugins that ship with the rack.
pub struct BuiltinHost {
    sample_rate: u32,
}

impl BuiltinHost {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }

    pub fn sf2() -> PluginDescriptor {
        PluginDescriptor::instrument(SF2_SUBTYPE, MANUFACTURER)
    }

    pub fn gain() -> PluginDescriptor {
        PluginDescriptor::effect(GAIN_SUBTYPE, MANUFACTURER)
    }
}

#[async_trait]
impl PluginHost for BuiltinHost {
    async fn instantiate(&self, descriptor: &PluginDescriptor) -> Result<PluginHandle, Error> {
        if descriptor.manufacturer != MANUFACTURER {
            return Err(Error::PluginUnavailable(descriptor.to_string()));
        }
        let handle: PluginHandle = match (descriptor.kind, descriptor.subtype.as_str()) {
            (PluginKind::Instrument, SF2_SUBTYPE) => {
                Arc::new(Sf2Instrument::new(descriptor.clone(), self.sample_rate))
            }
            (PluginKind::Effect, GAIN_SUBTYPE) => Arc::new(GainEffect::new(descriptor.clone())),
            _ => return Err(Error::PluginUnavailable(descriptor.to_string())),
        };
        debug!("Instantiated {descriptor} as {}", handle.node());
        Ok(handle)
    }
}

#[derive(Default)]
struct Providers {
    musical: Mutex<Option<MusicalContextProvider>>,
    transport: Mutex<Option<TransportStateProvider>>,
}

impl Providers {
    fn set_musical(&self, provider: MusicalContextProvider) {
        if let Ok(mut slot) = self.musical.lock() {
            *slot = Some(provider);
        }
    }

    fn set_transport(&self, provider: TransportStateProvider) {
        if let Ok(mut slot) = self.transport.lock() {
            *slot = Some(provider);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sf2State {
    pub soundfont: Option<PathBuf>,
    pub bank: u16,
    pub preset: u8,
}

struct Sf2Voice {
    synth: Option<Synthesizer>,
    midi_rx: mpsc::Receiver<(u8, u8, u8)>,
    tmp_lbuf: Vec<f32>,
    tmp_rbuf: Vec<f32>,
}

/// SoundFont player. MIDI is queued without blocking and drained by the renderer.
pub struct Sf2Instrument {
    node: NodeId,
    descriptor: PluginDescriptor,
    sample_rate: u32,
    bypassed: AtomicBool,
    midi_tx: mpsc::Sender<(u8, u8, u8)>,
    /// Set when an event was dropped. Lost releases are repaired on the next drain.
    overflowed: AtomicBool,
    voice: Mutex<Sf2Voice>,
    state: Mutex<Sf2State>,
    providers: Providers,
}

impl Sf2Instrument {
    fn new(descriptor: PluginDescriptor, sample_rate: u32) -> Self {
        let (midi_tx, midi_rx) = mpsc::channel(MIDI_QUEUE_LEN);
        Self {
            node: NodeId::allocate(),
            descriptor,
            sample_rate,
            bypassed: AtomicBool::new(false),
            midi_tx,
            overflowed: AtomicBool::new(false),
            voice: Mutex::new(Sf2Voice {
                synth: None,
                midi_rx,
                tmp_lbuf: vec![],
                tmp_rbuf: vec![],
            }),
            state: Default::default(),
            providers: Default::default(),
        }
    }

    fn create_synth(&self, state: &mut Sf2State) -> Result<Option<Synthesizer>, Error> {
        let Some(path) = &state.soundfont else {
            return Ok(None);
        };
        let invalid = |e: &dyn std::fmt::Display| Error::InvalidState(format!("{path:?}: {e}"));
        let mut sf2 = File::open(path).map_err(|e| invalid(&e))?;
        let sound_font = Arc::new(SoundFont::new(&mut sf2).map_err(|e| invalid(&e))?);
        let mut settings = SynthesizerSettings::new(self.sample_rate as i32);
        settings.maximum_polyphony = MAX_POLYPHONY;
        let mut synth = Synthesizer::new(&sound_font, &settings).map_err(|e| invalid(&e))?;

        let available = |bank: u16, preset: u8| {
            sound_font.get_presets().iter().any(|p| {
                p.get_bank_number() == bank as i32 && p.get_patch_number() == preset as i32
            })
        };
        if !available(state.bank, state.preset) {
            if let Some(first) = sound_font.get_presets().first() {
                state.bank = first.get_bank_number() as u16;
                state.preset = first.get_patch_number() as u8;
            }
        }
        synth.process_midi_message(0, 0xB0, 0x00, state.bank as i32);
        synth.process_midi_message(0, 0xC0, state.preset as i32, 0x00);
        info!(
            "SoundFont loaded: {path:?} (bank {}, preset {})",
            state.bank, state.preset
        );
        Ok(Some(synth))
    }
}

#[async_trait]
impl Plugin for Sf2Instrument {
    fn node(&self) -> NodeId {
        self.node
    }

    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    fn schedule_midi_event(&self, status: u8, data1: u8, data2: u8, _: u32) {
        if self.midi_tx.try_send((status, data1, data2)).is_err()
            && !self.overflowed.swap(true, Ordering::Relaxed)
        {
            warn!(
                "MIDI queue of {} is full, events are dropped until it drains",
                self.node
            );
        }
    }

    fn set_bypass(&self, bypass: bool) {
        self.bypassed.store(bypass, Ordering::Relaxed);
    }

    fn full_state(&self) -> Vec<u8> {
        self.state
            .lock()
            .ok()
            .and_then(|state| serde_json::to_vec(&*state).ok())
            .unwrap_or_default()
    }

    fn set_full_state(&self, state: &[u8]) -> Result<(), Error> {
        let mut state: Sf2State =
            serde_json::from_slice(state).map_err(|e| Error::InvalidState(e.to_string()))?;
        let synth = self.create_synth(&mut state)?;
        let mut voice = self
            .voice
            .lock()
            .map_err(|e| Error::InvalidState(e.to_string()))?;
        voice.synth = synth;
        if let Ok(mut current) = self.state.lock() {
            *current = state;
        }
        Ok(())
    }

    fn set_musical_context_provider(&self, provider: MusicalContextProvider) {
        self.providers.set_musical(provider);
    }

    fn set_transport_state_provider(&self, provider: TransportStateProvider) {
        self.providers.set_transport(provider);
    }

    async fn request_editor_view(&self) -> Option<ViewHandle> {
        None
    }

    fn render(&self, lbuf: &mut [f32], rbuf: &mut [f32]) {
        let Ok(mut voice) = self.voice.lock() else {
            return;
        };
        let voice = &mut *voice;
        let len = usize::min(lbuf.len(), rbuf.len());
        if voice.tmp_lbuf.len() < len {
            voice.tmp_lbuf.resize(len, 0.0);
            voice.tmp_rbuf.resize(len, 0.0);
        }
        while let Ok((status, data1, data2)) = voice.midi_rx.try_recv() {
            if let Some(synth) = voice.synth.as_mut() {
                synth.process_midi_message(
                    (status & 0x0F) as i32,
                    (status & 0xF0) as i32,
                    data1 as i32,
                    data2 as i32,
                );
            }
        }
        if self.overflowed.swap(false, Ordering::Relaxed) {
            if let Some(synth) = voice.synth.as_mut() {
                synth.note_off_all(false);
            }
        }
        let Some(synth) = voice.synth.as_mut() else {
            return;
        };
        let (tmp_lbuf, tmp_rbuf) = (&mut voice.tmp_lbuf[..len], &mut voice.tmp_rbuf[..len]);
        synth.render(tmp_lbuf, tmp_rbuf);
        if self.bypassed.load(Ordering::Relaxed) {
            return;
        }
        audio::add_buf_to_buf(&mut lbuf[..len], tmp_lbuf);
        audio::add_buf_to_buf(&mut rbuf[..len], tmp_rbuf);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GainState {
    pub gain: f32,
}

/// Utility gain stage.
pub struct GainEffect {
    node: NodeId,
    descriptor: PluginDescriptor,
    gain: AtomicF32,
    bypassed: AtomicBool,
    providers: Providers,
}

impl GainEffect {
    fn new(descriptor: PluginDescriptor) -> Self {
        Self {
            node: NodeId::allocate(),
            descriptor,
            gain: AtomicF32::new(1.0),
            bypassed: AtomicBool::new(false),
            providers: Default::default(),
        }
    }
}

#[async_trait]
impl Plugin for GainEffect {
    fn node(&self) -> NodeId {
        self.node
    }

    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    fn schedule_midi_event(&self, _: u8, _: u8, _: u8, _: u32) {}

    fn set_bypass(&self, bypass: bool) {
        self.bypassed.store(bypass, Ordering::Relaxed);
    }

    fn full_state(&self) -> Vec<u8> {
        serde_json::to_vec(&GainState {
            gain: self.gain.load(),
        })
        .unwrap_or_default()
    }

    fn set_full_state(&self, state: &[u8]) -> Result<(), Error> {
        let state: GainState =
            serde_json::from_slice(state).map_err(|e| Error::InvalidState(e.to_string()))?;
        self.gain.store(state.gain);
        Ok(())
    }

    fn set_musical_context_provider(&self, provider: MusicalContextProvider) {
        self.providers.set_musical(provider);
    }

    fn set_transport_state_provider(&self, provider: TransportStateProvider) {
        self.providers.set_transport(provider);
    }

    async fn request_editor_view(&self) -> Option<ViewHandle> {
        None
    }

    fn render(&self, lbuf: &mut [f32], rbuf: &mut [f32]) {
        if self.bypassed.load(Ordering::Relaxed) {
            return;
        }
        let gain = self.gain.load();
        audio::amplify_buffer(lbuf, gain);
        audio::amplify_buffer(rbuf, gain);
    }
}
