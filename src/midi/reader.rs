use std::{error::Error, fmt};

use midir::MidiInput;
use tracing::{debug, info};

use super::{Sender, Source};

pub type Result<T> = std::result::Result<T, ReaderError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderError {
    ConnectError(String),
    InvalidSlot(usize),
}

impl Error for ReaderError {}

impl fmt::Display for ReaderError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ReaderError::ConnectError(port) => write!(f, "Failed to connect MIDI port: {port}"),
            ReaderError::InvalidSlot(slot) => write!(f, "Invalid slot: {slot}"),
        }
    }
}

/// Owns the open input connections. Each connection's driver callback decodes
/// packets on the driver thread and forwards events tagged with the port name.
pub struct MidiReader {
    connections: Vec<Option<(Source, midir::MidiInputConnection<()>)>>,
    tx: Sender,
}

impl MidiReader {
    pub fn with_slots(tx: Sender, num_of_slots: usize) -> Self {
        let mut connections = vec![];
        connections.resize_with(num_of_slots, || None);
        Self { connections, tx }
    }

    pub fn get_available_ports() -> Vec<String> {
        midir::MidiInput::new("stagerack")
            .map(get_available_ports_of)
            .unwrap_or_else(|_| vec![])
    }

    pub fn connect_input(&mut self, slot: usize, port_name: &str) -> Result<()> {
        let con = self
            .connections
            .get_mut(slot)
            .ok_or(ReaderError::InvalidSlot(slot))?;
        let connect_error = || ReaderError::ConnectError(port_name.to_owned());
        let midi_in = midir::MidiInput::new("stagerack").map_err(|_| connect_error())?;
        let index = get_port_index(&midi_in, port_name).ok_or_else(connect_error)?;
        let source = Source::new(port_name);
        let conn = connect_midi_in_to_port(midi_in, index, source.clone(), self.tx.clone())
            .ok_or_else(connect_error)?;
        info!("MIDI input connected: {port_name} (slot {slot})");
        *con = Some((source, conn));
        Ok(())
    }

    /// Connects to the first free slot.
    pub fn connect_next(&mut self, port_name: &str) -> Result<usize> {
        let slot = self
            .connections
            .iter()
            .position(Option::is_none)
            .ok_or(ReaderError::InvalidSlot(self.connections.len()))?;
        self.connect_input(slot, port_name)?;
        Ok(slot)
    }

    pub fn disconnect_input(&mut self, slot: usize) -> Result<()> {
        let con = self
            .connections
            .get_mut(slot)
            .ok_or(ReaderError::InvalidSlot(slot))?;
        if let Some((source, _)) = con.take() {
            debug!("MIDI input disconnected: {source}");
        }
        Ok(())
    }

    pub fn connected_input_names(&self) -> Vec<Option<String>> {
        self.connections
            .iter()
            .map(|opt| opt.as_ref().map(|(s, _)| s.name().to_owned()))
            .collect()
    }
}

fn get_available_ports_of(midi_in: MidiInput) -> Vec<String> {
    midi_in
        .ports()
        .iter()
        .filter_map(|port| midi_in.port_name(port).ok())
        .collect()
}

fn get_port_index(midi_in: &MidiInput, port_name: &str) -> Option<usize> {
    midi_in.ports().iter().position(|port| {
        if let Ok(name) = midi_in.port_name(port) {
            name == port_name
        } else {
            false
        }
    })
}

fn connect_midi_in_to_port(
    midi_in: MidiInput,
    port_index: usize,
    source: Source,
    tx: Sender,
) -> Option<midir::MidiInputConnection<()>> {
    let ports = midi_in.ports();
    let port = ports.get(port_index)?;
    midi_in
        .connect(
            port,
            "stagerack-in",
            move |_, bytes, _| super::dispatch_packet(&source, bytes, &tx),
            (),
        )
        .ok()
}
