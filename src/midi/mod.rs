mod msg;
mod packet;
mod reader;

use std::{
    collections::hash_map::DefaultHasher,
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};

pub use msg::Message;
pub use msg::MessageKind;
pub use msg::CC_ALL_NOTES_OFF;
pub use packet::Packets;
pub use reader::MidiReader;
use tokio::sync::mpsc;

pub type Sender = mpsc::UnboundedSender<MidiEvent>;
pub type Receiver = mpsc::UnboundedReceiver<MidiEvent>;

/// Unbounded so the driver thread never blocks and no note-off is ever lost.
pub fn create_channel() -> (Sender, Receiver) {
    mpsc::unbounded_channel()
}

/// Name of an input port, hashed once when the port is connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    name: Arc<str>,
    hash: u64,
}

impl Source {
    pub fn new(name: &str) -> Self {
        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self {
            name: name.into(),
            hash: hasher.finish(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hash_value(&self) -> u64 {
        self.hash
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidiEvent {
    pub source: Source,
    pub message: Message,
}

impl MidiEvent {
    pub fn new(source: &Source, message: Message) -> Self {
        Self {
            source: source.clone(),
            message,
        }
    }
}

/// Decodes one driver packet and forwards every message it contains.
pub fn dispatch_packet(source: &Source, bytes: &[u8], tx: &Sender) {
    for message in Packets::new(bytes) {
        _ = tx.send(MidiEvent::new(source, message));
    }
}
