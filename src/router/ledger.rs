use std::collections::HashMap;

use crate::{channel::ChannelId, midi::Source};

/// Identity of an input note: source, MIDI channel and note number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NoteKey(u64);

impl NoteKey {
    pub fn new(source: &Source, channel: u8, note: u8) -> Self {
        Self(source.hash_value() ^ (((channel & 0x0F) as u64) << 8) ^ note as u64)
    }
}

/// Output notes sent per channel for one input note.
pub type Dispatch = Vec<(ChannelId, Vec<u8>)>;

/// What was actually played for every held input note. Releases read from
/// here and never recompute notes from current settings.
#[derive(Debug, Default)]
pub struct Ledger {
    entries: HashMap<NoteKey, Dispatch>,
}

impl Ledger {
    /// Stores the dispatch, handing back an older entry under the same key.
    pub fn record(&mut self, key: NoteKey, dispatch: Dispatch) -> Option<Dispatch> {
        if dispatch.is_empty() {
            return self.entries.remove(&key);
        }
        self.entries.insert(key, dispatch)
    }

    pub fn take(&mut self, key: NoteKey) -> Option<Dispatch> {
        self.entries.remove(&key)
    }

    /// Forgets everything sent to `channel`.
    pub fn clear_channel(&mut self, channel: ChannelId) {
        self.entries.retain(|_, dispatch| {
            dispatch.retain(|(id, _)| *id != channel);
            !dispatch.is_empty()
        });
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_differ_by_source_channel_and_note() {
        let keylab = Source::new("KeyLab");
        let key = NoteKey::new(&keylab, 0, 60);
        assert_eq!(key, NoteKey::new(&Source::new("KeyLab"), 0, 60));
        assert_ne!(key, NoteKey::new(&keylab, 1, 60));
        assert_ne!(key, NoteKey::new(&keylab, 0, 61));
        assert_ne!(key, NoteKey::new(&Source::new("Pads"), 0, 60));
    }

    #[test]
    fn take_consumes_entry() {
        let mut ledger = Ledger::default();
        let key = NoteKey::new(&Source::new("KeyLab"), 0, 60);
        assert_eq!(ledger.record(key, vec![(ChannelId(1), vec![60, 72])]), None);
        assert_eq!(ledger.take(key), Some(vec![(ChannelId(1), vec![60, 72])]));
        assert_eq!(ledger.take(key), None);
    }

    #[test]
    fn clear_channel_keeps_other_channels() {
        let mut ledger = Ledger::default();
        let source = Source::new("KeyLab");
        let a = NoteKey::new(&source, 0, 60);
        let b = NoteKey::new(&source, 0, 62);
        ledger.record(a, vec![(ChannelId(1), vec![60]), (ChannelId(2), vec![60])]);
        ledger.record(b, vec![(ChannelId(1), vec![62])]);
        ledger.clear_channel(ChannelId(1));
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.take(a), Some(vec![(ChannelId(2), vec![60])]));
        assert!(ledger.is_empty());
    }
}
