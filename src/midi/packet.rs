use std::iter::FusedIterator;

use tracing::trace;

use super::Message;

/// Lazily decodes every channel voice message in one driver packet.
///
/// Running status is honoured, realtime bytes interleaved anywhere are skipped,
/// sysex and system common messages are stepped over. A truncated trailing
/// message ends the sequence.
pub struct Packets<'a> {
    bytes: &'a [u8],
    pos: usize,
    running_status: Option<u8>,
}

impl<'a> Packets<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            pos: 0,
            running_status: None,
        }
    }

    fn skip_sysex(&mut self) {
        self.running_status = None;
        match self.bytes[self.pos..].iter().position(|b| *b == 0xF7) {
            Some(offset) => self.pos += offset + 1,
            None => self.pos = self.bytes.len(),
        }
    }

    fn skip_system_common(&mut self) {
        self.running_status = None;
        self.pos += 1;
        while self.pos < self.bytes.len() && self.bytes[self.pos] & 0x80 == 0 {
            self.pos += 1;
        }
    }
}

impl Iterator for Packets<'_> {
    type Item = Message;

    fn next(&mut self) -> Option<Message> {
        while self.pos < self.bytes.len() {
            let byte = self.bytes[self.pos];

            if byte >= 0xF8 {
                self.pos += 1;
                continue;
            }
            if byte == 0xF0 {
                self.skip_sysex();
                continue;
            }
            if byte >= 0xF0 {
                self.skip_system_common();
                continue;
            }

            let (status, start) = if byte & 0x80 != 0 {
                self.running_status = Some(byte);
                (byte, self.pos + 1)
            } else if let Some(status) = self.running_status {
                (status, self.pos)
            } else {
                trace!("Dropping stray MIDI data byte {byte:#04x}");
                self.pos += 1;
                continue;
            };

            let len = Message::data_len(status).unwrap_or(0);
            let mut buf = [status, 0, 0];
            let mut filled = 0;
            let mut cursor = start;
            while filled < len && cursor < self.bytes.len() {
                let data = self.bytes[cursor];
                if data >= 0xF8 {
                    cursor += 1;
                    continue;
                }
                if data & 0x80 != 0 {
                    break;
                }
                buf[1 + filled] = data;
                filled += 1;
                cursor += 1;
            }
            self.pos = cursor;

            if filled < len {
                trace!("Dropping truncated MIDI message with status {status:#04x}");
                continue;
            }

            match Message::decode(&buf[..=len]) {
                Some(message) => return Some(message),
                None => trace!("Dropping malformed MIDI message {:?}", &buf[..=len]),
            }
        }
        None
    }
}

impl FusedIterator for Packets<'_> {}
