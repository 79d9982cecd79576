// Resources:
// https://www.songstuff.com/recording/article/midi_message_format/
// https://www.midi.org/specifications-old/item/table-3-control-change-messages-data-bytes-2

use serde::{Deserialize, Serialize};

pub const CC_ALL_NOTES_OFF: u8 = 123;

#[derive(Debug, Clone, PartialEq, Eq, Copy, Serialize, Deserialize)]
pub enum MessageKind {
    NoteOff { note: u8, velocity: u8 },
    NoteOn { note: u8, velocity: u8 },
    PolyphonicAftertouch { note: u8, pressure: u8 },
    ControlChange { controller: u8, value: u8 },
    ProgramChange { program: u8 },
    ChannelAftertouch { pressure: u8 },
    PitchBend { value: u16 },
}

impl MessageKind {
    pub fn as_number(&self) -> u8 {
        match *self {
            MessageKind::NoteOff { .. } => 0x80,
            MessageKind::NoteOn { .. } => 0x90,
            MessageKind::PolyphonicAftertouch { .. } => 0xA0,
            MessageKind::ControlChange { .. } => 0xB0,
            MessageKind::ProgramChange { .. } => 0xC0,
            MessageKind::ChannelAftertouch { .. } => 0xD0,
            MessageKind::PitchBend { .. } => 0xE0,
        }
    }
}

/// A decoded channel voice message. `channel` is the raw nibble (0..=15).
#[derive(Debug, Clone, PartialEq, Eq, Copy, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    pub channel: u8,
}

impl Message {
    pub fn note_on(channel: u8, note: u8, velocity: u8) -> Self {
        Self {
            kind: MessageKind::NoteOn { note, velocity },
            channel,
        }
    }

    pub fn note_off(channel: u8, note: u8) -> Self {
        Self {
            kind: MessageKind::NoteOff { note, velocity: 0 },
            channel,
        }
    }

    pub fn control_change(channel: u8, controller: u8, value: u8) -> Self {
        Self {
            kind: MessageKind::ControlChange { controller, value },
            channel,
        }
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.is_empty() {
            None
        } else {
            decode_non_empty_message(bytes)
        }
    }

    /// Returns `(status, data1, data2)` as handed to a plugin's scheduling entry point.
    pub fn encode(&self) -> (u8, u8, u8) {
        let status = self.kind.as_number() | (self.channel & 0x0F);
        match self.kind {
            MessageKind::NoteOff { note, velocity } => (status, note, velocity),
            MessageKind::NoteOn { note, velocity } => (status, note, velocity),
            MessageKind::PolyphonicAftertouch { note, pressure } => (status, note, pressure),
            MessageKind::ControlChange { controller, value } => (status, controller, value),
            MessageKind::ProgramChange { program } => (status, program, 0),
            MessageKind::ChannelAftertouch { pressure } => (status, pressure, 0),
            MessageKind::PitchBend { value } => {
                (status, (value & 0x7F) as u8, ((value >> 7) & 0x7F) as u8)
            }
        }
    }

    /// Number of data bytes that follow a status byte, `None` for non channel-voice statuses.
    pub fn data_len(status: u8) -> Option<usize> {
        match status & 0xF0 {
            0x80 | 0x90 | 0xA0 | 0xB0 | 0xE0 => Some(2),
            0xC0 | 0xD0 => Some(1),
            _ => None,
        }
    }
}

fn decode_non_empty_message(bytes: &[u8]) -> Option<Message> {
    let cmd = bytes[0] & 0xF0;
    let channel = bytes[0] & 0x0F;
    if bytes[1..].iter().any(|b| b & 0x80 != 0) {
        return None;
    }
    let kind = match cmd {
        0x80 => parse_note_off(bytes)?,
        0x90 => parse_note_on(bytes)?,
        0xA0 => parse_polyphonic_aftertouch(bytes)?,
        0xB0 => parse_control_change(bytes)?,
        0xC0 => parse_program_change(bytes)?,
        0xD0 => parse_channel_aftertouch(bytes)?,
        0xE0 => parse_pitch_bend(bytes)?,
        _ => None?,
    };
    Some(Message { kind, channel })
}

fn parse_note_on(bytes: &[u8]) -> Option<MessageKind> {
    if bytes.len() < 3 {
        None
    } else {
        let velocity = bytes[2];
        if velocity == 0 {
            Some(MessageKind::NoteOff {
                note: bytes[1],
                velocity,
            })
        } else {
            Some(MessageKind::NoteOn {
                note: bytes[1],
                velocity,
            })
        }
    }
}

fn parse_note_off(bytes: &[u8]) -> Option<MessageKind> {
    if bytes.len() < 3 {
        None
    } else {
        Some(MessageKind::NoteOff {
            note: bytes[1],
            velocity: bytes[2],
        })
    }
}

fn parse_polyphonic_aftertouch(bytes: &[u8]) -> Option<MessageKind> {
    if bytes.len() < 3 {
        None
    } else {
        Some(MessageKind::PolyphonicAftertouch {
            note: bytes[1],
            pressure: bytes[2],
        })
    }
}

fn parse_control_change(bytes: &[u8]) -> Option<MessageKind> {
    if bytes.len() < 3 {
        None
    } else {
        Some(MessageKind::ControlChange {
            controller: bytes[1],
            value: bytes[2],
        })
    }
}

fn parse_program_change(bytes: &[u8]) -> Option<MessageKind> {
    if bytes.len() < 2 {
        None
    } else {
        Some(MessageKind::ProgramChange { program: bytes[1] })
    }
}

fn parse_channel_aftertouch(bytes: &[u8]) -> Option<MessageKind> {
    if bytes.len() < 2 {
        None
    } else {
        Some(MessageKind::ChannelAftertouch { pressure: bytes[1] })
    }
}

fn parse_pitch_bend(bytes: &[u8]) -> Option<MessageKind> {
    if bytes.len() < 3 {
        None
    } else {
        let value = ((bytes[1] as u16) & 0x7F) | (((bytes[2] as u16) & 0x7F) << 7);
        Some(MessageKind::PitchBend { value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn note_on_with_zero_velocity_is_note_off() {
        let msg = Message::decode(&[0x91, 60, 0]).unwrap();
        assert_eq!(msg.channel, 1);
        assert_eq!(msg.kind, MessageKind::NoteOff { note: 60, velocity: 0 });
    }

    #[test]
    fn short_and_unknown_messages_are_rejected() {
        assert_eq!(Message::decode(&[]), None);
        assert_eq!(Message::decode(&[0x90, 60]), None);
        assert_eq!(Message::decode(&[0xF8]), None);
        assert_eq!(Message::decode(&[0xB0, 0x80, 1]), None);
    }

    #[test]
    fn encode_matches_decoded_bytes() {
        let bytes = [0xE3, 0x12, 0x40];
        let msg = Message::decode(&bytes).unwrap();
        assert_eq!(msg.encode(), (0xE3, 0x12, 0x40));
    }
}
