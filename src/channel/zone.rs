use serde::{Deserialize, Serialize};

#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Serialize, Deserialize)]
pub enum VelocityCurve {
    #[default]
    Identity,
    Linear {
        min: u8,
        max: u8,
    },
}

impl VelocityCurve {
    pub fn map(&self, velocity: u8) -> u8 {
        match *self {
            VelocityCurve::Identity => velocity,
            VelocityCurve::Linear { min, max } => map_linear(velocity, min, max),
        }
    }
}

fn map_linear(velocity: u8, min: u8, max: u8) -> u8 {
    let span = max.saturating_sub(min) as f32;
    ((velocity.min(127) as f32 / 127.0 * span).round() as u8).saturating_add(min)
}

/// A key range that passes notes through, transposed.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub struct KeyboardZone {
    pub low_note: u8,
    pub high_note: u8,
    #[serde(default)]
    pub transpose: i8,
    #[serde(default)]
    pub velocity: VelocityCurve,
}

impl KeyboardZone {
    pub fn new(low_note: u8, high_note: u8, transpose: i8) -> Self {
        Self {
            low_note,
            high_note,
            transpose,
            velocity: VelocityCurve::Identity,
        }
    }

    pub fn contains(&self, note: u8) -> bool {
        (self.low_note..=self.high_note).contains(&note)
    }

    /// Output `(note, velocity)` for an input inside the zone. Velocity never maps to 0,
    /// which instruments would read as a note-off.
    pub fn apply(&self, note: u8, velocity: u8) -> Option<(u8, u8)> {
        if !self.contains(note) {
            return None;
        }
        let note = (note as i16 + self.transpose as i16).clamp(0, 127) as u8;
        let velocity = self.velocity.map(velocity).clamp(1, 127);
        Some((note, velocity))
    }
}

/// Fans one input note out over every zone it falls in. No zones means pass-through.
pub fn apply_zones(zones: &[KeyboardZone], note: u8, velocity: u8) -> Vec<(u8, u8)> {
    if zones.is_empty() {
        return vec![(note, velocity)];
    }
    zones
        .iter()
        .filter_map(|zone| zone.apply(note, velocity))
        .collect()
}
