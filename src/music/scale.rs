use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScaleType {
    Chromatic,
    #[default]
    Major,
    Minor,
    Dorian,
    Phrygian,
    Lydian,
    Mixolydian,
    Locrian,
    HarmonicMinor,
    MelodicMinor,
    MajorPentatonic,
    MinorPentatonic,
    Blues,
    WholeTone,
}

impl ScaleType {
    pub fn intervals(&self) -> &'static [u8] {
        match self {
            ScaleType::Chromatic => &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11],
            ScaleType::Major => &[0, 2, 4, 5, 7, 9, 11],
            ScaleType::Minor => &[0, 2, 3, 5, 7, 8, 10],
            ScaleType::Dorian => &[0, 2, 3, 5, 7, 9, 10],
            ScaleType::Phrygian => &[0, 1, 3, 5, 7, 8, 10],
            ScaleType::Lydian => &[0, 2, 4, 6, 7, 9, 11],
            ScaleType::Mixolydian => &[0, 2, 4, 5, 7, 9, 10],
            ScaleType::Locrian => &[0, 1, 3, 5, 6, 8, 10],
            ScaleType::HarmonicMinor => &[0, 2, 3, 5, 7, 8, 11],
            ScaleType::MelodicMinor => &[0, 2, 3, 5, 7, 9, 11],
            ScaleType::MajorPentatonic => &[0, 2, 4, 7, 9],
            ScaleType::MinorPentatonic => &[0, 3, 5, 7, 10],
            ScaleType::Blues => &[0, 3, 5, 6, 7, 10],
            ScaleType::WholeTone => &[0, 2, 4, 6, 8, 10],
        }
    }

    pub fn iter() -> impl Iterator<Item = ScaleType> {
        [
            ScaleType::Chromatic,
            ScaleType::Major,
            ScaleType::Minor,
            ScaleType::Dorian,
            ScaleType::Phrygian,
            ScaleType::Lydian,
            ScaleType::Mixolydian,
            ScaleType::Locrian,
            ScaleType::HarmonicMinor,
            ScaleType::MelodicMinor,
            ScaleType::MajorPentatonic,
            ScaleType::MinorPentatonic,
            ScaleType::Blues,
            ScaleType::WholeTone,
        ]
        .into_iter()
    }
}

/// Whether `note` belongs to `scale` rooted at pitch class `root`.
pub fn is_in_scale(note: u8, root: u8, scale: ScaleType) -> bool {
    let rel_class = (note % 12 + 12 - root % 12) % 12;
    scale.intervals().contains(&rel_class)
}

/// Maps a note to the nearest in-scale note. Equidistant candidates resolve
/// downwards, and the result never leaves 0..=127.
pub fn snap_to_scale(note: u8, root: u8, scale: ScaleType) -> u8 {
    let note = note.min(127);
    for distance in 0..12u8 {
        if let Some(below) = note.checked_sub(distance) {
            if is_in_scale(below, root, scale) {
                return below;
            }
        }
        let above = note.saturating_add(distance);
        if above <= 127 && is_in_scale(above, root, scale) {
            return above;
        }
    }
    note
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScaleMode {
    /// Notes outside the scale are dropped.
    Block,
    /// Notes outside the scale move to the nearest scale note.
    #[default]
    Snap,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleSettings {
    pub enabled: bool,
    pub mode: ScaleMode,
    /// Pitch class of the root, 0 = C.
    pub root: u8,
    pub scale: ScaleType,
}

impl ScaleSettings {
    pub fn apply(&self, note: u8) -> Option<u8> {
        match self.mode {
            ScaleMode::Block if is_in_scale(note, self.root, self.scale) => Some(note),
            ScaleMode::Block => None,
            ScaleMode::Snap => Some(snap_to_scale(note, self.root, self.scale)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snap_is_idempotent_for_every_scale_and_root() {
        for scale in ScaleType::iter() {
            for root in 0..12 {
                for note in 0..=127u8 {
                    let once = snap_to_scale(note, root, scale);
                    assert!(is_in_scale(once, root, scale));
                    assert_eq!(snap_to_scale(once, root, scale), once);
                }
            }
        }
    }

    #[test]
    fn snap_picks_nearest_note() {
        let snapped = snap_to_scale(61, 0, ScaleType::Major);
        assert!(snapped == 60 || snapped == 62);
        assert_eq!(snap_to_scale(66, 0, ScaleType::Major), 65);
        assert_eq!(snap_to_scale(64, 0, ScaleType::Major), 64);
        assert_eq!(snap_to_scale(127, 0, ScaleType::MinorPentatonic), 127);
        assert_eq!(snap_to_scale(126, 1, ScaleType::MajorPentatonic), 125);
    }

    #[test]
    fn block_mode_passes_only_scale_notes() {
        let settings = ScaleSettings {
            enabled: true,
            mode: ScaleMode::Block,
            root: 2,
            scale: ScaleType::Dorian,
        };
        for note in 0..=127u8 {
            let expected = is_in_scale(note, 2, ScaleType::Dorian).then_some(note);
            assert_eq!(settings.apply(note), expected);
        }
    }
}
