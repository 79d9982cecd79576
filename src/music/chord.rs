use serde::{Deserialize, Serialize};

use super::ScaleType;

/// How many stacked scale thirds a pad button plays.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Voicing {
    Power,
    #[default]
    Triad,
    Seventh,
    Ninth,
}

impl Voicing {
    fn steps(&self) -> &'static [usize] {
        match self {
            Voicing::Power => &[0, 4],
            Voicing::Triad => &[0, 2, 4],
            Voicing::Seventh => &[0, 2, 4, 6],
            Voicing::Ninth => &[0, 2, 4, 6, 8],
        }
    }
}

/// Builds the diatonic chord on a 0-based scale `degree`, starting from
/// `base_note + root`. Notes above 127 are left out.
pub fn expand_chord(
    base_note: u8,
    root: u8,
    scale: ScaleType,
    degree: u8,
    voicing: Voicing,
) -> Vec<u8> {
    let intervals = scale.intervals();
    let tonic = base_note as usize + (root % 12) as usize;
    voicing
        .steps()
        .iter()
        .map(|step| {
            let index = degree as usize + step;
            let octave = index / intervals.len();
            tonic + octave * 12 + intervals[index % intervals.len()] as usize
        })
        .filter(|note| *note <= 127)
        .map(|note| note as u8)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diatonic_triads_in_c_major() {
        let triad = |degree| expand_chord(48, 0, ScaleType::Major, degree, Voicing::Triad);
        assert_eq!(triad(0), vec![48, 52, 55]);
        assert_eq!(triad(1), vec![50, 53, 57]);
        assert_eq!(triad(6), vec![59, 62, 65]);
    }

    #[test]
    fn extended_voicings_wrap_octaves() {
        assert_eq!(
            expand_chord(48, 2, ScaleType::Minor, 0, Voicing::Ninth),
            vec![50, 53, 57, 60, 64]
        );
        assert_eq!(
            expand_chord(48, 0, ScaleType::Major, 4, Voicing::Power),
            vec![55, 62]
        );
    }

    #[test]
    fn notes_above_range_are_dropped() {
        let triad = |base| expand_chord(base, 0, ScaleType::Major, 0, Voicing::Triad);
        assert_eq!(triad(120), vec![120, 124, 127]);
        assert_eq!(triad(124), vec![124]);
    }
}
