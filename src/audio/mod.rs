use std::sync::atomic::{AtomicU32, Ordering};

pub mod graph;
pub mod output;

pub fn amplify_buffer(buffer: &mut [f32], gain: f32) {
    if gain != 1.0 {
        buffer.iter_mut().for_each(|x| *x *= gain);
    }
}

pub fn add_buf_to_buf(buffer: &mut [f32], tmp_buffer: &[f32]) {
    buffer
        .iter_mut()
        .zip(tmp_buffer)
        .for_each(|(out, x)| *out += *x);
}

pub fn peak(buffer: &[f32]) -> f32 {
    buffer.iter().fold(0.0, |acc, x| acc.max(x.abs()))
}

/// An `f32` shared between the control, MIDI and render threads without locking.
#[derive(Debug, Default)]
pub struct AtomicF32(AtomicU32);

impl AtomicF32 {
    pub fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }

    pub fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn amplify_buffer() {
        let gain = 3.2;
        let mut buffer = [1.0, 0.0, 3.2];
        super::amplify_buffer(&mut buffer, gain);
        assert_eq!(buffer, [1.0 * gain, 0.0 * gain, 3.2 * gain])
    }

    #[test]
    fn peak_ignores_sign() {
        assert_eq!(super::peak(&[0.1, -0.7, 0.5]), 0.7);
        assert_eq!(super::peak(&[]), 0.0);
    }

    #[test]
    fn atomic_f32_round_trips_bits() {
        let value = super::AtomicF32::new(0.25);
        value.store(-0.5);
        assert_eq!(value.load(), -0.5);
    }
}
