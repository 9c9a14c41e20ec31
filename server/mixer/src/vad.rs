//! Speech detection for conference members.

/// Energy-based voice activity decision over one frame of slin samples.
pub fn energy_vad(pcm: &[i16], threshold_db: f32) -> bool {
    if pcm.is_empty() {
        return false;
    }
    let sum_sq: f64 = pcm.iter().map(|&s| (s as f64) * (s as f64)).sum();
    let rms = (sum_sq / pcm.len() as f64).sqrt();
    let db = if rms > 0.0 {
        20.0 * (rms / 32768.0).log10() as f32
    } else {
        -96.0
    };
    db > threshold_db
}

/// Hysteresis wrapper around the VAD decision: activation is immediate,
/// deactivation waits out a hangover of silent frames so speech doesn't
/// clip at the tail.
pub struct VadGate {
    threshold_db: f32,
    active: bool,
    hangover_frames: u32,
    hangover_counter: u32,
}

impl VadGate {
    pub fn new(threshold_db: f32, hangover_frames: u32) -> Self {
        VadGate {
            threshold_db,
            active: false,
            hangover_frames,
            hangover_counter: 0,
        }
    }

    /// Update with one frame. Returns whether voice is considered active.
    pub fn update(&mut self, pcm: &[i16]) -> bool {
        if energy_vad(pcm, self.threshold_db) {
            self.active = true;
            self.hangover_counter = 0;
        } else if self.active {
            self.hangover_counter += 1;
            if self.hangover_counter >= self.hangover_frames {
                self.active = false;
                self.hangover_counter = 0;
            }
        }
        self.active
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loud() -> Vec<i16> {
        (0..160).map(|i| if i % 2 == 0 { 12000 } else { -12000 }).collect()
    }

    fn quiet() -> Vec<i16> {
        vec![0i16; 160]
    }

    #[test]
    fn energy_decision() {
        assert!(energy_vad(&loud(), -40.0));
        assert!(!energy_vad(&quiet(), -40.0));
        assert!(!energy_vad(&[], -40.0));
    }

    #[test]
    fn hangover_keeps_gate_open_briefly() {
        let mut gate = VadGate::new(-40.0, 3);
        assert!(gate.update(&loud()));
        // Three silent frames ride the hangover...
        assert!(gate.update(&quiet()));
        assert!(gate.update(&quiet()));
        // ...the third closes it.
        assert!(!gate.update(&quiet()));
        assert!(!gate.is_active());
    }

    #[test]
    fn reactivation_is_immediate() {
        let mut gate = VadGate::new(-40.0, 2);
        gate.update(&loud());
        gate.update(&quiet());
        assert!(gate.update(&loud()), "voice reopens instantly");
    }
}
