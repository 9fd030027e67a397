use crate::config::{SensorSpec, WaveformKind};
use core::f64::consts::PI;
use rand::distributions::OpenClosed01;
use rand::Rng;

/// Parameters shared by every sine-based waveform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sine {
    pub amplitude: f64,
    pub frequency: f64,
    pub phase: f64,
    pub dc_offset: f64,
}

impl Sine {
    pub fn value_at(&self, t: f64) -> f64 {
        self.dc_offset + self.amplitude * (2.0 * PI * self.frequency * t + self.phase).sin()
    }
}

/// Signal shape of one sensor, fixed at construction.
#[derive(Debug, Clone, PartialEq)]
pub enum Waveform {
    Sinusoidal(Sine),
    NoisySinusoidal {
        sine: Sine,
        /// Zero disables noise entirely.
        noise_std: f64,
    },
    SquareWave {
        amplitude: f64,
        frequency: f64,
        /// Phase converted to a time shift in seconds.
        phase_offset_s: f64,
        dc_offset: f64,
    },
}

impl Waveform {
    pub fn from_spec(spec: &SensorSpec) -> Self {
        let sine = Sine {
            amplitude: spec.amplitude,
            frequency: spec.frequency,
            phase: spec.phase,
            dc_offset: spec.dc_offset,
        };

        match spec.kind {
            WaveformKind::Sinusoidal => Waveform::Sinusoidal(sine),
            WaveformKind::NoisySinusoidal => Waveform::NoisySinusoidal {
                sine,
                noise_std: spec.noise_std.unwrap_or(0.0),
            },
            WaveformKind::SquareWave => Waveform::SquareWave {
                amplitude: spec.amplitude,
                frequency: spec.frequency,
                phase_offset_s: spec.phase / (2.0 * PI * spec.frequency),
                dc_offset: spec.dc_offset,
            },
        }
    }

    pub fn kind(&self) -> WaveformKind {
        match self {
            Waveform::Sinusoidal(_) => WaveformKind::Sinusoidal,
            Waveform::NoisySinusoidal { .. } => WaveformKind::NoisySinusoidal,
            Waveform::SquareWave { .. } => WaveformKind::SquareWave,
        }
    }

    /// Value at `t` seconds after the generator's epoch.
    pub fn value_at(&self, t: f64) -> f64 {
        match self {
            Waveform::Sinusoidal(sine) => sine.value_at(t),
            Waveform::NoisySinusoidal { sine, noise_std } => {
                let base = sine.value_at(t);
                if *noise_std > 0.0 {
                    base + gaussian(&mut rand::thread_rng()) * noise_std
                } else {
                    base
                }
            }
            Waveform::SquareWave {
                amplitude,
                frequency,
                phase_offset_s,
                dc_offset,
            } => {
                let period = 1.0 / frequency;
                let x = (t + phase_offset_s).rem_euclid(period);
                if x < period / 2.0 {
                    dc_offset + amplitude
                } else {
                    dc_offset - amplitude
                }
            }
        }
    }
}

/// Standard normal draw via Box–Muller. Both uniforms come from (0, 1] so `ln` never sees zero.
pub fn gaussian<R: Rng>(rng: &mut R) -> f64 {
    let u: f64 = rng.sample(OpenClosed01);
    let v: f64 = rng.sample(OpenClosed01);
    (-2.0 * u.ln()).sqrt() * (2.0 * PI * v).cos()
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn spec(kind: WaveformKind, phase: f64, noise_std: Option<f64>) -> SensorSpec {
        SensorSpec {
            name: "S".to_string(),
            kind,
            amplitude: 10.0,
            frequency: 2.5,
            phase,
            dc_offset: 3.0,
            noise_std,
            unit: None,
        }
    }

    #[test]
    fn test_sinusoid_is_periodic() {
        let wave = Waveform::from_spec(&spec(WaveformKind::Sinusoidal, 0.3, None));
        let period = 1.0 / 2.5;

        for i in 0..50 {
            let t = i as f64 * 0.037;
            assert!((wave.value_at(t) - wave.value_at(t + period)).abs() < EPS);
        }
    }

    #[test]
    fn test_sinusoid_formula() {
        let wave = Waveform::from_spec(&spec(WaveformKind::Sinusoidal, 0.0, None));
        // Quarter period lands on the crest.
        assert!((wave.value_at(0.1) - 13.0).abs() < EPS);
        assert!((wave.value_at(0.0) - 3.0).abs() < EPS);
    }

    #[test]
    fn test_noise_disabled_matches_plain_sinusoid() {
        let plain = Waveform::from_spec(&spec(WaveformKind::Sinusoidal, 0.7, None));
        let zero = Waveform::from_spec(&spec(WaveformKind::NoisySinusoidal, 0.7, Some(0.0)));
        let unset = Waveform::from_spec(&spec(WaveformKind::NoisySinusoidal, 0.7, None));

        for i in 0..20 {
            let t = i as f64 * 0.11;
            assert_eq!(zero.value_at(t), plain.value_at(t));
            assert_eq!(unset.value_at(t), plain.value_at(t));
        }
    }

    #[test]
    fn test_noisy_sinusoid_draws_independently() {
        let wave = Waveform::from_spec(&spec(WaveformKind::NoisySinusoidal, 0.0, Some(1.0)));
        let samples: Vec<f64> = (0..32).map(|_| wave.value_at(0.25)).collect();

        let distinct = samples
            .windows(2)
            .filter(|pair| (pair[0] - pair[1]).abs() > f64::EPSILON)
            .count();
        assert!(distinct > 0);
    }

    #[test]
    fn test_noise_std_ignored_for_other_kinds() {
        let wave = Waveform::from_spec(&spec(WaveformKind::Sinusoidal, 0.0, Some(5.0)));
        assert_eq!(wave.value_at(0.2), wave.value_at(0.2));
        assert_eq!(wave.kind(), WaveformKind::Sinusoidal);
    }

    #[test]
    fn test_square_wave_levels_and_duty_cycle() {
        let wave = Waveform::from_spec(&spec(WaveformKind::SquareWave, 1.1, None));
        let period = 1.0 / 2.5;
        let samples = 1000;

        let mut high = 0;
        for i in 0..samples {
            let t = 5.0 + period * i as f64 / samples as f64;
            let value = wave.value_at(t);
            assert!(value == 13.0 || value == -7.0, "unexpected level {}", value);
            if value == 13.0 {
                high += 1;
            }
        }

        let fraction = high as f64 / samples as f64;
        assert!((fraction - 0.5).abs() < 0.01, "duty cycle {}", fraction);
    }

    #[test]
    fn test_square_wave_phase_is_time_shift() {
        // Half a cycle of phase flips the output at t = 0.
        let base = Waveform::from_spec(&spec(WaveformKind::SquareWave, 0.0, None));
        let shifted = Waveform::from_spec(&spec(WaveformKind::SquareWave, PI, None));

        assert_eq!(base.value_at(0.01), 13.0);
        assert_eq!(shifted.value_at(0.01), -7.0);
    }

    #[test]
    fn test_square_wave_negative_phase_wraps() {
        let wave = Waveform::from_spec(&spec(WaveformKind::SquareWave, -PI / 2.0, None));
        // Shift is -0.1s at 2.5 Hz, so t = 0.05 maps to 0.35 within the 0.4s period.
        assert_eq!(wave.value_at(0.05), -7.0);
    }

    #[test]
    fn test_gaussian_is_finite_and_centred() {
        let mut rng = rand::thread_rng();
        let n = 20_000;
        let mut sum = 0.0;
        for _ in 0..n {
            let x = gaussian(&mut rng);
            assert!(x.is_finite());
            sum += x;
        }
        assert!((sum / n as f64).abs() < 0.05);
    }
}
