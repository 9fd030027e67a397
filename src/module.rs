use crate::config::{ModuleSpec, SENSORS_PER_MODULE};
use crate::telemetry::{now_ms, Reading};
use crate::waveform::Waveform;
use heapless::Vec;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeneratorError {
    #[error("sensor '{sensor}' produced a non-finite value ({value})")]
    NonFinite { sensor: String, value: f64 },
    #[error("generator panicked while ticking module {module_id}")]
    Panicked { module_id: u32 },
    #[error("module {module_id} has {count} sensors, at most {max} supported")]
    SensorCount {
        module_id: u32,
        count: usize,
        max: usize,
    },
}

#[derive(Debug, Clone)]
struct SensorChannel {
    name: String,
    unit: Option<String>,
    waveform: Waveform,
}

/// Generators of one module sharing its id and epoch.
#[derive(Debug, Clone)]
pub struct ModuleRunner {
    module_id: u32,
    t0_ms: u64,
    channels: Vec<SensorChannel, SENSORS_PER_MODULE>,
}

impl ModuleRunner {
    /// Build a runner whose epoch is the current wall-clock instant.
    pub fn new(spec: &ModuleSpec) -> Result<Self, GeneratorError> {
        Self::with_epoch(spec, now_ms())
    }

    pub fn with_epoch(spec: &ModuleSpec, t0_ms: u64) -> Result<Self, GeneratorError> {
        let mut channels = Vec::new();
        for sensor in &spec.sensors {
            let channel = SensorChannel {
                name: sensor.name.clone(),
                unit: sensor.unit.clone(),
                waveform: Waveform::from_spec(sensor),
            };
            channels.push(channel).map_err(|_| GeneratorError::SensorCount {
                module_id: spec.id,
                count: spec.sensors.len(),
                max: SENSORS_PER_MODULE,
            })?;
        }

        Ok(Self {
            module_id: spec.id,
            t0_ms,
            channels,
        })
    }

    pub fn module_id(&self) -> u32 {
        self.module_id
    }

    pub fn epoch_ms(&self) -> u64 {
        self.t0_ms
    }

    pub fn tick(&self) -> Result<alloc::vec::Vec<Reading>, GeneratorError> {
        self.tick_at(now_ms())
    }

    /// One reading per sensor in configured order, all stamped with `now`.
    pub fn tick_at(&self, now: u64) -> Result<alloc::vec::Vec<Reading>, GeneratorError> {
        let t_sec = now.saturating_sub(self.t0_ms) as f64 / 1000.0;

        self.channels
            .iter()
            .map(|channel| {
                let value = channel.waveform.value_at(t_sec);
                if !value.is_finite() {
                    return Err(GeneratorError::NonFinite {
                        sensor: channel.name.clone(),
                        value,
                    });
                }
                Ok(Reading {
                    name: channel.name.clone(),
                    value,
                    ts: now,
                    unit: channel.unit.clone(),
                    module_id: self.module_id,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SensorSpec, WaveformKind};

    fn sensor(name: &str, unit: Option<&str>) -> SensorSpec {
        SensorSpec {
            name: name.to_string(),
            kind: WaveformKind::Sinusoidal,
            amplitude: 10.0,
            frequency: 1.0,
            phase: 0.0,
            dc_offset: 0.0,
            noise_std: None,
            unit: unit.map(str::to_string),
        }
    }

    fn module() -> ModuleSpec {
        ModuleSpec {
            id: 1,
            update_ms: Some(200),
            sensors: alloc::vec![sensor("P", Some("bar")), sensor("T", None), sensor("V", None)],
        }
    }

    #[test]
    fn test_tick_shares_timestamp_and_order() {
        let runner = ModuleRunner::with_epoch(&module(), 10_000).unwrap();
        let batch = runner.tick_at(10_200).unwrap();

        assert_eq!(batch.len(), 3);
        let names: alloc::vec::Vec<&str> = batch.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["P", "T", "V"]);
        assert!(batch.iter().all(|r| r.ts == 10_200 && r.module_id == 1));
    }

    #[test]
    fn test_tick_uses_elapsed_seconds() {
        let runner = ModuleRunner::with_epoch(&module(), 10_000).unwrap();
        let batch = runner.tick_at(10_200).unwrap();

        let expected = 10.0 * (2.0 * core::f64::consts::PI * 0.2).sin();
        assert!((batch[0].value - expected).abs() < 1e-9);
        assert!((expected - 9.51).abs() < 0.01);
    }

    #[test]
    fn test_unit_only_when_configured() {
        let runner = ModuleRunner::with_epoch(&module(), 0).unwrap();
        let batch = runner.tick_at(500).unwrap();

        assert_eq!(batch[0].unit.as_deref(), Some("bar"));
        assert!(batch[1].unit.is_none());
    }

    #[test]
    fn test_non_finite_value_is_a_generator_fault() {
        let mut spec = module();
        spec.sensors[1].amplitude = f64::INFINITY;
        let runner = ModuleRunner::with_epoch(&spec, 0).unwrap();

        match runner.tick_at(250) {
            Err(GeneratorError::NonFinite { sensor, .. }) => assert_eq!(sensor, "T"),
            other => panic!("Expected non-finite fault, got {:?}", other),
        }
    }

    #[test]
    fn test_oversized_module_rejected() {
        let mut spec = module();
        spec.sensors.push(sensor("W", None));

        let result = ModuleRunner::with_epoch(&spec, 0);
        assert!(matches!(result, Err(GeneratorError::SensorCount { count: 4, .. })));
    }

    #[test]
    fn test_clock_before_epoch_clamps_to_zero() {
        let runner = ModuleRunner::with_epoch(&module(), 5_000).unwrap();
        let batch = runner.tick_at(4_000).unwrap();
        assert!(batch[0].value.abs() < 1e-9);
    }
}
