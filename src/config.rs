use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const SENSORS_PER_MODULE: usize = 3;
pub const DEFAULT_UPDATE_MS: u64 = 200;
pub const DEFAULT_CONFIG_PATH: &str = "config/example.yaml";
pub const CONFIG_PATH_ENV: &str = "PLC_CONFIG";

pub const DEFAULT_LOCAL_ADS_PORT: u16 = 30012;
pub const DEFAULT_LOCAL_AMS_NET_ID: &str = "192.168.1.100.1.1";
pub const DEFAULT_DEVICE_NAME: &str = "PLC-Simulator";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaveformKind {
    Sinusoidal,
    NoisySinusoidal,
    SquareWave,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: WaveformKind,
    pub amplitude: f64,
    /// Hz, always > 0 once validated.
    pub frequency: f64,
    /// Radians.
    pub phase: f64,
    pub dc_offset: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub noise_std: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleSpec {
    pub id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_ms: Option<u64>,
    pub sensors: Vec<SensorSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// Snapshot plus batch push over newline-delimited JSON.
    Stream,
    /// Address-mapped symbol read/write.
    Symbol,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolServerConfig {
    #[serde(default = "default_local_ads_port")]
    pub local_ads_port: u16,
    #[serde(default = "default_local_ams_net_id")]
    pub local_ams_net_id: String,
    #[serde(default = "default_device_name")]
    pub device_name: String,
}

impl Default for SymbolServerConfig {
    fn default() -> Self {
        Self {
            local_ads_port: DEFAULT_LOCAL_ADS_PORT,
            local_ams_net_id: DEFAULT_LOCAL_AMS_NET_ID.to_string(),
            device_name: DEFAULT_DEVICE_NAME.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_records: Option<usize>,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_records: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub protocol: Protocol,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_ms: Option<u64>,
    #[serde(default)]
    pub symbol: SymbolServerConfig,
    #[serde(default)]
    pub history: HistoryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub modules: Vec<ModuleSpec>,
}

impl AppConfig {
    /// Update period for a module: its own override, then the server default, then 200 ms.
    pub fn module_period(&self, module: &ModuleSpec) -> Duration {
        let ms = module
            .update_ms
            .or(self.server.update_ms)
            .unwrap_or(DEFAULT_UPDATE_MS);
        Duration::from_millis(ms)
    }

    pub fn sensor_count(&self) -> usize {
        self.modules.iter().map(|m| m.sensors.len()).sum()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration from {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse YAML configuration at {path:?}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("failed to parse JSON configuration at {path:?}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("configuration validation failed:\n{details}")]
    Validation { details: String },
}

/// Resolve the configuration path: explicit argument, then `PLC_CONFIG`, then the default.
pub fn resolve_path(explicit: Option<&str>) -> PathBuf {
    explicit
        .map(PathBuf::from)
        .or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Read, parse and validate a configuration file. YAML for `.yaml`/`.yml`, JSON otherwise.
pub fn load_config(path: impl AsRef<Path>) -> Result<AppConfig, ConfigError> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let is_yaml = matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml" | "yml")
    );

    let config: AppConfig = if is_yaml {
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })?
    } else {
        serde_json::from_str(&contents).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })?
    };

    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &AppConfig) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    if config.server.port == 0 {
        errors.push("server.port must be positive".to_string());
    }
    if config.server.update_ms == Some(0) {
        errors.push("server.updateMs must be positive".to_string());
    }
    if config.modules.is_empty() {
        errors.push("at least one module must be configured".to_string());
    }

    let mut module_ids = HashSet::new();
    let mut sensor_names = HashSet::new();

    for module in &config.modules {
        if module.id == 0 {
            errors.push("module id must be a positive integer".to_string());
        }
        if !module_ids.insert(module.id) {
            errors.push(format!("duplicate module id {}", module.id));
        }
        if module.update_ms == Some(0) {
            errors.push(format!("module {} updateMs must be positive", module.id));
        }
        if module.sensors.len() != SENSORS_PER_MODULE {
            errors.push(format!(
                "module {} must have exactly {} sensors, found {}",
                module.id,
                SENSORS_PER_MODULE,
                module.sensors.len()
            ));
        }

        for sensor in &module.sensors {
            if sensor.name.trim().is_empty() {
                errors.push(format!("module {} has a sensor with an empty name", module.id));
            } else if !sensor_names.insert(sensor.name.as_str()) {
                errors.push(format!("duplicate sensor name '{}'", sensor.name));
            }
            if !(sensor.frequency.is_finite() && sensor.frequency > 0.0) {
                errors.push(format!(
                    "sensor '{}' frequency must be positive, got {}",
                    sensor.name, sensor.frequency
                ));
            }
            if let Some(std) = sensor.noise_std {
                if !(std.is_finite() && std >= 0.0) {
                    errors.push(format!(
                        "sensor '{}' noiseStd must be non-negative, got {}",
                        sensor.name, std
                    ));
                }
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Validation {
            details: errors.join("\n"),
        })
    }
}

fn default_local_ads_port() -> u16 {
    DEFAULT_LOCAL_ADS_PORT
}

fn default_local_ams_net_id() -> String {
    DEFAULT_LOCAL_AMS_NET_ID.to_string()
}

fn default_device_name() -> String {
    DEFAULT_DEVICE_NAME.to_string()
}

fn default_true() -> bool {
    true
}
