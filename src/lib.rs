//! # PLC Sensor Simulator
//!
//! A simulation library that stands in for a PLC producing periodic sensor
//! readings. Sensors are grouped into modules; each module ticks on its own
//! period and emits one timestamped batch per tick.
//!
//! ## Features
//!
//! - **Waveform generation**: sinusoidal, noisy sinusoidal and square-wave sensors
//! - **Multi-rate scheduling**: one timer per module, last-value snapshot, batch fan-out
//! - **History hand-off**: batches forwarded to a pluggable store without blocking ticks
//! - **Symbol bridge**: read and write the latest values by (group, offset) address
//!
//! ## Quick Start
//!
//! ```no_run
//! use plcsim::{load_config, Simulator};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("config/example.yaml")?;
//! let simulator = Simulator::new(&config);
//!
//! simulator.on_batch(|batch| println!("{} readings", batch.len()));
//! simulator.start()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`config`] - Configuration model, loading and validation
//! - [`waveform`] - Signal shapes evaluated at elapsed time
//! - [`module`] - Per-module batch production
//! - [`simulator`] - Timers, snapshot table and subscriber fan-out
//! - [`history`] - Historical storage interface and in-memory store
//! - [`bridge`] - Address-keyed symbol table
//! - [`protocol`] - Line protocol served over the symbol transport

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

extern crate alloc;

pub mod bridge;
pub mod config;
pub mod history;
pub mod module;
pub mod protocol;
pub mod simulator;
pub mod telemetry;
pub mod waveform;

// Re-export main public types for convenience
pub use bridge::{AddressPair, BridgeError, SymbolBridge};
pub use config::{load_config, AppConfig, ConfigError, ModuleSpec, SensorSpec, WaveformKind};
pub use history::{HistoryStore, MemoryHistoryStore, QueryParams};
pub use module::{GeneratorError, ModuleRunner};
pub use protocol::{ProtocolHandler, SymbolRequest, SymbolResponse};
pub use simulator::{Simulator, SimulatorError};
pub use telemetry::{Reading, Snapshot, SnapshotEntry, StreamMessage};
pub use waveform::Waveform;
