//! Address-mapped view of the live sensor readings.
//!
//! Every sensor name seen in a batch becomes a [`Symbol`] with a fixed
//! `{group, offset}` [`AddressPair`]. The group is a 16-bit hash of the
//! name and is expected to collide across names; the offset is
//! `4 × symbols registered so far`, which keeps the pair as a whole unique
//! for the life of the process.

use crate::config::SymbolServerConfig;
use crate::simulator::{Simulator, SimulatorError};
use crate::telemetry::{Reading, Snapshot};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Every symbol is an IEEE-754 single (PLC `REAL`).
pub const SYMBOL_TYPE: &str = "REAL";
pub const SYMBOL_SIZE: usize = 4;

/// Module periods to wait for a complete table before serving anyway.
const PRIME_TIMEOUT_PERIODS: u32 = 3;

pub const ADS_ERR_DEVICE_ERROR: u32 = 0x700;
pub const ADS_ERR_SERVICE_NOT_SUPPORTED: u32 = 0x701;
pub const ADS_ERR_INVALID_SIZE: u32 = 0x705;
pub const ADS_ERR_SYMBOL_NOT_FOUND: u32 = 0x710;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AddressPair {
    pub group: u16,
    pub offset: u32,
}

impl core::fmt::Display for AddressPair {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "0x{:x}:0x{:x}", self.group, self.offset)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("no symbol registered at group 0x{group:x}, offset 0x{offset:x}")]
    SymbolNotFound { group: u32, offset: u32 },
    #[error("expected {expected} bytes, got {actual}")]
    InvalidSize { expected: usize, actual: usize },
}

impl BridgeError {
    /// Numeric code reported to protocol clients.
    pub fn code(&self) -> u32 {
        match self {
            BridgeError::SymbolNotFound { .. } => ADS_ERR_SYMBOL_NOT_FOUND,
            BridgeError::InvalidSize { .. } => ADS_ERR_INVALID_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Symbol {
    pub name: String,
    pub value: f64,
    pub unit: Option<String>,
    pub module_id: u32,
    pub address: AddressPair,
}

impl Symbol {
    pub fn encode(&self) -> [u8; SYMBOL_SIZE] {
        (self.value as f32).to_le_bytes()
    }
}

/// Enumerated symbol as surfaced to diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub type_tag: String,
    pub size: usize,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    pub module_id: u32,
    pub index_group: u16,
    pub index_offset: u32,
}

impl From<&Symbol> for SymbolInfo {
    fn from(symbol: &Symbol) -> Self {
        Self {
            name: symbol.name.clone(),
            type_tag: SYMBOL_TYPE.to_string(),
            size: SYMBOL_SIZE,
            value: symbol.value,
            unit: symbol.unit.clone(),
            module_id: symbol.module_id,
            index_group: symbol.address.group,
            index_offset: symbol.address.offset,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointInfo {
    pub local_ads_port: u16,
    pub local_ams_net_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStatus {
    pub connected: bool,
    pub symbol_count: usize,
    pub symbols: Vec<SymbolInfo>,
    pub endpoint: EndpointInfo,
}

/// Stable 16-bit group for a name: 31-multiplier string hash over UTF-16 units, mod 65536.
pub fn group_for(name: &str) -> u16 {
    let hash = name
        .encode_utf16()
        .fold(0i32, |acc, unit| acc.wrapping_mul(31).wrapping_add(i32::from(unit)));
    (hash.unsigned_abs() % 65_536) as u16
}

#[derive(Debug, Default)]
struct SymbolTable {
    /// Insertion order is offset order.
    symbols: IndexMap<String, Symbol>,
    by_address: HashMap<AddressPair, String>,
}

impl SymbolTable {
    fn register(&mut self, reading: &Reading) -> AddressPair {
        if let Some(symbol) = self.symbols.get(&reading.name) {
            return symbol.address;
        }

        let address = AddressPair {
            group: group_for(&reading.name),
            offset: (self.symbols.len() * SYMBOL_SIZE) as u32,
        };
        let symbol = Symbol {
            name: reading.name.clone(),
            value: reading.value,
            unit: reading.unit.clone(),
            module_id: reading.module_id,
            address,
        };

        debug!(
            symbol = %symbol.name,
            unit = symbol.unit.as_deref().unwrap_or("-"),
            %address,
            "registered symbol"
        );

        self.by_address.insert(address, reading.name.clone());
        self.symbols.insert(reading.name.clone(), symbol);
        address
    }

    fn symbol_at_mut(&mut self, group: u16, offset: u32) -> Result<&mut Symbol, BridgeError> {
        let address = AddressPair { group, offset };
        let not_found = BridgeError::SymbolNotFound {
            group: u32::from(group),
            offset,
        };
        let name = self.by_address.get(&address).ok_or(not_found)?;
        self.symbols.get_mut(name).ok_or(not_found)
    }
}

/// Symbol table fed by the simulator's batch fan-out and served to the protocol server.
#[derive(Debug)]
pub struct SymbolBridge {
    table: Mutex<SymbolTable>,
    connected: AtomicBool,
    endpoint: EndpointInfo,
}

impl SymbolBridge {
    pub fn new(config: &SymbolServerConfig) -> Self {
        Self {
            table: Mutex::new(SymbolTable::default()),
            connected: AtomicBool::new(false),
            endpoint: EndpointInfo {
                local_ads_port: config.local_ads_port,
                local_ams_net_id: config.local_ams_net_id.clone(),
            },
        }
    }

    /// Create a bridge and subscribe it once to `simulator`'s batches.
    pub fn attach(simulator: &Simulator, config: &SymbolServerConfig) -> Arc<Self> {
        let bridge = Arc::new(Self::new(config));
        let subscriber = Arc::clone(&bridge);
        simulator.on_batch(move |batch| subscriber.apply_batch(batch));
        bridge
    }

    /// Attach, start the simulator and wait until every module has ticked, then
    /// register the snapshot. Symbols exist before the caller opens its listener.
    pub async fn start_primed(
        simulator: &Simulator,
        config: &SymbolServerConfig,
    ) -> Result<Arc<Self>, SimulatorError> {
        let bridge = Self::attach(simulator, config);
        simulator.start()?;

        let timeout = simulator.longest_period() * PRIME_TIMEOUT_PERIODS;
        if !simulator.wait_until_populated(timeout).await {
            warn!(
                timeout_ms = timeout.as_millis() as u64,
                "not every module ticked before the symbol table was primed"
            );
        }
        bridge.register_snapshot(&simulator.snapshot());
        Ok(bridge)
    }

    /// Register unseen names, then overwrite every named symbol's value.
    pub fn apply_batch(&self, readings: &[Reading]) {
        let mut table = self.table.lock();
        for reading in readings {
            table.register(reading);
            if let Some(symbol) = table.symbols.get_mut(&reading.name) {
                symbol.value = reading.value;
            }
        }
    }

    /// Pre-populate from a snapshot so early requests find their symbols.
    /// Unseen names are assigned offsets in the snapshot's name order, not tick order.
    pub fn register_snapshot(&self, snapshot: &Snapshot) -> usize {
        let mut table = self.table.lock();
        for (name, entry) in snapshot {
            table.register(&entry.clone().into_reading(name.as_str()));
        }
        info!(symbols = table.symbols.len(), "registered sensor symbols");
        table.symbols.len()
    }

    pub fn read_by_address(&self, group: u16, offset: u32) -> Result<[u8; SYMBOL_SIZE], BridgeError> {
        let mut table = self.table.lock();
        let symbol = table.symbol_at_mut(group, offset)?;
        Ok(symbol.encode())
    }

    /// Overwrite a symbol's value from little-endian REAL bytes; bytes past the fourth are ignored.
    pub fn write_by_address(&self, group: u16, offset: u32, data: &[u8]) -> Result<f32, BridgeError> {
        let mut table = self.table.lock();
        let symbol = table.symbol_at_mut(group, offset)?;

        let raw: [u8; SYMBOL_SIZE] = data
            .get(..SYMBOL_SIZE)
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or(BridgeError::InvalidSize {
                expected: SYMBOL_SIZE,
                actual: data.len(),
            })?;
        let value = f32::from_le_bytes(raw);
        symbol.value = f64::from(value);
        debug!(symbol = %symbol.name, value = f64::from(value), "symbol written");
        Ok(value)
    }

    pub fn lookup(&self, name: &str) -> Option<AddressPair> {
        self.table.lock().symbols.get(name).map(|s| s.address)
    }

    pub fn symbol(&self, name: &str) -> Option<Symbol> {
        self.table.lock().symbols.get(name).cloned()
    }

    pub fn symbol_count(&self) -> usize {
        self.table.lock().symbols.len()
    }

    /// All symbols in offset order.
    pub fn enumerate(&self) -> Vec<SymbolInfo> {
        self.table.lock().symbols.values().map(SymbolInfo::from).collect()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> BridgeStatus {
        let symbols = self.enumerate();
        BridgeStatus {
            connected: self.is_connected(),
            symbol_count: symbols.len(),
            symbols,
            endpoint: self.endpoint.clone(),
        }
    }
}
