use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One sensor value produced by one module tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    pub name: String,
    pub value: f64,
    /// Epoch milliseconds, shared by every reading of the same tick.
    pub ts: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    pub module_id: u32,
}

/// A reading stored in the snapshot table; the sensor name is the key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEntry {
    pub value: f64,
    pub ts: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    pub module_id: u32,
}

impl SnapshotEntry {
    pub fn into_reading(self, name: impl Into<String>) -> Reading {
        Reading {
            name: name.into(),
            value: self.value,
            ts: self.ts,
            unit: self.unit,
            module_id: self.module_id,
        }
    }
}

impl From<&Reading> for SnapshotEntry {
    fn from(reading: &Reading) -> Self {
        Self {
            value: reading.value,
            ts: reading.ts,
            unit: reading.unit.clone(),
            module_id: reading.module_id,
        }
    }
}

/// Point-in-time copy of the last known value per sensor name.
pub type Snapshot = BTreeMap<String, SnapshotEntry>;

/// Frames pushed to live stream clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamMessage {
    Snapshot(Snapshot),
    Batch(Vec<Reading>),
}

impl StreamMessage {
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Wall-clock time in epoch milliseconds.
pub fn now_ms() -> u64 {
    // Clamps pre-1970 clocks to zero.
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(unit: Option<&str>) -> Reading {
        Reading {
            name: "P".to_string(),
            value: 1.5,
            ts: 1_700_000_000_000,
            unit: unit.map(str::to_string),
            module_id: 7,
        }
    }

    #[test]
    fn test_reading_uses_camel_case_and_omits_missing_unit() {
        let json = serde_json::to_string(&reading(None)).unwrap();
        assert_eq!(json, r#"{"name":"P","value":1.5,"ts":1700000000000,"moduleId":7}"#);

        let json = serde_json::to_string(&reading(Some("bar"))).unwrap();
        assert!(json.contains(r#""unit":"bar""#));
    }

    #[test]
    fn test_snapshot_entry_drops_name() {
        let entry = SnapshotEntry::from(&reading(Some("bar")));
        let json = serde_json::to_value(&entry).unwrap();
        assert!(json.get("name").is_none());
        assert_eq!(entry.into_reading("P"), reading(Some("bar")));
    }

    #[test]
    fn test_stream_message_framing() {
        let line = StreamMessage::Batch(vec![reading(None)]).to_json_line().unwrap();
        assert!(line.starts_with(r#"{"type":"batch","data":[{"name":"P""#));
        assert!(line.ends_with('\n'));

        let mut snapshot = Snapshot::new();
        snapshot.insert("P".to_string(), SnapshotEntry::from(&reading(None)));
        let line = StreamMessage::Snapshot(snapshot).to_json_line().unwrap();
        assert!(line.starts_with(r#"{"type":"snapshot","data":{"P":{"value":1.5"#));
    }

    #[test]
    fn test_now_ms_is_recent() {
        assert!(now_ms() > 1_600_000_000_000);
    }

    #[test]
    fn test_now_ms_tracks_chrono_clock() {
        let before = Utc::now().timestamp_millis() as u64;
        let now = now_ms();
        let after = Utc::now().timestamp_millis() as u64;
        assert!(before <= now && now <= after);
    }
}
