use crate::telemetry::Reading;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use thiserror::Error;

pub const CSV_HEADER: &str = "id,name,value,timestamp,unit,moduleId,datetime";

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history storage failure: {0}")]
    Storage(String),
    #[error("history export failure: {0}")]
    Export(String),
}

/// A persisted reading plus its store-assigned identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoricalReading {
    pub id: u64,
    #[serde(flatten)]
    pub reading: Reading,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_id: Option<u32>,
    /// Inclusive lower bound, epoch ms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<u64>,
    /// Inclusive upper bound, epoch ms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    /// Only honoured together with `limit`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
}

impl QueryParams {
    pub fn matches(&self, reading: &Reading) -> bool {
        self.name.as_ref().map_or(true, |name| &reading.name == name)
            && self.module_id.map_or(true, |id| reading.module_id == id)
            && self.from.map_or(true, |from| reading.ts >= from)
            && self.to.map_or(true, |to| reading.ts <= to)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Csv,
    Json,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryStats {
    pub total_readings: u64,
    pub oldest_reading: Option<u64>,
    pub newest_reading: Option<u64>,
    pub unique_sensors: u64,
}

/// Time-series sink for every tick's batch.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn save_batch(&self, readings: &[Reading]) -> Result<(), HistoryError>;

    /// Matching records, newest first.
    async fn query(&self, params: &QueryParams) -> Result<Vec<HistoricalReading>, HistoryError>;

    /// Delete records with `ts < older_than_ms`, returning how many went.
    async fn cleanup(&self, older_than_ms: u64) -> Result<u64, HistoryError>;

    async fn stats(&self) -> Result<HistoryStats, HistoryError>;

    async fn export(
        &self,
        params: &QueryParams,
        format: ExportFormat,
    ) -> Result<String, HistoryError> {
        let rows = self.query(params).await?;
        render_export(&rows, format)
    }
}

pub fn render_export(rows: &[HistoricalReading], format: ExportFormat) -> Result<String, HistoryError> {
    match format {
        ExportFormat::Json => {
            serde_json::to_string_pretty(rows).map_err(|e| HistoryError::Export(e.to_string()))
        }
        ExportFormat::Csv => render_csv(rows),
    }
}

fn render_csv(rows: &[HistoricalReading]) -> Result<String, HistoryError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());

    writer
        .write_record(CSV_HEADER.split(','))
        .map_err(|e| HistoryError::Export(e.to_string()))?;

    for row in rows {
        let reading = &row.reading;
        let datetime = i64::try_from(reading.ts)
            .ok()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
            .unwrap_or_default();

        writer
            .write_record([
                row.id.to_string(),
                reading.name.clone(),
                reading.value.to_string(),
                reading.ts.to_string(),
                reading.unit.clone().unwrap_or_default(),
                reading.module_id.to_string(),
                datetime,
            ])
            .map_err(|e| HistoryError::Export(e.to_string()))?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| HistoryError::Export(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| HistoryError::Export(e.to_string()))
}

#[derive(Debug, Default)]
struct MemoryLog {
    records: VecDeque<HistoricalReading>,
    next_id: u64,
}

/// In-process history store, optionally bounded to the newest `max_records`.
#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    log: RwLock<MemoryLog>,
    max_records: Option<usize>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity_limit(max_records: usize) -> Self {
        Self {
            log: RwLock::new(MemoryLog::default()),
            max_records: Some(max_records),
        }
    }

    pub fn len(&self) -> usize {
        self.log.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn save_batch(&self, readings: &[Reading]) -> Result<(), HistoryError> {
        if readings.is_empty() {
            return Ok(());
        }

        let mut log = self.log.write();
        for reading in readings {
            log.next_id += 1;
            let id = log.next_id;
            log.records.push_back(HistoricalReading {
                id,
                reading: reading.clone(),
            });
        }

        if let Some(max) = self.max_records {
            while log.records.len() > max {
                log.records.pop_front();
            }
        }
        Ok(())
    }

    async fn query(&self, params: &QueryParams) -> Result<Vec<HistoricalReading>, HistoryError> {
        let log = self.log.read();
        let mut rows: Vec<HistoricalReading> = log
            .records
            .iter()
            .filter(|row| params.matches(&row.reading))
            .cloned()
            .collect();

        // Newest first; insertion order breaks timestamp ties.
        rows.sort_by(|a, b| b.reading.ts.cmp(&a.reading.ts).then(b.id.cmp(&a.id)));

        if let Some(limit) = params.limit {
            let offset = params.offset.unwrap_or(0);
            rows = rows.into_iter().skip(offset).take(limit).collect();
        }
        Ok(rows)
    }

    async fn cleanup(&self, older_than_ms: u64) -> Result<u64, HistoryError> {
        let mut log = self.log.write();
        let before = log.records.len();
        log.records.retain(|row| row.reading.ts >= older_than_ms);
        let deleted = (before - log.records.len()) as u64;
        tracing::info!(deleted, older_than_ms, "history cleanup complete");
        Ok(deleted)
    }

    async fn stats(&self) -> Result<HistoryStats, HistoryError> {
        let log = self.log.read();
        let unique: HashSet<&str> = log.records.iter().map(|r| r.reading.name.as_str()).collect();

        Ok(HistoryStats {
            total_readings: log.records.len() as u64,
            oldest_reading: log.records.iter().map(|r| r.reading.ts).min(),
            newest_reading: log.records.iter().map(|r| r.reading.ts).max(),
            unique_sensors: unique.len() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(name: &str, module_id: u32, ts: u64, value: f64) -> Reading {
        Reading {
            name: name.to_string(),
            value,
            ts,
            unit: if name == "P" { Some("bar".to_string()) } else { None },
            module_id,
        }
    }

    async fn seeded_store() -> MemoryHistoryStore {
        let store = MemoryHistoryStore::new();
        store
            .save_batch(&[reading("P", 1, 1_000, 1.0), reading("T", 1, 1_000, 2.0)])
            .await
            .unwrap();
        store
            .save_batch(&[reading("P", 1, 2_000, 3.0), reading("T", 1, 2_000, 4.0)])
            .await
            .unwrap();
        store.save_batch(&[reading("X", 2, 1_500, 5.0)]).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_query_filters_and_orders_newest_first() {
        let store = seeded_store().await;

        let all = store.query(&QueryParams::default()).await.unwrap();
        assert_eq!(all.len(), 5);
        assert!(all.windows(2).all(|w| w[0].reading.ts >= w[1].reading.ts));

        let params = QueryParams {
            name: Some("P".to_string()),
            ..Default::default()
        };
        let rows = store.query(&params).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].reading.value, 3.0);

        let params = QueryParams {
            module_id: Some(2),
            ..Default::default()
        };
        assert_eq!(store.query(&params).await.unwrap().len(), 1);

        let params = QueryParams {
            from: Some(1_200),
            to: Some(1_800),
            ..Default::default()
        };
        let rows = store.query(&params).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].reading.name, "X");
    }

    #[tokio::test]
    async fn test_limit_and_offset() {
        let store = seeded_store().await;

        let params = QueryParams {
            limit: Some(2),
            offset: Some(1),
            ..Default::default()
        };
        let rows = store.query(&params).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].reading.ts, 2_000);
        assert_eq!(rows[1].reading.ts, 1_500);

        // Offset without a limit is ignored.
        let params = QueryParams {
            offset: Some(3),
            ..Default::default()
        };
        assert_eq!(store.query(&params).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_ids_are_sequential() {
        let store = seeded_store().await;
        let mut ids: Vec<u64> = store
            .query(&QueryParams::default())
            .await
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_cleanup_and_stats() {
        let store = seeded_store().await;

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_readings, 5);
        assert_eq!(stats.oldest_reading, Some(1_000));
        assert_eq!(stats.newest_reading, Some(2_000));
        assert_eq!(stats.unique_sensors, 3);

        let deleted = store.cleanup(1_500).await.unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(store.len(), 3);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.oldest_reading, Some(1_500));
    }

    #[tokio::test]
    async fn test_empty_stats() {
        let store = MemoryHistoryStore::new();
        store.save_batch(&[]).await.unwrap();
        assert!(store.is_empty());
        assert_eq!(store.stats().await.unwrap(), HistoryStats::default());
    }

    #[tokio::test]
    async fn test_capacity_limit_evicts_oldest() {
        let store = MemoryHistoryStore::with_capacity_limit(3);
        store
            .save_batch(&[reading("P", 1, 1, 0.0), reading("T", 1, 1, 0.0)])
            .await
            .unwrap();
        store
            .save_batch(&[reading("P", 1, 2, 0.0), reading("T", 1, 2, 0.0)])
            .await
            .unwrap();

        assert_eq!(store.len(), 3);
        let ids: Vec<u64> = store
            .query(&QueryParams::default())
            .await
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert!(!ids.contains(&1));
    }

    #[tokio::test]
    async fn test_csv_export() {
        let store = MemoryHistoryStore::new();
        store.save_batch(&[reading("P", 1, 0, 1.5)]).await.unwrap();

        let csv = store
            .export(&QueryParams::default(), ExportFormat::Csv)
            .await
            .unwrap();
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some(CSV_HEADER));
        assert_eq!(
            lines.next(),
            Some("1,P,1.5,0,bar,1,1970-01-01T00:00:00.000Z")
        );
    }

    #[tokio::test]
    async fn test_json_export() {
        let store = seeded_store().await;
        let params = QueryParams {
            name: Some("X".to_string()),
            ..Default::default()
        };

        let json = store.export(&params, ExportFormat::Json).await.unwrap();
        let parsed: Vec<HistoricalReading> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].reading.module_id, 2);

        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value[0]["moduleId"], 2);
        assert_eq!(value[0]["id"], 5);
    }

    #[test]
    fn test_empty_csv_export_has_header_only() {
        let csv = render_export(&[], ExportFormat::Csv).unwrap();
        assert_eq!(csv.trim_end(), CSV_HEADER);
    }
}
