//! Delivery telemetry.
//!
//! Every schedule attempt and delivery callback becomes one append-only
//! `DeliveryRecord`. Writes are best effort: a failed write is logged and
//! never reaches the scheduling caller.

pub mod db;
pub mod metrics;

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;

use crate::types::DeliveryRecord;
pub use metrics::{ChannelTally, DeliveryStats};

/// Error type for telemetry sinks.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

/// Append-only storage for delivery records.
#[async_trait::async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn append(&self, record: &DeliveryRecord) -> Result<(), TelemetryError>;
    async fn since(&self, since: DateTime<Utc>) -> Result<Vec<DeliveryRecord>, TelemetryError>;
    async fn history(&self, occurrence_id: &str) -> Result<Vec<DeliveryRecord>, TelemetryError>;
}

/// Postgres-backed sink writing to `delivery_record`.
pub struct PgTelemetrySink {
    pool: PgPool,
}

impl PgTelemetrySink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl TelemetrySink for PgTelemetrySink {
    async fn append(&self, record: &DeliveryRecord) -> Result<(), TelemetryError> {
        db::insert(&self.pool, record).await?;
        Ok(())
    }

    async fn since(&self, since: DateTime<Utc>) -> Result<Vec<DeliveryRecord>, TelemetryError> {
        Ok(db::fetch_since(&self.pool, since).await?)
    }

    async fn history(&self, occurrence_id: &str) -> Result<Vec<DeliveryRecord>, TelemetryError> {
        Ok(db::fetch_for_occurrence(&self.pool, occurrence_id).await?)
    }
}

/// In-process sink for ephemeral mode and tests.
#[derive(Debug, Default)]
pub struct MemoryTelemetrySink {
    records: Mutex<Vec<DeliveryRecord>>,
}

impl MemoryTelemetrySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<DeliveryRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl TelemetrySink for MemoryTelemetrySink {
    async fn append(&self, record: &DeliveryRecord) -> Result<(), TelemetryError> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn since(&self, since: DateTime<Utc>) -> Result<Vec<DeliveryRecord>, TelemetryError> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.created_at >= since)
            .cloned()
            .collect())
    }

    async fn history(&self, occurrence_id: &str) -> Result<Vec<DeliveryRecord>, TelemetryError> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.occurrence_id.as_deref() == Some(occurrence_id))
            .cloned()
            .collect())
    }
}

/// Best-effort recorder in front of a sink.
#[derive(Clone)]
pub struct Telemetry {
    sink: Arc<dyn TelemetrySink>,
}

impl Telemetry {
    pub fn new(sink: Arc<dyn TelemetrySink>) -> Self {
        Self { sink }
    }

    /// Persist one record. Failures are logged and dropped.
    pub async fn record(&self, record: DeliveryRecord) {
        if let Err(e) = self.sink.append(&record).await {
            tracing::warn!(
                error = %e,
                handle = %record.handle,
                channel = record.channel.as_db_str(),
                status = record.status.as_db_str(),
                "failed to persist delivery record"
            );
        }
    }

    /// Delivery statistics for the last `days` days.
    pub async fn stats(&self, days: i64) -> Result<DeliveryStats, TelemetryError> {
        let since = Duration::try_days(days)
            .and_then(|window| Utc::now().checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let records = self.sink.since(since).await?;
        Ok(metrics::summarize(&records))
    }

    pub async fn history(&self, occurrence_id: &str) -> Result<Vec<DeliveryRecord>, TelemetryError> {
        self.sink.history(occurrence_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AlarmHandle, DeliveryChannel, DeliveryStatus};

    struct BrokenSink;

    #[async_trait::async_trait]
    impl TelemetrySink for BrokenSink {
        async fn append(&self, _record: &DeliveryRecord) -> Result<(), TelemetryError> {
            Err(TelemetryError::Unavailable("disk full".into()))
        }
        async fn since(&self, _since: DateTime<Utc>) -> Result<Vec<DeliveryRecord>, TelemetryError> {
            Err(TelemetryError::Unavailable("disk full".into()))
        }
        async fn history(&self, _id: &str) -> Result<Vec<DeliveryRecord>, TelemetryError> {
            Ok(vec![])
        }
    }

    fn record(id: &str, status: DeliveryStatus) -> DeliveryRecord {
        DeliveryRecord::new(
            Some(id),
            DeliveryChannel::Primary,
            status,
            "💊 Metformin",
            "500 mg",
            Utc::now(),
            AlarmHandle(3149),
            serde_json::json!({ "platform": "desktop" }),
        )
    }

    #[tokio::test]
    async fn broken_sink_is_swallowed() {
        let telemetry = Telemetry::new(Arc::new(BrokenSink));
        telemetry.record(record("d1", DeliveryStatus::Scheduled)).await;
        assert!(telemetry.stats(7).await.is_err());
    }

    #[tokio::test]
    async fn history_is_append_only_sequence() {
        let sink = Arc::new(MemoryTelemetrySink::new());
        let telemetry = Telemetry::new(sink.clone());
        telemetry.record(record("d1", DeliveryStatus::Scheduled)).await;
        telemetry.record(record("d2", DeliveryStatus::Scheduled)).await;
        telemetry.record(record("d1", DeliveryStatus::Delivered)).await;

        let history = telemetry.history("d1").await.unwrap();
        let statuses: Vec<_> = history.iter().map(|r| r.status).collect();
        assert_eq!(statuses, vec![DeliveryStatus::Scheduled, DeliveryStatus::Delivered]);
        assert_eq!(sink.records().len(), 3);

        let stats = telemetry.stats(1).await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.delivered, 1);
    }

    #[tokio::test]
    async fn oversized_stats_window_covers_everything() {
        let telemetry = Telemetry::new(Arc::new(MemoryTelemetrySink::new()));
        telemetry.record(record("d1", DeliveryStatus::Scheduled)).await;
        let stats = telemetry.stats(i64::MAX).await.unwrap();
        assert_eq!(stats.total, 1);
    }
}
