use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::types::{AlarmHandle, DeliveryChannel, DeliveryRecord, DeliveryStatus};

/// Append one record to the `delivery_record` table.
pub async fn insert(pool: &PgPool, record: &DeliveryRecord) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO delivery_record (id, occurrence_id, channel, status, title, body, scheduled_at, handle, metadata, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
    )
    .bind(record.id)
    .bind(&record.occurrence_id)
    .bind(record.channel.as_db_str())
    .bind(record.status.as_db_str())
    .bind(&record.title)
    .bind(&record.body)
    .bind(record.scheduled_at)
    .bind(record.handle.as_i32())
    .bind(&record.metadata)
    .bind(record.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Fetch records created at or after `since`, oldest first.
pub async fn fetch_since(pool: &PgPool, since: DateTime<Utc>) -> Result<Vec<DeliveryRecord>, sqlx::Error> {
    let rows: Vec<RecordRow> = sqlx::query_as(
        "SELECT id, occurrence_id, channel, status, title, body, scheduled_at, handle, metadata, created_at \
         FROM delivery_record WHERE created_at >= $1 ORDER BY created_at ASC",
    )
    .bind(since)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().filter_map(RecordRow::into_record).collect())
}

/// Full delivery history of one occurrence, oldest first.
pub async fn fetch_for_occurrence(pool: &PgPool, occurrence_id: &str) -> Result<Vec<DeliveryRecord>, sqlx::Error> {
    let rows: Vec<RecordRow> = sqlx::query_as(
        "SELECT id, occurrence_id, channel, status, title, body, scheduled_at, handle, metadata, created_at \
         FROM delivery_record WHERE occurrence_id = $1 ORDER BY created_at ASC",
    )
    .bind(occurrence_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().filter_map(RecordRow::into_record).collect())
}

/// Internal row type for sqlx deserialization.
#[derive(sqlx::FromRow)]
struct RecordRow {
    id: Uuid,
    occurrence_id: Option<String>,
    channel: String,
    status: String,
    title: String,
    body: String,
    scheduled_at: DateTime<Utc>,
    handle: i32,
    metadata: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl RecordRow {
    /// Rows with an unknown channel or status are skipped.
    fn into_record(self) -> Option<DeliveryRecord> {
        let channel = DeliveryChannel::from_db(&self.channel)?;
        let status = DeliveryStatus::from_db(&self.status)?;
        Some(DeliveryRecord {
            id: self.id,
            occurrence_id: self.occurrence_id,
            channel,
            status,
            title: self.title,
            body: self.body,
            scheduled_at: self.scheduled_at,
            handle: AlarmHandle(self.handle.unsigned_abs()),
            metadata: self.metadata,
            created_at: self.created_at,
        })
    }
}
