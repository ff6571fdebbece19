use std::sync::Mutex;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::StoreError;
use crate::types::{AlarmTone, DoseOccurrence};

/// Source of due dose occurrences.
#[async_trait::async_trait]
pub trait OccurrenceStore: Send + Sync {
    /// Occurrences still awaiting their dose with `from <= due_at <= to`, earliest first.
    async fn due_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<DoseOccurrence>, StoreError>;
}

/// Reads `dose_occurrence` joined with `medication`.
/// Occurrences whose medication row is missing are skipped by the join.
pub struct PgOccurrenceStore {
    pool: PgPool,
}

impl PgOccurrenceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct OccurrenceRow {
    id: String,
    medication_id: String,
    name: String,
    dose_text: Option<String>,
    due_at: DateTime<Utc>,
    tone: Option<String>,
    vibrate: Option<bool>,
}

impl From<OccurrenceRow> for DoseOccurrence {
    fn from(row: OccurrenceRow) -> Self {
        Self {
            occurrence_id: row.id,
            subject_id: row.medication_id,
            subject_label: row.name,
            dose_description: row.dose_text,
            due_at: row.due_at,
            tone: row.tone.as_deref().map(AlarmTone::from_db).unwrap_or_default(),
            vibrate: row.vibrate.unwrap_or(true),
        }
    }
}

#[async_trait::async_trait]
impl OccurrenceStore for PgOccurrenceStore {
    async fn due_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<DoseOccurrence>, StoreError> {
        let rows: Vec<OccurrenceRow> = sqlx::query_as(
            "SELECT d.id, d.medication_id, m.name, m.dose_text, d.due_at, m.tone, m.vibrate \
             FROM dose_occurrence d JOIN medication m ON m.id = d.medication_id \
             WHERE d.status = 'scheduled' AND d.due_at >= $1 AND d.due_at <= $2 \
             ORDER BY d.due_at ASC",
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

/// In-process occurrence list for ephemeral mode and tests.
#[derive(Debug, Default)]
pub struct MemoryOccurrenceStore {
    occurrences: Mutex<Vec<DoseOccurrence>>,
}

impl MemoryOccurrenceStore {
    pub fn new(occurrences: Vec<DoseOccurrence>) -> Self {
        Self {
            occurrences: Mutex::new(occurrences),
        }
    }

    pub fn push(&self, occurrence: DoseOccurrence) {
        self.occurrences.lock().unwrap().push(occurrence);
    }
}

#[async_trait::async_trait]
impl OccurrenceStore for MemoryOccurrenceStore {
    async fn due_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<DoseOccurrence>, StoreError> {
        let mut due: Vec<DoseOccurrence> = self
            .occurrences
            .lock()
            .unwrap()
            .iter()
            .filter(|o| o.due_at >= from && o.due_at <= to)
            .cloned()
            .collect();
        due.sort_by_key(|o| o.due_at);
        Ok(due)
    }
}
