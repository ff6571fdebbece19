use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use doseguard_channel::provider::{AlarmExtra, PendingAlarm, ScheduleRequest};
use sqlx::PgPool;
use sqlx::types::Json;

use crate::store::StoreError;
use crate::types::AlarmHandle;

/// One armed alarm.
#[derive(Debug, Clone, PartialEq)]
pub struct AlarmSlot {
    pub handle: AlarmHandle,
    pub title: String,
    pub body: String,
    pub fire_at: DateTime<Utc>,
    pub sound: Option<String>,
    pub vibrate: bool,
    pub extra: AlarmExtra,
}

impl From<ScheduleRequest> for AlarmSlot {
    fn from(r: ScheduleRequest) -> Self {
        Self {
            handle: r.handle,
            title: r.title,
            body: r.body,
            fire_at: r.fire_at,
            sound: r.sound,
            vibrate: r.vibrate,
            extra: r.extra,
        }
    }
}

impl AlarmSlot {
    pub fn to_pending(&self) -> PendingAlarm {
        PendingAlarm {
            handle: self.handle,
            title: self.title.clone(),
            body: self.body.clone(),
            fire_at: self.fire_at,
        }
    }
}

/// Storage for armed alarms, one per handle.
#[async_trait::async_trait]
pub trait AlarmSlotStore: Send + Sync {
    /// Arm or replace the slot for `slot.handle`.
    async fn upsert(&self, slot: &AlarmSlot) -> Result<(), StoreError>;
    /// Disarm. Returns whether a slot existed.
    async fn remove(&self, handle: AlarmHandle) -> Result<bool, StoreError>;
    /// Remove and return every slot due at or before `now`, oldest first.
    async fn take_due(&self, now: DateTime<Utc>) -> Result<Vec<AlarmSlot>, StoreError>;
    /// All armed slots, soonest first.
    async fn pending(&self) -> Result<Vec<AlarmSlot>, StoreError>;
}

/// `alarm_slot` table.
pub struct PgSlotStore {
    pool: PgPool,
}

impl PgSlotStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct SlotRow {
    handle: i32,
    title: String,
    body: String,
    fire_at: DateTime<Utc>,
    sound: Option<String>,
    vibrate: bool,
    extra: Json<AlarmExtra>,
}

impl From<SlotRow> for AlarmSlot {
    fn from(r: SlotRow) -> Self {
        Self {
            handle: AlarmHandle(r.handle as u32),
            title: r.title,
            body: r.body,
            fire_at: r.fire_at,
            sound: r.sound,
            vibrate: r.vibrate,
            extra: r.extra.0,
        }
    }
}

#[async_trait::async_trait]
impl AlarmSlotStore for PgSlotStore {
    async fn upsert(&self, slot: &AlarmSlot) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO alarm_slot (handle, title, body, fire_at, sound, vibrate, extra) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (handle) DO UPDATE SET title = EXCLUDED.title, body = EXCLUDED.body, \
             fire_at = EXCLUDED.fire_at, sound = EXCLUDED.sound, vibrate = EXCLUDED.vibrate, \
             extra = EXCLUDED.extra",
        )
        .bind(slot.handle.as_i32())
        .bind(&slot.title)
        .bind(&slot.body)
        .bind(slot.fire_at)
        .bind(&slot.sound)
        .bind(slot.vibrate)
        .bind(Json(&slot.extra))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove(&self, handle: AlarmHandle) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM alarm_slot WHERE handle = $1")
            .bind(handle.as_i32())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn take_due(&self, now: DateTime<Utc>) -> Result<Vec<AlarmSlot>, StoreError> {
        let mut rows: Vec<SlotRow> = sqlx::query_as(
            "DELETE FROM alarm_slot WHERE fire_at <= $1 \
             RETURNING handle, title, body, fire_at, sound, vibrate, extra",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.sort_by_key(|r| r.fire_at);
        Ok(rows.into_iter().map(AlarmSlot::from).collect())
    }

    async fn pending(&self) -> Result<Vec<AlarmSlot>, StoreError> {
        let rows: Vec<SlotRow> = sqlx::query_as(
            "SELECT handle, title, body, fire_at, sound, vibrate, extra FROM alarm_slot ORDER BY fire_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(AlarmSlot::from).collect())
    }
}

/// In-process slots for ephemeral mode and tests. Lost on exit.
#[derive(Debug, Default)]
pub struct MemorySlotStore {
    slots: Mutex<HashMap<AlarmHandle, AlarmSlot>>,
}

impl MemorySlotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl AlarmSlotStore for MemorySlotStore {
    async fn upsert(&self, slot: &AlarmSlot) -> Result<(), StoreError> {
        self.slots.lock().unwrap().insert(slot.handle, slot.clone());
        Ok(())
    }

    async fn remove(&self, handle: AlarmHandle) -> Result<bool, StoreError> {
        Ok(self.slots.lock().unwrap().remove(&handle).is_some())
    }

    async fn take_due(&self, now: DateTime<Utc>) -> Result<Vec<AlarmSlot>, StoreError> {
        let mut slots = self.slots.lock().unwrap();
        let due: Vec<AlarmHandle> = slots
            .values()
            .filter(|s| s.fire_at <= now)
            .map(|s| s.handle)
            .collect();
        let mut taken: Vec<AlarmSlot> = due.iter().filter_map(|h| slots.remove(h)).collect();
        taken.sort_by_key(|s| s.fire_at);
        Ok(taken)
    }

    async fn pending(&self) -> Result<Vec<AlarmSlot>, StoreError> {
        let mut all: Vec<AlarmSlot> = self.slots.lock().unwrap().values().cloned().collect();
        all.sort_by_key(|s| s.fire_at);
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn slot(handle: u32, title: &str, offset_secs: i64) -> AlarmSlot {
        AlarmSlot {
            handle: AlarmHandle(handle),
            title: title.into(),
            body: "b".into(),
            fire_at: Utc::now() + Duration::seconds(offset_secs),
            sound: None,
            vibrate: true,
            extra: AlarmExtra::default(),
        }
    }

    #[tokio::test]
    async fn same_handle_replaces() {
        let store = MemorySlotStore::new();
        store.upsert(&slot(1, "first", 60)).await.unwrap();
        store.upsert(&slot(1, "second", 60)).await.unwrap();
        let pending = store.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].title, "second");
    }

    #[tokio::test]
    async fn take_due_removes_only_due() {
        let store = MemorySlotStore::new();
        store.upsert(&slot(1, "late", -5)).await.unwrap();
        store.upsert(&slot(2, "later", -1)).await.unwrap();
        store.upsert(&slot(3, "future", 3600)).await.unwrap();

        let due = store.take_due(Utc::now()).await.unwrap();
        let handles: Vec<_> = due.iter().map(|s| s.handle).collect();
        assert_eq!(handles, vec![AlarmHandle(1), AlarmHandle(2)]);
        assert!(store.take_due(Utc::now()).await.unwrap().is_empty());
        assert_eq!(store.pending().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn remove_reports_presence() {
        let store = MemorySlotStore::new();
        store.upsert(&slot(9, "x", 60)).await.unwrap();
        assert!(store.remove(AlarmHandle(9)).await.unwrap());
        assert!(!store.remove(AlarmHandle(9)).await.unwrap());
    }
}
