use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use doseguard_channel::provider::{ChannelEvent, ChannelKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::slots::AlarmSlotStore;

/// Fire every due slot once. Returns how many were handed to the listener.
pub async fn fire_due(slots: &dyn AlarmSlotStore, events: &mpsc::Sender<ChannelEvent>) -> usize {
    let due = match slots.take_due(Utc::now()).await {
        Ok(due) => due,
        Err(e) => {
            tracing::warn!(error = %e, "failed to read due alarm slots");
            return 0;
        }
    };

    let mut fired = 0;
    for slot in due {
        let handle = slot.handle;
        let event = ChannelEvent::Delivered {
            source: ChannelKind::Native,
            handle,
            title: slot.title,
            body: slot.body,
            extra: slot.extra,
        };
        if events.send(event).await.is_err() {
            tracing::warn!(%handle, "listener closed, alarm dropped");
            break;
        }
        fired += 1;
    }
    fired
}

/// Background loop firing due slots every `tick_ms`.
pub fn spawn(
    slots: Arc<dyn AlarmSlotStore>,
    events: mpsc::Sender<ChannelEvent>,
    tick_ms: u64,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let tick = Duration::from_millis(tick_ms.max(10));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("alarm dispatcher shutting down");
                    return;
                }
                _ = tokio::time::sleep(tick) => {}
            }

            let fired = fire_due(&*slots, &events).await;
            if fired > 0 {
                tracing::info!(fired, "alarm slots fired");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::slots::{AlarmSlot, MemorySlotStore};
    use crate::types::AlarmHandle;
    use doseguard_channel::provider::AlarmExtra;

    fn due_slot(handle: u32) -> AlarmSlot {
        AlarmSlot {
            handle: AlarmHandle(handle),
            title: "💊 Metformin".into(),
            body: "500 mg".into(),
            fire_at: Utc::now() - chrono::Duration::seconds(1),
            sound: None,
            vibrate: true,
            extra: AlarmExtra {
                occurrence_id: Some("d1".into()),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn due_slots_fire_once() {
        let store = MemorySlotStore::new();
        store.upsert(&due_slot(3149)).await.unwrap();
        let (tx, mut rx) = mpsc::channel(4);

        assert_eq!(fire_due(&store, &tx).await, 1);
        assert_eq!(fire_due(&store, &tx).await, 0);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.handle(), AlarmHandle(3149));
        assert_eq!(event.extra().occurrence_id.as_deref(), Some("d1"));
    }

    #[tokio::test]
    async fn loop_stops_on_cancel() {
        let store: Arc<dyn AlarmSlotStore> = Arc::new(MemorySlotStore::new());
        store.upsert(&due_slot(1)).await.unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let task = spawn(store, tx, 10, cancel.clone());

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert!(event.is_some());
        cancel.cancel();
        task.await.unwrap();
    }
}
