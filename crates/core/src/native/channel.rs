use std::sync::Arc;

use doseguard_channel::provider::{
    AlarmChannel, ChannelError, ChannelFuture, ChannelKind, PendingAlarm, ScheduleRequest,
};

use super::slots::{AlarmSlot, AlarmSlotStore};
use crate::store::StoreError;
use crate::types::{AlarmHandle, PermissionState};

/// Primary channel backed by durable alarm slots.
///
/// The host owns the permission decision; it is read from configuration
/// and never prompted for. A fire time already in the past is still armed
/// and fires on the dispatcher's next tick.
pub struct DurableAlarmChannel {
    slots: Arc<dyn AlarmSlotStore>,
    permission: PermissionState,
}

impl DurableAlarmChannel {
    pub fn new(slots: Arc<dyn AlarmSlotStore>, permission: PermissionState) -> Self {
        Self { slots, permission }
    }

    /// Permission from the configured word (`granted`, `denied`, `prompt`, ...).
    pub fn from_config_word(slots: Arc<dyn AlarmSlotStore>, word: &str) -> Self {
        Self::new(slots, PermissionState::normalize(word))
    }
}

fn unavailable(e: StoreError) -> ChannelError {
    ChannelError::Unavailable(e.to_string())
}

impl AlarmChannel for DurableAlarmChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Native
    }

    fn check_permission(&self) -> ChannelFuture<'_, PermissionState> {
        let state = self.permission;
        Box::pin(async move { Ok(state) })
    }

    fn request_permission(&self) -> ChannelFuture<'_, PermissionState> {
        self.check_permission()
    }

    fn schedule(&self, request: ScheduleRequest) -> ChannelFuture<'_, ()> {
        Box::pin(async move {
            if self.permission == PermissionState::Denied {
                return Err(ChannelError::PermissionDenied);
            }
            let slot = AlarmSlot::from(request);
            self.slots.upsert(&slot).await.map_err(unavailable)?;
            tracing::debug!(handle = %slot.handle, fire_at = %slot.fire_at, "alarm slot armed");
            Ok(())
        })
    }

    fn cancel(&self, handle: AlarmHandle) -> ChannelFuture<'_, ()> {
        Box::pin(async move {
            let existed = self.slots.remove(handle).await.map_err(unavailable)?;
            if !existed {
                tracing::debug!(%handle, "no alarm slot to cancel");
            }
            Ok(())
        })
    }

    fn pending(&self) -> ChannelFuture<'_, Vec<PendingAlarm>> {
        Box::pin(async move {
            let slots = self.slots.pending().await.map_err(unavailable)?;
            Ok(slots.iter().map(AlarmSlot::to_pending).collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::slots::MemorySlotStore;
    use chrono::{Duration, Utc};
    use doseguard_channel::provider::AlarmExtra;

    fn request(handle: u32, title: &str) -> ScheduleRequest {
        ScheduleRequest {
            handle: AlarmHandle(handle),
            title: title.into(),
            body: "Time to take your medication".into(),
            fire_at: Utc::now() + Duration::minutes(5),
            sound: Some("alert_notification.wav".into()),
            vibrate: true,
            allow_while_idle: true,
            delivery_token: None,
            extra: AlarmExtra::default(),
        }
    }

    #[tokio::test]
    async fn schedule_cancel_pending() {
        let channel = DurableAlarmChannel::new(Arc::new(MemorySlotStore::new()), PermissionState::Granted);
        channel.schedule(request(1, "💊 A")).await.unwrap();
        channel.schedule(request(2, "💊 B")).await.unwrap();
        channel.cancel(AlarmHandle(1)).await.unwrap();
        channel.cancel(AlarmHandle(1)).await.unwrap();

        let pending = channel.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].title, "💊 B");
    }

    #[tokio::test]
    async fn handle_collision_coalesces() {
        let channel = DurableAlarmChannel::new(Arc::new(MemorySlotStore::new()), PermissionState::Granted);
        channel.schedule(request(5, "first")).await.unwrap();
        channel.schedule(request(5, "second")).await.unwrap();
        let pending = channel.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].title, "second");
    }

    #[tokio::test]
    async fn configured_denial_refuses() {
        let channel = DurableAlarmChannel::from_config_word(Arc::new(MemorySlotStore::new()), "blocked");
        assert_eq!(channel.check_permission().await.unwrap(), PermissionState::Denied);
        assert!(matches!(
            channel.schedule(request(1, "x")).await,
            Err(ChannelError::PermissionDenied)
        ));
    }
}
