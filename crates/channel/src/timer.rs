//! In-process timer channel.
//!
//! Last-resort delivery path: an alarm lives only as long as the process.
//! When the timer elapses a `ChannelEvent::Delivered` is pushed to the
//! listener channel handed in at construction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::provider::{
    AlarmChannel, AlarmHandle, ChannelError, ChannelEvent, ChannelFuture, ChannelKind,
    PendingAlarm, PermissionState, ScheduleRequest,
};

struct Armed {
    seq: u64,
    task: AbortHandle,
    alarm: PendingAlarm,
}

pub struct TimerChannel {
    events: mpsc::Sender<ChannelEvent>,
    armed: Arc<Mutex<HashMap<AlarmHandle, Armed>>>,
    next_seq: AtomicU64,
}

impl TimerChannel {
    pub fn new(events: mpsc::Sender<ChannelEvent>) -> Self {
        Self {
            events,
            armed: Arc::new(Mutex::new(HashMap::new())),
            next_seq: AtomicU64::new(0),
        }
    }

    fn arm(&self, request: ScheduleRequest) -> Result<(), ChannelError> {
        let delay = (request.fire_at - Utc::now())
            .to_std()
            .map_err(|_| ChannelError::PastDue)?;
        if delay.is_zero() {
            return Err(ChannelError::PastDue);
        }

        let handle = request.handle;
        let events = self.events.clone();
        let armed = Arc::clone(&self.armed);
        let alarm = PendingAlarm {
            handle,
            title: request.title.clone(),
            body: request.body.clone(),
            fire_at: request.fire_at,
        };

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);

        // Held across the spawn so a fast timer cannot run before its entry exists.
        let mut slots = self.armed.lock().unwrap();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut slots = armed.lock().unwrap();
                if slots.get(&handle).is_some_and(|a| a.seq == seq) {
                    slots.remove(&handle);
                }
            }
            let event = ChannelEvent::Delivered {
                source: ChannelKind::Timer,
                handle,
                title: request.title,
                body: request.body,
                extra: request.extra,
            };
            if events.send(event).await.is_err() {
                tracing::debug!(%handle, "timer fired after listener closed");
            }
        });

        let previous = slots.insert(
            handle,
            Armed {
                seq,
                task: task.abort_handle(),
                alarm,
            },
        );
        if let Some(previous) = previous {
            previous.task.abort();
        }
        Ok(())
    }
}

impl AlarmChannel for TimerChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Timer
    }

    fn check_permission(&self) -> ChannelFuture<'_, PermissionState> {
        Box::pin(async { Ok(PermissionState::Granted) })
    }

    fn request_permission(&self) -> ChannelFuture<'_, PermissionState> {
        Box::pin(async { Ok(PermissionState::Granted) })
    }

    fn schedule(&self, request: ScheduleRequest) -> ChannelFuture<'_, ()> {
        let result = self.arm(request);
        Box::pin(async move { result })
    }

    fn cancel(&self, handle: AlarmHandle) -> ChannelFuture<'_, ()> {
        if let Some(armed) = self.armed.lock().unwrap().remove(&handle) {
            armed.task.abort();
        }
        Box::pin(async { Ok(()) })
    }

    fn pending(&self) -> ChannelFuture<'_, Vec<PendingAlarm>> {
        let mut alarms: Vec<PendingAlarm> = self
            .armed
            .lock()
            .unwrap()
            .values()
            .map(|a| a.alarm.clone())
            .collect();
        alarms.sort_by_key(|a| a.fire_at);
        Box::pin(async move { Ok(alarms) })
    }
}
