use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

/// Numeric slot a channel uses to address one scheduled notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AlarmHandle(pub u32);

impl AlarmHandle {
    /// Handles stay below 100_000_000, so they always fit a signed 32-bit column.
    pub fn as_i32(self) -> i32 {
        self.0 as i32
    }
}

impl fmt::Display for AlarmHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Three-state permission model shared by every channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionState {
    Granted,
    Denied,
    Undetermined,
}

impl PermissionState {
    /// Fold a platform-specific permission word into the three-state model.
    /// Unknown words are treated as not yet decided.
    pub fn normalize(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "granted" | "authorized" | "allowed" | "provisional" | "ephemeral" | "limited" => {
                Self::Granted
            }
            "denied" | "blocked" | "restricted" | "disabled" => Self::Denied,
            _ => Self::Undetermined,
        }
    }

    pub fn is_granted(self) -> bool {
        matches!(self, Self::Granted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Granted => "granted",
            Self::Denied => "denied",
            Self::Undetermined => "undetermined",
        }
    }
}

/// Concrete delivery mechanism behind a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// OS-level alarm scheduler; fires with the app closed and the device idle.
    Native,
    /// Push-messaging backend; needs connectivity and a registered token.
    Push,
    /// In-process timer; fires only while the process stays alive.
    Timer,
}

impl ChannelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::Push => "push",
            Self::Timer => "timer",
        }
    }
}

/// Payload attached to a scheduled alarm and echoed back on delivery.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlarmExtra {
    pub occurrence_id: Option<String>,
    pub subject_id: Option<String>,
    pub subject_label: String,
    pub due_at: Option<DateTime<Utc>>,
}

/// One request to place an alarm on a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRequest {
    pub handle: AlarmHandle,
    pub title: String,
    pub body: String,
    pub fire_at: DateTime<Utc>,
    /// Sound resource name; `None` plays the system default.
    pub sound: Option<String>,
    pub vibrate: bool,
    /// Must fire even in idle / low-power mode.
    pub allow_while_idle: bool,
    /// Delivery token for channels that address a registered device.
    pub delivery_token: Option<String>,
    pub extra: AlarmExtra,
}

/// An alarm still queued on a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAlarm {
    pub handle: AlarmHandle,
    pub title: String,
    pub body: String,
    pub fire_at: DateTime<Utc>,
}

/// Asynchronous callback raised by a channel after scheduling.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The alarm fired.
    Delivered {
        source: ChannelKind,
        handle: AlarmHandle,
        title: String,
        body: String,
        extra: AlarmExtra,
    },
    /// The user tapped the notification or one of its actions.
    Interacted {
        source: ChannelKind,
        handle: AlarmHandle,
        action_id: String,
        extra: AlarmExtra,
    },
}

impl ChannelEvent {
    pub fn handle(&self) -> AlarmHandle {
        match self {
            Self::Delivered { handle, .. } | Self::Interacted { handle, .. } => *handle,
        }
    }

    pub fn extra(&self) -> &AlarmExtra {
        match self {
            Self::Delivered { extra, .. } | Self::Interacted { extra, .. } => extra,
        }
    }
}

/// Error type for channel operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    #[error("channel unavailable: {0}")]
    Unavailable(String),
    #[error("permission denied")]
    PermissionDenied,
    #[error("fire time already passed")]
    PastDue,
    #[error("request failed: {0}")]
    RequestFailed(String),
}

/// Boxed future returned by channel operations.
pub type ChannelFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ChannelError>> + Send + 'a>>;

/// Uniform contract implemented by every delivery channel.
pub trait AlarmChannel: Send + Sync {
    fn kind(&self) -> ChannelKind;

    /// Read the current permission without prompting.
    fn check_permission(&self) -> ChannelFuture<'_, PermissionState>;

    /// Ask for permission; may prompt the user.
    fn request_permission(&self) -> ChannelFuture<'_, PermissionState>;

    /// Place an alarm. Re-using a handle replaces the alarm in that slot.
    fn schedule(&self, request: ScheduleRequest) -> ChannelFuture<'_, ()>;

    fn cancel(&self, handle: AlarmHandle) -> ChannelFuture<'_, ()>;

    fn pending(&self) -> ChannelFuture<'_, Vec<PendingAlarm>>;
}

/// How a `MockChannel` answers `schedule`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockBehavior {
    Accept,
    Fail(String),
    /// Accepts after the given delay.
    Delay(std::time::Duration),
    /// Never resolves.
    Stall,
}

/// Recording channel for tests.
#[derive(Debug)]
pub struct MockChannel {
    kind: ChannelKind,
    permission: Mutex<PermissionState>,
    behavior: MockBehavior,
    request_error: Option<String>,
    scheduled: Mutex<Vec<ScheduleRequest>>,
    /// Accepted and not yet cancelled, in acceptance order.
    armed: Mutex<Vec<ScheduleRequest>>,
    cancelled: Mutex<Vec<AlarmHandle>>,
    permission_requests: Mutex<usize>,
}

impl MockChannel {
    pub fn new(kind: ChannelKind) -> Self {
        Self {
            kind,
            permission: Mutex::new(PermissionState::Granted),
            behavior: MockBehavior::Accept,
            request_error: None,
            scheduled: Mutex::new(Vec::new()),
            armed: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            permission_requests: Mutex::new(0),
        }
    }

    pub fn with_permission(self, state: PermissionState) -> Self {
        *self.permission.lock().unwrap() = state;
        self
    }

    pub fn with_behavior(mut self, behavior: MockBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    /// Make `request_permission` fail with the given message.
    pub fn failing_requests(mut self, message: impl Into<String>) -> Self {
        self.request_error = Some(message.into());
        self
    }

    /// Number of `schedule` calls received, successful or not.
    pub fn schedule_calls(&self) -> usize {
        self.scheduled.lock().unwrap().len()
    }

    pub fn scheduled(&self) -> Vec<ScheduleRequest> {
        self.scheduled.lock().unwrap().clone()
    }

    pub fn cancelled(&self) -> Vec<AlarmHandle> {
        self.cancelled.lock().unwrap().clone()
    }

    pub fn permission_requests(&self) -> usize {
        *self.permission_requests.lock().unwrap()
    }
}

impl AlarmChannel for MockChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    fn check_permission(&self) -> ChannelFuture<'_, PermissionState> {
        let state = *self.permission.lock().unwrap();
        Box::pin(async move { Ok(state) })
    }

    fn request_permission(&self) -> ChannelFuture<'_, PermissionState> {
        *self.permission_requests.lock().unwrap() += 1;
        let result = match &self.request_error {
            Some(msg) => Err(ChannelError::RequestFailed(msg.clone())),
            None => Ok(*self.permission.lock().unwrap()),
        };
        Box::pin(async move { result })
    }

    fn schedule(&self, request: ScheduleRequest) -> ChannelFuture<'_, ()> {
        self.scheduled.lock().unwrap().push(request.clone());
        let behavior = self.behavior.clone();
        Box::pin(async move {
            match behavior {
                MockBehavior::Accept => {}
                MockBehavior::Fail(msg) => return Err(ChannelError::RequestFailed(msg)),
                MockBehavior::Delay(delay) => tokio::time::sleep(delay).await,
                MockBehavior::Stall => std::future::pending::<()>().await,
            }
            let mut armed = self.armed.lock().unwrap();
            armed.retain(|r| r.handle != request.handle);
            armed.push(request);
            Ok(())
        })
    }

    fn cancel(&self, handle: AlarmHandle) -> ChannelFuture<'_, ()> {
        self.cancelled.lock().unwrap().push(handle);
        self.armed.lock().unwrap().retain(|r| r.handle != handle);
        Box::pin(async { Ok(()) })
    }

    fn pending(&self) -> ChannelFuture<'_, Vec<PendingAlarm>> {
        let pending = self
            .armed
            .lock()
            .unwrap()
            .iter()
            .map(|r| PendingAlarm {
                handle: r.handle,
                title: r.title.clone(),
                body: r.body.clone(),
                fire_at: r.fire_at,
            })
            .collect();
        Box::pin(async move { Ok(pending) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(handle: u32) -> ScheduleRequest {
        ScheduleRequest {
            handle: AlarmHandle(handle),
            title: "💊 Metformin".into(),
            body: "500 mg".into(),
            fire_at: Utc::now(),
            sound: None,
            vibrate: true,
            allow_while_idle: true,
            delivery_token: None,
            extra: AlarmExtra::default(),
        }
    }

    #[test]
    fn normalize_permission_vocabularies() {
        assert_eq!(PermissionState::normalize("granted"), PermissionState::Granted);
        assert_eq!(PermissionState::normalize("Provisional"), PermissionState::Granted);
        assert_eq!(PermissionState::normalize("denied"), PermissionState::Denied);
        assert_eq!(PermissionState::normalize(" blocked "), PermissionState::Denied);
        assert_eq!(PermissionState::normalize("prompt"), PermissionState::Undetermined);
        assert_eq!(
            PermissionState::normalize("prompt-with-rationale"),
            PermissionState::Undetermined
        );
        assert_eq!(PermissionState::normalize("default"), PermissionState::Undetermined);
        assert_eq!(PermissionState::normalize(""), PermissionState::Undetermined);
    }

    #[tokio::test]
    async fn mock_records_schedule_and_cancel() {
        let mock = MockChannel::new(ChannelKind::Native);
        mock.schedule(request(7)).await.unwrap();
        mock.schedule(request(8)).await.unwrap();
        mock.cancel(AlarmHandle(7)).await.unwrap();

        assert_eq!(mock.schedule_calls(), 2);
        assert_eq!(mock.cancelled(), vec![AlarmHandle(7)]);
        let pending = mock.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].handle, AlarmHandle(8));
    }

    #[tokio::test]
    async fn mock_failure_still_counts_call() {
        let mock = MockChannel::new(ChannelKind::Push).with_behavior(MockBehavior::Fail("boom".into()));
        let err = mock.schedule(request(1)).await.unwrap_err();
        assert!(matches!(err, ChannelError::RequestFailed(ref m) if m == "boom"));
        assert_eq!(mock.schedule_calls(), 1);
        assert!(mock.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn mock_cancel_before_delayed_accept_keeps_it_armed() {
        let mock = MockChannel::new(ChannelKind::Native)
            .with_behavior(MockBehavior::Delay(std::time::Duration::from_millis(20)));
        mock.cancel(AlarmHandle(3)).await.unwrap();
        mock.schedule(request(3)).await.unwrap();
        assert_eq!(mock.pending().await.unwrap().len(), 1);

        mock.cancel(AlarmHandle(3)).await.unwrap();
        assert!(mock.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn mock_permission_request_failure() {
        let mock = MockChannel::new(ChannelKind::Push).failing_requests("no play services");
        assert!(mock.request_permission().await.is_err());
        assert_eq!(mock.permission_requests(), 1);
        assert_eq!(mock.check_permission().await.unwrap(), PermissionState::Granted);
    }

    #[test]
    fn event_accessors() {
        let event = ChannelEvent::Interacted {
            source: ChannelKind::Native,
            handle: AlarmHandle(42),
            action_id: "tap".into(),
            extra: AlarmExtra { occurrence_id: Some("d1".into()), ..Default::default() },
        };
        assert_eq!(event.handle(), AlarmHandle(42));
        assert_eq!(event.extra().occurrence_id.as_deref(), Some("d1"));
    }
}
