use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use doseguard_channel::provider::{AlarmHandle, ChannelKind, PermissionState};

/// Reserved prefix marking synthetic test occurrences.
pub const TEST_OCCURRENCE_PREFIX: &str = "test-";

/// Returns true for synthetic occurrences created by the manual test path.
pub fn is_synthetic(occurrence_id: &str) -> bool {
    occurrence_id.starts_with(TEST_OCCURRENCE_PREFIX)
}

/// Alarm sound profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmTone {
    #[default]
    Default,
    Gentle,
    Alert,
    Urgent,
}

impl AlarmTone {
    /// Sound resource for the channel; `None` means the system default.
    pub fn sound_file(self) -> Option<&'static str> {
        match self {
            AlarmTone::Default => None,
            AlarmTone::Gentle => Some("gentle_notification.wav"),
            AlarmTone::Alert => Some("alert_notification.wav"),
            AlarmTone::Urgent => Some("urgent_alarm.wav"),
        }
    }

    pub fn from_db(s: &str) -> Self {
        match s {
            "gentle" => AlarmTone::Gentle,
            "alert" => AlarmTone::Alert,
            "urgent" => AlarmTone::Urgent,
            _ => AlarmTone::Default,
        }
    }
}

/// One concrete due instance of a recurring medication dose.
/// Owned by the occurrence store; read-only here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoseOccurrence {
    pub occurrence_id: String,
    pub subject_id: String,
    pub subject_label: String,
    pub dose_description: Option<String>,
    pub due_at: DateTime<Utc>,
    #[serde(default)]
    pub tone: AlarmTone,
    #[serde(default = "default_vibrate")]
    pub vibrate: bool,
}

fn default_vibrate() -> bool {
    true
}

impl DoseOccurrence {
    pub fn new(
        occurrence_id: impl Into<String>,
        subject_id: impl Into<String>,
        subject_label: impl Into<String>,
        due_at: DateTime<Utc>,
    ) -> Self {
        Self {
            occurrence_id: occurrence_id.into(),
            subject_id: subject_id.into(),
            subject_label: subject_label.into(),
            dose_description: None,
            due_at,
            tone: AlarmTone::Default,
            vibrate: true,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.dose_description = Some(description.into());
        self
    }

    pub fn with_tone(mut self, tone: AlarmTone) -> Self {
        self.tone = tone;
        self
    }

    pub fn is_synthetic(&self) -> bool {
        is_synthetic(&self.occurrence_id)
    }
}

/// In-process de-duplication key: one occurrence at one due instant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SchedulingKey {
    pub occurrence_id: String,
    pub due_at_millis: i64,
}

impl SchedulingKey {
    pub fn of(occurrence: &DoseOccurrence) -> Self {
        Self {
            occurrence_id: occurrence.occurrence_id.clone(),
            due_at_millis: occurrence.due_at.timestamp_millis(),
        }
    }
}

/// Delivery path ranked by reliability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryChannel {
    Primary,
    Backup,
    Tertiary,
}

impl DeliveryChannel {
    pub fn as_db_str(self) -> &'static str {
        match self {
            DeliveryChannel::Primary => "primary",
            DeliveryChannel::Backup => "backup",
            DeliveryChannel::Tertiary => "tertiary",
        }
    }

    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "primary" => Some(DeliveryChannel::Primary),
            "backup" => Some(DeliveryChannel::Backup),
            "tertiary" => Some(DeliveryChannel::Tertiary),
            _ => None,
        }
    }

    /// Rank a concrete channel kind occupies in the delivery order.
    pub fn for_kind(kind: ChannelKind) -> Self {
        match kind {
            ChannelKind::Native => DeliveryChannel::Primary,
            ChannelKind::Push => DeliveryChannel::Backup,
            ChannelKind::Timer => DeliveryChannel::Tertiary,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Scheduled,
    Delivered,
    /// The user interacted with the notification.
    Acted,
    Failed,
}

impl DeliveryStatus {
    pub fn as_db_str(self) -> &'static str {
        match self {
            DeliveryStatus::Scheduled => "scheduled",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Acted => "acted",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(DeliveryStatus::Scheduled),
            "delivered" => Some(DeliveryStatus::Delivered),
            "acted" => Some(DeliveryStatus::Acted),
            "failed" => Some(DeliveryStatus::Failed),
            _ => None,
        }
    }
}

/// Append-only audit row for one schedule attempt or delivery callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub id: Uuid,
    /// `None` for synthetic test occurrences.
    pub occurrence_id: Option<String>,
    pub channel: DeliveryChannel,
    pub status: DeliveryStatus,
    pub title: String,
    pub body: String,
    pub scheduled_at: DateTime<Utc>,
    pub handle: AlarmHandle,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl DeliveryRecord {
    /// Build a record; synthetic occurrence ids are dropped from the row.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        occurrence_id: Option<&str>,
        channel: DeliveryChannel,
        status: DeliveryStatus,
        title: impl Into<String>,
        body: impl Into<String>,
        scheduled_at: DateTime<Utc>,
        handle: AlarmHandle,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            occurrence_id: occurrence_id.filter(|id| !is_synthetic(id)).map(str::to_owned),
            channel,
            status,
            title: title.into(),
            body: body.into(),
            scheduled_at,
            handle,
            metadata,
            created_at: Utc::now(),
        }
    }
}

/// Channel reported back to the caller of a scheduling call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeChannel {
    Primary,
    Backup,
    Tertiary,
    None,
}

impl From<DeliveryChannel> for OutcomeChannel {
    fn from(c: DeliveryChannel) -> Self {
        match c {
            DeliveryChannel::Primary => OutcomeChannel::Primary,
            DeliveryChannel::Backup => OutcomeChannel::Backup,
            DeliveryChannel::Tertiary => OutcomeChannel::Tertiary,
        }
    }
}

/// Result of one scheduling call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleOutcome {
    pub success: bool,
    pub channel: OutcomeChannel,
    pub handle: AlarmHandle,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ScheduleOutcome {
    pub fn scheduled(channel: DeliveryChannel, handle: AlarmHandle) -> Self {
        Self {
            success: true,
            channel: channel.into(),
            handle,
            error: None,
        }
    }

    pub fn failed(handle: AlarmHandle, error: impl Into<String>) -> Self {
        Self {
            success: false,
            channel: OutcomeChannel::None,
            handle,
            error: Some(error.into()),
        }
    }
}

/// Runtime platform the process was built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Android,
    Ios,
    Desktop,
    Web,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "android") {
            Platform::Android
        } else if cfg!(target_os = "ios") {
            Platform::Ios
        } else if cfg!(target_arch = "wasm32") {
            Platform::Web
        } else {
            Platform::Desktop
        }
    }

    /// Whether the platform offers an alarm service that outlives the process.
    pub fn is_native(self) -> bool {
        !matches!(self, Platform::Web)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Android => "android",
            Platform::Ios => "ios",
            Platform::Desktop => "desktop",
            Platform::Web => "web",
        }
    }
}
