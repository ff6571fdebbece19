use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use doseguard_channel::provider::{AlarmChannel, AlarmExtra, PendingAlarm, ScheduleRequest};
use tokio::task::JoinSet;
use tracing::Instrument;

use super::dedup::DedupCache;
use super::lifecycle::{AlarmState, LifecycleBook};
use crate::config::DoseguardCfg;
use crate::identity;
use crate::permission::PermissionNegotiator;
use crate::probe::{Capabilities, ChannelPlan};
use crate::store::{OccurrenceStore, PreferenceStore};
use crate::telemetry::Telemetry;
use crate::types::{
    AlarmHandle, DeliveryChannel, DeliveryRecord, DeliveryStatus, DoseOccurrence, PermissionState,
    ScheduleOutcome, SchedulingKey, TEST_OCCURRENCE_PREFIX,
};

const DEFAULT_BODY: &str = "Time to take your medication";
const BACKUP_TITLE: &str = "⏰ Time for your medication!";
const NO_CHANNEL: &str = "no delivery channel available";
const CANCELLED_IN_FLIGHT: &str = "cancelled while scheduling";
const DELAY_OUT_OF_RANGE: &str = "test delay out of range";

/// Collaborators handed to the scheduler at construction.
pub struct SchedulerDeps {
    pub cfg: Arc<DoseguardCfg>,
    pub plan: ChannelPlan,
    pub occurrences: Arc<dyn OccurrenceStore>,
    pub preferences: Arc<dyn PreferenceStore>,
    pub telemetry: Telemetry,
    pub book: Arc<LifecycleBook>,
}

/// Result of trying one channel.
enum Attempt {
    Scheduled,
    Skipped(&'static str),
    Failed(String),
}

/// Reminder scheduling orchestrator. Built once per process; clones share
/// the same de-duplication cache.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    cfg: Arc<DoseguardCfg>,
    plan: ChannelPlan,
    negotiator: PermissionNegotiator,
    occurrences: Arc<dyn OccurrenceStore>,
    preferences: Arc<dyn PreferenceStore>,
    telemetry: Telemetry,
    book: Arc<LifecycleBook>,
    dedup: DedupCache,
}

impl Scheduler {
    pub fn new(deps: SchedulerDeps) -> Self {
        let negotiator = PermissionNegotiator::new(deps.plan.clone());
        Self {
            inner: Arc::new(Inner {
                cfg: deps.cfg,
                plan: deps.plan,
                negotiator,
                occurrences: deps.occurrences,
                preferences: deps.preferences,
                telemetry: deps.telemetry,
                book: deps.book,
                dedup: DedupCache::new(),
            }),
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.inner.plan.capabilities
    }

    pub fn permissions(&self) -> &PermissionNegotiator {
        &self.inner.negotiator
    }

    pub fn state_of(&self, occurrence_id: &str) -> AlarmState {
        self.inner.book.state_of(occurrence_id)
    }

    /// Schedule one occurrence. Repeating the same `(occurrence_id, due_at)`
    /// returns the first outcome without another channel call.
    pub async fn schedule(&self, occurrence: &DoseOccurrence) -> ScheduleOutcome {
        let handle = identity::handle_for(&occurrence.occurrence_id);
        let key = SchedulingKey::of(occurrence);

        // Claimed before any await so concurrent callers share one attempt.
        let slot = self.inner.dedup.claim(&key);
        let generation = self.inner.book.generation(&occurrence.occurrence_id);
        if let Some(prior) = slot.get() {
            tracing::debug!(occurrence_id = %occurrence.occurrence_id, %handle, "already scheduled");
            return prior.clone();
        }

        let span = tracing::info_span!("schedule", occurrence_id = %occurrence.occurrence_id, %handle);
        let outcome = slot
            .get_or_init(|| self.inner.dispatch(occurrence, handle, generation).instrument(span))
            .await
            .clone();
        if !outcome.success {
            self.inner.dedup.release(&key, &slot);
        }
        outcome
    }

    /// Schedule everything due within the look-ahead window. Items run
    /// independently; returns how many were scheduled.
    pub async fn schedule_pending(&self) -> usize {
        let now = Utc::now();
        let until = i64::try_from(self.inner.cfg.lookahead_hours)
            .ok()
            .and_then(Duration::try_hours)
            .and_then(|window| now.checked_add_signed(window))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let due = match self.inner.occurrences.due_between(now, until).await {
            Ok(due) => due,
            Err(e) => {
                tracing::warn!(error = %e, "failed to load pending occurrences");
                return 0;
            }
        };

        let total = due.len();
        let deadline_ms = self.inner.cfg.batch_item_deadline_ms;
        let mut items = JoinSet::new();
        for occurrence in due {
            let scheduler = self.clone();
            items.spawn(async move {
                let attempt = scheduler.schedule(&occurrence);
                if deadline_ms == 0 {
                    return attempt.await.success;
                }
                match tokio::time::timeout(StdDuration::from_millis(deadline_ms), attempt).await {
                    Ok(outcome) => outcome.success,
                    Err(_) => {
                        tracing::warn!(
                            occurrence_id = %occurrence.occurrence_id,
                            deadline_ms,
                            "batch item exceeded deadline"
                        );
                        false
                    }
                }
            });
        }

        let mut scheduled = 0;
        while let Some(joined) = items.join_next().await {
            match joined {
                Ok(true) => scheduled += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(error = %e, "batch item aborted"),
            }
        }
        tracing::info!(scheduled, total, "pending doses scheduled");
        scheduled
    }

    /// Cancel one occurrence on every channel and forget its de-dup keys.
    /// An attempt still in flight withdraws whatever it armed.
    pub async fn cancel(&self, occurrence_id: &str) {
        let handle = identity::handle_for(occurrence_id);
        let inner = &self.inner;
        inner.book.cancel(occurrence_id);
        let purged = inner.dedup.purge(occurrence_id);

        for channel in [&inner.plan.primary, &inner.plan.tertiary].into_iter().flatten() {
            if let Err(e) = channel.cancel(handle).await {
                tracing::warn!(%handle, channel = channel.kind().as_str(), error = %e, "failed to cancel alarm");
            }
        }
        if let Some(backup) = inner.plan.backup.clone() {
            tokio::spawn(async move {
                if let Err(e) = backup.cancel(handle).await {
                    tracing::debug!(%handle, error = %e, "backup cancel failed");
                }
            });
        }

        tracing::info!(occurrence_id, %handle, purged, "alarm cancelled");
    }

    /// Schedule a synthetic reminder `delay_secs` from now (configured default when `None`).
    pub async fn send_test(&self, delay_secs: Option<u64>) -> ScheduleOutcome {
        let delay = delay_secs.unwrap_or(self.inner.cfg.test_delay_secs);
        let now = Utc::now();
        let id = format!("{TEST_OCCURRENCE_PREFIX}{}", now.timestamp_millis());
        let Some(due_at) = i64::try_from(delay)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|d| now.checked_add_signed(d))
        else {
            tracing::warn!(delay_secs = delay, "test delay out of range");
            return ScheduleOutcome::failed(identity::handle_for(&id), DELAY_OUT_OF_RANGE);
        };
        let occurrence =
            DoseOccurrence::new(&id, &id, "Alarm test", due_at).with_description("Check that the alarm rang!");
        self.schedule(&occurrence).await
    }

    /// Alarms still queued on the local channel.
    pub async fn pending(&self) -> Vec<PendingAlarm> {
        let plan = &self.inner.plan;
        let Some(channel) = plan.primary.as_ref().or(plan.tertiary.as_ref()) else {
            return Vec::new();
        };
        match channel.pending().await {
            Ok(alarms) => alarms,
            Err(e) => {
                tracing::warn!(error = %e, "failed to list pending alarms");
                Vec::new()
            }
        }
    }
}

impl Inner {
    /// Walk the channel order until one accepts.
    async fn dispatch(
        self: &Arc<Self>,
        occurrence: &DoseOccurrence,
        handle: AlarmHandle,
        generation: u64,
    ) -> ScheduleOutcome {
        let id = occurrence.occurrence_id.as_str();
        let mut last_error: Option<String> = None;

        if let Some(primary) = &self.plan.primary {
            match self.attempt_local(primary, DeliveryChannel::Primary, occurrence, handle).await {
                Attempt::Scheduled => {
                    if !self.book.advance_unless_cancelled(id, generation, AlarmState::LocalScheduled) {
                        return self.withdraw(primary, handle).await;
                    }
                    self.spawn_advisory_backup(occurrence.clone(), handle, generation);
                    return ScheduleOutcome::scheduled(DeliveryChannel::Primary, handle);
                }
                Attempt::Skipped(reason) => tracing::info!(reason, "primary channel skipped"),
                Attempt::Failed(e) => {
                    tracing::warn!(error = %e, "primary channel failed, falling through");
                    last_error = Some(e);
                }
            }
        }

        match self.attempt_backup(occurrence, handle).await {
            Attempt::Scheduled => {
                if !self.book.advance_unless_cancelled(id, generation, AlarmState::BackupScheduled) {
                    if let Some(push) = &self.plan.backup {
                        return self.withdraw(push, handle).await;
                    }
                }
                return ScheduleOutcome::scheduled(DeliveryChannel::Backup, handle);
            }
            Attempt::Skipped(reason) => tracing::debug!(reason, "backup channel skipped"),
            Attempt::Failed(e) => {
                tracing::warn!(error = %e, "backup channel failed");
                last_error = Some(e);
            }
        }

        if let Some(timer) = &self.plan.tertiary {
            if occurrence.due_at <= Utc::now() {
                self.book.advance_unless_cancelled(id, generation, AlarmState::Suppressed);
                tracing::debug!(due_at = %occurrence.due_at, "past due, timer channel skipped");
            } else {
                match self.attempt_local(timer, DeliveryChannel::Tertiary, occurrence, handle).await {
                    Attempt::Scheduled => {
                        if !self.book.advance_unless_cancelled(id, generation, AlarmState::LocalScheduled) {
                            return self.withdraw(timer, handle).await;
                        }
                        return ScheduleOutcome::scheduled(DeliveryChannel::Tertiary, handle);
                    }
                    Attempt::Skipped(reason) => tracing::debug!(reason, "timer channel skipped"),
                    Attempt::Failed(e) => last_error = Some(e),
                }
            }
        }

        let error = last_error.unwrap_or_else(|| NO_CHANNEL.to_owned());
        tracing::warn!(error = %error, "no channel accepted the reminder");
        ScheduleOutcome::failed(handle, error)
    }

    /// Undo an alarm armed after its occurrence was cancelled.
    async fn withdraw(&self, channel: &Arc<dyn AlarmChannel>, handle: AlarmHandle) -> ScheduleOutcome {
        if let Err(e) = channel.cancel(handle).await {
            tracing::warn!(%handle, channel = channel.kind().as_str(), error = %e, "failed to withdraw alarm");
        }
        tracing::info!(%handle, channel = channel.kind().as_str(), "cancelled while scheduling, alarm withdrawn");
        ScheduleOutcome::failed(handle, CANCELLED_IN_FLIGHT)
    }

    /// Try a channel that addresses this device directly (primary or timer).
    async fn attempt_local(
        &self,
        channel: &Arc<dyn AlarmChannel>,
        rank: DeliveryChannel,
        occurrence: &DoseOccurrence,
        handle: AlarmHandle,
    ) -> Attempt {
        if self.permission(channel).await == PermissionState::Denied {
            return Attempt::Skipped("permission denied");
        }

        let request = alarm_request(occurrence, handle);
        let (title, body) = (request.title.clone(), request.body.clone());
        match channel.schedule(request).await {
            Ok(()) => {
                self.record(occurrence, rank, channel, DeliveryStatus::Scheduled, &title, &body, handle, None)
                    .await;
                tracing::info!(channel = channel.kind().as_str(), due_at = %occurrence.due_at, "alarm scheduled");
                Attempt::Scheduled
            }
            Err(e) => {
                let error = e.to_string();
                self.record(occurrence, rank, channel, DeliveryStatus::Failed, &title, &body, handle, Some(&error))
                    .await;
                Attempt::Failed(error)
            }
        }
    }

    /// Try the push backend. Gated on the user's preference and a token on file.
    async fn attempt_backup(&self, occurrence: &DoseOccurrence, handle: AlarmHandle) -> Attempt {
        let Some(push) = &self.plan.backup else {
            return Attempt::Skipped("no backup channel");
        };
        let prefs = match self.preferences.backup_preferences(&self.cfg.user_id).await {
            Ok(prefs) => prefs,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read backup preferences");
                return Attempt::Skipped("preferences unavailable");
            }
        };
        let Some(token) = prefs.usable_token() else {
            return Attempt::Skipped("backup disabled or no token");
        };
        if self.permission(push).await == PermissionState::Denied {
            return Attempt::Skipped("permission denied");
        }

        let request = backup_request(occurrence, handle, token);
        let (title, body) = (request.title.clone(), request.body.clone());
        match push.schedule(request).await {
            Ok(()) => {
                self.record(occurrence, DeliveryChannel::Backup, push, DeliveryStatus::Scheduled, &title, &body, handle, None)
                    .await;
                Attempt::Scheduled
            }
            Err(e) => Attempt::Failed(e.to_string()),
        }
    }

    /// Fire-and-forget push copy of an alarm the primary channel accepted.
    fn spawn_advisory_backup(self: &Arc<Self>, occurrence: DoseOccurrence, handle: AlarmHandle, generation: u64) {
        let Some(push) = self.plan.backup.clone() else {
            return;
        };
        let inner = Arc::clone(self);
        let span = tracing::debug_span!("advisory_backup", occurrence_id = %occurrence.occurrence_id, %handle);
        tokio::spawn(
            async move {
                match inner.attempt_backup(&occurrence, handle).await {
                    Attempt::Scheduled => {
                        let id = occurrence.occurrence_id.as_str();
                        if !inner.book.advance_unless_cancelled(id, generation, AlarmState::BackupScheduled) {
                            inner.withdraw(&push, handle).await;
                        }
                    }
                    Attempt::Skipped(reason) => tracing::debug!(reason, "advisory backup skipped"),
                    Attempt::Failed(e) => tracing::warn!(error = %e, "advisory backup failed"),
                }
            }
            .instrument(span),
        );
    }

    async fn permission(&self, channel: &Arc<dyn AlarmChannel>) -> PermissionState {
        self.negotiator.check(channel.kind()).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn record(
        &self,
        occurrence: &DoseOccurrence,
        rank: DeliveryChannel,
        channel: &Arc<dyn AlarmChannel>,
        status: DeliveryStatus,
        title: &str,
        body: &str,
        handle: AlarmHandle,
        error: Option<&str>,
    ) {
        let mut metadata = serde_json::json!({
            "handle": handle.0,
            "platform": self.plan.capabilities.platform.as_str(),
            "channel": channel.kind().as_str(),
        });
        if let Some(error) = error {
            metadata["error"] = serde_json::Value::from(error);
        }
        let record = DeliveryRecord::new(
            Some(&occurrence.occurrence_id),
            rank,
            status,
            title,
            body,
            occurrence.due_at,
            handle,
            metadata,
        );
        self.telemetry.record(record).await;
    }
}

fn extra(occurrence: &DoseOccurrence) -> AlarmExtra {
    AlarmExtra {
        occurrence_id: Some(occurrence.occurrence_id.clone()),
        subject_id: Some(occurrence.subject_id.clone()),
        subject_label: occurrence.subject_label.clone(),
        due_at: Some(occurrence.due_at),
    }
}

fn alarm_request(occurrence: &DoseOccurrence, handle: AlarmHandle) -> ScheduleRequest {
    ScheduleRequest {
        handle,
        title: format!("💊 {}", occurrence.subject_label),
        body: occurrence
            .dose_description
            .clone()
            .unwrap_or_else(|| DEFAULT_BODY.to_owned()),
        fire_at: occurrence.due_at,
        sound: occurrence.tone.sound_file().map(str::to_owned),
        vibrate: occurrence.vibrate,
        allow_while_idle: true,
        delivery_token: None,
        extra: extra(occurrence),
    }
}

fn backup_request(occurrence: &DoseOccurrence, handle: AlarmHandle, token: &str) -> ScheduleRequest {
    let body = match &occurrence.dose_description {
        Some(desc) => format!("{} - {desc}", occurrence.subject_label),
        None => occurrence.subject_label.clone(),
    };
    ScheduleRequest {
        handle,
        title: BACKUP_TITLE.to_owned(),
        body,
        fire_at: occurrence.due_at,
        sound: None,
        vibrate: occurrence.vibrate,
        allow_while_idle: true,
        delivery_token: Some(token.to_owned()),
        extra: extra(occurrence),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AlarmTone;

    fn occurrence() -> DoseOccurrence {
        DoseOccurrence::new("d1", "m1", "Metformin", Utc::now() + Duration::hours(1))
    }

    #[test]
    fn alarm_request_content() {
        let req = alarm_request(&occurrence().with_tone(AlarmTone::Gentle), AlarmHandle(3149));
        assert_eq!(req.title, "💊 Metformin");
        assert_eq!(req.body, DEFAULT_BODY);
        assert_eq!(req.sound.as_deref(), Some("gentle_notification.wav"));
        assert!(req.allow_while_idle);
        assert_eq!(req.extra.occurrence_id.as_deref(), Some("d1"));
        assert!(req.delivery_token.is_none());
    }

    #[test]
    fn backup_request_content() {
        let req = backup_request(&occurrence().with_description("500 mg"), AlarmHandle(1), "tok");
        assert_eq!(req.title, BACKUP_TITLE);
        assert_eq!(req.body, "Metformin - 500 mg");
        assert_eq!(req.delivery_token.as_deref(), Some("tok"));

        let req = backup_request(&occurrence(), AlarmHandle(1), "tok");
        assert_eq!(req.body, "Metformin");
    }
}
