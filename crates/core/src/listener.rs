//! Delivery listener.
//!
//! Consumes channel callbacks (alarm fired, user interacted), writes one
//! delivery record per callback and republishes real occurrences on the
//! event bus. Synthetic test occurrences are recorded but never republished.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use doseguard_channel::provider::{AlarmExtra, ChannelEvent, ChannelKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::{DomainEvent, EventBus};
use crate::scheduler::{AlarmState, LifecycleBook};
use crate::telemetry::Telemetry;
use crate::types::{AlarmHandle, DeliveryChannel, DeliveryRecord, DeliveryStatus, Platform, is_synthetic};

/// Interactions on handles not seen as delivered keep working, but only
/// this many delivered payloads are remembered for enrichment.
const REMEMBERED_DELIVERIES: usize = 1024;

pub struct DeliveryListener {
    rx: mpsc::Receiver<ChannelEvent>,
    tx: mpsc::Sender<ChannelEvent>,
    telemetry: Telemetry,
    bus: EventBus,
    book: Arc<LifecycleBook>,
    platform: Platform,
    delivered: HashMap<AlarmHandle, AlarmExtra>,
}

impl DeliveryListener {
    pub fn new(
        buffer: usize,
        telemetry: Telemetry,
        bus: EventBus,
        book: Arc<LifecycleBook>,
        platform: Platform,
    ) -> Self {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        Self {
            rx,
            tx,
            telemetry,
            bus,
            book,
            platform,
            delivered: HashMap::new(),
        }
    }

    /// Sender that channels (and hosts forwarding OS callbacks) push into.
    pub fn sender(&self) -> mpsc::Sender<ChannelEvent> {
        self.tx.clone()
    }

    /// Process one callback. Returns the domain event published, if any.
    pub async fn handle(&mut self, event: ChannelEvent) -> Option<DomainEvent> {
        let handle = event.handle();
        let source = match &event {
            ChannelEvent::Delivered { source, .. } | ChannelEvent::Interacted { source, .. } => *source,
        };

        match event {
            ChannelEvent::Delivered { title, body, extra, .. } => {
                let occurrence_id = extra.occurrence_id.clone();
                self.write(occurrence_id.as_deref(), handle, source, DeliveryStatus::Delivered, &title, &body, &extra, None)
                    .await;
                if let Some(id) = occurrence_id.as_deref() {
                    self.book.advance(id, AlarmState::Delivered);
                }
                tracing::info!(%handle, channel = source.as_str(), occurrence_id = ?occurrence_id, "alarm delivered");

                let domain = occurrence_id.filter(|id| !is_synthetic(id)).map(|occurrence_id| {
                    DomainEvent::AlarmDelivered {
                        occurrence_id,
                        subject_label: extra.subject_label.clone(),
                        handle,
                    }
                });
                self.remember(handle, extra);
                self.publish(domain)
            }
            ChannelEvent::Interacted { action_id, mut extra, .. } => {
                if extra.occurrence_id.is_none() {
                    if let Some(known) = self.delivered.get(&handle) {
                        extra = known.clone();
                    }
                }
                let occurrence_id = extra.occurrence_id.clone();
                self.write(occurrence_id.as_deref(), handle, source, DeliveryStatus::Acted, "", "", &extra, Some(&action_id))
                    .await;
                tracing::info!(%handle, action_id = %action_id, occurrence_id = ?occurrence_id, "alarm acted on");

                let domain = occurrence_id.filter(|id| !is_synthetic(id)).map(|occurrence_id| {
                    DomainEvent::AlarmActed {
                        occurrence_id,
                        subject_label: extra.subject_label.clone(),
                        handle,
                        action_id,
                    }
                });
                self.publish(domain)
            }
        }
    }

    /// Drain callbacks until cancelled or every sender is gone.
    pub async fn run(mut self, token: CancellationToken) {
        // Drop our own sender so the loop ends when all channels are gone.
        let (closed, _) = mpsc::channel(1);
        drop(std::mem::replace(&mut self.tx, closed));

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = self.rx.recv() => {
                    let Some(event) = event else { break };
                    self.handle(event).await;
                }
            }
        }
        tracing::debug!("delivery listener stopped");
    }

    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(token))
    }

    fn publish(&self, event: Option<DomainEvent>) -> Option<DomainEvent> {
        let event = event?;
        self.bus.publish(event.clone());
        Some(event)
    }

    fn remember(&mut self, handle: AlarmHandle, extra: AlarmExtra) {
        if self.delivered.len() >= REMEMBERED_DELIVERIES {
            self.delivered.clear();
        }
        self.delivered.insert(handle, extra);
    }

    #[allow(clippy::too_many_arguments)]
    async fn write(
        &self,
        occurrence_id: Option<&str>,
        handle: AlarmHandle,
        source: ChannelKind,
        status: DeliveryStatus,
        title: &str,
        body: &str,
        extra: &AlarmExtra,
        action_id: Option<&str>,
    ) {
        // Same keys the scheduler writes, plus the raw occurrence id so
        // synthetic records stay traceable.
        let mut metadata = serde_json::json!({
            "handle": handle.0,
            "platform": self.platform.as_str(),
            "channel": source.as_str(),
            "occurrenceId": occurrence_id,
        });
        if let Some(action_id) = action_id {
            metadata["actionId"] = serde_json::Value::from(action_id);
        }
        let record = DeliveryRecord::new(
            occurrence_id,
            DeliveryChannel::for_kind(source),
            status,
            title,
            body,
            extra.due_at.unwrap_or_else(Utc::now),
            handle,
            metadata,
        );
        self.telemetry.record(record).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::MemoryTelemetrySink;

    fn listener() -> (DeliveryListener, Arc<MemoryTelemetrySink>, EventBus) {
        let sink = Arc::new(MemoryTelemetrySink::new());
        let bus = EventBus::new(8);
        let listener = DeliveryListener::new(
            8,
            Telemetry::new(sink.clone()),
            bus.clone(),
            Arc::new(LifecycleBook::new()),
            Platform::Desktop,
        );
        (listener, sink, bus)
    }

    fn delivered(id: &str) -> ChannelEvent {
        ChannelEvent::Delivered {
            source: ChannelKind::Native,
            handle: crate::identity::handle_for(id),
            title: "💊 Metformin".into(),
            body: "500 mg".into(),
            extra: AlarmExtra {
                occurrence_id: Some(id.into()),
                subject_id: Some("m1".into()),
                subject_label: "Metformin".into(),
                due_at: Some(Utc::now()),
            },
        }
    }

    #[tokio::test]
    async fn delivered_is_recorded_and_republished() {
        let (mut listener, sink, bus) = listener();
        let mut rx = bus.subscribe();
        let published = listener.handle(delivered("d1")).await;

        assert_eq!(published.as_ref().map(DomainEvent::occurrence_id), Some("d1"));
        assert_eq!(rx.recv().await.unwrap().name(), "alarm_delivered");
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, DeliveryStatus::Delivered);
        assert_eq!(records[0].channel, DeliveryChannel::Primary);
        assert_eq!(records[0].occurrence_id.as_deref(), Some("d1"));
        assert_eq!(records[0].metadata["handle"], crate::identity::handle_for("d1").0);
        assert_eq!(records[0].metadata["channel"], "native");
        assert_eq!(records[0].metadata["platform"], "desktop");
    }

    #[tokio::test]
    async fn synthetic_occurrence_is_recorded_not_republished() {
        let (mut listener, sink, bus) = listener();
        let mut rx = bus.subscribe();
        assert!(listener.handle(delivered("test-1700000000000")).await.is_none());

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert!(records[0].occurrence_id.is_none());
        assert_eq!(records[0].metadata["occurrenceId"], "test-1700000000000");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn synthetic_interaction_is_recorded_not_republished() {
        let (mut listener, sink, bus) = listener();
        let mut rx = bus.subscribe();
        let acted = listener
            .handle(ChannelEvent::Interacted {
                source: ChannelKind::Native,
                handle: crate::identity::handle_for("test-1700000000000"),
                action_id: "tap".into(),
                extra: AlarmExtra {
                    occurrence_id: Some("test-1700000000000".into()),
                    subject_label: "Alarm test".into(),
                    ..AlarmExtra::default()
                },
            })
            .await;

        assert!(acted.is_none());
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, DeliveryStatus::Acted);
        assert!(records[0].occurrence_id.is_none());
        assert_eq!(records[0].metadata["occurrenceId"], "test-1700000000000");
        assert_eq!(records[0].metadata["actionId"], "tap");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn interaction_enriched_from_prior_delivery() {
        let (mut listener, sink, _bus) = listener();
        listener.handle(delivered("d7")).await;
        let acted = listener
            .handle(ChannelEvent::Interacted {
                source: ChannelKind::Native,
                handle: crate::identity::handle_for("d7"),
                action_id: "tap".into(),
                extra: AlarmExtra::default(),
            })
            .await;

        match acted {
            Some(DomainEvent::AlarmActed { occurrence_id, action_id, .. }) => {
                assert_eq!(occurrence_id, "d7");
                assert_eq!(action_id, "tap");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        let records = sink.records();
        assert_eq!(records[1].status, DeliveryStatus::Acted);
        assert_eq!(records[1].metadata["actionId"], "tap");
    }

    #[tokio::test]
    async fn unknown_interaction_still_recorded() {
        let (mut listener, sink, _bus) = listener();
        let acted = listener
            .handle(ChannelEvent::Interacted {
                source: ChannelKind::Timer,
                handle: AlarmHandle(5),
                action_id: "tap".into(),
                extra: AlarmExtra::default(),
            })
            .await;
        assert!(acted.is_none());
        assert_eq!(sink.records()[0].channel, DeliveryChannel::Tertiary);
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let (listener, sink, _bus) = listener();
        let tx = listener.sender();
        let token = CancellationToken::new();
        let task = listener.spawn(token.clone());
        tx.send(delivered("d1")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        token.cancel();
        task.await.unwrap();
        assert_eq!(sink.records().len(), 1);
    }
}
