//! Process wiring: stores, channels, scheduler, listener and dispatcher.

use std::sync::Arc;

use doseguard_channel::provider::{AlarmChannel, ChannelEvent};
use doseguard_channel::{http, timer::TimerChannel};
use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::EventBus;
use crate::config::DoseguardCfg;
use crate::listener::DeliveryListener;
use crate::native::{self, AlarmSlotStore, DurableAlarmChannel, MemorySlotStore, PgSlotStore};
use crate::probe::{ChannelPlan, ChannelSet};
use crate::scheduler::{LifecycleBook, Scheduler, SchedulerDeps};
use crate::store::{
    MemoryOccurrenceStore, OccurrenceStore, PgOccurrenceStore, PgPreferenceStore, PreferenceStore,
    StaticPreferences,
};
use crate::telemetry::{MemoryTelemetrySink, PgTelemetrySink, Telemetry, TelemetrySink};
use crate::types::Platform;

/// A fully wired process. `start` spawns the background loops.
pub struct Service {
    pub cfg: Arc<DoseguardCfg>,
    pub scheduler: Scheduler,
    pub telemetry: Telemetry,
    pub bus: EventBus,
    events: mpsc::Sender<ChannelEvent>,
    slots: Arc<dyn AlarmSlotStore>,
    listener: Option<DeliveryListener>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Service {
    /// Wire against Postgres when a pool is given, in-memory stores otherwise.
    pub fn new(cfg: Arc<DoseguardCfg>, pool: Option<PgPool>) -> Self {
        let (slots, sink, occurrences, preferences): (
            Arc<dyn AlarmSlotStore>,
            Arc<dyn TelemetrySink>,
            Arc<dyn OccurrenceStore>,
            Arc<dyn PreferenceStore>,
        ) = match pool {
            Some(pool) => (
                Arc::new(PgSlotStore::new(pool.clone())),
                Arc::new(PgTelemetrySink::new(pool.clone())),
                Arc::new(PgOccurrenceStore::new(pool.clone())),
                Arc::new(PgPreferenceStore::new(pool)),
            ),
            None => (
                Arc::new(MemorySlotStore::new()),
                Arc::new(MemoryTelemetrySink::new()),
                Arc::new(MemoryOccurrenceStore::new(Vec::new())),
                Arc::new(StaticPreferences::disabled()),
            ),
        };

        let platform = Platform::current();
        let book = Arc::new(LifecycleBook::new());
        let telemetry = Telemetry::new(sink);
        let bus = EventBus::new(cfg.event_bus_capacity);
        let listener = DeliveryListener::new(
            cfg.listener_buffer,
            telemetry.clone(),
            bus.clone(),
            Arc::clone(&book),
            platform,
        );
        let events = listener.sender();

        let mut set = ChannelSet::default();
        if cfg.native_alarms_enabled {
            let native: Arc<dyn AlarmChannel> = Arc::new(DurableAlarmChannel::from_config_word(
                Arc::clone(&slots),
                &cfg.native_permission,
            ));
            set = set.with_native(native);
        }
        if let Some(push) = http::from_env(&cfg.user_id) {
            set = set.with_push(Arc::new(push));
        }
        if cfg.timer_fallback_enabled {
            set = set.with_timer(Arc::new(TimerChannel::new(events.clone())));
        }
        let plan = ChannelPlan::select(set, platform);
        if !plan.has_any() {
            tracing::warn!("no delivery channel available, reminders will fail");
        }

        let scheduler = Scheduler::new(SchedulerDeps {
            cfg: Arc::clone(&cfg),
            plan,
            occurrences,
            preferences,
            telemetry: telemetry.clone(),
            book,
        });

        Self {
            cfg,
            scheduler,
            telemetry,
            bus,
            events,
            slots,
            listener: Some(listener),
            shutdown: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    /// Spawn the delivery listener and the alarm dispatcher. Idempotent.
    pub fn start(&mut self) {
        let Some(listener) = self.listener.take() else {
            return;
        };
        self.tasks.push(listener.spawn(self.shutdown.child_token()));
        if self.cfg.native_alarms_enabled {
            self.tasks.push(native::dispatcher::spawn(
                Arc::clone(&self.slots),
                self.events.clone(),
                self.cfg.dispatch_tick_ms,
                self.shutdown.child_token(),
            ));
        }
        tracing::info!(tasks = self.tasks.len(), "background tasks started");
    }

    /// Where hosts forward OS callbacks (delivered, interacted).
    pub fn events(&self) -> mpsc::Sender<ChannelEvent> {
        self.events.clone()
    }

    pub fn token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "background task ended abnormally");
            }
        }
        tracing::info!("doseguard stopped");
    }
}
