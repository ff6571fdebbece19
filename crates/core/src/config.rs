use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::HashMap;

/// Upper bounds for time windows read from the table.
const MAX_LOOKAHEAD_HOURS: u64 = 24 * 366;
const MAX_TEST_DELAY_SECS: u64 = 7 * 24 * 3600;

/// All doseguard parameters. Loaded from `doseguard_config` table at startup.
/// First boot writes defaults; subsequent boots read existing values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoseguardCfg {
    // batch scheduling
    pub lookahead_hours: u64,
    /// Per-item deadline inside a batch; 0 disables it.
    pub batch_item_deadline_ms: u64,

    // manual test alarm
    pub test_delay_secs: u64,

    // durable alarm dispatcher
    pub dispatch_tick_ms: u64,

    // channel buffers
    pub event_bus_capacity: usize,
    pub listener_buffer: usize,

    // channel availability
    pub native_alarms_enabled: bool,
    pub native_permission: String,
    pub timer_fallback_enabled: bool,

    // telemetry
    pub stats_window_days: i64,

    // account addressed by the push backend and preference store
    pub user_id: String,
}

impl Default for DoseguardCfg {
    fn default() -> Self {
        Self {
            lookahead_hours: 24,
            batch_item_deadline_ms: 0,
            test_delay_secs: 120,
            dispatch_tick_ms: 1000,
            event_bus_capacity: 64,
            listener_buffer: 256,
            native_alarms_enabled: true,
            native_permission: "granted".to_owned(),
            timer_fallback_enabled: true,
            stats_window_days: 7,
            user_id: "local".to_owned(),
        }
    }
}

impl DoseguardCfg {
    /// Load config from `doseguard_config` table. If table is empty, seed with defaults.
    pub async fn load(pool: &PgPool) -> Result<Self, sqlx::Error> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT key, value FROM doseguard_config")
            .fetch_all(pool)
            .await?;

        if rows.is_empty() {
            let cfg = Self::default();
            cfg.seed(pool).await?;
            return Ok(cfg);
        }

        let map: HashMap<String, String> = rows.into_iter().collect();
        Ok(Self::from_map(&map))
    }

    /// Write all default values into `doseguard_config` table.
    async fn seed(&self, pool: &PgPool) -> Result<(), sqlx::Error> {
        for (key, value, desc) in &self.to_entries() {
            sqlx::query(
                "INSERT INTO doseguard_config (key, value, description) VALUES ($1, $2, $3) \
                 ON CONFLICT (key) DO NOTHING",
            )
            .bind(key)
            .bind(value)
            .bind(desc)
            .execute(pool)
            .await?;
        }
        Ok(())
    }

    fn from_map(m: &HashMap<String, String>) -> Self {
        let d = Self::default();
        Self {
            lookahead_hours: get_or(m, "lookahead_hours", d.lookahead_hours).min(MAX_LOOKAHEAD_HOURS),
            batch_item_deadline_ms: get_or(m, "batch_item_deadline_ms", d.batch_item_deadline_ms),
            test_delay_secs: get_or(m, "test_delay_secs", d.test_delay_secs).min(MAX_TEST_DELAY_SECS),
            dispatch_tick_ms: get_or(m, "dispatch_tick_ms", d.dispatch_tick_ms),
            event_bus_capacity: get_or(m, "event_bus_capacity", d.event_bus_capacity),
            listener_buffer: get_or(m, "listener_buffer", d.listener_buffer),
            native_alarms_enabled: get_or(m, "native_alarms_enabled", d.native_alarms_enabled),
            native_permission: get_or(m, "native_permission", d.native_permission),
            timer_fallback_enabled: get_or(m, "timer_fallback_enabled", d.timer_fallback_enabled),
            stats_window_days: get_or(m, "stats_window_days", d.stats_window_days),
            user_id: get_or(m, "user_id", d.user_id),
        }
    }

    fn to_entries(&self) -> Vec<(&str, String, &str)> {
        vec![
            ("lookahead_hours", self.lookahead_hours.to_string(), "Batch scheduling look-ahead window hours"),
            ("batch_item_deadline_ms", self.batch_item_deadline_ms.to_string(), "Per-item batch deadline ms (0 = none)"),
            ("test_delay_secs", self.test_delay_secs.to_string(), "Default delay of the manual test alarm"),
            ("dispatch_tick_ms", self.dispatch_tick_ms.to_string(), "Durable alarm dispatcher tick ms"),
            ("event_bus_capacity", self.event_bus_capacity.to_string(), "Domain event bus capacity"),
            ("listener_buffer", self.listener_buffer.to_string(), "Channel callback buffer size"),
            ("native_alarms_enabled", self.native_alarms_enabled.to_string(), "Use the durable alarm channel as primary"),
            ("native_permission", self.native_permission.clone(), "Native alarm permission word"),
            ("timer_fallback_enabled", self.timer_fallback_enabled.to_string(), "Offer the in-process timer channel"),
            ("stats_window_days", self.stats_window_days.to_string(), "Default delivery stats window days"),
            ("user_id", self.user_id.clone(), "Account id for push backend and preferences"),
        ]
    }
}

fn get_or<T: std::str::FromStr>(map: &HashMap<String, String>, key: &str, default: T) -> T {
    map.get(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_map_falls_back_per_key() {
        let mut m = HashMap::new();
        m.insert("lookahead_hours".to_owned(), "12".to_owned());
        m.insert("dispatch_tick_ms".to_owned(), "not-a-number".to_owned());
        m.insert("native_permission".to_owned(), "denied".to_owned());
        let cfg = DoseguardCfg::from_map(&m);
        assert_eq!(cfg.lookahead_hours, 12);
        assert_eq!(cfg.dispatch_tick_ms, 1000);
        assert_eq!(cfg.native_permission, "denied");
        assert_eq!(cfg.test_delay_secs, 120);
    }

    #[test]
    fn from_map_clamps_time_windows() {
        let mut m = HashMap::new();
        m.insert("lookahead_hours".to_owned(), u64::MAX.to_string());
        m.insert("test_delay_secs".to_owned(), (u64::MAX / 2).to_string());
        let cfg = DoseguardCfg::from_map(&m);
        assert_eq!(cfg.lookahead_hours, MAX_LOOKAHEAD_HOURS);
        assert_eq!(cfg.test_delay_secs, MAX_TEST_DELAY_SECS);
    }

    #[test]
    fn entries_cover_every_key() {
        let cfg = DoseguardCfg::default();
        let map: HashMap<String, String> = cfg
            .to_entries()
            .into_iter()
            .map(|(k, v, _)| (k.to_owned(), v))
            .collect();
        assert_eq!(map.len(), 11);
        let back = DoseguardCfg::from_map(&map);
        assert_eq!(back.user_id, cfg.user_id);
        assert_eq!(back.timer_fallback_enabled, cfg.timer_fallback_enabled);
    }
}
