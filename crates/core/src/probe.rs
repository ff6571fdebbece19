use std::sync::Arc;

use doseguard_channel::provider::AlarmChannel;
use serde::Serialize;

use crate::types::{ChannelKind, Platform};

/// Channel implementations available to this process, one slot per kind.
#[derive(Clone, Default)]
pub struct ChannelSet {
    pub native: Option<Arc<dyn AlarmChannel>>,
    pub push: Option<Arc<dyn AlarmChannel>>,
    pub timer: Option<Arc<dyn AlarmChannel>>,
}

impl ChannelSet {
    pub fn with_native(mut self, ch: Arc<dyn AlarmChannel>) -> Self {
        self.native = Some(ch);
        self
    }

    pub fn with_push(mut self, ch: Arc<dyn AlarmChannel>) -> Self {
        self.push = Some(ch);
        self
    }

    pub fn with_timer(mut self, ch: Arc<dyn AlarmChannel>) -> Self {
        self.timer = Some(ch);
        self
    }
}

impl std::fmt::Debug for ChannelSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSet")
            .field("native", &self.native.is_some())
            .field("push", &self.push.is_some())
            .field("timer", &self.timer.is_some())
            .finish()
    }
}

/// What this runtime can deliver through. Absence is `false`, never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub has_native_alarms: bool,
    pub has_push_backend: bool,
    pub has_in_page_timer: bool,
    pub platform: Platform,
}

/// Detect the usable channels. Native alarms and push need a native-capable
/// platform; a browser-like runtime only keeps the in-page timer.
pub fn probe(set: &ChannelSet, platform: Platform) -> Capabilities {
    let native_platform = platform.is_native();
    Capabilities {
        has_native_alarms: native_platform && set.native.is_some(),
        has_push_backend: native_platform && set.push.is_some(),
        has_in_page_timer: set.timer.is_some(),
        platform,
    }
}

/// Delivery order fixed once at startup from the probe result.
#[derive(Clone)]
pub struct ChannelPlan {
    pub capabilities: Capabilities,
    pub primary: Option<Arc<dyn AlarmChannel>>,
    pub backup: Option<Arc<dyn AlarmChannel>>,
    /// Only present when no native alarm capability exists.
    pub tertiary: Option<Arc<dyn AlarmChannel>>,
}

impl ChannelPlan {
    pub fn select(set: ChannelSet, platform: Platform) -> Self {
        let caps = probe(&set, platform);
        let plan = Self {
            capabilities: caps,
            primary: set.native.filter(|_| caps.has_native_alarms),
            backup: set.push.filter(|_| caps.has_push_backend),
            tertiary: set.timer.filter(|_| caps.has_in_page_timer && !caps.has_native_alarms),
        };
        tracing::info!(
            platform = platform.as_str(),
            native = caps.has_native_alarms,
            push = caps.has_push_backend,
            timer = caps.has_in_page_timer,
            "delivery channels selected"
        );
        plan
    }

    /// Channel currently holding the given kind, if selected.
    pub fn channel(&self, kind: ChannelKind) -> Option<&Arc<dyn AlarmChannel>> {
        match kind {
            ChannelKind::Native => self.primary.as_ref(),
            ChannelKind::Push => self.backup.as_ref(),
            ChannelKind::Timer => self.tertiary.as_ref(),
        }
    }

    pub fn has_any(&self) -> bool {
        self.primary.is_some() || self.backup.is_some() || self.tertiary.is_some()
    }
}

impl std::fmt::Debug for ChannelPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelPlan")
            .field("capabilities", &self.capabilities)
            .field("primary", &self.primary.is_some())
            .field("backup", &self.backup.is_some())
            .field("tertiary", &self.tertiary.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use doseguard_channel::provider::MockChannel;

    fn full_set() -> ChannelSet {
        ChannelSet::default()
            .with_native(Arc::new(MockChannel::new(ChannelKind::Native)))
            .with_push(Arc::new(MockChannel::new(ChannelKind::Push)))
            .with_timer(Arc::new(MockChannel::new(ChannelKind::Timer)))
    }

    #[test]
    fn native_runtime_reports_all() {
        let caps = probe(&full_set(), Platform::Android);
        assert!(caps.has_native_alarms);
        assert!(caps.has_push_backend);
        assert!(caps.has_in_page_timer);
    }

    #[test]
    fn browser_runtime_keeps_only_timer() {
        let caps = probe(&full_set(), Platform::Web);
        assert!(!caps.has_native_alarms);
        assert!(!caps.has_push_backend);
        assert!(caps.has_in_page_timer);

        let plan = ChannelPlan::select(full_set(), Platform::Web);
        assert!(plan.primary.is_none());
        assert!(plan.backup.is_none());
        assert!(plan.tertiary.is_some());
    }

    #[test]
    fn timer_not_used_when_native_exists() {
        let plan = ChannelPlan::select(full_set(), Platform::Desktop);
        assert!(plan.primary.is_some());
        assert!(plan.backup.is_some());
        assert!(plan.tertiary.is_none());
    }

    #[test]
    fn empty_set_has_nothing() {
        let plan = ChannelPlan::select(ChannelSet::default(), Platform::Ios);
        assert!(!plan.has_any());
        assert_eq!(
            plan.capabilities,
            Capabilities {
                has_native_alarms: false,
                has_push_backend: false,
                has_in_page_timer: false,
                platform: Platform::Ios,
            }
        );
    }
}
