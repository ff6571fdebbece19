use std::sync::Arc;

use doseguard_channel::provider::AlarmChannel;
use serde::Serialize;

use crate::probe::ChannelPlan;
use crate::types::{ChannelKind, PermissionState};

/// Permission per channel kind. A channel that is not selected reports `Denied`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PermissionReport {
    pub native: PermissionState,
    pub push: PermissionState,
    pub timer: PermissionState,
}

impl PermissionReport {
    pub fn get(&self, kind: ChannelKind) -> PermissionState {
        match kind {
            ChannelKind::Native => self.native,
            ChannelKind::Push => self.push,
            ChannelKind::Timer => self.timer,
        }
    }
}

/// Reads and requests permissions for the selected channels.
#[derive(Debug, Clone)]
pub struct PermissionNegotiator {
    plan: ChannelPlan,
}

impl PermissionNegotiator {
    pub fn new(plan: ChannelPlan) -> Self {
        Self { plan }
    }

    /// Read every channel's permission. Never prompts; safe to call repeatedly.
    pub async fn check_all(&self) -> PermissionReport {
        PermissionReport {
            native: self.check(ChannelKind::Native).await,
            push: self.check(ChannelKind::Push).await,
            timer: self.check(ChannelKind::Timer).await,
        }
    }

    /// Read one channel's permission fresh. Errors read as `Undetermined`.
    pub async fn check(&self, kind: ChannelKind) -> PermissionState {
        let Some(channel) = self.plan.channel(kind) else {
            return PermissionState::Denied;
        };
        match channel.check_permission().await {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(channel = kind.as_str(), error = %e, "permission check failed");
                PermissionState::Undetermined
            }
        }
    }

    /// Ask for every channel's permission. May prompt the user; only call explicitly.
    /// Each request is independent: one failing never changes another's result.
    pub async fn request_all(&self) -> PermissionReport {
        let native = request(self.plan.channel(ChannelKind::Native)).await;
        let push = request(self.plan.channel(ChannelKind::Push)).await;
        let timer = request(self.plan.channel(ChannelKind::Timer)).await;
        tracing::info!(
            native = native.as_str(),
            push = push.as_str(),
            timer = timer.as_str(),
            "permissions requested"
        );
        PermissionReport { native, push, timer }
    }
}

async fn request(channel: Option<&Arc<dyn AlarmChannel>>) -> PermissionState {
    let Some(channel) = channel else {
        return PermissionState::Denied;
    };
    match channel.request_permission().await {
        Ok(state) => state,
        Err(e) => {
            tracing::warn!(channel = channel.kind().as_str(), error = %e, "permission request failed");
            PermissionState::Undetermined
        }
    }
}
