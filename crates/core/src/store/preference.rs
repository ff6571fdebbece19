use sqlx::PgPool;

use super::StoreError;

/// Per-user backup channel settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupPreferences {
    pub backup_channel_enabled: bool,
    pub backup_channel_token: Option<String>,
}

impl BackupPreferences {
    /// Token to deliver to, when the backup channel is usable at all.
    pub fn usable_token(&self) -> Option<&str> {
        if !self.backup_channel_enabled {
            return None;
        }
        self.backup_channel_token.as_deref().filter(|t| !t.trim().is_empty())
    }
}

/// Source of the user's delivery preferences. Read on every scheduling call.
#[async_trait::async_trait]
pub trait PreferenceStore: Send + Sync {
    async fn backup_preferences(&self, user_id: &str) -> Result<BackupPreferences, StoreError>;
}

/// Reads `notification_preferences`. A missing row means backup disabled.
pub struct PgPreferenceStore {
    pool: PgPool,
}

impl PgPreferenceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl PreferenceStore for PgPreferenceStore {
    async fn backup_preferences(&self, user_id: &str) -> Result<BackupPreferences, StoreError> {
        let row: Option<(bool, Option<String>)> = sqlx::query_as(
            "SELECT push_enabled, push_token FROM notification_preferences WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row
            .map(|(enabled, token)| BackupPreferences {
                backup_channel_enabled: enabled,
                backup_channel_token: token,
            })
            .unwrap_or_default())
    }
}

/// Fixed preferences for ephemeral mode and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticPreferences(pub BackupPreferences);

impl StaticPreferences {
    pub fn enabled(token: impl Into<String>) -> Self {
        Self(BackupPreferences {
            backup_channel_enabled: true,
            backup_channel_token: Some(token.into()),
        })
    }

    pub fn disabled() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl PreferenceStore for StaticPreferences {
    async fn backup_preferences(&self, _user_id: &str) -> Result<BackupPreferences, StoreError> {
        Ok(self.0.clone())
    }
}
