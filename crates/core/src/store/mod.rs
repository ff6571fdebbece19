//! Collaborator stores: where due occurrences and delivery preferences come from.

pub mod occurrence;
pub mod preference;

pub use occurrence::{MemoryOccurrenceStore, OccurrenceStore, PgOccurrenceStore};
pub use preference::{BackupPreferences, PgPreferenceStore, PreferenceStore, StaticPreferences};

/// Error type for collaborator stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}
