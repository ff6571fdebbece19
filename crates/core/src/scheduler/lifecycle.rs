use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;

/// Per-occurrence reminder state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmState {
    Unscheduled,
    /// Accepted by the primary channel (or the in-process timer).
    LocalScheduled,
    /// Accepted by the push backend, alone or on top of a local alarm.
    BackupScheduled,
    Delivered,
    /// Skipped: the occurrence was already past due for the only channel left.
    Suppressed,
    Cancelled,
}

impl AlarmState {
    pub fn as_str(self) -> &'static str {
        match self {
            AlarmState::Unscheduled => "unscheduled",
            AlarmState::LocalScheduled => "local_scheduled",
            AlarmState::BackupScheduled => "backup_scheduled",
            AlarmState::Delivered => "delivered",
            AlarmState::Suppressed => "suppressed",
            AlarmState::Cancelled => "cancelled",
        }
    }
}

/// Error when an invalid state transition is attempted.
#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub from: AlarmState,
    pub to: AlarmState,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid transition: {} → {}", self.from.as_str(), self.to.as_str())
    }
}

impl std::error::Error for InvalidTransition {}

/// Validate a reminder state transition.
///
/// Valid transitions:
///   unscheduled → local_scheduled | backup_scheduled | suppressed
///   local_scheduled → backup_scheduled (advisory push accepted)
///   local_scheduled | backup_scheduled → delivered
///   delivered → delivered (repeat callback, e.g. interaction)
///   cancelled → local_scheduled | backup_scheduled | suppressed (re-schedule)
///   any state except cancelled → cancelled
pub fn validate_transition(from: AlarmState, to: AlarmState) -> Result<(), InvalidTransition> {
    use AlarmState::*;
    let valid = matches!(
        (from, to),
        (Unscheduled | Cancelled, LocalScheduled | BackupScheduled | Suppressed)
            | (LocalScheduled, BackupScheduled)
            | (LocalScheduled | BackupScheduled | Delivered, Delivered)
            | (Unscheduled | LocalScheduled | BackupScheduled | Delivered | Suppressed, Cancelled)
    );
    if valid {
        Ok(())
    } else {
        Err(InvalidTransition { from, to })
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Entry {
    state: Option<AlarmState>,
    /// Bumped by every cancel; in-flight attempts compare against it.
    generation: u64,
}

impl Entry {
    fn state(&self) -> AlarmState {
        self.state.unwrap_or(AlarmState::Unscheduled)
    }
}

/// In-process view of every occurrence's reminder state.
#[derive(Debug, Default)]
pub struct LifecycleBook {
    entries: Mutex<HashMap<String, Entry>>,
}

impl LifecycleBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state_of(&self, occurrence_id: &str) -> AlarmState {
        self.entries
            .lock()
            .unwrap()
            .get(occurrence_id)
            .map(Entry::state)
            .unwrap_or(AlarmState::Unscheduled)
    }

    /// Cancel counter for an occurrence. Read before scheduling starts.
    pub fn generation(&self, occurrence_id: &str) -> u64 {
        self.entries
            .lock()
            .unwrap()
            .get(occurrence_id)
            .map(|e| e.generation)
            .unwrap_or(0)
    }

    /// Apply a transition. Invalid ones leave the state unchanged.
    pub fn transition(&self, occurrence_id: &str, to: AlarmState) -> Result<(), InvalidTransition> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(occurrence_id.to_owned()).or_default();
        validate_transition(entry.state(), to)?;
        entry.state = Some(to);
        Ok(())
    }

    /// Apply a transition, logging instead of failing.
    pub fn advance(&self, occurrence_id: &str, to: AlarmState) {
        if let Err(e) = self.transition(occurrence_id, to) {
            tracing::debug!(occurrence_id, error = %e, "lifecycle transition ignored");
        }
    }

    /// Apply a transition only if no cancel happened since `generation` was
    /// read. Returns `false` when a cancel got there first.
    pub fn advance_unless_cancelled(&self, occurrence_id: &str, generation: u64, to: AlarmState) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(occurrence_id.to_owned()).or_default();
        if entry.generation != generation {
            return false;
        }
        match validate_transition(entry.state(), to) {
            Ok(()) => entry.state = Some(to),
            Err(e) => tracing::debug!(occurrence_id, error = %e, "lifecycle transition ignored"),
        }
        true
    }

    /// Mark an occurrence cancelled and invalidate attempts already in flight.
    pub fn cancel(&self, occurrence_id: &str) {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(occurrence_id.to_owned()).or_default();
        entry.generation += 1;
        if validate_transition(entry.state(), AlarmState::Cancelled).is_ok() {
            entry.state = Some(AlarmState::Cancelled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use AlarmState::*;

    #[test]
    fn valid_transitions() {
        let valid_pairs = [
            (Unscheduled, LocalScheduled),
            (Unscheduled, BackupScheduled),
            (Unscheduled, Suppressed),
            (LocalScheduled, BackupScheduled),
            (LocalScheduled, Delivered),
            (BackupScheduled, Delivered),
            (Delivered, Delivered),
            (LocalScheduled, Cancelled),
            (Delivered, Cancelled),
            (Cancelled, LocalScheduled),
        ];
        for (from, to) in &valid_pairs {
            assert!(
                validate_transition(*from, *to).is_ok(),
                "expected {:?} → {:?} to be valid",
                from,
                to
            );
        }
    }

    #[test]
    fn invalid_transitions() {
        let invalid_pairs = [
            (Unscheduled, Delivered),
            (Delivered, LocalScheduled),
            (BackupScheduled, LocalScheduled),
            (Suppressed, Delivered),
            (Cancelled, Cancelled),
            (Cancelled, Delivered),
        ];
        for (from, to) in &invalid_pairs {
            assert!(
                validate_transition(*from, *to).is_err(),
                "expected {:?} → {:?} to be invalid",
                from,
                to
            );
        }
    }

    #[test]
    fn book_tracks_occurrences_independently() {
        let book = LifecycleBook::new();
        book.advance("a", LocalScheduled);
        book.advance("b", LocalScheduled);
        book.advance("a", Cancelled);
        assert_eq!(book.state_of("a"), Cancelled);
        assert_eq!(book.state_of("b"), LocalScheduled);
        assert_eq!(book.state_of("never"), Unscheduled);
    }

    #[test]
    fn invalid_transition_keeps_state() {
        let book = LifecycleBook::new();
        assert!(book.transition("a", Delivered).is_err());
        assert_eq!(book.state_of("a"), Unscheduled);
        let err = InvalidTransition { from: Unscheduled, to: Delivered };
        assert_eq!(err.to_string(), "invalid transition: unscheduled → delivered");
    }

    #[test]
    fn cancel_invalidates_generation() {
        let book = LifecycleBook::new();
        let before = book.generation("a");
        book.cancel("a");
        assert_eq!(book.state_of("a"), Cancelled);
        assert!(!book.advance_unless_cancelled("a", before, LocalScheduled));
        assert_eq!(book.state_of("a"), Cancelled);

        let current = book.generation("a");
        assert!(book.advance_unless_cancelled("a", current, LocalScheduled));
        assert_eq!(book.state_of("a"), LocalScheduled);
    }

    #[test]
    fn repeated_cancel_still_bumps_generation() {
        let book = LifecycleBook::new();
        book.cancel("a");
        let after_first = book.generation("a");
        book.cancel("a");
        assert_eq!(book.state_of("a"), Cancelled);
        assert!(book.generation("a") > after_first);
    }
}
