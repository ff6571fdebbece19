//! Occurrence id → alarm handle mapping.
//!
//! Rolling 31-multiplier hash over UTF-16 code units with signed 32-bit
//! wraparound, reduced into `[0, 100_000_000)` so the handle fits every
//! platform's notification id field. No seed: handles are stable across
//! restarts.
//!
//! Distinct ids may collide. A collision makes two reminders share one
//! channel slot; that risk is accepted rather than guarded by a global
//! uniqueness index.

use crate::types::AlarmHandle;

/// Upper bound (exclusive) of every handle.
pub const HANDLE_MODULUS: i32 = 100_000_000;

pub fn handle_for(occurrence_id: &str) -> AlarmHandle {
    let hash = occurrence_id
        .encode_utf16()
        .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(i32::from(unit)));
    AlarmHandle((hash % HANDLE_MODULUS).unsigned_abs())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        for id in ["", "d1", "dose-2026-03-01T08:00", "über-dose-✓"] {
            assert_eq!(handle_for(id), handle_for(id));
        }
    }

    #[test]
    fn known_values() {
        assert_eq!(handle_for(""), AlarmHandle(0));
        // 'a' = 97
        assert_eq!(handle_for("a"), AlarmHandle(97));
        // 31 * 100 + 49
        assert_eq!(handle_for("d1"), AlarmHandle(3149));
    }

    #[test]
    fn wraps_and_stays_in_range() {
        let long = "x".repeat(500);
        let h = handle_for(&long);
        assert!(h.0 < HANDLE_MODULUS as u32);
        for i in 0..2000 {
            let h = handle_for(&format!("occurrence-{i}-with-a-long-suffix"));
            assert!(h.0 < HANDLE_MODULUS as u32);
        }
    }

    #[test]
    fn matches_java_string_hash() {
        // Same accumulation as java.lang.String#hashCode.
        assert_eq!(handle_for("hello world"), AlarmHandle(94_106_052));
        assert_eq!(handle_for("dose-42"), AlarmHandle(43_149_358));
    }

    #[test]
    fn negative_hash_folds_to_positive() {
        // Raw hash of "test-123" is -1_148_002_697.
        assert_eq!(handle_for("test-123"), AlarmHandle(48_002_697));
    }

    #[test]
    fn distinct_ids_usually_differ() {
        assert_ne!(handle_for("d1"), handle_for("d2"));
    }
}
