use std::collections::BTreeMap;

use serde::Serialize;

use crate::types::{DeliveryChannel, DeliveryRecord, DeliveryStatus};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChannelTally {
    pub total: usize,
    pub delivered: usize,
}

/// Summary of delivery telemetry over a window.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeliveryStats {
    pub total: usize,
    pub delivered: usize,
    pub failed: usize,
    /// delivered / total × 100; 0 when there are no records.
    pub delivery_rate: f64,
    pub by_channel: BTreeMap<DeliveryChannel, ChannelTally>,
}

pub fn summarize(records: &[DeliveryRecord]) -> DeliveryStats {
    let mut stats = DeliveryStats {
        total: records.len(),
        ..Default::default()
    };
    for rec in records {
        let tally = stats.by_channel.entry(rec.channel).or_default();
        tally.total += 1;
        match rec.status {
            DeliveryStatus::Delivered => {
                stats.delivered += 1;
                tally.delivered += 1;
            }
            DeliveryStatus::Failed => stats.failed += 1,
            DeliveryStatus::Scheduled | DeliveryStatus::Acted => {}
        }
    }
    if stats.total > 0 {
        stats.delivery_rate = stats.delivered as f64 / stats.total as f64 * 100.0;
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AlarmHandle;
    use chrono::Utc;

    fn rec(channel: DeliveryChannel, status: DeliveryStatus) -> DeliveryRecord {
        DeliveryRecord::new(
            Some("d1"),
            channel,
            status,
            "t",
            "b",
            Utc::now(),
            AlarmHandle(1),
            serde_json::Value::Null,
        )
    }

    #[test]
    fn empty_window() {
        let stats = summarize(&[]);
        assert_eq!(stats.total, 0);
        assert_eq!(stats.delivery_rate, 0.0);
        assert!(stats.by_channel.is_empty());
    }

    #[test]
    fn counts_by_status_and_channel() {
        let records = vec![
            rec(DeliveryChannel::Primary, DeliveryStatus::Scheduled),
            rec(DeliveryChannel::Primary, DeliveryStatus::Delivered),
            rec(DeliveryChannel::Backup, DeliveryStatus::Scheduled),
            rec(DeliveryChannel::Primary, DeliveryStatus::Failed),
        ];
        let stats = summarize(&records);
        assert_eq!(stats.total, 4);
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.delivery_rate, 25.0);
        assert_eq!(stats.by_channel[&DeliveryChannel::Primary], ChannelTally { total: 3, delivered: 1 });
        assert_eq!(stats.by_channel[&DeliveryChannel::Backup], ChannelTally { total: 1, delivered: 0 });
    }
}
