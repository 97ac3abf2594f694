//! Per-key revision history.

use chrono::{DateTime, TimeDelta, Utc};
use hashbrown::HashMap;

use crate::model::ValueRef;
use super::flags::Flags;
use super::node::{Node, Targets};

/// Immutable snapshot of a node revision.
#[derive(Debug, Clone)]
pub struct RecordedNode {
    pub since: DateTime<Utc>,
    /// `None` while this is the current revision.
    pub until: Option<DateTime<Utc>>,
    pub key: String,
    pub label: String,
    pub value: Option<ValueRef>,
    pub flags: Flags,
    /// Secondary-index fields of the metadata at the time of recording.
    pub metadata_fields: HashMap<String, Vec<String>>,
    pub targets: Targets,
    /// Only the matched targets changed since the previous revision.
    pub target_update_only: bool,
}

impl RecordedNode {
    pub(crate) fn capture(
        node: &Node,
        metadata_fields: HashMap<String, Vec<String>>,
        target_update_only: bool,
        since: DateTime<Utc>,
    ) -> Self {
        Self {
            since,
            until: None,
            key: node.key.clone(),
            label: node.label.clone(),
            value: node.value.clone(),
            flags: node.flags.clone(),
            metadata_fields,
            targets: node.targets.clone(),
            target_update_only,
        }
    }

    /// Whether the revision was current at `time`.
    pub fn valid_at(&self, time: DateTime<Utc>) -> bool {
        self.since <= time && self.until.is_none_or(|until| time < until)
    }
}

/// Per-value counts of one flag kind over the recorded history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlagStats {
    pub total_count: u32,
    pub per_value_count: HashMap<String, u32>,
}

/// Retention limits for [`trim_timeline`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct Retention {
    pub start_time: DateTime<Utc>,
    pub permanent_init_period: TimeDelta,
    pub age_limit: TimeDelta,
}

/// Drop sealed revisions older than the age limit, except those recorded
/// within the permanent init period after start.
pub(crate) fn trim_timeline(records: &mut Vec<RecordedNode>, now: DateTime<Utc>, ret: Retention) {
    // i = first revision after the init period, j = first one to keep
    let i = records
        .iter()
        .position(|r| r.since - ret.start_time > ret.permanent_init_period)
        .unwrap_or(records.len());
    let mut j = i;
    while j < records.len() {
        match records[j].until {
            None => break,
            Some(until) if now - until <= ret.age_limit => break,
            Some(_) => j += 1,
        }
    }
    if j > i {
        records.drain(i..j);
    }
}

pub(crate) fn to_delta(d: std::time::Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(since: DateTime<Utc>, until: Option<DateTime<Utc>>) -> RecordedNode {
        RecordedNode {
            since,
            until,
            key: "k".into(),
            label: "k".into(),
            value: None,
            flags: Flags::default(),
            metadata_fields: HashMap::new(),
            targets: Targets::default(),
            target_update_only: false,
        }
    }

    #[test]
    fn trimming_keeps_init_period_and_recent() {
        let start = Utc::now();
        let m = |min: i64| start + TimeDelta::minutes(min);
        let mut records = vec![
            rec(m(1), Some(m(2))),
            rec(m(20), Some(m(30))),
            rec(m(30), Some(m(100))),
            rec(m(100), Some(m(190))),
            rec(m(190), None),
        ];
        let ret = Retention {
            start_time: start,
            permanent_init_period: TimeDelta::minutes(10),
            age_limit: TimeDelta::minutes(60),
        };
        trim_timeline(&mut records, m(200), ret);

        let since: Vec<_> = records.iter().map(|r| r.since).collect();
        assert_eq!(since, vec![m(1), m(100), m(190)]);
    }

    #[test]
    fn valid_at_bounds() {
        let t = Utc::now();
        let r = rec(t, Some(t + TimeDelta::seconds(5)));
        assert!(r.valid_at(t));
        assert!(r.valid_at(t + TimeDelta::seconds(4)));
        assert!(!r.valid_at(t + TimeDelta::seconds(5)));
        assert!(!r.valid_at(t - TimeDelta::seconds(1)));
        assert!(rec(t, None).valid_at(t + TimeDelta::days(1)));
    }
}
