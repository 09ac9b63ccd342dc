//! Latest fetched events per account.
//!
//! Readers get a cheap `Arc` clone of the account's event list under a
//! short synchronous lock, so the widget layer never waits on a sync.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use calvault_common::recurrence;
use calvault_common::{Event, TimeRange};
use calvault_providers::EventChanges;

/// In-memory event snapshot shared by the scheduler and readers.
#[derive(Default)]
pub struct EventSnapshot {
    accounts: RwLock<HashMap<String, Arc<Vec<Event>>>>,
}

impl EventSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a fetch result and return the account's event count.
    ///
    /// `Full` replaces the account's events; `Delta` removes and upserts by
    /// event id.
    pub fn apply(&self, label: &str, changes: EventChanges) -> usize {
        let mut accounts = self.accounts.write().unwrap_or_else(PoisonError::into_inner);

        let events = match changes {
            EventChanges::Full(events) => events,
            EventChanges::Delta { upserted, removed } => {
                let mut events: Vec<Event> = accounts
                    .get(label)
                    .map(|current| current.as_ref().clone())
                    .unwrap_or_default();
                events.retain(|event| {
                    !removed.contains(&event.id) && !upserted.iter().any(|u| u.id == event.id)
                });
                events.extend(upserted);
                events
            }
        };

        let count = events.len();
        accounts.insert(label.to_string(), Arc::new(events));
        count
    }

    /// Events of `label` overlapping `range`, sorted by start.
    ///
    /// Recurring series are expanded into their occurrences inside the
    /// range. Empty for accounts that have not completed a sync.
    pub fn events(&self, label: &str, range: &TimeRange) -> Vec<Event> {
        let current = {
            let accounts = self.accounts.read().unwrap_or_else(PoisonError::into_inner);
            accounts.get(label).cloned()
        };

        let Some(current) = current else {
            return Vec::new();
        };

        let mut events: Vec<Event> = current
            .iter()
            .flat_map(|event| recurrence::occurrences(event, range))
            .collect();
        events.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.id.cmp(&b.id)));
        events
    }

    /// Whether the account has a snapshot to merge deltas into.
    pub fn contains(&self, label: &str) -> bool {
        self.accounts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(label)
    }

    /// Drop an account's events.
    pub fn remove(&self, label: &str) {
        self.accounts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(label);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn event(id: &str, hour: u32) -> Event {
        let start = Utc.with_ymd_and_hms(2026, 3, 2, hour, 0, 0).unwrap();
        Event {
            id: id.to_string(),
            start,
            end: start + Duration::hours(1),
            all_day: false,
            title: id.to_string(),
            location: None,
            recurrence_rule: None,
            timezone: None,
            exdates: Vec::new(),
            calendar: None,
            source_account: "Work".to_string(),
        }
    }

    fn day() -> TimeRange {
        let start = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap();
        TimeRange::new(start, start + Duration::days(1)).unwrap()
    }

    #[test]
    fn test_empty_before_first_sync() {
        let snapshot = EventSnapshot::new();
        assert!(snapshot.events("Work", &day()).is_empty());
        assert!(!snapshot.contains("Work"));
    }

    #[test]
    fn test_full_replaces_and_sorts() {
        let snapshot = EventSnapshot::new();
        snapshot.apply("Work", EventChanges::Full(vec![event("old", 8)]));
        let count = snapshot.apply(
            "Work",
            EventChanges::Full(vec![event("late", 15), event("early", 9)]),
        );

        assert_eq!(count, 2);
        let ids: Vec<_> = snapshot
            .events("Work", &day())
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["early", "late"]);
    }

    #[test]
    fn test_delta_merges_by_id() {
        let snapshot = EventSnapshot::new();
        snapshot.apply(
            "Work",
            EventChanges::Full(vec![event("a", 9), event("b", 10), event("c", 11)]),
        );

        let mut moved = event("b", 14);
        moved.title = "moved".to_string();
        snapshot.apply(
            "Work",
            EventChanges::Delta {
                upserted: vec![moved, event("d", 12)],
                removed: vec!["a".to_string()],
            },
        );

        let events = snapshot.events("Work", &day());
        let ids: Vec<_> = events.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "d", "b"]);
        assert_eq!(events[2].title, "moved");
    }

    #[test]
    fn test_recurring_series_expanded_in_range() {
        let snapshot = EventSnapshot::new();
        let mut daily = event("standup", 9);
        daily.start -= Duration::days(3);
        daily.end -= Duration::days(3);
        daily.recurrence_rule = Some("FREQ=DAILY;COUNT=5".to_string());
        daily.exdates = vec![Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()];
        let mut ended = event("retro", 10);
        ended.start -= Duration::days(30);
        ended.end -= Duration::days(30);
        ended.recurrence_rule = Some("FREQ=DAILY;COUNT=2".to_string());
        snapshot.apply("Work", EventChanges::Full(vec![daily, ended, event("lunch", 12)]));

        let events = snapshot.events("Work", &day());
        let ids: Vec<_> = events.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["standup@20260302T090000Z", "lunch"]);
        assert_eq!(events[0].start, Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap());

        // Excluded occurrence of the day before
        let previous = TimeRange::new(day().start - Duration::days(1), day().start).unwrap();
        assert!(snapshot.events("Work", &previous).is_empty());
    }

    #[test]
    fn test_range_filter_and_isolation() {
        let snapshot = EventSnapshot::new();
        let mut tomorrow = event("tomorrow", 9);
        tomorrow.start += Duration::days(1);
        tomorrow.end += Duration::days(1);
        snapshot.apply("Work", EventChanges::Full(vec![event("today", 9), tomorrow]));

        let ids: Vec<_> = snapshot
            .events("Work", &day())
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["today"]);
        assert!(snapshot.events("Personal", &day()).is_empty());

        snapshot.remove("Work");
        assert!(snapshot.events("Work", &day()).is_empty());
    }
}
