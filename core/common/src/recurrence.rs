//! Expansion of recurring events into occurrences.
//!
//! A series is stored once, as its first occurrence plus an RRULE, the
//! excluded start instants and the zone it recurs in. Readers ask for a
//! time range and get the concrete occurrences inside it, honouring COUNT,
//! UNTIL, BY* parts and EXDATEs.

use chrono::{DateTime, Duration, Utc};
use rrule::RRuleSet;
use tracing::warn;

use crate::types::{Event, TimeRange};

/// Upper bound on occurrences produced for one series and range.
pub const MAX_OCCURRENCES: u16 = 1000;

const UTC_STAMP: &str = "%Y%m%dT%H%M%SZ";
const LOCAL_STAMP: &str = "%Y%m%dT%H%M%S";

/// Identifier of one occurrence of a series.
///
/// Overrides of a single occurrence carry the same id, so they replace
/// the generated occurrence.
pub fn occurrence_id(series_id: &str, start: DateTime<Utc>) -> String {
    format!("{}@{}", series_id, start.format(UTC_STAMP))
}

/// Occurrences of `event` overlapping `range`, in start order.
///
/// One-off events yield themselves when they overlap. A series whose rule
/// cannot be evaluated is treated as its first occurrence only.
pub fn occurrences(event: &Event, range: &TimeRange) -> Vec<Event> {
    let Some(rule) = event.recurrence_rule.as_deref() else {
        return if overlaps(event.start, event.end, range) {
            vec![event.clone()]
        } else {
            Vec::new()
        };
    };

    let set: RRuleSet = match rule_set_source(event, rule).parse() {
        Ok(set) => set,
        Err(e) => {
            warn!("Cannot expand recurrence of event {}: {}", event.id, e);
            return if overlaps(event.start, event.end, range) {
                vec![single(event, event.start)]
            } else {
                Vec::new()
            };
        }
    };

    let length = event.end - event.start;
    let tz: rrule::Tz = Utc.into();
    // Occurrences that started before the range may still run into it
    let after = (range.start - length - Duration::seconds(1)).with_timezone(&tz);
    let before = (range.end + Duration::seconds(1)).with_timezone(&tz);
    let result = set.after(after).before(before).all(MAX_OCCURRENCES);
    if result.limited {
        warn!(
            "Recurrence of event {} truncated at {} occurrences",
            event.id, MAX_OCCURRENCES
        );
    }

    result
        .dates
        .iter()
        .map(|date| date.with_timezone(&Utc))
        .filter(|start| overlaps(*start, *start + length, range))
        .map(|start| single(event, start))
        .collect()
}

/// Whether `[start, end)` overlaps `range`. Zero-length events count when
/// their instant lies inside it.
pub(crate) fn overlaps(start: DateTime<Utc>, end: DateTime<Utc>, range: &TimeRange) -> bool {
    if start == end {
        return start >= range.start && start < range.end;
    }
    start < range.end && end > range.start
}

fn single(series: &Event, start: DateTime<Utc>) -> Event {
    Event {
        id: occurrence_id(&series.id, start),
        start,
        end: start + (series.end - series.start),
        recurrence_rule: None,
        exdates: Vec::new(),
        ..series.clone()
    }
}

/// iCalendar text understood by the rrule parser.
fn rule_set_source(event: &Event, rule: &str) -> String {
    let zone = if event.all_day {
        None
    } else {
        event
            .timezone
            .as_deref()
            .filter(|tzid| tzid.parse::<chrono_tz::Tz>().is_ok())
    };
    let stamp = |name: &str, at: DateTime<Utc>| match zone {
        Some(tzid) => {
            let local = tzid
                .parse::<chrono_tz::Tz>()
                .map(|tz| at.with_timezone(&tz).format(LOCAL_STAMP).to_string())
                .unwrap_or_else(|_| at.format(LOCAL_STAMP).to_string());
            format!("{};TZID={}:{}", name, tzid, local)
        }
        None => format!("{}:{}", name, at.format(UTC_STAMP)),
    };

    let mut lines = vec![
        stamp("DTSTART", event.start),
        format!("RRULE:{}", normalize_until(rule)),
    ];
    lines.extend(event.exdates.iter().map(|at| stamp("EXDATE", *at)));
    lines.join("\n")
}

/// The rrule parser wants UNTIL in UTC. Date-only and floating values
/// are read as UTC, a date-only UNTIL covering its whole day.
fn normalize_until(rule: &str) -> String {
    rule.split(';')
        .map(|part| match part.split_once('=') {
            Some((key, value)) if key.eq_ignore_ascii_case("UNTIL") => {
                if value.len() == 8 && value.chars().all(|c| c.is_ascii_digit()) {
                    format!("UNTIL={}T235959Z", value)
                } else if !value.ends_with('Z') {
                    format!("UNTIL={}Z", value)
                } else {
                    part.to_string()
                }
            }
            _ => part.to_string(),
        })
        .collect::<Vec<_>>()
        .join(";")
}
