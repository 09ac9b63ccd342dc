//! iCalendar parsing for CalDAV calendar data.

use std::collections::HashMap;

use chrono::{DateTime, Duration, NaiveDateTime, NaiveTime, TimeZone, Utc};
use icalendar::parser::{read_calendar, unfold, Component, Property};
use icalendar::{CalendarDateTime, DatePerhapsTime};
use tracing::{debug, warn};

use calvault_common::recurrence::occurrence_id;
use calvault_common::Event;

/// Parse the VEVENTs of one calendar resource.
///
/// Ids are namespaced by the calendar `href` so equal UIDs in different
/// calendars stay distinct. A series is returned once with its RRULE and
/// EXDATEs. Overridden occurrences (RECURRENCE-ID) are excluded from the
/// series and returned as one-off events carrying the occurrence id.
pub(crate) fn parse_events(data: &str, href: &str, calendar: Option<&str>) -> Vec<Event> {
    let unfolded = unfold(data);
    let parsed = match read_calendar(&unfolded) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("Skipping unparseable calendar data: {}", e);
            return Vec::new();
        }
    };
    let vevents: Vec<&Component<'_>> = parsed
        .components
        .iter()
        .filter(|c| c.name == "VEVENT")
        .collect();

    let mut events = Vec::new();
    let mut masters: HashMap<String, usize> = HashMap::new();
    for vevent in vevents.iter().filter(|c| c.find_prop("RECURRENCE-ID").is_none()) {
        if cancelled(vevent) {
            continue;
        }
        let Some(uid) = vevent.find_prop("UID").map(|p| p.val.to_string()) else {
            continue;
        };
        if let Some(event) = to_event(vevent, event_id(href, &uid), calendar) {
            masters.insert(uid, events.len());
            events.push(event);
        }
    }

    for vevent in vevents.iter().filter(|c| c.find_prop("RECURRENCE-ID").is_some()) {
        let Some(uid) = vevent.find_prop("UID").map(|p| p.val.to_string()) else {
            continue;
        };
        let Some(replaced) = vevent
            .find_prop("RECURRENCE-ID")
            .and_then(|p| DatePerhapsTime::try_from(p).ok())
            .map(|value| to_utc(value).0)
        else {
            debug!("Skipping override of {} with unreadable RECURRENCE-ID", uid);
            continue;
        };

        if let Some(&index) = masters.get(&uid) {
            events[index].exdates.push(replaced);
        }
        if cancelled(vevent) {
            continue;
        }
        let id = occurrence_id(&event_id(href, &uid), replaced);
        if let Some(mut event) = to_event(vevent, id, calendar) {
            event.recurrence_rule = None;
            event.exdates.clear();
            events.push(event);
        }
    }
    events
}

fn event_id(href: &str, uid: &str) -> String {
    format!("{}/{}", href.trim_end_matches('/'), uid)
}

fn cancelled(vevent: &Component<'_>) -> bool {
    vevent
        .find_prop("STATUS")
        .is_some_and(|p| p.val.as_ref() == "CANCELLED")
}

fn to_event(vevent: &Component<'_>, id: String, calendar: Option<&str>) -> Option<Event> {
    let dtstart = vevent.find_prop("DTSTART")?;
    let (start, all_day) = to_utc(DatePerhapsTime::try_from(dtstart).ok()?);
    let end = match vevent
        .find_prop("DTEND")
        .and_then(|p| DatePerhapsTime::try_from(p).ok())
    {
        Some(end) => to_utc(end).0,
        None if all_day => start + Duration::days(1),
        None => start,
    };

    Some(Event {
        id,
        start,
        end,
        all_day,
        title: vevent
            .find_prop("SUMMARY")
            .map(|p| p.val.to_string())
            .unwrap_or_else(|| "(No title)".to_string()),
        location: vevent
            .find_prop("LOCATION")
            .map(|p| p.val.to_string())
            .filter(|l| !l.is_empty()),
        recurrence_rule: vevent.find_prop("RRULE").map(|p| p.val.to_string()),
        timezone: dtstart
            .params
            .iter()
            .find(|p| p.key == "TZID")
            .and_then(|p| p.val.as_ref())
            .map(|tzid| tzid.to_string()),
        exdates: exdates(vevent),
        calendar: calendar.map(str::to_string),
        source_account: String::new(),
    })
}

/// Excluded start instants. One EXDATE line may list several values.
fn exdates(vevent: &Component<'_>) -> Vec<DateTime<Utc>> {
    vevent
        .properties
        .iter()
        .filter(|p| p.name == "EXDATE")
        .flat_map(|prop| {
            prop.val.as_ref().split(',').filter_map(|value| {
                let single = Property {
                    name: prop.name.clone(),
                    val: value.trim().into(),
                    params: prop.params.clone(),
                };
                DatePerhapsTime::try_from(&single).ok().map(|v| to_utc(v).0)
            })
        })
        .collect()
}

/// Convert to UTC. All-day dates start at UTC midnight.
fn to_utc(value: DatePerhapsTime) -> (DateTime<Utc>, bool) {
    match value {
        DatePerhapsTime::Date(date) => (date.and_time(NaiveTime::MIN).and_utc(), true),
        DatePerhapsTime::DateTime(CalendarDateTime::Utc(dt)) => (dt, false),
        DatePerhapsTime::DateTime(CalendarDateTime::Floating(naive)) => (naive.and_utc(), false),
        DatePerhapsTime::DateTime(CalendarDateTime::WithTimezone { date_time, tzid }) => {
            (zoned_to_utc(date_time, &tzid), false)
        }
    }
}

fn zoned_to_utc(local: NaiveDateTime, tzid: &str) -> DateTime<Utc> {
    match tzid.parse::<chrono_tz::Tz>() {
        Ok(tz) => tz
            .from_local_datetime(&local)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| local.and_utc()),
        Err(_) => {
            debug!("Unknown TZID '{}', treating as UTC", tzid);
            local.and_utc()
        }
    }
}
