//! CalDAV request bodies and multistatus parsing.

use chrono::{DateTime, Utc};

use calvault_common::{Error, Result};

pub(crate) const PRINCIPAL_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:">
    <d:prop>
        <d:current-user-principal/>
    </d:prop>
</d:propfind>"#;

pub(crate) const HOME_SET_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav">
    <d:prop>
        <c:calendar-home-set/>
    </d:prop>
</d:propfind>"#;

pub(crate) const CALENDARS_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:" xmlns:cs="http://calendarserver.org/ns/" xmlns:c="urn:ietf:params:xml:ns:caldav">
    <d:prop>
        <d:displayname/>
        <d:resourcetype/>
        <cs:getctag/>
        <c:supported-calendar-component-set/>
    </d:prop>
</d:propfind>"#;

/// Build a calendar-query REPORT body with a time-range filter.
pub(crate) fn calendar_query_body(start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<c:calendar-query xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav">
    <d:prop>
        <d:getetag/>
        <c:calendar-data/>
    </d:prop>
    <c:filter>
        <c:comp-filter name="VCALENDAR">
            <c:comp-filter name="VEVENT">
                <c:time-range start="{}" end="{}"/>
            </c:comp-filter>
        </c:comp-filter>
    </c:filter>
</c:calendar-query>"#,
        format_caldav_datetime(start),
        format_caldav_datetime(end)
    )
}

/// Format an instant for CalDAV time-range queries (`YYYYMMDDTHHMMSSZ`).
pub(crate) fn format_caldav_datetime(dt: DateTime<Utc>) -> String {
    dt.format("%Y%m%dT%H%M%SZ").to_string()
}

/// A calendar collection from the calendar home.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CalendarInfo {
    pub href: String,
    pub name: Option<String>,
    pub ctag: Option<String>,
}

/// A calendar object resource returned by a REPORT.
#[derive(Debug)]
pub(crate) struct CalendarResource {
    pub href: String,
    pub data: String,
}

fn parse(text: &str) -> Result<roxmltree::Document<'_>> {
    roxmltree::Document::parse(text)
        .map_err(|e| Error::Network(format!("Malformed CalDAV response: {}", e)))
}

fn child_text<'a>(node: roxmltree::Node<'a, '_>, name: &str) -> Option<&'a str> {
    node.descendants()
        .find(|n| n.tag_name().name() == name)
        .and_then(|n| n.text())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Find the href nested in the first `property` element.
pub(crate) fn find_property_href(body: &str, property: &str) -> Result<Option<String>> {
    let doc = parse(body)?;
    let href = doc
        .descendants()
        .find(|n| n.tag_name().name() == property)
        .and_then(|n| child_text(n, "href"))
        .map(str::to_string);
    Ok(href)
}

/// Calendar collections listed in a Depth 1 PROPFIND of the calendar home.
///
/// Only collections whose resourcetype includes `calendar` and that accept
/// VEVENT components are returned.
pub(crate) fn parse_calendars(body: &str) -> Result<Vec<CalendarInfo>> {
    let doc = parse(body)?;
    let mut calendars = Vec::new();

    for response in doc
        .descendants()
        .filter(|n| n.tag_name().name() == "response")
    {
        let Some(href) = child_text(response, "href") else {
            continue;
        };

        let is_calendar = response
            .descendants()
            .filter(|n| n.tag_name().name() == "resourcetype")
            .flat_map(|n| n.children())
            .any(|n| n.tag_name().name() == "calendar");
        if !is_calendar {
            continue;
        }

        let components: Vec<_> = response
            .descendants()
            .filter(|n| n.tag_name().name() == "comp")
            .filter_map(|n| n.attribute("name"))
            .collect();
        if !components.is_empty() && !components.contains(&"VEVENT") {
            continue;
        }

        calendars.push(CalendarInfo {
            href: href.to_string(),
            name: child_text(response, "displayname").map(str::to_string),
            ctag: child_text(response, "getctag").map(str::to_string),
        });
    }

    Ok(calendars)
}

/// Calendar resources with their iCalendar data.
pub(crate) fn parse_calendar_resources(body: &str) -> Result<Vec<CalendarResource>> {
    let doc = parse(body)?;
    let mut resources = Vec::new();

    for response in doc
        .descendants()
        .filter(|n| n.tag_name().name() == "response")
    {
        let Some(href) = child_text(response, "href") else {
            continue;
        };
        // Resources without calendar data are skipped
        if let Some(data) = child_text(response, "calendar-data") {
            resources.push(CalendarResource {
                href: href.to_string(),
                data: data.to_string(),
            });
        }
    }

    Ok(resources)
}
