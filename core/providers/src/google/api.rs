//! Google Calendar REST API client.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, Utc};
use reqwest::{header, Client};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::debug;
use url::Url;

use crate::adapter::{EventChanges, FetchOutcome};
use crate::http;
use calvault_common::{Error, Event, Result, TimeRange};

const PAGE_SIZE: &str = "250";

/// Calendar list entry.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CalendarListEntry {
    id: String,
    #[serde(default)]
    summary: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CalendarList {
    #[serde(default)]
    items: Vec<CalendarListEntry>,
    #[serde(default)]
    next_page_token: Option<String>,
}

/// Start or end of an event: a timed instant or a whole day.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EventTime {
    DateTime {
        #[serde(rename = "dateTime")]
        date_time: DateTime<FixedOffset>,
    },
    Date {
        date: NaiveDate,
    },
}

impl EventTime {
    fn to_utc(&self) -> (DateTime<Utc>, bool) {
        match self {
            EventTime::DateTime { date_time } => (date_time.with_timezone(&Utc), false),
            EventTime::Date { date } => (date.and_time(NaiveTime::MIN).and_utc(), true),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleEvent {
    id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    start: Option<EventTime>,
    #[serde(default)]
    end: Option<EventTime>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventList {
    #[serde(default)]
    items: Vec<GoogleEvent>,
    #[serde(default)]
    next_page_token: Option<String>,
    #[serde(default)]
    next_sync_token: Option<String>,
}

/// Events of one calendar from a full or incremental listing.
struct CalendarChanges {
    upserted: Vec<Event>,
    removed: Vec<String>,
    sync_token: Option<String>,
}

/// Per-calendar sync tokens.
type SyncTokens = BTreeMap<String, String>;

fn event_id(calendar_id: &str, event_id: &str) -> String {
    format!("{}/{}", calendar_id, event_id)
}

fn convert(calendar: &CalendarListEntry, event: GoogleEvent) -> Option<Event> {
    let (start, all_day) = event.start.as_ref()?.to_utc();
    let end = event
        .end
        .as_ref()
        .map(|e| e.to_utc().0)
        .unwrap_or(start);

    Some(Event {
        id: event_id(&calendar.id, &event.id),
        start,
        end,
        all_day,
        title: event.summary.unwrap_or_else(|| "(No title)".to_string()),
        location: event.location.filter(|l| !l.is_empty()),
        // Series arrive expanded into single instances
        recurrence_rule: None,
        timezone: None,
        exdates: Vec::new(),
        calendar: Some(calendar.summary.clone().unwrap_or_else(|| calendar.id.clone())),
        source_account: String::new(),
    })
}

/// Google Calendar API client.
pub(crate) struct CalendarApi {
    http: Client,
    base: Url,
}

impl CalendarApi {
    pub(crate) fn new(http: Client, api_base: &str) -> Result<Self> {
        let base = Url::parse(api_base)
            .map_err(|e| Error::InvalidInput(format!("Invalid API base URL: {}", e)))?;
        Ok(Self { http, base })
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::InvalidInput("API base URL cannot have a path".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        url: Url,
        access_token: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let context = "Google Calendar API";
        let response = self
            .http
            .get(url)
            .header(header::AUTHORIZATION, format!("Bearer {}", access_token))
            .query(query)
            .send()
            .await
            .map_err(|e| http::transport_error(e, context))?;

        http::check(response, context)?
            .json()
            .await
            .map_err(|e| Error::Network(format!("Failed to parse response: {}", e)))
    }

    async fn list_calendars(&self, access_token: &str) -> Result<Vec<CalendarListEntry>> {
        let url = self.url(&["users", "me", "calendarList"])?;
        let mut calendars = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![("maxResults", PAGE_SIZE)];
            if let Some(token) = page_token.as_deref() {
                query.push(("pageToken", token));
            }
            let page: CalendarList = self.get(url.clone(), access_token, &query).await?;
            calendars.extend(page.items);

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(calendars)
    }

    async fn list_events(
        &self,
        access_token: &str,
        calendar: &CalendarListEntry,
        range: &TimeRange,
        sync_token: Option<&str>,
    ) -> Result<CalendarChanges> {
        let url = self.url(&["calendars", calendar.id.as_str(), "events"])?;
        let time_min = range.start.to_rfc3339();
        let time_max = range.end.to_rfc3339();

        let mut changes = CalendarChanges {
            upserted: Vec::new(),
            removed: Vec::new(),
            sync_token: None,
        };
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![("maxResults", PAGE_SIZE), ("singleEvents", "true")];
            match sync_token {
                // Google rejects time bounds alongside a sync token
                Some(token) => query.push(("syncToken", token)),
                None => {
                    query.push(("timeMin", time_min.as_str()));
                    query.push(("timeMax", time_max.as_str()));
                }
            }
            if let Some(token) = page_token.as_deref() {
                query.push(("pageToken", token));
            }

            let page: EventList = self.get(url.clone(), access_token, &query).await?;
            for event in page.items {
                if event.status.as_deref() == Some("cancelled") {
                    changes.removed.push(event_id(&calendar.id, &event.id));
                } else if let Some(converted) = convert(calendar, event) {
                    changes.upserted.push(converted);
                }
            }

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => {
                    changes.sync_token = page.next_sync_token;
                    break;
                }
            }
        }

        Ok(changes)
    }

    /// Fetch events from every calendar of the account.
    ///
    /// The cursor maps calendar ids to sync tokens. An incremental fetch is
    /// only attempted when the cursor covers exactly the current calendar
    /// set; otherwise a full listing over `range` is returned.
    pub(crate) async fn fetch(
        &self,
        access_token: &str,
        range: &TimeRange,
        cursor: Option<&str>,
    ) -> Result<FetchOutcome> {
        let previous: Option<SyncTokens> = match cursor {
            Some(cursor) => Some(serde_json::from_str(cursor).map_err(|_| {
                Error::CursorExpired("Unreadable Google sync cursor".to_string())
            })?),
            None => None,
        };

        let calendars = self.list_calendars(access_token).await?;
        let incremental = previous.as_ref().is_some_and(|tokens| {
            tokens.len() == calendars.len() && calendars.iter().all(|c| tokens.contains_key(&c.id))
        });

        let mut upserted = Vec::new();
        let mut removed = Vec::new();
        let mut next = SyncTokens::new();
        let mut complete = true;

        for calendar in &calendars {
            let sync_token = previous
                .as_ref()
                .filter(|_| incremental)
                .and_then(|tokens| tokens.get(&calendar.id))
                .map(String::as_str);

            let changes = self
                .list_events(access_token, calendar, range, sync_token)
                .await?;
            upserted.extend(changes.upserted);
            removed.extend(changes.removed);
            match changes.sync_token {
                Some(token) => {
                    next.insert(calendar.id.clone(), token);
                }
                None => complete = false,
            }
        }

        debug!(
            "Fetched {} Google event(s), {} removal(s), from {} calendar(s)",
            upserted.len(),
            removed.len(),
            calendars.len()
        );

        let changes = if incremental {
            EventChanges::Delta { upserted, removed }
        } else {
            EventChanges::Full(upserted)
        };
        // Without a token for every calendar the next fetch must be full
        let cursor = if complete {
            Some(serde_json::to_string(&next)?)
        } else {
            None
        };

        Ok(FetchOutcome { changes, cursor })
    }
}
