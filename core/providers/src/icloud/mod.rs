//! iCloud Calendar adapter over CalDAV.
//!
//! Authenticates with an Apple ID and an app-specific password (HTTP Basic).
//! Discovery follows the usual CalDAV chain: current-user-principal, then
//! calendar-home-set, then the calendar collections. Each calendar's
//! `getctag` changes whenever its contents change, so the sync cursor is the
//! set of ctags seen on the previous fetch together with the window it
//! covered.

mod caldav;
mod ics;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::adapter::{EventChanges, FetchOutcome, ProviderAdapter, Refresh};
use crate::http;
use caldav::CalendarInfo;
use calvault_common::{
    CredentialPayload, Error, ProviderKind, ProviderSecret, Result, TimeRange,
};

/// Default iCloud CalDAV endpoint.
pub const ICLOUD_CALDAV_URL: &str = "https://caldav.icloud.com/";

/// iCloud adapter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ICloudConfig {
    /// CalDAV discovery endpoint.
    pub base_url: String,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for ICloudConfig {
    fn default() -> Self {
        Self {
            base_url: ICLOUD_CALDAV_URL.to_string(),
            timeout_secs: 30,
        }
    }
}

type Ctags = BTreeMap<String, String>;

/// What a previous fetch saw.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct SyncCursor {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    ctags: Ctags,
}

impl SyncCursor {
    fn covers(&self, range: &TimeRange) -> bool {
        self.start <= range.start && self.end >= range.end
    }
}

/// CalDAV adapter for iCloud.
pub struct ICloudAdapter {
    http: Client,
    base_url: Url,
}

struct BasicAuth<'a> {
    user: &'a str,
    password: &'a str,
}

impl ICloudAdapter {
    /// Create an adapter from configuration.
    pub fn new(config: ICloudConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| Error::InvalidInput(format!("Invalid CalDAV URL: {}", e)))?;
        let http = http::build_client(Duration::from_secs(config.timeout_secs))?;
        Ok(Self { http, base_url })
    }

    fn resolve(&self, href: &str) -> Result<Url> {
        self.base_url
            .join(href)
            .map_err(|e| Error::Network(format!("Invalid href '{}' from server: {}", href, e)))
    }

    async fn dav_request(
        &self,
        method: &'static str,
        url: Url,
        depth: &'static str,
        body: String,
        auth: &BasicAuth<'_>,
    ) -> Result<String> {
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|e| Error::InvalidInput(format!("Invalid method: {}", e)))?;
        let context = format!("CalDAV {}", method);

        let response = self
            .http
            .request(method, url)
            .basic_auth(auth.user, Some(auth.password))
            .header("Depth", depth)
            .header(
                CONTENT_TYPE,
                HeaderValue::from_static("application/xml; charset=utf-8"),
            )
            .body(body)
            .send()
            .await
            .map_err(|e| http::transport_error(e, &context))?;

        http::check(response, &context)?
            .text()
            .await
            .map_err(|e| http::transport_error(e, &context))
    }

    async fn principal(&self, auth: &BasicAuth<'_>) -> Result<Url> {
        let body = self
            .dav_request(
                "PROPFIND",
                self.base_url.clone(),
                "0",
                caldav::PRINCIPAL_BODY.to_string(),
                auth,
            )
            .await?;
        let href = caldav::find_property_href(&body, "current-user-principal")?
            .ok_or_else(|| Error::Auth("No principal returned for Apple ID".to_string()))?;
        self.resolve(&href)
    }

    async fn discover_calendars(&self, auth: &BasicAuth<'_>) -> Result<Vec<CalendarInfo>> {
        let principal = self.principal(auth).await?;

        let body = self
            .dav_request(
                "PROPFIND",
                principal,
                "0",
                caldav::HOME_SET_BODY.to_string(),
                auth,
            )
            .await?;
        let home = caldav::find_property_href(&body, "calendar-home-set")?
            .ok_or_else(|| Error::Network("No calendar home returned".to_string()))?;

        let body = self
            .dav_request(
                "PROPFIND",
                self.resolve(&home)?,
                "1",
                caldav::CALENDARS_BODY.to_string(),
                auth,
            )
            .await?;
        caldav::parse_calendars(&body)
    }
}

fn credentials(payload: &CredentialPayload) -> Result<BasicAuth<'_>> {
    match payload {
        CredentialPayload::Password { apple_id, password } => Ok(BasicAuth {
            user: apple_id,
            password,
        }),
        CredentialPayload::OAuth { .. } => Err(Error::InvalidInput(
            "iCloud requires an Apple ID credential".to_string(),
        )),
    }
}

fn parse_cursor(cursor: Option<&str>) -> Option<SyncCursor> {
    // An unreadable cursor only costs a full fetch
    cursor.and_then(|c| serde_json::from_str(c).ok())
}

#[async_trait]
impl ProviderAdapter for ICloudAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::ICloud
    }

    async fn authenticate(&self, secret: &ProviderSecret) -> Result<CredentialPayload> {
        let ProviderSecret::AppleId {
            apple_id,
            app_password,
        } = secret
        else {
            return Err(Error::InvalidInput(
                "iCloud accounts need an Apple ID and app-specific password".to_string(),
            ));
        };

        let auth = BasicAuth {
            user: apple_id,
            password: app_password,
        };
        self.principal(&auth).await?;
        debug!("Verified iCloud credentials");

        Ok(CredentialPayload::Password {
            apple_id: apple_id.clone(),
            password: app_password.clone(),
        })
    }

    async fn refresh(&self, _payload: &CredentialPayload) -> Result<Refresh> {
        Ok(Refresh::NotApplicable)
    }

    async fn fetch_events(
        &self,
        payload: &CredentialPayload,
        range: &TimeRange,
        cursor: Option<&str>,
    ) -> Result<FetchOutcome> {
        let auth = credentials(payload)?;
        let calendars = self.discover_calendars(&auth).await?;

        // Calendars without a ctag cannot be compared, so no cursor
        let ctags: Option<Ctags> = calendars
            .iter()
            .map(|c| c.ctag.clone().map(|tag| (c.href.clone(), tag)))
            .collect();

        if let (Some(previous), Some(current)) = (parse_cursor(cursor), ctags.as_ref()) {
            if &previous.ctags == current && previous.covers(range) {
                debug!("No iCloud calendar changed since last fetch");
                return Ok(FetchOutcome {
                    changes: EventChanges::unchanged(),
                    cursor: cursor.map(str::to_string),
                });
            }
        }
        let next_cursor = ctags
            .map(|ctags| {
                serde_json::to_string(&SyncCursor {
                    start: range.start,
                    end: range.end,
                    ctags,
                })
            })
            .transpose()?;

        let body = caldav::calendar_query_body(range.start, range.end);
        let mut events = Vec::new();
        for calendar in &calendars {
            let report = self
                .dav_request("REPORT", self.resolve(&calendar.href)?, "1", body.clone(), &auth)
                .await?;
            for resource in caldav::parse_calendar_resources(&report)? {
                let parsed =
                    ics::parse_events(&resource.data, &calendar.href, calendar.name.as_deref());
                if parsed.is_empty() {
                    debug!("No usable events in {}", resource.href);
                }
                events.extend(parsed);
            }
        }
        debug!(
            "Fetched {} iCloud event(s) from {} calendar(s)",
            events.len(),
            calendars.len()
        );

        Ok(FetchOutcome {
            changes: EventChanges::Full(events),
            cursor: next_cursor,
        })
    }
}
