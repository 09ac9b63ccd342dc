//! Google Calendar adapter.
//!
//! Uses the standard OAuth2 authorization-code flow with refresh tokens.
//! The browser part of the flow runs in the external setup UI; this adapter
//! builds the consent URL and exchanges the resulting code.

mod api;
mod auth;

pub use auth::{AuthorizationRequest, CALENDAR_SCOPE};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::adapter::{FetchOutcome, ProviderAdapter, Refresh};
use crate::http;
use api::CalendarApi;
use auth::GoogleAuth;
use calvault_common::{
    CredentialPayload, Error, ProviderKind, ProviderSecret, Result, TimeRange,
};

/// OAuth2 authorization endpoint.
const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
/// OAuth2 token endpoint.
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
/// Calendar API base URL.
const CALENDAR_API_BASE: &str = "https://www.googleapis.com/calendar/v3";
/// Redirect URL for the desktop loopback flow.
const REDIRECT_URL: &str = "http://localhost:8080/callback";

/// Configuration for the Google adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GoogleConfig {
    /// OAuth2 client ID.
    pub client_id: String,
    /// OAuth2 client secret.
    pub client_secret: String,
    /// Redirect URL registered for the client.
    pub redirect_uri: String,
    pub auth_url: String,
    pub token_url: String,
    pub api_base: String,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for GoogleConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            redirect_uri: REDIRECT_URL.to_string(),
            auth_url: GOOGLE_AUTH_URL.to_string(),
            token_url: GOOGLE_TOKEN_URL.to_string(),
            api_base: CALENDAR_API_BASE.to_string(),
            timeout_secs: 30,
        }
    }
}

/// Google Calendar adapter.
pub struct GoogleAdapter {
    auth: GoogleAuth,
    api: CalendarApi,
}

impl GoogleAdapter {
    /// Create an adapter from configuration.
    pub fn new(config: GoogleConfig) -> Result<Self> {
        let http = http::build_client(Duration::from_secs(config.timeout_secs))?;
        let api = CalendarApi::new(http.clone(), &config.api_base)?;
        Ok(Self {
            auth: GoogleAuth::new(http, config),
            api,
        })
    }

    /// Consent URL plus the CSRF state and PKCE verifier for the callback.
    pub fn authorization_request(&self) -> Result<AuthorizationRequest> {
        self.auth.authorization_request()
    }
}

#[async_trait]
impl ProviderAdapter for GoogleAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Google
    }

    async fn authenticate(&self, secret: &ProviderSecret) -> Result<CredentialPayload> {
        let ProviderSecret::GoogleAuthCode {
            code,
            redirect_uri,
            pkce_verifier,
        } = secret
        else {
            return Err(Error::InvalidInput(
                "Google accounts need an authorization code".to_string(),
            ));
        };

        self.auth
            .exchange_code(code, redirect_uri.as_deref(), pkce_verifier.as_deref())
            .await
    }

    async fn refresh(&self, payload: &CredentialPayload) -> Result<Refresh> {
        match payload {
            CredentialPayload::OAuth { refresh_token, .. } => {
                Ok(Refresh::Refreshed(self.auth.refresh(refresh_token).await?))
            }
            CredentialPayload::Password { .. } => Ok(Refresh::NotApplicable),
        }
    }

    async fn fetch_events(
        &self,
        payload: &CredentialPayload,
        range: &TimeRange,
        cursor: Option<&str>,
    ) -> Result<FetchOutcome> {
        let CredentialPayload::OAuth { access_token, .. } = payload else {
            return Err(Error::InvalidInput(
                "Google requires an OAuth credential".to_string(),
            ));
        };
        self.api.fetch(access_token, range, cursor).await
    }
}
