//! OAuth2 authorization-code and refresh-token flows for Google.
//!
//! Consent URLs are built with the `oauth2` crate. Token requests are
//! plain form posts over the adapter's own HTTP client, parsed into the
//! crate's standard token and error response types.

use chrono::{Duration, Utc};
use oauth2::basic::{BasicClient, BasicErrorResponse, BasicErrorResponseType, BasicTokenResponse};
use oauth2::{
    AuthUrl, ClientId, ClientSecret, CsrfToken, PkceCodeChallenge, RedirectUrl, Scope,
    TokenResponse, TokenUrl,
};
use reqwest::Client;
use tracing::{debug, info};

use super::GoogleConfig;
use crate::http;
use calvault_common::{CredentialPayload, Error, Result};

/// Read-only calendar access.
pub const CALENDAR_SCOPE: &str = "https://www.googleapis.com/auth/calendar.readonly";

const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

/// Consent URL and the values the setup flow must keep until the callback.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    /// URL to open in the browser.
    pub url: String,
    /// Expected `state` parameter on the callback.
    pub csrf_state: String,
    /// PKCE verifier to send with the authorization code.
    pub pkce_verifier: String,
}

/// Which token grant is being performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Grant {
    AuthorizationCode,
    RefreshToken,
}

/// Token endpoint client.
pub(crate) struct GoogleAuth {
    http: Client,
    config: GoogleConfig,
}

impl GoogleAuth {
    pub(crate) fn new(http: Client, config: GoogleConfig) -> Self {
        Self { http, config }
    }

    /// Build the consent URL.
    ///
    /// Requests offline access with a forced consent prompt so Google
    /// issues a refresh token, and protects the code with PKCE (S256).
    pub(crate) fn authorization_request(&self) -> Result<AuthorizationRequest> {
        let client = BasicClient::new(ClientId::new(self.config.client_id.clone()))
            .set_auth_uri(
                AuthUrl::new(self.config.auth_url.clone())
                    .map_err(|e| Error::InvalidInput(format!("Invalid auth URL: {}", e)))?,
            )
            .set_redirect_uri(
                RedirectUrl::new(self.config.redirect_uri.clone())
                    .map_err(|e| Error::InvalidInput(format!("Invalid redirect URL: {}", e)))?,
            );

        let (challenge, verifier) = PkceCodeChallenge::new_random_sha256();
        let (url, csrf_token) = client
            .authorize_url(CsrfToken::new_random)
            .add_scope(Scope::new(CALENDAR_SCOPE.to_string()))
            .add_extra_param("access_type", "offline")
            .add_extra_param("prompt", "consent")
            .set_pkce_challenge(challenge)
            .url();

        Ok(AuthorizationRequest {
            url: url.to_string(),
            csrf_state: csrf_token.secret().clone(),
            pkce_verifier: verifier.secret().clone(),
        })
    }

    /// Exchange an authorization code for tokens.
    ///
    /// # Errors
    /// - `Auth` if the code is rejected or no refresh token is issued
    /// - `Network` on transport failures
    pub(crate) async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: Option<&str>,
        pkce_verifier: Option<&str>,
    ) -> Result<CredentialPayload> {
        let redirect_uri = redirect_uri.unwrap_or(&self.config.redirect_uri);
        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
        ];
        if let Some(verifier) = pkce_verifier {
            form.push(("code_verifier", verifier));
        }

        let token = self.token_request(&form, Grant::AuthorizationCode).await?;
        let refresh_token = token
            .refresh_token()
            .ok_or_else(|| {
                Error::Auth(
                    "No refresh token received. Offline access and the consent prompt are required."
                        .to_string(),
                )
            })?
            .secret()
            .clone();

        info!("Exchanged Google authorization code");
        Ok(payload_from(&token, refresh_token))
    }

    /// Obtain a new access token.
    ///
    /// A refresh token in the response replaces the old one; otherwise the
    /// old one is kept.
    ///
    /// # Errors
    /// - `ReauthRequired` if Google answers `invalid_grant`
    /// - `Network` on transport or server failures
    pub(crate) async fn refresh(&self, refresh_token: &str) -> Result<CredentialPayload> {
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];
        let token = self.token_request(&form, Grant::RefreshToken).await?;

        let refresh_token = token
            .refresh_token()
            .map(|t| t.secret().clone())
            .unwrap_or_else(|| refresh_token.to_string());

        debug!("Refreshed Google access token");
        Ok(payload_from(&token, refresh_token))
    }

    async fn token_request(
        &self,
        form: &[(&str, &str)],
        grant: Grant,
    ) -> Result<BasicTokenResponse> {
        let context = "Google token request";
        let response = self
            .http
            .post(&self.config.token_url)
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .form(form)
            .send()
            .await
            .map_err(|e| http::transport_error(e, context))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| http::transport_error(e, context))?;

        if status.is_success() {
            return serde_json::from_slice(&body)
                .map_err(|e| Error::Network(format!("Malformed token response: {}", e)));
        }

        if status.is_client_error() {
            if let Ok(error) = serde_json::from_slice::<BasicErrorResponse>(&body) {
                return Err(classify_token_error(&error, grant));
            }
        }
        Err(http::status_error(status, context))
    }
}

fn classify_token_error(error: &BasicErrorResponse, grant: Grant) -> Error {
    let description = error
        .error_description()
        .cloned()
        .unwrap_or_else(|| error.error().to_string());

    match (error.error(), grant) {
        (BasicErrorResponseType::InvalidGrant, Grant::RefreshToken) => {
            Error::ReauthRequired(format!("Refresh token rejected: {}", description))
        }
        _ => Error::Auth(format!("Token request rejected: {}", description)),
    }
}

fn payload_from(token: &BasicTokenResponse, refresh_token: String) -> CredentialPayload {
    let lifetime = token
        .expires_in()
        .and_then(|d| Duration::from_std(d).ok())
        .unwrap_or_else(|| Duration::seconds(DEFAULT_TOKEN_LIFETIME_SECS));

    CredentialPayload::OAuth {
        access_token: token.access_token().secret().clone(),
        refresh_token,
        expires_at: Utc::now() + lifetime,
    }
}
