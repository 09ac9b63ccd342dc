//! Shared HTTP client setup and response classification.

use reqwest::{Client, Response, StatusCode};
use std::time::Duration;

use calvault_common::{Error, Result};

const USER_AGENT: &str = concat!("CalVault/", env!("CARGO_PKG_VERSION"));

/// Build the HTTP client used by an adapter.
pub fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .connect_timeout(timeout)
        .build()
        .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))
}

/// Map a non-success status to the error the scheduler acts on.
///
/// - 401, 403: `Auth`
/// - 410: `CursorExpired`
/// - 404: `NotFound`
/// - 429, 5xx: `Network` (retried)
/// - any other 4xx: `InvalidInput` (not retried)
pub fn status_error(status: StatusCode, context: &str) -> Error {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Error::Auth(format!("{}: provider rejected credentials ({})", context, status))
        }
        StatusCode::GONE => {
            Error::CursorExpired(format!("{}: sync cursor no longer valid", context))
        }
        StatusCode::NOT_FOUND => Error::NotFound(format!("{}: resource not found", context)),
        StatusCode::TOO_MANY_REQUESTS => Error::Network(format!("{}: rate limited", context)),
        s if s.is_server_error() => Error::Network(format!("{}: server error {}", context, s)),
        s => Error::InvalidInput(format!("{}: request rejected ({})", context, s)),
    }
}

/// Map a transport failure.
pub fn transport_error(err: reqwest::Error, context: &str) -> Error {
    if err.is_timeout() {
        Error::Network(format!("{}: request timed out", context))
    } else {
        Error::Network(format!("{}: {}", context, err))
    }
}

/// Pass through successful responses, classify the rest.
pub fn check(response: Response, context: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(status_error(status, context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(status_error(StatusCode::UNAUTHORIZED, "x").requires_reauth());
        assert!(status_error(StatusCode::FORBIDDEN, "x").requires_reauth());
        assert!(status_error(StatusCode::SERVICE_UNAVAILABLE, "x").is_transient());
        assert!(status_error(StatusCode::TOO_MANY_REQUESTS, "x").is_transient());
        assert!(matches!(
            status_error(StatusCode::GONE, "x"),
            Error::CursorExpired(_)
        ));
        assert!(matches!(
            status_error(StatusCode::BAD_REQUEST, "x"),
            Error::InvalidInput(_)
        ));
    }
}
