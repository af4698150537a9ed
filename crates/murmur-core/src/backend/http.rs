//! Shared HTTP plumbing for the remote backends.

use std::time::Duration;

use reqwest::{Client, Response, StatusCode};

use crate::runtime::types::BackendError;

pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) fn build_client(timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(concat!("murmur/", env!("CARGO_PKG_VERSION")))
        .timeout(timeout)
        .build()
}

/// 408, 429 and 5xx are worth retrying; every other 4xx is not.
pub(crate) fn classify_status(provider: &str, status: StatusCode, body: &str) -> BackendError {
    let body = body.trim();
    let detail: String = body.chars().take(300).collect();
    let message = if detail.is_empty() {
        format!("{provider} responded with {status}")
    } else {
        format!("{provider} responded with {status}: {detail}")
    };

    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        BackendError::transient(message)
    } else {
        BackendError::permanent(message)
    }
}

/// Connection, timeout and other transport failures are transient; a body
/// that cannot be decoded is permanent.
pub(crate) fn classify_transport(provider: &str, err: &reqwest::Error) -> BackendError {
    if err.is_decode() {
        BackendError::permanent(format!("{provider}: undecodable response: {err}"))
    } else {
        BackendError::transient(format!("{provider}: request failed: {err}"))
    }
}

/// Turn a non-success response into a classified error.
pub(crate) async fn check_status(provider: &str, resp: Response) -> Result<Response, BackendError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(classify_status(provider, status, &body))
}
