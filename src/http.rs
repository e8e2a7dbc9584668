//! Shared HTTP plumbing for the Machines and logs APIs.

use std::sync::LazyLock;
use std::time::Duration;

use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;

use crate::error::ProviderError;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const MACAROON_PREFIX: &str = "FlyV1 ";

pub(crate) static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

/// Value for the `Authorization` header. Macaroon tokens already carry
/// their scheme; anything else is sent as a bearer token.
pub(crate) fn authorization_value(token: &str) -> String {
    if token.starts_with(MACAROON_PREFIX) {
        token.to_owned()
    } else {
        format!("Bearer {token}")
    }
}

/// Sends `request` and returns the status with the raw body.
pub(crate) async fn send(
    request: RequestBuilder,
    authorization: &str,
) -> Result<(StatusCode, Vec<u8>), ProviderError> {
    let response = request
        .header(reqwest::header::AUTHORIZATION, authorization)
        .send()
        .await?;
    let status = response.status();
    let body = response.bytes().await?;
    Ok((status, body.to_vec()))
}

/// Sends `request` and fails with [`ProviderError::RemoteApi`] unless the
/// status is 2xx.
pub(crate) async fn send_expecting_success(
    request: RequestBuilder,
    authorization: &str,
) -> Result<Vec<u8>, ProviderError> {
    let (status, body) = send(request, authorization).await?;
    if status.is_success() {
        return Ok(body);
    }
    Err(remote_error(status, &body))
}

pub(crate) fn remote_error(status: StatusCode, body: &[u8]) -> ProviderError {
    ProviderError::RemoteApi {
        status: status.as_u16(),
        body: String::from_utf8_lossy(body).into_owned(),
    }
}

pub(crate) fn decode<T: DeserializeOwned>(what: &str, body: &[u8]) -> Result<T, ProviderError> {
    serde_json::from_slice(body).map_err(|err| ProviderError::Decode {
        what: what.to_owned(),
        message: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("tok", "Bearer tok")]
    #[case("FlyV1 fm2_abc", "FlyV1 fm2_abc")]
    fn authorization_value_respects_macaroons(#[case] token: &str, #[case] expected: &str) {
        assert_eq!(authorization_value(token), expected);
    }
}
