use std::time::Duration;

use chat_core::{ChatError, ChatErrorCategory, classify_http_status};
use reqwest::{RequestBuilder, StatusCode, header::RETRY_AFTER};
use serde::de::DeserializeOwned;
use url::Url;

/// Shared reqwest client for the REST endpoints.
pub(crate) fn build_client() -> Result<reqwest::Client, ChatError> {
    reqwest::Client::builder().build().map_err(|err| {
        ChatError::new(
            ChatErrorCategory::Config,
            "http_client_build_failed",
            err.to_string(),
        )
    })
}

/// Join `path` under `api_base`, keeping any path prefix the base carries.
pub(crate) fn api_endpoint(api_base: &Url, path: &str) -> Result<Url, ChatError> {
    let mut base = api_base.clone();
    if !base.path().ends_with('/') {
        let prefixed = format!("{}/", base.path());
        base.set_path(&prefixed);
    }
    base.join(path).map_err(|err| {
        ChatError::new(
            ChatErrorCategory::Config,
            "invalid_api_base",
            format!("cannot derive {path} from {api_base}: {err}"),
        )
    })
}

/// Send `request` and decode a JSON body.
///
/// `scope` prefixes the error codes (`{scope}_timeout`, `{scope}_http_error`
/// and so on) so callers can tell endpoints apart. When `resource` names the
/// addressed entity, a 404 becomes a `NotFound` error for it.
pub(crate) async fn send_json<T>(
    scope: &str,
    request: RequestBuilder,
    resource: Option<&str>,
) -> Result<T, ChatError>
where
    T: DeserializeOwned,
{
    let response = request
        .send()
        .await
        .map_err(|err| map_request_error(scope, &err))?;

    let status = response.status();
    if let (StatusCode::NOT_FOUND, Some(resource)) = (status, resource) {
        return Err(ChatError::new(
            ChatErrorCategory::NotFound,
            format!("{scope}_not_found"),
            format!("{resource} does not exist"),
        ));
    }
    if !status.is_success() {
        let retry_after = retry_after_hint(response.headers().get(RETRY_AFTER));
        let body = response.text().await.unwrap_or_default();
        return Err(map_status_error(scope, status, &body, retry_after));
    }

    response.json::<T>().await.map_err(|err| {
        ChatError::new(
            ChatErrorCategory::Serialization,
            format!("{scope}_decode_failed"),
            err.to_string(),
        )
    })
}

fn map_request_error(scope: &str, err: &reqwest::Error) -> ChatError {
    let (category, suffix) = if err.is_timeout() {
        (ChatErrorCategory::Timeout, "timeout")
    } else if err.is_connect() {
        (ChatErrorCategory::Connection, "unreachable")
    } else {
        (ChatErrorCategory::Connection, "request_failed")
    };
    ChatError::new(category, format!("{scope}_{suffix}"), err.to_string())
}

fn map_status_error(
    scope: &str,
    status: StatusCode,
    body: &str,
    retry_after: Option<Duration>,
) -> ChatError {
    let message = if body.is_empty() {
        format!("{scope} endpoint returned {status}")
    } else {
        format!("{scope} endpoint returned {status}: {body}")
    };
    let mapped = ChatError::new(
        classify_http_status(status.as_u16()),
        format!("{scope}_http_error"),
        message,
    );
    match retry_after {
        Some(delay) => mapped.with_retry_after(delay),
        None => mapped,
    }
}

/// Delay-seconds form only; HTTP-date values are ignored.
fn retry_after_hint(value: Option<&reqwest::header::HeaderValue>) -> Option<Duration> {
    value
        .and_then(|raw| raw.to_str().ok())
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}
