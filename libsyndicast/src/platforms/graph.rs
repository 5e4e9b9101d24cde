//! Shared Meta Graph API request handling for Instagram and Facebook

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::error::PlatformError;
use crate::platforms::{classify_status, map_reqwest_error};

#[derive(Debug, Default, Deserialize)]
pub(crate) struct GraphError {
    pub message: Option<String>,
    pub code: Option<i64>,
}

/// Send a Graph API request and decode the success body
pub(crate) async fn send<T: DeserializeOwned>(
    request: reqwest::RequestBuilder,
    what: &str,
) -> Result<T, PlatformError> {
    let response = request.send().await.map_err(map_reqwest_error)?;
    let status = response.status();
    let body = response.text().await.map_err(map_reqwest_error)?;

    let value: Value = serde_json::from_str(&body).map_err(|_| {
        classify_status(
            status.as_u16(),
            format!("{} returned HTTP {} with an unreadable body", what, status),
        )
    })?;

    if let Some(error) = value.get("error") {
        let error: GraphError = serde_json::from_value(error.clone()).unwrap_or_default();
        return Err(classify_graph_error(status.as_u16(), what, error));
    }
    if !status.is_success() {
        return Err(classify_status(
            status.as_u16(),
            format!("{} returned HTTP {}", what, status),
        ));
    }

    serde_json::from_value(value)
        .map_err(|e| PlatformError::Rejected(format!("{} returned an unexpected body: {}", what, e)))
}

pub(crate) fn classify_graph_error(status: u16, what: &str, error: GraphError) -> PlatformError {
    let message = format!(
        "{} failed ({}): {}",
        what,
        error.code.map(|c| c.to_string()).unwrap_or_else(|| status.to_string()),
        error.message.unwrap_or_else(|| "no message".to_string())
    );
    match error.code {
        Some(190) | Some(10) | Some(200..=299) => PlatformError::Authentication(message),
        Some(4) | Some(17) | Some(32) | Some(613) => PlatformError::QuotaExceeded(message),
        Some(1) | Some(2) => PlatformError::Network(message),
        // media not yet available for publishing
        Some(9007) => PlatformError::MediaNotReady(message),
        _ => classify_status(status, message),
    }
}
