//! Shared plumbing for the HTTP-backed tools.

use std::time::Duration;

use bsj_types::BsjError;

pub(crate) const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

pub(crate) fn unreachable(tool: &str, e: reqwest::Error) -> BsjError {
    BsjError::ToolUnavailable {
        tool: tool.to_string(),
        message: e.to_string(),
    }
}

/// Auth, quota and server failures mean the capability is unusable for this
/// invocation; any other client error is the caller's fault.
pub(crate) async fn check_status(
    tool: &str,
    resp: reqwest::Response,
) -> bsj_types::Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let message = format!("HTTP {}: {}", status.as_u16(), body);
    match status.as_u16() {
        401 | 402 | 403 | 429 | 500..=599 => Err(BsjError::ToolUnavailable {
            tool: tool.to_string(),
            message,
        }),
        _ => Err(BsjError::ToolError {
            tool: tool.to_string(),
            message,
        }),
    }
}

/// Any HTTP answer at all counts as reachable.
pub(crate) async fn probe(
    client: &reqwest::Client,
    tool: &str,
    url: &str,
) -> bsj_types::Result<()> {
    client
        .get(url)
        .timeout(PROBE_TIMEOUT)
        .send()
        .await
        .map(|_| ())
        .map_err(|e| unreachable(tool, e))
}

pub(crate) fn required_str<'a>(
    arguments: &'a serde_json::Value,
    key: &str,
    tool: &str,
) -> bsj_types::Result<&'a str> {
    arguments
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| BsjError::ToolError {
            tool: tool.to_string(),
            message: format!("{key} is required"),
        })
}
