//! GraphQL transport.
//!
//! [`HttpTransport`] posts a query to a GitHub GraphQL endpoint and sorts every
//! failure into transient (retry later) or fatal (give up) before the engine
//! sees it.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use graphql_client::QueryBody;
use reqwest::header::{HeaderMap, ACCEPT, RETRY_AFTER, USER_AGENT};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::budget::RateLimitSnapshot;
use crate::error::{FatalKind, FetchError};

/// Public GitHub GraphQL endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://api.github.com/graphql";

/// Parsed body of a successful GraphQL call.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphqlResponse {
    pub data: Value,
    /// From the body's `rateLimit` field, or the rate-limit headers as a fallback.
    pub rate_limit: Option<RateLimitSnapshot>,
    /// Dotted paths of fields GitHub nulled out as `FORBIDDEN` while still
    /// answering the rest of the query.
    pub denied: Vec<String>,
}

impl GraphqlResponse {
    pub fn new(data: Value, rate_limit: Option<RateLimitSnapshot>) -> Self {
        Self {
            data,
            rate_limit,
            denied: Vec::new(),
        }
    }
}

/// Executes a single GraphQL request.
#[async_trait]
pub trait GraphqlTransport: Send + Sync + fmt::Debug {
    async fn execute(&self, body: QueryBody<Value>) -> Result<GraphqlResponse, FetchError>;
}

/// Turn a GitHub base URL into its GraphQL endpoint.
///
/// `https://github.example.com` becomes `https://api.github.example.com/graphql`.
/// URLs that already point at a `/graphql` path are kept as given.
pub fn normalize_endpoint(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    if trimmed.ends_with("/graphql") {
        return trimmed.to_string();
    }

    let without_scheme = trimmed.rsplit("://").next().unwrap_or(trimmed);
    let host = without_scheme.split('/').next().unwrap_or(without_scheme);
    if host.starts_with("api.") {
        format!("https://{host}/graphql")
    } else {
        format!("https://api.{host}/graphql")
    }
}

/// reqwest-backed transport authenticating with a bearer token.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    endpoint: String,
    token: String,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("endpoint", &self.endpoint)
            .field("token", &"<redacted>")
            .finish()
    }
}

impl HttpTransport {
    /// Build a transport for `endpoint` (normalized) with a per-request timeout.
    pub fn new(endpoint: &str, token: impl Into<String>, timeout: Duration) -> reqwest::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: normalize_endpoint(endpoint),
            token: token.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl GraphqlTransport for HttpTransport {
    async fn execute(&self, body: QueryBody<Value>) -> Result<GraphqlResponse, FetchError> {
        debug!(
            endpoint = %self.endpoint,
            operation = body.operation_name,
            "executing GraphQL request"
        );

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.token)
            .header(ACCEPT, "application/vnd.github+json")
            .header(USER_AGENT, concat!("ghwalk/", env!("CARGO_PKG_VERSION")))
            .json(&body)
            .send()
            .await
            .map_err(|e| FetchError::transient(format!("request failed: {e}")))?;

        let status = response.status();
        let headers = response.headers().clone();
        let text = response
            .text()
            .await
            .map_err(|e| FetchError::transient(format!("failed to read response body: {e}")))?;

        if !status.is_success() {
            let error = classify_status(status, retry_after(&headers), &text);
            warn!(status = status.as_u16(), error = %error, "GraphQL request rejected");
            return Err(error);
        }

        let header_limit = RateLimitSnapshot::from_headers(
            header_str(&headers, "x-ratelimit-remaining"),
            header_str(&headers, "x-ratelimit-reset"),
        );
        interpret_body(&text, header_limit)
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Classify a non-2xx HTTP response.
pub fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> FetchError {
    let message = format!("HTTP {}: {}", status.as_u16(), summarize(body));

    match status {
        StatusCode::TOO_MANY_REQUESTS => FetchError::Transient {
            message,
            retry_after,
        },
        StatusCode::FORBIDDEN
            if retry_after.is_some() || body.to_ascii_lowercase().contains("secondary rate limit") =>
        {
            FetchError::Transient {
                message,
                retry_after,
            }
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FetchError::fatal(FatalKind::Auth, message),
        StatusCode::NOT_FOUND => FetchError::fatal(FatalKind::NotFound, message),
        s if s.is_server_error() => FetchError::Transient {
            message,
            retry_after,
        },
        _ => FetchError::fatal(FatalKind::MalformedQuery, message),
    }
}

fn summarize(body: &str) -> String {
    let body = body.trim();
    if body.is_empty() {
        return "<empty body>".to_string();
    }
    body.chars().take(200).collect()
}

#[derive(Debug, Deserialize)]
struct GithubBody {
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    errors: Option<Vec<GithubError>>,
}

// GitHub puts the error classification in a top-level `type` field.
#[derive(Debug, Deserialize)]
struct GithubError {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    message: String,
    #[serde(default)]
    path: Vec<Value>,
}

impl GithubError {
    /// A permission error on one field of an otherwise answered query.
    fn is_field_denial(&self) -> bool {
        self.kind.as_deref() == Some("FORBIDDEN") && !self.path.is_empty()
    }

    fn dotted_path(&self) -> String {
        self.path
            .iter()
            .map(|segment| match segment {
                Value::String(key) => key.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(".")
    }
}

/// Interpret the body of a 2xx response.
pub fn interpret_body(
    text: &str,
    header_limit: Option<RateLimitSnapshot>,
) -> Result<GraphqlResponse, FetchError> {
    let body: GithubBody = serde_json::from_str(text).map_err(|e| {
        FetchError::fatal(
            FatalKind::MalformedResponse,
            format!("response is not a GraphQL document: {e}"),
        )
    })?;

    let data = body.data.filter(|data| !data.is_null());
    let errors = body.errors.unwrap_or_default();
    let partial = data.is_some() && errors.iter().all(GithubError::is_field_denial);
    if !errors.is_empty() && !partial {
        return Err(classify_graphql_errors(&errors));
    }

    let data = data.ok_or_else(|| {
        FetchError::fatal(
            FatalKind::MalformedResponse,
            "response carried neither data nor errors",
        )
    })?;

    let denied: Vec<String> = errors.iter().map(GithubError::dotted_path).collect();
    if !denied.is_empty() {
        debug!(denied = ?denied, "response has fields the token may not read");
    }
    let rate_limit = RateLimitSnapshot::from_data(&data).or(header_limit);
    Ok(GraphqlResponse {
        denied,
        ..GraphqlResponse::new(data, rate_limit)
    })
}

fn classify_graphql_errors(errors: &[GithubError]) -> FetchError {
    let message = errors
        .iter()
        .map(|e| e.message.as_str())
        .collect::<Vec<_>>()
        .join("; ");

    let kinds: Vec<&str> = errors.iter().filter_map(|e| e.kind.as_deref()).collect();
    if kinds.iter().any(|k| *k == "RATE_LIMITED") {
        FetchError::transient(message)
    } else if kinds.iter().any(|k| *k == "NOT_FOUND") {
        FetchError::fatal(FatalKind::NotFound, message)
    } else if kinds.iter().any(|k| *k == "FORBIDDEN") {
        FetchError::fatal(FatalKind::Auth, message)
    } else {
        FetchError::fatal(FatalKind::MalformedQuery, message)
    }
}
