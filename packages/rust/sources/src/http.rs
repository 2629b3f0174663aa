//! Shared JSON-over-HTTP client for provider adapters.

use std::time::{Duration, Instant};

use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::{Map, Value};
use tracing::debug;

use leadflow_shared::{LeadflowError, Result};

/// User-Agent string for provider requests.
const USER_AGENT: &str = concat!("Leadflow/", env!("CARGO_PKG_VERSION"));

/// One reqwest client shared by every HTTP adapter.
#[derive(Clone)]
pub struct HttpJsonClient {
    client: Client,
}

impl HttpJsonClient {
    /// Build a client whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(timeout)
            .build()
            .map_err(|e| LeadflowError::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// The underlying client, for adapters to build requests.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Send `request` and decode a JSON object body.
    ///
    /// Status mapping: 2xx is the payload, 404 is `NoData`, 429 is
    /// `RateLimited`, anything else is `ProviderUnavailable`. The body must be
    /// an object containing every key in `required`.
    pub async fn get_object(
        &self,
        provider: &str,
        identifier: &str,
        request: RequestBuilder,
        required: &[&str],
    ) -> Result<Map<String, Value>> {
        let started = Instant::now();
        let response = request
            .send()
            .await
            .map_err(|e| map_transport_error(provider, e, started))?;

        let status = response.status();
        debug!(provider, identifier, status = status.as_u16(), "provider responded");
        match status {
            s if s.is_success() => {}
            StatusCode::NOT_FOUND => {
                return Err(LeadflowError::NoData {
                    provider: provider.to_string(),
                    identifier: identifier.to_string(),
                });
            }
            StatusCode::TOO_MANY_REQUESTS => {
                return Err(LeadflowError::RateLimited {
                    provider: provider.to_string(),
                });
            }
            other => {
                return Err(LeadflowError::unavailable(
                    provider,
                    format!("HTTP {}", other.as_u16()),
                ));
            }
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| map_transport_error(provider, e, started))?;
        let value: Value = serde_json::from_slice(&body)
            .map_err(|e| LeadflowError::malformed(provider, format!("invalid JSON: {e}")))?;
        sniff(provider, value, required)
    }
}

fn map_transport_error(provider: &str, err: reqwest::Error, started: Instant) -> LeadflowError {
    if err.is_timeout() {
        LeadflowError::Timeout {
            provider: provider.to_string(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    } else {
        LeadflowError::unavailable(provider, err.to_string())
    }
}

/// Check that `value` is an object carrying every `required` key.
pub fn sniff(provider: &str, value: Value, required: &[&str]) -> Result<Map<String, Value>> {
    let Value::Object(map) = value else {
        return Err(LeadflowError::malformed(provider, "body is not a JSON object"));
    };
    if let Some(missing) = required.iter().find(|key| !map.contains_key(**key)) {
        return Err(LeadflowError::malformed(
            provider,
            format!("missing required key '{missing}'"),
        ));
    }
    Ok(map)
}
