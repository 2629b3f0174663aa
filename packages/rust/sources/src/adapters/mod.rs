//! Built-in provider adapters.
//!
//! Each adapter pairs a [`ProviderSpec`] (how to ask the upstream API) with a
//! [`SourceMapping`] (how to read its answer). All of them go through the
//! same [`HttpSource`], so status mapping and schema sniffing stay uniform.

mod angellist;
mod apollo;
mod crunchbase;
mod googlemaps;
mod kaspr;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};
use url::Url;

use leadflow_shared::{LeadflowError, RawPayload, Result, SourcesConfig};

use crate::http::HttpJsonClient;
use crate::normalize::SourceMapping;
use crate::provider::SourceProvider;

pub use angellist::AngelListMapping;
pub use apollo::ApolloMapping;
pub use crunchbase::CrunchbaseMapping;
pub use googlemaps::GoogleMapsMapping;
pub use kaspr::KasprMapping;

// ---------------------------------------------------------------------------
// Spec
// ---------------------------------------------------------------------------

/// How an upstream API expects its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Auth {
    /// Key in a named request header.
    Header(&'static str),
    /// `Authorization: Bearer <key>`.
    Bearer,
    /// Key in a named query parameter.
    Query(&'static str),
}

/// Request shape for one upstream provider.
#[derive(Debug, Clone, Copy)]
pub struct ProviderSpec {
    pub id: &'static str,
    /// Path appended to the configured base URL.
    pub path: &'static str,
    /// Query parameter carrying the identifier.
    pub query_param: &'static str,
    pub auth: Auth,
    /// Keys a well-formed response body must contain.
    pub required_keys: &'static [&'static str],
}

/// Every provider with a built-in adapter.
pub const BUILTIN_SPECS: [&ProviderSpec; 5] = [
    &crunchbase::SPEC,
    &angellist::SPEC,
    &kaspr::SPEC,
    &googlemaps::SPEC,
    &apollo::SPEC,
];

/// Look up the spec for a built-in provider id.
pub fn builtin_spec(id: &str) -> Option<&'static ProviderSpec> {
    BUILTIN_SPECS.into_iter().find(|spec| spec.id == id)
}

/// Mappings for every built-in provider.
pub fn builtin_mappings() -> Vec<Box<dyn SourceMapping>> {
    vec![
        Box::new(CrunchbaseMapping),
        Box::new(AngelListMapping),
        Box::new(KasprMapping),
        Box::new(GoogleMapsMapping),
        Box::new(ApolloMapping),
    ]
}

// ---------------------------------------------------------------------------
// HTTP source
// ---------------------------------------------------------------------------

/// A [`SourceProvider`] backed by a JSON HTTP API.
pub struct HttpSource {
    spec: &'static ProviderSpec,
    endpoint: Url,
    api_key: Option<String>,
    http: HttpJsonClient,
}

impl HttpSource {
    pub fn new(
        spec: &'static ProviderSpec,
        base_url: &str,
        api_key: Option<String>,
        http: HttpJsonClient,
    ) -> Result<Self> {
        let joined = format!("{}/{}", base_url.trim_end_matches('/'), spec.path);
        let endpoint = Url::parse(&joined).map_err(|e| {
            LeadflowError::config(format!("invalid base_url for {}: {e}", spec.id))
        })?;
        if api_key.is_none() {
            debug!(provider = spec.id, "no API key configured");
        }
        Ok(Self {
            spec,
            endpoint,
            api_key,
            http,
        })
    }
}

#[async_trait]
impl SourceProvider for HttpSource {
    fn id(&self) -> &str {
        self.spec.id
    }

    async fn fetch_raw(&self, identifier: &str) -> Result<RawPayload> {
        let mut request = self
            .http
            .client()
            .get(self.endpoint.clone())
            .query(&[(self.spec.query_param, identifier)]);
        if let Some(key) = &self.api_key {
            request = match self.spec.auth {
                Auth::Header(name) => request.header(name, key),
                Auth::Bearer => request.bearer_auth(key),
                Auth::Query(name) => request.query(&[(name, key)]),
            };
        }
        let data = self
            .http
            .get_object(self.spec.id, identifier, request, self.spec.required_keys)
            .await?;
        Ok(RawPayload::new(self.spec.id, data))
    }
}

/// Build the configured HTTP source for `id`.
pub fn build_source(
    id: &str,
    config: &SourcesConfig,
    http: &HttpJsonClient,
) -> Result<Arc<dyn SourceProvider>> {
    let spec = builtin_spec(id)
        .ok_or_else(|| LeadflowError::config(format!("unknown source provider '{id}'")))?;
    let endpoint = config.providers.get(id).ok_or_else(|| {
        LeadflowError::config(format!("no [sources.providers.{id}] endpoint configured"))
    })?;
    let api_key = endpoint.api_key();
    if api_key.is_none() {
        if let Some(var) = &endpoint.api_key_env {
            warn!(provider = id, env = var.as_str(), "API key env var is not set");
        }
    }
    Ok(Arc::new(HttpSource::new(
        spec,
        &endpoint.base_url,
        api_key,
        http.clone(),
    )?))
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Builds configured sources that share one HTTP client.
pub struct AdapterRegistry {
    config: SourcesConfig,
    http: HttpJsonClient,
}

impl AdapterRegistry {
    pub fn from_config(config: &SourcesConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs.max(1));
        Ok(Self {
            config: config.clone(),
            http: HttpJsonClient::new(timeout)?,
        })
    }

    pub fn source(&self, id: &str) -> Result<Arc<dyn SourceProvider>> {
        build_source(id, &self.config, &self.http)
    }

    /// Sources for `ids`, in the given order.
    pub fn sources(&self, ids: &[String]) -> Result<Vec<Arc<dyn SourceProvider>>> {
        ids.iter().map(|id| self.source(id)).collect()
    }
}
