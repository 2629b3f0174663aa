//! Source providers for Leadflow.
//!
//! - [`SourceProvider`]: fetch one raw payload per identifier
//! - [`CachedSource`]: cache-checked, deadline-bounded wrapper
//! - [`HttpJsonClient`] and the built-in [`adapters`]
//! - [`Normalizer`]: per-provider mapping onto canonical fields

pub mod adapters;
pub mod cached;
pub mod http;
pub mod normalize;
pub mod provider;

pub use adapters::{AdapterRegistry, HttpSource, ProviderSpec, build_source, builtin_spec};
pub use cached::CachedSource;
pub use http::HttpJsonClient;
pub use normalize::{GenericMapping, Normalizer, SourceMapping};
pub use provider::{SourceProvider, StaticSource};
