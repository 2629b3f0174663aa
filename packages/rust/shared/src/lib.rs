//! Shared types, error model, and configuration for Leadflow.
//!
//! This crate is the foundation depended on by all other Leadflow crates.
//! It provides:
//! - [`LeadflowError`], the unified error type
//! - Domain types ([`RawPayload`], [`CanonicalRecord`], [`FinalRecord`], [`Signal`])
//! - Configuration ([`AppConfig`], [`PipelineSettings`], config loading)
//! - An injectable [`Clock`]

pub mod clock;
pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    AppConfig, CacheBackend, CacheConfig, DefaultsConfig, EnrichmentConfig, InsightsConfig,
    OpenRouterConfig, PipelineSettings, ProviderEndpoint, ScoringConfig, SourcesConfig,
    config_dir, config_file_path, expand_home, init_config, load_config, load_config_from,
    validate_api_key,
};
pub use error::{LeadflowError, Result};
pub use types::{
    CanonicalRecord, Confidence, Field, FieldEntry, FinalRecord, MergePolicy, PartialRecord,
    RawPayload, RunId, Signal,
};
