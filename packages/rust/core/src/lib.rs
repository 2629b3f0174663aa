//! Core pipeline orchestration and domain logic for leadflow.
//!
//! This crate ties together sources, the enrichment chain, text insights
//! and scoring into the end-to-end lead pipeline.

pub mod enrichment;
pub mod insights;
pub mod pipeline;
pub mod scoring;
pub mod textservice;

pub use enrichment::{EnrichmentChain, EnrichmentProvider, EnrichmentReport, SourceEnrichment};
pub use insights::{Detection, InsightCache, SignalDetector, StageStatus, Summarizer};
pub use pipeline::{
    BatchReport, Degradation, Pipeline, PipelineBuilder, PipelineInput, PipelineObserver,
    RunOutcome, SilentObserver, Stage,
};
pub use scoring::{RuleBasedStrategy, ScoringEngine, ScoringStrategy, ScoringWeights};
pub use textservice::{CallPolicy, OpenRouterClient, TextRequest, TextService};
