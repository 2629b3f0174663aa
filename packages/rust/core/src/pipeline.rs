//! End-to-end lead pipeline: fetch → normalize → enrich → summarize →
//! detect signals → score → save.
//!
//! Each identifier moves through the stages sequentially; identifiers run
//! concurrently on a bounded pool. Only source exhaustion, cancellation and
//! sink failures fail an identifier; everything after fetching degrades.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use leadflow_shared::{
    AppConfig, CanonicalRecord, FinalRecord, LeadflowError, PipelineSettings, RawPayload, Result,
    RunId,
};
use leadflow_sources::{AdapterRegistry, CachedSource, Normalizer, SourceProvider};
use leadflow_storage::{CacheStore, RecordSink, normalize_identifier};

use crate::enrichment::{EnrichmentChain, EnrichmentProvider, EnrichmentReport, SourceEnrichment};
use crate::insights::{InsightCache, SignalDetector, StageStatus, Summarizer};
use crate::scoring::ScoringEngine;
use crate::textservice::TextService;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Per-identifier processing stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Fetching,
    Normalizing,
    Enriching,
    Summarizing,
    DetectingSignals,
    Scoring,
    Finalized,
    Failed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fetching => "fetching",
            Self::Normalizing => "normalizing",
            Self::Enriching => "enriching",
            Self::Summarizing => "summarizing",
            Self::DetectingSignals => "detecting_signals",
            Self::Scoring => "scoring",
            Self::Finalized => "finalized",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One identifier to process, optionally with data the caller already has.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineInput {
    pub identifier: String,
    /// Takes precedence over every configured source.
    pub preloaded: Option<RawPayload>,
}

impl PipelineInput {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            preloaded: None,
        }
    }

    pub fn with_payload(identifier: impl Into<String>, payload: RawPayload) -> Self {
        Self {
            identifier: identifier.into(),
            preloaded: Some(payload),
        }
    }
}

impl From<&str> for PipelineInput {
    fn from(identifier: &str) -> Self {
        Self::new(identifier)
    }
}

/// A stage that completed in degraded form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Degradation {
    pub stage: Stage,
    pub kind: &'static str,
}

/// Result of processing one identifier.
#[derive(Debug)]
pub struct RunOutcome {
    pub identifier: String,
    /// Stages entered, in order.
    pub trail: Vec<Stage>,
    pub degraded: Vec<Degradation>,
    pub enrichment: Option<EnrichmentReport>,
    pub result: Result<FinalRecord>,
}

impl RunOutcome {
    fn new(identifier: &str) -> Self {
        Self {
            identifier: identifier.to_string(),
            trail: Vec::new(),
            degraded: Vec::new(),
            enrichment: None,
            result: Err(LeadflowError::Cancelled),
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.result.is_ok()
    }

    pub fn last_stage(&self) -> Option<Stage> {
        self.trail.last().copied()
    }

    pub fn record(&self) -> Option<&FinalRecord> {
        self.result.as_ref().ok()
    }

    pub fn error(&self) -> Option<&LeadflowError> {
        self.result.as_ref().err()
    }
}

/// Results for a whole batch, in completion order.
#[derive(Debug)]
pub struct BatchReport {
    pub run_id: RunId,
    pub outcomes: Vec<RunOutcome>,
    pub elapsed: Duration,
}

impl BatchReport {
    pub fn finalized(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_finalized()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.finalized()
    }

    pub fn outcome(&self, identifier: &str) -> Option<&RunOutcome> {
        self.outcomes.iter().find(|o| o.identifier == identifier)
    }
}

/// Progress callback for reporting pipeline status.
pub trait PipelineObserver: Send + Sync {
    /// Called when a batch starts.
    fn started(&self, total: usize);
    /// Called when an identifier enters a stage.
    fn stage(&self, identifier: &str, stage: Stage);
    /// Called when an identifier is done, successfully or not.
    fn finished(&self, outcome: &RunOutcome);
}

/// No-op observer for headless/test usage.
pub struct SilentObserver;

impl PipelineObserver for SilentObserver {
    fn started(&self, _total: usize) {}
    fn stage(&self, _identifier: &str, _stage: Stage) {}
    fn finished(&self, _outcome: &RunOutcome) {}
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Assembles a [`Pipeline`] from its collaborators.
pub struct PipelineBuilder {
    settings: PipelineSettings,
    cache: Arc<dyn CacheStore>,
    sink: Arc<dyn RecordSink>,
    normalizer: Arc<Normalizer>,
    sources: Vec<Arc<CachedSource>>,
    enrichment: Vec<EnrichmentSlot>,
    summarizer: Option<Summarizer>,
    detector: Option<SignalDetector>,
    scoring: ScoringEngine,
}

enum EnrichmentSlot {
    Provider(Arc<dyn EnrichmentProvider>),
    Source(Arc<dyn SourceProvider>),
}

impl PipelineBuilder {
    fn cached(&self, source: Arc<dyn SourceProvider>) -> Arc<CachedSource> {
        Arc::new(CachedSource::new(
            source,
            self.cache.clone(),
            self.settings.cache_ttl,
            self.settings.source_timeout,
        ))
    }

    /// Add a structured source; precedence follows call order.
    pub fn source(mut self, source: Arc<dyn SourceProvider>) -> Self {
        let cached = self.cached(source);
        self.sources.push(cached);
        self
    }

    /// Add an enrichment provider after the existing ones.
    pub fn enrichment(mut self, provider: Arc<dyn EnrichmentProvider>) -> Self {
        self.enrichment.push(EnrichmentSlot::Provider(provider));
        self
    }

    /// Add a structured source as an enrichment provider (cached, normalized).
    pub fn enrichment_source(mut self, source: Arc<dyn SourceProvider>) -> Self {
        self.enrichment.push(EnrichmentSlot::Source(source));
        self
    }

    pub fn normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = Arc::new(normalizer);
        self
    }

    pub fn summarizer(mut self, summarizer: Summarizer) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn signal_detector(mut self, detector: SignalDetector) -> Self {
        self.detector = Some(detector);
        self
    }

    pub fn scoring(mut self, scoring: ScoringEngine) -> Self {
        self.scoring = scoring;
        self
    }

    pub fn build(self) -> Pipeline {
        // preloaded payloads take rank 0, sources follow, enrichment after that
        let base_rank = self.sources.len() + 1;
        let mut chain = EnrichmentChain::new(
            self.settings.target_fields.clone(),
            self.settings.merge_policy,
        )
        .with_base_rank(base_rank);
        for slot in self.enrichment {
            let provider: Arc<dyn EnrichmentProvider> = match slot {
                EnrichmentSlot::Provider(p) => p,
                EnrichmentSlot::Source(source) => {
                    let cached = Arc::new(CachedSource::new(
                        source,
                        self.cache.clone(),
                        self.settings.cache_ttl,
                        self.settings.source_timeout,
                    ));
                    Arc::new(SourceEnrichment::new(cached, self.normalizer.clone()))
                }
            };
            chain.push(provider);
        }

        Pipeline {
            settings: self.settings,
            sink: self.sink,
            normalizer: self.normalizer,
            sources: self.sources,
            chain,
            summarizer: self.summarizer,
            detector: self.detector,
            scoring: self.scoring,
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// The lead enrichment orchestrator.
pub struct Pipeline {
    settings: PipelineSettings,
    sink: Arc<dyn RecordSink>,
    normalizer: Arc<Normalizer>,
    sources: Vec<Arc<CachedSource>>,
    chain: EnrichmentChain,
    summarizer: Option<Summarizer>,
    detector: Option<SignalDetector>,
    scoring: ScoringEngine,
}

impl Pipeline {
    pub fn builder(
        settings: PipelineSettings,
        cache: Arc<dyn CacheStore>,
        sink: Arc<dyn RecordSink>,
    ) -> PipelineBuilder {
        PipelineBuilder {
            settings,
            cache,
            sink,
            normalizer: Arc::new(Normalizer::new()),
            sources: Vec::new(),
            enrichment: Vec::new(),
            summarizer: None,
            detector: None,
            scoring: ScoringEngine::default(),
        }
    }

    /// Wire HTTP sources, enrichment providers, insights and scoring from config.
    ///
    /// Without a text service the insight stages are skipped.
    pub fn from_config(
        config: &AppConfig,
        settings: PipelineSettings,
        cache: Arc<dyn CacheStore>,
        sink: Arc<dyn RecordSink>,
        text: Option<Arc<dyn TextService>>,
    ) -> Result<Self> {
        let registry = AdapterRegistry::from_config(&config.sources)?;
        let mut builder = Self::builder(settings, cache.clone(), sink)
            .scoring(ScoringEngine::from_config(&config.scoring));

        for source in registry.sources(&config.sources.order)? {
            builder = builder.source(source);
        }
        for source in registry.sources(&config.enrichment.providers)? {
            builder = builder.enrichment_source(source);
        }

        if let Some(text) = text {
            let insight_cache = InsightCache::from_config(cache, &config.insights);
            if config.insights.summarize {
                builder = builder.summarizer(
                    Summarizer::from_config(text.clone(), &config.insights)
                        .with_cache(insight_cache.clone()),
                );
            }
            if config.insights.detect_signals {
                builder = builder.signal_detector(
                    SignalDetector::from_config(text, &config.insights).with_cache(insight_cache),
                );
            }
        }
        Ok(builder.build())
    }

    /// Process a batch on a bounded worker pool.
    #[instrument(skip_all, fields(inputs = inputs.len(), concurrency = self.settings.concurrency))]
    pub async fn run(
        &self,
        inputs: Vec<PipelineInput>,
        observer: &dyn PipelineObserver,
        cancel: &CancellationToken,
    ) -> BatchReport {
        let start = Instant::now();
        let run_id = RunId::new();
        info!(%run_id, "starting pipeline run");
        observer.started(inputs.len());

        // identifiers are unique per run
        let mut seen = HashSet::new();
        let mut rejected = Vec::new();
        let mut accepted = Vec::new();
        for input in inputs {
            let key = normalize_identifier(&input.identifier);
            if key.is_empty() {
                rejected.push((input.identifier, "empty identifier"));
            } else if !seen.insert(key) {
                rejected.push((input.identifier, "duplicate identifier in batch"));
            } else {
                accepted.push(input);
            }
        }

        let mut outcomes: Vec<RunOutcome> = rejected
            .into_iter()
            .map(|(identifier, reason)| {
                warn!(identifier = identifier.as_str(), reason, "rejecting input");
                let mut outcome = RunOutcome::new(&identifier);
                outcome.result = Err(LeadflowError::validation(reason));
                observer.finished(&outcome);
                outcome
            })
            .collect();

        let concurrency = self.settings.concurrency.max(1);
        let processed: Vec<RunOutcome> = stream::iter(accepted)
            .map(|input| {
                let run_id = run_id.clone();
                async move {
                    let outcome = self.process(input, run_id, observer, cancel).await;
                    observer.finished(&outcome);
                    outcome
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;
        outcomes.extend(processed);

        let report = BatchReport {
            run_id,
            outcomes,
            elapsed: start.elapsed(),
        };
        info!(
            finalized = report.finalized(),
            failed = report.failed(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "pipeline run complete"
        );
        report
    }

    /// Drive one identifier through every stage.
    #[instrument(skip_all, fields(identifier = %input.identifier))]
    pub async fn process(
        &self,
        input: PipelineInput,
        run_id: RunId,
        observer: &dyn PipelineObserver,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        let mut outcome = RunOutcome::new(&input.identifier);
        let enter = |outcome: &mut RunOutcome, stage: Stage| {
            outcome.trail.push(stage);
            observer.stage(&input.identifier, stage);
        };

        // --- Fetching ---
        enter(&mut outcome, Stage::Fetching);
        let payloads = match self.fetch_all(&input, cancel).await {
            Ok(payloads) => payloads,
            Err(e) => return self.fail(outcome, e, observer),
        };

        // --- Normalizing ---
        enter(&mut outcome, Stage::Normalizing);
        let attempted = payloads.len();
        let mut record = CanonicalRecord::new(input.identifier.clone());
        let mut normalized = 0;
        for (rank, payload) in payloads {
            match self.normalizer.normalize(payload.provider_id(), &payload) {
                Ok(partial) => {
                    normalized += 1;
                    record.absorb(partial, rank, self.settings.merge_policy);
                }
                Err(e) => {
                    warn!(provider = payload.provider_id(), stage = "normalizing", kind = e.kind(), error = %e, "normalization failed");
                }
            }
        }
        if normalized == 0 {
            let err = LeadflowError::AllSourcesExhausted {
                identifier: input.identifier.clone(),
                attempted,
            };
            return self.fail(outcome, err, observer);
        }

        // --- Enriching ---
        enter(&mut outcome, Stage::Enriching);
        match self.chain.enrich(&mut record, cancel).await {
            Ok(report) => outcome.enrichment = Some(report),
            Err(e) => {
                outcome.result = Err(e);
                return outcome;
            }
        }

        // --- Summarizing ---
        enter(&mut outcome, Stage::Summarizing);
        if let Some(summarizer) = &self.summarizer {
            match summarizer.apply(&mut record, cancel).await {
                Ok(StageStatus::Degraded(kind)) => outcome.degraded.push(Degradation {
                    stage: Stage::Summarizing,
                    kind,
                }),
                Ok(_) => {}
                Err(e) => {
                    outcome.result = Err(e);
                    return outcome;
                }
            }
        }

        // --- Detecting signals ---
        enter(&mut outcome, Stage::DetectingSignals);
        if let Some(detector) = &self.detector {
            match detector.apply(&mut record, cancel).await {
                Ok(StageStatus::Degraded(kind)) => outcome.degraded.push(Degradation {
                    stage: Stage::DetectingSignals,
                    kind,
                }),
                Ok(_) => {}
                Err(e) => {
                    outcome.result = Err(e);
                    return outcome;
                }
            }
        }

        // --- Scoring ---
        enter(&mut outcome, Stage::Scoring);
        if let Err(e) = self.scoring.score(&mut record) {
            warn!(stage = "scoring", kind = e.kind(), error = %e, "scoring failed");
            outcome.degraded.push(Degradation {
                stage: Stage::Scoring,
                kind: e.kind(),
            });
        }

        // --- Finalized ---
        if cancel.is_cancelled() {
            outcome.result = Err(LeadflowError::Cancelled);
            return outcome;
        }
        enter(&mut outcome, Stage::Finalized);
        let final_record = FinalRecord::new(run_id, record);
        outcome.result = match self.sink.save(&final_record).await {
            Ok(()) => {
                info!(score = ?final_record.record().score(), "record finalized");
                Ok(final_record)
            }
            Err(e) => {
                error!(kind = e.kind(), error = %e, "failed to save record");
                Err(e)
            }
        };
        outcome
    }

    /// Collect payloads in precedence order, with their ranks.
    ///
    /// Fails only when nothing could be fetched, or on cancellation.
    async fn fetch_all(
        &self,
        input: &PipelineInput,
        cancel: &CancellationToken,
    ) -> Result<Vec<(usize, RawPayload)>> {
        let mut payloads = Vec::new();
        if let Some(preloaded) = &input.preloaded {
            payloads.push((0, preloaded.clone()));
        }

        for (offset, source) in self.sources.iter().enumerate() {
            match source.fetch(&input.identifier, cancel).await {
                Ok(payload) => payloads.push((offset + 1, payload)),
                Err(LeadflowError::Cancelled) => return Err(LeadflowError::Cancelled),
                Err(e) => {
                    warn!(provider = source.id(), stage = "fetching", kind = e.kind(), error = %e, "source failed");
                }
            }
        }

        if payloads.is_empty() {
            return Err(LeadflowError::AllSourcesExhausted {
                identifier: input.identifier.clone(),
                attempted: self.sources.len(),
            });
        }
        Ok(payloads)
    }

    fn fail(
        &self,
        mut outcome: RunOutcome,
        err: LeadflowError,
        observer: &dyn PipelineObserver,
    ) -> RunOutcome {
        if !matches!(err, LeadflowError::Cancelled) {
            error!(kind = err.kind(), error = %err, "identifier failed");
            outcome.trail.push(Stage::Failed);
            observer.stage(&outcome.identifier, Stage::Failed);
        }
        outcome.result = Err(err);
        outcome
    }
}
