//! Fallback enrichment chain.
//!
//! Providers are tried in order until every target field is set. A field
//! set by an earlier provider is never replaced by a later one; provider
//! failures are logged and the chain moves on.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use leadflow_shared::{CanonicalRecord, Field, LeadflowError, MergePolicy, PartialRecord, Result};
use leadflow_sources::{CachedSource, Normalizer};

// ---------------------------------------------------------------------------
// Provider trait
// ---------------------------------------------------------------------------

/// A service that can fill in missing fields of a record.
#[async_trait]
pub trait EnrichmentProvider: Send + Sync {
    fn id(&self) -> &str;

    /// Fields this provider can populate. Used to skip pointless calls.
    fn supplies(&self) -> &[Field];

    /// Look up additional fields for `record`.
    async fn lookup(
        &self,
        record: &CanonicalRecord,
        cancel: &CancellationToken,
    ) -> Result<PartialRecord>;
}

/// Turns a cached structured source into an enrichment provider.
pub struct SourceEnrichment {
    source: Arc<CachedSource>,
    normalizer: Arc<Normalizer>,
    supplies: Vec<Field>,
}

impl SourceEnrichment {
    pub fn new(source: Arc<CachedSource>, normalizer: Arc<Normalizer>) -> Self {
        let supplies = normalizer.mapping(source.id()).supplies().to_vec();
        Self {
            source,
            normalizer,
            supplies,
        }
    }
}

#[async_trait]
impl EnrichmentProvider for SourceEnrichment {
    fn id(&self) -> &str {
        self.source.id()
    }

    fn supplies(&self) -> &[Field] {
        &self.supplies
    }

    async fn lookup(
        &self,
        record: &CanonicalRecord,
        cancel: &CancellationToken,
    ) -> Result<PartialRecord> {
        let raw = self.source.fetch(record.identifier(), cancel).await?;
        self.normalizer.normalize(self.source.id(), &raw)
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// What one pass of the chain did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnrichmentReport {
    /// Providers actually called, in order.
    pub tried: Vec<String>,
    /// Providers skipped because they supply none of the missing fields.
    pub skipped: Vec<String>,
    /// Fields set by this pass, with the provider that set them.
    pub filled: Vec<(Field, String)>,
    /// Providers that failed, with the error kind.
    pub failures: Vec<(String, &'static str)>,
    /// Target fields still unset afterwards.
    pub missing: Vec<Field>,
}

impl EnrichmentReport {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Chain
// ---------------------------------------------------------------------------

/// Ordered enrichment providers, primary first.
pub struct EnrichmentChain {
    providers: Vec<Arc<dyn EnrichmentProvider>>,
    target_fields: Vec<Field>,
    policy: MergePolicy,
    /// Rank given to the first provider; source providers sit above it.
    base_rank: usize,
}

impl EnrichmentChain {
    pub fn new(target_fields: Vec<Field>, policy: MergePolicy) -> Self {
        Self {
            providers: Vec::new(),
            target_fields,
            policy,
            base_rank: 0,
        }
    }

    /// Append a provider after the existing ones.
    pub fn push(&mut self, provider: Arc<dyn EnrichmentProvider>) {
        self.providers.push(provider);
    }

    /// Start ranking chain providers at `rank`, below every source provider.
    pub fn with_base_rank(mut self, rank: usize) -> Self {
        self.base_rank = rank;
        self
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    fn missing(&self, record: &CanonicalRecord) -> Vec<Field> {
        self.target_fields
            .iter()
            .copied()
            .filter(|f| !record.has(*f))
            .collect()
    }

    /// Fill missing target fields from the providers in order.
    ///
    /// Marks the record enriched when done. Only cancellation is an error.
    #[instrument(skip_all, fields(identifier = %record.identifier(), providers = self.providers.len()))]
    pub async fn enrich(
        &self,
        record: &mut CanonicalRecord,
        cancel: &CancellationToken,
    ) -> Result<EnrichmentReport> {
        let mut report = EnrichmentReport::default();

        for (offset, provider) in self.providers.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(LeadflowError::Cancelled);
            }
            let missing = self.missing(record);
            if missing.is_empty() {
                debug!("all target fields set, stopping early");
                break;
            }
            if !missing.iter().any(|f| provider.supplies().contains(f)) {
                debug!(provider = provider.id(), "supplies no missing field, skipping");
                report.skipped.push(provider.id().to_string());
                continue;
            }

            report.tried.push(provider.id().to_string());
            let partial = match provider.lookup(record, cancel).await {
                Ok(partial) => partial,
                Err(LeadflowError::Cancelled) => return Err(LeadflowError::Cancelled),
                Err(e) => {
                    warn!(provider = provider.id(), kind = e.kind(), error = %e, "enrichment provider failed");
                    report.failures.push((provider.id().to_string(), e.kind()));
                    continue;
                }
            };
            if partial.is_empty() {
                warn!(provider = provider.id(), "enrichment provider returned no fields");
                continue;
            }

            let rank = self.base_rank + offset;
            for (field, value) in partial.fields {
                if record.merge_field(field, value, provider.id(), rank, self.policy) {
                    report.filled.push((field, provider.id().to_string()));
                }
            }
        }

        report.missing = self.missing(record);
        record.mark_enriched();
        info!(
            filled = report.filled.len(),
            missing = report.missing.len(),
            "enrichment finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use proptest::prelude::*;
    use serde_json::{Value, json};

    struct FakeProvider {
        id: &'static str,
        supplies: Vec<Field>,
        fields: Vec<(Field, Value)>,
        fail: bool,
        calls: AtomicUsize,
    }

    impl FakeProvider {
        fn new(id: &'static str, fields: Vec<(Field, Value)>) -> Self {
            Self {
                id,
                supplies: fields.iter().map(|(f, _)| *f).collect(),
                fields,
                fail: false,
                calls: AtomicUsize::new(0),
            }
        }

        fn failing(id: &'static str, supplies: Vec<Field>) -> Self {
            Self {
                id,
                supplies,
                fields: Vec::new(),
                fail: true,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EnrichmentProvider for FakeProvider {
        fn id(&self) -> &str {
            self.id
        }

        fn supplies(&self) -> &[Field] {
            &self.supplies
        }

        async fn lookup(
            &self,
            _record: &CanonicalRecord,
            _cancel: &CancellationToken,
        ) -> Result<PartialRecord> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(LeadflowError::unavailable(self.id, "down"));
            }
            let mut partial = PartialRecord::new(self.id);
            for (field, value) in &self.fields {
                partial.set(*field, value.clone());
            }
            Ok(partial)
        }
    }

    fn chain(targets: Vec<Field>, providers: Vec<Arc<dyn EnrichmentProvider>>) -> EnrichmentChain {
        let mut chain = EnrichmentChain::new(targets, MergePolicy::FirstWins);
        for p in providers {
            chain.push(p);
        }
        chain
    }

    #[tokio::test]
    async fn falls_back_after_failure() {
        let primary = Arc::new(FakeProvider::failing("apollo", vec![Field::Funding]));
        let fallback = Arc::new(FakeProvider::new("kaspr", vec![(Field::Funding, json!(5_000_000))]));
        let chain = chain(vec![Field::Funding], vec![primary.clone(), fallback.clone()]);

        let mut record = CanonicalRecord::new("Acme");
        let report = chain.enrich(&mut record, &CancellationToken::new()).await.unwrap();

        assert_eq!(record.provenance(Field::Funding), Some("kaspr"));
        assert_eq!(report.failures, vec![("apollo".to_string(), "provider_unavailable")]);
        assert!(report.is_complete());
        assert!(record.is_enriched());
    }

    #[tokio::test]
    async fn stops_once_targets_are_filled() {
        let first = Arc::new(FakeProvider::new("apollo", vec![(Field::Domain, json!("acme.io"))]));
        let second = Arc::new(FakeProvider::new("kaspr", vec![(Field::Domain, json!("acme.com"))]));
        let chain = chain(vec![Field::Domain], vec![first, second.clone()]);

        let mut record = CanonicalRecord::new("Acme");
        chain.enrich(&mut record, &CancellationToken::new()).await.unwrap();
        assert_eq!(second.calls.load(Ordering::SeqCst), 0);
        assert_eq!(record.get(Field::Domain), Some(&json!("acme.io")));
    }

    #[tokio::test]
    async fn skips_providers_without_relevant_fields() {
        let phone = Arc::new(FakeProvider::new("googlemaps", vec![(Field::Phone, json!("+1"))]));
        let funding = Arc::new(FakeProvider::new("apollo", vec![(Field::Funding, json!(1))]));
        let chain = chain(vec![Field::Funding], vec![phone.clone(), funding]);

        let mut record = CanonicalRecord::new("Acme");
        let report = chain.enrich(&mut record, &CancellationToken::new()).await.unwrap();
        assert_eq!(phone.calls.load(Ordering::SeqCst), 0);
        assert_eq!(report.skipped, vec!["googlemaps".to_string()]);
    }

    #[tokio::test]
    async fn existing_fields_are_kept() {
        let provider = Arc::new(FakeProvider::new(
            "apollo",
            vec![(Field::Industry, json!("Fintech")), (Field::EmployeeCount, json!(120))],
        ));
        let chain = chain(vec![Field::Industry, Field::EmployeeCount], vec![provider]);

        let mut record = CanonicalRecord::new("Acme");
        record.merge_field(Field::Industry, json!("SaaS"), "crunchbase", 0, MergePolicy::FirstWins);
        let report = chain.enrich(&mut record, &CancellationToken::new()).await.unwrap();
        assert_eq!(record.get(Field::Industry), Some(&json!("SaaS")));
        assert_eq!(report.filled, vec![(Field::EmployeeCount, "apollo".to_string())]);
    }

    #[tokio::test]
    async fn cancelled_chain_reports_cancelled() {
        let provider = Arc::new(FakeProvider::new("apollo", vec![(Field::Funding, json!(1))]));
        let chain = chain(vec![Field::Funding], vec![provider]);
        let token = CancellationToken::new();
        token.cancel();

        let mut record = CanonicalRecord::new("Acme");
        let err = chain.enrich(&mut record, &token).await.unwrap_err();
        assert!(matches!(err, LeadflowError::Cancelled));
        assert!(!record.is_enriched());
    }

    fn field_subset() -> impl Strategy<Value = Vec<Field>> {
        proptest::sample::subsequence(Field::ALL.to_vec(), 0..Field::ALL.len())
    }

    proptest! {
        #[test]
        fn earlier_provider_wins_conflicts(a in field_subset(), b in field_subset()) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let first = Arc::new(FakeProvider::new(
                "first",
                a.iter().map(|f| (*f, json!(format!("first-{f}")))).collect(),
            ));
            let second = Arc::new(FakeProvider::new(
                "second",
                b.iter().map(|f| (*f, json!(format!("second-{f}")))).collect(),
            ));
            let chain = chain(Field::ALL.to_vec(), vec![first, second]);

            let mut record = CanonicalRecord::new("Acme");
            rt.block_on(chain.enrich(&mut record, &CancellationToken::new())).unwrap();

            for field in &a {
                prop_assert_eq!(record.provenance(*field), Some("first"));
            }
            for field in b.iter().filter(|f| !a.contains(f)) {
                prop_assert_eq!(record.provenance(*field), Some("second"));
            }
        }
    }
}
