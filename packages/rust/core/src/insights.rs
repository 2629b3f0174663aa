//! Best-effort text insights: company summaries and sales signals.
//!
//! Both services degrade instead of failing: a broken model call leaves the
//! summary absent or the signal list empty. Only cancellation propagates.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use leadflow_shared::{
    CanonicalRecord, Confidence, Field, InsightsConfig, LeadflowError, RawPayload, Result, Signal,
};
use leadflow_storage::CacheStore;

use crate::textservice::{CallPolicy, TextRequest, TextService};

/// Input longer than this is cut before prompting.
const MAX_INPUT_CHARS: usize = 8_000;

/// Outcome of one best-effort stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    Completed,
    /// No usable input; the record is untouched.
    Skipped,
    /// The call failed and the stage fell back to its degraded value.
    Degraded(&'static str),
}

// ---------------------------------------------------------------------------
// Insight cache
// ---------------------------------------------------------------------------

/// Compute a prompt hash for cache keying.
pub fn prompt_hash(prompt: &str, model: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(model.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Model answers kept in the shared cache store under `insight:<task>`.
#[derive(Clone)]
pub struct InsightCache {
    store: Arc<dyn CacheStore>,
    ttl: Duration,
}

impl InsightCache {
    pub fn new(store: Arc<dyn CacheStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Cache from config; `None` when `cache_ttl_secs` is 0.
    pub fn from_config(store: Arc<dyn CacheStore>, config: &InsightsConfig) -> Option<Self> {
        (config.cache_ttl_secs > 0)
            .then(|| Self::new(store, Duration::from_secs(config.cache_ttl_secs)))
    }

    async fn get(&self, task: &str, hash: &str) -> Option<String> {
        let provider = format!("insight:{task}");
        match self.store.get(&provider, hash).await {
            Ok(payload) => payload
                .and_then(|p| p.get("text").and_then(Value::as_str).map(String::from)),
            Err(e) => {
                warn!(task, kind = e.kind(), error = %e, "insight cache read failed");
                None
            }
        }
    }

    async fn put(&self, task: &str, hash: &str, text: &str) {
        let provider = format!("insight:{task}");
        let payload = RawPayload::new(
            provider.clone(),
            Map::from_iter([("text".to_string(), json!(text))]),
        );
        if let Err(e) = self.store.put(&provider, hash, &payload, self.ttl).await {
            warn!(task, kind = e.kind(), error = %e, "insight cache write failed");
        }
    }
}

/// Shared plumbing: cache lookup, policy-bound call, cache fill.
///
/// Only answers accepted by the caller's check are cached.
struct Prompter {
    service: Arc<dyn TextService>,
    policy: CallPolicy,
    cache: Option<InsightCache>,
}

impl Prompter {
    async fn ask(
        &self,
        task: &str,
        request: &TextRequest,
        cancel: &CancellationToken,
        usable: impl Fn(&str) -> bool,
    ) -> Result<String> {
        let hash = prompt_hash(&request.prompt, self.service.model());
        if let Some(cache) = &self.cache {
            if let Some(text) = cache.get(task, &hash).await {
                debug!(task, "insight cache hit");
                return Ok(text);
            }
        }
        let text = self.policy.call(self.service.as_ref(), request, cancel).await?;
        if let Some(cache) = self.cache.as_ref().filter(|_| usable(&text)) {
            cache.put(task, &hash, &text).await;
        }
        Ok(text)
    }
}

fn truncate(text: &str) -> &str {
    match text.char_indices().nth(MAX_INPUT_CHARS) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

// ---------------------------------------------------------------------------
// Summarizer
// ---------------------------------------------------------------------------

/// One or two sentence business summary of a company description.
pub struct Summarizer {
    prompter: Prompter,
    max_tokens: u32,
}

impl Summarizer {
    pub fn new(service: Arc<dyn TextService>, policy: CallPolicy, max_tokens: u32) -> Self {
        Self {
            prompter: Prompter {
                service,
                policy,
                cache: None,
            },
            max_tokens,
        }
    }

    pub fn from_config(service: Arc<dyn TextService>, config: &InsightsConfig) -> Self {
        Self::new(service, CallPolicy::from(config), config.summary_max_tokens)
    }

    pub fn with_cache(mut self, cache: Option<InsightCache>) -> Self {
        self.prompter.cache = cache;
        self
    }

    /// Summarize `description`. Empty model output is `MalformedResponse`.
    pub async fn summarize(&self, description: &str, cancel: &CancellationToken) -> Result<String> {
        let request = TextRequest {
            prompt: format!(
                "Summarize the following company description in 1-2 concise, \
                 business-focused sentences:\n\n{}",
                truncate(description)
            ),
            max_tokens: self.max_tokens,
            temperature: 0.7,
        };
        let text = self
            .prompter
            .ask("summary", &request, cancel, |t| !t.trim().is_empty())
            .await?;
        let text = text.trim();
        if text.is_empty() {
            return Err(LeadflowError::malformed("openrouter", "empty summary"));
        }
        Ok(text.to_string())
    }

    /// Summarize the record's description in place.
    pub async fn apply(
        &self,
        record: &mut CanonicalRecord,
        cancel: &CancellationToken,
    ) -> Result<StageStatus> {
        let Some(description) = record.text(Field::Description).map(String::from) else {
            debug!(identifier = record.identifier(), "no description, skipping summary");
            return Ok(StageStatus::Skipped);
        };
        match self.summarize(&description, cancel).await {
            Ok(summary) => {
                record.set_summary(summary);
                Ok(StageStatus::Completed)
            }
            Err(LeadflowError::Cancelled) => Err(LeadflowError::Cancelled),
            Err(e) => {
                warn!(
                    identifier = record.identifier(),
                    stage = "summarizing",
                    kind = e.kind(),
                    error = %e,
                    "summarization failed"
                );
                Ok(StageStatus::Degraded(e.kind()))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Signal detector
// ---------------------------------------------------------------------------

/// Extracts B2B sales signals from free text.
pub struct SignalDetector {
    prompter: Prompter,
    max_tokens: u32,
}

impl SignalDetector {
    pub fn new(service: Arc<dyn TextService>, policy: CallPolicy, max_tokens: u32) -> Self {
        Self {
            prompter: Prompter {
                service,
                policy,
                cache: None,
            },
            max_tokens,
        }
    }

    pub fn from_config(service: Arc<dyn TextService>, config: &InsightsConfig) -> Self {
        Self::new(service, CallPolicy::from(config), config.signals_max_tokens)
    }

    pub fn with_cache(mut self, cache: Option<InsightCache>) -> Self {
        self.prompter.cache = cache;
        self
    }

    /// Detect signals in `text`.
    ///
    /// Call failures and unparsable answers yield an empty, degraded
    /// detection; only cancellation is an error.
    pub async fn detect(&self, text: &str, cancel: &CancellationToken) -> Result<Detection> {
        let request = TextRequest {
            prompt: format!(
                "Extract all critical sales signals from the following text.\n\
                 Return a JSON list of objects with these fields:\n\
                 - type (e.g. 'funding', 'leadership_change', 'tech_adoption')\n\
                 - value (e.g. '$50M Series B', 'New CTO: Jane Doe', 'Adopted Snowflake')\n\
                 - confidence (High, Medium, Low)\n\
                 Only include signals relevant for B2B sales intelligence.\n\
                 Text:\n{}\n\nJSON:",
                truncate(text)
            ),
            max_tokens: self.max_tokens,
            temperature: 0.2,
        };
        let response = match self
            .prompter
            .ask("signals", &request, cancel, |t| parse_signals(t).is_some())
            .await
        {
            Ok(response) => response,
            Err(LeadflowError::Cancelled) => return Err(LeadflowError::Cancelled),
            Err(e) => {
                warn!(stage = "detecting_signals", kind = e.kind(), error = %e, "signal detection failed");
                return Ok(Detection::degraded(e.kind()));
            }
        };
        match parse_signals(&response) {
            Some(signals) => {
                info!(count = signals.len(), "extracted signals");
                Ok(Detection {
                    signals,
                    degraded: None,
                })
            }
            None => {
                warn!(stage = "detecting_signals", kind = "malformed_response", "unparsable signal list");
                Ok(Detection::degraded("malformed_response"))
            }
        }
    }

    /// Detect signals from the description, or the summary when there is none.
    pub async fn apply(
        &self,
        record: &mut CanonicalRecord,
        cancel: &CancellationToken,
    ) -> Result<StageStatus> {
        let text = record
            .text(Field::Description)
            .or_else(|| record.summary().map(str::trim).filter(|s| !s.is_empty()))
            .map(String::from);
        let Some(text) = text else {
            debug!(identifier = record.identifier(), "no free text, skipping signals");
            return Ok(StageStatus::Skipped);
        };
        let detection = self.detect(&text, cancel).await?;
        record.set_signals(detection.signals);
        Ok(match detection.degraded {
            Some(kind) => StageStatus::Degraded(kind),
            None => StageStatus::Completed,
        })
    }
}

/// Signals found in a text, and the error kind when detection degraded.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub signals: Vec<Signal>,
    pub degraded: Option<&'static str>,
}

impl Detection {
    fn degraded(kind: &'static str) -> Self {
        Self {
            signals: Vec::new(),
            degraded: Some(kind),
        }
    }
}

/// Parse the JSON array between the first `[` and the last `]`.
///
/// Entries without a type or with an unknown confidence are dropped.
/// Returns `None` when no array can be parsed at all.
pub fn parse_signals(response: &str) -> Option<Vec<Signal>> {
    let start = response.find('[')?;
    let end = response.rfind(']')?;
    if end < start {
        return None;
    }
    let items: Vec<Value> = serde_json::from_str(&response[start..=end]).ok()?;
    Some(items.iter().filter_map(signal_from_value).collect())
}

fn signal_from_value(item: &Value) -> Option<Signal> {
    let signal_type = item.get("type")?.as_str()?.trim();
    if signal_type.is_empty() {
        return None;
    }
    let value = match item.get("value")? {
        Value::String(s) => s.trim().to_string(),
        Value::Null => return None,
        other => other.to_string(),
    };
    let confidence: Confidence = item.get("confidence")?.as_str()?.parse().ok()?;
    Some(Signal {
        signal_type: signal_type.to_lowercase(),
        value,
        confidence,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::textservice::tests::ScriptedService;
    use leadflow_shared::MergePolicy;
    use leadflow_storage::MemoryCache;

    fn policy() -> CallPolicy {
        CallPolicy {
            timeout: Duration::from_secs(2),
            rate_limit_retries: 1,
            retry_backoff: Duration::from_millis(5),
        }
    }

    fn record_with_description(text: &str) -> CanonicalRecord {
        let mut record = CanonicalRecord::new("Acme");
        record.merge_field(Field::Description, json!(text), "crunchbase", 0, MergePolicy::FirstWins);
        record
    }

    #[test]
    fn parses_array_embedded_in_prose() {
        let response = r#"Sure! Here you go:
[{"type": "funding", "value": "$50M Series B", "confidence": "High"},
 {"type": "", "value": "x", "confidence": "High"},
 {"type": "tech_adoption", "value": "Snowflake", "confidence": "certain"},
 {"type": "Leadership_Change", "value": "New CTO", "confidence": "medium"}]
Let me know [if] you need more."#;
        // last ']' belongs to the trailing prose, so the slice is not valid JSON
        assert!(parse_signals(response).is_none());

        let clean = &response[..response.rfind("]\n").map(|i| i + 1).unwrap()];
        let signals = parse_signals(clean).unwrap();
        assert_eq!(signals.len(), 2);
        assert_eq!(signals[0].confidence, Confidence::High);
        assert_eq!(signals[1].signal_type, "leadership_change");
    }

    #[test]
    fn no_array_is_none() {
        assert!(parse_signals("no signals found").is_none());
        assert!(parse_signals("] backwards [").is_none());
        assert_eq!(parse_signals("[]"), Some(Vec::new()));
    }

    #[test]
    fn prompt_hash_deterministic() {
        assert_eq!(prompt_hash("p", "m"), prompt_hash("p", "m"));
        assert_ne!(prompt_hash("p", "m1"), prompt_hash("p", "m2"));
    }

    #[tokio::test]
    async fn summary_is_set_on_success() {
        let service = Arc::new(ScriptedService::new(vec![Ok("  Acme makes anvils.  ".into())]));
        let summarizer = Summarizer::new(service.clone(), policy(), 80);
        let mut record = record_with_description("Acme makes anvils and rockets.");

        let status = summarizer.apply(&mut record, &CancellationToken::new()).await.unwrap();
        assert_eq!(status, StageStatus::Completed);
        assert_eq!(record.summary(), Some("Acme makes anvils."));
        assert!(service.prompts.lock().unwrap()[0].contains("1-2 concise"));
    }

    #[tokio::test]
    async fn summary_failure_degrades() {
        let service = Arc::new(ScriptedService::new(vec![Ok("   ".into())]));
        let summarizer = Summarizer::new(service, policy(), 80);
        let mut record = record_with_description("Acme makes anvils.");

        let status = summarizer.apply(&mut record, &CancellationToken::new()).await.unwrap();
        assert_eq!(status, StageStatus::Degraded("malformed_response"));
        assert!(record.summary().is_none());
    }

    #[tokio::test]
    async fn missing_description_skips_both_stages() {
        let service = Arc::new(ScriptedService::new(Vec::new()));
        let summarizer = Summarizer::new(service.clone(), policy(), 80);
        let detector = SignalDetector::new(service.clone(), policy(), 300);
        let mut record = CanonicalRecord::new("Acme");
        let token = CancellationToken::new();

        assert_eq!(summarizer.apply(&mut record, &token).await.unwrap(), StageStatus::Skipped);
        assert_eq!(detector.apply(&mut record, &token).await.unwrap(), StageStatus::Skipped);
        assert!(record.signals().is_none());
        assert_eq!(service.call_count(), 0);
    }

    #[tokio::test]
    async fn detector_falls_back_to_summary_text() {
        let service = Arc::new(ScriptedService::new(vec![Ok(
            r#"[{"type":"funding","value":"$5M seed","confidence":"Low"}]"#.into(),
        )]));
        let detector = SignalDetector::new(service.clone(), policy(), 300);
        let mut record = CanonicalRecord::new("Acme");
        record.set_summary("Acme closed a $5M seed round.");

        detector.apply(&mut record, &CancellationToken::new()).await.unwrap();
        assert_eq!(record.signals().map(<[Signal]>::len), Some(1));
        assert!(service.prompts.lock().unwrap()[0].contains("$5M seed round"));
    }

    #[tokio::test]
    async fn detector_failure_yields_empty_list() {
        let service = Arc::new(ScriptedService::new(vec![Err(LeadflowError::Service("boom".into()))]));
        let detector = SignalDetector::new(service, policy(), 300);
        let mut record = record_with_description("Acme raised $50M.");

        let status = detector.apply(&mut record, &CancellationToken::new()).await.unwrap();
        assert_eq!(status, StageStatus::Degraded("service_error"));
        assert_eq!(record.signals(), Some(&[][..]));
    }

    #[tokio::test]
    async fn blank_summary_is_not_cached() {
        let service = Arc::new(ScriptedService::new(vec![
            Ok("   ".into()),
            Ok("Acme makes anvils.".into()),
        ]));
        let cache = InsightCache::new(Arc::new(MemoryCache::new()), Duration::from_secs(60));
        let summarizer = Summarizer::new(service.clone(), policy(), 80).with_cache(Some(cache));
        let mut record = record_with_description("Acme makes anvils and rockets.");
        let token = CancellationToken::new();

        let first = summarizer.apply(&mut record, &token).await.unwrap();
        assert_eq!(first, StageStatus::Degraded("malformed_response"));
        let second = summarizer.apply(&mut record, &token).await.unwrap();
        assert_eq!(second, StageStatus::Completed);
        assert_eq!(record.summary(), Some("Acme makes anvils."));
        assert_eq!(service.call_count(), 2);

        // the good answer is cached
        summarizer.apply(&mut record, &token).await.unwrap();
        assert_eq!(service.call_count(), 2);
    }

    #[tokio::test]
    async fn unparsable_signals_degrade_and_are_not_cached() {
        let service = Arc::new(ScriptedService::new(vec![
            Ok("sorry, I cannot help with that".into()),
            Ok(r#"[{"type":"funding","value":"$50M Series B","confidence":"High"}]"#.into()),
        ]));
        let cache = InsightCache::new(Arc::new(MemoryCache::new()), Duration::from_secs(60));
        let detector = SignalDetector::new(service.clone(), policy(), 300).with_cache(Some(cache));
        let mut record = record_with_description("Acme raised $50M Series B.");
        let token = CancellationToken::new();

        let first = detector.apply(&mut record, &token).await.unwrap();
        assert_eq!(first, StageStatus::Degraded("malformed_response"));
        assert_eq!(record.signals(), Some(&[][..]));

        let second = detector.apply(&mut record, &token).await.unwrap();
        assert_eq!(second, StageStatus::Completed);
        assert_eq!(record.signals().map(<[Signal]>::len), Some(1));
        assert_eq!(service.call_count(), 2);
    }

    #[tokio::test]
    async fn insight_cache_avoids_second_call() {
        let service = Arc::new(ScriptedService::new(vec![Ok("Acme makes anvils.".into())]));
        let cache = InsightCache::new(Arc::new(MemoryCache::new()), Duration::from_secs(60));
        let summarizer = Summarizer::new(service.clone(), policy(), 80).with_cache(Some(cache));
        let token = CancellationToken::new();

        let first = summarizer.summarize("Acme makes anvils.", &token).await.unwrap();
        let second = summarizer.summarize("Acme makes anvils.", &token).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(service.call_count(), 1);
    }

    #[test]
    fn cache_disabled_by_zero_ttl() {
        let config = InsightsConfig {
            cache_ttl_secs: 0,
            ..InsightsConfig::default()
        };
        assert!(InsightCache::from_config(Arc::new(MemoryCache::new()), &config).is_none());
    }
}
