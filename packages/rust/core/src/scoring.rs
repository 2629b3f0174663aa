//! Lead scoring.
//!
//! A [`ScoringEngine`] runs one named [`ScoringStrategy`] against an
//! enriched record and stores a score in `[0, 100]`.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;
use tracing::{debug, info, warn};

use leadflow_shared::{CanonicalRecord, Confidence, Field, LeadflowError, Result, ScoringConfig};
use leadflow_sources::normalize::{parse_employee_count, parse_money};

/// Funding at or above this many USD earns the `funding_large` weight.
const LARGE_FUNDING_USD: u64 = 10_000_000;

// ---------------------------------------------------------------------------
// Weights
// ---------------------------------------------------------------------------

const DEFAULT_WEIGHTS: &[(&str, f64)] = &[
    ("funding", 10.0),
    ("funding_large", 10.0),
    ("employee_count_1_10", 5.0),
    ("employee_count_11_50", 10.0),
    ("employee_count_51_99", 15.0),
    ("employee_count_100_500", 20.0),
    ("employee_count_500_plus", 25.0),
    ("tech_stack", 10.0),
    ("domain", 5.0),
    ("has_summary", 5.0),
    ("ai_focus", 10.0),
    ("signal.funding", 30.0),
    ("signal.leadership_change", 10.0),
    ("signal.tech_adoption", 10.0),
    ("signal.other", 5.0),
    ("confidence.high", 1.0),
    ("confidence.medium", 0.75),
    ("confidence.low", 0.5),
];

/// Named rule weights. Missing keys weigh zero.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoringWeights {
    weights: BTreeMap<String, f64>,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            weights: DEFAULT_WEIGHTS
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
        }
    }
}

impl ScoringWeights {
    /// Defaults with `overrides` applied.
    ///
    /// Unknown keys are ignored, except `signal.<type>` which adds a weight
    /// for a custom signal type. Negative and non-finite values become 0.
    pub fn with_overrides(overrides: &BTreeMap<String, f64>) -> Self {
        let mut weights = Self::default();
        for (key, value) in overrides {
            let known = weights.weights.contains_key(key) || key.starts_with("signal.");
            if !known {
                debug!(key = key.as_str(), "ignoring unknown scoring weight");
                continue;
            }
            let value = if value.is_finite() { value.max(0.0) } else { 0.0 };
            weights.weights.insert(key.clone(), value);
        }
        weights
    }

    pub fn get(&self, key: &str) -> f64 {
        self.weights.get(key).copied().unwrap_or(0.0)
    }

    fn signal(&self, signal_type: &str) -> f64 {
        self.weights
            .get(&format!("signal.{signal_type}"))
            .copied()
            .unwrap_or_else(|| self.get("signal.other"))
    }

    fn confidence(&self, confidence: Confidence) -> f64 {
        match confidence {
            Confidence::High => self.get("confidence.high"),
            Confidence::Medium => self.get("confidence.medium"),
            Confidence::Low => self.get("confidence.low"),
        }
    }
}

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

/// A way of turning a record into an unbounded raw score.
pub trait ScoringStrategy: Send + Sync {
    fn name(&self) -> &str;

    fn raw_score(&self, record: &CanonicalRecord, weights: &ScoringWeights) -> f64;
}

/// Additive rules over the enriched fields, summary and signals.
pub struct RuleBasedStrategy;

impl RuleBasedStrategy {
    fn employee_bucket(count: u64) -> Option<&'static str> {
        match count {
            0 => None,
            1..=10 => Some("employee_count_1_10"),
            11..=50 => Some("employee_count_11_50"),
            51..=99 => Some("employee_count_51_99"),
            100..=500 => Some("employee_count_100_500"),
            _ => Some("employee_count_500_plus"),
        }
    }

    fn tech_stack(record: &CanonicalRecord) -> Vec<&str> {
        match record.get(Field::TechStack) {
            Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).collect(),
            Some(Value::String(s)) => s.split(',').map(str::trim).filter(|s| !s.is_empty()).collect(),
            _ => Vec::new(),
        }
    }
}

impl ScoringStrategy for RuleBasedStrategy {
    fn name(&self) -> &str {
        "rule-based"
    }

    fn raw_score(&self, record: &CanonicalRecord, weights: &ScoringWeights) -> f64 {
        let mut score = 0.0;

        if let Some(funding) = record.get(Field::Funding) {
            score += weights.get("funding");
            if parse_money(funding).is_some_and(|usd| usd >= LARGE_FUNDING_USD) {
                score += weights.get("funding_large");
            }
        }

        if let Some(bucket) = record
            .get(Field::EmployeeCount)
            .and_then(parse_employee_count)
            .and_then(Self::employee_bucket)
        {
            score += weights.get(bucket);
        }

        let stack = Self::tech_stack(record);
        if !stack.is_empty() {
            score += weights.get("tech_stack");
        }
        if record.has(Field::Domain) {
            score += weights.get("domain");
        }
        if record.summary().is_some() {
            score += weights.get("has_summary");
        }

        let ai_focus = record.summary().is_some_and(|s| s.contains("AI"))
            || stack.iter().any(|t| t.contains("AI"));
        if ai_focus {
            score += weights.get("ai_focus");
        }

        // Each signal type counts once, at its best confidence.
        let mut best: HashMap<&str, Confidence> = HashMap::new();
        for signal in record.signals().unwrap_or_default() {
            let entry = best.entry(signal.signal_type.as_str()).or_insert(signal.confidence);
            *entry = (*entry).max(signal.confidence);
        }
        for (signal_type, confidence) in best {
            score += weights.signal(signal_type) * weights.confidence(confidence);
        }

        score
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Selects a strategy by name and applies it with the configured weights.
pub struct ScoringEngine {
    strategy: Box<dyn ScoringStrategy>,
    weights: ScoringWeights,
}

impl Default for ScoringEngine {
    fn default() -> Self {
        Self::new(Box::new(RuleBasedStrategy), ScoringWeights::default())
    }
}

impl ScoringEngine {
    pub fn new(strategy: Box<dyn ScoringStrategy>, weights: ScoringWeights) -> Self {
        Self { strategy, weights }
    }

    /// Build from `[scoring]`. Unknown strategies fall back to rule-based.
    pub fn from_config(config: &ScoringConfig) -> Self {
        let weights = ScoringWeights::with_overrides(&config.weights);
        let strategy: Box<dyn ScoringStrategy> = match config.strategy.as_str() {
            "rule-based" => Box::new(RuleBasedStrategy),
            "ml-based" => {
                info!("ml-based scoring is not available yet, using rule-based");
                Box::new(RuleBasedStrategy)
            }
            other => {
                warn!(strategy = other, "unknown scoring strategy, using rule-based");
                Box::new(RuleBasedStrategy)
            }
        };
        Self::new(strategy, weights)
    }

    pub fn strategy_name(&self) -> &str {
        self.strategy.name()
    }

    /// Compute without storing. The record must have been enriched.
    pub fn compute(&self, record: &CanonicalRecord) -> Result<u8> {
        if !record.is_enriched() {
            return Err(LeadflowError::validation(format!(
                "cannot score '{}' before enrichment",
                record.identifier()
            )));
        }
        let raw = self.strategy.raw_score(record, &self.weights);
        Ok(raw.round().clamp(0.0, 100.0) as u8)
    }

    /// Compute and store the score on the record.
    pub fn score(&self, record: &mut CanonicalRecord) -> Result<u8> {
        let score = self.compute(record)?;
        record.set_score(score);
        Ok(score)
    }
}
