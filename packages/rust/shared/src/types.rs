//! Core domain types for Leadflow lead records.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper identifying one pipeline batch run (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-sortable run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// RawPayload
// ---------------------------------------------------------------------------

/// Opaque provider response, tagged with its origin and fetch time.
///
/// Immutable once built: downstream stages only ever borrow it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPayload {
    provider_id: String,
    fetched_at: DateTime<Utc>,
    data: Map<String, Value>,
}

impl RawPayload {
    /// Build a payload fetched now.
    pub fn new(provider_id: impl Into<String>, data: Map<String, Value>) -> Self {
        Self::with_fetched_at(provider_id, data, Utc::now())
    }

    /// Build a payload with an explicit fetch time.
    pub fn with_fetched_at(
        provider_id: impl Into<String>,
        data: Map<String, Value>,
        fetched_at: DateTime<Utc>,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            fetched_at,
            data,
        }
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    /// Look up a top-level key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }
}

// ---------------------------------------------------------------------------
// Field
// ---------------------------------------------------------------------------

/// Canonical field names a lead record can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Name,
    Industry,
    Size,
    Website,
    Domain,
    Description,
    Funding,
    TechStack,
    EmployeeCount,
    Location,
    Address,
    Phone,
    Coordinates,
    FoundedYear,
    Stage,
    Founders,
    Contacts,
    LinkedinUrl,
    AngellistUrl,
    GooglemapsUrl,
}

impl Field {
    /// Every canonical field, in declaration order.
    pub const ALL: [Field; 20] = [
        Field::Name,
        Field::Industry,
        Field::Size,
        Field::Website,
        Field::Domain,
        Field::Description,
        Field::Funding,
        Field::TechStack,
        Field::EmployeeCount,
        Field::Location,
        Field::Address,
        Field::Phone,
        Field::Coordinates,
        Field::FoundedYear,
        Field::Stage,
        Field::Founders,
        Field::Contacts,
        Field::LinkedinUrl,
        Field::AngellistUrl,
        Field::GooglemapsUrl,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::Industry => "industry",
            Self::Size => "size",
            Self::Website => "website",
            Self::Domain => "domain",
            Self::Description => "description",
            Self::Funding => "funding",
            Self::TechStack => "tech_stack",
            Self::EmployeeCount => "employee_count",
            Self::Location => "location",
            Self::Address => "address",
            Self::Phone => "phone",
            Self::Coordinates => "coordinates",
            Self::FoundedYear => "founded_year",
            Self::Stage => "stage",
            Self::Founders => "founders",
            Self::Contacts => "contacts",
            Self::LinkedinUrl => "linkedin_url",
            Self::AngellistUrl => "angellist_url",
            Self::GooglemapsUrl => "googlemaps_url",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Field {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Field::ALL
            .iter()
            .copied()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| format!("unknown field '{s}'"))
    }
}

// ---------------------------------------------------------------------------
// Merge policy
// ---------------------------------------------------------------------------

/// How a field that is already set reacts to a new value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// The first provider to set a field keeps it.
    #[default]
    FirstWins,
    /// A strictly higher-precedence (lower rank) provider may replace the value.
    HigherPrecedenceOverrides,
}

/// A field value plus where it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldEntry {
    pub value: Value,
    /// Provider id that supplied the value.
    pub provenance: String,
    /// Precedence position of that provider (0 = highest).
    pub rank: usize,
}

// ---------------------------------------------------------------------------
// PartialRecord
// ---------------------------------------------------------------------------

/// Canonical fields produced by normalizing one provider's payload.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PartialRecord {
    pub provider_id: String,
    pub fields: BTreeMap<Field, Value>,
}

impl PartialRecord {
    pub fn new(provider_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Insert a value, ignoring JSON nulls and empty strings/lists.
    pub fn set(&mut self, field: Field, value: impl Into<Value>) {
        let value = value.into();
        if is_blank(&value) {
            return;
        }
        self.fields.insert(field, value);
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// Confidence attached to an extracted signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "Low",
            Self::Medium => "Medium",
            Self::High => "High",
        }
    }
}

impl FromStr for Confidence {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(format!("unknown confidence '{other}'")),
        }
    }
}

/// A structured fact extracted from free text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    #[serde(rename = "type")]
    pub signal_type: String,
    pub value: String,
    pub confidence: Confidence,
}

// ---------------------------------------------------------------------------
// CanonicalRecord
// ---------------------------------------------------------------------------

/// The unified, provider-agnostic lead record flowing through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    identifier: String,
    fields: BTreeMap<Field, FieldEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    summary: Option<String>,
    /// `None` means signal detection was not attempted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    signals: Option<Vec<Signal>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    score: Option<u8>,
    #[serde(default)]
    enriched: bool,
}

impl CanonicalRecord {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            fields: BTreeMap::new(),
            summary: None,
            signals: None,
            score: None,
            enriched: false,
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn fields(&self) -> &BTreeMap<Field, FieldEntry> {
        &self.fields
    }

    pub fn get(&self, field: Field) -> Option<&Value> {
        self.fields.get(&field).map(|e| &e.value)
    }

    pub fn has(&self, field: Field) -> bool {
        self.fields.contains_key(&field)
    }

    /// Provider that supplied `field`, if set.
    pub fn provenance(&self, field: Field) -> Option<&str> {
        self.fields.get(&field).map(|e| e.provenance.as_str())
    }

    /// String value of `field`, if it is a non-empty JSON string.
    pub fn text(&self, field: Field) -> Option<&str> {
        self.get(field)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Set `field` according to `policy`. Returns `true` if the record changed.
    pub fn merge_field(
        &mut self,
        field: Field,
        value: Value,
        provenance: &str,
        rank: usize,
        policy: MergePolicy,
    ) -> bool {
        if is_blank(&value) {
            return false;
        }
        if let Some(existing) = self.fields.get(&field) {
            let replace = policy == MergePolicy::HigherPrecedenceOverrides && rank < existing.rank;
            if !replace {
                return false;
            }
        }
        self.fields.insert(
            field,
            FieldEntry {
                value,
                provenance: provenance.to_string(),
                rank,
            },
        );
        true
    }

    /// Merge every field of a partial. Returns the number of fields that changed.
    pub fn absorb(&mut self, partial: PartialRecord, rank: usize, policy: MergePolicy) -> usize {
        let provider = partial.provider_id;
        partial
            .fields
            .into_iter()
            .filter(|(field, value)| {
                self.merge_field(*field, value.clone(), &provider, rank, policy)
            })
            .count()
    }

    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    pub fn set_summary(&mut self, summary: impl Into<String>) {
        self.summary = Some(summary.into());
    }

    pub fn signals(&self) -> Option<&[Signal]> {
        self.signals.as_deref()
    }

    pub fn set_signals(&mut self, signals: Vec<Signal>) {
        self.signals = Some(signals);
    }

    pub fn score(&self) -> Option<u8> {
        self.score
    }

    /// Store a score, clamped to `[0, 100]`.
    pub fn set_score(&mut self, score: u8) {
        self.score = Some(score.min(100));
    }

    pub fn is_enriched(&self) -> bool {
        self.enriched
    }

    pub fn mark_enriched(&mut self) {
        self.enriched = true;
    }
}

// ---------------------------------------------------------------------------
// FinalRecord
// ---------------------------------------------------------------------------

/// A frozen record handed to the storage collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalRecord {
    run_id: RunId,
    finalized_at: DateTime<Utc>,
    #[serde(flatten)]
    record: CanonicalRecord,
}

impl FinalRecord {
    pub fn new(run_id: RunId, record: CanonicalRecord) -> Self {
        Self {
            run_id,
            finalized_at: Utc::now(),
            record,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn finalized_at(&self) -> DateTime<Utc> {
        self.finalized_at
    }

    pub fn record(&self) -> &CanonicalRecord {
        &self.record
    }

    pub fn identifier(&self) -> &str {
        self.record.identifier()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn run_id_roundtrip() {
        let id = RunId::new();
        let parsed: RunId = id.to_string().parse().expect("parse RunId");
        assert_eq!(id, parsed);
    }

    #[test]
    fn field_names_roundtrip() {
        for field in Field::ALL {
            let parsed: Field = field.as_str().parse().expect("parse field");
            assert_eq!(parsed, field);
            let json = serde_json::to_string(&field).unwrap();
            assert_eq!(json, format!("\"{}\"", field.as_str()));
        }
        assert!("revenue".parse::<Field>().is_err());
    }

    #[test]
    fn first_wins_keeps_existing_value() {
        let mut record = CanonicalRecord::new("Acme");
        assert!(record.merge_field(Field::Industry, json!("SaaS"), "crunchbase", 0, MergePolicy::FirstWins));
        assert!(!record.merge_field(Field::Industry, json!("Fintech"), "angellist", 1, MergePolicy::FirstWins));
        // Even a higher-precedence provider cannot replace under FirstWins.
        assert!(!record.merge_field(Field::Industry, json!("AI"), "preloaded", 0, MergePolicy::FirstWins));
        assert_eq!(record.get(Field::Industry), Some(&json!("SaaS")));
        assert_eq!(record.provenance(Field::Industry), Some("crunchbase"));
    }

    #[test]
    fn override_policy_only_accepts_higher_precedence() {
        let mut record = CanonicalRecord::new("Acme");
        let policy = MergePolicy::HigherPrecedenceOverrides;
        record.merge_field(Field::Funding, json!(10), "apollo", 2, policy);
        assert!(!record.merge_field(Field::Funding, json!(20), "kaspr", 3, policy));
        assert!(!record.merge_field(Field::Funding, json!(30), "peer", 2, policy));
        assert!(record.merge_field(Field::Funding, json!(40), "crunchbase", 0, policy));
        assert_eq!(record.get(Field::Funding), Some(&json!(40)));
        assert_eq!(record.provenance(Field::Funding), Some("crunchbase"));
    }

    #[test]
    fn blank_values_are_never_stored() {
        let mut partial = PartialRecord::new("kaspr");
        partial.set(Field::Website, Value::Null);
        partial.set(Field::Industry, "  ");
        partial.set(Field::Founders, json!([]));
        assert!(partial.is_empty());

        let mut record = CanonicalRecord::new("Acme");
        assert!(!record.merge_field(Field::Phone, json!(""), "googlemaps", 0, MergePolicy::FirstWins));
        assert!(!record.has(Field::Phone));
    }

    #[test]
    fn absorb_counts_changed_fields() {
        let mut record = CanonicalRecord::new("Acme");
        record.merge_field(Field::Industry, json!("SaaS"), "crunchbase", 0, MergePolicy::FirstWins);

        let mut partial = PartialRecord::new("kaspr");
        partial.set(Field::Industry, "Software");
        partial.set(Field::EmployeeCount, 120);
        let changed = record.absorb(partial, 1, MergePolicy::FirstWins);
        assert_eq!(changed, 1);
        assert_eq!(record.provenance(Field::EmployeeCount), Some("kaspr"));
    }

    #[test]
    fn confidence_parses_case_insensitively() {
        assert_eq!("HIGH".parse::<Confidence>(), Ok(Confidence::High));
        assert_eq!(" medium ".parse::<Confidence>(), Ok(Confidence::Medium));
        assert!("certain".parse::<Confidence>().is_err());
    }

    #[test]
    fn signals_distinguish_not_attempted_from_empty() {
        let mut record = CanonicalRecord::new("Acme");
        assert!(record.signals().is_none());
        record.set_signals(Vec::new());
        assert_eq!(record.signals().map(<[Signal]>::len), Some(0));
    }

    #[test]
    fn signal_serializes_type_key() {
        let signal = Signal {
            signal_type: "funding".into(),
            value: "$50M Series B".into(),
            confidence: Confidence::High,
        };
        let json = serde_json::to_value(&signal).unwrap();
        assert_eq!(json["type"], "funding");
        assert_eq!(json["confidence"], "High");
    }

    #[test]
    fn final_record_serializes_flat() {
        let mut record = CanonicalRecord::new("Acme");
        record.merge_field(Field::Domain, json!("acme.io"), "apollo", 1, MergePolicy::FirstWins);
        record.set_score(42);
        let final_record = FinalRecord::new(RunId::new(), record);

        let json = serde_json::to_value(&final_record).expect("serialize");
        assert_eq!(json["identifier"], "Acme");
        assert_eq!(json["score"], 42);
        assert_eq!(json["fields"]["domain"]["provenance"], "apollo");

        let parsed: FinalRecord = serde_json::from_value(json).expect("deserialize");
        assert_eq!(parsed.record().score(), Some(42));
    }

    #[test]
    fn raw_payload_roundtrip_is_byte_stable() {
        let mut data = Map::new();
        data.insert("name".into(), json!("Acme"));
        data.insert("employees".into(), json!(120));
        let payload = RawPayload::new("kaspr", data);

        let bytes = serde_json::to_vec(&payload).unwrap();
        let parsed: RawPayload = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(serde_json::to_vec(&parsed).unwrap(), bytes);
        assert_eq!(parsed.provider_id(), "kaspr");
    }
}
