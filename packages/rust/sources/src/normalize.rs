//! Mapping provider payloads onto canonical fields.
//!
//! Every provider has a [`SourceMapping`]; the [`Normalizer`] picks the
//! mapping by provider id and falls back to [`GenericMapping`], which copies
//! keys that already carry canonical names. Absent raw fields are omitted,
//! never defaulted.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Value, json};
use url::Url;

use leadflow_shared::{Field, LeadflowError, PartialRecord, RawPayload, Result};

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Provider-specific translation from a raw payload to canonical fields.
pub trait SourceMapping: Send + Sync {
    /// Provider id this mapping handles.
    fn provider_id(&self) -> &str;

    /// Canonical fields this provider can populate.
    fn supplies(&self) -> &[Field];

    /// Write whatever canonical fields `raw` carries into `out`.
    fn map(&self, raw: &RawPayload, out: &mut PartialRecord);
}

// ---------------------------------------------------------------------------
// Generic fallback
// ---------------------------------------------------------------------------

/// Copies canonical keys as-is, with unit conversion for numeric fields.
///
/// Also accepts the common aliases `company_name`, `employees` and `founded`.
pub struct GenericMapping;

impl SourceMapping for GenericMapping {
    fn provider_id(&self) -> &str {
        "generic"
    }

    fn supplies(&self) -> &[Field] {
        &Field::ALL
    }

    fn map(&self, raw: &RawPayload, out: &mut PartialRecord) {
        for (key, value) in raw.data() {
            let (field, alias) = match key.as_str() {
                "company_name" => (Field::Name, true),
                "employees" => (Field::EmployeeCount, true),
                "founded" => (Field::FoundedYear, true),
                other => match other.parse::<Field>() {
                    Ok(field) => (field, false),
                    Err(_) => continue,
                },
            };
            // canonical key wins over its alias
            if alias && raw.data().contains_key(field.as_str()) {
                continue;
            }
            set_converted(out, field, value);
        }
        derive_domain(out);
    }
}

/// Copy raw `key` into `field` if present.
pub fn copy_key(raw: &RawPayload, out: &mut PartialRecord, key: &str, field: Field) {
    if let Some(value) = raw.get(key) {
        set_converted(out, field, value);
    }
}

/// Derive `domain` from `website` unless the payload already set one.
pub fn derive_domain(out: &mut PartialRecord) {
    if out.fields.contains_key(&Field::Domain) {
        return;
    }
    if let Some(domain) = out.fields.get(&Field::Website).and_then(domain_from_value) {
        out.set(Field::Domain, domain);
    }
}

/// Store `value` under `field`, converting units where the field needs it.
pub fn set_converted(out: &mut PartialRecord, field: Field, value: &Value) {
    match field {
        Field::Funding => {
            if let Some(usd) = parse_money(value) {
                out.set(field, usd);
            }
        }
        Field::EmployeeCount => {
            if let Some(count) = parse_employee_count(value) {
                out.set(field, count);
            }
        }
        Field::FoundedYear => {
            if let Some(year) = parse_year(value) {
                out.set(field, year);
            }
        }
        Field::Founders | Field::Contacts => {
            let names = names_from_list(value);
            if !names.is_empty() {
                out.set(field, json!(names));
            }
        }
        Field::TechStack => {
            let items = string_list(value);
            if !items.is_empty() {
                out.set(field, json!(items));
            }
        }
        Field::Domain => {
            if let Some(domain) = domain_from_value(value) {
                out.set(field, domain);
            }
        }
        _ => out.set(field, value.clone()),
    }
}

// ---------------------------------------------------------------------------
// Normalizer
// ---------------------------------------------------------------------------

/// Dispatches payloads to their provider's mapping.
pub struct Normalizer {
    mappings: HashMap<String, Box<dyn SourceMapping>>,
    generic: GenericMapping,
}

impl Normalizer {
    /// A normalizer knowing every built-in provider.
    pub fn new() -> Self {
        let mut normalizer = Self {
            mappings: HashMap::new(),
            generic: GenericMapping,
        };
        for mapping in crate::adapters::builtin_mappings() {
            normalizer.register(mapping);
        }
        normalizer
    }

    /// Add or replace the mapping for its provider id.
    pub fn register(&mut self, mapping: Box<dyn SourceMapping>) {
        self.mappings
            .insert(mapping.provider_id().to_string(), mapping);
    }

    /// The mapping used for `provider_id`. Always returns one.
    pub fn mapping(&self, provider_id: &str) -> &dyn SourceMapping {
        self.mappings
            .get(provider_id)
            .map(|m| m.as_ref())
            .unwrap_or(&self.generic)
    }

    /// Produce the canonical partial for one provider payload.
    ///
    /// A payload yielding no canonical fields is `MalformedResponse`.
    pub fn normalize(&self, provider_id: &str, raw: &RawPayload) -> Result<PartialRecord> {
        let mut partial = PartialRecord::new(provider_id);
        self.mapping(provider_id).map(raw, &mut partial);
        if partial.is_empty() {
            return Err(LeadflowError::malformed(
                provider_id,
                "payload carries no recognizable fields",
            ));
        }
        Ok(partial)
    }
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

static MONEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:usd\s*)?\$?\s*([0-9][0-9,]*(?:\.[0-9]+)?)\s*(thousand|million|billion|bn|mm|k|m|b)?\b")
        .expect("valid regex")
});

static NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([0-9][0-9,]*)").expect("valid regex")
});

static YEAR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(1[89][0-9]{2}|20[0-9]{2})\b").expect("valid regex")
});

/// Money as whole USD: `"$1.5B"` is 1,500,000,000; numbers pass through.
pub fn parse_money(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f.round() as u64)),
        Value::String(s) => {
            let caps = MONEY_RE.captures(s)?;
            let amount: f64 = caps[1].replace(',', "").parse().ok()?;
            let multiplier = match caps.get(2).map(|m| m.as_str().to_ascii_lowercase()) {
                Some(unit) if unit == "k" || unit == "thousand" => 1e3,
                Some(unit) if unit == "m" || unit == "mm" || unit == "million" => 1e6,
                Some(unit) if unit == "b" || unit == "bn" || unit == "billion" => 1e9,
                _ => 1.0,
            };
            Some((amount * multiplier).round() as u64)
        }
        _ => None,
    }
}

/// Headcount: ranges like `"51-200"` collapse to their lower bound.
pub fn parse_employee_count(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => NUMBER_RE
            .captures(s)
            .and_then(|caps| caps[1].replace(',', "").parse().ok()),
        _ => None,
    }
}

/// A plausible founding year from a number or a date-like string.
pub fn parse_year(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().filter(|y| (1800..=2100).contains(y)),
        Value::String(s) => YEAR_RE.captures(s).and_then(|caps| caps[1].parse().ok()),
        _ => None,
    }
}

/// `[{"name": ..}, ..]` or `["..", ..]` flattened to names.
pub fn names_from_list(value: &Value) -> Vec<String> {
    let Value::Array(items) = value else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Object(map) => map
                .get("name")
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string()),
            _ => None,
        })
        .filter(|s| !s.is_empty())
        .collect()
}

/// A list of strings, or a comma-separated string split into one.
pub fn string_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(_) => names_from_list(value),
        Value::String(s) => s
            .split(',')
            .map(|part| part.trim().to_string())
            .filter(|part| !part.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

/// Registrable host of a website, without a leading `www.`.
pub fn domain_from_website(website: &str) -> Option<String> {
    let website = website.trim();
    if website.is_empty() {
        return None;
    }
    let parsed = Url::parse(website)
        .ok()
        .filter(|u| u.host_str().is_some())
        .or_else(|| Url::parse(&format!("https://{website}")).ok())?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);
    host.contains('.').then(|| host.to_string())
}

fn domain_from_value(value: &Value) -> Option<String> {
    value.as_str().and_then(domain_from_website)
}
