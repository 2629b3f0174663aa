//! AngelList startup profiles.

use leadflow_shared::{Field, PartialRecord, RawPayload};

use super::{Auth, ProviderSpec};
use crate::normalize::{SourceMapping, copy_key};

pub(crate) const SPEC: ProviderSpec = ProviderSpec {
    id: "angellist",
    path: "startups/search",
    query_param: "query",
    auth: Auth::Bearer,
    required_keys: &["name"],
};

const SUPPLIES: &[Field] = &[
    Field::Name,
    Field::AngellistUrl,
    Field::Industry,
    Field::Stage,
    Field::Location,
    Field::Founders,
];

pub struct AngelListMapping;

impl SourceMapping for AngelListMapping {
    fn provider_id(&self) -> &str {
        SPEC.id
    }

    fn supplies(&self) -> &[Field] {
        SUPPLIES
    }

    fn map(&self, raw: &RawPayload, out: &mut PartialRecord) {
        copy_key(raw, out, "name", Field::Name);
        copy_key(raw, out, "angellist_url", Field::AngellistUrl);
        copy_key(raw, out, "industry", Field::Industry);
        copy_key(raw, out, "stage", Field::Stage);
        copy_key(raw, out, "location", Field::Location);
        copy_key(raw, out, "founders", Field::Founders);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn absent_fields_are_omitted() {
        let raw = RawPayload::new(
            "angellist",
            json!({"name": "Acme", "stage": "Seed", "founders": []})
                .as_object()
                .cloned()
                .unwrap_or_default(),
        );
        let mut out = PartialRecord::new("angellist");
        AngelListMapping.map(&raw, &mut out);
        assert_eq!(out.len(), 2);
        assert_eq!(out.fields[&Field::Stage], json!("Seed"));
    }
}
