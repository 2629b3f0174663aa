//! Apollo organization enrichment.

use leadflow_shared::{Field, PartialRecord, RawPayload};

use super::{Auth, ProviderSpec};
use crate::normalize::{SourceMapping, copy_key, derive_domain};

pub(crate) const SPEC: ProviderSpec = ProviderSpec {
    id: "apollo",
    path: "organizations/enrich",
    query_param: "name",
    auth: Auth::Header("X-Api-Key"),
    required_keys: &[],
};

const SUPPLIES: &[Field] = &[
    Field::Funding,
    Field::TechStack,
    Field::EmployeeCount,
    Field::Domain,
    Field::Industry,
    Field::Website,
];

pub struct ApolloMapping;

impl SourceMapping for ApolloMapping {
    fn provider_id(&self) -> &str {
        SPEC.id
    }

    fn supplies(&self) -> &[Field] {
        SUPPLIES
    }

    fn map(&self, raw: &RawPayload, out: &mut PartialRecord) {
        copy_key(raw, out, "funding", Field::Funding);
        copy_key(raw, out, "tech_stack", Field::TechStack);
        copy_key(raw, out, "employee_count", Field::EmployeeCount);
        copy_key(raw, out, "domain", Field::Domain);
        copy_key(raw, out, "industry", Field::Industry);
        copy_key(raw, out, "website", Field::Website);
        derive_domain(out);
    }
}
