//! Crunchbase organization profiles.

use leadflow_shared::{Field, PartialRecord, RawPayload};

use super::{Auth, ProviderSpec};
use crate::normalize::{SourceMapping, copy_key, derive_domain};

pub(crate) const SPEC: ProviderSpec = ProviderSpec {
    id: "crunchbase",
    path: "organizations/search",
    query_param: "name",
    auth: Auth::Header("X-cb-user-key"),
    required_keys: &["name"],
};

const SUPPLIES: &[Field] = &[
    Field::Name,
    Field::Description,
    Field::Founders,
    Field::Website,
    Field::Domain,
    Field::Location,
    Field::FoundedYear,
    Field::Funding,
    Field::EmployeeCount,
    Field::Size,
];

/// Renames `founded` to `founded_year` and flattens founder objects to names.
pub struct CrunchbaseMapping;

impl SourceMapping for CrunchbaseMapping {
    fn provider_id(&self) -> &str {
        SPEC.id
    }

    fn supplies(&self) -> &[Field] {
        SUPPLIES
    }

    fn map(&self, raw: &RawPayload, out: &mut PartialRecord) {
        copy_key(raw, out, "name", Field::Name);
        copy_key(raw, out, "description", Field::Description);
        copy_key(raw, out, "founders", Field::Founders);
        copy_key(raw, out, "website", Field::Website);
        copy_key(raw, out, "location", Field::Location);
        copy_key(raw, out, "founded", Field::FoundedYear);
        copy_key(raw, out, "total_funding", Field::Funding);
        copy_key(raw, out, "employee_range", Field::Size);
        copy_key(raw, out, "employee_range", Field::EmployeeCount);
        derive_domain(out);
    }
}
