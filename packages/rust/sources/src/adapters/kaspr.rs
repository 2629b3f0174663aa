//! Kaspr company data (LinkedIn-derived).

use leadflow_shared::{Field, PartialRecord, RawPayload};

use super::{Auth, ProviderSpec};
use crate::normalize::{SourceMapping, copy_key};

pub(crate) const SPEC: ProviderSpec = ProviderSpec {
    id: "kaspr",
    path: "company",
    query_param: "name",
    auth: Auth::Bearer,
    required_keys: &["name"],
};

const SUPPLIES: &[Field] = &[
    Field::Name,
    Field::LinkedinUrl,
    Field::Industry,
    Field::EmployeeCount,
    Field::Location,
    Field::Contacts,
];

pub struct KasprMapping;

impl SourceMapping for KasprMapping {
    fn provider_id(&self) -> &str {
        SPEC.id
    }

    fn supplies(&self) -> &[Field] {
        SUPPLIES
    }

    fn map(&self, raw: &RawPayload, out: &mut PartialRecord) {
        copy_key(raw, out, "name", Field::Name);
        copy_key(raw, out, "linkedin_url", Field::LinkedinUrl);
        copy_key(raw, out, "industry", Field::Industry);
        copy_key(raw, out, "employees", Field::EmployeeCount);
        copy_key(raw, out, "location", Field::Location);
        copy_key(raw, out, "contacts", Field::Contacts);
    }
}
