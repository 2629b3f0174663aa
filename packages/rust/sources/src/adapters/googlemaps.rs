//! Google Maps place details.

use serde_json::Value;

use leadflow_shared::{Field, PartialRecord, RawPayload};

use super::{Auth, ProviderSpec};
use crate::normalize::{SourceMapping, copy_key, derive_domain};

pub(crate) const SPEC: ProviderSpec = ProviderSpec {
    id: "googlemaps",
    path: "findplacefromtext/json",
    query_param: "input",
    auth: Auth::Query("key"),
    required_keys: &["name"],
};

const SUPPLIES: &[Field] = &[
    Field::Name,
    Field::Address,
    Field::Website,
    Field::Domain,
    Field::Phone,
    Field::Location,
    Field::Coordinates,
    Field::GooglemapsUrl,
];

/// `location` is a `{lat, lng}` object here, so it lands in `coordinates`.
pub struct GoogleMapsMapping;

impl SourceMapping for GoogleMapsMapping {
    fn provider_id(&self) -> &str {
        SPEC.id
    }

    fn supplies(&self) -> &[Field] {
        SUPPLIES
    }

    fn map(&self, raw: &RawPayload, out: &mut PartialRecord) {
        copy_key(raw, out, "name", Field::Name);
        copy_key(raw, out, "address", Field::Address);
        copy_key(raw, out, "website", Field::Website);
        copy_key(raw, out, "phone", Field::Phone);
        copy_key(raw, out, "googlemaps_url", Field::GooglemapsUrl);
        match raw.get("location") {
            Some(Value::Object(coords)) if coords.contains_key("lat") && coords.contains_key("lng") => {
                out.set(Field::Coordinates, Value::Object(coords.clone()));
            }
            Some(other) => out.set(Field::Location, other.clone()),
            None => {}
        }
        derive_domain(out);
    }
}
