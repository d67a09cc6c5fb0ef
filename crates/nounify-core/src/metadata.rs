use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One fetched NFT metadata record. Immutable once created; the session
/// holds these in an ordered preview list replaced wholesale on each
/// successful generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NftMetadata {
    pub description: String,
    pub external_url: String,
    pub image: String,
    pub name: String,
    #[serde(default)]
    pub attributes: Value,
    /// Source metadata URL this record was fetched from.
    pub uri: String,
}

impl NftMetadata {
    /// Builds a record from a fetched metadata body, tagging it with the
    /// source URL. Missing string fields collapse to empty strings; the
    /// attributes shape is carried through untouched.
    pub fn from_value(body: &Value, uri: &str) -> Self {
        Self {
            description: string_field(body, "description"),
            external_url: string_field(body, "external_url"),
            image: string_field(body, "image"),
            name: string_field(body, "name"),
            attributes: body.get("attributes").cloned().unwrap_or(Value::Null),
            uri: uri.to_string(),
        }
    }
}

fn string_field(body: &Value, key: &str) -> String {
    body.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
