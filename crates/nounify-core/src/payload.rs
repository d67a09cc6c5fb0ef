use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde_json::{Map, Value};

/// Trait vocabulary the generator understands, in request order.
pub const TRAIT_KEYS: &[&str] = &["head", "glasses", "body", "accessories"];

/// Mapping from the fixed trait names to ordered candidate lists.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributePayload {
    traits: IndexMap<String, Vec<String>>,
}

impl AttributePayload {
    /// Parses an assistant reply as a payload object. Keys outside the trait
    /// vocabulary are ignored; missing keys yield empty candidate lists;
    /// non-string candidates are skipped. Malformed JSON is an error.
    pub fn parse(reply: &str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(reply.trim()).context("assistant reply is not valid JSON")?;
        let object = value
            .as_object()
            .context("assistant reply is not a JSON object")?;

        let mut traits = IndexMap::new();
        for key in TRAIT_KEYS {
            let candidates = object
                .get(*key)
                .and_then(Value::as_array)
                .map(|rows| {
                    rows.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect::<Vec<String>>()
                })
                .unwrap_or_default();
            traits.insert((*key).to_string(), candidates);
        }
        Ok(Self { traits })
    }

    /// Degenerate payload repeating the raw theme once under every trait.
    /// This is the body every generator request actually carries.
    pub fn fallback(theme: &str) -> Self {
        let mut traits = IndexMap::new();
        for key in TRAIT_KEYS {
            traits.insert((*key).to_string(), vec![theme.to_string()]);
        }
        Self { traits }
    }

    pub fn candidates(&self, trait_name: &str) -> &[String] {
        self.traits
            .get(trait_name)
            .map(|values| values.as_slice())
            .unwrap_or(&[])
    }

    pub fn trait_names(&self) -> Vec<String> {
        self.traits.keys().cloned().collect()
    }

    /// Wire shape for the generator request body.
    pub fn to_request_body(&self) -> Value {
        let mut body = Map::new();
        for (key, candidates) in &self.traits {
            body.insert(
                key.clone(),
                Value::Array(
                    candidates
                        .iter()
                        .cloned()
                        .map(Value::String)
                        .collect::<Vec<Value>>(),
                ),
            );
        }
        Value::Object(body)
    }
}
