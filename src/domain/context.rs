use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The structured object produced by REFINE and consumed by GENERATE,
/// conforming to the schema assembled from the job's templates.
///
/// Always carries the refinement provider, model, and detected language.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnrichedContext(pub Map<String, Value>);

impl EnrichedContext {
    pub const PROVIDER: &'static str = "provider";
    pub const MODEL: &'static str = "model";
    pub const LANGUAGE: &'static str = "language";

    pub fn from_object(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(EnrichedContext(map)),
            _ => None,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str)
    }

    pub fn insert(&mut self, field: &str, value: Value) {
        self.0.insert(field.to_string(), value);
    }

    pub fn language(&self) -> Option<&str> {
        self.get_str(Self::LANGUAGE)
    }

    /// Stamp the provenance fields. Existing values are overwritten: these
    /// describe the call that actually produced the context.
    pub fn stamp_provenance(&mut self, provider: &str, model: &str, language: Option<&str>) {
        self.insert(Self::PROVIDER, Value::String(provider.to_string()));
        self.insert(Self::MODEL, Value::String(model.to_string()));
        if self.language().is_none() {
            if let Some(lang) = language {
                self.insert(Self::LANGUAGE, Value::String(lang.to_string()));
            }
        }
    }
}
