use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Shape of one refinement field: a primitive tag, an array of a shape, or
/// a nested object of shapes. Mirrors what templates declare in their
/// `custom_fields` front matter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldStructure {
    Primitive(Primitive),
    Array(Vec<FieldStructure>),
    Object(BTreeMap<String, FieldStructure>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Primitive {
    String,
    Number,
}

impl FieldStructure {
    pub fn string() -> Self {
        FieldStructure::Primitive(Primitive::String)
    }

    pub fn array_of(inner: FieldStructure) -> Self {
        FieldStructure::Array(vec![inner])
    }

    /// Render the shape as the JSON skeleton shown to refinement models.
    pub fn to_shape_json(&self) -> Value {
        match self {
            FieldStructure::Primitive(Primitive::String) => Value::String("string".into()),
            FieldStructure::Primitive(Primitive::Number) => Value::String("number".into()),
            FieldStructure::Array(inner) => Value::Array(
                inner
                    .iter()
                    .map(FieldStructure::to_shape_json)
                    .collect::<Vec<_>>(),
            ),
            FieldStructure::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_shape_json()))
                    .collect(),
            ),
        }
    }
}

/// One field a template requires from the refinement stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(default)]
    pub description: String,
    pub structure: FieldStructure,
}

/// The per-job refinement schema: field name to specification, assembled by
/// folding the artifact list's template declarations (union, merge-by-name).
pub type RequiredFields = BTreeMap<String, FieldSpec>;

/// Fallback schema used when the artifact list is empty or no template
/// declares fields.
pub fn default_schema() -> RequiredFields {
    let mut fields = RequiredFields::new();
    let mut add = |name: &str, description: &str, structure: FieldStructure| {
        fields.insert(
            name.to_string(),
            FieldSpec {
                description: description.to_string(),
                structure,
            },
        );
    };

    add(
        "clean_text",
        "cleaned transcript, filler words removed, grouped by speaker",
        FieldStructure::string(),
    );
    add(
        "summary",
        "concise executive summary",
        FieldStructure::string(),
    );
    add(
        "key_takeaways",
        "the main points worth remembering",
        FieldStructure::array_of(FieldStructure::string()),
    );
    add(
        "participants",
        "real names of the people who actually spoke",
        FieldStructure::array_of(FieldStructure::string()),
    );
    add("quotes", "notable verbatim quotes", {
        let mut shape = BTreeMap::new();
        shape.insert("speaker".to_string(), FieldStructure::string());
        shape.insert("text".to_string(), FieldStructure::string());
        FieldStructure::array_of(FieldStructure::Object(shape))
    });
    add("action_items", "follow-up tasks with assignees", {
        let mut shape = BTreeMap::new();
        shape.insert("assignee".to_string(), FieldStructure::string());
        shape.insert("task".to_string(), FieldStructure::string());
        FieldStructure::array_of(FieldStructure::Object(shape))
    });

    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structure_deserializes_primitives_arrays_and_objects() {
        let primitive: FieldStructure = serde_yaml::from_str("string").unwrap();
        assert_eq!(primitive, FieldStructure::string());

        let array: FieldStructure = serde_yaml::from_str("[string]").unwrap();
        assert_eq!(array, FieldStructure::array_of(FieldStructure::string()));

        let object: FieldStructure =
            serde_yaml::from_str("{assignee: string, task: string}").unwrap();
        match object {
            FieldStructure::Object(fields) => {
                assert_eq!(fields.len(), 2);
                assert_eq!(fields["task"], FieldStructure::string());
            }
            other => panic!("expected object, got {:?}", other),
        }
    }

    #[test]
    fn shape_json_mirrors_the_declared_structure() {
        let structure = FieldStructure::array_of(FieldStructure::Object(
            [
                ("speaker".to_string(), FieldStructure::string()),
                (
                    "minute".to_string(),
                    FieldStructure::Primitive(Primitive::Number),
                ),
            ]
            .into_iter()
            .collect(),
        ));
        let shape = structure.to_shape_json();
        assert_eq!(
            shape,
            serde_json::json!([{"speaker": "string", "minute": "number"}])
        );
    }

    #[test]
    fn default_schema_covers_the_documented_fields() {
        let schema = default_schema();
        for field in [
            "clean_text",
            "summary",
            "key_takeaways",
            "participants",
            "quotes",
            "action_items",
        ] {
            assert!(schema.contains_key(field), "missing {}", field);
        }
    }
}
