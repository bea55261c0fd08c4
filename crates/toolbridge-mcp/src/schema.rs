//! Tool parameter schemas.
//!
//! Servers describe tool arguments either as a JSON Schema object
//! (`type`/`properties`/`required`) or as a bare property map. Both normalize
//! into [`ObjectSchema`], which validates call arguments and renders back to
//! JSON Schema for consumers.

use crate::error::{McpError, McpResult};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// Type of a single parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamKind {
    String,
    Number,
    Integer,
    Boolean,
    Array(Option<Box<ParamSchema>>),
    Object,
    Enum(Vec<Value>),
    /// Unrecognized or missing type; any value is accepted.
    Any,
}

/// A parameter node.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSchema {
    pub kind: ParamKind,
    pub description: Option<String>,
}

impl ParamSchema {
    pub fn new(kind: ParamKind) -> Self {
        Self {
            kind,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Normalize one property descriptor.
    pub fn from_value(value: &Value) -> Self {
        let description = value
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string);

        let kind = if let Some(values) = value.get("enum").and_then(Value::as_array) {
            ParamKind::Enum(values.clone())
        } else {
            match declared_type(value) {
                Some("string") => ParamKind::String,
                Some("number") => ParamKind::Number,
                Some("integer") => ParamKind::Integer,
                Some("boolean") => ParamKind::Boolean,
                Some("object") => ParamKind::Object,
                Some("array") => ParamKind::Array(
                    value
                        .get("items")
                        .filter(|items| items.is_object())
                        .map(|items| Box::new(Self::from_value(items))),
                ),
                _ => ParamKind::Any,
            }
        };

        Self { kind, description }
    }

    fn check(&self, name: &str, value: &Value) -> McpResult<()> {
        let ok = match &self.kind {
            ParamKind::String => value.is_string(),
            ParamKind::Number => value.is_number(),
            ParamKind::Integer => {
                value.is_i64()
                    || value.is_u64()
                    || value.as_f64().is_some_and(|f| f.fract() == 0.0)
            }
            ParamKind::Boolean => value.is_boolean(),
            ParamKind::Object => value.is_object(),
            ParamKind::Enum(values) => values.contains(value),
            ParamKind::Any => true,
            ParamKind::Array(items) => {
                let Some(elements) = value.as_array() else {
                    return Err(type_error(name, "an array"));
                };
                if let Some(items) = items {
                    for (i, element) in elements.iter().enumerate() {
                        items.check(&format!("{name}[{i}]"), element)?;
                    }
                }
                true
            }
        };

        if ok {
            Ok(())
        } else {
            Err(type_error(name, self.kind.expected()))
        }
    }

    /// Render as a JSON Schema node.
    pub fn to_json_schema(&self) -> Value {
        let mut node = match &self.kind {
            ParamKind::String => json!({ "type": "string" }),
            ParamKind::Number => json!({ "type": "number" }),
            ParamKind::Integer => json!({ "type": "integer" }),
            ParamKind::Boolean => json!({ "type": "boolean" }),
            ParamKind::Object => json!({ "type": "object" }),
            ParamKind::Enum(values) => json!({ "enum": values }),
            ParamKind::Any => json!({}),
            ParamKind::Array(items) => match items {
                Some(items) => json!({ "type": "array", "items": items.to_json_schema() }),
                None => json!({ "type": "array" }),
            },
        };
        if let Some(description) = &self.description {
            node["description"] = json!(description);
        }
        node
    }
}

impl ParamKind {
    fn expected(&self) -> &'static str {
        match self {
            Self::String => "a string",
            Self::Number => "a number",
            Self::Integer => "an integer",
            Self::Boolean => "a boolean",
            Self::Array(_) => "an array",
            Self::Object => "an object",
            Self::Enum(_) => "one of the allowed values",
            Self::Any => "any value",
        }
    }
}

fn type_error(name: &str, expected: &str) -> McpError {
    McpError::InvalidArguments(format!("parameter '{name}' must be {expected}"))
}

/// `type` of a descriptor; for a type union, the first non-null member.
fn declared_type(value: &Value) -> Option<&str> {
    match value.get("type")? {
        Value::String(s) => Some(s.as_str()),
        Value::Array(types) => types
            .iter()
            .filter_map(Value::as_str)
            .find(|t| *t != "null"),
        _ => None,
    }
}

/// Normalized argument schema of a tool.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectSchema {
    pub properties: BTreeMap<String, ParamSchema>,
    pub required: Vec<String>,
}

impl ObjectSchema {
    /// Normalize a raw descriptor. Anything that is not an object yields an
    /// empty schema.
    pub fn normalize(raw: Option<&Value>) -> Self {
        let Some(obj) = raw.and_then(Value::as_object) else {
            return Self::default();
        };

        if is_object_schema(obj) {
            let properties = obj
                .get("properties")
                .and_then(Value::as_object)
                .map(normalize_properties)
                .unwrap_or_default();
            // A malformed `required` makes every property optional.
            let mut required = Vec::new();
            if let Some(names) = obj.get("required").and_then(Value::as_array) {
                for name in names.iter().filter_map(Value::as_str) {
                    if !required.iter().any(|r| r == name) {
                        required.push(name.to_string());
                    }
                }
            }
            Self {
                properties,
                required,
            }
        } else {
            Self {
                properties: normalize_properties(obj),
                required: Vec::new(),
            }
        }
    }

    pub fn property(&self, name: &str) -> Option<&ParamSchema> {
        self.properties.get(name)
    }

    pub fn is_required(&self, name: &str) -> bool {
        self.required.iter().any(|r| r == name)
    }

    /// Add `name` if absent and mark it required.
    ///
    /// Returns true if the schema changed.
    pub fn require(&mut self, name: &str, param: ParamSchema) -> bool {
        let mut changed = false;
        if !self.properties.contains_key(name) {
            self.properties.insert(name.to_string(), param);
            changed = true;
        }
        if !self.is_required(name) {
            self.required.push(name.to_string());
            changed = true;
        }
        changed
    }

    /// Check call arguments. `null` counts as no arguments.
    pub fn validate(&self, args: &Value) -> McpResult<()> {
        let empty = Map::new();
        let args = match args {
            Value::Object(map) => map,
            Value::Null => &empty,
            _ => {
                return Err(McpError::InvalidArguments(
                    "arguments must be a JSON object".to_string(),
                ))
            }
        };

        for name in &self.required {
            if args.get(name).map_or(true, Value::is_null) {
                return Err(McpError::InvalidArguments(format!(
                    "missing required parameter '{name}'"
                )));
            }
        }

        for (name, value) in args {
            if value.is_null() && !self.is_required(name) {
                continue;
            }
            if let Some(param) = self.properties.get(name) {
                param.check(name, value)?;
            }
        }
        Ok(())
    }

    /// Render as a JSON Schema object.
    pub fn to_json_schema(&self) -> Value {
        let properties: Map<String, Value> = self
            .properties
            .iter()
            .map(|(name, param)| (name.clone(), param.to_json_schema()))
            .collect();

        let mut schema = json!({
            "type": "object",
            "properties": properties,
        });
        if !self.required.is_empty() {
            schema["required"] = json!(self.required);
        }
        schema
    }
}

fn is_object_schema(obj: &Map<String, Value>) -> bool {
    obj.get("type").and_then(Value::as_str) == Some("object")
        || obj.get("properties").is_some_and(Value::is_object)
}

fn normalize_properties(map: &Map<String, Value>) -> BTreeMap<String, ParamSchema> {
    map.iter()
        .map(|(name, value)| (name.clone(), ParamSchema::from_value(value)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_schema_required() {
        let raw = json!({
            "type": "object",
            "properties": { "a": { "type": "string", "description": "first" } },
            "required": ["a"]
        });
        let schema = ObjectSchema::normalize(Some(&raw));
        assert!(schema.is_required("a"));
        assert_eq!(schema.property("a").unwrap().kind, ParamKind::String);
        assert_eq!(schema.property("a").unwrap().description.as_deref(), Some("first"));

        let raw = json!({
            "type": "object",
            "properties": { "a": { "type": "string" } },
            "required": []
        });
        let schema = ObjectSchema::normalize(Some(&raw));
        assert!(!schema.is_required("a"));
        assert_eq!(schema.property("a").unwrap().kind, ParamKind::String);
    }

    #[test]
    fn test_flat_property_map() {
        let raw = json!({
            "path": { "type": "string" },
            "recursive": { "type": "boolean" }
        });
        let schema = ObjectSchema::normalize(Some(&raw));
        assert_eq!(schema.properties.len(), 2);
        assert_eq!(schema.property("recursive").unwrap().kind, ParamKind::Boolean);
        assert!(schema.required.is_empty());
    }

    #[test]
    fn test_malformed_required_is_ignored() {
        let raw = json!({
            "type": "object",
            "properties": { "a": { "type": "number" } },
            "required": "a"
        });
        let schema = ObjectSchema::normalize(Some(&raw));
        assert!(schema.required.is_empty());
        assert_eq!(schema.property("a").unwrap().kind, ParamKind::Number);
    }

    #[test]
    fn test_kinds() {
        let raw = json!({
            "type": "object",
            "properties": {
                "n": { "type": "integer" },
                "mode": { "type": "string", "enum": ["fast", "slow"] },
                "tags": { "type": "array", "items": { "type": "string" } },
                "opts": { "type": "object" },
                "maybe": { "type": ["null", "boolean"] },
                "weird": { "type": "date" },
                "untyped": {}
            }
        });
        let schema = ObjectSchema::normalize(Some(&raw));
        assert_eq!(schema.property("n").unwrap().kind, ParamKind::Integer);
        assert_eq!(
            schema.property("mode").unwrap().kind,
            ParamKind::Enum(vec![json!("fast"), json!("slow")])
        );
        assert_eq!(
            schema.property("tags").unwrap().kind,
            ParamKind::Array(Some(Box::new(ParamSchema::new(ParamKind::String))))
        );
        assert_eq!(schema.property("opts").unwrap().kind, ParamKind::Object);
        assert_eq!(schema.property("maybe").unwrap().kind, ParamKind::Boolean);
        assert_eq!(schema.property("weird").unwrap().kind, ParamKind::Any);
        assert_eq!(schema.property("untyped").unwrap().kind, ParamKind::Any);
    }

    #[test]
    fn test_non_object_descriptor_is_empty() {
        assert_eq!(ObjectSchema::normalize(None), ObjectSchema::default());
        assert_eq!(ObjectSchema::normalize(Some(&json!("x"))), ObjectSchema::default());
        assert_eq!(ObjectSchema::normalize(Some(&json!({}))), ObjectSchema::default());
        assert_eq!(
            ObjectSchema::default().to_json_schema(),
            json!({ "type": "object", "properties": {} })
        );
    }

    #[test]
    fn test_validate() {
        let raw = json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "limit": { "type": "integer" },
                "tags": { "type": "array", "items": { "type": "string" } }
            },
            "required": ["path"]
        });
        let schema = ObjectSchema::normalize(Some(&raw));

        assert!(schema.validate(&json!({ "path": "/tmp", "limit": 3 })).is_ok());
        assert!(schema.validate(&json!({ "path": "/tmp", "extra": true })).is_ok());
        assert!(schema.validate(&json!({ "path": "/tmp", "limit": null })).is_ok());

        let err = schema.validate(&json!({})).unwrap_err();
        assert!(err.to_string().contains("missing required parameter 'path'"));

        let err = schema.validate(&json!({ "path": 1 })).unwrap_err();
        assert!(matches!(err, McpError::InvalidArguments(_)));

        assert!(schema.validate(&json!({ "path": "a", "limit": 1.5 })).is_err());
        assert!(schema.validate(&json!({ "path": "a", "tags": ["x", 2] })).is_err());
        assert!(schema.validate(&json!([1])).is_err());
        assert!(ObjectSchema::default().validate(&Value::Null).is_ok());
    }

    #[test]
    fn test_require_injects_parameter() {
        let mut schema = ObjectSchema::default();
        assert!(schema.require("path", ParamSchema::new(ParamKind::String)));
        assert!(!schema.require("path", ParamSchema::new(ParamKind::String)));
        assert_eq!(
            schema.to_json_schema(),
            json!({
                "type": "object",
                "properties": { "path": { "type": "string" } },
                "required": ["path"]
            })
        );
    }

    #[test]
    fn test_to_json_schema_preserves_descriptions() {
        let raw = json!({ "q": { "type": "string", "description": "query" } });
        let schema = ObjectSchema::normalize(Some(&raw));
        assert_eq!(
            schema.to_json_schema()["properties"]["q"],
            json!({ "type": "string", "description": "query" })
        );
    }
}
