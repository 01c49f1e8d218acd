//! Datasource configuration: raw caller-supplied values and the validated
//! struct built from them once per query.

use crate::error::{DataError, Result};
use crate::schema::IntegrationSchema;
use crate::types::{is_blank, Document};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;

/// Concrete values for one configured instance of an integration.
///
/// Owned by the caller. Values are opaque until validated against a schema.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatasourceConfig {
    values: Document,
}

impl DatasourceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a JSON object such as stored service parameters
    pub fn from_json(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| {
            DataError::config_validation(format!("datasource configuration must be an object: {}", e))
        })
    }

    pub fn with_value(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

// Raw values may hold secrets; only keys are shown.
impl fmt::Debug for DatasourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatasourceConfig")
            .field("keys", &self.values.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Configuration checked against an integration's field descriptors.
///
/// Construction is the validation step: every required field is present and
/// coercible to its declared type, defaults are applied, unknown keys are
/// dropped. Adapters only ever see this type.
#[derive(Clone)]
pub struct ValidatedConfig {
    integration: String,
    values: Document,
    secrets: BTreeSet<String>,
}

impl ValidatedConfig {
    pub fn new(schema: &IntegrationSchema, raw: &DatasourceConfig) -> Result<Self> {
        let mut values = Document::new();
        let mut secrets = BTreeSet::new();
        let mut missing = Vec::new();

        for (name, field) in &schema.config_fields {
            if field.field_type.is_secret() {
                secrets.insert(name.clone());
            }

            let supplied = raw.get(name).filter(|v| !is_blank(v));
            let value = match supplied.or(field.default.as_ref()) {
                Some(value) => value,
                None => {
                    if field.required {
                        missing.push(name.as_str());
                    }
                    continue;
                }
            };

            let coerced = field.field_type.coerce(value).ok_or_else(|| {
                DataError::config_validation(format!(
                    "{}: field '{}' must be {}",
                    schema.name, name, field.field_type
                ))
            })?;
            values.insert(name.clone(), coerced);
        }

        if !missing.is_empty() {
            return Err(DataError::config_validation(format!(
                "{}: missing required field(s): {}",
                schema.name,
                missing.join(", ")
            )));
        }

        Ok(Self {
            integration: schema.name.clone(),
            values,
            secrets,
        })
    }

    /// Name of the integration this configuration was validated for
    pub fn integration(&self) -> &str {
        &self.integration
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    /// String value that must be present
    pub fn require_str(&self, name: &str) -> Result<&str> {
        self.str(name).ok_or_else(|| {
            DataError::config_validation(format!(
                "{}: field '{}' is not set",
                self.integration, name
            ))
        })
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(Value::as_f64)
    }

    /// Non-negative integral value
    pub fn u64(&self, name: &str) -> Option<u64> {
        let value = self.get(name)?;
        value.as_u64().or_else(|| {
            value
                .as_f64()
                .filter(|n| *n >= 0.0 && n.fract() == 0.0)
                .map(|n| n as u64)
        })
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(Value::as_bool)
    }
}

impl fmt::Debug for ValidatedConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (name, value) in &self.values {
            if self.secrets.contains(name) {
                map.entry(name, &"***");
            } else {
                map.entry(name, value);
            }
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FieldDescriptor, FieldType};
    use serde_json::json;

    fn schema() -> IntegrationSchema {
        IntegrationSchema::new("postgres")
            .with_config_field(
                "host",
                FieldDescriptor::required(FieldType::String).with_default("localhost"),
            )
            .with_config_field(
                "port",
                FieldDescriptor::optional(FieldType::Number).with_default(5432),
            )
            .with_config_field("database", FieldDescriptor::required(FieldType::String))
            .with_config_field("password", FieldDescriptor::optional(FieldType::Password))
            .with_config_field("ssl", FieldDescriptor::optional(FieldType::Boolean))
    }

    #[test]
    fn test_defaults_and_coercion() {
        let raw = DatasourceConfig::new()
            .with_value("database", "app")
            .with_value("port", "6543")
            .with_value("ssl", "true")
            .with_value("unknown", "dropped");

        let config = ValidatedConfig::new(&schema(), &raw).unwrap();
        assert_eq!(config.integration(), "postgres");
        assert_eq!(config.str("host"), Some("localhost"));
        assert_eq!(config.u64("port"), Some(6543));
        assert_eq!(config.bool("ssl"), Some(true));
        assert!(config.get("unknown").is_none());
        assert!(config.get("password").is_none());
    }

    #[test]
    fn test_missing_required_field() {
        let raw = DatasourceConfig::new().with_value("database", "");
        match ValidatedConfig::new(&schema(), &raw) {
            Err(DataError::ConfigValidation(msg)) => assert!(msg.contains("database")),
            other => panic!("Expected ConfigValidation, got: {:?}", other),
        }
    }

    #[test]
    fn test_mistyped_field() {
        let raw = DatasourceConfig::new()
            .with_value("database", "app")
            .with_value("port", "not-a-port");
        assert!(matches!(
            ValidatedConfig::new(&schema(), &raw),
            Err(DataError::ConfigValidation(_))
        ));
    }

    #[test]
    fn test_debug_redacts_passwords() {
        let raw = DatasourceConfig::from_json(json!({
            "database": "app",
            "password": "hunter2"
        }))
        .unwrap();
        assert!(!format!("{:?}", raw).contains("hunter2"));

        let config = ValidatedConfig::new(&schema(), &raw).unwrap();
        assert_eq!(config.str("password"), Some("hunter2"));
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("***"));
    }

    #[test]
    fn test_from_json_rejects_non_objects() {
        assert!(DatasourceConfig::from_json(json!(["url"])).is_err());
    }
}
