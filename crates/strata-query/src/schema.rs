//! Immutable description of an integration: its configuration fields and the
//! operations it supports.

use crate::error::{DataError, Result};
use crate::types::{is_blank, FieldDescriptor, FieldType, Operation, Payload, PayloadKind};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Payload shape of one operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationSpec {
    pub payload_kind: PayloadKind,
    /// Field set of a STRUCTURED operation
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, FieldDescriptor>,
}

impl OperationSpec {
    /// Operation taking a freeform document
    pub fn document() -> Self {
        Self {
            payload_kind: PayloadKind::Document,
            fields: BTreeMap::new(),
        }
    }

    /// Operation taking a fixed set of named fields
    pub fn structured() -> Self {
        Self {
            payload_kind: PayloadKind::Structured,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, field: FieldDescriptor) -> Self {
        self.fields.insert(name.into(), field);
        self
    }
}

/// Schema registered once per integration kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationSchema {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub friendly_name: Option<String>,
    #[serde(default)]
    pub documentation_url: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config_fields: BTreeMap<String, FieldDescriptor>,
    #[serde(default)]
    pub operations: BTreeMap<Operation, OperationSpec>,
}

impl IntegrationSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            friendly_name: None,
            documentation_url: String::new(),
            description: String::new(),
            config_fields: BTreeMap::new(),
            operations: BTreeMap::new(),
        }
    }

    pub fn with_friendly_name(mut self, friendly_name: impl Into<String>) -> Self {
        self.friendly_name = Some(friendly_name.into());
        self
    }

    pub fn with_documentation_url(mut self, url: impl Into<String>) -> Self {
        self.documentation_url = url.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_config_field(mut self, name: impl Into<String>, field: FieldDescriptor) -> Self {
        self.config_fields.insert(name.into(), field);
        self
    }

    pub fn with_operation(mut self, operation: Operation, spec: OperationSpec) -> Self {
        self.operations.insert(operation.canonical(), spec);
        self
    }

    /// Display name, falling back to the registry name
    pub fn display_name(&self) -> &str {
        self.friendly_name.as_deref().unwrap_or(&self.name)
    }

    /// Resolve an operation name against the declared operation set
    pub fn resolve_operation(&self, name: &str) -> Result<(Operation, &OperationSpec)> {
        let operation = Operation::parse(name);
        match self.operations.get(&operation) {
            Some(spec) => Ok((operation, spec)),
            None => Err(DataError::unsupported_operation(&self.name, name)),
        }
    }

    /// Check a payload against the operation's declared kind and fields.
    ///
    /// STRUCTURED payloads must carry every required field with the declared
    /// type; optional fields that are present are type-checked too and
    /// missing ones receive their default. Unknown fields pass through.
    pub fn validate_payload(&self, operation: &Operation, payload: Payload) -> Result<Payload> {
        let spec = self
            .operations
            .get(operation)
            .ok_or_else(|| DataError::unsupported_operation(&self.name, operation.as_str()))?;

        if payload.kind() != spec.payload_kind {
            return Err(DataError::config_validation(format!(
                "{}: operation '{}' expects a {} payload, got {}",
                self.name,
                operation,
                spec.payload_kind,
                payload.kind()
            )));
        }

        let mut fields = match payload {
            Payload::Document(doc) => return Ok(Payload::Document(doc)),
            Payload::Fields(fields) => fields,
        };

        for (name, descriptor) in &spec.fields {
            match fields.get(name) {
                Some(value) if !is_blank(value) => {
                    if !descriptor.field_type.accepts(value) {
                        return Err(DataError::config_validation(format!(
                            "{}: field '{}' of operation '{}' must be {}",
                            self.name, name, operation, descriptor.field_type
                        )));
                    }
                }
                _ => {
                    if let Some(default) = &descriptor.default {
                        fields.insert(name.clone(), default.clone());
                    } else if descriptor.required {
                        return Err(DataError::config_validation(format!(
                            "{}: operation '{}' requires field '{}'",
                            self.name, operation, name
                        )));
                    }
                }
            }
        }

        Ok(Payload::Fields(fields))
    }

    /// JSON Schema for the datasource form, so a builder UI can render and
    /// pre-validate configuration input
    pub fn config_json_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();

        for (name, field) in &self.config_fields {
            let mut property = serde_json::Map::new();
            property.insert("type".to_string(), json!(field.field_type.json_schema_type()));
            if let Some(description) = &field.description {
                property.insert("description".to_string(), json!(description));
            }
            if let Some(default) = &field.default {
                property.insert("default".to_string(), default.clone());
            }
            match field.field_type {
                FieldType::Password => {
                    property.insert("writeOnly".to_string(), json!(true));
                    property.insert("x-ui-widget".to_string(), json!("password"));
                }
                FieldType::Longform => {
                    property.insert("x-ui-widget".to_string(), json!("textarea"));
                }
                _ => {}
            }
            if field.required {
                required.push(name.clone());
            }
            properties.insert(name.clone(), Value::Object(property));
        }

        json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object",
            "title": self.display_name(),
            "description": self.description,
            "required": required,
            "properties": properties,
        })
    }
}
