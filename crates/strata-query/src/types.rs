use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

/// A freeform JSON object, the normalized record shape of every backend
pub type Document = serde_json::Map<String, Value>;

/// Primitive types for configuration and query fields
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldType {
    /// Single-line text
    String,
    /// Integer or floating point number
    Number,
    /// true/false
    Boolean,
    /// Secret text, never echoed back
    Password,
    /// Multi-line text (SQL statements, templates)
    Longform,
}

impl FieldType {
    /// Strict type check used for query payload fields
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldType::String | FieldType::Password | FieldType::Longform => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
        }
    }

    /// Lenient conversion used for configuration values, which usually arrive
    /// as strings from an environment or secret store.
    pub fn coerce(&self, value: &Value) -> Option<Value> {
        if self.accepts(value) {
            return Some(value.clone());
        }

        match (self, value) {
            (FieldType::Number, Value::String(s)) => {
                let s = s.trim();
                if let Ok(n) = s.parse::<i64>() {
                    Some(Value::from(n))
                } else {
                    s.parse::<f64>()
                        .ok()
                        .and_then(serde_json::Number::from_f64)
                        .map(Value::Number)
                }
            }
            (FieldType::Boolean, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str()
            {
                "true" => Some(Value::Bool(true)),
                "false" => Some(Value::Bool(false)),
                _ => None,
            },
            (FieldType::String | FieldType::Password | FieldType::Longform, Value::Number(n)) => {
                Some(Value::String(n.to_string()))
            }
            _ => None,
        }
    }

    /// Whether values of this type must be redacted
    pub fn is_secret(&self) -> bool {
        matches!(self, FieldType::Password)
    }

    /// JSON Schema `type` keyword for this field type
    pub fn json_schema_type(&self) -> &'static str {
        match self {
            FieldType::String | FieldType::Password | FieldType::Longform => "string",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::String => write!(f, "STRING"),
            FieldType::Number => write!(f, "NUMBER"),
            FieldType::Boolean => write!(f, "BOOLEAN"),
            FieldType::Password => write!(f, "PASSWORD"),
            FieldType::Longform => write!(f, "LONGFORM"),
        }
    }
}

/// Type/required/default metadata for one configuration or payload field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl FieldDescriptor {
    pub fn required(field_type: FieldType) -> Self {
        Self {
            field_type,
            required: true,
            default: None,
            description: None,
        }
    }

    pub fn optional(field_type: FieldType) -> Self {
        Self {
            field_type,
            required: false,
            default: None,
            description: None,
        }
    }

    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Whether an operation takes a freeform document or a fixed set of named fields
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PayloadKind {
    Structured,
    Document,
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadKind::Structured => write!(f, "STRUCTURED"),
            PayloadKind::Document => write!(f, "DOCUMENT"),
        }
    }
}

/// Operation key of schemas and handler tables
#[derive(Debug, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
    /// Backend-specific operation outside the CRUD set
    Custom(String),
}

impl Operation {
    pub fn parse(name: &str) -> Self {
        match name {
            "create" => Operation::Create,
            "read" => Operation::Read,
            "update" => Operation::Update,
            "delete" => Operation::Delete,
            other => Operation::Custom(other.to_string()),
        }
    }

    /// Operation by name; CRUD names map to their dedicated variants
    pub fn custom(name: impl AsRef<str>) -> Self {
        Operation::parse(name.as_ref())
    }

    /// Fold a `Custom` holding a CRUD name into its dedicated variant
    pub fn canonical(self) -> Self {
        match self {
            Operation::Custom(name) => Operation::parse(&name),
            other => other,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Operation::Create => "create",
            Operation::Read => "read",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Custom(name) => name.as_str(),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for Operation {
    fn from(name: &str) -> Self {
        Operation::parse(name)
    }
}

impl Serialize for Operation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Operation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Operation::parse(&name))
    }
}

/// Query payload: a freeform document or a mapping of named fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Payload {
    Document(Document),
    Fields(Document),
}

impl Payload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::Document(_) => PayloadKind::Document,
            Payload::Fields(_) => PayloadKind::Structured,
        }
    }

    pub fn as_document(&self) -> &Document {
        match self {
            Payload::Document(doc) | Payload::Fields(doc) => doc,
        }
    }

    pub fn into_document(self) -> Document {
        match self {
            Payload::Document(doc) | Payload::Fields(doc) => doc,
        }
    }

    /// Named field (or top-level document key)
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.as_document().get(name)
    }

    /// String field, if present and a string
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(Value::as_str)
    }
}

/// A request against one integration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub operation: String,
    pub payload: Payload,
}

impl QueryRequest {
    pub fn new(operation: impl Into<String>, payload: Payload) -> Self {
        Self {
            operation: operation.into(),
            payload,
        }
    }

    pub fn document(operation: impl Into<String>, document: Document) -> Self {
        Self::new(operation, Payload::Document(document))
    }

    pub fn fields(operation: impl Into<String>, fields: Document) -> Self {
        Self::new(operation, Payload::Fields(fields))
    }
}

/// Normalized result of a query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum QueryResult {
    /// A single record, e.g. the stored document after a create
    Record(Document),
    /// Records of a read, in backend order
    Records(Vec<Document>),
    /// Operation-specific acknowledgment (ids, revisions, affected counts)
    Ack(Document),
}

impl QueryResult {
    /// Number of records carried (acknowledgments count as one)
    pub fn len(&self) -> usize {
        match self {
            QueryResult::Records(rows) => rows.len(),
            QueryResult::Record(_) | QueryResult::Ack(_) => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn records(&self) -> Option<&[Document]> {
        match self {
            QueryResult::Records(rows) => Some(rows),
            _ => None,
        }
    }

    pub fn record(&self) -> Option<&Document> {
        match self {
            QueryResult::Record(doc) | QueryResult::Ack(doc) => Some(doc),
            QueryResult::Records(_) => None,
        }
    }
}

/// Null or empty-string values count as absent
pub(crate) fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Build a [`Document`] from a `serde_json::json!` object literal.
/// Non-object values yield an empty document.
pub fn document(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}
