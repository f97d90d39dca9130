use crate::error::{Result, SofaError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Prefix reserved for design documents.
pub const DESIGN_PREFIX: &str = "_design/";

/// `kind` value stored for design documents.
pub const KIND_DESIGN: &str = "design";

/// A document envelope: the internal fields `_id`, `_version`, `_deleted`
/// lifted out of the JSON body, plus the remaining body fields.
#[derive(Debug, Clone, Default)]
pub struct Document {
    pub id: String,
    pub version: i64,
    pub deleted: bool,
    pub kind: Option<String>,
    pub body: Map<String, Value>,
}

impl Document {
    /// Parse a raw JSON body into a document.
    pub fn parse(bytes: &[u8]) -> Result<Document> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| SofaError::BadJson(e.to_string()))?;
        Document::from_value(value)
    }

    /// Build a document from an already-parsed JSON value.
    pub fn from_value(value: Value) -> Result<Document> {
        let mut body = match value {
            Value::Object(map) => map,
            _ => {
                return Err(SofaError::BadJson(
                    "document body must be a JSON object".to_string(),
                ))
            }
        };

        let id = match body.remove("_id") {
            Some(Value::String(s)) => s,
            Some(_) => return Err(SofaError::BadJson("_id must be a string".to_string())),
            None => String::new(),
        };

        let version = match body.remove("_version") {
            Some(Value::Number(n)) => n
                .as_i64()
                .filter(|v| *v >= 0)
                .ok_or_else(|| {
                    SofaError::BadJson("_version must be a non-negative integer".to_string())
                })?,
            Some(_) => {
                return Err(SofaError::BadJson(
                    "_version must be a non-negative integer".to_string(),
                ))
            }
            None => 0,
        };

        let deleted = match body.remove("_deleted") {
            Some(Value::Bool(b)) => b,
            Some(_) => return Err(SofaError::BadJson("_deleted must be a boolean".to_string())),
            None => false,
        };

        let kind = if id.starts_with(DESIGN_PREFIX) {
            Some(KIND_DESIGN.to_string())
        } else {
            None
        };

        Ok(Document {
            id,
            version,
            deleted,
            kind,
            body,
        })
    }

    /// A metadata-only stub, used for lookups and deletes.
    pub fn from_parts(id: impl Into<String>, version: i64, deleted: bool) -> Document {
        let id = id.into();
        let kind = if id.starts_with(DESIGN_PREFIX) {
            Some(KIND_DESIGN.to_string())
        } else {
            None
        };
        Document {
            id,
            version,
            deleted,
            kind,
            body: Map::new(),
        }
    }

    pub fn is_design(&self) -> bool {
        self.id.starts_with(DESIGN_PREFIX)
    }

    /// Re-emit the canonical JSON body with the envelope fields embedded.
    pub fn to_value(&self) -> Value {
        let mut out = self.body.clone();
        if !self.id.is_empty() {
            out.insert("_id".to_string(), Value::String(self.id.clone()));
        }
        out.insert("_version".to_string(), Value::from(self.version));
        if self.deleted {
            out.insert("_deleted".to_string(), Value::Bool(true));
        }
        Value::Object(out)
    }

    pub fn to_json(&self) -> String {
        self.to_value().to_string()
    }
}

/// Validate a user-supplied document id. Empty ids are allowed (one is
/// generated); underscore-prefixed ids are reserved for design documents.
pub fn validate_doc_id(id: &str) -> Result<()> {
    let id = id.trim();
    if !id.is_empty() && !id.starts_with(DESIGN_PREFIX) && id.starts_with('_') {
        return Err(SofaError::DocInvalidId(id.to_string()));
    }
    Ok(())
}

/// One view of a design document: DDL to create the index tables, DML to
/// clear and re-materialize a change window, and named select queries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DesignDocumentView {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub setup: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delete: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub update: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub select: HashMap<String, String>,
}

/// A design document: `_design/<name>` plus its view definitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesignDocument {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_version", default)]
    pub version: i64,
    #[serde(default)]
    pub views: HashMap<String, DesignDocumentView>,
}

impl DesignDocument {
    /// Parse a design document body. Malformed bodies are rejected before
    /// any write happens.
    pub fn parse(bytes: &[u8]) -> Result<DesignDocument> {
        serde_json::from_slice(bytes)
            .map_err(|e| SofaError::InvalidDesignDocument(e.to_string()))
    }
}
