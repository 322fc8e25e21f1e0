//! Certificate templates.
//!
//! A template is a schema-versioned JSON document whose string values may
//! contain `{{field}}` placeholders. Fields resolve against the roster entry
//! (`name`, `publicKey`, `identity`, extra columns) and the batch context
//! (`issuedOn`, `certificateId`).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use thiserror::Error;

/// Template schema versions this issuer understands.
pub const SUPPORTED_SCHEMA_VERSIONS: &[&str] = &["2.0", "2.1"];

/// Top-level fields the assembler writes; templates may not set them.
pub const RESERVED_FIELDS: &[&str] = &["id", "issuedOn", "recipient", "recipientProfile", "signature"];

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("Template is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Unsupported template schema version: {0}")]
    UnsupportedSchema(String),

    #[error("Invalid template document: {0}")]
    InvalidDocument(String),

    #[error("Template sets reserved field: {0}")]
    ReservedField(String),
}

/// A loaded certificate template. Immutable for the lifetime of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub schema_version: String,
    pub document: Value,
}

impl Template {
    /// Parse and validate a template from JSON text.
    pub fn from_json(raw: &str) -> Result<Self, TemplateError> {
        let template: Template = serde_json::from_str(raw)?;
        template.validate()?;
        Ok(template)
    }

    fn validate(&self) -> Result<(), TemplateError> {
        if !SUPPORTED_SCHEMA_VERSIONS.contains(&self.schema_version.as_str()) {
            return Err(TemplateError::UnsupportedSchema(self.schema_version.clone()));
        }

        let document = self
            .document
            .as_object()
            .ok_or_else(|| TemplateError::InvalidDocument("document must be an object".into()))?;

        if let Some(field) = RESERVED_FIELDS.iter().find(|f| document.contains_key(**f)) {
            return Err(TemplateError::ReservedField(field.to_string()));
        }

        match document.get("type") {
            None | Some(Value::Null) => {
                return Err(TemplateError::InvalidDocument("document type is required".into()))
            }
            Some(_) => {}
        }

        let issuer = document
            .get("badge")
            .and_then(|badge| badge.get("issuer"))
            .and_then(Value::as_object)
            .ok_or_else(|| TemplateError::InvalidDocument("badge.issuer metadata is required".into()))?;
        if !issuer.contains_key("id") {
            return Err(TemplateError::InvalidDocument("badge.issuer.id is required".into()));
        }

        // Surfaces unterminated or empty placeholders at load time.
        collect_placeholders(&self.document, &mut BTreeSet::new())
            .map_err(TemplateError::InvalidDocument)?;
        Ok(())
    }

    /// Every placeholder name referenced by the document.
    pub fn placeholders(&self) -> Result<BTreeSet<String>, TemplateError> {
        let mut names = BTreeSet::new();
        collect_placeholders(&self.document, &mut names).map_err(TemplateError::InvalidDocument)?;
        Ok(names)
    }
}

/// A piece of a template string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Segment<'a> {
    Literal(&'a str),
    Placeholder(&'a str),
}

/// Split a string into literal text and placeholders.
pub(crate) fn segments(s: &str) -> Result<Vec<Segment<'_>>, String> {
    let mut out = Vec::new();
    let mut rest = s;

    while let Some(start) = rest.find(OPEN) {
        if start > 0 {
            out.push(Segment::Literal(&rest[..start]));
        }
        let after = &rest[start + OPEN.len()..];
        let end = after
            .find(CLOSE)
            .ok_or_else(|| format!("unterminated placeholder in {s:?}"))?;
        let name = after[..end].trim();
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(format!("invalid placeholder name {:?}", &after[..end]));
        }
        out.push(Segment::Placeholder(name));
        rest = &after[end + CLOSE.len()..];
    }

    if !rest.is_empty() {
        out.push(Segment::Literal(rest));
    }
    Ok(out)
}

fn collect_placeholders(value: &Value, names: &mut BTreeSet<String>) -> Result<(), String> {
    match value {
        Value::String(s) => {
            for segment in segments(s)? {
                if let Segment::Placeholder(name) = segment {
                    names.insert(name.to_string());
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_placeholders(item, names)?;
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_placeholders(item, names)?;
            }
        }
        _ => {}
    }
    Ok(())
}
