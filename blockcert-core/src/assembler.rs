//! Certificate assembly: template + roster entry -> unsigned certificate.

use crate::roster::{RosterEntry, PUBLIC_KEY_PREFIX};
use crate::serialization::{certificate_hash, EncodingError};
use crate::template::{segments, Segment, Template};
use crate::types::{BatchId, CertificateId, Hash256};
use chrono::{DateTime, SecondsFormat, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Namespace for deterministic certificate identifiers.
pub const CERTIFICATE_NAMESPACE: Uuid = Uuid::from_bytes([
    0x6b, 0x1f, 0x3c, 0x52, 0x8e, 0x0d, 0x4a, 0x91, 0xb7, 0x22, 0x5e, 0x43, 0x9a, 0xc4, 0x10, 0x7d,
]);

#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("Certificate {index}: template placeholder '{placeholder}' has no value")]
    MissingField { index: usize, placeholder: String },

    #[error("Certificate {index}: invalid template text: {reason}")]
    InvalidTemplate { index: usize, reason: String },

    #[error("Certificate {index}: {source}")]
    Encoding {
        index: usize,
        #[source]
        source: EncodingError,
    },
}

impl AssemblyError {
    /// Roster index of the certificate that failed.
    pub fn index(&self) -> usize {
        match self {
            AssemblyError::MissingField { index, .. }
            | AssemblyError::InvalidTemplate { index, .. }
            | AssemblyError::Encoding { index, .. } => *index,
        }
    }
}

/// Per-batch values shared by every certificate in the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchContext {
    pub batch_id: BatchId,
    /// Issuance instant; part of every certificate id and `issuedOn`.
    pub epoch: DateTime<Utc>,
}

impl BatchContext {
    pub fn new(epoch: DateTime<Utc>) -> Self {
        Self {
            batch_id: BatchId::new(),
            epoch,
        }
    }

    pub fn issued_on(&self) -> String {
        self.epoch.to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    /// Deterministic id for a recipient in this batch.
    pub fn certificate_id(&self, identity: &str) -> CertificateId {
        let name = format!("{identity}|{}", self.epoch.timestamp());
        let uuid = Uuid::new_v5(&CERTIFICATE_NAMESPACE, name.as_bytes());
        CertificateId(format!("urn:uuid:{uuid}"))
    }
}

/// A populated certificate that has not been anchored yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnsignedCertificate {
    /// Position in the roster; leaf order follows it.
    pub index: usize,
    pub id: CertificateId,
    pub document: Value,
}

impl UnsignedCertificate {
    pub fn leaf_hash(&self) -> Result<Hash256, EncodingError> {
        certificate_hash(&self.document)
    }
}

/// Merge one roster entry into the template.
pub fn assemble(
    template: &Template,
    entry: &RosterEntry,
    index: usize,
    ctx: &BatchContext,
) -> Result<UnsignedCertificate, AssemblyError> {
    let id = ctx.certificate_id(&entry.identity);
    let issued_on = ctx.issued_on();

    let lookup = |name: &str| -> Option<String> {
        match name {
            "issuedOn" => Some(issued_on.clone()),
            "certificateId" => Some(id.0.clone()),
            other => entry.field(other).map(str::to_string),
        }
    };

    let mut document = match render(&template.document, &lookup) {
        Ok(value) => value,
        Err(RenderError::Missing(placeholder)) => {
            return Err(AssemblyError::MissingField { index, placeholder })
        }
        Err(RenderError::Invalid(reason)) => {
            return Err(AssemblyError::InvalidTemplate { index, reason })
        }
    };

    let public_key = if entry.public_key.starts_with(PUBLIC_KEY_PREFIX) {
        entry.public_key.clone()
    } else {
        format!("{PUBLIC_KEY_PREFIX}{}", entry.public_key)
    };

    if let Some(fields) = document.as_object_mut() {
        fields.insert("id".into(), Value::String(id.0.clone()));
        fields.insert("issuedOn".into(), Value::String(issued_on.clone()));
        fields.insert(
            "recipient".into(),
            json!({
                "type": "email",
                "identity": entry.identity,
                "hashed": false
            }),
        );
        fields.insert(
            "recipientProfile".into(),
            json!({
                "type": ["RecipientProfile", "Extension"],
                "name": entry.name,
                "publicKey": public_key
            }),
        );
    }

    let certificate = UnsignedCertificate { index, id, document };

    // Canonical encoding problems are fatal to this certificate only.
    certificate
        .leaf_hash()
        .map_err(|source| AssemblyError::Encoding { index, source })?;

    Ok(certificate)
}

/// Outcome of assembling a whole roster.
#[derive(Debug, Default)]
pub struct AssembledBatch {
    /// Successfully assembled certificates, in roster order.
    pub certificates: Vec<UnsignedCertificate>,
    /// Failures, in roster order.
    pub rejected: Vec<AssemblyError>,
}

/// Assemble every roster entry in parallel.
pub fn assemble_batch(template: &Template, roster: &[RosterEntry], ctx: &BatchContext) -> AssembledBatch {
    // Indexed parallel collect keeps roster order regardless of completion order.
    let results: Vec<Result<UnsignedCertificate, AssemblyError>> = roster
        .par_iter()
        .enumerate()
        .map(|(index, entry)| assemble(template, entry, index, ctx))
        .collect();

    let mut batch = AssembledBatch::default();
    for result in results {
        match result {
            Ok(certificate) => batch.certificates.push(certificate),
            Err(e) => {
                tracing::warn!(batch_id = %ctx.batch_id, index = e.index(), error = %e, "Certificate assembly failed");
                batch.rejected.push(e);
            }
        }
    }

    tracing::info!(
        batch_id = %ctx.batch_id,
        assembled = batch.certificates.len(),
        rejected = batch.rejected.len(),
        "Batch assembled"
    );
    batch
}

enum RenderError {
    Missing(String),
    Invalid(String),
}

fn render(value: &Value, lookup: &dyn Fn(&str) -> Option<String>) -> Result<Value, RenderError> {
    let rendered = match value {
        Value::String(s) => {
            let mut out = String::with_capacity(s.len());
            for segment in segments(s).map_err(RenderError::Invalid)? {
                match segment {
                    Segment::Literal(text) => out.push_str(text),
                    Segment::Placeholder(name) => {
                        let value = lookup(name).ok_or_else(|| RenderError::Missing(name.to_string()))?;
                        out.push_str(&value);
                    }
                }
            }
            Value::String(out)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| render(item, lookup))
                .collect::<Result<Vec<_>, _>>()?,
        ),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, item) in map {
                out.insert(key.clone(), render(item, lookup)?);
            }
            Value::Object(out)
        }
        other => other.clone(),
    };
    Ok(rendered)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::roster::tests::test_address;
    use crate::template::tests::sample_template;
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    pub(crate) fn test_context() -> BatchContext {
        BatchContext::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap())
    }

    pub(crate) fn test_entry(n: u8) -> RosterEntry {
        let mut extra = BTreeMap::new();
        extra.insert("degree".to_string(), format!("Programme {n}"));
        RosterEntry {
            name: format!("Recipient {n}"),
            public_key: test_address(n),
            identity: format!("recipient{n}@example.org"),
            extra,
        }
    }

    #[test]
    fn test_assemble_populates_fields() {
        let cert = assemble(&sample_template(), &test_entry(1), 0, &test_context()).unwrap();
        let doc = &cert.document;

        assert_eq!(doc["issuedOn"], "2024-06-01T12:00:00Z");
        assert_eq!(doc["recipient"]["identity"], "recipient1@example.org");
        assert_eq!(
            doc["recipientProfile"]["publicKey"],
            format!("{PUBLIC_KEY_PREFIX}{}", test_address(1))
        );
        assert_eq!(
            doc["badge"]["description"],
            "Awarded to Recipient 1 for completing Programme 1"
        );
        assert!(cert.id.0.starts_with("urn:uuid:"));
        assert_eq!(doc["id"], cert.id.0.as_str());
    }

    #[test]
    fn test_missing_field() {
        let mut entry = test_entry(1);
        entry.extra.clear();
        let err = assemble(&sample_template(), &entry, 4, &test_context()).unwrap_err();
        assert!(matches!(
            err,
            AssemblyError::MissingField { index: 4, ref placeholder } if placeholder == "degree"
        ));
    }

    #[test]
    fn test_assembly_is_idempotent() {
        let roster: Vec<_> = (1..=5).map(test_entry).collect();
        let template = sample_template();

        // Different batch ids, same epoch.
        let first = assemble_batch(&template, &roster, &test_context());
        let second = assemble_batch(&template, &roster, &test_context());

        assert_eq!(first.certificates, second.certificates);
        let leaves1: Vec<_> = first.certificates.iter().map(|c| c.leaf_hash().unwrap()).collect();
        let leaves2: Vec<_> = second.certificates.iter().map(|c| c.leaf_hash().unwrap()).collect();
        assert_eq!(leaves1, leaves2);
    }

    #[test]
    fn test_epoch_changes_identifier() {
        let ctx2 = BatchContext::new(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        assert_ne!(
            test_context().certificate_id("a@example.org"),
            ctx2.certificate_id("a@example.org")
        );
    }

    #[test]
    fn test_batch_preserves_order_and_reports_failures() {
        let mut roster: Vec<_> = (1..=40).map(test_entry).collect();
        roster[7].extra.clear();
        roster[21].extra.clear();

        let batch = assemble_batch(&sample_template(), &roster, &test_context());
        assert_eq!(batch.certificates.len(), 38);
        assert_eq!(
            batch.rejected.iter().map(AssemblyError::index).collect::<Vec<_>>(),
            vec![7, 21]
        );

        let indices: Vec<_> = batch.certificates.iter().map(|c| c.index).collect();
        let mut sorted = indices.clone();
        sorted.sort_unstable();
        assert_eq!(indices, sorted);
    }
}
