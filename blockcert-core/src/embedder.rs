//! Proof embedding: attach the Merkle proof and anchor reference to a
//! certificate, producing the Blockcerts-compatible `signature` block.

use crate::anchor::{AnchorTransaction, ANCHOR_TAG};
use crate::assembler::UnsignedCertificate;
use crate::merkle::{InclusionProof, ProofStep};
use crate::serialization::EncodingError;
use crate::types::{parse_hash, Hash256, Side};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const PROOF_TYPE: &str = "MerkleProof2017";
pub const ANCHOR_TYPE: &str = "BTCOpReturn";

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("Proof target hash {actual} does not match certificate hash {expected}")]
    ProofMismatch { expected: String, actual: String },

    #[error("Proof does not lead to anchored root {0}")]
    RootMismatch(String),

    #[error("Certificate could not be hashed: {0}")]
    Encoding(#[from] EncodingError),

    #[error("Malformed certificate: {0}")]
    Malformed(String),
}

/// One proof entry: exactly one of `left` / `right` names the sibling's side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right: Option<String>,
}

impl From<&ProofStep> for ProofEntry {
    fn from(step: &ProofStep) -> Self {
        let sibling = Some(hex::encode(step.sibling));
        match step.side {
            Side::Left => ProofEntry { left: sibling, right: None },
            Side::Right => ProofEntry { left: None, right: sibling },
        }
    }
}

impl TryFrom<&ProofEntry> for ProofStep {
    type Error = String;

    fn try_from(entry: &ProofEntry) -> Result<Self, Self::Error> {
        let (side, raw) = match (&entry.left, &entry.right) {
            (Some(left), None) => (Side::Left, left),
            (None, Some(right)) => (Side::Right, right),
            _ => return Err("proof entry must name exactly one of left/right".into()),
        };
        let sibling = parse_hash(raw).ok_or_else(|| format!("invalid sibling hash {raw:?}"))?;
        Ok(ProofStep { sibling, side })
    }
}

/// Where the Merkle root was published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorReference {
    pub source_id: String,
    #[serde(rename = "type")]
    pub anchor_type: String,
    pub chain: String,
    /// Hex of the tag preceding the root in the OP_RETURN payload.
    pub prefix: String,
    pub anchored_at: DateTime<Utc>,
}

/// The `signature` block of an issued certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MerkleProof2017 {
    #[serde(rename = "type")]
    pub proof_type: Vec<String>,
    pub target_hash: String,
    pub merkle_root: String,
    pub proof: Vec<ProofEntry>,
    pub anchors: Vec<AnchorReference>,
}

impl MerkleProof2017 {
    pub fn target_hash(&self) -> Result<Hash256, String> {
        parse_hash(&self.target_hash).ok_or_else(|| format!("invalid targetHash {:?}", self.target_hash))
    }

    pub fn merkle_root(&self) -> Result<Hash256, String> {
        parse_hash(&self.merkle_root).ok_or_else(|| format!("invalid merkleRoot {:?}", self.merkle_root))
    }

    pub fn steps(&self) -> Result<Vec<ProofStep>, String> {
        self.proof.iter().map(ProofStep::try_from).collect()
    }
}

/// An anchored certificate, ready for distribution to its recipient.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockchainCertificate {
    /// Certificate fields, without `signature`.
    pub document: Map<String, Value>,
    pub signature: MerkleProof2017,
}

impl BlockchainCertificate {
    pub fn id(&self) -> Option<&str> {
        self.document.get("id").and_then(Value::as_str)
    }

    /// The certificate as one JSON object with `signature` alongside its fields.
    pub fn to_value(&self) -> Result<Value, EmbedError> {
        let mut object = self.document.clone();
        let signature =
            serde_json::to_value(&self.signature).map_err(|e| EmbedError::Malformed(e.to_string()))?;
        object.insert("signature".into(), signature);
        Ok(Value::Object(object))
    }

    pub fn to_json(&self) -> Result<String, EmbedError> {
        serde_json::to_string_pretty(&self.to_value()?).map_err(|e| EmbedError::Malformed(e.to_string()))
    }

    pub fn from_value(value: Value) -> Result<Self, EmbedError> {
        let Value::Object(mut document) = value else {
            return Err(EmbedError::Malformed("certificate must be a JSON object".into()));
        };
        let signature = document
            .remove("signature")
            .ok_or_else(|| EmbedError::Malformed("missing signature block".into()))?;
        let signature: MerkleProof2017 =
            serde_json::from_value(signature).map_err(|e| EmbedError::Malformed(format!("signature: {e}")))?;
        Ok(Self { document, signature })
    }

    pub fn from_json(raw: &str) -> Result<Self, EmbedError> {
        let value: Value = serde_json::from_str(raw).map_err(|e| EmbedError::Malformed(e.to_string()))?;
        Self::from_value(value)
    }
}

/// Attach `proof` and `anchor` to `certificate`.
pub fn embed(
    certificate: &UnsignedCertificate,
    proof: &InclusionProof,
    anchor: &AnchorTransaction,
) -> Result<BlockchainCertificate, EmbedError> {
    let leaf = certificate.leaf_hash()?;
    if leaf != proof.target_hash {
        return Err(EmbedError::ProofMismatch {
            expected: hex::encode(leaf),
            actual: hex::encode(proof.target_hash),
        });
    }
    if !proof.verify(&anchor.anchored_root) {
        return Err(EmbedError::RootMismatch(hex::encode(anchor.anchored_root)));
    }

    let document = match &certificate.document {
        Value::Object(fields) => fields.clone(),
        _ => return Err(EmbedError::Malformed("certificate must be a JSON object".into())),
    };

    Ok(BlockchainCertificate {
        document,
        signature: MerkleProof2017 {
            proof_type: vec![PROOF_TYPE.to_string(), "Extension".to_string()],
            target_hash: hex::encode(leaf),
            merkle_root: hex::encode(anchor.anchored_root),
            proof: proof.steps.iter().map(ProofEntry::from).collect(),
            anchors: vec![AnchorReference {
                source_id: anchor.txid.clone(),
                anchor_type: ANCHOR_TYPE.to_string(),
                chain: anchor.chain.anchor_label().to_string(),
                prefix: hex::encode(ANCHOR_TAG),
                anchored_at: anchor.broadcast_timestamp,
            }],
        },
    })
}
