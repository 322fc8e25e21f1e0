//! Independent certificate verification.
//!
//! Needs only the certificate and read access to the chain. Every check
//! maps to a status and a reason code; a failed network lookup is never
//! reported as an invalid certificate.

use crate::anchor::{parse_anchor_payload, PayloadError, ANCHOR_TAG};
use crate::chain::ChainDataSource;
use crate::embedder::{AnchorReference, BlockchainCertificate, ANCHOR_TYPE};
use crate::merkle::replay;
use crate::serialization::certificate_hash;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Valid,
    Invalid,
    /// Consistent so far, but the anchor is not (yet) confirmed on chain.
    Unconfirmed,
    /// The chain could not be consulted; retry later.
    Indeterminate,
}

impl fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            VerificationStatus::Valid => "valid",
            VerificationStatus::Invalid => "invalid",
            VerificationStatus::Unconfirmed => "unconfirmed",
            VerificationStatus::Indeterminate => "indeterminate",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    ContentAltered,
    MerkleRootMismatch,
    MalformedCertificate,
    TransactionNotFound,
    TransactionUnconfirmed,
    PrefixMismatch,
    AnchoredRootMismatch,
    ChainUnavailable,
    UnsupportedAnchor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub status: VerificationStatus,
    /// `None` only for `Valid`.
    pub reason: Option<ReasonCode>,
    pub detail: String,
    pub txid: Option<String>,
}

impl VerificationResult {
    fn valid(txid: &str) -> Self {
        Self {
            status: VerificationStatus::Valid,
            reason: None,
            detail: "certificate is anchored and confirmed".into(),
            txid: Some(txid.to_string()),
        }
    }

    fn failed(status: VerificationStatus, reason: ReasonCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            reason: Some(reason),
            detail: detail.into(),
            txid: None,
        }
    }

    fn invalid(reason: ReasonCode, detail: impl Into<String>) -> Self {
        Self::failed(VerificationStatus::Invalid, reason, detail)
    }

    fn with_txid(mut self, txid: &str) -> Self {
        self.txid = Some(txid.to_string());
        self
    }
}

/// Verify one certificate against chain data.
pub async fn verify(certificate: &BlockchainCertificate, chain: &dyn ChainDataSource) -> VerificationResult {
    let signature = &certificate.signature;

    let (claimed_leaf, claimed_root, steps) =
        match (signature.target_hash(), signature.merkle_root(), signature.steps()) {
            (Ok(leaf), Ok(root), Ok(steps)) => (leaf, root, steps),
            (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => {
                return VerificationResult::invalid(ReasonCode::MalformedCertificate, e)
            }
        };

    let anchor = match select_anchor(&signature.anchors) {
        Ok(anchor) => anchor,
        Err(result) => return result,
    };
    let txid = anchor.source_id.as_str();

    // (a) content
    let leaf = match certificate_hash(&Value::Object(certificate.document.clone())) {
        Ok(leaf) => leaf,
        Err(e) => return VerificationResult::invalid(ReasonCode::MalformedCertificate, e.to_string()),
    };
    if leaf != claimed_leaf {
        return VerificationResult::invalid(
            ReasonCode::ContentAltered,
            format!("computed hash {} differs from targetHash", hex::encode(leaf)),
        )
        .with_txid(txid);
    }

    // (b) proof
    let candidate_root = replay(leaf, &steps);
    if candidate_root != claimed_root {
        return VerificationResult::invalid(
            ReasonCode::MerkleRootMismatch,
            format!("proof leads to {} instead of merkleRoot", hex::encode(candidate_root)),
        )
        .with_txid(txid);
    }

    // (c) chain lookup
    let transaction = match chain.get_transaction(txid).await {
        Ok(Some(tx)) => tx,
        Ok(None) => {
            return VerificationResult::failed(
                VerificationStatus::Unconfirmed,
                ReasonCode::TransactionNotFound,
                "anchoring transaction not found on chain",
            )
            .with_txid(txid)
        }
        Err(e) => {
            tracing::warn!(txid = %txid, error = %e, "Chain lookup failed during verification");
            return VerificationResult::failed(
                VerificationStatus::Indeterminate,
                ReasonCode::ChainUnavailable,
                e.to_string(),
            )
            .with_txid(txid);
        }
    };

    // (d) anchored data
    let anchored_root = match parse_anchor_payload(&transaction.embedded_data) {
        Ok(root) => root,
        Err(e @ PayloadError::PrefixMismatch(_)) => {
            return VerificationResult::invalid(ReasonCode::PrefixMismatch, e.to_string()).with_txid(txid)
        }
        Err(e @ PayloadError::Length(_)) => {
            return VerificationResult::invalid(ReasonCode::AnchoredRootMismatch, e.to_string()).with_txid(txid)
        }
    };
    if anchored_root != candidate_root {
        return VerificationResult::invalid(
            ReasonCode::AnchoredRootMismatch,
            format!("transaction anchors {}", hex::encode(anchored_root)),
        )
        .with_txid(txid);
    }

    if !transaction.confirmed {
        return VerificationResult::failed(
            VerificationStatus::Unconfirmed,
            ReasonCode::TransactionUnconfirmed,
            "anchoring transaction is not yet confirmed",
        )
        .with_txid(txid);
    }

    VerificationResult::valid(txid)
}

fn select_anchor(anchors: &[AnchorReference]) -> Result<&AnchorReference, VerificationResult> {
    if anchors.is_empty() {
        return Err(VerificationResult::invalid(
            ReasonCode::MalformedCertificate,
            "signature carries no anchors",
        ));
    }
    let expected_prefix = hex::encode(ANCHOR_TAG);
    let supported: Vec<&AnchorReference> = anchors.iter().filter(|a| a.anchor_type == ANCHOR_TYPE).collect();
    if supported.is_empty() {
        return Err(VerificationResult::failed(
            VerificationStatus::Indeterminate,
            ReasonCode::UnsupportedAnchor,
            format!("no {ANCHOR_TYPE} anchor to check"),
        ));
    }
    supported
        .iter()
        .find(|a| a.prefix == expected_prefix)
        .copied()
        .ok_or_else(|| {
            VerificationResult::invalid(
                ReasonCode::PrefixMismatch,
                format!("{ANCHOR_TYPE} anchor claims prefix {}, expected {expected_prefix}", supported[0].prefix),
            )
            .with_txid(&supported[0].source_id)
        })
}

/// Stateless verifier bound to one chain data source.
#[derive(Clone)]
pub struct Verifier {
    chain: Arc<dyn ChainDataSource>,
}

impl Verifier {
    pub fn new(chain: Arc<dyn ChainDataSource>) -> Self {
        Self { chain }
    }

    pub async fn verify(&self, certificate: &BlockchainCertificate) -> VerificationResult {
        verify(certificate, self.chain.as_ref()).await
    }

    /// Verify a certificate received as JSON text.
    pub async fn verify_json(&self, raw: &str) -> VerificationResult {
        match BlockchainCertificate::from_json(raw) {
            Ok(certificate) => self.verify(&certificate).await,
            Err(e) => VerificationResult::invalid(ReasonCode::MalformedCertificate, e.to_string()),
        }
    }

    /// Verify many certificates concurrently; results keep input order.
    pub async fn verify_all(&self, certificates: &[BlockchainCertificate]) -> Vec<VerificationResult> {
        futures::future::join_all(certificates.iter().map(|c| self.verify(c))).await
    }
}
