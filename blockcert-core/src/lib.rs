//! # Blockcert Core
//!
//! Issues tamper-evident certificates in batches: a batch is hashed into a
//! Merkle tree, the root is anchored in one Bitcoin transaction, and every
//! certificate carries the proof needed to verify it independently.
//!
//! ## Key Features
//! - **Canonical CBOR serialization**: Deterministic, reproducible certificate hashes
//! - **Merkle commitments**: Odd nodes promoted, per-leaf inclusion proofs
//! - **OP_RETURN anchoring**: P2PKH-funded, fee-bounded, retrying broadcasts
//! - **Independent verification**: Four-way outcome with reason codes
//! - **Pluggable chain access**: Funding, broadcast and chain reads behind traits

pub mod anchor;
pub mod assembler;
pub mod chain;
pub mod config;
pub mod crypto;
pub mod embedder;
pub mod memory;
pub mod merkle;
pub mod pipeline;
pub mod roster;
pub mod serialization;
pub mod template;
pub mod types;
pub mod verifier;

pub use anchor::{AnchorError, AnchorTransaction, ChainAnchor, ConfirmationOutcome, ConfirmationWatch};
pub use assembler::{BatchContext, UnsignedCertificate};
pub use chain::{BroadcastError, Broadcaster, ChainDataSource, ChainError, ChainTransaction, FundingSource, Utxo};
pub use config::IssuerConfig;
pub use crypto::{P2pkhSigner, SigningError};
pub use embedder::BlockchainCertificate;
pub use merkle::{InclusionProof, MerkleTree, ProofStep};
pub use pipeline::{IssuanceError, IssuedBatch, Issuer, Stage};
pub use roster::RosterEntry;
pub use template::Template;
pub use types::*;
pub use verifier::{ReasonCode, VerificationResult, VerificationStatus, Verifier};

#[cfg(test)]
mod tests {
    #[test]
    fn test_version() {
        assert_eq!(env!("CARGO_PKG_VERSION"), "0.1.0");
    }
}
