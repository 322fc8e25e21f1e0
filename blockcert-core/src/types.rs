//! Core types used across the issuance pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// SHA-256 hash (32 bytes)
pub type Hash256 = [u8; 32];

/// Identifier of one batch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchId(pub Uuid);

impl BatchId {
    pub fn new() -> Self {
        BatchId(Uuid::new_v4())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Certificate identifier (`urn:uuid:...`), stable across re-runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CertificateId(pub String);

impl fmt::Display for CertificateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which Bitcoin network the anchors live on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainKind {
    Bitcoin,
    #[default]
    Testnet,
    Signet,
    Regtest,
}

impl ChainKind {
    pub fn network(&self) -> bitcoin::Network {
        match self {
            ChainKind::Bitcoin => bitcoin::Network::Bitcoin,
            ChainKind::Testnet => bitcoin::Network::Testnet,
            ChainKind::Signet => bitcoin::Network::Signet,
            ChainKind::Regtest => bitcoin::Network::Regtest,
        }
    }

    /// Chain label written into certificate anchors.
    pub fn anchor_label(&self) -> &'static str {
        match self {
            ChainKind::Bitcoin => "bitcoinMainnet",
            ChainKind::Testnet => "bitcoinTestnet",
            ChainKind::Signet => "bitcoinSignet",
            ChainKind::Regtest => "bitcoinRegtest",
        }
    }
}

impl fmt::Display for ChainKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.anchor_label())
    }
}

/// Position of a sibling hash relative to the running hash in a proof step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

/// Where the issuer's funds stand when a batch fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FundsStatus {
    /// Nothing was broadcast.
    Untouched,
    /// A transaction was sent but its fate is unknown or it was refused.
    Attempted,
    /// The anchor was accepted; its fee is gone.
    Spent,
}

impl fmt::Display for FundsStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FundsStatus::Untouched => "no funds spent",
            FundsStatus::Attempted => "broadcast attempted",
            FundsStatus::Spent => "funds spent",
        };
        f.write_str(label)
    }
}

/// Serde support for hashes as lowercase hex strings.
pub(crate) mod hex_hash {
    use super::Hash256;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(hash: &Hash256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(hash))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Hash256, D::Error> {
        let s = String::deserialize(deserializer)?;
        super::parse_hash(&s).ok_or_else(|| serde::de::Error::custom("Invalid 32-byte hex hash"))
    }
}

/// Serde support for byte strings as hex.
pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

/// Parse a 64-character hex string into a hash.
pub fn parse_hash(s: &str) -> Option<Hash256> {
    let bytes = hex::decode(s).ok()?;
    bytes.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_kind_labels() {
        assert_eq!(ChainKind::Bitcoin.to_string(), "bitcoinMainnet");
        assert_eq!(ChainKind::Testnet.network(), bitcoin::Network::Testnet);
        assert_eq!(ChainKind::default(), ChainKind::Testnet);
    }

    #[test]
    fn test_parse_hash() {
        let hash = [0xabu8; 32];
        assert_eq!(parse_hash(&hex::encode(hash)), Some(hash));
        assert_eq!(parse_hash("abcd"), None);
        assert_eq!(parse_hash("zz"), None);
    }

    #[test]
    fn test_side_serde() {
        assert_eq!(serde_json::to_string(&Side::Left).unwrap(), "\"left\"");
    }
}
