//! Recipient roster ingestion.
//!
//! Rosters are comma-delimited UTF-8 with a header row. The columns
//! `name`, `publicKey` and `identity` are required; any further columns are
//! kept per recipient so templates can reference them.

use crate::types::ChainKind;
use bitcoin::address::NetworkUnchecked;
use bitcoin::Address;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use thiserror::Error;

/// Prefix Blockcerts puts in front of recipient addresses.
pub const PUBLIC_KEY_PREFIX: &str = "ecdsa-koblitz-pubkey:";

const NAME_COLUMN: &str = "name";
const PUBLIC_KEY_COLUMN: &str = "publicKey";
const IDENTITY_COLUMN: &str = "identity";

#[derive(Debug, Error)]
pub enum RosterError {
    #[error("Malformed roster at row {row}: {reason}")]
    Malformed { row: usize, reason: String },

    #[error("Duplicate recipient public key {public_key} at row {row} (first seen at row {first_row})")]
    DuplicateRecipient {
        row: usize,
        first_row: usize,
        public_key: String,
    },
}

/// One recipient, in the order it appeared in the roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub name: String,
    pub public_key: String,
    pub identity: String,
    /// Additional per-recipient columns.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl RosterEntry {
    /// Look up a field by roster column name.
    pub fn field(&self, column: &str) -> Option<&str> {
        match column {
            NAME_COLUMN => Some(&self.name),
            PUBLIC_KEY_COLUMN => Some(&self.public_key),
            IDENTITY_COLUMN => Some(&self.identity),
            other => self.extra.get(other).map(String::as_str),
        }
    }
}

/// Parse and validate a roster from CSV text.
pub fn load(raw: &str, chain: ChainKind) -> Result<Vec<RosterEntry>, RosterError> {
    load_from_reader(raw.as_bytes(), chain)
}

/// Parse and validate a roster from any reader.
///
/// Row numbers in errors count data rows from 1; the header is row 0.
pub fn load_from_reader<R: Read>(reader: R, chain: ChainKind) -> Result<Vec<RosterEntry>, RosterError> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = rdr
        .headers()
        .map_err(|e| RosterError::Malformed {
            row: 0,
            reason: e.to_string(),
        })?
        .clone();

    let column = |name: &str| -> Result<usize, RosterError> {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| RosterError::Malformed {
                row: 0,
                reason: format!("missing required column '{name}'"),
            })
    };
    let name_idx = column(NAME_COLUMN)?;
    let key_idx = column(PUBLIC_KEY_COLUMN)?;
    let identity_idx = column(IDENTITY_COLUMN)?;

    let mut seen_keys: HashMap<String, usize> = HashMap::new();
    let mut entries = Vec::new();

    for (i, record) in rdr.records().enumerate() {
        let row = i + 1;
        let record = record.map_err(|e| RosterError::Malformed {
            row,
            reason: e.to_string(),
        })?;

        let required = |idx: usize, name: &str| -> Result<String, RosterError> {
            match record.get(idx) {
                Some(value) if !value.is_empty() => Ok(value.to_string()),
                _ => Err(RosterError::Malformed {
                    row,
                    reason: format!("empty '{name}'"),
                }),
            }
        };

        let name = required(name_idx, NAME_COLUMN)?;
        let public_key = required(key_idx, PUBLIC_KEY_COLUMN)?;
        let identity = required(identity_idx, IDENTITY_COLUMN)?;

        validate_public_key(&public_key, chain)
            .map_err(|reason| RosterError::Malformed { row, reason })?;

        if let Some(first_row) = seen_keys.insert(canonical_key(&public_key).to_string(), row) {
            return Err(RosterError::DuplicateRecipient {
                row,
                first_row,
                public_key,
            });
        }

        let extra = headers
            .iter()
            .enumerate()
            .filter(|(idx, _)| ![name_idx, key_idx, identity_idx].contains(idx))
            .filter_map(|(idx, header)| {
                record
                    .get(idx)
                    .map(|value| (header.to_string(), value.to_string()))
            })
            .collect();

        entries.push(RosterEntry {
            name,
            public_key,
            identity,
            extra,
        });
    }

    tracing::debug!(recipients = entries.len(), "Roster loaded");
    Ok(entries)
}

/// Check a recipient key against the address grammar for `chain`.
pub fn validate_public_key(public_key: &str, chain: ChainKind) -> Result<(), String> {
    let address: Address<NetworkUnchecked> = canonical_key(public_key)
        .parse()
        .map_err(|e| format!("invalid public key '{public_key}': {e}"))?;

    if !address.is_valid_for_network(chain.network()) {
        return Err(format!("public key '{public_key}' is not valid for {chain}"));
    }
    Ok(())
}

/// The address part of a key, with the optional Blockcerts prefix removed.
fn canonical_key(public_key: &str) -> &str {
    public_key.strip_prefix(PUBLIC_KEY_PREFIX).unwrap_or(public_key)
}
