//! Collaborator interfaces to the blockchain and the issuer's wallet.
//!
//! The core never holds or logs key material: funding and signing go
//! through [`FundingSource`], relay through [`Broadcaster`], and reads of
//! public chain data through [`ChainDataSource`].

use crate::crypto::SigningError;
use crate::types::hex_bytes;
use async_trait::async_trait;
use bitcoin::script::Instruction;
use bitcoin::{OutPoint, ScriptBuf, Transaction};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

/// A spendable output controlled by the issuer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub value_sats: u64,
}

#[derive(Debug, Error)]
pub enum FundingError {
    #[error("Insufficient funds: required {required} sats, available {available} sats")]
    Insufficient { required: u64, available: u64 },

    #[error("Funding source unavailable: {0}")]
    Unavailable(String),
}

/// Pick outputs largest first until `amount_sats` is covered.
///
/// Fewer inputs keep the anchor transaction small.
pub fn select_largest_first(mut candidates: Vec<Utxo>, amount_sats: u64) -> Result<Vec<Utxo>, FundingError> {
    candidates.sort_by(|a, b| b.value_sats.cmp(&a.value_sats).then(a.outpoint.cmp(&b.outpoint)));

    let mut selected = Vec::new();
    let mut total = 0u64;
    for utxo in candidates {
        if total >= amount_sats && !selected.is_empty() {
            break;
        }
        total += utxo.value_sats;
        selected.push(utxo);
    }

    if total < amount_sats || selected.is_empty() {
        return Err(FundingError::Insufficient {
            required: amount_sats,
            available: total,
        });
    }
    Ok(selected)
}

/// Issuer wallet: selects inputs and signs, never exposes keys.
#[async_trait]
pub trait FundingSource: Send + Sync {
    /// Unspent inputs worth at least `amount_sats` in total.
    async fn funding_inputs_for(&self, amount_sats: u64) -> Result<Vec<Utxo>, FundingError>;

    /// Script change is paid back to.
    fn change_script(&self) -> ScriptBuf;

    /// Sign every input of `tx`; `inputs` are the outputs being spent, in input order.
    async fn sign(&self, tx: Transaction, inputs: &[Utxo]) -> Result<Transaction, SigningError>;

    /// Record that `outpoints` were consumed by an accepted broadcast.
    async fn mark_spent(&self, outpoints: &[OutPoint]);

    /// Held from input selection through `mark_spent`.
    ///
    /// Must return the same lock on every call, so every anchor spending
    /// from this source is serialized.
    fn funding_lock(&self) -> Arc<Mutex<()>>;
}

#[derive(Debug, Error)]
pub enum BroadcastError {
    /// The network refused the transaction (fee too low, inputs spent, ...).
    #[error("Transaction rejected: {0}")]
    Rejected(String),

    /// Transmission failed; the same bytes may be sent again.
    #[error("Transient broadcast failure: {0}")]
    Transient(String),
}

/// Transaction relay and fee market access.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Current fee rate estimate in sat/vB.
    async fn fee_rate(&self) -> Result<f64, ChainError>;

    /// Submit a signed transaction; returns the txid acknowledged by the network.
    async fn broadcast(&self, raw_tx: &[u8]) -> Result<String, BroadcastError>;
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("Chain data unavailable: {0}")]
    Unavailable(String),

    #[error("Malformed chain response: {0}")]
    Malformed(String),
}

/// What a verifier needs to know about an anchoring transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTransaction {
    pub txid: String,
    pub confirmed: bool,
    pub block_height: Option<u64>,
    /// Data carried by the first OP_RETURN output (empty if none).
    #[serde(with = "hex_bytes")]
    pub embedded_data: Vec<u8>,
}

/// Read access to public chain data.
#[async_trait]
pub trait ChainDataSource: Send + Sync {
    /// `Ok(None)` when the chain does not know the transaction.
    async fn get_transaction(&self, txid: &str) -> Result<Option<ChainTransaction>, ChainError>;

    /// 0 for unknown or unconfirmed transactions.
    async fn get_confirmation_count(&self, txid: &str) -> Result<u64, ChainError>;
}

/// Data pushed by the first OP_RETURN output of `tx`.
pub fn extract_op_return(tx: &Transaction) -> Option<Vec<u8>> {
    tx.output
        .iter()
        .find(|out| out.script_pubkey.is_op_return())
        .map(|out| {
            out.script_pubkey
                .instructions()
                .skip(1)
                .filter_map(|ins| match ins {
                    Ok(Instruction::PushBytes(bytes)) => Some(bytes.as_bytes().to_vec()),
                    _ => None,
                })
                .flatten()
                .collect()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, TxOut};

    #[test]
    fn test_extract_op_return() {
        let payload = b"BCRT-payload".to_vec();
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![],
            output: vec![
                TxOut {
                    value: Amount::from_sat(1000),
                    script_pubkey: ScriptBuf::new(),
                },
                TxOut {
                    value: Amount::ZERO,
                    script_pubkey: ScriptBuf::new_op_return(
                        bitcoin::script::PushBytesBuf::try_from(payload.clone()).unwrap(),
                    ),
                },
            ],
        };
        assert_eq!(extract_op_return(&tx), Some(payload));
    }

    #[test]
    fn test_select_largest_first() {
        use bitcoin::hashes::Hash;
        let utxo = |vout, value_sats| Utxo {
            outpoint: OutPoint::new(bitcoin::Txid::all_zeros(), vout),
            value_sats,
        };
        let pool = vec![utxo(0, 1_000), utxo(1, 50_000), utxo(2, 5_000)];

        let picked = select_largest_first(pool.clone(), 2_000).unwrap();
        assert_eq!(picked, vec![utxo(1, 50_000)]);

        let picked = select_largest_first(pool.clone(), 54_000).unwrap();
        assert_eq!(picked.len(), 2);

        assert!(matches!(
            select_largest_first(pool, 100_000),
            Err(FundingError::Insufficient { available: 56_000, .. })
        ));
        assert!(select_largest_first(vec![], 0).is_err());
    }

    #[test]
    fn test_no_op_return() {
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![],
            output: vec![],
        };
        assert_eq!(extract_op_return(&tx), None);
    }
}
