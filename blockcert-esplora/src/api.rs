//! Esplora REST wire types and response interpretation.

use bitcoin::{OutPoint, Transaction, Txid};
use blockcert_core::chain::extract_op_return;
use blockcert_core::{BroadcastError, ChainError, Utxo};
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::HashMap;

/// `GET /tx/:txid/status`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TxStatus {
    pub confirmed: bool,
    #[serde(default)]
    pub block_height: Option<u64>,
}

/// One element of `GET /address/:address/utxo`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AddressUtxo {
    pub txid: String,
    pub vout: u32,
    pub value: u64,
    pub status: TxStatus,
}

impl AddressUtxo {
    pub fn to_utxo(&self) -> Result<Utxo, ChainError> {
        let txid: Txid = self
            .txid
            .parse()
            .map_err(|e| ChainError::Malformed(format!("utxo txid {:?}: {e}", self.txid)))?;
        Ok(Utxo {
            outpoint: OutPoint::new(txid, self.vout),
            value_sats: self.value,
        })
    }
}

/// Pick the estimate for `target_blocks` from `GET /fee-estimates`.
///
/// Falls back to the nearest slower target, then to the fastest one listed.
pub fn select_fee_rate(estimates: &HashMap<String, f64>, target_blocks: u16) -> Option<f64> {
    let mut parsed: Vec<(u16, f64)> = estimates
        .iter()
        .filter_map(|(target, rate)| Some((target.parse::<u16>().ok()?, *rate)))
        .filter(|(_, rate)| rate.is_finite() && *rate > 0.0)
        .collect();
    parsed.sort_by_key(|(target, _)| *target);

    parsed
        .iter()
        .find(|(target, _)| *target >= target_blocks)
        .or_else(|| parsed.last())
        .map(|(_, rate)| *rate)
}

/// Confirmation depth of a transaction given the chain tip.
pub fn confirmations(status: &TxStatus, tip_height: u64) -> u64 {
    match (status.confirmed, status.block_height) {
        (true, Some(height)) if tip_height >= height => tip_height - height + 1,
        (true, _) => 1,
        (false, _) => 0,
    }
}

/// Map a failed `POST /tx` to a retry decision.
///
/// Client errors mean the node refused the transaction; server errors and
/// rate limiting are worth another try with the same bytes.
pub fn classify_broadcast_failure(status: StatusCode, body: &str) -> BroadcastError {
    let reason = format!("{status}: {}", body.trim());
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::REQUEST_TIMEOUT {
        BroadcastError::Transient(reason)
    } else {
        BroadcastError::Rejected(reason)
    }
}

// Node responses for a transaction it already holds, e.g. when a retry
// follows a lost acknowledgement.
const ALREADY_KNOWN_MARKERS: &[&str] = &[
    "txn-already-in-mempool",
    "txn-already-known",
    "transaction already in block chain",
];

/// Whether a failed `POST /tx` means the transaction is already relayed or mined.
pub fn is_already_known(body: &str) -> bool {
    let body = body.to_ascii_lowercase();
    ALREADY_KNOWN_MARKERS.iter().any(|marker| body.contains(marker))
}

/// Txid of a serialized transaction.
pub fn txid_of(raw_tx: &[u8]) -> Result<String, BroadcastError> {
    let tx: Transaction = bitcoin::consensus::deserialize(raw_tx)
        .map_err(|e| BroadcastError::Rejected(format!("transaction encoding: {e}")))?;
    Ok(tx.compute_txid().to_string())
}

/// Interpret the response to `POST /tx` for `raw_tx`.
///
/// A transaction the node already holds counts as accepted.
pub fn broadcast_outcome(status: StatusCode, body: &str, raw_tx: &[u8]) -> Result<String, BroadcastError> {
    if status.is_success() {
        Ok(body.trim().to_string())
    } else if is_already_known(body) {
        txid_of(raw_tx)
    } else {
        Err(classify_broadcast_failure(status, body))
    }
}

/// `GET /blocks/tip/height`
pub fn parse_height(body: &str) -> Result<u64, ChainError> {
    body.trim()
        .parse()
        .map_err(|e| ChainError::Malformed(format!("tip height {body:?}: {e}")))
}

/// OP_RETURN data carried by a transaction from `GET /tx/:txid/hex`.
pub fn embedded_data(raw_hex: &str) -> Result<Vec<u8>, ChainError> {
    let bytes = hex::decode(raw_hex.trim()).map_err(|e| ChainError::Malformed(format!("transaction hex: {e}")))?;
    let tx: Transaction = bitcoin::consensus::deserialize(&bytes)
        .map_err(|e| ChainError::Malformed(format!("transaction encoding: {e}")))?;
    Ok(extract_op_return(&tx).unwrap_or_default())
}
