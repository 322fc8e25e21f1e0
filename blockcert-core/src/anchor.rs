//! Chain anchoring: embed a Merkle root in an OP_RETURN output.
//!
//! Transaction structure:
//! - Inputs: issuer UTXOs chosen by the [`FundingSource`]
//! - Output 0: `OP_RETURN <"BCRT" || root>` (0 sats, unspendable)
//! - Output 1: change back to the issuer (omitted below the dust limit)
//!
//! A successful [`ChainAnchor::anchor`] means the network accepted the
//! transaction for relay. Confirmation is tracked separately with
//! [`ConfirmationWatch`].

use crate::chain::{BroadcastError, Broadcaster, ChainDataSource, FundingError, FundingSource, Utxo};
use crate::config::{AnchorConfig, ConfirmationPolicy};
use crate::crypto::SigningError;
use crate::types::{hex_bytes, hex_hash, ChainKind, FundsStatus, Hash256};
use bitcoin::absolute::LockTime;
use bitcoin::script::PushBytesBuf;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Tag in front of every anchored root, separating our anchors from other OP_RETURN data.
pub const ANCHOR_TAG: [u8; 4] = *b"BCRT";

/// Length of the OP_RETURN payload: tag + root.
pub const ANCHOR_PAYLOAD_LEN: usize = ANCHOR_TAG.len() + 32;

/// Outputs below this value are not relayed.
pub const DUST_LIMIT_SATS: u64 = 546;

// Size estimates for legacy P2PKH spends (vbytes).
const TX_OVERHEAD_VBYTES: u64 = 10;
const P2PKH_INPUT_VBYTES: u64 = 148;
const P2PKH_OUTPUT_VBYTES: u64 = 34;
// value(8) + script length(1) + OP_RETURN(1) + push opcode(1) + payload
const OP_RETURN_OUTPUT_VBYTES: u64 = 11 + ANCHOR_PAYLOAD_LEN as u64;

#[derive(Debug, Error)]
pub enum AnchorError {
    #[error("Insufficient funds: required {required} sats, available {available} sats")]
    InsufficientFunds { required: u64, available: u64 },

    #[error("Funding source failed: {0}")]
    Funding(String),

    #[error("Signing failed: {0}")]
    Signing(#[from] SigningError),

    #[error("Could not build anchor transaction: {0}")]
    Transaction(String),

    #[error("Broadcast of {txid} rejected: {reason}")]
    BroadcastRejected { txid: String, reason: String },

    #[error("Broadcast of {txid} failed after {attempts} attempts: {reason}")]
    Network {
        txid: String,
        attempts: u32,
        reason: String,
    },
}

impl AnchorError {
    /// Whether the failure happened before or after funds left local control.
    pub fn funds_status(&self) -> FundsStatus {
        match self {
            AnchorError::InsufficientFunds { .. }
            | AnchorError::Funding(_)
            | AnchorError::Signing(_)
            | AnchorError::Transaction(_) => FundsStatus::Untouched,
            AnchorError::BroadcastRejected { .. } | AnchorError::Network { .. } => FundsStatus::Attempted,
        }
    }
}

impl From<FundingError> for AnchorError {
    fn from(e: FundingError) -> Self {
        match e {
            FundingError::Insufficient { required, available } => {
                AnchorError::InsufficientFunds { required, available }
            }
            FundingError::Unavailable(reason) => AnchorError::Funding(reason),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("Anchor payload has {0} bytes, expected {ANCHOR_PAYLOAD_LEN}")]
    Length(usize),

    #[error("Anchor payload prefix {0} does not match")]
    PrefixMismatch(String),
}

/// OP_RETURN payload for `root`.
pub fn anchor_payload(root: &Hash256) -> Vec<u8> {
    let mut payload = Vec::with_capacity(ANCHOR_PAYLOAD_LEN);
    payload.extend_from_slice(&ANCHOR_TAG);
    payload.extend_from_slice(root);
    payload
}

/// Recover the root from an OP_RETURN payload, checking the tag.
pub fn parse_anchor_payload(data: &[u8]) -> Result<Hash256, PayloadError> {
    if data.len() < ANCHOR_TAG.len() || data[..ANCHOR_TAG.len()] != ANCHOR_TAG {
        let shown = &data[..data.len().min(ANCHOR_TAG.len())];
        return Err(PayloadError::PrefixMismatch(hex::encode(shown)));
    }
    data[ANCHOR_TAG.len()..]
        .try_into()
        .map_err(|_| PayloadError::Length(data.len()))
}

/// Estimated virtual size of an anchor transaction.
pub fn estimate_vsize(inputs: usize, with_change: bool) -> u64 {
    TX_OVERHEAD_VBYTES
        + P2PKH_INPUT_VBYTES * inputs as u64
        + OP_RETURN_OUTPUT_VBYTES
        + if with_change { P2PKH_OUTPUT_VBYTES } else { 0 }
}

fn fee_for(rate_sat_per_vb: f64, vsize: u64) -> u64 {
    (rate_sat_per_vb * vsize as f64).ceil() as u64
}

/// A broadcast anchoring transaction. Referenced by every certificate of its batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorTransaction {
    pub txid: String,
    pub chain: ChainKind,
    #[serde(with = "hex_bytes")]
    pub raw_transaction: Vec<u8>,
    #[serde(with = "hex_hash")]
    pub anchored_root: Hash256,
    pub broadcast_timestamp: DateTime<Utc>,
    pub fee_sats: u64,
    pub spent_outpoints: Vec<OutPoint>,
}

/// Builds, signs and broadcasts anchor transactions for one funding source.
pub struct ChainAnchor {
    chain: ChainKind,
    funding: Arc<dyn FundingSource>,
    network: Arc<dyn Broadcaster>,
    config: AnchorConfig,
    funding_lock: Arc<Mutex<()>>,
}

impl ChainAnchor {
    /// Anchors built over the same funding source share its funding lock.
    pub fn new(
        chain: ChainKind,
        funding: Arc<dyn FundingSource>,
        network: Arc<dyn Broadcaster>,
        config: AnchorConfig,
    ) -> Self {
        let funding_lock = funding.funding_lock();
        Self {
            chain,
            funding,
            network,
            config,
            funding_lock,
        }
    }

    /// Anchor `root` on chain and return once the network acknowledged it.
    pub async fn anchor(&self, root: &Hash256) -> Result<AnchorTransaction, AnchorError> {
        // Input selection through mark_spent must not interleave with another anchor.
        let _guard = self.funding_lock.lock().await;

        let rate = self.fee_rate().await;
        let inputs = self.select_inputs(rate).await?;

        let available: u64 = inputs.iter().map(|u| u.value_sats).sum();
        let fee_with_change = fee_for(rate, estimate_vsize(inputs.len(), true));
        let fee_without_change = fee_for(rate, estimate_vsize(inputs.len(), false));

        let (fee, change) = if available >= fee_with_change + DUST_LIMIT_SATS {
            (fee_with_change, Some(available - fee_with_change))
        } else if available >= fee_without_change {
            // Sub-dust remainder goes to the miner.
            (available, None)
        } else {
            return Err(AnchorError::InsufficientFunds {
                required: fee_without_change,
                available,
            });
        };

        let unsigned = build_anchor_transaction(root, &inputs, change, self.funding.change_script())?;
        let signed = self.funding.sign(unsigned, &inputs).await?;
        let txid = signed.compute_txid().to_string();
        let raw = bitcoin::consensus::serialize(&signed);

        tracing::info!(
            txid = %txid,
            fee_sats = fee,
            fee_rate = rate,
            inputs = inputs.len(),
            root = %hex::encode(root),
            "Broadcasting anchor transaction"
        );

        let acknowledged = self.broadcast_with_retry(&txid, &raw).await?;
        if acknowledged != txid {
            tracing::warn!(txid = %txid, acknowledged = %acknowledged, "Network acknowledged a different txid");
        }

        let spent: Vec<OutPoint> = inputs.iter().map(|u| u.outpoint).collect();
        self.funding.mark_spent(&spent).await;

        Ok(AnchorTransaction {
            txid,
            chain: self.chain,
            raw_transaction: raw,
            anchored_root: *root,
            broadcast_timestamp: Utc::now(),
            fee_sats: fee,
            spent_outpoints: spent,
        })
    }

    /// Ask for inputs until the selection covers the fee for its own size.
    ///
    /// Each extra input raises the fee, so the request grows with the
    /// selection. Stops when the source reports a shortfall.
    async fn select_inputs(&self, rate: f64) -> Result<Vec<Utxo>, AnchorError> {
        let mut input_count = 1;
        loop {
            let required = fee_for(rate, estimate_vsize(input_count, false));
            let inputs = self.funding.funding_inputs_for(required).await?;
            if inputs.is_empty() {
                return Err(AnchorError::InsufficientFunds { required, available: 0 });
            }
            if inputs.len() <= input_count {
                return Ok(inputs);
            }
            tracing::debug!(inputs = inputs.len(), required, "Selection grew, re-estimating fee");
            input_count = inputs.len();
        }
    }

    async fn fee_rate(&self) -> f64 {
        match self.network.fee_rate().await {
            Ok(rate) => self.config.fee.clamp(rate),
            Err(e) => {
                tracing::warn!(error = %e, fallback = self.config.fee.fallback_sat_per_vb, "Fee estimate unavailable");
                self.config.fee.clamp(self.config.fee.fallback_sat_per_vb)
            }
        }
    }

    /// Re-send the same signed bytes on transient failures; never re-sign.
    async fn broadcast_with_retry(&self, txid: &str, raw: &[u8]) -> Result<String, AnchorError> {
        let max_attempts = self.config.max_broadcast_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.network.broadcast(raw).await {
                Ok(acknowledged) => return Ok(acknowledged),
                Err(BroadcastError::Rejected(reason)) => {
                    tracing::error!(txid = %txid, reason = %reason, "Anchor transaction rejected");
                    return Err(AnchorError::BroadcastRejected {
                        txid: txid.to_string(),
                        reason,
                    });
                }
                Err(BroadcastError::Transient(reason)) if attempt >= max_attempts => {
                    tracing::error!(txid = %txid, attempts = attempt, reason = %reason, "Broadcast retries exhausted");
                    return Err(AnchorError::Network {
                        txid: txid.to_string(),
                        attempts: attempt,
                        reason,
                    });
                }
                Err(BroadcastError::Transient(reason)) => {
                    let delay = self.config.retry_backoff(attempt);
                    tracing::warn!(txid = %txid, attempt, reason = %reason, delay_ms = delay.as_millis() as u64, "Broadcast failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Assemble the unsigned anchor transaction.
pub fn build_anchor_transaction(
    root: &Hash256,
    inputs: &[Utxo],
    change_sats: Option<u64>,
    change_script: ScriptBuf,
) -> Result<Transaction, AnchorError> {
    let payload =
        PushBytesBuf::try_from(anchor_payload(root)).map_err(|e| AnchorError::Transaction(e.to_string()))?;

    let mut output = vec![TxOut {
        value: Amount::ZERO,
        script_pubkey: ScriptBuf::new_op_return(payload),
    }];
    if let Some(change) = change_sats {
        output.push(TxOut {
            value: Amount::from_sat(change),
            script_pubkey: change_script,
        });
    }

    Ok(Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: inputs
            .iter()
            .map(|utxo| TxIn {
                previous_output: utxo.outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::default(),
            })
            .collect(),
        output,
    })
}

/// How a confirmation watch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationOutcome {
    Confirmed { confirmations: u64 },
    TimedOut { last_seen: u64 },
    Cancelled,
}

/// Background poll for confirmations of a broadcast transaction.
///
/// Cancelling stops the polling; the transaction stays broadcast.
pub struct ConfirmationWatch {
    txid: String,
    cancel: CancellationToken,
    handle: JoinHandle<ConfirmationOutcome>,
}

impl ConfirmationWatch {
    pub fn spawn(chain: Arc<dyn ChainDataSource>, txid: String, policy: ConfirmationPolicy) -> Self {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(poll_confirmations(chain, txid.clone(), policy, cancel.clone()));
        Self { txid, cancel, handle }
    }

    pub fn txid(&self) -> &str {
        &self.txid
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(self) -> ConfirmationOutcome {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(txid = %self.txid, error = %e, "Confirmation watch task ended abnormally");
                ConfirmationOutcome::Cancelled
            }
        }
    }
}

async fn poll_confirmations(
    chain: Arc<dyn ChainDataSource>,
    txid: String,
    policy: ConfirmationPolicy,
    cancel: CancellationToken,
) -> ConfirmationOutcome {
    let deadline = tokio::time::Instant::now() + policy.timeout();
    let mut last_seen = 0;

    loop {
        match chain.get_confirmation_count(&txid).await {
            Ok(count) => {
                last_seen = count;
                if count >= policy.required_confirmations {
                    tracing::info!(txid = %txid, confirmations = count, "Anchor transaction confirmed");
                    return ConfirmationOutcome::Confirmed { confirmations: count };
                }
                tracing::debug!(txid = %txid, confirmations = count, "Waiting for confirmations");
            }
            Err(e) => tracing::warn!(txid = %txid, error = %e, "Confirmation poll failed"),
        }

        let now = tokio::time::Instant::now();
        if now >= deadline {
            return ConfirmationOutcome::TimedOut { last_seen };
        }
        let wake = (now + policy.poll_interval()).min(deadline);

        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(txid = %txid, "Confirmation watch cancelled");
                return ConfirmationOutcome::Cancelled;
            }
            _ = tokio::time::sleep_until(wake) => {}
        }
    }
}
