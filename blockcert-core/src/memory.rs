//! In-process chain and wallet.
//!
//! Used by the test suite and the demo to run full issue/verify cycles
//! without a node. The chain enforces the rules the anchor depends on:
//! inputs must be unspent and the fee rate must meet the relay minimum.

use crate::chain::{
    extract_op_return, select_largest_first, BroadcastError, Broadcaster, ChainDataSource, ChainError,
    ChainTransaction, FundingError, FundingSource, Utxo,
};
use crate::crypto::{sha256, P2pkhSigner, SigningError};
use crate::types::ChainKind;
use async_trait::async_trait;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::SecretKey;
use bitcoin::{Address, OutPoint, ScriptBuf, Transaction, Txid};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

struct StoredTransaction {
    tx: Transaction,
    confirmations: u64,
    block_height: Option<u64>,
}

struct ChainState {
    utxos: HashMap<OutPoint, (ScriptBuf, u64)>,
    transactions: HashMap<String, StoredTransaction>,
    height: u64,
    fee_rate: f64,
    min_relay_fee_rate: f64,
    reachable: bool,
    failing_broadcasts: u32,
    broadcast_attempts: u32,
    funded: u64,
}

/// A single-node chain held in memory.
pub struct InMemoryChain {
    kind: ChainKind,
    state: Mutex<ChainState>,
}

impl InMemoryChain {
    pub fn new(kind: ChainKind) -> Self {
        Self {
            kind,
            state: Mutex::new(ChainState {
                utxos: HashMap::new(),
                transactions: HashMap::new(),
                height: 0,
                fee_rate: 10.0,
                min_relay_fee_rate: 1.0,
                reachable: true,
                failing_broadcasts: 0,
                broadcast_attempts: 0,
                funded: 0,
            }),
        }
    }

    pub fn kind(&self) -> ChainKind {
        self.kind
    }

    // A poisoned lock only means a test panicked mid-update; the state is still usable.
    fn state(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create a confirmed output of `sats` paying to `script`.
    pub fn fund(&self, script: ScriptBuf, sats: u64) -> OutPoint {
        let mut state = self.state();
        state.funded += 1;
        let txid = Txid::from_byte_array(sha256(&state.funded.to_be_bytes()));
        let outpoint = OutPoint::new(txid, 0);
        state.utxos.insert(outpoint, (script, sats));
        outpoint
    }

    /// Unspent outputs paying to `script`.
    pub fn utxos_for(&self, script: &ScriptBuf) -> Vec<Utxo> {
        self.state()
            .utxos
            .iter()
            .filter(|(_, (owner, _))| owner == script)
            .map(|(outpoint, (_, value_sats))| Utxo {
                outpoint: *outpoint,
                value_sats: *value_sats,
            })
            .collect()
    }

    /// Confirm everything in the mempool and deepen existing confirmations.
    pub fn mine_block(&self) -> u64 {
        let mut state = self.state();
        state.height += 1;
        let height = state.height;
        for stored in state.transactions.values_mut() {
            if stored.confirmations == 0 {
                stored.block_height = Some(height);
            }
            stored.confirmations += 1;
        }
        height
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state().reachable = reachable;
    }

    /// Make the next `count` broadcasts fail transiently.
    pub fn fail_next_broadcasts(&self, count: u32) {
        self.state().failing_broadcasts = count;
    }

    pub fn set_fee_rate(&self, sat_per_vb: f64) {
        self.state().fee_rate = sat_per_vb;
    }

    pub fn set_min_relay_fee_rate(&self, sat_per_vb: f64) {
        self.state().min_relay_fee_rate = sat_per_vb;
    }

    pub fn broadcast_attempts(&self) -> u32 {
        self.state().broadcast_attempts
    }

    /// Place a transaction directly on chain, bypassing relay rules.
    pub fn insert_transaction(&self, tx: Transaction, confirmations: u64) -> String {
        let mut state = self.state();
        let txid = tx.compute_txid().to_string();
        let block_height = (confirmations > 0).then_some(state.height);
        state.transactions.insert(
            txid.clone(),
            StoredTransaction {
                tx,
                confirmations,
                block_height,
            },
        );
        txid
    }

    pub fn transaction(&self, txid: &str) -> Option<Transaction> {
        self.state().transactions.get(txid).map(|stored| stored.tx.clone())
    }

    fn accept(&self, raw_tx: &[u8]) -> Result<String, BroadcastError> {
        let tx: Transaction = bitcoin::consensus::deserialize(raw_tx)
            .map_err(|e| BroadcastError::Rejected(format!("decode failed: {e}")))?;
        let txid = tx.compute_txid().to_string();

        let mut state = self.state();
        if state.transactions.contains_key(&txid) {
            return Ok(txid);
        }

        let mut input_value = 0u64;
        for input in &tx.input {
            match state.utxos.get(&input.previous_output) {
                Some((_, value)) => input_value += value,
                None => {
                    return Err(BroadcastError::Rejected(format!(
                        "missing or spent input {}",
                        input.previous_output
                    )))
                }
            }
        }

        let output_value: u64 = tx.output.iter().map(|out| out.value.to_sat()).sum();
        let fee = input_value
            .checked_sub(output_value)
            .ok_or_else(|| BroadcastError::Rejected("outputs exceed inputs".into()))?;
        let rate = fee as f64 / tx.vsize() as f64;
        if rate < state.min_relay_fee_rate {
            return Err(BroadcastError::Rejected(format!(
                "min relay fee not met: {rate:.2} < {:.2} sat/vB",
                state.min_relay_fee_rate
            )));
        }

        for input in &tx.input {
            state.utxos.remove(&input.previous_output);
        }
        let spent_txid = tx.compute_txid();
        for (vout, out) in tx.output.iter().enumerate() {
            if !out.script_pubkey.is_op_return() {
                state.utxos.insert(
                    OutPoint::new(spent_txid, vout as u32),
                    (out.script_pubkey.clone(), out.value.to_sat()),
                );
            }
        }
        state.transactions.insert(
            txid.clone(),
            StoredTransaction {
                tx,
                confirmations: 0,
                block_height: None,
            },
        );
        Ok(txid)
    }
}

#[async_trait]
impl Broadcaster for InMemoryChain {
    async fn fee_rate(&self) -> Result<f64, ChainError> {
        let state = self.state();
        if !state.reachable {
            return Err(ChainError::Unavailable("in-memory chain offline".into()));
        }
        Ok(state.fee_rate)
    }

    async fn broadcast(&self, raw_tx: &[u8]) -> Result<String, BroadcastError> {
        {
            let mut state = self.state();
            state.broadcast_attempts += 1;
            if !state.reachable {
                return Err(BroadcastError::Transient("in-memory chain offline".into()));
            }
            if state.failing_broadcasts > 0 {
                state.failing_broadcasts -= 1;
                return Err(BroadcastError::Transient("connection reset".into()));
            }
        }
        self.accept(raw_tx)
    }
}

#[async_trait]
impl ChainDataSource for InMemoryChain {
    async fn get_transaction(&self, txid: &str) -> Result<Option<ChainTransaction>, ChainError> {
        let state = self.state();
        if !state.reachable {
            return Err(ChainError::Unavailable("in-memory chain offline".into()));
        }
        Ok(state.transactions.get(txid).map(|stored| ChainTransaction {
            txid: txid.to_string(),
            confirmed: stored.confirmations > 0,
            block_height: stored.block_height,
            embedded_data: extract_op_return(&stored.tx).unwrap_or_default(),
        }))
    }

    async fn get_confirmation_count(&self, txid: &str) -> Result<u64, ChainError> {
        let state = self.state();
        if !state.reachable {
            return Err(ChainError::Unavailable("in-memory chain offline".into()));
        }
        Ok(state
            .transactions
            .get(txid)
            .map(|stored| stored.confirmations)
            .unwrap_or(0))
    }
}

/// Wallet over [`InMemoryChain`] with one P2PKH key.
pub struct InMemoryWallet {
    signer: P2pkhSigner,
    chain: Arc<InMemoryChain>,
    spent: Mutex<Vec<OutPoint>>,
    fail_signing: AtomicBool,
    funding_lock: Arc<tokio::sync::Mutex<()>>,
}

impl InMemoryWallet {
    pub fn new(secret_key: SecretKey, chain: Arc<InMemoryChain>) -> Self {
        let signer = P2pkhSigner::new(secret_key, chain.kind().network());
        Self {
            signer,
            chain,
            spent: Mutex::new(Vec::new()),
            fail_signing: AtomicBool::new(false),
            funding_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn address(&self) -> &Address {
        self.signer.address()
    }

    /// Outpoints reported through [`FundingSource::mark_spent`], in order.
    pub fn spent_outpoints(&self) -> Vec<OutPoint> {
        self.spent().clone()
    }

    fn spent(&self) -> MutexGuard<'_, Vec<OutPoint>> {
        self.spent.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_fail_signing(&self, fail: bool) {
        self.fail_signing.store(fail, Ordering::SeqCst);
    }

    pub fn balance(&self) -> u64 {
        self.available().iter().map(|u| u.value_sats).sum()
    }

    fn available(&self) -> Vec<Utxo> {
        let spent = self.spent_outpoints();
        self.chain
            .utxos_for(&self.signer.script_pubkey())
            .into_iter()
            .filter(|u| !spent.contains(&u.outpoint))
            .collect()
    }
}

#[async_trait]
impl FundingSource for InMemoryWallet {
    async fn funding_inputs_for(&self, amount_sats: u64) -> Result<Vec<Utxo>, FundingError> {
        select_largest_first(self.available(), amount_sats)
    }

    fn change_script(&self) -> ScriptBuf {
        self.signer.script_pubkey()
    }

    async fn sign(&self, tx: Transaction, inputs: &[Utxo]) -> Result<Transaction, SigningError> {
        if self.fail_signing.load(Ordering::SeqCst) {
            return Err(SigningError::Refused("signing disabled".into()));
        }
        if inputs.len() != tx.input.len() {
            return Err(SigningError::Refused(format!(
                "{} inputs described for {} transaction inputs",
                inputs.len(),
                tx.input.len()
            )));
        }
        self.signer.sign_all_inputs(tx)
    }

    async fn mark_spent(&self, outpoints: &[OutPoint]) {
        self.spent().extend_from_slice(outpoints);
    }

    fn funding_lock(&self) -> Arc<tokio::sync::Mutex<()>> {
        self.funding_lock.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, Sequence, TxIn, TxOut, Witness};

    fn wallet(chain: &Arc<InMemoryChain>) -> InMemoryWallet {
        InMemoryWallet::new(SecretKey::from_slice(&[0x33; 32]).unwrap(), chain.clone())
    }

    #[tokio::test]
    async fn test_wallet_skips_spent_outputs() {
        let chain = Arc::new(InMemoryChain::new(ChainKind::Regtest));
        let wallet = wallet(&chain);
        let big = chain.fund(wallet.change_script(), 50_000);
        chain.fund(wallet.change_script(), 5_000);
        assert_eq!(wallet.balance(), 55_000);

        wallet.mark_spent(&[big]).await;
        let inputs = wallet.funding_inputs_for(2_000).await.unwrap();
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0].value_sats, 5_000);
        assert!(wallet.funding_inputs_for(10_000).await.is_err());
    }

    #[tokio::test]
    async fn test_mark_spent_survives_poisoned_lock() {
        let chain = Arc::new(InMemoryChain::new(ChainKind::Regtest));
        let wallet = Arc::new(wallet(&chain));
        let outpoint = chain.fund(wallet.change_script(), 50_000);

        let poisoner = wallet.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.spent.lock().unwrap();
            panic!("poison the spent list");
        })
        .join();
        assert!(wallet.spent.is_poisoned());

        wallet.mark_spent(&[outpoint]).await;
        assert_eq!(wallet.spent_outpoints(), vec![outpoint]);
        assert!(wallet.funding_inputs_for(1_000).await.is_err());
    }

    #[tokio::test]
    async fn test_rejects_unknown_inputs() {
        let chain = Arc::new(InMemoryChain::new(ChainKind::Regtest));
        let wallet = wallet(&chain);
        let utxo = Utxo {
            outpoint: OutPoint::new(Txid::all_zeros(), 3),
            value_sats: 10_000,
        };
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: utxo.outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::default(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(5_000),
                script_pubkey: wallet.change_script(),
            }],
        };
        let signed = wallet.sign(tx, &[utxo]).await.unwrap();
        let err = chain
            .broadcast(&bitcoin::consensus::serialize(&signed))
            .await
            .unwrap_err();
        assert!(matches!(err, BroadcastError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_offline_chain() {
        let chain = InMemoryChain::new(ChainKind::Regtest);
        chain.set_reachable(false);
        assert!(chain.fee_rate().await.is_err());
        assert!(chain.get_transaction("00").await.is_err());
        assert!(matches!(
            chain.broadcast(&[]).await,
            Err(BroadcastError::Transient(_))
        ));
    }

    #[test]
    fn test_mine_block_confirms() {
        let chain = InMemoryChain::new(ChainKind::Regtest);
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![],
            output: vec![],
        };
        let txid = chain.insert_transaction(tx, 0);
        let height = chain.mine_block();
        assert_eq!(height, 1);
        let state = chain.state();
        assert_eq!(state.transactions[&txid].confirmations, 1);
        assert_eq!(state.transactions[&txid].block_height, Some(1));
    }
}
