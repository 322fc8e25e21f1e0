//! Single-key P2PKH wallet funded through Esplora.

use crate::EsploraClient;
use async_trait::async_trait;
use bitcoin::address::NetworkUnchecked;
use bitcoin::{Address, OutPoint, ScriptBuf, Transaction};
use blockcert_core::chain::{select_largest_first, FundingError};
use blockcert_core::{ChainKind, FundingSource, P2pkhSigner, SigningError, Utxo};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

/// Funds anchors from the UTXOs of one address.
///
/// Outputs spent by an accepted anchor are remembered locally, so they are
/// not selected again before the explorer indexes the spend.
pub struct EsploraWallet {
    client: Arc<EsploraClient>,
    signer: P2pkhSigner,
    spent: Mutex<HashSet<OutPoint>>,
    include_unconfirmed: bool,
    funding_lock: Arc<tokio::sync::Mutex<()>>,
}

impl EsploraWallet {
    /// Load the key from WIF and check it belongs to `chain`.
    pub fn from_wif(client: Arc<EsploraClient>, wif: &str, chain: ChainKind) -> Result<Self, SigningError> {
        let signer = P2pkhSigner::from_wif(wif)?;
        let address: Address<NetworkUnchecked> = signer
            .address()
            .to_string()
            .parse()
            .map_err(|e| SigningError::InvalidKey(format!("derived address: {e}")))?;
        if !address.is_valid_for_network(chain.network()) {
            return Err(SigningError::InvalidKey(format!("key is not valid for {chain}")));
        }
        tracing::info!(address = %signer.address(), chain = %chain, "Loaded issuer wallet");
        Ok(Self::new(client, signer))
    }

    pub fn new(client: Arc<EsploraClient>, signer: P2pkhSigner) -> Self {
        Self {
            client,
            signer,
            spent: Mutex::new(HashSet::new()),
            include_unconfirmed: false,
            funding_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Also spend outputs that have not confirmed yet (e.g. earlier change).
    pub fn include_unconfirmed(mut self, include: bool) -> Self {
        self.include_unconfirmed = include;
        self
    }

    pub fn address(&self) -> String {
        self.signer.address().to_string()
    }

    // Recover from poisoning: forgetting a spend would hand out the input again.
    fn spent(&self) -> MutexGuard<'_, HashSet<OutPoint>> {
        self.spent.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_spent(&self, outpoint: &OutPoint) -> bool {
        self.spent().contains(outpoint)
    }
}

#[async_trait]
impl FundingSource for EsploraWallet {
    async fn funding_inputs_for(&self, amount_sats: u64) -> Result<Vec<Utxo>, FundingError> {
        let listed = self
            .client
            .address_utxos(&self.address())
            .await
            .map_err(|e| FundingError::Unavailable(e.to_string()))?;

        let mut candidates = Vec::with_capacity(listed.len());
        for entry in listed.iter().filter(|u| u.status.confirmed || self.include_unconfirmed) {
            let utxo = entry
                .to_utxo()
                .map_err(|e| FundingError::Unavailable(e.to_string()))?;
            if !self.is_spent(&utxo.outpoint) {
                candidates.push(utxo);
            }
        }

        tracing::debug!(candidates = candidates.len(), amount_sats, "Selecting anchor inputs");
        select_largest_first(candidates, amount_sats)
    }

    fn change_script(&self) -> ScriptBuf {
        self.signer.script_pubkey()
    }

    async fn sign(&self, tx: Transaction, inputs: &[Utxo]) -> Result<Transaction, SigningError> {
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
        self.spent().extend(outpoints.iter().copied());
    }

    fn funding_lock(&self) -> Arc<tokio::sync::Mutex<()>> {
        self.funding_lock.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EsploraConfig;
    use bitcoin::hashes::Hash;
    use bitcoin::secp256k1::SecretKey;
    use bitcoin::{PrivateKey, Txid};

    fn client() -> Arc<EsploraClient> {
        Arc::new(EsploraClient::new(EsploraConfig::for_chain(ChainKind::Regtest)).unwrap())
    }

    fn wif(network: bitcoin::Network) -> String {
        let secret = SecretKey::from_slice(&[0x77; 32]).unwrap();
        PrivateKey::new(secret, network).to_wif()
    }

    #[test]
    fn test_from_wif_checks_network() {
        let wallet = EsploraWallet::from_wif(client(), &wif(bitcoin::Network::Testnet), ChainKind::Testnet).unwrap();
        assert_eq!(wallet.change_script(), wallet.signer.script_pubkey());

        assert!(matches!(
            EsploraWallet::from_wif(client(), &wif(bitcoin::Network::Bitcoin), ChainKind::Testnet),
            Err(SigningError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn test_mark_spent_is_remembered() {
        let wallet = EsploraWallet::from_wif(client(), &wif(bitcoin::Network::Testnet), ChainKind::Regtest).unwrap();
        let outpoint = OutPoint::new(Txid::all_zeros(), 2);
        assert!(!wallet.is_spent(&outpoint));
        wallet.mark_spent(&[outpoint]).await;
        assert!(wallet.is_spent(&outpoint));
    }

    #[tokio::test]
    async fn test_mark_spent_survives_poisoned_lock() {
        let wallet = Arc::new(
            EsploraWallet::from_wif(client(), &wif(bitcoin::Network::Testnet), ChainKind::Regtest).unwrap(),
        );
        let poisoner = wallet.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.spent.lock().unwrap();
            panic!("poison the spent set");
        })
        .join();
        assert!(wallet.spent.is_poisoned());

        let outpoint = OutPoint::new(Txid::all_zeros(), 5);
        wallet.mark_spent(&[outpoint]).await;
        assert!(wallet.is_spent(&outpoint));
    }

    #[test]
    fn test_funding_lock_is_shared() {
        let wallet = EsploraWallet::from_wif(client(), &wif(bitcoin::Network::Testnet), ChainKind::Regtest).unwrap();
        assert!(Arc::ptr_eq(&wallet.funding_lock(), &wallet.funding_lock()));
    }
}
