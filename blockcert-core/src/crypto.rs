//! Hashing and transaction signing primitives.

use crate::types::Hash256;
use bitcoin::hashes::Hash;
use bitcoin::script::{Builder as ScriptBuilder, PushBytesBuf};
use bitcoin::secp256k1::{All, Message, Secp256k1, SecretKey};
use bitcoin::sighash::SighashCache;
use bitcoin::{Address, EcdsaSighashType, Network, PrivateKey, PublicKey, ScriptBuf, Transaction};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

/// Compute SHA-256 hash of data.
pub fn sha256(data: &[u8]) -> Hash256 {
    let hash = Sha256::digest(data);
    hash.into()
}

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("Invalid signing key: {0}")]
    InvalidKey(String),

    #[error("Sighash computation failed for input {input}: {reason}")]
    Sighash { input: usize, reason: String },

    #[error("Could not build scriptSig: {0}")]
    Script(String),

    #[error("Signer refused transaction: {0}")]
    Refused(String),
}

/// Signs legacy P2PKH inputs with a single secp256k1 key.
///
/// Holds the key in memory; `Debug` output never includes it.
pub struct P2pkhSigner {
    secp: Secp256k1<All>,
    private_key: PrivateKey,
    public_key: PublicKey,
    address: Address,
}

impl P2pkhSigner {
    /// Create a signer from a raw secret key.
    pub fn new(secret_key: SecretKey, network: Network) -> Self {
        let secp = Secp256k1::new();
        let private_key = PrivateKey::new(secret_key, network);
        let public_key = PublicKey::from_private_key(&secp, &private_key);
        let address = Address::p2pkh(public_key, network);
        Self {
            secp,
            private_key,
            public_key,
            address,
        }
    }

    /// Create a signer from a WIF-encoded private key.
    pub fn from_wif(wif: &str) -> Result<Self, SigningError> {
        let secp = Secp256k1::new();
        let private_key =
            PrivateKey::from_wif(wif).map_err(|e| SigningError::InvalidKey(e.to_string()))?;
        let public_key = PublicKey::from_private_key(&secp, &private_key);
        let address = Address::p2pkh(public_key, private_key.network);
        Ok(Self {
            secp,
            private_key,
            public_key,
            address,
        })
    }

    /// Address funds must be held at.
    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    pub fn script_pubkey(&self) -> ScriptBuf {
        self.address.script_pubkey()
    }

    /// Sign every input of `tx`, assuming all of them pay to this key.
    pub fn sign_all_inputs(&self, mut tx: Transaction) -> Result<Transaction, SigningError> {
        let script_pubkey = self.script_pubkey();
        let sighash_type = EcdsaSighashType::All;

        let mut script_sigs = Vec::with_capacity(tx.input.len());
        {
            let cache = SighashCache::new(&tx);
            for input in 0..tx.input.len() {
                let sighash = cache
                    .legacy_signature_hash(input, &script_pubkey, sighash_type.to_u32())
                    .map_err(|e| SigningError::Sighash {
                        input,
                        reason: e.to_string(),
                    })?;

                let msg = Message::from_digest(sighash.to_byte_array());
                let sig = self.secp.sign_ecdsa(&msg, &self.private_key.inner);

                let mut sig_bytes = sig.serialize_der().to_vec();
                sig_bytes.push(sighash_type.to_u32() as u8);

                let sig_push = PushBytesBuf::try_from(sig_bytes)
                    .map_err(|e| SigningError::Script(e.to_string()))?;
                let pubkey_push = PushBytesBuf::try_from(self.public_key.to_bytes())
                    .map_err(|e| SigningError::Script(e.to_string()))?;

                script_sigs.push(
                    ScriptBuilder::new()
                        .push_slice(&sig_push)
                        .push_slice(&pubkey_push)
                        .into_script(),
                );
            }
        }

        for (input, script_sig) in tx.input.iter_mut().zip(script_sigs) {
            input.script_sig = script_sig;
        }
        Ok(tx)
    }
}

impl fmt::Debug for P2pkhSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("P2pkhSigner")
            .field("address", &self.address.to_string())
            .field("private_key", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::script::Instruction;
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, OutPoint, Sequence, TxIn, TxOut, Txid, Witness};

    fn test_signer() -> P2pkhSigner {
        let secret = SecretKey::from_slice(&[0x11; 32]).unwrap();
        P2pkhSigner::new(secret, Network::Regtest)
    }

    fn unsigned_tx() -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(Txid::all_zeros(), 0),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::default(),
            }],
            output: vec![TxOut {
                value: Amount::ZERO,
                script_pubkey: ScriptBuf::new_op_return(PushBytesBuf::try_from(vec![0u8; 4]).unwrap()),
            }],
        }
    }

    #[test]
    fn test_sha256() {
        let data = b"test data";
        let hash1 = sha256(data);
        let hash2 = sha256(data);
        assert_eq!(hash1, hash2);
        assert_eq!(
            hex::encode(sha256(b"")),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_signature_verifies() {
        let signer = test_signer();
        let tx = unsigned_tx();
        let signed = signer.sign_all_inputs(tx.clone()).unwrap();

        let pushes: Vec<Vec<u8>> = signed.input[0]
            .script_sig
            .instructions()
            .filter_map(|ins| match ins {
                Ok(Instruction::PushBytes(bytes)) => Some(bytes.as_bytes().to_vec()),
                _ => None,
            })
            .collect();
        assert_eq!(pushes.len(), 2);
        assert_eq!(pushes[1], signer.public_key().to_bytes());

        let sig = bitcoin::ecdsa::Signature::from_slice(&pushes[0]).unwrap();
        let sighash = SighashCache::new(&tx)
            .legacy_signature_hash(0, &signer.script_pubkey(), EcdsaSighashType::All.to_u32())
            .unwrap();
        let msg = Message::from_digest(sighash.to_byte_array());
        let secp = Secp256k1::verification_only();
        assert!(secp
            .verify_ecdsa(&msg, &sig.signature, &signer.public_key().inner)
            .is_ok());
    }

    #[test]
    fn test_random_keys_produce_distinct_addresses() {
        use rand::RngCore;

        let mut rng = rand::thread_rng();
        let mut addresses = std::collections::HashSet::new();
        for _ in 0..8 {
            let mut bytes = [0u8; 32];
            rng.fill_bytes(&mut bytes);
            let Ok(secret) = SecretKey::from_slice(&bytes) else { continue };
            let signer = P2pkhSigner::new(secret, Network::Testnet);
            assert!(signer.sign_all_inputs(unsigned_tx()).is_ok());
            addresses.insert(signer.address().to_string());
        }
        assert!(addresses.len() >= 7);
    }

    #[test]
    fn test_debug_redacts_key() {
        let rendered = format!("{:?}", test_signer());
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_invalid_wif() {
        assert!(matches!(
            P2pkhSigner::from_wif("not-a-key"),
            Err(SigningError::InvalidKey(_))
        ));
    }
}
