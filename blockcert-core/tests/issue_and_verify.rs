//! End-to-end issuance and verification against the in-memory chain.

use bitcoin::secp256k1::SecretKey;
use blockcert_core::memory::{InMemoryChain, InMemoryWallet};
use blockcert_core::{
    BlockchainCertificate, ChainKind, FundsStatus, IssuerConfig, Issuer, P2pkhSigner, ReasonCode, Stage,
    VerificationStatus,
};
use std::sync::Arc;

const TEMPLATE: &str = r#"{
    "schemaVersion": "2.0",
    "document": {
        "@context": ["https://w3id.org/openbadges/v2", "https://w3id.org/blockcerts/v2"],
        "type": "Assertion",
        "badge": {
            "type": "BadgeClass",
            "name": "Master of Engineering",
            "description": "Conferred on {{name}} ({{cohort}})",
            "issuer": {
                "id": "https://registry.example.edu/issuer.json",
                "type": "Profile",
                "name": "Example Institute of Technology"
            }
        }
    }
}"#;

fn recipient_address(seed: u8) -> String {
    let secret = SecretKey::from_slice(&[seed; 32]).unwrap();
    P2pkhSigner::new(secret, bitcoin::Network::Regtest).address().to_string()
}

fn roster_csv() -> String {
    format!(
        "name,publicKey,identity,cohort\n\
         Grace Hopper,{},grace@example.edu,2024\n\
         Edsger Dijkstra,ecdsa-koblitz-pubkey:{},edsger@example.edu,2024\n",
        recipient_address(0x51),
        recipient_address(0x52)
    )
}

fn setup() -> (Arc<InMemoryChain>, Arc<InMemoryWallet>, Issuer) {
    let chain = Arc::new(InMemoryChain::new(ChainKind::Regtest));
    let wallet = Arc::new(InMemoryWallet::new(
        SecretKey::from_slice(&[0x5a; 32]).unwrap(),
        chain.clone(),
    ));
    chain.fund(wallet.address().script_pubkey(), 150_000);

    let config = IssuerConfig::from_json(r#"{"issuer_name": "EIT Registry", "chain": "regtest"}"#).unwrap();
    let issuer = Issuer::new(config, wallet.clone(), chain.clone(), chain.clone());
    (chain, wallet, issuer)
}

#[tokio::test]
async fn two_recipients_share_one_anchor_and_verify() {
    let (chain, wallet, issuer) = setup();

    let batch = issuer.issue_batch_from_sources(TEMPLATE, &roster_csv()).await.unwrap();
    assert_eq!(batch.certificates.len(), 2);
    assert_eq!(batch.anchor.spent_outpoints.len(), 1);
    assert_eq!(wallet.spent_outpoints(), batch.anchor.spent_outpoints);

    let roots: Vec<_> = batch
        .certificates
        .iter()
        .map(|c| c.signature.merkle_root.clone())
        .collect();
    assert_eq!(roots[0], roots[1]);
    assert_eq!(roots[0], hex::encode(batch.anchor.anchored_root));

    let verifier = issuer.verifier();
    for cert in &batch.certificates {
        let result = verifier.verify(cert).await;
        assert_eq!(result.status, VerificationStatus::Unconfirmed);
        assert_eq!(result.reason, Some(ReasonCode::TransactionUnconfirmed));
    }

    chain.mine_block();
    for cert in &batch.certificates {
        let result = verifier.verify(cert).await;
        assert_eq!(result.status, VerificationStatus::Valid, "{}", result.detail);
        assert_eq!(result.txid.as_deref(), Some(batch.anchor.txid.as_str()));
    }
}

#[tokio::test]
async fn distributed_json_verifies_and_detects_tampering() {
    let (chain, _wallet, issuer) = setup();
    let batch = issuer.issue_batch_from_sources(TEMPLATE, &roster_csv()).await.unwrap();
    chain.mine_block();

    let json = batch.certificates[1].to_json().unwrap();
    assert!(json.contains("MerkleProof2017"));
    assert!(json.contains("Conferred on Edsger Dijkstra (2024)"));

    let verifier = issuer.verifier();
    assert_eq!(verifier.verify_json(&json).await.status, VerificationStatus::Valid);

    let tampered = json.replace("Edsger Dijkstra", "Eve Mallory");
    let result = verifier.verify_json(&tampered).await;
    assert_eq!(result.status, VerificationStatus::Invalid);
    assert_eq!(result.reason, Some(ReasonCode::ContentAltered));

    let mut cert = BlockchainCertificate::from_json(&json).unwrap();
    cert.signature.merkle_root = "00".repeat(32);
    let result = verifier.verify(&cert).await;
    assert_eq!(result.status, VerificationStatus::Invalid);
    assert_eq!(result.reason, Some(ReasonCode::MerkleRootMismatch));
}

#[tokio::test]
async fn verification_is_indeterminate_while_chain_is_down() {
    let (chain, _wallet, issuer) = setup();
    let batch = issuer.issue_batch_from_sources(TEMPLATE, &roster_csv()).await.unwrap();
    chain.mine_block();
    chain.set_reachable(false);

    let results = issuer.verifier().verify_all(&batch.certificates).await;
    assert!(results
        .iter()
        .all(|r| r.status == VerificationStatus::Indeterminate && r.reason == Some(ReasonCode::ChainUnavailable)));
}

#[tokio::test]
async fn duplicate_recipients_rejected_before_broadcast() {
    let (chain, wallet, issuer) = setup();
    let roster = format!(
        "name,publicKey,identity,cohort\n\
         A,{0},a@example.edu,2024\n\
         B,{0},b@example.edu,2024\n",
        recipient_address(0x61)
    );

    let err = issuer.issue_batch_from_sources(TEMPLATE, &roster).await.unwrap_err();
    assert_eq!(err.stage, Stage::Roster);
    assert_eq!(err.funds, FundsStatus::Untouched);
    assert_eq!(chain.broadcast_attempts(), 0);
    assert!(wallet.spent_outpoints().is_empty());
}

#[tokio::test]
async fn consecutive_batches_anchor_separately() {
    let (chain, _wallet, issuer) = setup();
    let first = issuer.issue_batch_from_sources(TEMPLATE, &roster_csv()).await.unwrap();
    let second = issuer.issue_batch_from_sources(TEMPLATE, &roster_csv()).await.unwrap();

    assert_ne!(first.anchor.txid, second.anchor.txid);
    assert_ne!(first.batch_id, second.batch_id);
    chain.mine_block();

    let verifier = issuer.verifier();
    for cert in first.certificates.iter().chain(&second.certificates) {
        assert_eq!(verifier.verify(cert).await.status, VerificationStatus::Valid);
    }
}
