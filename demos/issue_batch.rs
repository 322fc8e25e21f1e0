//! Example: Issuing and verifying a certificate batch
//!
//! Runs against the in-memory chain, so no node or funded wallet is needed.
//!
//! Run with: RUST_LOG=info cargo run -p blockcert-core --example issue_batch

use anyhow::Context;
use bitcoin::secp256k1::SecretKey;
use blockcert_core::memory::{InMemoryChain, InMemoryWallet};
use blockcert_core::{ChainKind, ConfirmationOutcome, IssuerConfig, Issuer, P2pkhSigner};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const TEMPLATE: &str = r#"{
    "schemaVersion": "2.0",
    "document": {
        "@context": ["https://w3id.org/openbadges/v2", "https://w3id.org/blockcerts/v2"],
        "type": "Assertion",
        "badge": {
            "type": "BadgeClass",
            "name": "Certificate of Completion",
            "description": "{{name}} completed {{course}}",
            "issuer": {
                "id": "https://academy.example.org/issuer.json",
                "type": "Profile",
                "name": "Example Academy",
                "email": "registrar@academy.example.org"
            }
        }
    }
}"#;

const CONFIG: &str = r#"{
    "issuer_name": "Example Academy",
    "chain": "regtest",
    "anchor": { "confirmation": { "required_confirmations": 1, "poll_interval_secs": 1, "timeout_secs": 10 } }
}"#;

fn recipient_address(seed: u8) -> anyhow::Result<String> {
    let secret = SecretKey::from_slice(&[seed; 32])?;
    Ok(P2pkhSigner::new(secret, bitcoin::Network::Regtest).address().to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("Blockchain Certificate Issuance - Example Usage\n");

    // Step 1: Chain and issuer wallet
    let chain = Arc::new(InMemoryChain::new(ChainKind::Regtest));
    let wallet = Arc::new(InMemoryWallet::new(SecretKey::from_slice(&[0x2a; 32])?, chain.clone()));
    chain.fund(wallet.address().script_pubkey(), 100_000);
    println!("1. Issuer wallet {} funded with {} sats", wallet.address(), wallet.balance());

    // Step 2: Roster
    let roster = format!(
        "name,publicKey,identity,course\n\
         Ada Lovelace,{},ada@example.org,Analytical Engines\n\
         Alan Turing,{},alan@example.org,Computable Numbers\n\
         Barbara Liskov,{},barbara@example.org,Data Abstraction\n",
        recipient_address(1)?,
        recipient_address(2)?,
        recipient_address(3)?
    );

    // Step 3: Issue
    let config = IssuerConfig::from_json(CONFIG).context("loading issuer config")?;
    let issuer = Issuer::new(config, wallet.clone(), chain.clone(), chain.clone());
    let batch = issuer
        .issue_batch_from_sources(TEMPLATE, &roster)
        .await
        .context("issuing batch")?;
    println!(
        "2. Issued {} certificates, anchored in {} (fee {} sats)",
        batch.certificates.len(),
        batch.anchor.txid,
        batch.anchor.fee_sats
    );

    // Step 4: Wait for the anchor to confirm
    let watch = issuer.watch_confirmations(&batch);
    chain.mine_block();
    match watch.wait().await {
        ConfirmationOutcome::Confirmed { confirmations } => println!("3. Anchor confirmed ({confirmations} block)"),
        other => anyhow::bail!("anchor did not confirm: {other:?}"),
    }

    // Step 5: Verify what recipients receive
    let verifier = issuer.verifier();
    for cert in &batch.certificates {
        let json = cert.to_json()?;
        let result = verifier.verify_json(&json).await;
        println!("4. {} -> {}", cert.id().unwrap_or("<no id>"), result.status);
    }

    if let Some(first) = batch.certificates.first() {
        println!("\nSample certificate:\n{}", first.to_json()?);
    }

    Ok(())
}
