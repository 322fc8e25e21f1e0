//! Batch issuance: roster and template in, anchored certificates out.
//!
//! Each call runs one isolated [`BatchRun`]. Input problems surface before
//! any network traffic; once the anchor is accepted every later failure
//! reports [`FundsStatus::Spent`].

use crate::anchor::{AnchorError, AnchorTransaction, ChainAnchor, ConfirmationWatch};
use crate::assembler::{assemble_batch, AssemblyError, BatchContext, UnsignedCertificate};
use crate::chain::{Broadcaster, ChainDataSource, FundingSource};
use crate::config::IssuerConfig;
use crate::embedder::{embed, BlockchainCertificate, EmbedError};
use crate::merkle::{commit, Commitment, MerkleError};
use crate::roster::{self, RosterEntry, RosterError};
use crate::template::{Template, TemplateError};
use crate::types::{BatchId, FundsStatus};
use crate::verifier::Verifier;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Pipeline stage a failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Template,
    Roster,
    Assembly,
    Commitment,
    Anchor,
    Embedding,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Template => "template",
            Stage::Roster => "roster",
            Stage::Assembly => "assembly",
            Stage::Commitment => "commitment",
            Stage::Anchor => "anchor",
            Stage::Embedding => "embedding",
        };
        f.write_str(name)
    }
}

/// Every certificate that failed assembly.
#[derive(Debug)]
pub struct AssemblyFailures(pub Vec<AssemblyError>);

impl fmt::Display for AssemblyFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} certificate(s) failed assembly", self.0.len())?;
        for error in &self.0 {
            write!(f, "; {error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AssemblyFailures {}

#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Roster(#[from] RosterError),

    #[error("Roster has no recipients")]
    EmptyRoster,

    #[error(transparent)]
    Assembly(#[from] AssemblyFailures),

    #[error(transparent)]
    Commitment(#[from] MerkleError),

    #[error(transparent)]
    Anchor(#[from] AnchorError),

    #[error(transparent)]
    Embedding(#[from] EmbedError),
}

#[derive(Debug, Error)]
#[error("Batch failed at {stage} stage ({funds}): {source}")]
pub struct IssuanceError {
    pub stage: Stage,
    pub funds: FundsStatus,
    #[source]
    pub source: StageError,
}

impl IssuanceError {
    fn before_broadcast(stage: Stage, source: impl Into<StageError>) -> Self {
        Self {
            stage,
            funds: FundsStatus::Untouched,
            source: source.into(),
        }
    }
}

/// Result of a successful batch.
#[derive(Debug, Clone)]
pub struct IssuedBatch {
    pub batch_id: BatchId,
    /// Issued certificates, in roster order.
    pub certificates: Vec<BlockchainCertificate>,
    pub anchor: AnchorTransaction,
    /// Recipients left out of a partial batch, as `(roster index, reason)`.
    pub rejected: Vec<(usize, String)>,
}

/// State of one batch between assembly and embedding.
pub struct BatchRun<'a> {
    ctx: BatchContext,
    template: &'a Template,
    roster: &'a [RosterEntry],
    allow_partial: bool,
}

impl<'a> BatchRun<'a> {
    pub fn new(template: &'a Template, roster: &'a [RosterEntry], epoch: DateTime<Utc>, allow_partial: bool) -> Self {
        Self {
            ctx: BatchContext::new(epoch),
            template,
            roster,
            allow_partial,
        }
    }

    pub fn batch_id(&self) -> BatchId {
        self.ctx.batch_id
    }

    /// Assemble every recipient, applying the partial-batch policy.
    pub fn assemble(&self) -> Result<(Vec<UnsignedCertificate>, Vec<AssemblyError>), IssuanceError> {
        if self.roster.is_empty() {
            return Err(IssuanceError::before_broadcast(Stage::Roster, StageError::EmptyRoster));
        }

        let batch = assemble_batch(self.template, self.roster, &self.ctx);
        if batch.certificates.is_empty() || (!batch.rejected.is_empty() && !self.allow_partial) {
            return Err(IssuanceError::before_broadcast(
                Stage::Assembly,
                AssemblyFailures(batch.rejected),
            ));
        }
        Ok((batch.certificates, batch.rejected))
    }

    pub fn commit(&self, certificates: &[UnsignedCertificate]) -> Result<Commitment, IssuanceError> {
        commit(certificates).map_err(|e| IssuanceError::before_broadcast(Stage::Commitment, e))
    }

    /// Attach proofs; the anchor is already out, so failures report spent funds.
    pub fn embed(
        &self,
        certificates: &[UnsignedCertificate],
        commitment: &Commitment,
        anchor: &AnchorTransaction,
    ) -> Result<Vec<BlockchainCertificate>, IssuanceError> {
        certificates
            .iter()
            .zip(&commitment.proofs)
            .map(|(certificate, proof)| embed(certificate, proof, anchor))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| IssuanceError {
                stage: Stage::Embedding,
                funds: FundsStatus::Spent,
                source: e.into(),
            })
    }
}

/// Issues certificate batches for one issuer wallet.
pub struct Issuer {
    config: IssuerConfig,
    anchor: ChainAnchor,
    chain_data: Arc<dyn ChainDataSource>,
}

impl Issuer {
    pub fn new(
        config: IssuerConfig,
        funding: Arc<dyn FundingSource>,
        network: Arc<dyn Broadcaster>,
        chain_data: Arc<dyn ChainDataSource>,
    ) -> Self {
        let anchor = ChainAnchor::new(config.chain, funding, network, config.anchor.clone());
        Self {
            config,
            anchor,
            chain_data,
        }
    }

    pub fn config(&self) -> &IssuerConfig {
        &self.config
    }

    pub async fn issue_batch(&self, template: &Template, roster: &[RosterEntry]) -> Result<IssuedBatch, IssuanceError> {
        self.issue_batch_at(template, roster, Utc::now()).await
    }

    /// Issue with an explicit batch epoch; re-running with the same epoch
    /// reproduces the same certificate ids and leaves.
    pub async fn issue_batch_at(
        &self,
        template: &Template,
        roster: &[RosterEntry],
        epoch: DateTime<Utc>,
    ) -> Result<IssuedBatch, IssuanceError> {
        let run = BatchRun::new(template, roster, epoch, self.config.pipeline.allow_partial_batch);
        let batch_id = run.batch_id();
        tracing::info!(
            batch_id = %batch_id,
            issuer = %self.config.issuer_name,
            recipients = roster.len(),
            chain = %self.config.chain,
            "Starting batch"
        );

        let (certificates, rejected) = run.assemble()?;
        let commitment = run.commit(&certificates)?;
        tracing::info!(
            batch_id = %batch_id,
            leaves = commitment.leaves.len(),
            root = %hex::encode(commitment.root),
            "Batch committed"
        );

        let anchor = self.anchor.anchor(&commitment.root).await.map_err(|e| IssuanceError {
            stage: Stage::Anchor,
            funds: e.funds_status(),
            source: e.into(),
        })?;
        tracing::info!(batch_id = %batch_id, txid = %anchor.txid, fee_sats = anchor.fee_sats, "Batch anchored");

        let issued = run.embed(&certificates, &commitment, &anchor)?;

        Ok(IssuedBatch {
            batch_id,
            certificates: issued,
            anchor,
            rejected: rejected.iter().map(|e| (e.index(), e.to_string())).collect(),
        })
    }

    /// Parse inputs and issue. Parsing errors never reach the network.
    pub async fn issue_batch_from_sources(
        &self,
        template_json: &str,
        roster_csv: &str,
    ) -> Result<IssuedBatch, IssuanceError> {
        let template =
            Template::from_json(template_json).map_err(|e| IssuanceError::before_broadcast(Stage::Template, e))?;
        let roster = roster::load(roster_csv, self.config.chain)
            .map_err(|e| IssuanceError::before_broadcast(Stage::Roster, e))?;
        self.issue_batch(&template, &roster).await
    }

    /// Track confirmations of a batch's anchor in the background.
    pub fn watch_confirmations(&self, batch: &IssuedBatch) -> ConfirmationWatch {
        ConfirmationWatch::spawn(
            self.chain_data.clone(),
            batch.anchor.txid.clone(),
            self.config.anchor.confirmation.clone(),
        )
    }

    pub fn verifier(&self) -> Verifier {
        Verifier::new(self.chain_data.clone())
    }
}
