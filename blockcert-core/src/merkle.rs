//! Merkle commitment over an ordered batch of certificates.
//!
//! ## Construction
//! - leaf = SHA-256(canonical certificate bytes), in roster order
//! - parent = SHA-256(left || right)
//! - an unpaired node at the end of a level is promoted unchanged; it is
//!   never hashed with itself (CVE-2012-2459)
//!
//! Proof steps record the sibling hash and which side it sits on, so the
//! verifier does not need the leaf index to replay a proof.

use crate::assembler::UnsignedCertificate;
use crate::crypto::sha256;
use crate::serialization::EncodingError;
use crate::types::{hex_hash, Hash256, Side};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MerkleError {
    #[error("Cannot commit an empty batch")]
    EmptyBatch,

    #[error("Certificate {index} could not be hashed: {source}")]
    Encoding {
        index: usize,
        #[source]
        source: EncodingError,
    },
}

/// One step of an inclusion proof.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    #[serde(with = "hex_hash")]
    pub sibling: Hash256,
    pub side: Side,
}

/// Inclusion proof for one leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InclusionProof {
    pub leaf_index: usize,
    #[serde(with = "hex_hash")]
    pub target_hash: Hash256,
    pub steps: Vec<ProofStep>,
}

impl InclusionProof {
    /// Root this proof leads to.
    pub fn replay(&self) -> Hash256 {
        replay(self.target_hash, &self.steps)
    }

    /// Verify this proof against a known root.
    pub fn verify(&self, expected_root: &Hash256) -> bool {
        verify_proof(&self.target_hash, &self.steps, expected_root)
    }
}

/// Merkle tree with every level retained for proof generation.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    /// levels[0] = leaves, levels[last] = [root]
    levels: Vec<Vec<Hash256>>,
}

impl MerkleTree {
    /// Build a tree from leaf hashes.
    pub fn from_leaves(leaves: Vec<Hash256>) -> Result<Self, MerkleError> {
        if leaves.is_empty() {
            return Err(MerkleError::EmptyBatch);
        }

        let mut levels = vec![leaves];
        loop {
            let current = &levels[levels.len() - 1];
            if current.len() == 1 {
                break;
            }

            let next: Vec<Hash256> = current
                .chunks(2)
                .map(|chunk| match chunk.get(1) {
                    Some(right) => hash_pair(&chunk[0], right),
                    None => chunk[0],
                })
                .collect();
            levels.push(next);
        }

        Ok(Self { levels })
    }

    /// The Merkle root.
    pub fn root(&self) -> Hash256 {
        self.levels[self.levels.len() - 1][0]
    }

    pub fn leaf_count(&self) -> usize {
        self.levels[0].len()
    }

    pub fn leaves(&self) -> &[Hash256] {
        &self.levels[0]
    }

    /// Generate the inclusion proof for the leaf at `index`.
    pub fn prove(&self, index: usize) -> Option<InclusionProof> {
        if index >= self.leaf_count() {
            return None;
        }

        let mut steps = Vec::new();
        let mut idx = index;

        for level in &self.levels[..self.levels.len() - 1] {
            let sibling_idx = idx ^ 1;
            if sibling_idx < level.len() {
                let side = if idx % 2 == 0 { Side::Right } else { Side::Left };
                steps.push(ProofStep {
                    sibling: level[sibling_idx],
                    side,
                });
            }
            // No sibling: the node was promoted and contributes no step.
            idx /= 2;
        }

        Some(InclusionProof {
            leaf_index: index,
            target_hash: self.levels[0][index],
            steps,
        })
    }
}

/// Root and per-certificate proofs for a batch.
#[derive(Debug, Clone)]
pub struct Commitment {
    pub root: Hash256,
    pub leaves: Vec<Hash256>,
    /// `proofs[i]` belongs to the i-th certificate passed to [`commit`].
    pub proofs: Vec<InclusionProof>,
}

/// Hash the batch into leaves, build the tree and prove every leaf.
pub fn commit(certificates: &[UnsignedCertificate]) -> Result<Commitment, MerkleError> {
    if certificates.is_empty() {
        return Err(MerkleError::EmptyBatch);
    }

    let leaves: Vec<Hash256> = certificates
        .par_iter()
        .enumerate()
        .map(|(index, cert)| {
            cert.leaf_hash()
                .map_err(|source| MerkleError::Encoding { index, source })
        })
        .collect::<Result<_, _>>()?;

    let tree = MerkleTree::from_leaves(leaves)?;
    let proofs = (0..tree.leaf_count()).filter_map(|i| tree.prove(i)).collect();

    tracing::debug!(
        leaves = tree.leaf_count(),
        root = %hex::encode(tree.root()),
        "Merkle commitment built"
    );

    Ok(Commitment {
        root: tree.root(),
        leaves: tree.leaves().to_vec(),
        proofs,
    })
}

/// Hash two nodes together.
pub fn hash_pair(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left);
    buf[32..].copy_from_slice(right);
    sha256(&buf)
}

/// Fold proof steps over a leaf hash, left to right.
pub fn replay(leaf: Hash256, steps: &[ProofStep]) -> Hash256 {
    steps.iter().fold(leaf, |current, step| match step.side {
        Side::Left => hash_pair(&step.sibling, &current),
        Side::Right => hash_pair(&current, &step.sibling),
    })
}

/// Whether `steps` lead from `leaf` to `root`. A mismatch is `false`, not an error.
pub fn verify_proof(leaf: &Hash256, steps: &[ProofStep], root: &Hash256) -> bool {
    &replay(*leaf, steps) == root
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::assemble_batch;
    use crate::assembler::tests::{test_context, test_entry};
    use crate::template::tests::sample_template;
    use proptest::prelude::*;

    fn leaves(n: usize) -> Vec<Hash256> {
        (0..n).map(|i| sha256(&(i as u64).to_be_bytes())).collect()
    }

    fn ceil_log2(n: usize) -> usize {
        (usize::BITS - (n.max(1) - 1).leading_zeros()) as usize
    }

    #[test]
    fn test_empty_tree() {
        assert!(matches!(MerkleTree::from_leaves(vec![]), Err(MerkleError::EmptyBatch)));
        assert!(matches!(commit(&[]), Err(MerkleError::EmptyBatch)));
    }

    #[test]
    fn test_single_leaf() {
        let leaf = sha256(b"only");
        let tree = MerkleTree::from_leaves(vec![leaf]).unwrap();
        assert_eq!(tree.root(), leaf);

        let proof = tree.prove(0).unwrap();
        assert!(proof.steps.is_empty());
        assert!(proof.verify(&leaf));
    }

    #[test]
    fn test_three_leaves_odd_promotion() {
        let l = leaves(3);
        let tree = MerkleTree::from_leaves(l.clone()).unwrap();
        // Level 1: [H(l0||l1), l2]  (l2 promoted, not duplicated)
        let expected = hash_pair(&hash_pair(&l[0], &l[1]), &l[2]);
        assert_eq!(tree.root(), expected);

        let proof = tree.prove(2).unwrap();
        assert_eq!(proof.steps.len(), 1);
        assert_eq!(proof.steps[0].side, Side::Left);
    }

    #[test]
    fn test_proof_sides() {
        let l = leaves(2);
        let tree = MerkleTree::from_leaves(l.clone()).unwrap();
        assert_eq!(tree.prove(0).unwrap().steps, vec![ProofStep { sibling: l[1], side: Side::Right }]);
        assert_eq!(tree.prove(1).unwrap().steps, vec![ProofStep { sibling: l[0], side: Side::Left }]);
    }

    #[test]
    fn test_proof_out_of_bounds() {
        let tree = MerkleTree::from_leaves(leaves(3)).unwrap();
        assert!(tree.prove(3).is_none());
    }

    #[test]
    fn test_tampered_proof_fails() {
        let tree = MerkleTree::from_leaves(leaves(4)).unwrap();
        let mut proof = tree.prove(1).unwrap();
        proof.steps[0].sibling[0] ^= 0xFF;
        assert!(!proof.verify(&tree.root()));
    }

    #[test]
    fn test_flipped_side_fails() {
        let tree = MerkleTree::from_leaves(leaves(4)).unwrap();
        let mut proof = tree.prove(0).unwrap();
        proof.steps[0].side = Side::Left;
        assert!(!proof.verify(&tree.root()));
    }

    #[test]
    fn test_matches_independent_implementation() {
        use rs_merkle::algorithms::Sha256 as RsSha256;

        for n in [1usize, 2, 3, 5, 7, 8, 13, 64, 100] {
            let l = leaves(n);
            let ours = MerkleTree::from_leaves(l.clone()).unwrap().root();
            let theirs = rs_merkle::MerkleTree::<RsSha256>::from_leaves(&l).root().unwrap();
            assert_eq!(ours, theirs, "root mismatch for {n} leaves");
        }
    }

    #[test]
    fn test_all_proofs_small_sizes() {
        for n in 1..=64 {
            let tree = MerkleTree::from_leaves(leaves(n)).unwrap();
            let root = tree.root();
            for i in 0..n {
                let proof = tree.prove(i).unwrap();
                assert!(proof.verify(&root), "proof {i} of {n} failed");
                assert!(proof.steps.len() <= ceil_log2(n));
            }
        }
    }

    #[test]
    fn test_single_change_affects_only_that_proof() {
        let template = sample_template();
        let ctx = test_context();

        for n in [1u8, 2, 3, 5, 7] {
            let roster: Vec<_> = (1..=n).map(test_entry).collect();
            let certs = assemble_batch(&template, &roster, &ctx).certificates;
            let original = commit(&certs).unwrap();

            for target in 0..certs.len() {
                let mut altered = certs.clone();
                altered[target].document["recipientProfile"]["name"] = "Mallory".into();
                let changed = commit(&altered).unwrap();

                assert_ne!(original.root, changed.root, "n={n} target={target}");
                assert!(!verify_proof(
                    &changed.leaves[target],
                    &original.proofs[target].steps,
                    &original.root
                ));
                for other in (0..certs.len()).filter(|&j| j != target) {
                    assert!(verify_proof(
                        &original.leaves[other],
                        &original.proofs[other].steps,
                        &original.root
                    ));
                    assert!(changed.proofs[other].verify(&changed.root));
                }
            }
        }
    }

    #[test]
    fn test_commit_preserves_certificate_order() {
        let roster: Vec<_> = (1..=9).map(test_entry).collect();
        let certs = assemble_batch(&sample_template(), &roster, &test_context()).certificates;
        let commitment = commit(&certs).unwrap();

        for (i, cert) in certs.iter().enumerate() {
            assert_eq!(commitment.leaves[i], cert.leaf_hash().unwrap());
            assert_eq!(commitment.proofs[i].leaf_index, i);
            assert!(commitment.proofs[i].verify(&commitment.root));
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_every_proof_replays_to_root(n in 1usize..=1000) {
            let tree = MerkleTree::from_leaves(leaves(n)).unwrap();
            let root = tree.root();
            for i in 0..n {
                let proof = tree.prove(i).unwrap();
                prop_assert!(proof.verify(&root));
                prop_assert!(proof.steps.len() <= ceil_log2(n));
            }
        }
    }
}
