//! Committee membership and the per-node view of the committee key.

use blstrs::{G2Projective, Scalar};
use serde::{Deserialize, Serialize};

use crate::bls::{eval_commitment, share_x};
use crate::types::{NodeId, PublicKey};

/// Reconstruction threshold of a committee of `n` nodes.
pub fn threshold_for(n: usize) -> usize {
    2 * n / 3
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Validator {
    pub node_id: NodeId,
    pub validator_key: PublicKey,
    pub p2p_key: PublicKey,
}

pub fn position_by_p2p(nodes: &[Validator], p2p_key: &PublicKey) -> Option<usize> {
    nodes.iter().position(|v| &v.p2p_key == p2p_key)
}

pub fn position_by_key(nodes: &[Validator], validator_key: &PublicKey) -> Option<usize> {
    nodes.iter().position(|v| &v.validator_key == validator_key)
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriShare {
    pub index: u32,
    #[serde(with = "crate::encoding::scalar")]
    pub value: Scalar,
}

impl std::fmt::Debug for PriShare {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriShare")
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

/// This node's share of the committee key together with the public
/// commitments of the sharing polynomial. Never leaves the node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistKeyShare {
    #[serde(with = "crate::encoding::g2_vec")]
    pub commitments: Vec<G2Projective>,
    pub share: PriShare,
}

impl DistKeyShare {
    pub fn public_key(&self) -> PublicKey {
        PublicKey::from_point(&self.commitments[0])
    }

    pub fn public_share(&self, index: u32) -> G2Projective {
        eval_commitment(&self.commitments, &share_x(index))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentCommittee {
    pub nodes: Vec<Validator>,
    pub epoch: u32,
    pub threshold: usize,
    pub public_key: Option<PublicKey>,
    #[serde(default, with = "crate::encoding::g2_vec")]
    pub commitments: Vec<G2Projective>,
    pub key_share: Option<DistKeyShare>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedCommittee {
    pub nodes: Vec<Validator>,
    pub epoch: u32,
    pub public_key: Option<PublicKey>,
    #[serde(default, with = "crate::encoding::g2_vec")]
    pub commitments: Vec<G2Projective>,
    pub key_share: Option<DistKeyShare>,
    pub sponsor: Option<Validator>,
    pub sponsor_time: i64,
}

impl StagedCommittee {
    /// Replace the sponsor when the candidate started earlier, breaking
    /// ties on the lower node id, so concurrent triggers converge.
    pub fn adopt_sponsor(&mut self, candidate: Option<&Validator>, sponsor_time: i64) -> bool {
        let Some(candidate) = candidate else {
            return false;
        };
        let better = match &self.sponsor {
            None => true,
            Some(current) => {
                (sponsor_time, candidate.node_id) < (self.sponsor_time, current.node_id)
            }
        };
        if better {
            self.sponsor = Some(candidate.clone());
            self.sponsor_time = sponsor_time;
        }
        better
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitteeState {
    pub current: CurrentCommittee,
    pub staged_next: Option<StagedCommittee>,
}

impl CommitteeState {
    /// Swap the staged committee in as current. All-or-nothing: returns
    /// false and leaves `current` untouched when nothing is staged or the
    /// staged round has not produced a key.
    pub fn promote(&mut self) -> bool {
        let ready = matches!(&self.staged_next, Some(s) if s.public_key.is_some());
        if !ready {
            return false;
        }
        let Some(staged) = self.staged_next.take() else {
            return false;
        };
        self.current = CurrentCommittee {
            threshold: threshold_for(staged.nodes.len()),
            nodes: staged.nodes,
            epoch: staged.epoch,
            public_key: staged.public_key,
            commitments: staged.commitments,
            key_share: staged.key_share,
        };
        true
    }
}
