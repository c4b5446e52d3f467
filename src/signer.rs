//! Threshold BLS signatures under the committee key.
//!
//! A partial signature is `H(m)^x_i` in G1. Partials from more than
//! `threshold` distinct members interpolate to `H(m)^x`, which verifies
//! against the committee public key `g2^x` with a single pairing check.

use std::collections::BTreeMap;

use blake3::Hasher;
use blstrs::{G1Projective, G2Projective};
use group::Group;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bls::{
    Keypair, eval_commitment, g1_from_bytes, g1_to_bytes, hash_to_g1, pairing, share_x, verify_digest,
};
use crate::committee::{CommitteeState, PriShare, Validator, threshold_for};
use crate::lagrange::combine_g1_at_zero;
use crate::types::{Error, PublicKey};

const DST_SIG: &[u8] = b"SECRET-COMMITTEE-SIG-V1";
const DST_SESSION: &[u8] = b"SECRET-COMMITTEE-SIGN-SESSION-V1";
const DST_PARTIAL: &[u8] = b"SECRET-COMMITTEE-PARTIAL-V1";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "crate::encoding::g1")] pub G1Projective);

impl Signature {
    pub fn to_bytes(&self) -> [u8; 48] {
        g1_to_bytes(&self.0)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        Ok(Self(g1_from_bytes(bytes)?))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigShare {
    pub index: u32,
    #[serde(with = "crate::encoding::g1")]
    pub value: G1Projective,
}

/// A signature share plus the signer's validator-key signature over it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialSignature {
    pub share: SigShare,
    #[serde(with = "crate::encoding::b64")]
    pub session_id: [u8; 32],
    #[serde(with = "crate::encoding::g1")]
    pub signature: G1Projective,
}

pub fn verify_signature(public_key: &PublicKey, msg: &[u8], sig: &Signature) -> bool {
    let Ok(pk) = public_key.to_point() else {
        return false;
    };
    pairing(&sig.0, &G2Projective::generator()) == pairing(&hash_to_g1(msg, DST_SIG), &pk)
}

/// Public parameters of one committee key: who signs, how many are needed
/// and the commitments that yield each member's public share.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningContext {
    pub epoch: u32,
    pub nodes: Vec<Validator>,
    pub threshold: usize,
    #[serde(with = "crate::encoding::g2_vec")]
    pub commitments: Vec<G2Projective>,
    pub public_key: PublicKey,
}

impl SigningContext {
    pub fn new(epoch: u32, nodes: Vec<Validator>, commitments: Vec<G2Projective>) -> Result<Self, Error> {
        let Some(c0) = commitments.first() else {
            return Err(Error::NotInitialized);
        };
        Ok(Self {
            epoch,
            threshold: threshold_for(nodes.len()),
            public_key: PublicKey::from_point(c0),
            nodes,
            commitments,
        })
    }

    /// Context of the committed key. Verification always uses this one.
    pub fn current(state: &CommitteeState) -> Result<Self, Error> {
        let current = &state.current;
        Self::new(current.epoch, current.nodes.clone(), current.commitments.clone())
    }

    pub fn session_id(&self, msg: &[u8]) -> [u8; 32] {
        let mut hasher = Hasher::new();
        hasher.update(DST_SESSION);
        hasher.update(&self.epoch.to_be_bytes());
        hasher.update(&(self.threshold as u64).to_be_bytes());
        for node in self.nodes.iter() {
            hasher.update(node.validator_key.as_bytes());
        }
        hasher.update(self.public_key.as_bytes());
        hasher.update(&(msg.len() as u64).to_be_bytes());
        hasher.update(msg);
        *hasher.finalize().as_bytes()
    }

    pub fn public_share(&self, index: u32) -> G2Projective {
        eval_commitment(&self.commitments, &share_x(index))
    }

    pub fn verify_partial(&self, msg: &[u8], partial: &PartialSignature) -> Result<(), Error> {
        if partial.session_id != self.session_id(msg) {
            return Err(Error::InvalidMessage("partial signature for another session".into()));
        }
        let index = partial.share.index;
        let node = self
            .nodes
            .get(index as usize)
            .ok_or_else(|| Error::InvalidMessage(format!("unknown signer {index}")))?;
        if !verify_digest(&partial.signature, &node.validator_key, &partial_digest(partial)) {
            return Err(Error::InvalidSignature);
        }
        let h = hash_to_g1(msg, DST_SIG);
        if pairing(&partial.share.value, &G2Projective::generator())
            != pairing(&h, &self.public_share(index))
        {
            return Err(Error::InvalidShare);
        }
        Ok(())
    }

    /// Combine partials over `msg`. Invalid and duplicate partials are
    /// skipped; more than `threshold` valid ones are required.
    pub fn combine(&self, msg: &[u8], partials: &[PartialSignature]) -> Result<Signature, Error> {
        let mut valid: BTreeMap<u32, G1Projective> = BTreeMap::new();
        for partial in partials {
            if valid.contains_key(&partial.share.index) {
                continue;
            }
            match self.verify_partial(msg, partial) {
                Ok(()) => {
                    valid.insert(partial.share.index, partial.share.value);
                }
                Err(err) => debug!(index = partial.share.index, %err, "skipping partial signature"),
            }
        }
        if valid.len() <= self.threshold {
            return Err(Error::InsufficientPartialSignatures {
                got: valid.len(),
                threshold: self.threshold,
            });
        }
        let (indices, values): (Vec<u32>, Vec<G1Projective>) =
            valid.into_iter().take(self.threshold + 1).unzip();
        let signature = Signature(combine_g1_at_zero(&indices, &values)?);
        if !self.verify(msg, &signature) {
            return Err(Error::InvalidSignature);
        }
        Ok(signature)
    }

    pub fn verify(&self, msg: &[u8], sig: &Signature) -> bool {
        verify_signature(&self.public_key, msg, sig)
    }
}

/// Signing side of one member: its share bound to the committee context.
#[derive(Clone, Debug)]
pub struct ThresholdSigner {
    context: SigningContext,
    share: PriShare,
    keypair: Keypair,
}

impl ThresholdSigner {
    pub fn new(context: SigningContext, share: PriShare, keypair: Keypair) -> Self {
        Self {
            context,
            share,
            keypair,
        }
    }

    /// Signer for the freshest key this node holds. A staged next-epoch
    /// share wins over the current one.
    pub fn from_state(state: &CommitteeState, keypair: Keypair) -> Result<Self, Error> {
        if let Some(staged) = &state.staged_next {
            if let Some(key_share) = &staged.key_share {
                let context = SigningContext::new(
                    staged.epoch,
                    staged.nodes.clone(),
                    key_share.commitments.clone(),
                )?;
                return Ok(Self::new(context, key_share.share.clone(), keypair));
            }
        }
        let current = &state.current;
        if current.public_key.is_none() {
            return Err(Error::NotInitialized);
        }
        let key_share = current.key_share.as_ref().ok_or(Error::NotCommitteeMember)?;
        let context = SigningContext::new(
            current.epoch,
            current.nodes.clone(),
            key_share.commitments.clone(),
        )?;
        Ok(Self::new(context, key_share.share.clone(), keypair))
    }

    pub fn context(&self) -> &SigningContext {
        &self.context
    }

    pub fn index(&self) -> u32 {
        self.share.index
    }

    pub fn public_key(&self) -> PublicKey {
        self.context.public_key
    }

    /// Deterministic share `H(m)^x_i`, authenticated with the validator key.
    pub fn partial_sign(&self, msg: &[u8]) -> PartialSignature {
        let share = SigShare {
            index: self.share.index,
            value: hash_to_g1(msg, DST_SIG) * self.share.value,
        };
        let mut partial = PartialSignature {
            share,
            session_id: self.context.session_id(msg),
            signature: G1Projective::identity(),
        };
        partial.signature = self.keypair.sign_digest(&partial_digest(&partial));
        partial
    }
}

fn partial_digest(partial: &PartialSignature) -> [u8; 32] {
    let mut hasher = Hasher::new();
    hasher.update(DST_PARTIAL);
    hasher.update(&partial.session_id);
    hasher.update(&partial.share.index.to_be_bytes());
    hasher.update(&g1_to_bytes(&partial.share.value));
    *hasher.finalize().as_bytes()
}
