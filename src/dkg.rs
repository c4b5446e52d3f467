//! Deal/response key generation and resharing over BLS12-381.
//!
//! Every dealer derives a polynomial of `threshold` coefficients, publishes
//! Feldman commitments `C_k = g2^a_k` and seals one evaluation to each member
//! of the new committee. Recipients verify their evaluation against the
//! commitments and answer with one status per dealer. Once every recipient
//! has answered, the dealers nobody complained about form QUAL and each
//! recipient sums (fresh key) or Lagrange-combines (resharing) the
//! evaluations it received from QUAL.
//!
//! When resharing, dealer `i` uses its old share as the constant term, so
//! `C_0` must equal the old public polynomial evaluated at `i` and the
//! combined commitments keep the committee public key unchanged.

use std::collections::{BTreeMap, BTreeSet};

use blake3::Hasher;
use blstrs::{G1Projective, G2Projective, Scalar};
use ff::Field;
use group::Group;
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::bls::{
    Keypair, commit_poly, eval_commitment, eval_poly, g2_to_bytes, hash_to_scalar,
    scalar_from_bytes, scalar_to_bytes, share_x, verify_digest,
};
use crate::committee::{DistKeyShare, PriShare, Validator, position_by_key, threshold_for};
use crate::encoding::{enc_bytes, enc_tuple};
use crate::lagrange::coefficients_at_zero;
use crate::seal::{Sealed, open, seal};
use crate::types::{Error, PublicKey};

const DST_SESSION: &[u8] = b"SECRET-COMMITTEE-DKG-SESSION-V1";
const DST_DEAL: &[u8] = b"SECRET-COMMITTEE-DKG-DEAL-V1";
const DST_RESPONSE: &[u8] = b"SECRET-COMMITTEE-DKG-RESPONSE-V1";
const DST_COEFF: &[u8] = b"SECRET-COMMITTEE-DKG-COEFF-V1";

/// Static description of one key generation or resharing round.
#[derive(Clone, Debug)]
pub struct DkgConfig {
    pub longterm: Keypair,
    /// Dealers. Equal to `new_nodes` for a fresh key.
    pub old_nodes: Vec<Validator>,
    /// Recipients of the new shares.
    pub new_nodes: Vec<Validator>,
    pub threshold: usize,
    pub old_threshold: usize,
    /// Old share dealt as the resharing secret.
    pub share: Option<DistKeyShare>,
    /// Old public polynomial; empty for a fresh key.
    pub public_coeffs: Vec<G2Projective>,
    pub epoch: u32,
    /// Committee key committed before this round, if any. Part of the
    /// session id so a rerun of epoch 1 never shares a session with the run
    /// it replaces.
    pub prior_key: Option<PublicKey>,
    pub max_faulty_dealers: usize,
}

impl DkgConfig {
    pub fn fresh(longterm: Keypair, nodes: Vec<Validator>, epoch: u32) -> Self {
        let threshold = threshold_for(nodes.len());
        Self {
            longterm,
            old_nodes: nodes.clone(),
            new_nodes: nodes,
            threshold,
            old_threshold: threshold,
            share: None,
            public_coeffs: Vec::new(),
            epoch,
            prior_key: None,
            max_faulty_dealers: 1,
        }
    }

    pub fn reshare(
        longterm: Keypair,
        old_nodes: Vec<Validator>,
        new_nodes: Vec<Validator>,
        share: Option<DistKeyShare>,
        public_coeffs: Vec<G2Projective>,
        epoch: u32,
    ) -> Self {
        Self {
            longterm,
            threshold: threshold_for(new_nodes.len()),
            old_threshold: threshold_for(old_nodes.len()),
            old_nodes,
            new_nodes,
            share,
            public_coeffs,
            epoch,
            prior_key: None,
            max_faulty_dealers: 1,
        }
    }

    pub fn with_prior_key(mut self, prior_key: Option<PublicKey>) -> Self {
        self.prior_key = prior_key;
        self
    }

    pub fn with_max_faulty_dealers(mut self, max: usize) -> Self {
        self.max_faulty_dealers = max;
        self
    }

    pub fn is_resharing(&self) -> bool {
        !self.public_coeffs.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedDeal {
    pub share_index: u32,
    pub sealed: Sealed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealBundle {
    pub dealer_index: u32,
    pub deals: Vec<EncryptedDeal>,
    #[serde(with = "crate::encoding::g2_vec")]
    pub public_commitments: Vec<G2Projective>,
    #[serde(with = "crate::encoding::b64")]
    pub session_id: [u8; 32],
    #[serde(with = "crate::encoding::g1")]
    pub signature: G1Projective,
}

impl DealBundle {
    pub fn digest(&self) -> Result<[u8; 32], Error> {
        bundle_digest(self)
    }

    /// Re-sign after the bundle has been modified.
    pub fn sign(&mut self, longterm: &Keypair) -> Result<(), Error> {
        self.signature = longterm.sign_digest(&self.digest()?);
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Success,
    Complaint,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub dealer_index: u32,
    pub status: Status,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseBundle {
    pub share_index: u32,
    pub responses: Vec<Response>,
    #[serde(with = "crate::encoding::b64")]
    pub session_id: [u8; 32],
    #[serde(with = "crate::encoding::g1")]
    pub signature: G1Projective,
}

impl ResponseBundle {
    pub fn complaints(&self) -> impl Iterator<Item = u32> + '_ {
        self.responses
            .iter()
            .filter(|r| r.status == Status::Complaint)
            .map(|r| r.dealer_index)
    }
}

/// Result of a completed round.
#[derive(Clone, Debug)]
pub struct DkgOutput {
    pub public_key: PublicKey,
    pub commitments: Vec<G2Projective>,
    /// `None` on nodes that dealt but are not part of the new committee.
    pub key_share: Option<DistKeyShare>,
    pub qual: Vec<u32>,
}

pub struct DistKeyGenerator {
    config: DkgConfig,
    session_id: [u8; 32],
    dealer_index: Option<u32>,
    share_index: Option<u32>,
    coeffs: Vec<Scalar>,
    deal_commitments: BTreeMap<u32, Vec<G2Projective>>,
    deal_shares: BTreeMap<u32, Scalar>,
}

impl DistKeyGenerator {
    pub fn new(config: DkgConfig) -> Result<Self, Error> {
        let n = config.new_nodes.len();
        if n == 0 || config.threshold == 0 || config.threshold > n {
            return Err(Error::InvalidParams);
        }
        let old_n = config.old_nodes.len();
        if old_n == 0 || config.old_threshold == 0 || config.old_threshold > old_n {
            return Err(Error::InvalidParams);
        }
        if config.is_resharing() && config.public_coeffs.len() != config.old_threshold {
            return Err(Error::InvalidParams);
        }

        let me = config.longterm.public();
        let share_index = position_by_key(&config.new_nodes, &me).map(|i| i as u32);
        let dealer_index = if config.is_resharing() {
            match &config.share {
                Some(old) => {
                    let position = position_by_key(&config.old_nodes, &me).map(|i| i as u32);
                    if position != Some(old.share.index) {
                        return Err(Error::InvalidShare);
                    }
                    let expected = eval_commitment(&config.public_coeffs, &share_x(old.share.index));
                    if G2Projective::generator() * old.share.value != expected {
                        return Err(Error::InvalidShare);
                    }
                    position
                }
                None => None,
            }
        } else {
            share_index
        };

        // Coefficients are derived from the long-term secret and the session,
        // so a dealer restarted mid-round deals the same polynomial again.
        let session_id = session_id(&config)?;
        let mut coeffs = Vec::new();
        if dealer_index.is_some() {
            let seed = scalar_to_bytes(config.longterm.secret());
            coeffs.reserve(config.threshold);
            let secret = match &config.share {
                Some(old) if config.is_resharing() => old.share.value,
                _ => hash_to_scalar(DST_COEFF, &[&seed[..], &session_id[..], &0u64.to_be_bytes()[..]]),
            };
            coeffs.push(secret);
            for k in 1..config.threshold as u64 {
                coeffs.push(hash_to_scalar(DST_COEFF, &[&seed[..], &session_id[..], &k.to_be_bytes()[..]]));
            }
        }

        Ok(Self {
            config,
            session_id,
            dealer_index,
            share_index,
            coeffs,
            deal_commitments: BTreeMap::new(),
            deal_shares: BTreeMap::new(),
        })
    }

    pub fn config(&self) -> &DkgConfig {
        &self.config
    }

    pub fn session_id(&self) -> &[u8; 32] {
        &self.session_id
    }

    pub fn dealer_index(&self) -> Option<u32> {
        self.dealer_index
    }

    pub fn share_index(&self) -> Option<u32> {
        self.share_index
    }

    pub fn is_recipient(&self) -> bool {
        self.share_index.is_some()
    }

    /// This node's deal, or `None` for a joiner that holds no old share.
    pub fn deal_bundle(&self) -> Result<Option<DealBundle>, Error> {
        let Some(dealer_index) = self.dealer_index else {
            return Ok(None);
        };
        let mut rng = OsRng;
        let public_commitments = commit_poly(&self.coeffs);
        let mut deals = Vec::with_capacity(self.config.new_nodes.len());
        for (j, node) in self.config.new_nodes.iter().enumerate() {
            let share_index = j as u32;
            let value = eval_poly(&self.coeffs, &share_x(share_index));
            let aad = deal_aad(&self.session_id, dealer_index, share_index)?;
            let sealed = seal(&node.validator_key, &scalar_to_bytes(&value), &aad, &mut rng)?;
            deals.push(EncryptedDeal {
                share_index,
                sealed,
            });
        }
        let mut bundle = DealBundle {
            dealer_index,
            deals,
            public_commitments,
            session_id: self.session_id,
            signature: G1Projective::identity(),
        };
        bundle.sign(&self.config.longterm)?;
        Ok(Some(bundle))
    }

    /// Verify every expected dealer's deal and answer with one status each.
    ///
    /// Missing deals count as complaints. More than `max_faulty_dealers`
    /// complaints abort the round.
    pub fn process_deals(&mut self, bundles: &[DealBundle]) -> Result<ResponseBundle, Error> {
        let me = self.share_index.ok_or(Error::NotCommitteeMember)?;
        let dealers = self.config.old_nodes.len() as u32;

        #[cfg(feature = "parallel")]
        let checked: Vec<(u32, Result<(Vec<G2Projective>, Scalar), Error>)> = (0..dealers)
            .into_par_iter()
            .map(|dealer| (dealer, self.check_dealer(bundles, dealer)))
            .collect();

        #[cfg(not(feature = "parallel"))]
        let checked: Vec<(u32, Result<(Vec<G2Projective>, Scalar), Error>)> = (0..dealers)
            .map(|dealer| (dealer, self.check_dealer(bundles, dealer)))
            .collect();

        let mut responses = Vec::with_capacity(checked.len());
        let mut faulty = 0usize;
        for (dealer_index, result) in checked {
            let status = match result {
                Ok((commitments, value)) => {
                    self.deal_commitments.insert(dealer_index, commitments);
                    self.deal_shares.insert(dealer_index, value);
                    Status::Success
                }
                Err(err) => {
                    warn!(dealer = dealer_index, %err, "complaint against dealer");
                    faulty += 1;
                    Status::Complaint
                }
            };
            responses.push(Response {
                dealer_index,
                status,
            });
        }
        if faulty > self.config.max_faulty_dealers {
            self.deal_commitments.clear();
            self.deal_shares.clear();
            return Err(Error::TooManyFaultyDealers(faulty));
        }

        let mut bundle = ResponseBundle {
            share_index: me,
            responses,
            session_id: self.session_id,
            signature: G1Projective::identity(),
        };
        bundle.signature = self.config.longterm.sign_digest(&response_digest(&bundle)?);
        debug!(share_index = me, faulty, "deals processed");
        Ok(bundle)
    }

    /// Record the public half of deals on a dealer that leaves the committee,
    /// so it can still derive the new commitments.
    pub fn record_public(&mut self, bundles: &[DealBundle]) {
        for bundle in bundles {
            match self.check_bundle(bundle).and_then(|_| self.check_resharing(bundle)) {
                Ok(()) => {
                    self.deal_commitments
                        .insert(bundle.dealer_index, bundle.public_commitments.clone());
                }
                Err(err) => warn!(dealer = bundle.dealer_index, %err, "ignoring deal"),
            }
        }
    }

    /// Resolve the round once every new-committee member has responded.
    ///
    /// Complaints would normally trigger a justification round. Instead the
    /// accused dealers are dropped from QUAL; if too few dealers remain the
    /// round fails with [`Error::JustificationRequired`].
    pub fn process_responses(&self, bundles: &[ResponseBundle]) -> Result<DkgOutput, Error> {
        let n = self.config.new_nodes.len();
        let dealers = self.config.old_nodes.len() as u32;
        let mut seen = BTreeSet::new();
        let mut complained = BTreeSet::new();
        for bundle in bundles {
            if bundle.session_id != self.session_id {
                return Err(Error::ProcessResponsesFailed("session id mismatch".into()));
            }
            let Some(responder) = self.config.new_nodes.get(bundle.share_index as usize) else {
                return Err(Error::ProcessResponsesFailed(format!(
                    "unknown responder {}",
                    bundle.share_index
                )));
            };
            if !seen.insert(bundle.share_index) {
                return Err(Error::ProcessResponsesFailed(format!(
                    "duplicate response from {}",
                    bundle.share_index
                )));
            }
            if !verify_digest(&bundle.signature, &responder.validator_key, &response_digest(bundle)?) {
                return Err(Error::ProcessResponsesFailed(format!(
                    "bad signature on response from {}",
                    bundle.share_index
                )));
            }
            for dealer in 0..dealers {
                let status = bundle
                    .responses
                    .iter()
                    .find(|r| r.dealer_index == dealer)
                    .map(|r| r.status)
                    .unwrap_or(Status::Complaint);
                if status == Status::Complaint {
                    complained.insert(dealer);
                }
            }
        }
        if seen.len() != n {
            return Err(Error::ProcessResponsesFailed(format!(
                "{} of {n} responses",
                seen.len()
            )));
        }

        let qual: Vec<u32> = (0..dealers).filter(|d| !complained.contains(d)).collect();
        if !complained.is_empty() {
            if qual.len() < self.config.old_threshold {
                return Err(Error::JustificationRequired);
            }
            info!(
                excluded = ?complained,
                qual = qual.len(),
                "resolving without justifications"
            );
        }
        self.finish(qual)
    }

    fn finish(&self, qual: Vec<u32>) -> Result<DkgOutput, Error> {
        if qual.iter().any(|d| !self.deal_commitments.contains_key(d)) {
            return Err(Error::ProcessResponsesFailed(
                "missing commitments of a qualified dealer".into(),
            ));
        }
        let weights = if self.config.is_resharing() {
            coefficients_at_zero(&qual)?
        } else {
            vec![Scalar::ONE; qual.len()]
        };

        let mut commitments = vec![G2Projective::identity(); self.config.threshold];
        for (weight, dealer) in weights.iter().zip(qual.iter()) {
            for (acc, c_k) in commitments.iter_mut().zip(self.deal_commitments[dealer].iter()) {
                *acc += *c_k * weight;
            }
        }
        if self.config.is_resharing() && commitments[0] != self.config.public_coeffs[0] {
            return Err(Error::ProcessResponsesFailed(
                "resharing changed the public key".into(),
            ));
        }

        let key_share = match self.share_index {
            Some(me) => {
                let mut value = Scalar::ZERO;
                for (weight, dealer) in weights.iter().zip(qual.iter()) {
                    let share = self.deal_shares.get(dealer).ok_or(Error::InvalidShare)?;
                    value += *share * weight;
                }
                if G2Projective::generator() * value != eval_commitment(&commitments, &share_x(me)) {
                    return Err(Error::ProcessResponsesFailed(
                        "derived share does not match commitments".into(),
                    ));
                }
                Some(DistKeyShare {
                    commitments: commitments.clone(),
                    share: PriShare { index: me, value },
                })
            }
            None => None,
        };

        Ok(DkgOutput {
            public_key: PublicKey::from_point(&commitments[0]),
            commitments,
            key_share,
            qual,
        })
    }

    fn check_dealer(
        &self,
        bundles: &[DealBundle],
        dealer: u32,
    ) -> Result<(Vec<G2Projective>, Scalar), Error> {
        let bundle = bundles
            .iter()
            .find(|b| b.dealer_index == dealer)
            .ok_or_else(|| Error::InvalidMessage(format!("no deal from dealer {dealer}")))?;
        self.verify_deal(bundle)
    }

    fn verify_deal(&self, bundle: &DealBundle) -> Result<(Vec<G2Projective>, Scalar), Error> {
        let me = self.share_index.ok_or(Error::NotCommitteeMember)?;
        self.check_bundle(bundle)?;
        let deal = bundle
            .deals
            .iter()
            .find(|d| d.share_index == me)
            .ok_or(Error::InvalidShare)?;
        let aad = deal_aad(&self.session_id, bundle.dealer_index, me)?;
        let raw = open(self.config.longterm.secret(), &deal.sealed, &aad)?;
        let value = scalar_from_bytes(&raw)?;
        if G2Projective::generator() * value
            != eval_commitment(&bundle.public_commitments, &share_x(me))
        {
            return Err(Error::InvalidShare);
        }
        self.check_resharing(bundle)?;
        Ok((bundle.public_commitments.clone(), value))
    }

    fn check_bundle(&self, bundle: &DealBundle) -> Result<(), Error> {
        if bundle.session_id != self.session_id {
            return Err(Error::InvalidMessage("session id mismatch".into()));
        }
        let dealer = self
            .config
            .old_nodes
            .get(bundle.dealer_index as usize)
            .ok_or_else(|| Error::InvalidMessage(format!("unknown dealer {}", bundle.dealer_index)))?;
        if bundle.deals.len() != self.config.new_nodes.len()
            || bundle.public_commitments.len() != self.config.threshold
        {
            return Err(Error::InvalidMessage("malformed deal bundle".into()));
        }
        if !verify_digest(&bundle.signature, &dealer.validator_key, &bundle_digest(bundle)?) {
            return Err(Error::InvalidSignature);
        }
        Ok(())
    }

    fn check_resharing(&self, bundle: &DealBundle) -> Result<(), Error> {
        if !self.config.is_resharing() {
            return Ok(());
        }
        let expected = eval_commitment(&self.config.public_coeffs, &share_x(bundle.dealer_index));
        if bundle.public_commitments[0] != expected {
            return Err(Error::InvalidShare);
        }
        Ok(())
    }
}

fn session_id(config: &DkgConfig) -> Result<[u8; 32], Error> {
    let mut hasher = Hasher::new();
    hasher.update(DST_SESSION);
    hasher.update(&config.epoch.to_be_bytes());
    hasher.update(&(config.threshold as u64).to_be_bytes());
    hasher.update(&(config.old_threshold as u64).to_be_bytes());
    for node in config.old_nodes.iter() {
        hasher.update(&enc_bytes(node.validator_key.as_bytes())?);
    }
    hasher.update(b"|");
    for node in config.new_nodes.iter() {
        hasher.update(&enc_bytes(node.validator_key.as_bytes())?);
    }
    for c in config.public_coeffs.iter() {
        hasher.update(&g2_to_bytes(c));
    }
    match &config.prior_key {
        Some(key) => {
            hasher.update(&[1]);
            hasher.update(key.as_bytes());
        }
        None => {
            hasher.update(&[0]);
        }
    }
    Ok(*hasher.finalize().as_bytes())
}

/// Associated data binding a sealed deal to its round, dealer and recipient.
pub fn deal_aad(session_id: &[u8; 32], dealer: u32, share_index: u32) -> Result<Vec<u8>, Error> {
    enc_tuple(&[session_id, &dealer.to_be_bytes(), &share_index.to_be_bytes()])
}

fn bundle_digest(bundle: &DealBundle) -> Result<[u8; 32], Error> {
    let mut hasher = Hasher::new();
    hasher.update(DST_DEAL);
    hasher.update(&bundle.dealer_index.to_be_bytes());
    hasher.update(&bundle.session_id);
    for c in bundle.public_commitments.iter() {
        hasher.update(&g2_to_bytes(c));
    }
    for deal in bundle.deals.iter() {
        hasher.update(&deal.share_index.to_be_bytes());
        hasher.update(&g2_to_bytes(&deal.sealed.ephemeral));
        hasher.update(&deal.sealed.nonce);
        hasher.update(&enc_bytes(&deal.sealed.ciphertext)?);
    }
    Ok(*hasher.finalize().as_bytes())
}

fn response_digest(bundle: &ResponseBundle) -> Result<[u8; 32], Error> {
    let mut hasher = Hasher::new();
    hasher.update(DST_RESPONSE);
    hasher.update(&bundle.share_index.to_be_bytes());
    hasher.update(&bundle.session_id);
    for r in bundle.responses.iter() {
        hasher.update(&r.dealer_index.to_be_bytes());
        hasher.update(&[matches!(r.status, Status::Complaint) as u8]);
    }
    Ok(*hasher.finalize().as_bytes())
}
