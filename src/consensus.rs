//! Epoch coordinator: drives one key generation or resharing round at a
//! time and owns the persisted committee state.
//!
//! The coordinator is synchronous. Every entry point returns a [`Step`]
//! holding the messages to send and the round outcome, so the async node
//! runtime (or a test) decides how they are delivered.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::bls::Keypair;
use crate::committee::{
    CommitteeState, DistKeyShare, StagedCommittee, Validator, position_by_key, position_by_p2p,
    threshold_for,
};
use crate::config::Config;
use crate::dkg::{DealBundle, DistKeyGenerator, DkgConfig, DkgOutput, ResponseBundle};
use crate::message::{ConsensusEnvelope, Payload, ResponseMessage};
use crate::signer::{SigningContext, ThresholdSigner};
use crate::store::{Store, StoreExt};
use crate::types::{Error, PublicKey, Result};

const STATE_KEY: &str = "committee";
const MAX_EARLY_RESPONSES: usize = 256;

/// Messages addressed to explicit peers by `p2p_key`.
#[derive(Clone, Debug)]
pub struct Outbound {
    pub to: Vec<PublicKey>,
    pub payload: Payload,
}

#[derive(Clone, Debug)]
pub struct ConsensusSuccess {
    pub epoch: u32,
    /// `None` when this node is not part of the new committee.
    pub signer: Option<ThresholdSigner>,
    pub context: SigningContext,
    pub sponsor: Option<Validator>,
    pub sponsor_time: i64,
}

#[derive(Clone, Debug)]
pub enum ConsensusEvent {
    Succeeded(ConsensusSuccess),
    Failed { epoch: u32, error: Error },
}

#[derive(Debug, Default)]
pub struct Step {
    pub outbound: Vec<Outbound>,
    pub events: Vec<ConsensusEvent>,
}

impl Step {
    fn send(&mut self, to: Vec<PublicKey>, payload: Payload) {
        if !to.is_empty() {
            self.outbound.push(Outbound { to, payload });
        }
    }
}

struct Round {
    epoch: u32,
    seq: u64,
    generator: DistKeyGenerator,
    dealers: Vec<Validator>,
    recipients: Vec<Validator>,
    quorum: usize,
    deals: BTreeMap<u32, DealBundle>,
    responses: BTreeMap<u32, ResponseBundle>,
    deals_processed: bool,
}

impl Round {
    /// Everyone taking part except this node.
    fn peers(&self, me: &PublicKey) -> Vec<PublicKey> {
        let mut keys: Vec<PublicKey> = self
            .recipients
            .iter()
            .chain(self.dealers.iter())
            .map(|v| v.p2p_key)
            .filter(|k| k != me)
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }
}

pub struct Dkg {
    me: Validator,
    keypair: Keypair,
    store: Arc<dyn Store>,
    namespace: String,
    max_faulty_dealers: usize,
    state: CommitteeState,
    round: Option<Round>,
    early_responses: BTreeMap<u32, Vec<(PublicKey, ResponseBundle)>>,
    next_seq: u64,
}

impl Dkg {
    /// Restore the committee state persisted under the configured namespace.
    /// A round interrupted by a restart cannot resume, so any staged
    /// committee is discarded.
    pub fn load(me: Validator, keypair: Keypair, store: Arc<dyn Store>, config: &Config) -> Result<Self> {
        if me.validator_key != keypair.public() {
            return Err(Error::InvalidParams);
        }
        let mut state: CommitteeState = store
            .get_json(&config.storage_namespace, STATE_KEY)?
            .unwrap_or_default();
        if state.staged_next.take().is_some() {
            warn!("discarding committee staged before restart");
        }
        Ok(Self {
            me,
            keypair,
            store,
            namespace: config.storage_namespace.clone(),
            max_faulty_dealers: config.max_faulty_dealers,
            state,
            round: None,
            early_responses: BTreeMap::new(),
            next_seq: 0,
        })
    }

    pub fn me(&self) -> &Validator {
        &self.me
    }

    pub fn state(&self) -> &CommitteeState {
        &self.state
    }

    pub fn current_epoch(&self) -> u32 {
        self.state.current.epoch
    }

    pub fn public_key(&self) -> Option<PublicKey> {
        self.state.current.public_key
    }

    pub fn key_share(&self) -> Option<&DistKeyShare> {
        self.state.current.key_share.as_ref()
    }

    /// `(epoch, seq)` of the round in flight.
    pub fn active_round(&self) -> Option<(u32, u64)> {
        self.round.as_ref().map(|r| (r.epoch, r.seq))
    }

    pub fn signer(&self) -> Result<ThresholdSigner> {
        ThresholdSigner::from_state(&self.state, self.keypair.clone())
    }

    pub fn signing_context(&self) -> Result<SigningContext> {
        SigningContext::current(&self.state)
    }

    /// Start the round for `epoch` with `validators` as the new committee.
    ///
    /// `available` lists the peers currently reachable; `now` becomes the
    /// sponsor time of this trigger.
    pub fn try_consensus(
        &mut self,
        epoch: u32,
        validators: Vec<Validator>,
        available: &[PublicKey],
        now: i64,
    ) -> Result<Step> {
        if self.round.is_some() {
            return Err(Error::ConsensusBusy);
        }
        self.check_epoch(epoch)?;

        // A trigger leaving the committee hands the sponsorship to the
        // lowest node id of the new one.
        let sponsor = if position_by_key(&validators, &self.me.validator_key).is_some() {
            Some(self.me.clone())
        } else {
            validators.iter().min_by_key(|v| v.node_id).cloned()
        };
        let prior_key = self.state.current.public_key;
        let envelope = if epoch == 1 {
            ConsensusEnvelope {
                epoch,
                consensus_node_count: validators.len(),
                validators,
                old_validators: Vec::new(),
                share_commitments: Vec::new(),
                prior_key,
                deal: None,
                sponsor,
                sponsor_time: now,
            }
        } else {
            let current = &self.state.current;
            if current.public_key.is_none() {
                return Err(Error::NotInitialized);
            }
            ConsensusEnvelope {
                epoch,
                validators,
                old_validators: current.nodes.clone(),
                share_commitments: current.commitments.clone(),
                consensus_node_count: current.nodes.len(),
                prior_key,
                deal: None,
                sponsor,
                sponsor_time: now,
            }
        };

        let relay = envelope.clone();
        let mut step = Step::default();
        self.start_round(envelope, available, &mut step)?;
        if let Some(round) = &self.round {
            let peers = round.peers(&self.me.p2p_key);
            step.outbound.insert(
                0,
                Outbound {
                    to: peers,
                    payload: Payload::Consensus(relay),
                },
            );
        }
        Ok(step)
    }

    /// Feed one peer message. `from` is the sender's `p2p_key`.
    pub fn handle_message(&mut self, from: &PublicKey, payload: Payload, available: &[PublicKey]) -> Result<Step> {
        match payload {
            Payload::Consensus(envelope) => self.handle_consensus(envelope, available),
            Payload::Deal(envelope) => self.handle_deal(from, envelope, available),
            Payload::DealResp(msg) => self.handle_response(from, msg),
            other => Err(Error::InvalidMessage(format!(
                "{} is not a consensus message",
                other.kind()
            ))),
        }
    }

    /// Abort the round `seq` if it is still in flight.
    pub fn on_round_timeout(&mut self, seq: u64) -> Step {
        let mut step = Step::default();
        let Some((epoch, active)) = self.active_round() else {
            return step;
        };
        if active != seq {
            return step;
        }
        self.abort(Error::RoundTimeout(epoch), &mut step);
        step
    }

    /// End the round in flight. On success the staged committee is promoted
    /// and persisted; otherwise it is discarded and `current` is untouched.
    pub fn stop_consensus(&mut self, success: bool) -> Result<()> {
        self.round = None;
        if !success {
            self.state.staged_next = None;
            return Ok(());
        }
        let mut next = self.state.clone();
        if !next.promote() {
            self.state.staged_next = None;
            return Err(Error::NotInitialized);
        }
        self.store.set_json(&self.namespace, STATE_KEY, &next)?;
        self.state = next;
        Ok(())
    }

    fn check_epoch(&self, epoch: u32) -> Result<()> {
        let current = self.state.current.epoch;
        if epoch != 1 && epoch <= current {
            return Err(Error::EpochStale {
                requested: epoch,
                current,
            });
        }
        Ok(())
    }

    /// Guards a round started by a peer: besides the epoch check, an epoch 1
    /// round must build on the key this node has committed, so messages of a
    /// run it already replaced are refused.
    fn check_envelope(&self, envelope: &ConsensusEnvelope) -> Result<()> {
        self.check_epoch(envelope.epoch)?;
        let current = &self.state.current;
        if envelope.epoch == 1 && current.public_key.is_some() && envelope.prior_key != current.public_key {
            return Err(Error::EpochStale {
                requested: envelope.epoch,
                current: current.epoch,
            });
        }
        Ok(())
    }

    /// Start a round on behalf of a peer. Failures past the guards end the
    /// round for this node and are reported as a `Failed` event.
    fn join_round(&mut self, envelope: ConsensusEnvelope, available: &[PublicKey], step: &mut Step) -> Result<()> {
        self.check_envelope(&envelope)?;
        let epoch = envelope.epoch;
        if let Err(error) = self.start_round(envelope, available, step) {
            if error.is_guard() {
                return Err(error);
            }
            warn!(epoch, %error, "could not join consensus round");
            self.round = None;
            self.state.staged_next = None;
            step.events.push(ConsensusEvent::Failed { epoch, error });
        }
        Ok(())
    }

    fn start_round(&mut self, envelope: ConsensusEnvelope, available: &[PublicKey], step: &mut Step) -> Result<()> {
        let epoch = envelope.epoch;
        let fresh = epoch == 1;
        let threshold = threshold_for(envelope.validators.len());
        if threshold == 0 {
            return Err(Error::InvalidParams);
        }
        let reachable = envelope
            .validators
            .iter()
            .filter(|v| v.p2p_key != self.me.p2p_key && available.contains(&v.p2p_key))
            .count();
        if reachable < threshold {
            return Err(Error::InsufficientNodes {
                available: reachable,
                required: threshold,
            });
        }

        let dealers = if fresh {
            envelope.validators.clone()
        } else {
            envelope.old_validators.clone()
        };
        let in_new = position_by_key(&envelope.validators, &self.me.validator_key).is_some();
        let in_old = position_by_key(&dealers, &self.me.validator_key).is_some();
        if !in_new && !in_old {
            return Err(Error::NotCommitteeMember);
        }

        let config = if fresh {
            DkgConfig::fresh(self.keypair.clone(), envelope.validators.clone(), epoch)
        } else {
            let share = if in_old {
                self.state.current.key_share.clone()
            } else {
                None
            };
            DkgConfig::reshare(
                self.keypair.clone(),
                dealers.clone(),
                envelope.validators.clone(),
                share,
                envelope.share_commitments.clone(),
                epoch,
            )
        }
        .with_prior_key(envelope.prior_key)
        .with_max_faulty_dealers(self.max_faulty_dealers);
        let generator = DistKeyGenerator::new(config)?;

        let bundle = generator.deal_bundle()?;

        let seq = self.next_seq;
        self.next_seq += 1;
        let mut staged = StagedCommittee {
            nodes: envelope.validators.clone(),
            epoch,
            ..StagedCommittee::default()
        };
        staged.adopt_sponsor(envelope.sponsor.as_ref(), envelope.sponsor_time);
        self.state.staged_next = Some(staged);

        let quorum = if fresh {
            envelope.validators.len()
        } else {
            envelope.consensus_node_count
        };
        info!(
            epoch,
            seq,
            nodes = envelope.validators.len(),
            threshold,
            resharing = !fresh,
            "consensus round started"
        );
        let round = Round {
            epoch,
            seq,
            dealers,
            recipients: envelope.validators.clone(),
            quorum,
            generator,
            deals: BTreeMap::new(),
            responses: BTreeMap::new(),
            deals_processed: false,
        };
        let peers = round.peers(&self.me.p2p_key);
        self.round = Some(round);

        if let Some(bundle) = bundle {
            let mut deal = envelope;
            deal.deal = Some(bundle.clone());
            if let Some(staged) = &self.state.staged_next {
                deal.sponsor = staged.sponsor.clone();
                deal.sponsor_time = staged.sponsor_time;
            }
            step.send(peers, Payload::Deal(deal));
            self.accept_deal(bundle, step);
        }

        let buffered = self.early_responses.remove(&epoch).unwrap_or_default();
        self.early_responses.retain(|e, _| *e > epoch);
        for (from, bundle) in buffered {
            self.accept_response(&from, bundle, step);
        }
        Ok(())
    }

    fn handle_consensus(&mut self, envelope: ConsensusEnvelope, available: &[PublicKey]) -> Result<Step> {
        let mut step = Step::default();
        if let Some(round) = &self.round {
            if round.epoch != envelope.epoch {
                return Err(Error::ConsensusBusy);
            }
            if round.generator.config().prior_key != envelope.prior_key {
                debug!(epoch = envelope.epoch, "dropping relay built on another committed key");
                return Ok(step);
            }
            self.adopt_sponsor(&envelope);
            return Ok(step);
        }
        let mut envelope = envelope;
        envelope.deal = None;
        self.join_round(envelope, available, &mut step)?;
        Ok(step)
    }

    fn handle_deal(&mut self, from: &PublicKey, envelope: ConsensusEnvelope, available: &[PublicKey]) -> Result<Step> {
        let mut step = Step::default();
        let Some(bundle) = envelope.deal.clone() else {
            return Err(Error::InvalidMessage("deal message without a bundle".into()));
        };
        if self.round.is_none() {
            let mut start = envelope.clone();
            start.deal = None;
            self.join_round(start, available, &mut step)?;
        }
        let Some(round) = &self.round else {
            return Ok(step);
        };
        if round.epoch != envelope.epoch {
            debug!(epoch = envelope.epoch, active = round.epoch, "dropping deal for another epoch");
            return Ok(step);
        }
        let Some(dealer) = position_by_p2p(&round.dealers, from) else {
            return Err(Error::InvalidMessage(format!("deal from non-dealer {from}")));
        };
        if bundle.dealer_index != dealer as u32 {
            return Err(Error::InvalidMessage(format!(
                "dealer {from} claims index {}",
                bundle.dealer_index
            )));
        }
        if &bundle.session_id != round.generator.session_id() {
            debug!(from = %from, "dropping deal from another session");
            return Ok(step);
        }
        self.adopt_sponsor(&envelope);
        self.accept_deal(bundle, &mut step);
        Ok(step)
    }

    fn handle_response(&mut self, from: &PublicKey, msg: ResponseMessage) -> Result<Step> {
        let mut step = Step::default();
        match &self.round {
            Some(round) if round.epoch == msg.epoch => {
                self.accept_response(from, msg.bundle, &mut step);
            }
            Some(round) if msg.epoch < round.epoch => {
                debug!(epoch = msg.epoch, "dropping stale response");
            }
            _ if msg.epoch <= self.state.current.epoch && msg.epoch != 1 => {
                debug!(epoch = msg.epoch, "dropping stale response");
            }
            _ => {
                let early = self.early_responses.entry(msg.epoch).or_default();
                if early.len() < MAX_EARLY_RESPONSES {
                    early.push((*from, msg.bundle));
                }
            }
        }
        Ok(step)
    }

    fn adopt_sponsor(&mut self, envelope: &ConsensusEnvelope) {
        if let Some(staged) = self.state.staged_next.as_mut() {
            if staged.adopt_sponsor(envelope.sponsor.as_ref(), envelope.sponsor_time) {
                debug!(epoch = envelope.epoch, sponsor_time = envelope.sponsor_time, "sponsor updated");
            }
        }
    }

    fn accept_deal(&mut self, bundle: DealBundle, step: &mut Step) {
        let me = self.me.p2p_key;
        let Some(round) = self.round.as_mut() else {
            return;
        };
        if round.deals_processed {
            debug!(dealer = bundle.dealer_index, "late deal ignored");
            return;
        }
        round.deals.insert(bundle.dealer_index, bundle);
        if round.deals.len() < round.quorum {
            return;
        }
        round.deals_processed = true;
        let bundles: Vec<DealBundle> = round.deals.values().cloned().collect();

        if !round.generator.is_recipient() {
            round.generator.record_public(&bundles);
            self.try_resolve(step);
            return;
        }
        match round.generator.process_deals(&bundles) {
            Ok(response) => {
                let epoch = round.epoch;
                step.send(
                    round.peers(&me),
                    Payload::DealResp(ResponseMessage {
                        epoch,
                        bundle: response.clone(),
                    }),
                );
                self.accept_response(&me, response, step);
            }
            Err(err) => {
                let err = match err {
                    Error::TooManyFaultyDealers(n) => Error::TooManyFaultyDealers(n),
                    other => Error::ProcessDealsFailed(other.to_string()),
                };
                self.abort(err, step);
            }
        }
    }

    fn accept_response(&mut self, from: &PublicKey, bundle: ResponseBundle, step: &mut Step) {
        let Some(round) = self.round.as_mut() else {
            return;
        };
        let Some(index) = position_by_p2p(&round.recipients, from) else {
            warn!(from = %from, "response from outside the new committee");
            return;
        };
        if bundle.share_index != index as u32 {
            warn!(from = %from, claimed = bundle.share_index, "response with wrong share index");
            return;
        }
        if &bundle.session_id != round.generator.session_id() {
            debug!(from = %from, "dropping response from another session");
            return;
        }
        round.responses.insert(bundle.share_index, bundle);
        self.try_resolve(step);
    }

    fn try_resolve(&mut self, step: &mut Step) {
        let Some(round) = self.round.as_ref() else {
            return;
        };
        if !round.deals_processed || round.responses.len() < round.recipients.len() {
            return;
        }
        let responses: Vec<ResponseBundle> = round.responses.values().cloned().collect();
        match round.generator.process_responses(&responses) {
            Ok(output) => self.complete(output, step),
            Err(err) => {
                let err = match err {
                    Error::JustificationRequired => Error::JustificationRequired,
                    Error::ProcessResponsesFailed(reason) => Error::ProcessResponsesFailed(reason),
                    other => Error::ProcessResponsesFailed(other.to_string()),
                };
                self.abort(err, step);
            }
        }
    }

    fn complete(&mut self, output: DkgOutput, step: &mut Step) {
        let Some(mut staged) = self.state.staged_next.take() else {
            self.round = None;
            return;
        };
        let epoch = staged.epoch;
        staged.public_key = Some(output.public_key);
        staged.commitments = output.commitments;
        staged.key_share = output.key_share;
        let sponsor = staged.sponsor.clone();
        let sponsor_time = staged.sponsor_time;
        self.state.staged_next = Some(staged);

        if let Err(err) = self.stop_consensus(true) {
            self.abort(err, step);
            return;
        }
        let context = match SigningContext::current(&self.state) {
            Ok(context) => context,
            Err(err) => {
                step.events.push(ConsensusEvent::Failed { epoch, error: err });
                return;
            }
        };
        let signer = self.signer().ok();
        info!(
            epoch,
            public_key = %output.public_key,
            qual = output.qual.len(),
            member = signer.is_some(),
            "consensus round succeeded"
        );
        step.events.push(ConsensusEvent::Succeeded(ConsensusSuccess {
            epoch,
            signer,
            context,
            sponsor,
            sponsor_time,
        }));
    }

    fn abort(&mut self, error: Error, step: &mut Step) {
        let epoch = self
            .round
            .as_ref()
            .map(|r| r.epoch)
            .or_else(|| self.state.staged_next.as_ref().map(|s| s.epoch))
            .unwrap_or(self.state.current.epoch);
        warn!(epoch, %error, "consensus round aborted");
        self.round = None;
        self.state.staged_next = None;
        step.events.push(ConsensusEvent::Failed { epoch, error });
    }
}
