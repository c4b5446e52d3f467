//! Async runtime of one committee node.
//!
//! Inbound messages are persisted to the mailbox and handled one at a time
//! by its consumer. Re-encryption replies bypass the mailbox and go straight
//! to the waiting request so a pending wait never blocks the consumer.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex as SyncMutex;
use rand_core::OsRng;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bls::Keypair;
use crate::chain::{ChainCall, MainChain, next_epoch_call, partial_sign};
use crate::committee::{CommitteeState, DistKeyShare, Validator};
use crate::config::Config;
use crate::consensus::{ConsensusEvent, ConsensusSuccess, Dkg, Step};
use crate::mailbox::Mailbox;
use crate::message::{Destination, Message, Payload, ReencryptRequest, ReencryptResponse};
use crate::pre::{EncryptedSecret, ReencryptedCommitment, ReencryptedShare, recover, reencrypt, verify_share};
use crate::signer::ThresholdSigner;
use crate::sponsor::{Admission, Aggregate, NewEpochMessage, NewEpochPartial, SponsorAggregator};
use crate::store::Store;
use crate::transport::PeerTransport;
use crate::types::{Error, NodeId, PublicKey, Result};

pub type SuccessCallback = Arc<dyn Fn(&ConsensusSuccess) + Send + Sync>;
pub type FailureCallback = Arc<dyn Fn(u32, &Error) + Send + Sync>;
pub type DesignatedCallback = Arc<dyn Fn(u32, NodeId) + Send + Sync>;

#[derive(Clone, Default)]
pub struct Callbacks {
    on_success: Option<SuccessCallback>,
    on_failure: Option<FailureCallback>,
    on_designated: Option<DesignatedCallback>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called on every node once a round succeeds, with a signer bound to
    /// the new key and the sponsor of the transition.
    pub fn on_success(mut self, f: impl Fn(&ConsensusSuccess) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(f));
        self
    }

    pub fn on_failure(mut self, f: impl Fn(u32, &Error) + Send + Sync + 'static) -> Self {
        self.on_failure = Some(Arc::new(f));
        self
    }

    /// Called on the sponsor once the designation has been submitted.
    pub fn on_designated(mut self, f: impl Fn(u32, NodeId) + Send + Sync + 'static) -> Self {
        self.on_designated = Some(Arc::new(f));
        self
    }
}

struct Inner {
    config: Config,
    me: Validator,
    transport: Arc<dyn PeerTransport>,
    chain: Arc<dyn MainChain>,
    mailbox: Mailbox<Message>,
    dkg: Mutex<Dkg>,
    sponsor: Mutex<SponsorAggregator>,
    last_success: Mutex<Option<ConsensusSuccess>>,
    pending: SyncMutex<HashMap<String, mpsc::UnboundedSender<ReencryptResponse>>>,
    callbacks: Callbacks,
    timeouts: mpsc::UnboundedSender<u64>,
    timeout_rx: SyncMutex<Option<mpsc::UnboundedReceiver<u64>>>,
    tasks: SyncMutex<Vec<JoinHandle<()>>>,
    next_request: AtomicU64,
}

#[derive(Clone)]
pub struct DkgNode {
    inner: Arc<Inner>,
}

impl DkgNode {
    pub fn new(
        me: Validator,
        keypair: Keypair,
        config: Config,
        store: Arc<dyn Store>,
        transport: Arc<dyn PeerTransport>,
        chain: Arc<dyn MainChain>,
        callbacks: Callbacks,
    ) -> Result<Self> {
        config.validate()?;
        let dkg = Dkg::load(me.clone(), keypair, store.clone(), &config)?;
        let mailbox = Mailbox::new(store, config.storage_namespace.clone(), config.mailbox_key.clone());
        let (timeouts, timeout_rx) = mpsc::unbounded_channel();
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                me,
                transport,
                chain,
                mailbox,
                dkg: Mutex::new(dkg),
                sponsor: Mutex::new(SponsorAggregator::new()),
                last_success: Mutex::new(None),
                pending: SyncMutex::new(HashMap::new()),
                callbacks,
                timeouts,
                timeout_rx: SyncMutex::new(Some(timeout_rx)),
                tasks: SyncMutex::new(Vec::new()),
                next_request: AtomicU64::new(0),
            }),
        })
    }

    pub fn me(&self) -> &Validator {
        &self.inner.me
    }

    /// Subscribe to the transport and start the mailbox consumer. Messages
    /// left in the mailbox by a previous run are handled first.
    pub async fn start(&self) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        self.inner.transport.subscribe(&self.inner.config.topic, tx).await?;

        let inner = self.inner.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                inner.route(msg);
            }
        });

        let consumer = self.inner.clone();
        self.inner.mailbox.start(move |msg: Message| {
            let inner = consumer.clone();
            async move { inner.dispatch(msg).await }
        });

        let timeout_rx = self.inner.timeout_rx.lock().take();
        let mut tasks = vec![forwarder];
        if let Some(mut timeouts) = timeout_rx {
            let inner = self.inner.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(seq) = timeouts.recv().await {
                    inner.round_timeout(seq).await;
                }
            }));
        }
        self.inner.tasks.lock().extend(tasks);
        info!(node = self.inner.me.node_id, "node started");
        Ok(())
    }

    pub fn stop(&self) {
        self.inner.mailbox.stop();
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        info!(node = self.inner.me.node_id, "node stopped");
    }

    /// Trigger the round for `epoch`. Busy and stale triggers are returned
    /// to the caller without invoking the failure callback.
    pub async fn try_consensus(&self, epoch: u32, validators: Vec<Validator>) -> Result<()> {
        let inner = &self.inner;
        let available = inner.transport.available_nodes().await?;
        let (result, round) = {
            let mut dkg = inner.dkg.lock().await;
            let result = dkg.try_consensus(epoch, validators, &available, now_millis());
            (result, dkg.active_round())
        };
        match result {
            Ok(step) => {
                if let Some((_, seq)) = round {
                    inner.arm_timer(seq);
                }
                inner.apply(step).await;
                Ok(())
            }
            Err(err) => {
                if !err.is_guard() {
                    inner.notify_failure(epoch, &err);
                }
                Err(err)
            }
        }
    }

    /// Collect verified re-encrypted shares of `secret` for `requester` from
    /// the committee and interpolate them. Waits at most the configured
    /// request timeout.
    pub async fn request_reencryption(
        &self,
        secret: &EncryptedSecret,
        requester: &PublicKey,
    ) -> Result<ReencryptedCommitment> {
        let inner = &self.inner;
        let (context, own_share) = {
            let dkg = inner.dkg.lock().await;
            (dkg.signing_context()?, dkg.key_share().cloned())
        };
        let threshold = context.threshold;
        let msg_id = format!(
            "{}-{}",
            inner.me.p2p_key,
            inner.next_request.fetch_add(1, Ordering::Relaxed)
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        inner.pending.lock().insert(msg_id.clone(), tx);

        let peers: Vec<PublicKey> = context
            .nodes
            .iter()
            .map(|v| v.p2p_key)
            .filter(|k| *k != inner.me.p2p_key)
            .collect();
        let request = Message::new(
            inner.me.p2p_key,
            Destination::Nodes(peers.clone()),
            Payload::Reencrypt(ReencryptRequest {
                secret: secret.clone(),
                requester: *requester,
            }),
        )
        .with_msg_id(msg_id.clone());
        if let Err(err) = inner.transport.send(Destination::Nodes(peers), request).await {
            inner.pending.lock().remove(&msg_id);
            return Err(err);
        }

        let mut shares: Vec<ReencryptedShare> = Vec::with_capacity(threshold);
        if let Some(key_share) = own_share {
            shares.push(reencrypt(&key_share.share, secret, requester, &mut OsRng)?);
        }
        let collect = async {
            while shares.len() < threshold {
                let Some(response) = rx.recv().await else {
                    break;
                };
                let Some(share) = response.share else {
                    continue;
                };
                match verify_share(&context.commitments, secret, requester, &share) {
                    Ok(()) if !shares.iter().any(|s| s.index == share.index) => shares.push(share),
                    Ok(()) => {}
                    Err(err) => warn!(index = share.index, %err, "excluding re-encrypted share"),
                }
            }
        };
        let outcome = tokio::time::timeout(inner.config.request_timeout(), collect).await;
        inner.pending.lock().remove(&msg_id);

        if shares.len() < threshold {
            return Err(match outcome {
                Err(_) => Error::TimeoutWaitingForQuorum,
                Ok(()) => Error::InsufficientShares {
                    got: shares.len(),
                    required: threshold,
                },
            });
        }
        recover(&shares, threshold, context.nodes.len())
    }

    pub async fn state(&self) -> CommitteeState {
        self.inner.dkg.lock().await.state().clone()
    }

    pub async fn public_key(&self) -> Option<PublicKey> {
        self.inner.dkg.lock().await.public_key()
    }

    pub async fn key_share(&self) -> Option<DistKeyShare> {
        self.inner.dkg.lock().await.key_share().cloned()
    }

    pub async fn signer(&self) -> Result<ThresholdSigner> {
        self.inner.dkg.lock().await.signer()
    }

    pub async fn active_round(&self) -> Option<(u32, u64)> {
        self.inner.dkg.lock().await.active_round()
    }

    /// Messages persisted but not yet consumed.
    pub fn backlog(&self) -> Result<usize> {
        self.inner.mailbox.len()
    }
}

impl Inner {
    fn route(&self, msg: Message) {
        if let Payload::ReencryptResp(response) = &msg.payload {
            self.route_response(msg.msg_id.as_deref(), response.clone());
            return;
        }
        if let Err(err) = self.mailbox.push(msg) {
            error!(%err, "could not persist inbound message");
        }
    }

    fn route_response(&self, msg_id: Option<&str>, response: ReencryptResponse) {
        let Some(id) = msg_id else {
            debug!("re-encryption response without request id");
            return;
        };
        match self.pending.lock().get(id) {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => debug!(msg_id = id, "late re-encryption response"),
        }
    }

    async fn dispatch(&self, msg: Message) -> Result<()> {
        let Message {
            from,
            payload,
            msg_id,
            error,
            ..
        } = msg;
        debug!(kind = payload.kind(), from = %from, "dispatching");
        if let Some(reason) = error {
            debug!(from = %from, %reason, "peer reported an error");
        }
        match payload {
            Payload::Consensus(_) | Payload::Deal(_) | Payload::DealResp(_) => {
                self.handle_consensus(&from, payload).await
            }
            Payload::ConsensusToNewepoch(msg) => {
                self.handle_new_epoch(msg).await;
                Ok(())
            }
            Payload::Reencrypt(request) => self.serve_reencrypt(from, request, msg_id).await,
            Payload::ReencryptResp(response) => {
                self.route_response(msg_id.as_deref(), response);
                Ok(())
            }
        }
    }

    async fn handle_consensus(&self, from: &PublicKey, payload: Payload) -> Result<()> {
        let available = self.transport.available_nodes().await?;
        let (result, started) = {
            let mut dkg = self.dkg.lock().await;
            let before = dkg.active_round();
            let result = dkg.handle_message(from, payload, &available);
            let after = dkg.active_round();
            (result, if after != before { after } else { None })
        };
        if let Some((_, seq)) = started {
            self.arm_timer(seq);
        }
        match result {
            Ok(step) => {
                self.apply(step).await;
                Ok(())
            }
            Err(err) if err.is_guard() => {
                debug!(%err, "consensus message ignored");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn round_timeout(&self, seq: u64) {
        let step = self.dkg.lock().await.on_round_timeout(seq);
        self.apply(step).await;
    }

    fn arm_timer(&self, seq: u64) {
        let tx = self.timeouts.clone();
        let after = self.config.round_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(seq);
        });
    }

    async fn apply(&self, step: Step) {
        for outbound in step.outbound {
            let to = Destination::Nodes(outbound.to);
            let message = Message::new(self.me.p2p_key, to.clone(), outbound.payload);
            if let Err(err) = self.transport.send(to, message).await {
                warn!(%err, "send failed");
            }
        }
        for event in step.events {
            match event {
                ConsensusEvent::Succeeded(success) => self.on_consensus_success(success).await,
                ConsensusEvent::Failed { epoch, error } => self.notify_failure(epoch, &error),
            }
        }
    }

    fn notify_failure(&self, epoch: u32, err: &Error) {
        warn!(epoch, %err, "consensus failed");
        if let Some(callback) = &self.callbacks.on_failure {
            callback(epoch, err);
        }
    }

    async fn on_consensus_success(&self, success: ConsensusSuccess) {
        if let Some(callback) = &self.callbacks.on_success {
            callback(&success);
        }
        *self.last_success.lock().await = Some(success.clone());
        let Some(sponsor) = success.sponsor.clone() else {
            return;
        };
        if sponsor.p2p_key == self.me.p2p_key {
            let early = self
                .sponsor
                .lock()
                .await
                .begin(success.context.clone(), success.sponsor_time);
            for partial in early {
                self.handle_partial(partial).await;
            }
        }
        self.contribute(&success, &sponsor).await;
    }

    /// Sign the next call of the transition and hand the partial to the sponsor.
    async fn contribute(&self, success: &ConsensusSuccess, sponsor: &Validator) {
        let Some(signer) = &success.signer else {
            return;
        };
        let chain = self.chain.as_ref();
        let partial = async {
            let call = next_epoch_call(chain, sponsor.node_id, &success.context.public_key).await?;
            let partial = partial_sign(chain, signer, &call).await?;
            Ok::<_, Error>(NewEpochPartial {
                epoch: success.epoch,
                sponsor_time: success.sponsor_time,
                call,
                partial,
            })
        }
        .await;
        match partial {
            Ok(partial) => {
                let payload = Payload::ConsensusToNewepoch(NewEpochMessage::Partial(partial));
                self.deliver(sponsor.p2p_key, Message::new(self.me.p2p_key, Destination::Node(sponsor.p2p_key), payload))
                    .await;
            }
            Err(err) => warn!(epoch = success.epoch, %err, "could not sign epoch transition"),
        }
    }

    async fn handle_new_epoch(&self, msg: NewEpochMessage) {
        match msg {
            NewEpochMessage::SignRequest { epoch, sponsor_time } => {
                let success = self.last_success.lock().await.clone();
                match success {
                    Some(success) if success.epoch == epoch && success.sponsor_time == sponsor_time => {
                        if let Some(sponsor) = success.sponsor.clone() {
                            self.contribute(&success, &sponsor).await;
                        }
                    }
                    _ => debug!(epoch, sponsor_time, "sign request for an unknown transition"),
                }
            }
            NewEpochMessage::Partial(partial) => self.handle_partial(partial).await,
        }
    }

    async fn handle_partial(&self, partial: NewEpochPartial) {
        let admission = self.sponsor.lock().await.admission(&partial);
        let payload = match admission {
            Admission::Current(account) => {
                match self.chain.signing_payload(partial.call.call(), &account).await {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(%err, "no signing payload for transition call");
                        return;
                    }
                }
            }
            Admission::Early | Admission::Stale => Vec::new(),
        };
        let index = partial.partial.share.index;
        let result = self.sponsor.lock().await.receive_partial_signature(&payload, partial);
        match result {
            Ok(Some(aggregate)) => self.submit(aggregate).await,
            Ok(None) => {}
            Err(err) => warn!(index, %err, "rejected transition partial"),
        }
    }

    async fn submit(&self, aggregate: Aggregate) {
        let epoch = aggregate.epoch;
        if let Err(err) = self
            .chain
            .sign_and_submit(aggregate.call.call(), &aggregate.account, &aggregate.signature)
            .await
        {
            self.notify_failure(epoch, &err);
            return;
        }
        match aggregate.call {
            ChainCall::RegisterKey { .. } => {
                info!(epoch, "committee key registered, requesting designation signatures");
                let nodes = self
                    .last_success
                    .lock()
                    .await
                    .as_ref()
                    .map(|s| s.context.nodes.clone())
                    .unwrap_or_default();
                let request = NewEpochMessage::SignRequest {
                    epoch,
                    sponsor_time: aggregate.sponsor_time,
                };
                for node in nodes {
                    let message = Message::new(
                        self.me.p2p_key,
                        Destination::Node(node.p2p_key),
                        Payload::ConsensusToNewepoch(request.clone()),
                    );
                    self.deliver(node.p2p_key, message).await;
                }
            }
            ChainCall::SetNextEpoch { node_id, .. } => {
                self.sponsor.lock().await.finish(epoch, aggregate.sponsor_time);
                info!(epoch, node_id, "next epoch designation submitted");
                if let Some(callback) = &self.callbacks.on_designated {
                    callback(epoch, node_id);
                }
            }
        }
    }

    async fn serve_reencrypt(&self, from: PublicKey, request: ReencryptRequest, msg_id: Option<String>) -> Result<()> {
        let key_share = self.dkg.lock().await.key_share().cloned();
        let outcome = match key_share {
            Some(key_share) => reencrypt(&key_share.share, &request.secret, &request.requester, &mut OsRng),
            None => Err(Error::NotCommitteeMember),
        };
        let (share, error) = match outcome {
            Ok(share) => (Some(share), None),
            Err(err) => (None, Some(err.to_string())),
        };
        let mut reply = Message::new(
            self.me.p2p_key,
            Destination::Node(from),
            Payload::ReencryptResp(ReencryptResponse { share }),
        );
        reply.msg_id = msg_id;
        reply.error = error;
        self.deliver(from, reply).await;
        Ok(())
    }

    /// Send to one peer; messages to self go through the local mailbox.
    async fn deliver(&self, to: PublicKey, message: Message) {
        if to == self.me.p2p_key {
            self.route(message);
            return;
        }
        if let Err(err) = self.transport.send(Destination::Node(to), message).await {
            warn!(to = %to, %err, "send failed");
        }
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
