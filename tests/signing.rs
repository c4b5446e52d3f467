mod common;

use secret_committee::chain::{self, ChainCall, MainChain, MemoryChain};
use secret_committee::committee::StagedCommittee;
use secret_committee::signer::{SigningContext, ThresholdSigner, verify_signature};
use secret_committee::sponsor::{Admission, NewEpochPartial, SponsorAggregator};
use secret_committee::types::Error;

use common::{Cluster, members};

/// Committee of `n` after a clean epoch 1 round.
fn committee(n: usize, seed: u64) -> Cluster {
    let mut cluster = Cluster::new(members(n, seed));
    let all: Vec<usize> = (0..n).collect();
    let validators = cluster.validators(&all);
    for i in 0..n {
        cluster
            .trigger(i, 1, validators.clone(), 10 + i as i64)
            .expect("trigger");
    }
    cluster.run();
    cluster
}

fn signers(cluster: &Cluster) -> Vec<ThresholdSigner> {
    cluster
        .nodes
        .iter()
        .map(|n| n.signer().expect("signer"))
        .collect()
}

#[test]
fn combine_needs_more_than_threshold_partials() {
    let cluster = committee(4, 30);
    let signers = signers(&cluster);
    let context = cluster.nodes[0].signing_context().expect("context");
    assert_eq!(context.threshold, 2);

    let msg = b"next epoch";
    let partials: Vec<_> = signers.iter().map(|s| s.partial_sign(msg)).collect();
    for k in 0..=context.threshold {
        let err = context.combine(msg, &partials[..k]).unwrap_err();
        assert_eq!(
            err,
            Error::InsufficientPartialSignatures {
                got: k,
                threshold: 2
            }
        );
    }
    let signature = context.combine(msg, &partials[1..]).expect("combine");
    assert!(context.verify(msg, &signature));
    assert!(verify_signature(&context.public_key, msg, &signature));
    assert!(!context.verify(b"other", &signature));

    // Any qualifying subset yields the same signature.
    let other = context.combine(msg, &partials[..3]).expect("combine");
    assert_eq!(signature, other);
}

#[test]
fn bad_and_duplicate_partials_are_skipped() {
    let cluster = committee(4, 31);
    let signers = signers(&cluster);
    let context = cluster.nodes[0].signing_context().expect("context");
    let msg = b"payload";

    let mut forged = signers[3].partial_sign(msg);
    forged.share.value = signers[3].partial_sign(b"different").share.value;
    assert_eq!(context.verify_partial(msg, &forged), Err(Error::InvalidSignature));

    let mut wrong_session = signers[2].partial_sign(msg);
    wrong_session.session_id = [0u8; 32];
    assert!(matches!(
        context.verify_partial(msg, &wrong_session),
        Err(Error::InvalidMessage(_))
    ));

    let p0 = signers[0].partial_sign(msg);
    let p1 = signers[1].partial_sign(msg);
    let partials = vec![p0.clone(), p0.clone(), p1.clone(), forged, wrong_session];
    let err = context.combine(msg, &partials).unwrap_err();
    assert_eq!(
        err,
        Error::InsufficientPartialSignatures {
            got: 2,
            threshold: 2
        }
    );

    let mut partials = vec![p0, p1];
    partials.push(signers[2].partial_sign(msg));
    assert!(context.combine(msg, &partials).is_ok());
}

#[test]
fn partial_signatures_are_deterministic() {
    let cluster = committee(3, 32);
    let signer = cluster.nodes[1].signer().expect("signer");
    assert_eq!(signer.partial_sign(b"m"), signer.partial_sign(b"m"));
    assert_eq!(signer.index(), 1);
}

#[test]
fn staged_share_takes_precedence() {
    let small = committee(3, 33);
    let large = committee(4, 34);
    let next = large.nodes[0].state().current.clone();

    let mut state = small.nodes[0].state().clone();
    state.staged_next = Some(StagedCommittee {
        nodes: next.nodes.clone(),
        epoch: 2,
        public_key: next.public_key,
        commitments: next.commitments.clone(),
        key_share: next.key_share.clone(),
        sponsor: None,
        sponsor_time: 0,
    });
    let keypair = large.members[0].keypair.clone();
    let signer = ThresholdSigner::from_state(&state, keypair).expect("signer");
    assert_eq!(signer.context().epoch, 2);
    assert_eq!(Some(signer.public_key()), next.public_key);

    // Verification still runs against the committed key.
    let current = SigningContext::current(&state).expect("context");
    assert_eq!(current.epoch, 1);
    assert_eq!(Some(current.public_key), small.nodes[0].public_key());
}

#[test]
fn signer_requires_a_share() {
    let cluster = Cluster::new(members(3, 35));
    let err = cluster.nodes[0].signer().unwrap_err();
    assert_eq!(err, Error::NotInitialized);
    assert_eq!(
        cluster.nodes[0].signing_context().unwrap_err(),
        Error::NotInitialized
    );
}

async fn sign_round(
    chain: &MemoryChain,
    aggregator: &mut SponsorAggregator,
    signers: &[ThresholdSigner],
    call: &ChainCall,
    sponsor_time: i64,
) -> Vec<Option<secret_committee::sponsor::Aggregate>> {
    let account = signers[0].public_key();
    let payload = chain
        .signing_payload(call.call(), &account)
        .await
        .expect("payload");
    let mut out = Vec::new();
    for signer in signers {
        let partial = chain::partial_sign(chain, signer, call)
            .await
            .expect("partial");
        let msg = NewEpochPartial {
            epoch: 1,
            sponsor_time,
            call: call.clone(),
            partial,
        };
        out.push(
            aggregator
                .receive_partial_signature(&payload, msg)
                .expect("receive"),
        );
    }
    out
}

#[tokio::test]
async fn sponsor_registers_then_designates() {
    let cluster = committee(4, 36);
    let signers = signers(&cluster);
    let context = cluster.nodes[0].signing_context().expect("context");
    let account = context.public_key;
    let chain = MemoryChain::new();
    let mut aggregator = SponsorAggregator::new();
    assert!(aggregator.begin(context, 10).is_empty());
    assert_eq!(aggregator.pending(), Some((1, 10)));

    let call = chain::next_epoch_call(&chain, 100, &account)
        .await
        .expect("call");
    assert!(matches!(call, ChainCall::RegisterKey { .. }));
    let results = sign_round(&chain, &mut aggregator, &signers, &call, 10).await;
    assert!(results[0].is_none() && results[1].is_none());
    assert!(results[3].is_none());
    let aggregate = results[2].clone().expect("aggregate");
    assert_eq!(aggregate.account, account);
    chain
        .sign_and_submit(aggregate.call.call(), &account, &aggregate.signature)
        .await
        .expect("register");
    assert!(chain.account_is_registered(&account).await.expect("query"));

    let call = chain::next_epoch_call(&chain, 100, &account)
        .await
        .expect("call");
    assert_eq!(
        call,
        ChainCall::SetNextEpoch {
            node_id: 100,
            call: chain
                .build_set_next_epoch_call(100, &account)
                .await
                .expect("build"),
        }
    );
    let results = sign_round(&chain, &mut aggregator, &signers, &call, 10).await;
    let aggregate = results[2].clone().expect("aggregate");
    chain
        .sign_and_submit(aggregate.call.call(), &account, &aggregate.signature)
        .await
        .expect("designate");
    aggregator.finish(1, 10);
    assert_eq!(aggregator.pending(), None);

    assert_eq!(chain.designations(), vec![100]);
    let submitted = chain.submitted();
    assert!(matches!(submitted[0], ChainCall::RegisterKey { .. }));
    assert!(matches!(submitted[1], ChainCall::SetNextEpoch { node_id: 100, .. }));
}

#[tokio::test]
async fn designation_before_registration_is_refused() {
    let cluster = committee(3, 37);
    let signers = signers(&cluster);
    let context = cluster.nodes[0].signing_context().expect("context");
    let account = context.public_key;
    let chain = MemoryChain::new();
    let call = ChainCall::SetNextEpoch {
        node_id: 7,
        call: chain
            .build_set_next_epoch_call(7, &account)
            .await
            .expect("build"),
    };
    let payload = chain
        .signing_payload(call.call(), &account)
        .await
        .expect("payload");
    let partials: Vec<_> = signers.iter().map(|s| s.partial_sign(&payload)).collect();
    let signature = context.combine(&payload, &partials).expect("combine");
    let err = chain
        .sign_and_submit(call.call(), &account, &signature)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Chain(_)));
    assert!(chain.designations().is_empty());
}

#[tokio::test]
async fn early_partials_wait_and_stale_ones_drop() {
    let cluster = committee(3, 38);
    let signers = signers(&cluster);
    let context = cluster.nodes[0].signing_context().expect("context");
    let account = context.public_key;
    let chain = MemoryChain::new();
    let call = chain::next_epoch_call(&chain, 100, &account)
        .await
        .expect("call");
    let partial = chain::partial_sign(&chain, &signers[1], &call)
        .await
        .expect("partial");
    let payload = chain
        .signing_payload(call.call(), &account)
        .await
        .expect("payload");

    let mut aggregator = SponsorAggregator::new();
    let early = NewEpochPartial {
        epoch: 1,
        sponsor_time: 50,
        call: call.clone(),
        partial: partial.clone(),
    };
    assert_eq!(aggregator.admission(&early), Admission::Early);
    assert_eq!(
        aggregator
            .receive_partial_signature(&payload, early.clone())
            .expect("buffer"),
        None
    );

    let replayed = aggregator.begin(context.clone(), 50);
    assert_eq!(replayed, vec![early.clone()]);
    assert_eq!(aggregator.admission(&early), Admission::Current(account));

    let stale = NewEpochPartial {
        sponsor_time: 40,
        ..early
    };
    assert_eq!(aggregator.admission(&stale), Admission::Stale);
    assert_eq!(
        aggregator
            .receive_partial_signature(&payload, stale)
            .expect("drop"),
        None
    );
}
