mod common;

use blstrs::G2Projective;
use group::Group;
use secret_committee::consensus::Dkg;
use secret_committee::config::Config;
use secret_committee::dkg::{DealBundle, DistKeyGenerator, DkgConfig};
use secret_committee::message::{Destination, Message, Payload, ReencryptResponse, ResponseMessage};
use secret_committee::store::{MemoryStore, Store};
use secret_committee::types::Error;
use serde_json::Value;
use std::sync::Arc;

use common::{Cluster, members};

fn bundles(cluster_members: &[common::Member]) -> (Vec<DistKeyGenerator>, Vec<DealBundle>) {
    let validators: Vec<_> = cluster_members.iter().map(|m| m.validator.clone()).collect();
    let gens: Vec<DistKeyGenerator> = cluster_members
        .iter()
        .map(|m| {
            DistKeyGenerator::new(DkgConfig::fresh(m.keypair.clone(), validators.clone(), 1))
                .expect("generator")
        })
        .collect();
    let bundles = gens
        .iter()
        .map(|g| g.deal_bundle().expect("deal").expect("dealer"))
        .collect();
    (gens, bundles)
}

#[test]
fn wire_tags_use_snake_case() {
    let members = members(3, 70);
    let (mut gens, bundles) = bundles(&members);
    let response = gens[0].process_deals(&bundles).expect("process deals");
    let msg = Message::new(
        members[0].validator.p2p_key,
        Destination::Node(members[1].validator.p2p_key),
        Payload::DealResp(ResponseMessage {
            epoch: 1,
            bundle: response,
        }),
    )
    .with_msg_id("r-1");
    let raw = msg.to_json().expect("encode");
    let value: Value = serde_json::from_slice(&raw).expect("json");
    assert_eq!(value["type"], "deal_resp");
    assert_eq!(value["to"]["kind"], "node");
    assert_eq!(value["msg_id"], "r-1");
    assert!(value.get("error").is_none());
    assert_eq!(Message::from_json(&raw).expect("decode"), msg);

    let reply = Message::new(
        members[1].validator.p2p_key,
        Destination::All,
        Payload::ReencryptResp(ReencryptResponse { share: None }),
    )
    .with_error("this node holds no share of the committee key");
    let value: Value = serde_json::from_slice(&reply.to_json().expect("encode")).expect("json");
    assert_eq!(value["type"], "reencrypt_resp");
    assert_eq!(value["to"]["kind"], "all");
    assert_eq!(value["error"], "this node holds no share of the committee key");
}

#[test]
fn garbage_messages_are_rejected() {
    assert!(matches!(
        Message::from_json(b"{\"type\":\"deal\"}"),
        Err(Error::Serialization(_))
    ));
    assert!(matches!(
        Message::from_json(b"not json"),
        Err(Error::Serialization(_))
    ));
}

#[test]
fn tampered_bundle_signature_draws_a_complaint() {
    let members = members(3, 71);
    let (mut gens, mut bundles) = bundles(&members);
    bundles[1].public_commitments[0] += G2Projective::generator();
    let response = gens[2].process_deals(&bundles).expect("process deals");
    assert_eq!(response.complaints().collect::<Vec<_>>(), vec![1]);
}

#[test]
fn foreign_session_deal_draws_a_complaint() {
    let members = members(3, 72);
    let (mut gens, mut bundles) = bundles(&members);
    bundles[0].session_id = [9u8; 32];
    bundles[0].sign(&members[0].keypair).expect("sign");
    let response = gens[1].process_deals(&bundles).expect("process deals");
    assert_eq!(response.complaints().collect::<Vec<_>>(), vec![0]);
}

#[test]
fn deal_from_outside_the_round_is_refused() {
    let mut cluster = Cluster::new(members(4, 73));
    let validators = cluster.validators(&[0, 1, 2]);
    cluster.trigger(0, 1, validators.clone(), 1).expect("trigger");

    // Node 3 is not a dealer but forges a deal under its own key.
    let outsider = &cluster.members[3];
    let generator = DistKeyGenerator::new(DkgConfig::fresh(
        cluster.members[0].keypair.clone(),
        validators.clone(),
        1,
    ))
    .expect("generator");
    let bundle = generator.deal_bundle().expect("deal").expect("dealer");
    let envelope = secret_committee::message::ConsensusEnvelope {
        epoch: 1,
        consensus_node_count: 3,
        validators,
        old_validators: Vec::new(),
        share_commitments: Vec::new(),
        prior_key: None,
        deal: Some(bundle),
        sponsor: None,
        sponsor_time: 1,
    };
    let available = cluster.available(0);
    let err = cluster.nodes[0]
        .handle_message(&outsider.validator.p2p_key, Payload::Deal(envelope), &available)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidMessage(_)), "{err:?}");
}

#[test]
fn non_consensus_payload_is_refused_by_coordinator() {
    let mut cluster = Cluster::new(members(3, 74));
    let from = cluster.members[1].validator.p2p_key;
    let available = cluster.available(0);
    let err = cluster.nodes[0]
        .handle_message(
            &from,
            Payload::ReencryptResp(ReencryptResponse { share: None }),
            &available,
        )
        .unwrap_err();
    assert!(matches!(err, Error::InvalidMessage(_)));
}

#[test]
fn mismatched_keypair_is_refused_on_load() {
    let members = members(2, 75);
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let result = Dkg::load(
        members[0].validator.clone(),
        members[1].keypair.clone(),
        store,
        &Config::default(),
    );
    assert!(matches!(result, Err(Error::InvalidParams)));
}
