mod common;

use blstrs::{G2Projective, Scalar};
use group::Group;
use rand_chacha::ChaCha20Rng;
use rand_core::SeedableRng;
use secret_committee::bls::Keypair;
use secret_committee::committee::DistKeyShare;
use secret_committee::pre::{
    CHUNK_LEN, ReencryptedShare, decrypt_secret, encrypt_secret, recover, recover_verified,
    reencrypt, verify_share,
};
use secret_committee::types::{Error, PublicKey};

use common::{Cluster, members};

struct Committee {
    public_key: PublicKey,
    threshold: usize,
    shares: Vec<DistKeyShare>,
}

fn committee(n: usize, seed: u64) -> Committee {
    let mut cluster = Cluster::new(members(n, seed));
    let all: Vec<usize> = (0..n).collect();
    let validators = cluster.validators(&all);
    cluster.trigger(0, 1, validators, 1).expect("trigger");
    cluster.run();
    let state = cluster.nodes[0].state().current.clone();
    Committee {
        public_key: state.public_key.expect("public key"),
        threshold: state.threshold,
        shares: cluster
            .nodes
            .iter()
            .map(|n| n.key_share().cloned().expect("share"))
            .collect(),
    }
}

#[test]
fn requester_recovers_the_plaintext() {
    let committee = committee(4, 40);
    let mut rng = ChaCha20Rng::seed_from_u64(41);
    let requester = Keypair::generate(&mut rng);

    for plaintext in [vec![0xabu8; CHUNK_LEN], b"transaction that spans more than one chunk of plaintext".to_vec()] {
        let secret = encrypt_secret(&committee.public_key, &plaintext, &mut rng).expect("encrypt");
        assert_eq!(secret.encrypted_shares.len(), plaintext.len().div_ceil(CHUNK_LEN));

        let shares: Vec<ReencryptedShare> = committee
            .shares
            .iter()
            .map(|s| reencrypt(&s.share, &secret, &requester.public(), &mut rng).expect("reencrypt"))
            .collect();
        let commitments = &committee.shares[0].commitments;
        for share in shares.iter() {
            verify_share(commitments, &secret, &requester.public(), share).expect("proof");
        }

        // Every pair of members is enough.
        for skip in 0..shares.len() - 1 {
            let subset = &shares[skip..skip + 2];
            let commitment = recover(subset, committee.threshold, shares.len()).expect("recover");
            let opened = decrypt_secret(&secret, &committee.public_key, &commitment, requester.secret())
                .expect("decrypt");
            assert_eq!(opened, plaintext);
        }
    }
}

#[test]
fn another_requester_cannot_decrypt() {
    let committee = committee(3, 42);
    let mut rng = ChaCha20Rng::seed_from_u64(43);
    let requester = Keypair::generate(&mut rng);
    let eavesdropper = Keypair::generate(&mut rng);

    let secret = encrypt_secret(&committee.public_key, b"sealed bid", &mut rng).expect("encrypt");
    let shares: Vec<_> = committee
        .shares
        .iter()
        .map(|s| reencrypt(&s.share, &secret, &requester.public(), &mut rng).expect("reencrypt"))
        .collect();
    let commitment = recover(&shares, committee.threshold, shares.len()).expect("recover");
    let err = decrypt_secret(&secret, &committee.public_key, &commitment, eavesdropper.secret()).unwrap_err();
    assert_eq!(err, Error::DecryptionFailed);
}

#[test]
fn corrupted_proof_is_detected_and_replaced() {
    let committee = committee(4, 44);
    let mut rng = ChaCha20Rng::seed_from_u64(45);
    let requester = Keypair::generate(&mut rng);
    let plaintext = b"front-run me if you can".to_vec();
    let secret = encrypt_secret(&committee.public_key, &plaintext, &mut rng).expect("encrypt");
    let commitments = committee.shares[0].commitments.clone();

    let mut shares: Vec<_> = committee
        .shares
        .iter()
        .map(|s| reencrypt(&s.share, &secret, &requester.public(), &mut rng).expect("reencrypt"))
        .collect();
    shares[0].transformed_point += G2Projective::generator();
    shares[1].proof += Scalar::from(1u64);

    assert_eq!(
        verify_share(&commitments, &secret, &requester.public(), &shares[0]),
        Err(Error::InvalidReencryptionProof(0))
    );
    assert_eq!(
        verify_share(&commitments, &secret, &requester.public(), &shares[1]),
        Err(Error::InvalidReencryptionProof(1))
    );

    let commitment = recover_verified(
        &commitments,
        &secret,
        &requester.public(),
        &shares,
        committee.threshold,
        shares.len(),
    )
    .expect("recover");
    let opened =
        decrypt_secret(&secret, &committee.public_key, &commitment, requester.secret()).expect("decrypt");
    assert_eq!(opened, plaintext);

    // Without enough honest replacements recovery fails.
    let err = recover_verified(
        &commitments,
        &secret,
        &requester.public(),
        &shares[..3],
        committee.threshold,
        shares.len(),
    )
    .unwrap_err();
    assert_eq!(err, Error::InsufficientShares { got: 1, required: 2 });
}

#[test]
fn too_few_or_duplicate_shares_are_refused() {
    let committee = committee(4, 46);
    let mut rng = ChaCha20Rng::seed_from_u64(47);
    let requester = Keypair::generate(&mut rng);
    let secret = encrypt_secret(&committee.public_key, b"x", &mut rng).expect("encrypt");
    let share = reencrypt(&committee.shares[2].share, &secret, &requester.public(), &mut rng).expect("reencrypt");

    let err = recover(&[share.clone(), share.clone()], committee.threshold, 4).unwrap_err();
    assert_eq!(err, Error::InsufficientShares { got: 1, required: 2 });

    let mut out_of_range = share.clone();
    out_of_range.index = 9;
    let err = recover(&[share, out_of_range], committee.threshold, 4).unwrap_err();
    assert_eq!(err, Error::InsufficientShares { got: 1, required: 2 });

    assert_eq!(recover(&[], 0, 4).unwrap_err(), Error::InvalidParams);
}
