//! Threshold proxy re-encryption of stored secrets.
//!
//! A secret is encrypted to the committee key `X = g2^x` with an ephemeral
//! `U = g2^r`; the symmetric material is `K = X·r`. To hand the secret to a
//! requester with key `X_c`, each member publishes `U_i = (U + X_c)·x_i`
//! with a DLEQ proof against its public share `H_i = g2^x_i`. Interpolating
//! `threshold` verified shares gives `(U + X_c)·x = K + X·x_c`, from which
//! only the holder of `x_c` can strip its own term and recover `K`.

use std::collections::BTreeSet;

use blstrs::{G2Projective, Scalar};
use group::Group;
use rand_core::RngCore;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::bls::{eval_commitment, g2_to_bytes, hash_to_scalar, scalar_random, share_x};
use crate::committee::PriShare;
use crate::lagrange::combine_g2_at_zero;
use crate::seal::{NONCE_LEN, decrypt, derive_key, encrypt};
use crate::types::{Error, PublicKey};

pub const CHUNK_LEN: usize = 32;

const SALT_PRE: &[u8] = b"SECRET-COMMITTEE-PRE-V1";
const DST_PROOF: &[u8] = b"SECRET-COMMITTEE-PRE-DLEQ-V1";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ciphertext {
    #[serde(with = "crate::encoding::b64")]
    pub nonce: [u8; NONCE_LEN],
    #[serde(with = "crate::encoding::b64")]
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedSecret {
    /// `U = g2^r`.
    #[serde(with = "crate::encoding::g2")]
    pub encrypted_commitment: G2Projective,
    /// One sealed 32-byte chunk per element.
    pub encrypted_shares: Vec<Ciphertext>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReencryptedShare {
    pub index: u32,
    #[serde(with = "crate::encoding::g2")]
    pub transformed_point: G2Projective,
    #[serde(with = "crate::encoding::scalar")]
    pub challenge: Scalar,
    #[serde(with = "crate::encoding::scalar")]
    pub proof: Scalar,
}

/// `K + X·x_c`, the interpolated re-encryption.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReencryptedCommitment(#[serde(with = "crate::encoding::g2")] pub G2Projective);

pub fn encrypt_secret<R: RngCore + ?Sized>(
    public_key: &PublicKey,
    plaintext: &[u8],
    rng: &mut R,
) -> Result<EncryptedSecret, Error> {
    let x = public_key.to_point()?;
    let r = scalar_random(rng);
    let u = G2Projective::generator() * r;
    let k = x * r;
    let aad = g2_to_bytes(&u);
    let mut encrypted_shares = Vec::with_capacity(plaintext.len().div_ceil(CHUNK_LEN));
    for (i, chunk) in plaintext.chunks(CHUNK_LEN).enumerate() {
        let key = chunk_key(&k, i)?;
        let mut nonce = [0u8; NONCE_LEN];
        rng.fill_bytes(&mut nonce);
        let data = encrypt(&key, &nonce, chunk, &aad)?;
        encrypted_shares.push(Ciphertext { nonce, data });
    }
    Ok(EncryptedSecret {
        encrypted_commitment: u,
        encrypted_shares,
    })
}

/// Re-encrypt this member's share of `secret` towards `requester`.
pub fn reencrypt<R: RngCore + ?Sized>(
    share: &PriShare,
    secret: &EncryptedSecret,
    requester: &PublicKey,
    rng: &mut R,
) -> Result<ReencryptedShare, Error> {
    let base = secret.encrypted_commitment + requester.to_point()?;
    let transformed_point = base * share.value;
    let s = scalar_random(rng);
    let u_hat = base * s;
    let h_hat = G2Projective::generator() * s;
    let challenge = challenge(&transformed_point, &u_hat, &h_hat);
    let proof = s + challenge * share.value;
    Ok(ReencryptedShare {
        index: share.index,
        transformed_point,
        challenge,
        proof,
    })
}

/// Check the DLEQ proof of `share` against the public share derived from
/// the committee commitments.
pub fn verify_share(
    commitments: &[G2Projective],
    secret: &EncryptedSecret,
    requester: &PublicKey,
    share: &ReencryptedShare,
) -> Result<(), Error> {
    let base = secret.encrypted_commitment + requester.to_point()?;
    let h_i = eval_commitment(commitments, &share_x(share.index));
    let u_hat = base * share.proof - share.transformed_point * share.challenge;
    let h_hat = G2Projective::generator() * share.proof - h_i * share.challenge;
    if challenge(&share.transformed_point, &u_hat, &h_hat) != share.challenge {
        return Err(Error::InvalidReencryptionProof(share.index));
    }
    Ok(())
}

/// Interpolate the first `threshold` distinct in-range shares.
pub fn recover(
    shares: &[ReencryptedShare],
    threshold: usize,
    committee_size: usize,
) -> Result<ReencryptedCommitment, Error> {
    if threshold == 0 {
        return Err(Error::InvalidParams);
    }
    let mut seen = BTreeSet::new();
    let mut indices = Vec::with_capacity(threshold);
    let mut points = Vec::with_capacity(threshold);
    for share in shares {
        if (share.index as usize) >= committee_size || !seen.insert(share.index) {
            continue;
        }
        indices.push(share.index);
        points.push(share.transformed_point);
        if indices.len() == threshold {
            break;
        }
    }
    if indices.len() < threshold {
        return Err(Error::InsufficientShares {
            got: indices.len(),
            required: threshold,
        });
    }
    Ok(ReencryptedCommitment(combine_g2_at_zero(&indices, &points)?))
}

/// Like [`recover`], after excluding every share whose proof fails.
pub fn recover_verified(
    commitments: &[G2Projective],
    secret: &EncryptedSecret,
    requester: &PublicKey,
    shares: &[ReencryptedShare],
    threshold: usize,
    committee_size: usize,
) -> Result<ReencryptedCommitment, Error> {
    let valid: Vec<ReencryptedShare> = shares
        .iter()
        .filter(|share| match verify_share(commitments, secret, requester, share) {
            Ok(()) => true,
            Err(err) => {
                warn!(index = share.index, %err, "excluding re-encrypted share");
                false
            }
        })
        .cloned()
        .collect();
    recover(&valid, threshold, committee_size)
}

/// Requester-side decryption with the requester's private key.
pub fn decrypt_secret(
    secret: &EncryptedSecret,
    committee_key: &PublicKey,
    commitment: &ReencryptedCommitment,
    requester_secret: &Scalar,
) -> Result<Vec<u8>, Error> {
    let x = committee_key.to_point()?;
    let k = commitment.0 - x * requester_secret;
    let aad = g2_to_bytes(&secret.encrypted_commitment);
    let mut plaintext = Vec::with_capacity(secret.encrypted_shares.len() * CHUNK_LEN);
    for (i, chunk) in secret.encrypted_shares.iter().enumerate() {
        let key = chunk_key(&k, i)?;
        plaintext.extend_from_slice(&decrypt(&key, &chunk.nonce, &chunk.data, &aad)?);
    }
    Ok(plaintext)
}

fn chunk_key(k: &G2Projective, index: usize) -> Result<[u8; 32], Error> {
    derive_key(k, SALT_PRE, &(index as u64).to_be_bytes())
}

fn challenge(transformed: &G2Projective, u_hat: &G2Projective, h_hat: &G2Projective) -> Scalar {
    hash_to_scalar(
        DST_PROOF,
        &[&g2_to_bytes(transformed), &g2_to_bytes(u_hat), &g2_to_bytes(h_hat)],
    )
}
