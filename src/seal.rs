//! Sealing of private values to a G2 public key: ephemeral Diffie-Hellman,
//! HKDF-SHA256 key derivation and ChaCha20-Poly1305.

use blstrs::{G2Projective, Scalar};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use group::Group;
use hkdf::Hkdf;
use rand_core::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::bls::{g2_to_bytes, scalar_random};
use crate::encoding::enc_tuple;
use crate::types::{Error, PublicKey};

pub const NONCE_LEN: usize = 12;

const SALT_SEAL: &[u8] = b"SECRET-COMMITTEE-SEAL-V1";

/// A value sealed to one recipient.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sealed {
    #[serde(with = "crate::encoding::g2")]
    pub ephemeral: G2Projective,
    #[serde(with = "crate::encoding::b64")]
    pub nonce: [u8; NONCE_LEN],
    #[serde(with = "crate::encoding::b64")]
    pub ciphertext: Vec<u8>,
}

/// Derive a 32-byte symmetric key from a shared group element.
pub fn derive_key(shared: &G2Projective, salt: &[u8], info: &[u8]) -> Result<[u8; 32], Error> {
    let prk = Hkdf::<Sha256>::new(Some(salt), &g2_to_bytes(shared));
    let mut okm = [0u8; 32];
    prk.expand(info, &mut okm)?;
    Ok(okm)
}

pub fn encrypt(key: &[u8; 32], nonce: &[u8; NONCE_LEN], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, Error> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad })
        .map_err(|_| Error::CryptoError)
}

pub fn decrypt(key: &[u8; 32], nonce: &[u8; NONCE_LEN], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, Error> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| Error::DecryptionFailed)
}

pub fn seal<R: RngCore + ?Sized>(
    recipient: &PublicKey,
    plaintext: &[u8],
    aad: &[u8],
    rng: &mut R,
) -> Result<Sealed, Error> {
    let recipient = recipient.to_point()?;
    let e = scalar_random(rng);
    let ephemeral = G2Projective::generator() * e;
    let shared = recipient * e;
    let key = derive_key(&shared, SALT_SEAL, &enc_tuple(&[&g2_to_bytes(&ephemeral), aad])?)?;
    let mut nonce = [0u8; NONCE_LEN];
    rng.fill_bytes(&mut nonce);
    let ciphertext = encrypt(&key, &nonce, plaintext, aad)?;
    Ok(Sealed {
        ephemeral,
        nonce,
        ciphertext,
    })
}

pub fn open(secret: &Scalar, sealed: &Sealed, aad: &[u8]) -> Result<Vec<u8>, Error> {
    let shared = sealed.ephemeral * secret;
    let key = derive_key(&shared, SALT_SEAL, &enc_tuple(&[&g2_to_bytes(&sealed.ephemeral), aad])?)?;
    decrypt(&key, &sealed.nonce, &sealed.ciphertext, aad)
}
