//! BLS12-381 helpers: hashing, polynomials, Feldman commitments and the
//! long-term node keypair used to authenticate protocol bundles.

use blstrs::{G1Affine, G1Projective, G2Affine, G2Projective, Gt, Scalar};
use ff::Field;
use group::{Curve, Group};
use serde::{Deserialize, Serialize};

use crate::types::{Error, PublicKey};

type Fr = Scalar;
type G1 = G1Projective;
type G2 = G2Projective;

/// Domain tag for authentication signatures made with a long-term key.
const DST_AUTH: &[u8] = b"SECRET-COMMITTEE-AUTH-V1";

pub fn hash_to_g1(msg: &[u8], dst: &[u8]) -> G1 {
    G1Projective::hash_to_curve(msg, dst, &[])
}

pub fn pairing(g1: &G1, g2: &G2) -> Gt {
    blstrs::pairing(&g1.to_affine(), &g2.to_affine())
}

/// Hash arbitrary length-delimited parts to a scalar.
///
/// The top two bits of the 32-byte digest are cleared so the value is always
/// below the group order and `from_bytes_be` cannot fail.
pub fn hash_to_scalar(dst: &[u8], parts: &[&[u8]]) -> Fr {
    let mut hasher = blake3::Hasher::new();
    hasher.update(dst);
    for part in parts {
        hasher.update(&(part.len() as u64).to_be_bytes());
        hasher.update(part);
    }
    let mut raw = *hasher.finalize().as_bytes();
    raw[0] &= 0x3f;
    Option::<Fr>::from(Fr::from_bytes_be(&raw)).unwrap_or(Fr::ZERO)
}

/// Evaluation point of the share with 0-based `index`.
pub fn share_x(index: u32) -> Fr {
    Fr::from(index as u64 + 1)
}

pub fn scalar_random<R: rand_core::RngCore + ?Sized>(rng: &mut R) -> Fr {
    Fr::random(rng)
}

pub fn scalar_to_bytes(s: &Fr) -> [u8; 32] {
    s.to_bytes_be()
}

pub fn scalar_from_bytes(bytes: &[u8]) -> Result<Fr, Error> {
    if bytes.len() != 32 {
        return Err(Error::InvalidEncoding);
    }
    let mut raw = [0u8; 32];
    raw.copy_from_slice(bytes);
    Option::<Fr>::from(Fr::from_bytes_be(&raw)).ok_or(Error::InvalidEncoding)
}

pub fn g1_to_bytes(p: &G1) -> [u8; 48] {
    p.to_affine().to_compressed()
}

pub fn g1_from_bytes(bytes: &[u8]) -> Result<G1, Error> {
    if bytes.len() != 48 {
        return Err(Error::InvalidEncoding);
    }
    let mut raw = [0u8; 48];
    raw.copy_from_slice(bytes);
    let affine =
        Option::<G1Affine>::from(G1Affine::from_compressed(&raw)).ok_or(Error::InvalidEncoding)?;
    Ok(affine.into())
}

pub fn g2_to_bytes(p: &G2) -> [u8; 96] {
    p.to_affine().to_compressed()
}

pub fn g2_from_bytes(bytes: &[u8]) -> Result<G2, Error> {
    if bytes.len() != 96 {
        return Err(Error::InvalidEncoding);
    }
    let mut raw = [0u8; 96];
    raw.copy_from_slice(bytes);
    let affine =
        Option::<G2Affine>::from(G2Affine::from_compressed(&raw)).ok_or(Error::InvalidEncoding)?;
    Ok(affine.into())
}

/// Horner evaluation of a secret polynomial given low-to-high coefficients.
pub fn eval_poly(coeffs: &[Fr], x: &Fr) -> Fr {
    let mut acc = Fr::ZERO;
    for coeff in coeffs.iter().rev() {
        acc *= x;
        acc += coeff;
    }
    acc
}

/// Evaluate a Feldman commitment vector `C_k = g2^a_k` at `x`.
pub fn eval_commitment(coeffs: &[G2], x: &Fr) -> G2 {
    let mut acc = G2Projective::identity();
    let mut power = Fr::ONE;
    for c_k in coeffs.iter() {
        acc += *c_k * power;
        power *= x;
    }
    acc
}

pub fn commit_poly(coeffs: &[Fr]) -> Vec<G2> {
    let g2 = G2Projective::generator();
    coeffs.iter().map(|a| g2 * a).collect()
}

/// Long-term identity of a node. The public half is a validator's
/// `validator_key`.
#[derive(Clone, Serialize, Deserialize)]
pub struct Keypair {
    #[serde(with = "crate::encoding::scalar")]
    secret: Fr,
    public: PublicKey,
}

impl Keypair {
    pub fn generate<R: rand_core::RngCore + ?Sized>(rng: &mut R) -> Self {
        Self::from_secret(scalar_random(rng))
    }

    pub fn from_secret(secret: Fr) -> Self {
        let public = PublicKey::from_point(&(G2Projective::generator() * secret));
        Self { secret, public }
    }

    pub fn public(&self) -> PublicKey {
        self.public
    }

    pub fn secret(&self) -> &Fr {
        &self.secret
    }

    /// BLS signature over a 32-byte digest.
    pub fn sign_digest(&self, digest: &[u8; 32]) -> G1 {
        hash_to_g1(digest, DST_AUTH) * self.secret
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

pub fn verify_digest(sig: &G1, pk: &PublicKey, digest: &[u8; 32]) -> bool {
    let Ok(pk) = pk.to_point() else {
        return false;
    };
    let h = hash_to_g1(digest, DST_AUTH);
    pairing(sig, &G2Projective::generator()) == pairing(&h, &pk)
}
