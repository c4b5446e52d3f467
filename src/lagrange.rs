//! Lagrange interpolation at zero over 0-based share indices.

use blstrs::{G1Projective, G2Projective, Scalar};
use ff::Field;
use group::Group;

use crate::bls::share_x;
use crate::types::Error;

/// Coefficients `λ_i` such that `f(0) = Σ λ_i f(x_i)`.
///
/// Duplicate indices make a denominator vanish and are rejected.
pub fn coefficients_at_zero(indices: &[u32]) -> Result<Vec<Scalar>, Error> {
    if indices.is_empty() {
        return Err(Error::InvalidParams);
    }
    let mut coeffs = Vec::with_capacity(indices.len());
    for (i, idx_i) in indices.iter().enumerate() {
        let x_i = share_x(*idx_i);
        let mut num = Scalar::ONE;
        let mut den = Scalar::ONE;
        for (j, idx_j) in indices.iter().enumerate() {
            if i == j {
                continue;
            }
            let x_j = share_x(*idx_j);
            num *= -x_j;
            den *= x_i - x_j;
        }
        let den_inv = Option::<Scalar>::from(den.invert()).ok_or(Error::InvalidParams)?;
        coeffs.push(num * den_inv);
    }
    Ok(coeffs)
}

pub fn combine_scalars_at_zero(indices: &[u32], values: &[Scalar]) -> Result<Scalar, Error> {
    if indices.len() != values.len() {
        return Err(Error::InvalidParams);
    }
    let coeffs = coefficients_at_zero(indices)?;
    let mut acc = Scalar::ZERO;
    for (coeff, value) in coeffs.iter().zip(values.iter()) {
        acc += *value * coeff;
    }
    Ok(acc)
}

pub fn combine_g1_at_zero(indices: &[u32], values: &[G1Projective]) -> Result<G1Projective, Error> {
    if indices.len() != values.len() {
        return Err(Error::InvalidParams);
    }
    let coeffs = coefficients_at_zero(indices)?;
    let mut acc = G1Projective::identity();
    for (coeff, value) in coeffs.iter().zip(values.iter()) {
        acc += *value * coeff;
    }
    Ok(acc)
}

pub fn combine_g2_at_zero(indices: &[u32], values: &[G2Projective]) -> Result<G2Projective, Error> {
    if indices.len() != values.len() {
        return Err(Error::InvalidParams);
    }
    let coeffs = coefficients_at_zero(indices)?;
    let mut acc = G2Projective::identity();
    for (coeff, value) in coeffs.iter().zip(values.iter()) {
        acc += *value * coeff;
    }
    Ok(acc)
}
