//! Length-prefixed encoding helpers for transcripts, plus serde adapters that
//! carry curve elements as base64 of their canonical compressed bytes.

use crate::types::Error;

pub fn enc_len(len: usize) -> Result<[u8; 4], Error> {
    // Lengths are encoded as 4-byte big-endian.
    if len > u32::MAX as usize {
        return Err(Error::InvalidEncoding);
    }
    Ok((len as u32).to_be_bytes())
}

pub fn enc_bytes(bytes: &[u8]) -> Result<Vec<u8>, Error> {
    let mut out = Vec::with_capacity(4 + bytes.len());
    out.extend_from_slice(&enc_len(bytes.len())?);
    out.extend_from_slice(bytes);
    Ok(out)
}

pub fn enc_tuple(parts: &[&[u8]]) -> Result<Vec<u8>, Error> {
    // Concatenate length-prefixed parts in order.
    let total_len: usize = parts.iter().map(|p| 4 + p.len()).sum();
    let mut out = Vec::with_capacity(total_len);
    for part in parts {
        out.extend_from_slice(&enc_len(part.len())?);
        out.extend_from_slice(part);
    }
    Ok(out)
}

fn b64_encode(bytes: &[u8]) -> String {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    STANDARD.encode(bytes)
}

fn b64_decode<E: serde::de::Error>(s: &str) -> Result<Vec<u8>, E> {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    STANDARD.decode(s).map_err(E::custom)
}

/// Raw byte containers (`Vec<u8>`, `[u8; N]`).
pub mod b64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<T: AsRef<[u8]>, S: Serializer>(value: &T, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::b64_encode(value.as_ref()))
    }

    pub fn deserialize<'de, T, D>(d: D) -> Result<T, D::Error>
    where
        T: TryFrom<Vec<u8>>,
        D: Deserializer<'de>,
    {
        let s = String::deserialize(d)?;
        let raw = super::b64_decode::<D::Error>(&s)?;
        T::try_from(raw).map_err(|_| serde::de::Error::custom("unexpected byte length"))
    }
}

pub mod scalar {
    use blstrs::Scalar;
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::bls::{scalar_from_bytes, scalar_to_bytes};

    pub fn serialize<S: Serializer>(value: &Scalar, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::b64_encode(&scalar_to_bytes(value)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Scalar, D::Error> {
        let s = String::deserialize(d)?;
        let raw = super::b64_decode::<D::Error>(&s)?;
        scalar_from_bytes(&raw).map_err(serde::de::Error::custom)
    }
}

pub mod g1 {
    use blstrs::G1Projective;
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::bls::{g1_from_bytes, g1_to_bytes};

    pub fn serialize<S: Serializer>(value: &G1Projective, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::b64_encode(&g1_to_bytes(value)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<G1Projective, D::Error> {
        let s = String::deserialize(d)?;
        let raw = super::b64_decode::<D::Error>(&s)?;
        g1_from_bytes(&raw).map_err(serde::de::Error::custom)
    }
}

pub mod g2 {
    use blstrs::G2Projective;
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::bls::{g2_from_bytes, g2_to_bytes};

    pub fn serialize<S: Serializer>(value: &G2Projective, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::b64_encode(&g2_to_bytes(value)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<G2Projective, D::Error> {
        let s = String::deserialize(d)?;
        let raw = super::b64_decode::<D::Error>(&s)?;
        g2_from_bytes(&raw).map_err(serde::de::Error::custom)
    }
}

pub mod g2_vec {
    use blstrs::G2Projective;
    use serde::ser::SerializeSeq;
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::bls::{g2_from_bytes, g2_to_bytes};

    pub fn serialize<S: Serializer>(values: &[G2Projective], s: S) -> Result<S::Ok, S::Error> {
        let mut seq = s.serialize_seq(Some(values.len()))?;
        for value in values {
            seq.serialize_element(&super::b64_encode(&g2_to_bytes(value)))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<G2Projective>, D::Error> {
        let raw = Vec::<String>::deserialize(d)?;
        raw.iter()
            .map(|s| {
                let bytes = super::b64_decode::<D::Error>(s)?;
                g2_from_bytes(&bytes).map_err(serde::de::Error::custom)
            })
            .collect()
    }
}
