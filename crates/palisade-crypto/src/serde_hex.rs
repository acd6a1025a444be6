//! Hex serialization helpers for serde.
//!
//! Fixed-size byte arrays are written as lowercase hex strings so JSON key
//! bundles and backup payloads stay human-inspectable, and so arrays longer
//! than 32 bytes (signatures) serialize at all.

use serde::{Deserialize, Deserializer, Serializer};

/// Serialize a fixed-size byte array as a hex string.
pub fn serialize<S, const N: usize>(bytes: &[u8; N], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&hex::encode(bytes))
}

/// Deserialize a hex string into a fixed-size byte array.
pub fn deserialize<'de, D, const N: usize>(deserializer: D) -> Result<[u8; N], D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    let bytes = hex::decode(s).map_err(serde::de::Error::custom)?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| serde::de::Error::custom(format!("invalid length: expected {N}, got {len}")))
}
