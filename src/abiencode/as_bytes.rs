//! Serde attribute for fields holding Solidity `bytes`.
//!
//! `#[serde(with = "as_bytes")]` routes a byte vector through
//! `serialize_bytes`, which the encoder lays out as a length-prefixed,
//! zero-padded payload. Without the attribute serde walks a `Vec<u8>` as a
//! sequence of integers and the field would encode as `uint8[]`, one slot
//! per byte.

use serde::Serializer;

pub fn serialize<S>(v: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_bytes(v)
}
