//! Primitive Solidity types used throughout the ABI encoding.

use core::fmt::{self, Debug, Display};

use rand::{distributions::Standard, prelude::Distribution};
use serde::Serialize;
use uint::construct_uint;

macro_rules! impl_hex_fmt {
    ($T:ident) => {
        impl Debug for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("0x")?;
                for b in self.0 {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
        }

        impl Display for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                Debug::fmt(self, f)
            }
        }
    };
}

/// 32-byte `bytes32` value, usually a keccak256 digest.
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Copy, Clone, Default)]
pub struct Hash(pub [u8; 32]);

impl Serialize for Hash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        super::serialize_word(self.0, serializer)
    }
}

impl Distribution<Hash> for Standard {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> Hash {
        Hash(rng.gen())
    }
}

impl_hex_fmt!(Hash);

/// 65-byte recoverable ECDSA signature: `r ‖ s ‖ v` with `v ∈ {27, 28}`.
#[derive(PartialEq, Eq, Copy, Clone)]
pub struct Signature(pub [u8; 65]);

impl Signature {
    pub fn new(rs: &[u8; 64], v: u8) -> Self {
        let mut sig = Signature([0; 65]);
        sig.0[..64].copy_from_slice(rs);
        sig.0[64] = v;
        sig
    }

    pub fn r(&self) -> [u8; 32] {
        self.0[..32].try_into().unwrap()
    }

    pub fn s(&self) -> [u8; 32] {
        self.0[32..64].try_into().unwrap()
    }

    pub fn v(&self) -> u8 {
        self.0[64]
    }
}

impl Default for Signature {
    fn default() -> Self {
        Signature([0; 65])
    }
}

impl Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("0x")?;
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

// We could use primitive_types::U256 or ethereum_types::U256 here, but both
// serde-serialize to a hex string, which is not what the ABI encoding needs.
// Since both internally use construct_uint it is easier to construct our own
// type and attach the slot encoding directly.
construct_uint! {
    pub struct U256(4);
}

impl Serialize for U256 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut word = [0u8; 32];
        self.to_big_endian(&mut word);
        super::serialize_word(word, serializer)
    }
}

impl Distribution<U256> for Standard {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> U256 {
        let buf: [u8; 32] = rng.gen();
        U256::from_big_endian(&buf)
    }
}

/// 20-byte Ethereum account address.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(pub [u8; 20]);

impl_hex_fmt!(Address);

impl Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        // The abi encoding right-aligns addresses (like uints) instead of
        // left-aligning them like bytesN.
        let mut word = [0u8; 32];
        word[32 - 20..].copy_from_slice(self.0.as_slice());
        super::serialize_word(word, serializer)
    }
}

impl Distribution<Address> for Standard {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> Address {
        Address(rng.gen())
    }
}
