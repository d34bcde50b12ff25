//! Domain identifiers and fund bookkeeping shared by all protocols.

use core::fmt::{self, Debug, Display};
use std::collections::BTreeMap;

use rand::{distributions::Standard, prelude::Distribution};
use serde::Serialize;

use crate::abiencode::types::{Address, U256};

/// 32-byte channel or participant identifier.
///
/// An [Address] is embedded into the low 20 bytes, with the upper 12 bytes
/// zero.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Destination(pub [u8; 32]);

impl Destination {
    /// Whether this destination is an embedded account address rather than a
    /// channel id.
    pub fn is_external(&self) -> bool {
        self.0[..12].iter().all(|b| *b == 0)
    }

    /// The embedded account address, if this destination is one.
    pub fn to_address(&self) -> Option<Address> {
        if !self.is_external() {
            return None;
        }
        let mut addr = Address::default();
        addr.0.copy_from_slice(&self.0[12..]);
        Some(addr)
    }
}

impl From<Address> for Destination {
    fn from(addr: Address) -> Self {
        let mut d = Destination([0; 32]);
        d.0[12..].copy_from_slice(&addr.0);
        d
    }
}

impl Serialize for Destination {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        crate::abiencode::serialize_word(self.0, serializer)
    }
}

impl Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(self, f)
    }
}

impl Distribution<Destination> for Standard {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> Destination {
        Destination(rng.gen())
    }
}

/// A non-negative amount of every asset, keyed by the asset's token address.
///
/// The zero address denotes the chain's native token.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Funds(pub BTreeMap<Address, U256>);

impl Funds {
    pub fn new() -> Funds {
        Funds::default()
    }

    /// The amount held for `asset`, zero if absent.
    pub fn get(&self, asset: Address) -> U256 {
        self.0.get(&asset).copied().unwrap_or_default()
    }

    pub fn insert(&mut self, asset: Address, amount: U256) {
        self.0.insert(asset, amount);
    }

    /// Per-asset sum of the two fund sets.
    pub fn add(&self, other: &Funds) -> Funds {
        let mut sum = self.clone();
        for (asset, amount) in &other.0 {
            let held = sum.get(*asset);
            sum.insert(*asset, held + *amount);
        }
        sum
    }

    /// Per-asset difference, clamped at zero.
    pub fn saturating_sub(&self, other: &Funds) -> Funds {
        let mut diff = Funds::new();
        for (asset, amount) in &self.0 {
            diff.insert(*asset, amount.saturating_sub(other.get(*asset)));
        }
        diff
    }

    /// Whether `self` holds at least `other`'s amount of every asset listed
    /// in `other`.
    pub fn covers(&self, other: &Funds) -> bool {
        other.0.iter().all(|(asset, amount)| self.get(*asset) >= *amount)
    }

    pub fn is_non_zero(&self) -> bool {
        self.0.values().any(|amount| !amount.is_zero())
    }
}

impl Debug for Funds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.0.iter().map(|(asset, amount)| (asset, amount)))
            .finish()
    }
}

impl FromIterator<(Address, U256)> for Funds {
    fn from_iter<I: IntoIterator<Item = (Address, U256)>>(iter: I) -> Self {
        Funds(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_embeds_address() {
        let addr = Address([0xab; 20]);
        let dest = Destination::from(addr);
        assert!(dest.is_external());
        assert_eq!(dest.to_address(), Some(addr));

        let channel = Destination([0x11; 32]);
        assert!(!channel.is_external());
        assert_eq!(channel.to_address(), None);
    }

    #[test]
    fn funds_arithmetic() {
        let eth = Address::default();
        let dai = Address([1; 20]);

        let a: Funds = [(eth, U256::from(5)), (dai, U256::from(2))].into_iter().collect();
        let b: Funds = [(eth, U256::from(3))].into_iter().collect();

        let sum = a.add(&b);
        assert_eq!(sum.get(eth), U256::from(8));
        assert_eq!(sum.get(dai), U256::from(2));

        let diff = b.saturating_sub(&a);
        assert_eq!(diff.get(eth), U256::from(0));

        assert!(a.covers(&b));
        assert!(!b.covers(&a));
        assert!(a.is_non_zero());
        assert!(!Funds::new().is_non_zero());
    }
}
