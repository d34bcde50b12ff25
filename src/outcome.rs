//! The outcome model: per-asset exits with simple and guarantee allocations.

use serde::Serialize;
use serde_repr::Serialize_repr;
use thiserror::Error;

use crate::abiencode::{self, as_bytes, types::{Address, U256}};
use crate::types::{Destination, Funds};

/// Upper bound on the byte size of any transaction submitted to the
/// adjudicator.
pub const MAX_TX_DATA_SIZE: usize = 128 * 1024;

/// Maximum number of allocations per outcome.
///
/// A guarantee allocation encodes to 7 slots (5 inline plus the 64-byte
/// metadata tail), so a challenge carrying two candidate outcomes of this
/// size stays comfortably below [MAX_TX_DATA_SIZE].
pub const MAX_OUTCOME_ITEMS: usize = 256;

#[derive(Debug, Error)]
pub enum OutcomeError {
    #[error("guarantee metadata must be exactly 64 bytes, got {0}")]
    InvalidMetadataLength(usize),
    #[error("outcome has {0} allocations, limit is {MAX_OUTCOME_ITEMS}")]
    TooManyAllocations(usize),
    #[error(transparent)]
    Encoding(#[from] abiencode::Error),
}

#[derive(Serialize_repr, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AllocationType {
    Simple = 0,
    Guarantee = 1,
}

/// A single payout entry of an outcome.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub destination: Destination,
    pub amount: U256,
    pub allocation_type: AllocationType,
    /// Empty for [AllocationType::Simple]; an encoded [GuaranteeMetadata]
    /// for [AllocationType::Guarantee].
    #[serde(with = "as_bytes")]
    pub metadata: Vec<u8>,
}

impl Allocation {
    pub fn simple(destination: Destination, amount: U256) -> Allocation {
        Allocation {
            destination,
            amount,
            allocation_type: AllocationType::Simple,
            metadata: Vec::new(),
        }
    }
}

/// Left/right recovery targets of a guarantee, ABI-encoded into the
/// allocation metadata.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuaranteeMetadata {
    pub left: Destination,
    pub right: Destination,
}

impl GuaranteeMetadata {
    pub fn encode(&self) -> Result<Vec<u8>, OutcomeError> {
        Ok(abiencode::to_bytes(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<GuaranteeMetadata, OutcomeError> {
        if bytes.len() != 64 {
            return Err(OutcomeError::InvalidMetadataLength(bytes.len()));
        }
        let mut left = Destination::default();
        let mut right = Destination::default();
        left.0.copy_from_slice(&bytes[..32]);
        right.0.copy_from_slice(&bytes[32..]);
        Ok(GuaranteeMetadata { left, right })
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(transparent)]
pub struct Allocations(pub Vec<Allocation>);

impl Allocations {
    /// Sum over all entries.
    pub fn total(&self) -> U256 {
        self.0
            .iter()
            .fold(U256::zero(), |acc, a| acc + a.amount)
    }

    /// Sum over the entries paying out to `destination`.
    pub fn total_for(&self, destination: Destination) -> U256 {
        self.0
            .iter()
            .filter(|a| a.destination == destination)
            .fold(U256::zero(), |acc, a| acc + a.amount)
    }
}

/// The payout plan for one asset.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct SingleAssetExit {
    pub asset: Address,
    #[serde(with = "as_bytes")]
    pub metadata: Vec<u8>,
    pub allocations: Allocations,
}

/// An outcome: one [SingleAssetExit] per asset.
#[derive(Serialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(transparent)]
pub struct Exit(pub Vec<SingleAssetExit>);

impl Exit {
    /// Total payout per asset.
    pub fn total_allocated(&self) -> Funds {
        self.0
            .iter()
            .map(|sae| (sae.asset, sae.allocations.total()))
            .collect()
    }

    /// Total payout per asset going to `destination`.
    pub fn total_allocated_for(&self, destination: Destination) -> Funds {
        self.0
            .iter()
            .map(|sae| (sae.asset, sae.allocations.total_for(destination)))
            .collect()
    }

    /// Per asset, the amount allocated to participants ahead of `interest`
    /// in the payout order. Once the chain holds this much, a deposit by
    /// `interest` cannot be swallowed by earlier claims.
    pub fn deposit_safety_threshold(&self, interest: Destination) -> Funds {
        let mut threshold = Funds::new();
        for sae in &self.0 {
            let mut sum = U256::zero();
            for allocation in &sae.allocations.0 {
                if allocation.destination == interest {
                    break;
                }
                sum = sum + allocation.amount;
            }
            threshold.insert(sae.asset, sum);
        }
        threshold
    }

    fn num_allocations(&self) -> usize {
        self.0.iter().map(|sae| sae.allocations.0.len()).sum()
    }

    /// Rejects outcomes too large for an adjudicator transaction.
    pub fn validate_size(&self) -> Result<(), OutcomeError> {
        let n = self.num_allocations();
        if n > MAX_OUTCOME_ITEMS {
            return Err(OutcomeError::TooManyAllocations(n));
        }
        Ok(())
    }
}
