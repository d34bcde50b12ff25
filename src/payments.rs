//! Voucher-based micropayments over virtual channels.

use std::collections::HashMap;

use secp256k1::SecretKey;
use serde::Serialize;
use thiserror::Error;

use crate::abiencode::{
    self,
    types::{Address, Signature, U256},
};
use crate::crypto;
use crate::state::StateError;
use crate::types::Destination;

/// Index of the paying participant in a virtual channel.
pub const PAYER_INDEX: usize = 0;

/// The payer of a payment channel: the first participant.
pub fn payer(participants: &[Address]) -> Address {
    participants[PAYER_INDEX]
}

/// The payee of a payment channel: the last participant.
pub fn payee(participants: &[Address]) -> Address {
    participants[participants.len() - 1]
}

#[derive(Debug, Error)]
pub enum VoucherError {
    #[error("channel {0} not registered")]
    ChannelNotRegistered(Destination),
    #[error("channel {0} already registered")]
    ChannelAlreadyRegistered(Destination),
    #[error("payment of {amount} exceeds the remaining channel balance {remaining}")]
    InsufficientBalance { amount: U256, remaining: U256 },
    #[error("voucher was not signed by the channel payer")]
    NotSignedByPayer,
    #[error("only the payer may create vouchers")]
    NotPayer,
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Encoding(#[from] abiencode::Error),
}

/// A signed receipt for the *cumulative* amount paid on one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Voucher {
    pub channel_id: Destination,
    pub amount: U256,
    pub signature: Signature,
}

#[derive(Serialize)]
struct VoucherDigest {
    channel_id: Destination,
    amount: U256,
}

impl Voucher {
    fn digest(channel_id: Destination, amount: U256) -> Result<crate::abiencode::types::Hash, VoucherError> {
        Ok(abiencode::to_hash(&VoucherDigest { channel_id, amount })?)
    }

    pub fn new_signed(
        channel_id: Destination,
        amount: U256,
        sk: &SecretKey,
    ) -> Result<Voucher, VoucherError> {
        let signature = crypto::sign_eth(Self::digest(channel_id, amount)?, sk);
        Ok(Voucher {
            channel_id,
            amount,
            signature,
        })
    }

    pub fn recover_signer(&self) -> Result<Address, VoucherError> {
        Ok(crypto::recover_signer(
            Self::digest(self.channel_id, self.amount)?,
            &self.signature,
        )
        .map_err(StateError::Recovery)?)
    }
}

/// What is left and what has been paid on one registered channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Balance {
    pub remaining: U256,
    pub paid: U256,
}

#[derive(Debug, Clone)]
struct PaymentStatus {
    channel_payer: Address,
    channel_payee: Address,
    starting_balance: U256,
    largest_voucher: U256,
}

impl PaymentStatus {
    fn balance(&self) -> Balance {
        Balance {
            remaining: self.starting_balance - self.largest_voucher,
            paid: self.largest_voucher,
        }
    }
}

/// Tracks the running balance of each registered payment channel, both for
/// the paying and the receiving side.
#[derive(Debug, Clone)]
pub struct VoucherManager {
    me: Address,
    channels: HashMap<Destination, PaymentStatus>,
}

impl VoucherManager {
    pub fn new(me: Address) -> VoucherManager {
        VoucherManager {
            me,
            channels: HashMap::new(),
        }
    }

    /// Start tracking a channel. Refuses re-registration so an established
    /// balance can never be reset.
    pub fn register(
        &mut self,
        channel_id: Destination,
        payer: Address,
        payee: Address,
        starting_balance: U256,
    ) -> Result<(), VoucherError> {
        if self.channels.contains_key(&channel_id) {
            return Err(VoucherError::ChannelAlreadyRegistered(channel_id));
        }
        self.channels.insert(
            channel_id,
            PaymentStatus {
                channel_payer: payer,
                channel_payee: payee,
                starting_balance,
                largest_voucher: U256::zero(),
            },
        );
        Ok(())
    }

    pub fn channel_registered(&self, channel_id: Destination) -> bool {
        self.channels.contains_key(&channel_id)
    }

    /// Pay `amount` more on the channel, returning the voucher to send.
    pub fn pay(
        &mut self,
        channel_id: Destination,
        amount: U256,
        sk: &SecretKey,
    ) -> Result<Voucher, VoucherError> {
        let status = self
            .channels
            .get_mut(&channel_id)
            .ok_or(VoucherError::ChannelNotRegistered(channel_id))?;

        if crypto::address_from_secret_key(sk) != status.channel_payer {
            return Err(VoucherError::NotPayer);
        }

        let remaining = status.starting_balance - status.largest_voucher;
        if amount > remaining {
            return Err(VoucherError::InsufficientBalance { amount, remaining });
        }

        let cumulative = status.largest_voucher + amount;
        let voucher = Voucher::new_signed(channel_id, cumulative, sk)?;
        status.largest_voucher = cumulative;
        Ok(voucher)
    }

    /// Accept an incoming voucher and return the cumulative amount paid on
    /// the channel. Replays of older vouchers leave the balance unchanged.
    pub fn receive(&mut self, voucher: &Voucher) -> Result<U256, VoucherError> {
        let status = self
            .channels
            .get_mut(&voucher.channel_id)
            .ok_or(VoucherError::ChannelNotRegistered(voucher.channel_id))?;

        if voucher.amount > status.starting_balance {
            return Err(VoucherError::InsufficientBalance {
                amount: voucher.amount,
                remaining: status.starting_balance,
            });
        }

        if voucher.recover_signer()? != status.channel_payer {
            return Err(VoucherError::NotSignedByPayer);
        }

        if voucher.amount > status.largest_voucher {
            status.largest_voucher = voucher.amount;
        }
        Ok(status.largest_voucher)
    }

    pub fn balance(&self, channel_id: Destination) -> Result<Balance, VoucherError> {
        self.channels
            .get(&channel_id)
            .map(PaymentStatus::balance)
            .ok_or(VoucherError::ChannelNotRegistered(channel_id))
    }

    pub fn me(&self) -> Address {
        self.me
    }
}
