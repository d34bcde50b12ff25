//! Off-chain protocol engine for Nitro state channels: direct and virtual
//! funding, voucher payments, and cooperative defunding, driven by a single
//! event loop over objective state machines.

mod abiencode {
    mod error;
    mod ser;

    pub mod as_bytes;
    pub mod types;

    pub use error::{Error, Result};
    pub use ser::{serialize_word, to_bytes, to_hash};

    #[cfg(test)]
    mod tests;
}

pub mod chain;
pub mod channel;
mod client;
pub mod consensus_channel;
pub mod crypto;
pub mod engine;
pub mod messages;
pub mod outcome;
pub mod payments;
pub mod protocols;
pub mod state;
pub mod store;
pub mod types;
pub mod wire;

#[cfg(test)]
pub(crate) mod testactors;

pub use abiencode::types::{Address, Hash, Signature, U256};
pub use client::{Client, ClientError};
pub use types::{Destination, Funds};
