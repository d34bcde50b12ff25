//! The JSON wire format: serde DTOs mirroring the protocol types, with
//! conversions in both directions.
//!
//! Identifiers travel as `0x…` hex strings, amounts as decimal strings,
//! byte payloads as base64. Signatures arriving off the wire are never
//! trusted by index: states are rebuilt by recovering each signer.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::abiencode::types::{Address, Signature, U256};
use crate::consensus_channel::{Change, Proposal, SignedProposal};
use crate::outcome::{
    Allocation, AllocationType, Allocations, Exit, SingleAssetExit,
};
use crate::payments::Voucher;
use crate::protocols::{Message, ObjectivePayload};
use crate::state::{SignedState, State, StateError};
use crate::types::Destination;

#[derive(Debug, Error)]
pub enum WireError {
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Hex(#[from] hex::FromHexError),
    #[error(transparent)]
    Base64(#[from] base64::DecodeError),
    #[error("invalid length for {0}")]
    InvalidLength(&'static str),
    #[error("invalid decimal amount {0:?}")]
    InvalidAmount(String),
    #[error("unknown allocation type {0}")]
    UnknownAllocationType(u8),
    #[error("proposal must carry exactly one of ToAdd and ToRemove")]
    AmbiguousProposal,
    #[error("rejected signature in payload: {0}")]
    BadSignature(#[from] StateError),
    #[error("message could not be delivered to {0}")]
    UnknownPeer(Address),
}

impl Message {
    pub fn serialize(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(&WireMessage::try_from(self)?)?)
    }

    pub fn deserialize(raw: &str) -> Result<Message, WireError> {
        serde_json::from_str::<WireMessage>(raw)?.try_into()
    }
}

fn to_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

fn from_hex<const N: usize>(s: &str, what: &'static str) -> Result<[u8; N], WireError> {
    let bytes = hex::decode(s.strip_prefix("0x").unwrap_or(s))?;
    bytes
        .try_into()
        .map_err(|_| WireError::InvalidLength(what))
}

fn amount_to_wire(amount: U256) -> String {
    amount.to_string()
}

fn amount_from_wire(s: &str) -> Result<U256, WireError> {
    U256::from_dec_str(s).map_err(|_| WireError::InvalidAmount(s.to_string()))
}

fn address_from_wire(s: &str) -> Result<Address, WireError> {
    Ok(Address(from_hex(s, "address")?))
}

fn destination_from_wire(s: &str) -> Result<Destination, WireError> {
    Ok(Destination(from_hex(s, "destination")?))
}

#[derive(Serialize, Deserialize)]
struct WireSignature {
    #[serde(rename = "R")]
    r: String,
    #[serde(rename = "S")]
    s: String,
    #[serde(rename = "V")]
    v: u8,
}

impl From<&Signature> for WireSignature {
    fn from(sig: &Signature) -> Self {
        WireSignature {
            r: to_hex(&sig.r()),
            s: to_hex(&sig.s()),
            v: sig.v(),
        }
    }
}

impl TryFrom<&WireSignature> for Signature {
    type Error = WireError;

    fn try_from(wire: &WireSignature) -> Result<Signature, WireError> {
        let r: [u8; 32] = from_hex(&wire.r, "signature r")?;
        let s: [u8; 32] = from_hex(&wire.s, "signature s")?;
        let mut rs = [0u8; 64];
        rs[..32].copy_from_slice(&r);
        rs[32..].copy_from_slice(&s);
        Ok(Signature::new(&rs, wire.v))
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireAllocation {
    destination: String,
    amount: String,
    allocation_type: u8,
    metadata: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireSingleAssetExit {
    asset: String,
    metadata: String,
    allocations: Vec<WireAllocation>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireState {
    chain_id: u64,
    participants: Vec<String>,
    channel_nonce: u64,
    app_definition: String,
    challenge_duration: u32,
    app_data: String,
    outcome: Vec<WireSingleAssetExit>,
    turn_num: u64,
    is_final: bool,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireSignedState {
    state: WireState,
    sigs: BTreeMap<u32, WireSignature>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WirePayload {
    objective_id: String,
    payload_data: String,
    #[serde(rename = "Type", default)]
    payload_type: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireGuarantee {
    amount: String,
    target: String,
    left: String,
    right: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireAdd {
    guarantee: WireGuarantee,
    left_deposit: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireRemove {
    target: String,
    left_amount: String,
}

#[derive(Serialize, Deserialize)]
struct WireProposal {
    #[serde(rename = "LedgerID")]
    ledger_id: String,
    #[serde(rename = "ToAdd", skip_serializing_if = "Option::is_none", default)]
    to_add: Option<WireAdd>,
    #[serde(rename = "ToRemove", skip_serializing_if = "Option::is_none", default)]
    to_remove: Option<WireRemove>,
}

#[derive(Serialize, Deserialize)]
struct WireSignedProposal {
    #[serde(rename = "R")]
    r: String,
    #[serde(rename = "S")]
    s: String,
    #[serde(rename = "V")]
    v: u8,
    #[serde(rename = "Proposal")]
    proposal: WireProposal,
    #[serde(rename = "TurnNum")]
    turn_num: u64,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireVoucher {
    channel_id: String,
    amount: String,
    signature: WireSignature,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireMessage {
    to: String,
    #[serde(default)]
    objective_payloads: Vec<WirePayload>,
    #[serde(default)]
    ledger_proposals: Vec<WireSignedProposal>,
    #[serde(default)]
    payments: Vec<WireVoucher>,
    #[serde(default)]
    rejected_objectives: Vec<String>,
}

impl From<&State> for WireState {
    fn from(state: &State) -> Self {
        WireState {
            chain_id: state.chain_id,
            participants: state.participants.iter().map(|p| to_hex(&p.0)).collect(),
            channel_nonce: state.channel_nonce,
            app_definition: to_hex(&state.app_definition.0),
            challenge_duration: state.challenge_duration,
            app_data: BASE64.encode(&state.app_data),
            outcome: state
                .outcome
                .0
                .iter()
                .map(|sae| WireSingleAssetExit {
                    asset: to_hex(&sae.asset.0),
                    metadata: BASE64.encode(&sae.metadata),
                    allocations: sae
                        .allocations
                        .0
                        .iter()
                        .map(|a| WireAllocation {
                            destination: to_hex(&a.destination.0),
                            amount: amount_to_wire(a.amount),
                            allocation_type: a.allocation_type as u8,
                            metadata: BASE64.encode(&a.metadata),
                        })
                        .collect(),
                })
                .collect(),
            turn_num: state.turn_num,
            is_final: state.is_final,
        }
    }
}

impl TryFrom<&WireState> for State {
    type Error = WireError;

    fn try_from(wire: &WireState) -> Result<State, WireError> {
        let participants = wire
            .participants
            .iter()
            .map(|p| address_from_wire(p))
            .collect::<Result<Vec<_>, _>>()?;
        let outcome = Exit(
            wire.outcome
                .iter()
                .map(|sae| {
                    Ok(SingleAssetExit {
                        asset: address_from_wire(&sae.asset)?,
                        metadata: BASE64.decode(&sae.metadata)?,
                        allocations: Allocations(
                            sae.allocations
                                .iter()
                                .map(|a| {
                                    Ok(Allocation {
                                        destination: destination_from_wire(&a.destination)?,
                                        amount: amount_from_wire(&a.amount)?,
                                        allocation_type: match a.allocation_type {
                                            0 => AllocationType::Simple,
                                            1 => AllocationType::Guarantee,
                                            t => {
                                                return Err(WireError::UnknownAllocationType(t))
                                            }
                                        },
                                        metadata: BASE64.decode(&a.metadata)?,
                                    })
                                })
                                .collect::<Result<Vec<_>, WireError>>()?,
                        ),
                    })
                })
                .collect::<Result<Vec<_>, WireError>>()?,
        );
        Ok(State {
            chain_id: wire.chain_id,
            participants,
            channel_nonce: wire.channel_nonce,
            app_definition: address_from_wire(&wire.app_definition)?,
            challenge_duration: wire.challenge_duration,
            app_data: BASE64.decode(&wire.app_data)?,
            outcome,
            turn_num: wire.turn_num,
            is_final: wire.is_final,
        })
    }
}

impl TryFrom<&SignedState> for WireSignedState {
    type Error = WireError;

    fn try_from(ss: &SignedState) -> Result<WireSignedState, WireError> {
        Ok(WireSignedState {
            state: ss.state().into(),
            sigs: ss
                .signatures()
                .iter()
                .map(|(i, sig)| (*i as u32, sig.into()))
                .collect(),
        })
    }
}

impl TryFrom<&WireSignedState> for SignedState {
    type Error = WireError;

    /// Rebuilds the signed state by recovering every signature; the index
    /// keys on the wire are not trusted.
    fn try_from(wire: &WireSignedState) -> Result<SignedState, WireError> {
        let state: State = (&wire.state).try_into()?;
        let mut ss = SignedState::new(state);
        for sig in wire.sigs.values() {
            ss.add_signature(sig.try_into()?)?;
        }
        Ok(ss)
    }
}

impl From<&Proposal> for WireProposal {
    fn from(p: &Proposal) -> Self {
        let (to_add, to_remove) = match &p.change {
            Change::Add(add) => (
                Some(WireAdd {
                    guarantee: WireGuarantee {
                        amount: amount_to_wire(add.guarantee.amount),
                        target: to_hex(&add.guarantee.target.0),
                        left: to_hex(&add.guarantee.left.0),
                        right: to_hex(&add.guarantee.right.0),
                    },
                    left_deposit: amount_to_wire(add.left_deposit),
                }),
                None,
            ),
            Change::Remove(remove) => (
                None,
                Some(WireRemove {
                    target: to_hex(&remove.target.0),
                    left_amount: amount_to_wire(remove.left_amount),
                }),
            ),
        };
        WireProposal {
            ledger_id: to_hex(&p.ledger_id.0),
            to_add,
            to_remove,
        }
    }
}

impl TryFrom<&WireProposal> for Proposal {
    type Error = WireError;

    fn try_from(wire: &WireProposal) -> Result<Proposal, WireError> {
        let ledger_id = destination_from_wire(&wire.ledger_id)?;
        match (&wire.to_add, &wire.to_remove) {
            (Some(add), None) => Ok(Proposal::add(
                ledger_id,
                crate::consensus_channel::Guarantee::new(
                    amount_from_wire(&add.guarantee.amount)?,
                    destination_from_wire(&add.guarantee.target)?,
                    destination_from_wire(&add.guarantee.left)?,
                    destination_from_wire(&add.guarantee.right)?,
                ),
                amount_from_wire(&add.left_deposit)?,
            )),
            (None, Some(remove)) => Ok(Proposal::remove(
                ledger_id,
                destination_from_wire(&remove.target)?,
                amount_from_wire(&remove.left_amount)?,
            )),
            _ => Err(WireError::AmbiguousProposal),
        }
    }
}

impl From<&SignedProposal> for WireSignedProposal {
    fn from(sp: &SignedProposal) -> Self {
        let sig = WireSignature::from(&sp.signature);
        WireSignedProposal {
            r: sig.r,
            s: sig.s,
            v: sig.v,
            proposal: (&sp.proposal).into(),
            turn_num: sp.turn_num,
        }
    }
}

impl TryFrom<&WireSignedProposal> for SignedProposal {
    type Error = WireError;

    fn try_from(wire: &WireSignedProposal) -> Result<SignedProposal, WireError> {
        let sig = WireSignature {
            r: wire.r.clone(),
            s: wire.s.clone(),
            v: wire.v,
        };
        Ok(SignedProposal {
            proposal: (&wire.proposal).try_into()?,
            turn_num: wire.turn_num,
            signature: (&sig).try_into()?,
        })
    }
}

impl TryFrom<&Message> for WireMessage {
    type Error = WireError;

    fn try_from(msg: &Message) -> Result<WireMessage, WireError> {
        let objective_payloads = msg
            .objective_payloads
            .iter()
            .map(|p| {
                let data = serde_json::to_vec(&WireSignedState::try_from(&p.signed_state)?)?;
                Ok(WirePayload {
                    objective_id: p.objective_id.clone(),
                    payload_data: BASE64.encode(data),
                    payload_type: String::new(),
                })
            })
            .collect::<Result<Vec<_>, WireError>>()?;
        Ok(WireMessage {
            to: to_hex(&msg.to.0),
            objective_payloads,
            ledger_proposals: msg.ledger_proposals.iter().map(Into::into).collect(),
            payments: msg
                .payments
                .iter()
                .map(|v| WireVoucher {
                    channel_id: to_hex(&v.channel_id.0),
                    amount: amount_to_wire(v.amount),
                    signature: (&v.signature).into(),
                })
                .collect(),
            rejected_objectives: msg.rejected_objectives.clone(),
        })
    }
}

impl TryFrom<WireMessage> for Message {
    type Error = WireError;

    fn try_from(wire: WireMessage) -> Result<Message, WireError> {
        let objective_payloads = wire
            .objective_payloads
            .iter()
            .map(|p| {
                let data = BASE64.decode(&p.payload_data)?;
                let wire_ss: WireSignedState = serde_json::from_slice(&data)?;
                Ok(ObjectivePayload {
                    objective_id: p.objective_id.clone(),
                    signed_state: (&wire_ss).try_into()?,
                })
            })
            .collect::<Result<Vec<_>, WireError>>()?;
        let ledger_proposals = wire
            .ledger_proposals
            .iter()
            .map(TryInto::try_into)
            .collect::<Result<Vec<_>, WireError>>()?;
        let payments = wire
            .payments
            .iter()
            .map(|v| {
                Ok(Voucher {
                    channel_id: destination_from_wire(&v.channel_id)?,
                    amount: amount_from_wire(&v.amount)?,
                    signature: (&v.signature).try_into()?,
                })
            })
            .collect::<Result<Vec<_>, WireError>>()?;
        Ok(Message {
            to: address_from_wire(&wire.to)?,
            objective_payloads,
            ledger_proposals,
            payments,
            rejected_objectives: wire.rejected_objectives,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus_channel::Guarantee;
    use crate::payments::Voucher;
    use crate::testactors::{alice, bob, test_state};

    #[test]
    fn message_round_trips_through_json() {
        let state = test_state(vec![alice().address(), bob().address()], 0);
        let mut ss = SignedState::new(state);
        ss.sign_and_add(&alice().secret_key()).unwrap();

        let add = Proposal::add(
            Destination([0x6c; 32]),
            Guarantee::new(
                U256::from(1),
                Destination([0x61; 32]),
                Destination([0x62; 32]),
                Destination([0x63; 32]),
            ),
            U256::from(1),
        );
        let remove = Proposal::remove(Destination([0x6c; 32]), Destination([0x61; 32]), U256::from(1));

        let voucher = Voucher::new_signed(
            Destination([0x64; 32]),
            U256::from(123),
            &alice().secret_key(),
        )
        .unwrap();

        let msg = Message {
            to: bob().address(),
            objective_payloads: vec![ObjectivePayload {
                objective_id: "DirectFunding-0x01".to_string(),
                signed_state: ss,
            }],
            ledger_proposals: vec![
                SignedProposal {
                    proposal: add,
                    turn_num: 2,
                    signature: Signature::new(&[7; 64], 27),
                },
                SignedProposal {
                    proposal: remove,
                    turn_num: 3,
                    signature: Signature::new(&[8; 64], 28),
                },
            ],
            payments: vec![voucher],
            rejected_objectives: vec!["VirtualFund-0x02".to_string()],
        };

        let raw = msg.serialize().unwrap();
        let parsed = Message::deserialize(&raw).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn wire_format_uses_documented_field_names() {
        let msg = Message {
            to: bob().address(),
            ..Message::default()
        };
        let raw = msg.serialize().unwrap();
        assert!(raw.contains("\"To\""));
        assert!(raw.contains("\"ObjectivePayloads\""));
        assert!(raw.contains("\"LedgerProposals\""));
        assert!(raw.contains("\"Payments\""));
        assert!(raw.contains("\"RejectedObjectives\""));
        assert!(raw.starts_with('{'));
    }

    #[test]
    fn forged_signature_indices_are_ignored() {
        let state = test_state(vec![alice().address(), bob().address()], 0);
        let mut ss = SignedState::new(state);
        ss.sign_and_add(&alice().secret_key()).unwrap();

        let mut wire = WireSignedState::try_from(&ss).unwrap();
        // claim alice's signature belongs to participant 1 (bob)
        let sig = wire.sigs.remove(&0).unwrap();
        wire.sigs.insert(1, sig);

        let rebuilt: SignedState = (&wire).try_into().unwrap();
        // recovery puts it back at index 0
        assert!(rebuilt.has_signature_for(0));
        assert!(!rebuilt.has_signature_for(1));
    }

    #[test]
    fn malformed_messages_are_rejected() {
        assert!(Message::deserialize("not json").is_err());
        assert!(Message::deserialize("{\"To\":\"0x1234\"}").is_err());

        // proposal with neither add nor remove
        let raw = r#"{"To":"0x0000000000000000000000000000000000000001",
            "LedgerProposals":[{"R":"0x00","S":"0x00","V":0,
            "Proposal":{"LedgerID":"0x6c00000000000000000000000000000000000000000000000000000000000000"},
            "TurnNum":1}]}"#;
        assert!(Message::deserialize(raw).is_err());
    }
}
