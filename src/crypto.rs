//! Creation and verification of Ethereum signatures over keccak256 digests.

use crate::abiencode::types::{Address, Hash, Signature};
use secp256k1::{
    ecdsa::{RecoverableSignature, RecoveryId},
    Message, PublicKey, SecretKey, ThirtyTwoByteHash, SECP256K1,
};
use sha3::{Digest, Keccak256};

pub use secp256k1::Error;

impl ThirtyTwoByteHash for Hash {
    fn into_32(self) -> [u8; 32] {
        self.0
    }
}

impl From<PublicKey> for Address {
    fn from(pk: PublicKey) -> Self {
        // Throw away the first byte of the uncompressed encoding, it is a
        // format tag and not part of the public key.
        let hash: [u8; 32] = Keccak256::digest(&pk.serialize_uncompressed()[1..]).into();

        let mut addr = Address([0; 20]);
        addr.0.copy_from_slice(&hash[32 - 20..]);
        addr
    }
}

/// The address whose signatures `sk` produces.
pub fn address_from_secret_key(sk: &SecretKey) -> Address {
    PublicKey::from_secret_key(SECP256K1, sk).into()
}

/// `keccak256("\x19Ethereum Signed Message:\n32" ‖ hash)`, the digest that is
/// actually signed. Contracts recover against this prefixed form.
fn eth_signed_msg_hash(hash: Hash) -> Hash {
    let mut hasher = Keccak256::new();
    hasher.update(b"\x19Ethereum Signed Message:\n32");
    hasher.update(hash.0);
    Hash(hasher.finalize().into())
}

/// Sign a digest with a 65-byte recoverable Ethereum signature.
pub fn sign_eth(msg: Hash, sk: &SecretKey) -> Signature {
    let hash = eth_signed_msg_hash(msg);

    // The recoverable variant is required so the adjudicator can recover the
    // signer address; it provides the extra information needed for v.
    let sig = SECP256K1.sign_ecdsa_recoverable(&Message::from(hash), sk);

    let (v, rs) = sig.serialize_compact();

    // The library produces canonical (EIP-2) signatures; contracts reject
    // the non-canonical solution.
    debug_assert!(rs[32] & 0x80 == 0);

    // v is offset by 27 for historic compatibility with Bitcoin prefixes.
    let v: u8 = 27 + v.to_i32() as u8;

    Signature::new(&rs, v)
}

/// Recover the signer address from a signature produced by [sign_eth].
///
/// `msg` is the unprefixed digest that was passed to [sign_eth].
pub fn recover_signer(msg: Hash, sig: &Signature) -> Result<Address, Error> {
    let hash = eth_signed_msg_hash(msg);

    let rs = &sig.0[..64];
    let v = sig.0[64].wrapping_sub(27);

    let recid = RecoveryId::from_i32(v.into())?;
    let sig = RecoverableSignature::from_compact(rs, recid)?;

    let pk = SECP256K1.recover_ecdsa(&Message::from(hash), &sig)?;

    Ok(pk.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    #[test]
    fn sign_and_recover_round_trip() {
        let mut rng = StdRng::seed_from_u64(0);
        let (sk, pk) = SECP256K1.generate_keypair(&mut rng);
        let addr: Address = pk.into();
        assert_eq!(addr, address_from_secret_key(&sk));

        let digest: Hash = rng.gen();
        let sig = sign_eth(digest, &sk);
        assert_eq!(recover_signer(digest, &sig).unwrap(), addr);
    }

    #[test]
    fn tampered_signature_recovers_wrong_address() {
        let mut rng = StdRng::seed_from_u64(1);
        let (sk, pk) = SECP256K1.generate_keypair(&mut rng);

        let digest: Hash = rng.gen();
        let mut sig = sign_eth(digest, &sk);
        sig.0[3] ^= 0xff;

        match recover_signer(digest, &sig) {
            Ok(addr) => assert_ne!(addr, pk.into()),
            Err(_) => {} // an invalid point is just as acceptable
        }
    }
}
