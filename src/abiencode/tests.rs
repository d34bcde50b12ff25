use super::{
    as_bytes, to_bytes,
    types::{Address, Hash, U256},
};
use serde::Serialize;

/// Encodes `value` and compares against the expected hex (whitespace in the
/// expectation is ignored, so slots can be written one per line).
pub fn serialize_and_compare<T>(value: &T, expected: &str)
where
    T: Serialize,
{
    let encoded = to_bytes(value).unwrap();
    let expected: String = expected.split_whitespace().collect();
    assert_eq!(hex::encode(encoded), expected);
}

#[derive(Serialize)]
struct TwoUints {
    a: u64,
    b: u64,
}

#[test]
fn static_struct_encodes_inline() {
    // Static structs have no leading offset slot.
    serialize_and_compare(
        &TwoUints {
            a: 0x1111,
            b: 0x2222,
        },
        "
        0000000000000000000000000000000000000000000000000000000000001111
        0000000000000000000000000000000000000000000000000000000000002222
        ",
    );
}

#[derive(Serialize)]
struct OneAddress {
    addr: Address,
}

#[test]
fn address_is_right_aligned() {
    let addr = Address(<[u8; 20]>::try_from(
        hex::decode("5b38da6a701c568545dcfcb03fcb875f56beddc4").unwrap(),
    )
    .unwrap());
    serialize_and_compare(
        &OneAddress { addr },
        "0000000000000000000000005b38da6a701c568545dcfcb03fcb875f56beddc4",
    );
}

#[derive(Serialize)]
struct OneHash {
    h: Hash,
}

#[test]
fn bytes32_is_left_aligned() {
    serialize_and_compare(
        &OneHash {
            h: Hash(*b"1111\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0"),
        },
        "3131313100000000000000000000000000000000000000000000000000000000",
    );
}

#[derive(Serialize)]
struct OneUint256 {
    x: U256,
}

#[test]
fn u256_fills_one_slot() {
    serialize_and_compare(
        &OneUint256 {
            x: U256::from(0x5555),
        },
        "0000000000000000000000000000000000000000000000000000000000005555",
    );
}

#[derive(Serialize)]
struct WithDynArray {
    a: u64,
    data: Vec<u64>,
}

#[test]
fn dynamic_array_goes_to_tail() {
    // Dynamic struct: leading offset, static field inline, array offset,
    // then length + elements in the tail.
    serialize_and_compare(
        &WithDynArray {
            a: 1,
            data: vec![2, 3],
        },
        "
        0000000000000000000000000000000000000000000000000000000000000020
        0000000000000000000000000000000000000000000000000000000000000001
        0000000000000000000000000000000000000000000000000000000000000040
        0000000000000000000000000000000000000000000000000000000000000002
        0000000000000000000000000000000000000000000000000000000000000002
        0000000000000000000000000000000000000000000000000000000000000003
        ",
    );
}

#[derive(Serialize)]
struct WithBytes {
    #[serde(with = "as_bytes")]
    data: Vec<u8>,
}

#[test]
fn dynamic_bytes_encode_with_length() {
    serialize_and_compare(
        &WithBytes {
            data: b"hello".to_vec(),
        },
        "
        0000000000000000000000000000000000000000000000000000000000000020
        0000000000000000000000000000000000000000000000000000000000000020
        0000000000000000000000000000000000000000000000000000000000000005
        68656c6c6f000000000000000000000000000000000000000000000000000000
        ",
    );
}

#[test]
fn empty_bytes_encode_as_zero_length() {
    serialize_and_compare(
        &WithBytes { data: vec![] },
        "
        0000000000000000000000000000000000000000000000000000000000000020
        0000000000000000000000000000000000000000000000000000000000000020
        0000000000000000000000000000000000000000000000000000000000000000
        ",
    );
}

#[derive(Serialize)]
struct NamedBlob {
    tag: u64,
    #[serde(with = "as_bytes")]
    data: Vec<u8>,
}

#[derive(Serialize)]
struct Holder {
    blobs: Vec<NamedBlob>,
}

#[test]
fn dynamic_elements_get_per_element_offsets() {
    // Dynamic structs inside a dynamic array: the array head carries one
    // offset per element, measured from just after the length word, and
    // each element resolves its own inner offsets independently.
    serialize_and_compare(
        &Holder {
            blobs: vec![
                NamedBlob {
                    tag: 1,
                    data: vec![0xaa],
                },
                NamedBlob {
                    tag: 2,
                    data: vec![0xbb],
                },
            ],
        },
        "
        0000000000000000000000000000000000000000000000000000000000000020
        0000000000000000000000000000000000000000000000000000000000000020
        0000000000000000000000000000000000000000000000000000000000000002
        0000000000000000000000000000000000000000000000000000000000000040
        00000000000000000000000000000000000000000000000000000000000000c0
        0000000000000000000000000000000000000000000000000000000000000001
        0000000000000000000000000000000000000000000000000000000000000040
        0000000000000000000000000000000000000000000000000000000000000001
        aa00000000000000000000000000000000000000000000000000000000000000
        0000000000000000000000000000000000000000000000000000000000000002
        0000000000000000000000000000000000000000000000000000000000000040
        0000000000000000000000000000000000000000000000000000000000000001
        bb00000000000000000000000000000000000000000000000000000000000000
        ",
    );
}

#[derive(Serialize)]
struct TwoHashes {
    left: Hash,
    right: Hash,
}

#[test]
fn static_pair_encodes_to_64_bytes() {
    let encoded = to_bytes(&TwoHashes {
        left: Hash([0x11; 32]),
        right: Hash([0x22; 32]),
    })
    .unwrap();
    assert_eq!(encoded.len(), 64);
    assert_eq!(encoded[..32], [0x11; 32]);
    assert_eq!(encoded[32..], [0x22; 32]);
}
