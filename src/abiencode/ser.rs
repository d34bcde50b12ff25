//! Serde-driven `abi.encode(...)` encoding.
//!
//! Values are encoded bottom-up through a stack of frames, one per
//! composite value. A frame collects 32-byte head slots and the finished
//! encodings of its dynamic members; closing a frame either splices its
//! slots into the parent (static tuples inline) or resolves the member
//! offsets and attaches the result as a dynamic member of the parent.
//! The root frame is the argument list itself, which is what puts the
//! leading offset slot in front of a dynamic top-level value, exactly as
//! `abi.encode` does.
//!
//! `serialize_bytes` is Solidity `bytes` (length-prefixed, padded). The
//! word-sized leaf types (addresses, hashes, uint256) funnel through
//! [serialize_word], which tags its payload with a reserved newtype name
//! so the encoder writes it as a single head slot instead.

use serde::{ser, Serialize};
use sha3::{Digest, Keccak256};

use super::error::{Error, Result};
use super::types::Hash;

const WORD: usize = 32;

/// Reserved newtype name marking a payload that occupies exactly one head
/// slot.
const WORD_TYPE: &str = "abiencode::Word";

/// Serialize 32 already-aligned bytes as a single head slot. The custom
/// `Serialize` impls of the word-sized types go through this.
pub fn serialize_word<S>(word: [u8; 32], serializer: S) -> core::result::Result<S::Ok, S::Error>
where
    S: ser::Serializer,
{
    struct Raw([u8; 32]);

    impl Serialize for Raw {
        fn serialize<S>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error>
        where
            S: ser::Serializer,
        {
            serializer.serialize_bytes(&self.0)
        }
    }

    serializer.serialize_newtype_struct(WORD_TYPE, &Raw(word))
}

/// Encode a value the way `abi.encode(value)` would.
pub fn to_bytes<T>(value: &T) -> Result<Vec<u8>>
where
    T: Serialize,
{
    let mut encoder = Encoder::new();
    value.serialize(&mut encoder)?;
    Ok(encoder.finish())
}

/// `keccak256(abi.encode(value))`.
pub fn to_hash<T>(value: &T) -> Result<Hash>
where
    T: Serialize,
{
    Ok(Hash(Keccak256::digest(to_bytes(value)?).into()))
}

fn uint_word(n: usize) -> [u8; WORD] {
    let mut word = [0u8; WORD];
    word[WORD - 8..].copy_from_slice(&(n as u64).to_be_bytes());
    word
}

/// One head slot: literal bytes, or the yet-unresolved offset of the
/// frame's n-th dynamic member.
enum Slot {
    Literal([u8; WORD]),
    OffsetOf(usize),
}

/// Encoding state for one composite value.
struct Frame {
    /// Length prefix for arrays; tuples and structs have none.
    array_len: Option<usize>,
    slots: Vec<Slot>,
    members: Vec<Vec<u8>>,
}

impl Frame {
    fn tuple() -> Frame {
        Frame {
            array_len: None,
            slots: Vec::new(),
            members: Vec::new(),
        }
    }

    fn array(len: usize) -> Frame {
        Frame {
            array_len: Some(len),
            ..Frame::tuple()
        }
    }

    /// Arrays are always dynamic; a tuple is dynamic once it carries a
    /// dynamic member.
    fn is_dynamic(&self) -> bool {
        self.array_len.is_some() || !self.members.is_empty()
    }

    /// Lay the frame out: optional length word, head slots with offsets
    /// resolved, then the members. Member offsets are measured from the
    /// start of the head, which for arrays is the slot right after the
    /// length word.
    fn into_bytes(self) -> Vec<u8> {
        let head_size = self.slots.len() * WORD;
        let mut offsets = Vec::with_capacity(self.members.len());
        let mut at = head_size;
        for member in &self.members {
            offsets.push(at);
            at += member.len();
        }

        let mut out = Vec::with_capacity(WORD + at);
        if let Some(len) = self.array_len {
            out.extend_from_slice(&uint_word(len));
        }
        for slot in self.slots {
            match slot {
                Slot::Literal(word) => out.extend_from_slice(&word),
                Slot::OffsetOf(member) => out.extend_from_slice(&uint_word(offsets[member])),
            }
        }
        for member in self.members {
            out.extend_from_slice(&member);
        }
        out
    }
}

pub struct Encoder {
    root: Frame,
    stack: Vec<Frame>,
    next_is_word: bool,
}

impl Encoder {
    fn new() -> Encoder {
        Encoder {
            root: Frame::tuple(),
            stack: Vec::new(),
            next_is_word: false,
        }
    }

    fn top(&mut self) -> &mut Frame {
        match self.stack.last_mut() {
            Some(frame) => frame,
            None => &mut self.root,
        }
    }

    fn push_word(&mut self, word: [u8; WORD]) {
        self.top().slots.push(Slot::Literal(word));
    }

    fn attach_member(&mut self, bytes: Vec<u8>) {
        let frame = self.top();
        frame.slots.push(Slot::OffsetOf(frame.members.len()));
        frame.members.push(bytes);
    }

    fn open(&mut self, frame: Frame) {
        self.stack.push(frame);
    }

    fn close(&mut self) {
        // serde pairs every end() with the begin that opened the frame
        let Some(frame) = self.stack.pop() else { return };
        if frame.is_dynamic() {
            let bytes = frame.into_bytes();
            self.attach_member(bytes);
        } else {
            self.top().slots.extend(frame.slots);
        }
    }

    /// Length-prefixed, zero-padded `bytes` payload.
    fn encode_bytes(&mut self, data: &[u8]) {
        let mut blob = Vec::with_capacity(WORD + data.len() + WORD);
        blob.extend_from_slice(&uint_word(data.len()));
        for chunk in data.chunks(WORD) {
            let mut word = [0u8; WORD];
            word[..chunk.len()].copy_from_slice(chunk);
            blob.extend_from_slice(&word);
        }
        self.attach_member(blob);
    }

    fn finish(self) -> Vec<u8> {
        self.root.into_bytes()
    }
}

macro_rules! encode_uint {
    ($($method:ident: $ty:ty,)*) => {$(
        fn $method(self, v: $ty) -> Result<()> {
            let be = v.to_be_bytes();
            let mut word = [0u8; WORD];
            word[WORD - be.len()..].copy_from_slice(&be);
            self.push_word(word);
            Ok(())
        }
    )*};
}

macro_rules! encode_int {
    ($($method:ident: $ty:ty,)*) => {$(
        fn $method(self, v: $ty) -> Result<()> {
            let be = v.to_be_bytes();
            let mut word = [if v < 0 { 0xff } else { 0x00 }; WORD];
            word[WORD - be.len()..].copy_from_slice(&be);
            self.push_word(word);
            Ok(())
        }
    )*};
}

impl<'a> ser::Serializer for &'a mut Encoder {
    type Ok = ();
    type Error = Error;

    type SerializeSeq = Self;
    type SerializeTuple = Self;
    type SerializeTupleStruct = Self;
    type SerializeTupleVariant = ser::Impossible<(), Error>;
    type SerializeMap = ser::Impossible<(), Error>;
    type SerializeStruct = Self;
    type SerializeStructVariant = ser::Impossible<(), Error>;

    encode_uint! {
        serialize_u8: u8,
        serialize_u16: u16,
        serialize_u32: u32,
        serialize_u64: u64,
        serialize_u128: u128,
    }

    encode_int! {
        serialize_i8: i8,
        serialize_i16: i16,
        serialize_i32: i32,
        serialize_i64: i64,
        serialize_i128: i128,
    }

    fn serialize_bool(self, v: bool) -> Result<()> {
        self.serialize_u8(v as u8)
    }

    fn serialize_f32(self, _: f32) -> Result<()> {
        Err(Error::Unsupported("f32"))
    }

    fn serialize_f64(self, _: f64) -> Result<()> {
        Err(Error::Unsupported("f64"))
    }

    fn serialize_char(self, _: char) -> Result<()> {
        Err(Error::Unsupported("char"))
    }

    fn serialize_str(self, v: &str) -> Result<()> {
        self.encode_bytes(v.as_bytes());
        Ok(())
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<()> {
        if self.next_is_word {
            self.next_is_word = false;
            if v.len() != WORD {
                return Err(Error::Unsupported("word payloads must be 32 bytes"));
            }
            let mut word = [0u8; WORD];
            word.copy_from_slice(v);
            self.push_word(word);
        } else {
            self.encode_bytes(v);
        }
        Ok(())
    }

    fn serialize_none(self) -> Result<()> {
        Err(Error::Unsupported("optional values"))
    }

    fn serialize_some<T: ?Sized>(self, _: &T) -> Result<()>
    where
        T: Serialize,
    {
        Err(Error::Unsupported("optional values"))
    }

    fn serialize_unit(self) -> Result<()> {
        Err(Error::Unsupported("unit"))
    }

    fn serialize_unit_struct(self, _: &'static str) -> Result<()> {
        Err(Error::Unsupported("unit structs"))
    }

    fn serialize_unit_variant(self, _: &'static str, _: u32, _: &'static str) -> Result<()> {
        Err(Error::Unsupported("enum variants"))
    }

    fn serialize_newtype_struct<T: ?Sized>(self, name: &'static str, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        if name == WORD_TYPE {
            self.next_is_word = true;
        }
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: ?Sized>(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: &T,
    ) -> Result<()>
    where
        T: Serialize,
    {
        Err(Error::Unsupported("enum variants"))
    }

    fn serialize_seq(self, len: Option<usize>) -> Result<Self::SerializeSeq> {
        let len = len.ok_or(Error::Unsupported("sequences of unknown length"))?;
        self.open(Frame::array(len));
        Ok(self)
    }

    fn serialize_tuple(self, _: usize) -> Result<Self::SerializeTuple> {
        self.open(Frame::tuple());
        Ok(self)
    }

    fn serialize_tuple_struct(
        self,
        _: &'static str,
        _: usize,
    ) -> Result<Self::SerializeTupleStruct> {
        self.open(Frame::tuple());
        Ok(self)
    }

    fn serialize_tuple_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<Self::SerializeTupleVariant> {
        Err(Error::Unsupported("enum variants"))
    }

    fn serialize_map(self, _: Option<usize>) -> Result<Self::SerializeMap> {
        Err(Error::Unsupported("maps"))
    }

    fn serialize_struct(self, _: &'static str, _: usize) -> Result<Self::SerializeStruct> {
        self.open(Frame::tuple());
        Ok(self)
    }

    fn serialize_struct_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<Self::SerializeStructVariant> {
        Err(Error::Unsupported("enum variants"))
    }
}

impl<'a> ser::SerializeSeq for &'a mut Encoder {
    type Ok = ();
    type Error = Error;

    fn serialize_element<T: ?Sized>(&mut self, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<()> {
        self.close();
        Ok(())
    }
}

impl<'a> ser::SerializeTuple for &'a mut Encoder {
    type Ok = ();
    type Error = Error;

    fn serialize_element<T: ?Sized>(&mut self, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<()> {
        self.close();
        Ok(())
    }
}

impl<'a> ser::SerializeTupleStruct for &'a mut Encoder {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: ?Sized>(&mut self, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<()> {
        self.close();
        Ok(())
    }
}

impl<'a> ser::SerializeStruct for &'a mut Encoder {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: ?Sized>(&mut self, _: &'static str, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<()> {
        self.close();
        Ok(())
    }
}
