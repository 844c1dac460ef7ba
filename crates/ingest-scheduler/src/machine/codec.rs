//! Key and value codecs for the machine's databases.

use std::borrow::Cow;

use heed::{BoxedError, BytesDecode, BytesEncode};
use roaring::RoaringBitmap;

/// A codec for `RoaringBitmap` values using the native serialization.
pub struct RoaringBitmapCodec;

impl BytesDecode<'_> for RoaringBitmapCodec {
    type DItem = RoaringBitmap;

    fn bytes_decode(bytes: &[u8]) -> Result<Self::DItem, BoxedError> {
        RoaringBitmap::deserialize_unchecked_from(bytes).map_err(Into::into)
    }
}

impl BytesEncode<'_> for RoaringBitmapCodec {
    type EItem = RoaringBitmap;

    fn bytes_encode(item: &Self::EItem) -> Result<Cow<'_, [u8]>, BoxedError> {
        let mut bytes = Vec::with_capacity(item.serialized_size());
        item.serialize_into(&mut bytes)?;
        Ok(Cow::Owned(bytes))
    }
}

/// A codec for `(u32, &str)` keys: the id big-endian, then the str bytes.
/// Encoding the pair `(id, "")` yields the prefix of every key of that id.
pub struct BEU32StrCodec;

impl<'a> BytesEncode<'a> for BEU32StrCodec {
    type EItem = (u32, &'a str);

    fn bytes_encode((id, tail): &Self::EItem) -> Result<Cow<'a, [u8]>, BoxedError> {
        let mut bytes = Vec::with_capacity(4 + tail.len());
        bytes.extend_from_slice(&id.to_be_bytes());
        bytes.extend_from_slice(tail.as_bytes());
        Ok(Cow::Owned(bytes))
    }
}

impl<'a> BytesDecode<'a> for BEU32StrCodec {
    type DItem = (u32, &'a str);

    fn bytes_decode(bytes: &'a [u8]) -> Result<Self::DItem, BoxedError> {
        let (head, tail) = bytes.split_at_checked(4).ok_or("key shorter than its u32 head")?;
        let id = u32::from_be_bytes(head.try_into()?);
        Ok((id, std::str::from_utf8(tail)?))
    }
}

/// A codec for `(u32, &[u8])` keys: the id big-endian, then the raw bytes.
/// Encoding the pair `(id, &[])` yields the prefix of every key of that id.
pub struct BEU32BytesCodec;

impl<'a> BytesEncode<'a> for BEU32BytesCodec {
    type EItem = (u32, &'a [u8]);

    fn bytes_encode((id, tail): &Self::EItem) -> Result<Cow<'a, [u8]>, BoxedError> {
        let mut bytes = Vec::with_capacity(4 + tail.len());
        bytes.extend_from_slice(&id.to_be_bytes());
        bytes.extend_from_slice(tail);
        Ok(Cow::Owned(bytes))
    }
}

impl<'a> BytesDecode<'a> for BEU32BytesCodec {
    type DItem = (u32, &'a [u8]);

    fn bytes_decode(bytes: &'a [u8]) -> Result<Self::DItem, BoxedError> {
        let (head, tail) = bytes.split_at_checked(4).ok_or("key shorter than its u32 head")?;
        Ok((u32::from_be_bytes(head.try_into()?), tail))
    }
}

/// A codec for `(u32, u32, &[u8])` keys, both ids big-endian.
pub struct BEU32U32BytesCodec;

impl<'a> BytesEncode<'a> for BEU32U32BytesCodec {
    type EItem = (u32, u32, &'a [u8]);

    fn bytes_encode((first, second, tail): &Self::EItem) -> Result<Cow<'a, [u8]>, BoxedError> {
        let mut bytes = Vec::with_capacity(8 + tail.len());
        bytes.extend_from_slice(&first.to_be_bytes());
        bytes.extend_from_slice(&second.to_be_bytes());
        bytes.extend_from_slice(tail);
        Ok(Cow::Owned(bytes))
    }
}

impl<'a> BytesDecode<'a> for BEU32U32BytesCodec {
    type DItem = (u32, u32, &'a [u8]);

    fn bytes_decode(bytes: &'a [u8]) -> Result<Self::DItem, BoxedError> {
        let (head, tail) = bytes.split_at_checked(8).ok_or("key shorter than its u32 pair")?;
        let first = u32::from_be_bytes(head[..4].try_into()?);
        let second = u32::from_be_bytes(head[4..].try_into()?);
        Ok((first, second, tail))
    }
}
