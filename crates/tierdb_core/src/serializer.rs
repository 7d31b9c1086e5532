//! Byte serializers for keys and values.

use crate::error::{CoreError, CoreResult};
use crate::schema::Deletable;
use std::marker::PhantomData;

/// Converts a value to and from bytes.
///
/// Serializers are stateless; the engine calls them through the schema.
pub trait Serializer<T>: Send + Sync + 'static {
    /// Appends the encoding of `value` to `out`.
    fn serialize(value: &T, out: &mut Vec<u8>);

    /// Decodes a value from exactly `bytes`.
    fn deserialize(bytes: &[u8]) -> CoreResult<T>;

    /// Encodes `value` into a fresh buffer.
    fn to_bytes(value: &T) -> Vec<u8> {
        let mut out = Vec::new();
        Self::serialize(value, &mut out);
        out
    }
}

/// Big-endian `u64`.
#[derive(Debug, Clone, Copy, Default)]
pub struct U64Serializer;

impl Serializer<u64> for U64Serializer {
    fn serialize(value: &u64, out: &mut Vec<u8>) {
        out.extend_from_slice(&value.to_be_bytes());
    }

    fn deserialize(bytes: &[u8]) -> CoreResult<u64> {
        let raw: [u8; 8] = bytes
            .try_into()
            .map_err(|_| CoreError::serialization(format!("u64 needs 8 bytes, got {}", bytes.len())))?;
        Ok(u64::from_be_bytes(raw))
    }
}

/// Big-endian `i64`.
#[derive(Debug, Clone, Copy, Default)]
pub struct I64Serializer;

impl Serializer<i64> for I64Serializer {
    fn serialize(value: &i64, out: &mut Vec<u8>) {
        out.extend_from_slice(&value.to_be_bytes());
    }

    fn deserialize(bytes: &[u8]) -> CoreResult<i64> {
        let raw: [u8; 8] = bytes
            .try_into()
            .map_err(|_| CoreError::serialization(format!("i64 needs 8 bytes, got {}", bytes.len())))?;
        Ok(i64::from_be_bytes(raw))
    }
}

/// UTF-8 strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringSerializer;

impl Serializer<String> for StringSerializer {
    fn serialize(value: &String, out: &mut Vec<u8>) {
        out.extend_from_slice(value.as_bytes());
    }

    fn deserialize(bytes: &[u8]) -> CoreResult<String> {
        String::from_utf8(bytes.to_vec())
            .map_err(|e| CoreError::serialization(format!("invalid UTF-8: {e}")))
    }
}

/// Raw byte strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesSerializer;

impl Serializer<Vec<u8>> for BytesSerializer {
    fn serialize(value: &Vec<u8>, out: &mut Vec<u8>) {
        out.extend_from_slice(value);
    }

    fn deserialize(bytes: &[u8]) -> CoreResult<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

/// [`Deletable`] values: the inner encoding followed by one flag byte.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeletableSerializer<S>(PhantomData<fn() -> S>);

impl<T, S> Serializer<Deletable<T>> for DeletableSerializer<S>
where
    S: Serializer<T>,
{
    fn serialize(value: &Deletable<T>, out: &mut Vec<u8>) {
        S::serialize(&value.value, out);
        out.push(u8::from(value.deleted));
    }

    fn deserialize(bytes: &[u8]) -> CoreResult<Deletable<T>> {
        let Some((&flag, inner)) = bytes.split_last() else {
            return Err(CoreError::serialization("deletable value is empty"));
        };
        Ok(Deletable {
            value: S::deserialize(inner)?,
            deleted: flag != 0,
        })
    }
}
