//! Decodes the dbus wire format into [`Value`]s, mirroring the marshaller:
//! same `Type` plan, walked against bytes instead of values.
//!
//! All helpers here thread an absolute offset into the original buffer
//! rather than re-slicing it, since alignment padding is computed from a
//! value's true position in the message, not its position relative to
//! whatever container happens to hold it.

use crate::signature::{Base, Container, Type};
use crate::value::Value;
use crate::wire::util::*;
use crate::wire::HeaderFields;
use crate::ByteOrder;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum UnmarshalError {
    #[error("not enough bytes remaining to decode the next value")]
    NotEnoughBytes,
    #[error("message did not consume all of its declared body bytes")]
    NotAllBytesUsed,
    #[error("found a byte order marker other than 'l' or 'B'")]
    InvalidByteOrder,
    #[error("found a message type outside 1..=4")]
    InvalidMessageType,
    #[error("a string was not valid utf-8")]
    InvalidUtf8,
    #[error("padding bytes before a value were not all zero")]
    PaddingContainedData,
    #[error("invalid signature: {0}")]
    Signature(#[from] crate::signature::Error),
    #[error("a header field array contained an unknown field index")]
    UnknownHeaderField,
    #[error("a header field's value did not match its declared type code")]
    InvalidHeaderField,
}

pub type UnmarshalResult<T> = std::result::Result<T, UnmarshalError>;

/// Decode `bytes` against `signature`. Returns the decoded values; does not
/// require the whole buffer to be consumed (callers needing that invariant,
/// like message body decoding, check it themselves).
pub fn decode(byteorder: ByteOrder, signature: &str, bytes: &[u8]) -> UnmarshalResult<Vec<Value>> {
    let plan = if signature.is_empty() {
        Vec::new()
    } else {
        Type::parse(signature)?
    };
    let mut offset = 0;
    let mut values = Vec::with_capacity(plan.len());
    for t in &plan {
        let (end, v) = decode_value(byteorder, t, bytes, offset)?;
        offset = end;
        values.push(v);
    }
    Ok(values)
}

/// Skip zero padding bringing `offset` up to a multiple of `align_to`.
/// Returns the new (aligned) offset.
fn align(align_to: usize, bytes: &[u8], offset: usize) -> UnmarshalResult<usize> {
    let rem = offset % align_to;
    let pad = if rem == 0 { 0 } else { align_to - rem };
    let region = bytes
        .get(offset..offset + pad)
        .ok_or(UnmarshalError::NotEnoughBytes)?;
    if region.iter().any(|b| *b != 0) {
        return Err(UnmarshalError::PaddingContainedData);
    }
    Ok(offset + pad)
}

/// Decode one value of type `t` starting at `offset` (after skipping its
/// alignment padding). Returns the offset just past the decoded value.
fn decode_value(
    byteorder: ByteOrder,
    t: &Type,
    bytes: &[u8],
    offset: usize,
) -> UnmarshalResult<(usize, Value)> {
    let start = align(t.alignment(), bytes, offset)?;
    let rest = bytes.get(start..).ok_or(UnmarshalError::NotEnoughBytes)?;

    match t {
        Type::Base(Base::Byte) => {
            let b = *rest.first().ok_or(UnmarshalError::NotEnoughBytes)?;
            Ok((start + 1, Value::Byte(b)))
        }
        Type::Base(Base::Boolean) => {
            let raw = parse_u32(rest, byteorder)?;
            Ok((start + 4, Value::Bool(raw != 0)))
        }
        Type::Base(Base::Int16) => Ok((start + 2, Value::Int16(parse_u16(rest, byteorder)? as i16))),
        Type::Base(Base::Uint16) => Ok((start + 2, Value::Uint16(parse_u16(rest, byteorder)?))),
        Type::Base(Base::Int32) => Ok((start + 4, Value::Int32(parse_u32(rest, byteorder)? as i32))),
        Type::Base(Base::Uint32) => Ok((start + 4, Value::Uint32(parse_u32(rest, byteorder)?))),
        Type::Base(Base::UnixFd) => Ok((start + 4, Value::UnixFd(parse_u32(rest, byteorder)?))),
        Type::Base(Base::Int64) => Ok((start + 8, Value::Int64(parse_u64(rest, byteorder)? as i64))),
        Type::Base(Base::Uint64) => Ok((start + 8, Value::Uint64(parse_u64(rest, byteorder)?))),
        Type::Base(Base::Double) => Ok((
            start + 8,
            Value::Double(f64::from_bits(parse_u64(rest, byteorder)?)),
        )),
        Type::Base(Base::String) => {
            let (used, s) = unmarshal_string(rest, byteorder)?;
            Ok((start + used, Value::Str(s)))
        }
        Type::Base(Base::ObjectPath) => {
            let (used, s) = unmarshal_string(rest, byteorder)?;
            Ok((start + used, Value::ObjectPath(s)))
        }
        Type::Base(Base::Signature) => {
            let (used, s) = unmarshal_signature(rest)?;
            Ok((start + used, Value::Signature(s)))
        }
        Type::Container(Container::Array(elem_t)) => decode_array(byteorder, elem_t, bytes, start),
        Type::Container(Container::Dict(key_base, val_t)) => {
            decode_dict(byteorder, *key_base, val_t, bytes, start)
        }
        Type::Container(Container::Struct(field_types)) => {
            decode_struct(byteorder, field_types, bytes, start)
        }
        Type::Container(Container::Variant) => decode_variant(byteorder, bytes, start),
    }
}

fn decode_array(
    byteorder: ByteOrder,
    elem_t: &Type,
    bytes: &[u8],
    offset: usize,
) -> UnmarshalResult<(usize, Value)> {
    let rest = bytes.get(offset..).ok_or(UnmarshalError::NotEnoughBytes)?;
    let array_len = parse_u32(rest, byteorder)? as usize;
    let elems_start = align(elem_t.alignment(), bytes, offset + 4)?;
    let end = elems_start + array_len;
    if bytes.len() < end {
        return Err(UnmarshalError::NotEnoughBytes);
    }
    let mut cursor = elems_start;
    let mut items = Vec::new();
    while cursor < end {
        let (next, v) = decode_value(byteorder, elem_t, bytes, cursor)?;
        cursor = next;
        items.push(v);
    }
    if cursor != end {
        return Err(UnmarshalError::NotEnoughBytes);
    }
    Ok((end, Value::Array(items)))
}

fn decode_dict(
    byteorder: ByteOrder,
    key_base: Base,
    val_t: &Type,
    bytes: &[u8],
    offset: usize,
) -> UnmarshalResult<(usize, Value)> {
    let rest = bytes.get(offset..).ok_or(UnmarshalError::NotEnoughBytes)?;
    let array_len = parse_u32(rest, byteorder)? as usize;
    let entries_start = align(8, bytes, offset + 4)?;
    let end = entries_start + array_len;
    if bytes.len() < end {
        return Err(UnmarshalError::NotEnoughBytes);
    }
    let key_t = Type::Base(key_base);
    let mut cursor = entries_start;
    let mut entries: Vec<(Value, Value)> = Vec::new();
    while cursor < end {
        let entry_start = align(8, bytes, cursor)?;
        let (after_key, key) = decode_value(byteorder, &key_t, bytes, entry_start)?;
        let (after_val, val) = decode_value(byteorder, val_t, bytes, after_key)?;
        cursor = after_val;
        // last write wins, matching plain dict-assignment semantics for a
        // repeated key instead of rejecting the array outright.
        match entries.iter_mut().find(|(k, _)| *k == key) {
            Some(existing) => existing.1 = val,
            None => entries.push((key, val)),
        }
    }
    if cursor != end {
        return Err(UnmarshalError::NotEnoughBytes);
    }
    Ok((end, Value::Dict(entries)))
}

fn decode_struct(
    byteorder: ByteOrder,
    field_types: &[Type],
    bytes: &[u8],
    offset: usize,
) -> UnmarshalResult<(usize, Value)> {
    let mut cursor = offset;
    let mut fields = Vec::with_capacity(field_types.len());
    for ft in field_types {
        let (next, v) = decode_value(byteorder, ft, bytes, cursor)?;
        cursor = next;
        fields.push(v);
    }
    Ok((cursor, Value::Struct(fields)))
}

fn decode_variant(byteorder: ByteOrder, bytes: &[u8], offset: usize) -> UnmarshalResult<(usize, Value)> {
    let rest = bytes.get(offset..).ok_or(UnmarshalError::NotEnoughBytes)?;
    let (sig_used, sig) = unmarshal_signature(rest)?;
    let inner_type = Type::parse_single(&sig)?;
    let (end, value) = decode_value(byteorder, &inner_type, bytes, offset + sig_used)?;
    Ok((end, Value::Variant(Box::new((sig, value)))))
}

/// Parse the header-field array, always of type `a(yv)`. `bytes` must be
/// exactly the header-field array's bytes (no fixed header, no padding
/// trailer); any padding between entries is still relative to 0 here,
/// which matches the wire format (the array always starts 8-aligned).
pub fn decode_header_fields(byteorder: ByteOrder, bytes: &[u8]) -> UnmarshalResult<HeaderFields> {
    let mut fields = HeaderFields::default();
    let mut offset = 0;
    while offset < bytes.len() {
        offset = align(8, bytes, offset)?;
        if offset >= bytes.len() {
            break;
        }
        let index = bytes[offset];
        offset += 1;
        let rest = bytes.get(offset..).ok_or(UnmarshalError::NotEnoughBytes)?;
        let (sig_used, sig) = unmarshal_signature(rest)?;
        offset += sig_used;
        let inner_type = Type::parse_single(&sig).map_err(|_| UnmarshalError::InvalidHeaderField)?;
        let (end, value) = decode_value(byteorder, &inner_type, bytes, offset)?;
        offset = end;

        match index {
            1 => fields.path = Some(expect_str(value)?),
            2 => fields.interface = Some(expect_str(value)?),
            3 => fields.member = Some(expect_str(value)?),
            4 => fields.error_name = Some(expect_str(value)?),
            5 => fields.reply_serial = Some(expect_u32(value)?),
            6 => fields.destination = Some(expect_str(value)?),
            7 => fields.sender = Some(expect_str(value)?),
            8 => fields.signature = Some(expect_str(value)?),
            9 => fields.unix_fds = Some(expect_u32(value)?),
            _ => return Err(UnmarshalError::UnknownHeaderField),
        }
    }
    Ok(fields)
}

fn expect_str(v: Value) -> UnmarshalResult<String> {
    v.try_into().map_err(|_| UnmarshalError::InvalidHeaderField)
}

fn expect_u32(v: Value) -> UnmarshalResult<u32> {
    v.try_into().map_err(|_| UnmarshalError::InvalidHeaderField)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::marshal::encode;

    #[test]
    fn decodes_string_and_uint32() {
        let bytes = encode(ByteOrder::Little, "su", &[Value::Str("hello".into()), Value::Uint32(7)]).unwrap();
        let values = decode(ByteOrder::Little, "su", &bytes).unwrap();
        assert_eq!(values, vec![Value::Str("hello".into()), Value::Uint32(7)]);
    }

    #[test]
    fn decodes_empty_array() {
        let values = decode(ByteOrder::Little, "as", &[0, 0, 0, 0]).unwrap();
        assert_eq!(values, vec![Value::Array(vec![])]);
    }

    #[test]
    fn non_zero_u32_decodes_as_true() {
        let bytes = [2u8, 0, 0, 0];
        let values = decode(ByteOrder::Little, "b", &bytes).unwrap();
        assert_eq!(values, vec![Value::Bool(true)]);
    }

    #[test]
    fn header_fields_roundtrip() {
        use crate::wire::marshal::encode_header_fields;
        let mut fields = HeaderFields::default();
        fields.path = Some("/x".into());
        fields.member = Some("M".into());
        let bytes = encode_header_fields(ByteOrder::Little, &fields).unwrap();
        let decoded = decode_header_fields(ByteOrder::Little, &bytes).unwrap();
        assert_eq!(decoded.path.as_deref(), Some("/x"));
        assert_eq!(decoded.member.as_deref(), Some("M"));
        assert!(decoded.interface.is_none());
        assert!(decoded.destination.is_none());
    }

    #[test]
    fn roundtrip_nested_struct() {
        let sig = "(sia{si})";
        let value = Value::Struct(vec![
            Value::Str("x".into()),
            Value::Int32(-3),
            Value::Dict(vec![(Value::Str("k".into()), Value::Int32(1))]),
        ]);
        let bytes = encode(ByteOrder::Little, sig, &[value.clone()]).unwrap();
        let decoded = decode(ByteOrder::Little, sig, &bytes).unwrap();
        assert_eq!(decoded, vec![value]);
    }

    #[test]
    fn roundtrip_array_of_structs_respects_struct_alignment() {
        // the struct alignment (8) must be computed from the element's
        // absolute offset in the message, not its offset within the array.
        let sig = "ya(yx)";
        let values = vec![
            Value::Byte(1),
            Value::Array(vec![
                Value::Struct(vec![Value::Byte(2), Value::Int64(3)]),
                Value::Struct(vec![Value::Byte(4), Value::Int64(5)]),
            ]),
        ];
        let bytes = encode(ByteOrder::Little, sig, &values).unwrap();
        let decoded = decode(ByteOrder::Little, sig, &bytes).unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn roundtrip_big_endian() {
        let sig = "su";
        let values = vec![Value::Str("hello".into()), Value::Uint32(7)];
        let bytes = encode(ByteOrder::Big, sig, &values).unwrap();
        let decoded = decode(ByteOrder::Big, sig, &bytes).unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn duplicate_dict_keys_keep_the_last_value() {
        let sig = "a{si}";
        let bytes = encode(
            ByteOrder::Little,
            sig,
            &[Value::Dict(vec![
                (Value::Str("k".into()), Value::Int32(1)),
                (Value::Str("k".into()), Value::Int32(2)),
            ])],
        )
        .unwrap();
        let values = decode(ByteOrder::Little, sig, &bytes).unwrap();
        assert_eq!(
            values,
            vec![Value::Dict(vec![(Value::Str("k".into()), Value::Int32(2))])]
        );
    }
}
