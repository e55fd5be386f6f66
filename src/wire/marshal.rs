//! Encodes [`Value`]s into the dbus wire format, driven by a parsed
//! [`Type`] plan rather than a mutable signature stack.

use crate::signature::{Base, Container, Type};
use crate::value::Value;
use crate::wire::util::*;
use crate::wire::HeaderFields;
use crate::ByteOrder;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum MarshalError {
    #[error("signature and values do not match: {0}")]
    SignatureMismatch(String),
    #[error("invalid signature: {0}")]
    Signature(#[from] crate::signature::Error),
    #[error("a string used as an object path or dict key contained a NUL byte")]
    StringContainsNul,
}

type Result<T> = std::result::Result<T, MarshalError>;

/// Encode `values` against `signature` in `byteorder`, returning the
/// padded byte buffer. The signature is parsed into a plan once; the plan
/// and values are then walked together.
pub fn encode(byteorder: ByteOrder, signature: &str, values: &[Value]) -> Result<Vec<u8>> {
    let plan = if signature.is_empty() {
        Vec::new()
    } else {
        Type::parse(signature)?
    };
    if plan.len() != values.len() {
        return Err(MarshalError::SignatureMismatch(format!(
            "signature {:?} describes {} values but {} were given",
            signature,
            plan.len(),
            values.len()
        )));
    }
    let mut buf = Vec::new();
    for (t, v) in plan.iter().zip(values.iter()) {
        encode_value(byteorder, t, v, &mut buf)?;
    }
    Ok(buf)
}

fn mismatch(t: &Type, v: &Value) -> MarshalError {
    MarshalError::SignatureMismatch(format!(
        "expected a value for `{}`, got {}",
        t.to_signature(),
        v.kind_name()
    ))
}

fn encode_value(byteorder: ByteOrder, t: &Type, v: &Value, buf: &mut Vec<u8>) -> Result<()> {
    buf.reserve(0);
    pad_to_align(t.alignment(), buf);
    match (t, v) {
        (Type::Base(Base::Byte), Value::Byte(b)) => buf.push(*b),
        (Type::Base(Base::Boolean), Value::Bool(b)) => write_u32(*b as u32, byteorder, buf),
        (Type::Base(Base::Int16), Value::Int16(n)) => write_u16(*n as u16, byteorder, buf),
        (Type::Base(Base::Uint16), Value::Uint16(n)) => write_u16(*n, byteorder, buf),
        (Type::Base(Base::Int32), Value::Int32(n)) => write_u32(*n as u32, byteorder, buf),
        (Type::Base(Base::Uint32), Value::Uint32(n)) => write_u32(*n, byteorder, buf),
        (Type::Base(Base::UnixFd), Value::UnixFd(n)) => write_u32(*n, byteorder, buf),
        (Type::Base(Base::Int64), Value::Int64(n)) => write_u64(*n as u64, byteorder, buf),
        (Type::Base(Base::Uint64), Value::Uint64(n)) => write_u64(*n, byteorder, buf),
        (Type::Base(Base::Double), Value::Double(d)) => write_u64(d.to_bits(), byteorder, buf),
        (Type::Base(Base::String), Value::Str(s)) => {
            if s.contains('\0') {
                return Err(MarshalError::StringContainsNul);
            }
            write_string(s, byteorder, buf)
        }
        (Type::Base(Base::ObjectPath), Value::ObjectPath(s)) => write_string(s, byteorder, buf),
        (Type::Base(Base::Signature), Value::Signature(s)) => write_signature(s, buf),
        (Type::Container(Container::Array(elem_t)), Value::Array(items)) => {
            encode_array(byteorder, elem_t, items, buf)?
        }
        (Type::Container(Container::Dict(key_t, val_t)), Value::Dict(entries)) => {
            encode_dict(byteorder, *key_t, val_t, entries, buf)?
        }
        (Type::Container(Container::Struct(field_types)), Value::Struct(fields)) => {
            if field_types.len() != fields.len() {
                return Err(mismatch(t, v));
            }
            for (ft, fv) in field_types.iter().zip(fields.iter()) {
                encode_value(byteorder, ft, fv, buf)?;
            }
        }
        (Type::Container(Container::Variant), Value::Variant(inner)) => {
            let (sig, val) = inner.as_ref();
            let inner_type = Type::parse_single(sig)?;
            write_signature(sig, buf);
            encode_value(byteorder, &inner_type, val, buf)?;
        }
        _ => return Err(mismatch(t, v)),
    }
    Ok(())
}

fn encode_array(byteorder: ByteOrder, elem_t: &Type, items: &[Value], buf: &mut Vec<u8>) -> Result<()> {
    // reserve the length placeholder, then align for the first element;
    // the array's declared length counts from the first element onward,
    // not the alignment padding we insert here.
    let len_offset = buf.len();
    write_u32(0, byteorder, buf);
    pad_to_align(elem_t.alignment(), buf);
    let start = buf.len();
    for item in items {
        encode_value(byteorder, elem_t, item, buf)?;
    }
    let array_len = (buf.len() - start) as u32;
    insert_u32(byteorder, array_len, &mut buf[len_offset..len_offset + 4]);
    Ok(())
}

fn encode_dict(
    byteorder: ByteOrder,
    key_base: Base,
    val_t: &Type,
    entries: &[(Value, Value)],
    buf: &mut Vec<u8>,
) -> Result<()> {
    let len_offset = buf.len();
    write_u32(0, byteorder, buf);
    pad_to_align(8, buf);
    let start = buf.len();
    let key_t = Type::Base(key_base);
    for (k, v) in entries {
        pad_to_align(8, buf);
        encode_value(byteorder, &key_t, k, buf)?;
        encode_value(byteorder, val_t, v, buf)?;
    }
    let array_len = (buf.len() - start) as u32;
    insert_u32(byteorder, array_len, &mut buf[len_offset..len_offset + 4]);
    Ok(())
}

/// The four allowed (index, type-code) pairs for each header field,
/// matching §3's fixed table. Order is insertion order by ascending index.
fn header_entries(fields: &HeaderFields) -> Vec<(u8, char, Value)> {
    let mut out = Vec::new();
    if let Some(v) = &fields.path {
        out.push((1, 'o', Value::ObjectPath(v.clone())));
    }
    if let Some(v) = &fields.interface {
        out.push((2, 's', Value::Str(v.clone())));
    }
    if let Some(v) = &fields.member {
        out.push((3, 's', Value::Str(v.clone())));
    }
    if let Some(v) = &fields.error_name {
        out.push((4, 's', Value::Str(v.clone())));
    }
    if let Some(v) = fields.reply_serial {
        out.push((5, 'u', Value::Uint32(v)));
    }
    if let Some(v) = &fields.destination {
        out.push((6, 's', Value::Str(v.clone())));
    }
    if let Some(v) = &fields.sender {
        out.push((7, 's', Value::Str(v.clone())));
    }
    if let Some(v) = &fields.signature {
        out.push((8, 'g', Value::Signature(v.clone())));
    }
    if let Some(v) = fields.unix_fds {
        out.push((9, 'u', Value::Uint32(v)));
    }
    out
}

/// Encode the header-field array, which is always of type `a(yv)`:
/// for each present field, align to 8, then write
/// `{index: y, signature-code: g, value}`.
pub fn encode_header_fields(byteorder: ByteOrder, fields: &HeaderFields) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    for (index, code, value) in header_entries(fields) {
        pad_to_align(8, &mut buf);
        buf.push(index);
        let sig = code.to_string();
        write_signature(&sig, &mut buf);
        let inner_type = Type::parse_single(&sig)?;
        encode_value(byteorder, &inner_type, &value, &mut buf)?;
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_string_and_uint32() {
        let values = vec![Value::Str("hello".into()), Value::Uint32(7)];
        let bytes = encode(ByteOrder::Little, "su", &values).unwrap();
        assert_eq!(
            bytes,
            vec![
                0x05, 0x00, 0x00, 0x00, b'h', b'e', b'l', b'l', b'o', 0x00, 0x00, 0x00, 0x07,
                0x00, 0x00, 0x00
            ]
        );
    }

    #[test]
    fn encodes_empty_array() {
        let bytes = encode(ByteOrder::Little, "as", &[Value::Array(vec![])]).unwrap();
        assert_eq!(bytes, vec![0, 0, 0, 0]);
    }

    #[test]
    fn encodes_variant() {
        let v = Value::Variant(Box::new(("u".into(), Value::Uint32(42))));
        let bytes = encode(ByteOrder::Little, "v", &[v]).unwrap();
        assert_eq!(bytes, vec![0x01, b'u', 0x00, 0x00, 0x2A, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn rejects_mismatched_arity() {
        let err = encode(ByteOrder::Little, "su", &[Value::Str("x".into())]).unwrap_err();
        assert!(matches!(err, MarshalError::SignatureMismatch(_)));
    }

    #[test]
    fn rejects_mismatched_type() {
        let err = encode(ByteOrder::Little, "u", &[Value::Str("x".into())]).unwrap_err();
        assert!(matches!(err, MarshalError::SignatureMismatch(_)));
    }
}
