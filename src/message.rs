//! The framed message object: a fixed header, a variable header-field
//! array, and a body, with the header fields and body decoded lazily and
//! cached on first access.
//!
//! A message is otherwise immutable once built; the only mutators are
//! `set_type`, `set_flags`, `set_serial` (single-byte/word writes at known
//! offsets) and `set_body` (rewrites the tail and the body-length field,
//! and the signature header field along with it).

use std::cell::OnceCell;

use crate::error::Result;
use crate::value::Value;
use crate::wire::unmarshal::UnmarshalError;
use crate::wire::util::{pad_to_align, parse_u32, write_u32};
use crate::wire::{marshal, unmarshal, HeaderFields};
use crate::ByteOrder;

pub const PROTOCOL_VERSION: u8 = 1;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MessageType {
    MethodCall,
    MethodReturn,
    Error,
    Signal,
}

impl MessageType {
    pub fn code(self) -> u8 {
        match self {
            MessageType::MethodCall => 1,
            MessageType::MethodReturn => 2,
            MessageType::Error => 3,
            MessageType::Signal => 4,
        }
    }

    pub fn from_code(code: u8) -> std::result::Result<Self, UnmarshalError> {
        Ok(match code {
            1 => MessageType::MethodCall,
            2 => MessageType::MethodReturn,
            3 => MessageType::Error,
            4 => MessageType::Signal,
            _ => return Err(UnmarshalError::InvalidMessageType),
        })
    }
}

fn round_up(n: usize, to: usize) -> usize {
    let rem = n % to;
    if rem == 0 {
        n
    } else {
        n + (to - rem)
    }
}

/// The 16 bytes every message starts with, parsed independently of the
/// variable-length parts that follow. A connection reads these first to
/// learn how many more bytes to read.
#[derive(Clone, Copy, Debug)]
pub struct FixedHeader {
    pub byteorder: ByteOrder,
    pub msg_type: MessageType,
    pub flags: u8,
    pub body_len: u32,
    pub serial: u32,
    pub header_fields_len: u32,
}

impl FixedHeader {
    pub const LEN: usize = 16;

    pub fn decode(bytes: &[u8]) -> Result<FixedHeader> {
        let bytes = bytes.get(..Self::LEN).ok_or(UnmarshalError::NotEnoughBytes)?;
        let byteorder = ByteOrder::from_marker(bytes[0]).ok_or(UnmarshalError::InvalidByteOrder)?;
        let msg_type = MessageType::from_code(bytes[1])?;
        let flags = bytes[2];
        let body_len = parse_u32(&bytes[4..8], byteorder)?;
        let serial = parse_u32(&bytes[8..12], byteorder)?;
        let header_fields_len = parse_u32(&bytes[12..16], byteorder)?;
        Ok(FixedHeader {
            byteorder,
            msg_type,
            flags,
            body_len,
            serial,
            header_fields_len,
        })
    }

    /// Bytes remaining after this fixed header: the header-field array,
    /// padding out to an 8-byte boundary, then the body.
    pub fn rest_len(&self) -> usize {
        round_up(self.header_fields_len as usize, 8) + self.body_len as usize
    }
}

pub struct Message {
    byteorder: ByteOrder,
    msg_type: MessageType,
    flags: u8,
    serial: u32,
    header_bytes: Vec<u8>,
    header_fields: OnceCell<HeaderFields>,
    body_bytes: Vec<u8>,
    body: OnceCell<Vec<Value>>,
}

impl Message {
    /// Build a message from its parts: encodes `fields` into the
    /// variable header right away (so its length is known), but leaves
    /// the body empty until [`Message::set_body`] is called.
    pub fn from_parts(
        byteorder: ByteOrder,
        msg_type: MessageType,
        flags: u8,
        serial: u32,
        fields: HeaderFields,
    ) -> Result<Message> {
        let header_bytes = marshal::encode_header_fields(byteorder, &fields)?;
        Ok(Message {
            byteorder,
            msg_type,
            flags,
            serial,
            header_bytes,
            header_fields: OnceCell::from(fields),
            body_bytes: Vec::new(),
            body: OnceCell::from(Vec::new()),
        })
    }

    /// Reconstruct a message from a [`FixedHeader`] and the bytes that
    /// followed it (exactly `fixed.rest_len()` of them). Header fields and
    /// body are decoded lazily from here on.
    pub fn from_wire(fixed: FixedHeader, rest: &[u8]) -> Result<Message> {
        let header_len = fixed.header_fields_len as usize;
        let header_bytes = rest
            .get(..header_len)
            .ok_or(UnmarshalError::NotEnoughBytes)?
            .to_vec();
        let body_start = round_up(header_len, 8);
        let body_bytes = rest
            .get(body_start..body_start + fixed.body_len as usize)
            .ok_or(UnmarshalError::NotEnoughBytes)?
            .to_vec();
        Ok(Message {
            byteorder: fixed.byteorder,
            msg_type: fixed.msg_type,
            flags: fixed.flags,
            serial: fixed.serial,
            header_bytes,
            header_fields: OnceCell::new(),
            body_bytes,
            body: OnceCell::new(),
        })
    }

    pub fn byteorder(&self) -> ByteOrder {
        self.byteorder
    }

    pub fn msg_type(&self) -> MessageType {
        self.msg_type
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }

    pub fn set_type(&mut self, msg_type: MessageType) {
        self.msg_type = msg_type;
    }

    pub fn set_flags(&mut self, flags: u8) {
        self.flags = flags;
    }

    pub fn set_serial(&mut self, serial: u32) {
        self.serial = serial;
    }

    /// Decode (and cache) the variable header fields.
    pub fn header_fields(&self) -> Result<&HeaderFields> {
        if self.header_fields.get().is_none() {
            let decoded = unmarshal::decode_header_fields(self.byteorder, &self.header_bytes)?;
            let _ = self.header_fields.set(decoded);
        }
        Ok(self.header_fields.get().expect("just populated"))
    }

    /// Decode (and cache) the body against the signature header field.
    pub fn body(&self) -> Result<&[Value]> {
        if self.body.get().is_none() {
            let signature = self.header_fields()?.signature.clone().unwrap_or_default();
            let decoded = if signature.is_empty() {
                Vec::new()
            } else {
                unmarshal::decode(self.byteorder, &signature, &self.body_bytes)?
            };
            let _ = self.body.set(decoded);
        }
        Ok(self.body.get().expect("just populated"))
    }

    /// Replace the body with a fresh encode of `(signature, values)`,
    /// updating the signature header field to match (cleared if `values`
    /// is empty).
    pub fn set_body(&mut self, signature: &str, values: &[Value]) -> Result<()> {
        let body_bytes = marshal::encode(self.byteorder, signature, values)?;
        let mut fields = self.header_fields()?.clone();
        fields.signature = if signature.is_empty() {
            None
        } else {
            Some(signature.to_owned())
        };
        self.header_bytes = marshal::encode_header_fields(self.byteorder, &fields)?;
        self.header_fields = OnceCell::from(fields);
        self.body_bytes = body_bytes;
        self.body = OnceCell::from(values.to_vec());
        Ok(())
    }

    /// Serialize the full frame: fixed header, header fields, padding,
    /// body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            FixedHeader::LEN + round_up(self.header_bytes.len(), 8) + self.body_bytes.len(),
        );
        buf.push(self.byteorder.marker());
        buf.push(self.msg_type.code());
        buf.push(self.flags);
        buf.push(PROTOCOL_VERSION);
        write_u32(self.body_bytes.len() as u32, self.byteorder, &mut buf);
        write_u32(self.serial, self.byteorder, &mut buf);
        write_u32(self.header_bytes.len() as u32, self.byteorder, &mut buf);
        buf.extend_from_slice(&self.header_bytes);
        pad_to_align(8, &mut buf);
        buf.extend_from_slice(&self.body_bytes);
        buf
    }

    /// True iff every `Some` field in `header` is present and equal on
    /// this message, and every `Some` entry in `body` equals the
    /// correspondingly-positioned decoded body value. `None` entries in
    /// either are wildcards; an empty `body` slice matches any body.
    pub fn matches(&self, header: &HeaderMatch, body: &[Option<Value>]) -> bool {
        if let Some(t) = header.msg_type {
            if t != self.msg_type {
                return false;
            }
        }
        let fields = match self.header_fields() {
            Ok(f) => f,
            Err(_) => return false,
        };
        if !opt_eq(&header.path, &fields.path) {
            return false;
        }
        if !opt_eq(&header.interface, &fields.interface) {
            return false;
        }
        if !opt_eq(&header.member, &fields.member) {
            return false;
        }
        if !opt_eq(&header.error_name, &fields.error_name) {
            return false;
        }
        if header.reply_serial.is_some() && header.reply_serial != fields.reply_serial {
            return false;
        }
        if !opt_eq(&header.destination, &fields.destination) {
            return false;
        }
        if !opt_eq(&header.sender, &fields.sender) {
            return false;
        }
        if !opt_eq(&header.signature, &fields.signature) {
            return false;
        }

        if body.is_empty() {
            return true;
        }
        let actual = match self.body() {
            Ok(b) => b,
            Err(_) => return false,
        };
        for (i, expected) in body.iter().enumerate() {
            if let Some(expected) = expected {
                match actual.get(i) {
                    Some(found) if found == expected => {}
                    _ => return false,
                }
            }
        }
        true
    }
}

fn opt_eq(expected: &Option<String>, actual: &Option<String>) -> bool {
    match expected {
        None => true,
        Some(e) => actual.as_deref() == Some(e.as_str()),
    }
}

/// The subset of a message's header a caller wants to match on; `None`
/// fields are wildcards. Used by [`Message::matches`] and by the
/// connection's reply/signal dispatch.
#[derive(Clone, Debug, Default)]
pub struct HeaderMatch {
    pub msg_type: Option<MessageType>,
    pub path: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub error_name: Option<String>,
    pub reply_serial: Option<u32>,
    pub destination: Option<String>,
    pub sender: Option<String>,
    pub signature: Option<String>,
}

impl HeaderMatch {
    pub fn reply_to(serial: u32) -> HeaderMatch {
        HeaderMatch {
            msg_type: None,
            reply_serial: Some(serial),
            ..Default::default()
        }
    }

    pub fn signal(interface: impl Into<String>, member: impl Into<String>) -> HeaderMatch {
        HeaderMatch {
            msg_type: Some(MessageType::Signal),
            interface: Some(interface.into()),
            member: Some(member.into()),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello_call() -> Message {
        let fields = HeaderFields {
            path: Some("/org/freedesktop/DBus".into()),
            interface: Some("org.freedesktop.DBus".into()),
            member: Some("Hello".into()),
            destination: Some("org.freedesktop.DBus".into()),
            ..Default::default()
        };
        let mut msg =
            Message::from_parts(ByteOrder::Little, MessageType::MethodCall, 0, 1, fields).unwrap();
        msg.set_serial(1);
        msg
    }

    #[test]
    fn hello_message_matches_fixed_header_bytes() {
        let msg = hello_call();
        let bytes = msg.to_bytes();
        assert_eq!(
            &bytes[..8],
            &[0x6C, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00]
        );
        assert_eq!(&bytes[8..12], &1u32.to_le_bytes());
    }

    #[test]
    fn length_tuple_accounts_for_every_byte() {
        let mut msg = hello_call();
        msg.set_body("s", &[Value::Str("hi".into())]).unwrap();
        let bytes = msg.to_bytes();
        let header_fields_len = u32::from_le_bytes(bytes[12..16].try_into().unwrap()) as usize;
        let body_len = u32::from_le_bytes(bytes[4..8].try_into().unwrap()) as usize;
        let expected_len = FixedHeader::LEN + round_up(header_fields_len, 8) + body_len;
        assert_eq!(bytes.len(), expected_len);
    }

    #[test]
    fn wire_roundtrip_preserves_header_and_body() {
        let mut msg = hello_call();
        msg.set_body("s", &[Value::Str("hi".into())]).unwrap();
        let bytes = msg.to_bytes();

        let fixed = FixedHeader::decode(&bytes).unwrap();
        let rest = &bytes[FixedHeader::LEN..];
        assert_eq!(rest.len(), fixed.rest_len());
        let decoded = Message::from_wire(fixed, rest).unwrap();

        assert_eq!(decoded.msg_type(), MessageType::MethodCall);
        assert_eq!(decoded.serial(), 1);
        assert_eq!(decoded.header_fields().unwrap().member.as_deref(), Some("Hello"));
        assert_eq!(decoded.body().unwrap(), &[Value::Str("hi".into())]);
    }

    #[test]
    fn matches_is_idempotent() {
        let mut msg = hello_call();
        msg.set_body("s", &[Value::Str("hi".into())]).unwrap();
        let want_header = HeaderMatch {
            member: Some("Hello".into()),
            ..Default::default()
        };
        let want_body = [Some(Value::Str("hi".into()))];
        assert!(msg.matches(&want_header, &want_body));
        assert!(msg.matches(&want_header, &want_body));
    }

    #[test]
    fn matches_rejects_wrong_member() {
        let msg = hello_call();
        let want = HeaderMatch {
            member: Some("Goodbye".into()),
            ..Default::default()
        };
        assert!(!msg.matches(&want, &[]));
    }

    #[test]
    fn matches_treats_nil_body_entries_as_wildcards() {
        let mut msg = hello_call();
        msg.set_body("su", &[Value::Str("hi".into()), Value::Uint32(9)])
            .unwrap();
        let want_body = [None, Some(Value::Uint32(9))];
        assert!(msg.matches(&HeaderMatch::default(), &want_body));
    }

    #[test]
    fn set_body_clears_signature_field_when_values_empty() {
        let mut msg = hello_call();
        msg.set_body("s", &[Value::Str("hi".into())]).unwrap();
        msg.set_body("", &[]).unwrap();
        assert!(msg.header_fields().unwrap().signature.is_none());
        assert!(msg.body().unwrap().is_empty());
    }
}
