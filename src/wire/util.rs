//! Small endian-aware read/write helpers shared by the marshaller and
//! unmarshaller.

use crate::wire::unmarshal::UnmarshalError;
use crate::ByteOrder;

#[inline(always)]
pub fn pad_to_align(align_to: usize, buf: &mut Vec<u8>) {
    let rem = buf.len() % align_to;
    if rem != 0 {
        buf.resize(buf.len() + (align_to - rem), 0);
    }
}

pub fn write_u16(val: u16, byteorder: ByteOrder, buf: &mut Vec<u8>) {
    match byteorder {
        ByteOrder::Little => buf.extend_from_slice(&val.to_le_bytes()),
        ByteOrder::Big => buf.extend_from_slice(&val.to_be_bytes()),
    }
}

pub fn write_u32(val: u32, byteorder: ByteOrder, buf: &mut Vec<u8>) {
    match byteorder {
        ByteOrder::Little => buf.extend_from_slice(&val.to_le_bytes()),
        ByteOrder::Big => buf.extend_from_slice(&val.to_be_bytes()),
    }
}

pub fn write_u64(val: u64, byteorder: ByteOrder, buf: &mut Vec<u8>) {
    match byteorder {
        ByteOrder::Little => buf.extend_from_slice(&val.to_le_bytes()),
        ByteOrder::Big => buf.extend_from_slice(&val.to_be_bytes()),
    }
}

pub fn write_string(val: &str, byteorder: ByteOrder, buf: &mut Vec<u8>) {
    write_u32(val.len() as u32, byteorder, buf);
    buf.extend_from_slice(val.as_bytes());
    buf.push(0);
}

pub fn write_signature(val: &str, buf: &mut Vec<u8>) {
    buf.push(val.len() as u8);
    buf.extend_from_slice(val.as_bytes());
    buf.push(0);
}

pub fn insert_u32(byteorder: ByteOrder, val: u32, buf: &mut [u8]) {
    let bytes = match byteorder {
        ByteOrder::Little => val.to_le_bytes(),
        ByteOrder::Big => val.to_be_bytes(),
    };
    buf[..4].copy_from_slice(&bytes);
}

pub fn parse_u16(buf: &[u8], byteorder: ByteOrder) -> Result<u16, UnmarshalError> {
    let bytes: [u8; 2] = buf
        .get(..2)
        .ok_or(UnmarshalError::NotEnoughBytes)?
        .try_into()
        .unwrap();
    Ok(match byteorder {
        ByteOrder::Little => u16::from_le_bytes(bytes),
        ByteOrder::Big => u16::from_be_bytes(bytes),
    })
}

pub fn parse_u32(buf: &[u8], byteorder: ByteOrder) -> Result<u32, UnmarshalError> {
    let bytes: [u8; 4] = buf
        .get(..4)
        .ok_or(UnmarshalError::NotEnoughBytes)?
        .try_into()
        .unwrap();
    Ok(match byteorder {
        ByteOrder::Little => u32::from_le_bytes(bytes),
        ByteOrder::Big => u32::from_be_bytes(bytes),
    })
}

pub fn parse_u64(buf: &[u8], byteorder: ByteOrder) -> Result<u64, UnmarshalError> {
    let bytes: [u8; 8] = buf
        .get(..8)
        .ok_or(UnmarshalError::NotEnoughBytes)?
        .try_into()
        .unwrap();
    Ok(match byteorder {
        ByteOrder::Little => u64::from_le_bytes(bytes),
        ByteOrder::Big => u64::from_be_bytes(bytes),
    })
}

/// Reads padding at `buf[..n]` where `n` is the byte count needed to bring
/// `offset` up to `align_to`, verifying the skipped bytes are all zero.
pub fn skip_padding(
    align_to: usize,
    buf: &[u8],
    offset: usize,
) -> Result<usize, UnmarshalError> {
    let rem = offset % align_to;
    let pad = if rem == 0 { 0 } else { align_to - rem };
    let region = buf.get(..pad).ok_or(UnmarshalError::NotEnoughBytes)?;
    if region.iter().any(|b| *b != 0) {
        return Err(UnmarshalError::PaddingContainedData);
    }
    Ok(pad)
}

pub fn unmarshal_string(buf: &[u8], byteorder: ByteOrder) -> Result<(usize, String), UnmarshalError> {
    let len = parse_u32(buf, byteorder)? as usize;
    let total = 4 + len + 1;
    let str_bytes = buf.get(4..4 + len).ok_or(UnmarshalError::NotEnoughBytes)?;
    if buf.get(4 + len) != Some(&0) {
        return Err(UnmarshalError::NotEnoughBytes);
    }
    let s = std::str::from_utf8(str_bytes).map_err(|_| UnmarshalError::InvalidUtf8)?;
    Ok((total, s.to_owned()))
}

pub fn unmarshal_signature(buf: &[u8]) -> Result<(usize, String), UnmarshalError> {
    let len = *buf.first().ok_or(UnmarshalError::NotEnoughBytes)? as usize;
    let total = 1 + len + 1;
    let str_bytes = buf.get(1..1 + len).ok_or(UnmarshalError::NotEnoughBytes)?;
    if buf.get(1 + len) != Some(&0) {
        return Err(UnmarshalError::NotEnoughBytes);
    }
    let s = std::str::from_utf8(str_bytes).map_err(|_| UnmarshalError::InvalidUtf8)?;
    Ok((total, s.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding_math() {
        let mut buf = vec![0u8; 3];
        pad_to_align(8, &mut buf);
        assert_eq!(buf.len(), 8);

        let mut buf = vec![0u8; 8];
        pad_to_align(8, &mut buf);
        assert_eq!(buf.len(), 8);
    }

    #[test]
    fn rejects_nonzero_padding() {
        let buf = [1, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(
            skip_padding(8, &buf, 0),
            Err(UnmarshalError::PaddingContainedData)
        );
    }
}
