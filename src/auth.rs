//! The text-based `AUTH EXTERNAL` handshake that precedes binary message
//! traffic on a new connection: a NUL byte, an `AUTH EXTERNAL <hex-uid>`
//! line, the server's `OK`/`REJECTED`, an optional unix-fd negotiation, and
//! finally `BEGIN`, after which the stream carries framed messages.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;

use nix::unistd::getuid;

use crate::error::{Error, Result};

fn write_line(stream: &mut UnixStream, line: &str) -> std::io::Result<()> {
    log::trace!("auth: > {}", line);
    let mut buf = Vec::with_capacity(line.len() + 2);
    buf.extend_from_slice(line.as_bytes());
    buf.extend_from_slice(b"\r\n");
    stream.write_all(&buf)
}

fn find_line_ending(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn read_line(stream: &mut UnixStream, buf: &mut Vec<u8>) -> std::io::Result<String> {
    let mut chunk = [0u8; 512];
    loop {
        if let Some(idx) = find_line_ending(buf) {
            let line = buf.drain(..idx + 2).collect::<Vec<u8>>();
            return Ok(String::from_utf8_lossy(&line[..line.len() - 2]).into_owned());
        }
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// The local uid, as decimal-ASCII digits hex-encoded byte by byte (e.g.
/// uid `1000` becomes the literal string `"31303030"`), the form
/// `AUTH EXTERNAL` expects.
fn uid_as_hex() -> String {
    getuid()
        .to_string()
        .bytes()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Run the handshake on an already-connected stream: send the mandatory
/// leading NUL, authenticate as the current user, optionally negotiate
/// unix-fd passing, then send `BEGIN`. Leftover bytes read past the
/// handshake lines (there never should be any, since the server doesn't
/// pipeline past `OK`) are returned so the caller doesn't lose them.
pub fn handshake(stream: &mut UnixStream, negotiate_unix_fds: bool) -> Result<bool> {
    stream.write_all(&[0])?;
    write_line(stream, &format!("AUTH EXTERNAL {}", uid_as_hex()))?;

    let mut read_buf = Vec::new();
    let reply = read_line(stream, &mut read_buf)?;
    if !reply.starts_with("OK") {
        log::debug!("auth: server rejected EXTERNAL auth: {}", reply);
        return Err(Error::AuthRejected);
    }

    let fds_agreed = if negotiate_unix_fds {
        write_line(stream, "NEGOTIATE_UNIX_FD")?;
        let reply = read_line(stream, &mut read_buf)?;
        reply.starts_with("AGREE_UNIX_FD")
    } else {
        false
    };

    write_line(stream, "BEGIN")?;
    if !read_buf.is_empty() {
        log::warn!("auth: server sent {} bytes past the handshake", read_buf.len());
    }
    Ok(fds_agreed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_crlf_anywhere_in_buffer() {
        assert_eq!(find_line_ending(b"OK 1234\r\nextra"), Some(7));
        assert_eq!(find_line_ending(b"no ending here"), None);
    }

    #[test]
    fn uid_hex_is_ascii_digit_bytes() {
        // uid 0 hex-encodes the single ASCII digit '0' (0x30).
        if getuid().as_raw() == 0 {
            assert_eq!(uid_as_hex(), "30");
        }
    }
}
