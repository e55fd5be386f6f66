//! The blocking session on top of a UNIX socket: authenticate, issue
//! serials, frame messages on and off the wire, and correlate calls with
//! replies.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use nix::sys::socket::{self, AddressFamily, SockFlag, SockType, UnixAddr};

use crate::address;
use crate::auth;
use crate::error::{Error, Result};
use crate::message::{FixedHeader, HeaderMatch, Message, MessageType};
use crate::value::Value;
use crate::wire::HeaderFields;
use crate::ByteOrder;

const DBUS_NAME: &str = "org.freedesktop.DBus";
const DBUS_PATH: &str = "/org/freedesktop/DBus";

pub const NAME_FLAG_ALLOW_REPLACEMENT: u32 = 0x1;
pub const NAME_FLAG_REPLACE_EXISTING: u32 = 0x2;
pub const NAME_FLAG_DO_NOT_QUEUE: u32 = 0x4;

pub const REQUEST_NAME_REPLY_PRIMARY_OWNER: u32 = 1;
pub const REQUEST_NAME_REPLY_IN_QUEUE: u32 = 2;
pub const REQUEST_NAME_REPLY_EXISTS: u32 = 3;
pub const REQUEST_NAME_REPLY_ALREADY_OWNER: u32 = 4;

const NO_REPLY_EXPECTED: u8 = 0x1;

/// Bounds how long a single socket read/write may block.
#[derive(Clone, Copy, Debug)]
pub enum Timeout {
    Infinite,
    Nonblock,
    Duration(Duration),
}

fn connect_stream(addr: &UnixAddr) -> Result<UnixStream> {
    let fd = socket::socket(AddressFamily::Unix, SockType::Stream, SockFlag::empty(), None)?;
    socket::connect(std::os::fd::AsRawFd::as_raw_fd(&fd), addr)?;
    Ok(UnixStream::from(fd))
}

pub struct Connection {
    stream: UnixStream,
    byteorder: ByteOrder,
    next_serial: u32,
    wrapped_once: bool,
    raise_on_error: bool,
    unique_name: Option<String>,
}

impl Connection {
    /// Connect to the session bus, run the `AUTH EXTERNAL`/`BEGIN`
    /// handshake, and call `Hello`. Returns a connection ready for use.
    pub fn connect_session() -> Result<Connection> {
        let addr = address::session_bus_address()?;
        Self::connect_and_hello(&addr)
    }

    /// Same as [`Connection::connect_session`] but against the system bus.
    pub fn connect_system() -> Result<Connection> {
        let addr = address::system_bus_address()?;
        Self::connect_and_hello(&addr)
    }

    pub fn connect_and_hello(addr: &UnixAddr) -> Result<Connection> {
        let mut conn = Self::connect(addr)?;
        let name = conn.hello()?;
        log::debug!("connection ready, bus-assigned unique name {}", name);
        Ok(conn)
    }

    /// Connect and complete the handshake, but skip `Hello` (useful for a
    /// monitor, which never acquires a bus name).
    pub fn connect(addr: &UnixAddr) -> Result<Connection> {
        let mut stream = connect_stream(addr)?;
        log::debug!("connected to {:?}", addr);
        auth::handshake(&mut stream, false)?;
        log::debug!("auth handshake complete");
        Ok(Connection {
            stream,
            byteorder: ByteOrder::native(),
            next_serial: 1,
            wrapped_once: false,
            raise_on_error: false,
            unique_name: None,
        })
    }

    pub fn set_timeout(&mut self, timeout: Timeout) -> Result<()> {
        match timeout {
            Timeout::Infinite => {
                self.stream.set_nonblocking(false)?;
                self.stream.set_read_timeout(None)?;
            }
            Timeout::Nonblock => self.stream.set_nonblocking(true)?,
            Timeout::Duration(d) => {
                self.stream.set_nonblocking(false)?;
                self.stream.set_read_timeout(Some(d))?;
            }
        }
        Ok(())
    }

    pub fn set_raise_on_error(&mut self, raise: bool) {
        self.raise_on_error = raise;
    }

    pub fn raise_on_error(&self) -> bool {
        self.raise_on_error
    }

    pub fn unique_name(&self) -> Option<&str> {
        self.unique_name.as_deref()
    }

    fn next_serial(&mut self) -> u32 {
        let serial = self.next_serial;
        self.next_serial = if self.next_serial == u32::MAX {
            if !self.wrapped_once {
                log::warn!("serial counter wrapped around, restarting at 1");
                self.wrapped_once = true;
            }
            1
        } else {
            self.next_serial + 1
        };
        serial
    }

    /// Write a whole frame, returning the serial it was sent with. Does
    /// not wait for a reply.
    pub fn send(&mut self, message: &mut Message) -> Result<u32> {
        let serial = self.next_serial();
        message.set_serial(serial);
        let bytes = message.to_bytes();
        self.stream.write_all(&bytes)?;
        log::trace!("sent message, serial {}, {} bytes", serial, bytes.len());
        Ok(serial)
    }

    /// Read exactly one complete frame off the wire.
    fn read_message(&mut self) -> Result<Message> {
        let mut fixed_buf = [0u8; FixedHeader::LEN];
        self.read_exact_or_disconnect(&mut fixed_buf)?;
        let fixed = FixedHeader::decode(&fixed_buf)?;

        let mut rest = vec![0u8; fixed.rest_len()];
        self.read_exact_or_disconnect(&mut rest)?;

        Message::from_wire(fixed, &rest)
    }

    fn read_exact_or_disconnect(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = match self.stream.read(&mut buf[filled..]) {
                Ok(n) => n,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    return Err(Error::TimedOut);
                }
                Err(e) => return Err(e.into()),
            };
            if n == 0 {
                return Err(Error::Disconnected);
            }
            filled += n;
        }
        Ok(())
    }

    /// Read and discard messages until one matches `header`/`body`.
    pub fn recv(&mut self, header: &HeaderMatch, body: &[Option<Value>]) -> Result<Message> {
        loop {
            let message = self.read_message()?;
            if message.matches(header, body) {
                if self.raise_on_error && message.msg_type() == MessageType::Error {
                    let fields = message.header_fields()?;
                    let name = fields.error_name.clone().unwrap_or_default();
                    let text = message
                        .body()?
                        .iter()
                        .filter_map(Value::as_str)
                        .collect::<Vec<_>>()
                        .join("; ");
                    return Err(Error::RemoteError { name, message: text });
                }
                return Ok(message);
            }
            log::trace!("discarding non-matching message while waiting for a reply");
        }
    }

    /// Send a method call and block for its reply (a method-return or,
    /// unless `raise_on_error` is set, an error).
    pub fn call(&mut self, mut message: Message) -> Result<Message> {
        if message.msg_type() != MessageType::MethodCall {
            return Err(Error::UnexpectedMessageType);
        }
        if message.flags() & NO_REPLY_EXPECTED != 0 {
            return Err(Error::UnexpectedMessageType);
        }
        let serial = self.send(&mut message)?;
        self.recv(&HeaderMatch::reply_to(serial), &[])
    }

    fn method_call(
        &mut self,
        destination: &str,
        path: &str,
        interface: &str,
        member: &str,
    ) -> Result<Message> {
        let fields = HeaderFields {
            path: Some(path.to_owned()),
            interface: Some(interface.to_owned()),
            member: Some(member.to_owned()),
            destination: Some(destination.to_owned()),
            ..Default::default()
        };
        Message::from_parts(self.byteorder, MessageType::MethodCall, 0, 0, fields)
    }

    // -- standard bus wrappers (org.freedesktop.DBus) ---------------------

    pub fn hello(&mut self) -> Result<String> {
        let msg = self.method_call(DBUS_NAME, DBUS_PATH, DBUS_NAME, "Hello")?;
        let reply = self.call(msg)?;
        let name = reply
            .header_fields()?
            .destination
            .clone()
            .ok_or(Error::UnexpectedMessageType)?;
        self.unique_name = Some(name.clone());
        Ok(name)
    }

    pub fn request_name(&mut self, name: &str, flags: u32) -> Result<u32> {
        let mut msg = self.method_call(DBUS_NAME, DBUS_PATH, DBUS_NAME, "RequestName")?;
        msg.set_body("su", &[Value::Str(name.to_owned()), Value::Uint32(flags)])?;
        let reply = self.call(msg)?;
        reply
            .body()?
            .first()
            .and_then(Value::as_u32)
            .ok_or(Error::UnexpectedMessageType)
    }

    /// Convenience over [`Connection::request_name`]: any reply code other
    /// than primary-owner or already-owner is an error.
    pub fn acquire_name(&mut self, name: &str, flags: u32) -> Result<()> {
        let code = self.request_name(name, flags)?;
        if code == REQUEST_NAME_REPLY_PRIMARY_OWNER || code == REQUEST_NAME_REPLY_ALREADY_OWNER {
            Ok(())
        } else {
            Err(Error::NameAcquisitionFailed(code))
        }
    }

    pub fn release_name(&mut self, name: &str) -> Result<u32> {
        let mut msg = self.method_call(DBUS_NAME, DBUS_PATH, DBUS_NAME, "ReleaseName")?;
        msg.set_body("s", &[Value::Str(name.to_owned())])?;
        let reply = self.call(msg)?;
        reply
            .body()?
            .first()
            .and_then(Value::as_u32)
            .ok_or(Error::UnexpectedMessageType)
    }

    pub fn add_match(&mut self, rule: &str) -> Result<()> {
        let mut msg = self.method_call(DBUS_NAME, DBUS_PATH, DBUS_NAME, "AddMatch")?;
        msg.set_body("s", &[Value::Str(rule.to_owned())])?;
        self.call(msg)?;
        Ok(())
    }

    pub fn remove_match(&mut self, rule: &str) -> Result<()> {
        let mut msg = self.method_call(DBUS_NAME, DBUS_PATH, DBUS_NAME, "RemoveMatch")?;
        msg.set_body("s", &[Value::Str(rule.to_owned())])?;
        self.call(msg)?;
        Ok(())
    }

    pub fn list_names(&mut self) -> Result<Vec<String>> {
        let msg = self.method_call(DBUS_NAME, DBUS_PATH, DBUS_NAME, "ListNames")?;
        decode_string_array(self.call(msg)?)
    }

    pub fn list_activatable_names(&mut self) -> Result<Vec<String>> {
        let msg = self.method_call(DBUS_NAME, DBUS_PATH, DBUS_NAME, "ListActivatableNames")?;
        decode_string_array(self.call(msg)?)
    }

    /// Subscribe to every message on the bus. Forces `raise_on_error` off:
    /// a monitor is a passive listener, not a caller expecting replies.
    pub fn become_monitor(&mut self, rules: &[String]) -> Result<()> {
        let mut msg = self.method_call(
            DBUS_NAME,
            DBUS_PATH,
            "org.freedesktop.DBus.Monitoring",
            "BecomeMonitor",
        )?;
        let rule_values: Vec<Value> = rules.iter().cloned().map(Value::Str).collect();
        msg.set_body("asu", &[Value::Array(rule_values), Value::Uint32(0)])?;
        log::warn!("becoming a bus monitor, disabling raise_on_error");
        self.raise_on_error = false;
        self.call(msg)?;
        Ok(())
    }

    pub fn ping(&mut self, destination: &str) -> Result<()> {
        let msg = self.method_call(destination, "/", "org.freedesktop.DBus.Peer", "Ping")?;
        self.call(msg)?;
        Ok(())
    }

    pub fn get_machine_id(&mut self, destination: &str) -> Result<String> {
        let msg = self.method_call(
            destination,
            "/",
            "org.freedesktop.DBus.Peer",
            "GetMachineId",
        )?;
        let reply = self.call(msg)?;
        reply
            .body()?
            .first()
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or(Error::UnexpectedMessageType)
    }

    pub fn introspect(&mut self, path: &str, destination: &str) -> Result<String> {
        let msg = self.method_call(
            destination,
            path,
            "org.freedesktop.DBus.Introspectable",
            "Introspect",
        )?;
        let reply = self.call(msg)?;
        reply
            .body()?
            .first()
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or(Error::UnexpectedMessageType)
    }

    pub fn get_property(
        &mut self,
        path: &str,
        interface: &str,
        destination: &str,
        property: &str,
    ) -> Result<Value> {
        let mut msg = self.method_call(
            destination,
            path,
            "org.freedesktop.DBus.Properties",
            "Get",
        )?;
        msg.set_body(
            "ss",
            &[
                Value::Str(interface.to_owned()),
                Value::Str(property.to_owned()),
            ],
        )?;
        let reply = self.call(msg)?;
        reply
            .body()?
            .first()
            .cloned()
            .and_then(Value::into_variant_inner)
            .ok_or(Error::UnexpectedMessageType)
    }

    pub fn set_property(
        &mut self,
        path: &str,
        interface: &str,
        destination: &str,
        property: &str,
        value: Value,
    ) -> Result<()> {
        let mut msg = self.method_call(
            destination,
            path,
            "org.freedesktop.DBus.Properties",
            "Set",
        )?;
        let value_signature = value.infer_signature();
        msg.set_body(
            "ssv",
            &[
                Value::Str(interface.to_owned()),
                Value::Str(property.to_owned()),
                Value::Variant(Box::new((value_signature, value))),
            ],
        )?;
        self.call(msg)?;
        Ok(())
    }

    pub fn get_all_properties(
        &mut self,
        path: &str,
        interface: &str,
        destination: &str,
    ) -> Result<Vec<(String, Value)>> {
        let mut msg = self.method_call(
            destination,
            path,
            "org.freedesktop.DBus.Properties",
            "GetAll",
        )?;
        msg.set_body("s", &[Value::Str(interface.to_owned())])?;
        let reply = self.call(msg)?;
        let entries = match reply.body()?.first() {
            Some(Value::Dict(entries)) => entries.clone(),
            _ => return Err(Error::UnexpectedMessageType),
        };
        entries
            .into_iter()
            .map(|(k, v)| {
                let key = k.as_str().map(str::to_owned).ok_or(Error::UnexpectedMessageType)?;
                let value = v.into_variant_inner().ok_or(Error::UnexpectedMessageType)?;
                Ok((key, value))
            })
            .collect()
    }
}

fn decode_string_array(message: Message) -> Result<Vec<String>> {
    match message.body()?.first() {
        Some(Value::Array(items)) => Ok(items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_owned)
            .collect()),
        _ => Err(Error::UnexpectedMessageType),
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        log::debug!("connection disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_never_yields_zero_and_wraps_to_one() {
        let mut conn = Connection {
            stream: UnixStream::pair().unwrap().0,
            byteorder: ByteOrder::native(),
            next_serial: u32::MAX,
            wrapped_once: false,
            raise_on_error: false,
            unique_name: None,
        };
        assert_eq!(conn.next_serial(), u32::MAX);
        assert_eq!(conn.next_serial(), 1);
        assert_eq!(conn.next_serial(), 2);
    }

    fn new_connection(stream: UnixStream) -> Connection {
        Connection {
            stream,
            byteorder: ByteOrder::native(),
            next_serial: 1,
            wrapped_once: false,
            raise_on_error: false,
            unique_name: None,
        }
    }

    /// `call` must correlate its reply by serial, silently skipping an
    /// intervening signal that arrives first on the wire.
    #[test]
    fn call_skips_an_intervening_signal_and_returns_the_matching_reply() {
        let (client_side, server_side) = UnixStream::pair().unwrap();
        let mut client = new_connection(client_side);

        let server = std::thread::spawn(move || {
            let mut server = new_connection(server_side);
            let call = server.read_message().unwrap();
            let call_serial = call.serial();

            let signal_fields = HeaderFields {
                path: Some("/x".into()),
                interface: Some("com.example.Noise".into()),
                member: Some("Tick".into()),
                ..Default::default()
            };
            let mut signal = Message::from_parts(
                ByteOrder::native(),
                MessageType::Signal,
                0,
                0,
                signal_fields,
            )
            .unwrap();
            server.send(&mut signal).unwrap();

            let reply_fields = HeaderFields {
                reply_serial: Some(call_serial),
                ..Default::default()
            };
            let mut reply = Message::from_parts(
                ByteOrder::native(),
                MessageType::MethodReturn,
                0,
                0,
                reply_fields,
            )
            .unwrap();
            reply.set_body("s", &[Value::Str("ok".into())]).unwrap();
            server.send(&mut reply).unwrap();
        });

        let msg = client
            .method_call("com.example", "/x", "com.example.Iface", "DoThing")
            .unwrap();
        let reply = client.call(msg).unwrap();

        assert_eq!(reply.msg_type(), MessageType::MethodReturn);
        assert_eq!(reply.body().unwrap(), &[Value::Str("ok".into())]);

        server.join().unwrap();
    }
}
