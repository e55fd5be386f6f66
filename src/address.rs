//! Resolving a dbus address URI list down to a UNIX socket address, and the
//! environment-driven default discovery for the session and system buses.

use nix::sys::socket::UnixAddr;
use nix::unistd::getuid;

use crate::error::{Error, Result};

/// Parse a single `unix:k=v,k=v` address into a [`UnixAddr`]. Prefers
/// `abstract=` over `path=` when both are present, matching how most
/// peers advertise an abstract-namespace path as a fallback alongside a
/// filesystem one. Returns `None` if nothing in this entry is both
/// understood and usable (e.g. a `path=` that doesn't exist).
fn parse_entry(entry: &str) -> Option<UnixAddr> {
    let rest = entry.strip_prefix("unix:")?;

    let mut abstract_name = None;
    let mut path = None;
    for kv in rest.split(',') {
        let (key, value) = kv.split_once('=')?;
        match key {
            "abstract" => abstract_name = Some(value),
            "path" => path = Some(value),
            _ => {}
        }
    }

    if let Some(name) = abstract_name {
        return UnixAddr::new_abstract(name.as_bytes()).ok();
    }
    if let Some(path) = path {
        if std::path::Path::new(path).exists() {
            return UnixAddr::new(path).ok();
        }
    }
    None
}

/// Resolve a semicolon-delimited list of dbus address URIs to the first
/// entry that parses and is actually usable.
pub fn resolve(uris: &str) -> Option<UnixAddr> {
    uris.split(';').find_map(parse_entry)
}

fn runtime_dir_candidates() -> String {
    let uid = getuid();
    match std::env::var("XDG_RUNTIME_DIR") {
        Ok(dir) => format!("unix:path={dir}/bus"),
        Err(_) => format!(
            "unix:path=/run/user/{uid}/bus;unix:path=/var/run/user/{uid}/bus"
        ),
    }
}

/// The session bus address: `$DBUS_SESSION_BUS_ADDRESS` if set, else the
/// XDG runtime directory's `bus` socket, else `/run/user/<uid>/bus`.
pub fn session_bus_address() -> Result<UnixAddr> {
    let candidates = match std::env::var("DBUS_SESSION_BUS_ADDRESS") {
        Ok(v) => v,
        Err(_) => runtime_dir_candidates(),
    };
    let addr = resolve(&candidates).ok_or(Error::AddressUnresolved)?;
    log::debug!("resolved session bus address from {:?}", candidates);
    Ok(addr)
}

/// The system bus address: `$DBUS_SYSTEM_BUS_ADDRESS` if set, else
/// `/run/dbus/system_bus_socket` or `/var/run/dbus/system_bus_socket`.
pub fn system_bus_address() -> Result<UnixAddr> {
    const DEFAULT: &str =
        "unix:path=/run/dbus/system_bus_socket;unix:path=/var/run/dbus/system_bus_socket";
    let candidates = std::env::var("DBUS_SYSTEM_BUS_ADDRESS").unwrap_or_else(|_| DEFAULT.to_owned());
    let addr = resolve(&candidates).ok_or(Error::AddressUnresolved)?;
    log::debug!("resolved system bus address from {:?}", candidates);
    Ok(addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_abstract_over_path() {
        let addr = parse_entry("unix:path=/does/not/exist,abstract=test-addr").unwrap();
        assert_eq!(addr, UnixAddr::new_abstract(b"test-addr").unwrap());
    }

    #[test]
    fn rejects_nonexistent_path_only_entry() {
        assert!(parse_entry("unix:path=/tmp/dbus-test-definitely-not-exist").is_none());
    }

    #[test]
    fn resolve_picks_first_usable_entry_in_list() {
        let uris = "unix:path=/tmp/dbus-test-definitely-not-exist;unix:abstract=test-addr-2";
        let addr = resolve(uris).unwrap();
        assert_eq!(addr, UnixAddr::new_abstract(b"test-addr-2").unwrap());
    }

    #[test]
    fn resolve_returns_none_when_nothing_usable() {
        assert!(resolve("unix:path=/tmp/dbus-test-definitely-not-exist").is_none());
        assert!(resolve("tcp:host=localhost,port=1234").is_none());
    }
}
