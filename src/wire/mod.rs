//! Everything that deals with converting to/from raw bytes: the type-plan
//! driven marshaller/unmarshaller and the fixed set of message header
//! fields.

pub mod marshal;
pub mod unmarshal;
pub mod util;

/// The fixed, 1-based set of header fields a message may carry (§3 of the
/// spec). Declared once here since both the marshaller and the unmarshaller
/// need the same (index, name, type-code) table.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HeaderFields {
    pub path: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub error_name: Option<String>,
    pub reply_serial: Option<u32>,
    pub destination: Option<String>,
    pub sender: Option<String>,
    pub signature: Option<String>,
    pub unix_fds: Option<u32>,
}
