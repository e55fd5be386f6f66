//! The crate-wide error type.

use crate::signature::Error as SignatureError;
use crate::wire::marshal::MarshalError;
use crate::wire::unmarshal::UnmarshalError;

/// Errors that can occur anywhere in this crate, from resolving a bus
/// address to decoding a reply body.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("could not resolve a usable bus address from the given URI list")]
    AddressUnresolved,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("nix error: {0}")]
    Nix(#[from] nix::Error),

    #[error("authentication was rejected by the bus")]
    AuthRejected,

    #[error("invalid signature: {0}")]
    Signature(#[from] SignatureError),

    #[error("failed to marshal message: {0}")]
    Marshal(#[from] MarshalError),

    #[error("failed to unmarshal message: {0}")]
    Unmarshal(#[from] UnmarshalError),

    #[error("the connection was closed by the peer")]
    Disconnected,

    #[error("remote error {name}: {message}")]
    RemoteError { name: String, message: String },

    #[error("RequestName was not granted ownership, reply code was {0}")]
    NameAcquisitionFailed(u32),

    #[error("received a message with an unexpected type or missing reply_serial")]
    UnexpectedMessageType,

    #[error("operation timed out")]
    TimedOut,
}

pub type Result<T> = std::result::Result<T, Error>;
