//! All possible non-I/O protocol errors.
use core::{
    error,
    fmt::{Display, Formatter},
};
use std::io::{self, ErrorKind};

/// Enumeration of all possible non-I/O protocol errors.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum Error {
    /// The inbound stream failed a cryptographic check.
    ///
    /// This could be a wrong passphrase, a replayed recording of an earlier
    /// connection, or an active probe. The peer address should be reported,
    /// and in black-list ACL mode it may be auto-banned.
    BadDataReceived(BadDataReceived),

    /// The peer deviated from the relay protocol. Typically caused by a
    /// peer that holds the correct key but sends malformed data.
    ///
    /// The parameter provides a hint about where the deviation occurred.
    /// The connection is closed without any change of behavior.
    PeerMisbehaved(PeerMisbehaved),
}

/// All errors that warrant reporting the peer address.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum BadDataReceived {
    /// The initialization vector of the inbound stream was seen before
    /// under the same master key.
    ReusedIv,

    /// The one-time-auth tag over the request header did not verify.
    HeaderAuthFailed,

    /// The one-time-auth tag of an authenticated payload chunk did not
    /// verify, or chunks arrived out of counter order.
    ChunkAuthFailed,

    /// The cipher primitive rejected the stream. With the ciphers in this
    /// crate this is only reachable through keystream exhaustion, but it
    /// is kept distinct so the relay can log "invalid password or cipher"
    /// the way shadowsocks-libev does.
    DecryptFailed,
}

/// The connection cannot continue due to improper behavior by the peer.
///
/// Generally, implementers should not alter their behavior in response
/// to these errors, and there is nothing that can be done to improve matters.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum PeerMisbehaved {
    /// The address-type byte of the request header is not IPv4, IPv6 or
    /// domain.
    InvalidAddressType {
        /// The received address-type byte, auth flag masked off.
        received: u8,
    },

    /// A domain address was not valid UTF-8.
    InvalidDomainEncoding,

    /// The stream or datagram ended before the expected header (or IV
    /// prefix) arrived.
    TruncatedHeader,

    /// The `LEN` field of an authenticated chunk exceeds the relay buffer
    /// size.
    OversizedChunk {
        /// The received `LEN` field.
        received: u16,
    },
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::BadDataReceived(err) => write!(f, "BadDataReceived: {}", err),
            Error::PeerMisbehaved(err) => write!(f, "PeerMisbehaved: {}", err),
        }
    }
}

impl Display for BadDataReceived {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            BadDataReceived::ReusedIv => write!(f, "ReusedIv"),
            BadDataReceived::HeaderAuthFailed => write!(f, "HeaderAuthFailed"),
            BadDataReceived::ChunkAuthFailed => write!(f, "ChunkAuthFailed"),
            BadDataReceived::DecryptFailed => write!(f, "DecryptFailed"),
        }
    }
}

impl Display for PeerMisbehaved {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            PeerMisbehaved::InvalidAddressType { received } => {
                write!(f, "InvalidAddressType: received {:#04x}", received)
            }
            PeerMisbehaved::InvalidDomainEncoding => write!(f, "InvalidDomainEncoding"),
            PeerMisbehaved::TruncatedHeader => write!(f, "TruncatedHeader"),
            PeerMisbehaved::OversizedChunk { received } => {
                write!(f, "OversizedChunk: received {}", received)
            }
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::BadDataReceived(err) => Some(err),
            Error::PeerMisbehaved(err) => Some(err),
        }
    }
}

impl error::Error for BadDataReceived {}

impl error::Error for PeerMisbehaved {}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        io::Error::new(ErrorKind::Other, e)
    }
}

impl From<BadDataReceived> for io::Error {
    fn from(e: BadDataReceived) -> Self {
        io::Error::new(ErrorKind::Other, Error::BadDataReceived(e))
    }
}

impl From<PeerMisbehaved> for io::Error {
    fn from(e: PeerMisbehaved) -> Self {
        io::Error::new(ErrorKind::Other, Error::PeerMisbehaved(e))
    }
}

impl From<BadDataReceived> for Error {
    fn from(e: BadDataReceived) -> Self {
        Error::BadDataReceived(e)
    }
}

impl From<PeerMisbehaved> for Error {
    fn from(e: PeerMisbehaved) -> Self {
        Error::PeerMisbehaved(e)
    }
}

impl Error {
    /// Extracts a protocol error back out of an [`io::Error`] produced by
    /// this crate, if there is one.
    pub fn from_io(e: &io::Error) -> Option<&Error> {
        e.get_ref().and_then(|inner| inner.downcast_ref::<Error>())
    }
}
