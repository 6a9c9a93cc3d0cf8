//! The convergent error type for all driver operations.

use std::fmt;

use crate::auth::AuthError;
use crate::crypt::CryptoError;
use crate::iso7816::apdu::StatusWord;
use crate::iso7816::card::TransportError;


/// A command the tag answered with a non-success status word.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct StatusError {
    /// The DESFire or ISO instruction byte the failure is attributed to.
    pub ins: u8,
    pub sw: StatusWord,
}
impl fmt::Display for StatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "command 0x{:02X} failed with status {}", self.ins, self.sw)
    }
}
impl std::error::Error for StatusError {
}


/// NDEF and SDM template construction or parsing failures.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum NdefError {
    /// The base URL has no scheme or host.
    NotAbsolute,
    /// The NDEF message would not fit the 256-byte file.
    TooLong { length: usize },
    /// The URL string itself could not be parsed.
    BadUrl,
    /// A required query parameter is absent.
    MissingParameter(&'static str),
    /// A query parameter has the wrong length or is not valid hex.
    BadParameter(&'static str),
    /// The NDEF or CC structure read from the tag is malformed.
    Structure(&'static str),
}
impl fmt::Display for NdefError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAbsolute
                => write!(f, "URL must be absolute (scheme and host)"),
            Self::TooLong { length }
                => write!(f, "NDEF message of {} bytes exceeds the 256-byte file", length),
            Self::BadUrl
                => write!(f, "URL could not be parsed"),
            Self::MissingParameter(name)
                => write!(f, "missing query parameter {:?}", name),
            Self::BadParameter(name)
                => write!(f, "malformed query parameter {:?}", name),
            Self::Structure(what)
                => write!(f, "malformed structure: {}", what),
        }
    }
}
impl std::error::Error for NdefError {
}


#[derive(Debug)]
pub enum Error {
    /// The transceiver itself failed; the tag never answered.
    Transport(TransportError),
    /// The tag answered with a classified or unclassified error status.
    Status(StatusError),
    /// The EV2First handshake failed.
    Auth(AuthError),
    /// Bad lengths, bad padding, MAC or RndA mismatch.
    Crypto(CryptoError),
    /// NDEF or SDM template problems.
    Ndef(NdefError),
    /// An operation was attempted on an invalidated session.
    InvalidSession,
    /// The assembled APDU body would exceed the 255-byte Lc field.
    ApduTooLong { length: usize },
    /// The response was too short to carry a status word (or a MAC where one
    /// was required).
    ShortResponse { length: usize },
    /// A structure received from the tag did not decode.
    Parse(&'static str),
    /// A slot, file number or counter outside its encodable range.
    OutOfRange { what: &'static str, value: u32 },
}
impl Error {
    pub fn status(ins: u8, sw: StatusWord) -> Self {
        Self::Status(StatusError { ins, sw })
    }

    /// The status word the tag answered with, if this is a status failure.
    pub fn status_word(&self) -> Option<StatusWord> {
        match self {
            Self::Status(e) => Some(e.sw),
            Self::Auth(e) => e.sw,
            _ => None,
        }
    }

    pub fn is_length_error(&self) -> bool {
        self.status_word().map(|sw| sw.is_length_error()).unwrap_or(false)
    }

    pub fn is_boundary_error(&self) -> bool {
        match self {
            Self::Status(e) => matches!(e.sw.class(), crate::iso7816::apdu::StatusClass::BoundaryError),
            _ => false,
        }
    }
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "{}", e),
            Self::Status(e) => write!(f, "{}", e),
            Self::Auth(e) => write!(f, "{}", e),
            Self::Crypto(e) => write!(f, "{}", e),
            Self::Ndef(e) => write!(f, "{}", e),
            Self::InvalidSession => write!(f, "session has been invalidated"),
            Self::ApduTooLong { length } => write!(f, "APDU data of {} bytes exceeds 255", length),
            Self::ShortResponse { length } => write!(f, "response too short ({} bytes)", length),
            Self::Parse(what) => write!(f, "parse error: {}", what),
            Self::OutOfRange { what, value } => write!(f, "{} out of range: {}", what, value),
        }
    }
}
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            Self::Status(e) => Some(e),
            Self::Auth(e) => Some(e),
            Self::Crypto(e) => Some(e),
            Self::Ndef(e) => Some(e),
            Self::InvalidSession => None,
            Self::ApduTooLong { .. } => None,
            Self::ShortResponse { .. } => None,
            Self::Parse(_) => None,
            Self::OutOfRange { .. } => None,
        }
    }
}
impl From<TransportError> for Error {
    fn from(value: TransportError) -> Self { Self::Transport(value) }
}
impl From<StatusError> for Error {
    fn from(value: StatusError) -> Self { Self::Status(value) }
}
impl From<AuthError> for Error {
    fn from(value: AuthError) -> Self { Self::Auth(value) }
}
impl From<CryptoError> for Error {
    fn from(value: CryptoError) -> Self { Self::Crypto(value) }
}
impl From<NdefError> for Error {
    fn from(value: NdefError) -> Self { Self::Ndef(value) }
}
