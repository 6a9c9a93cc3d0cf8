//! Status words and response framing for ISO 7816-4 APDUs.

use std::fmt;


// ISO 7816 status words
pub const SW_SUCCESS: u16 = 0x9000;
pub const SW_SECURITY_NOT_SATISFIED: u16 = 0x6982;
pub const SW_FILE_NOT_FOUND: u16 = 0x6A82;
pub const SW_WRONG_P1P2: u16 = 0x6A86;
pub const SW_WRONG_LENGTH: u16 = 0x6700;

// DESFire status words (SW1 = 0x91)
pub const SW_DESFIRE_OK: u16 = 0x9100;
pub const SW_MORE_DATA: u16 = 0x91AF;
pub const SW_LENGTH_ERROR: u16 = 0x917E;
pub const SW_AUTH_ERROR: u16 = 0x91AE;
pub const SW_PERMISSION_DENIED: u16 = 0x919D;
pub const SW_PARAMETER_ERROR: u16 = 0x919E;
pub const SW_BOUNDARY_ERROR: u16 = 0x911C;
pub const SW_NO_CHANGE: u16 = 0x9140;


/// The trailing two status bytes of a response APDU.
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct StatusWord {
    pub sw1: u8,
    pub sw2: u8,
}
impl StatusWord {
    pub const fn new(sw1: u8, sw2: u8) -> Self {
        Self {
            sw1,
            sw2,
        }
    }

    pub const fn from_word(word: u16) -> Self {
        Self {
            sw1: (word >> 8) as u8,
            sw2: (word & 0xFF) as u8,
        }
    }

    pub const fn to_word(&self) -> u16 {
        u16::from_be_bytes([self.sw1, self.sw2])
    }

    /// Classifies the status word into the retry-relevant categories.
    pub fn class(&self) -> StatusClass {
        match self.to_word() {
            SW_SUCCESS|SW_DESFIRE_OK => StatusClass::Success,
            SW_MORE_DATA => StatusClass::MoreData,
            SW_LENGTH_ERROR|SW_WRONG_LENGTH => StatusClass::LengthError,
            SW_AUTH_ERROR => StatusClass::AuthenticationError,
            SW_SECURITY_NOT_SATISFIED => StatusClass::SecurityNotSatisfied,
            SW_PERMISSION_DENIED => StatusClass::PermissionDenied,
            SW_PARAMETER_ERROR => StatusClass::ParameterError,
            SW_BOUNDARY_ERROR => StatusClass::BoundaryError,
            SW_NO_CHANGE => StatusClass::NoChange,
            SW_FILE_NOT_FOUND => StatusClass::FileNotFound,
            SW_WRONG_P1P2 => StatusClass::WrongParameters,
            _ => {
                if self.sw1 == 0x6C {
                    // SW2 carries the Le the tag would have accepted
                    StatusClass::WrongLe(self.sw2)
                } else {
                    StatusClass::Other
                }
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.class(), StatusClass::Success)
    }

    /// Length-class errors: `917E`, `6700` and the `6C??` family.
    pub fn is_length_error(&self) -> bool {
        matches!(self.class(), StatusClass::LengthError | StatusClass::WrongLe(_))
    }

    /// Authentication-class errors: `91AE` and `6982`.
    pub fn is_auth_error(&self) -> bool {
        matches!(self.class(), StatusClass::AuthenticationError | StatusClass::SecurityNotSatisfied)
    }

    fn description(&self) -> &'static str {
        match self.class() {
            StatusClass::Success => "success",
            StatusClass::MoreData => "more data expected",
            StatusClass::LengthError => "length error",
            StatusClass::WrongLe(_) => "wrong Le",
            StatusClass::AuthenticationError => "authentication error",
            StatusClass::SecurityNotSatisfied => "security status not satisfied",
            StatusClass::PermissionDenied => "permission denied",
            StatusClass::ParameterError => "parameter error",
            StatusClass::BoundaryError => "boundary error",
            StatusClass::NoChange => "no change",
            StatusClass::FileNotFound => "file not found",
            StatusClass::WrongParameters => "wrong P1/P2",
            StatusClass::Other => "unclassified",
        }
    }
}
impl fmt::Debug for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StatusWord {} sw1: 0x{:02X}, sw2: 0x{:02X} {}", '{', self.sw1, self.sw2, '}')
    }
}
impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X} ({})", self.to_word(), self.description())
    }
}


/// The status categories an operation may branch on.
///
/// Retry policy lives at the call sites: READ BINARY retries once on
/// [`StatusClass::WrongLe`], GetFileSettings retries its secure form on the
/// length class, everything else surfaces the classified word to the caller.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum StatusClass {
    Success,
    MoreData,
    LengthError,
    WrongLe(u8),
    AuthenticationError,
    SecurityNotSatisfied,
    PermissionDenied,
    ParameterError,
    BoundaryError,
    NoChange,
    FileNotFound,
    WrongParameters,
    Other,
}


/// A response APDU split into its data and trailing status word.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Response {
    pub data: Vec<u8>,
    pub status: StatusWord,
}
impl Response {
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 2 {
            return None;
        }

        let data = bytes[..bytes.len() - 2].to_vec();
        let status = StatusWord {
            sw1: bytes[bytes.len() - 2],
            sw2: bytes[bytes.len() - 1],
        };
        Some(Self {
            data,
            status,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(StatusWord::from_word(0x9000).class(), StatusClass::Success);
        assert_eq!(StatusWord::from_word(0x9100).class(), StatusClass::Success);
        assert_eq!(StatusWord::from_word(0x91AF).class(), StatusClass::MoreData);
        assert_eq!(StatusWord::from_word(0x917E).class(), StatusClass::LengthError);
        assert_eq!(StatusWord::from_word(0x6700).class(), StatusClass::LengthError);
        assert_eq!(StatusWord::from_word(0x6C20).class(), StatusClass::WrongLe(0x20));
        assert_eq!(StatusWord::from_word(0x91AE).class(), StatusClass::AuthenticationError);
        assert_eq!(StatusWord::from_word(0x6982).class(), StatusClass::SecurityNotSatisfied);
        assert_eq!(StatusWord::from_word(0x919D).class(), StatusClass::PermissionDenied);
        assert_eq!(StatusWord::from_word(0x919E).class(), StatusClass::ParameterError);
        assert_eq!(StatusWord::from_word(0x911C).class(), StatusClass::BoundaryError);
        assert_eq!(StatusWord::from_word(0x9140).class(), StatusClass::NoChange);
        assert_eq!(StatusWord::from_word(0x6A82).class(), StatusClass::FileNotFound);
        assert_eq!(StatusWord::from_word(0x6A86).class(), StatusClass::WrongParameters);
        assert_eq!(StatusWord::from_word(0x6985).class(), StatusClass::Other);
    }

    #[test]
    fn test_length_and_auth_groups() {
        assert!(StatusWord::from_word(0x917E).is_length_error());
        assert!(StatusWord::from_word(0x6700).is_length_error());
        assert!(StatusWord::from_word(0x6C04).is_length_error());
        assert!(!StatusWord::from_word(0x9100).is_length_error());
        assert!(StatusWord::from_word(0x91AE).is_auth_error());
        assert!(StatusWord::from_word(0x6982).is_auth_error());
        assert!(!StatusWord::from_word(0x919D).is_auth_error());
    }

    #[test]
    fn test_response_split() {
        let response = Response::from_slice(&[0x01, 0x02, 0x91, 0x00]).unwrap();
        assert_eq!(response.data, vec![0x01, 0x02]);
        assert_eq!(response.status.to_word(), 0x9100);

        let empty = Response::from_slice(&[0x91, 0xAF]).unwrap();
        assert!(empty.data.is_empty());
        assert_eq!(empty.status.to_word(), 0x91AF);

        assert!(Response::from_slice(&[0x90]).is_none());
    }
}
