//! File settings: the access-rights model, the wire codec, and the
//! GetFileSettings / ChangeFileSettings operations.

use std::fmt;
use std::thread;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::crypt::{u24_from_le, u24_to_le};
use crate::error::Error;
use crate::iso7816::card::{Transceiver, transceive};
use crate::secure_messaging::{self, Session};


// SDM option bits
pub const SDM_OPT_UID_MIRROR: u8 = 0x80;
pub const SDM_OPT_READ_CTR: u8 = 0x40;
pub const SDM_OPT_READ_CTR_LIMIT: u8 = 0x20;
pub const SDM_OPT_ENC_FILE_DATA: u8 = 0x10;
pub const SDM_OPT_TT_STATUS: u8 = 0x01;


/// One access-rights nibble.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum AccessCondition {
    /// Authentication with the named key slot is required.
    Key(u8),
    /// No authentication required (`0xE`).
    Free,
    /// Never permitted (`0xF`).
    Denied,
}
impl AccessCondition {
    pub fn from_nibble(nibble: u8) -> Self {
        match nibble & 0x0F {
            0x0E => Self::Free,
            0x0F => Self::Denied,
            slot => Self::Key(slot),
        }
    }

    pub fn nibble(&self) -> u8 {
        match self {
            Self::Key(slot) => slot & 0x0F,
            Self::Free => 0x0E,
            Self::Denied => 0x0F,
        }
    }

    pub fn is_free(&self) -> bool {
        matches!(self, Self::Free)
    }

    pub fn is_denied(&self) -> bool {
        matches!(self, Self::Denied)
    }
}
impl fmt::Display for AccessCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(slot) => write!(f, "key slot {}", slot),
            Self::Free => write!(f, "free (no authentication)"),
            Self::Denied => write!(f, "denied"),
        }
    }
}


/// The four access-rights nibbles of a file, packed into AR1/AR2 on the
/// wire.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct AccessRights {
    pub read: AccessCondition,
    pub write: AccessCondition,
    pub read_write: AccessCondition,
    pub change: AccessCondition,
}
impl AccessRights {
    /// `AR1 = (RW << 4) | CAR`, `AR2 = (R << 4) | W`.
    pub fn to_bytes(&self) -> (u8, u8) {
        let ar1 = (self.read_write.nibble() << 4) | self.change.nibble();
        let ar2 = (self.read.nibble() << 4) | self.write.nibble();
        (ar1, ar2)
    }

    pub fn from_bytes(ar1: u8, ar2: u8) -> Self {
        Self {
            read: AccessCondition::from_nibble(ar2 >> 4),
            write: AccessCondition::from_nibble(ar2 & 0x0F),
            read_write: AccessCondition::from_nibble(ar1 >> 4),
            change: AccessCondition::from_nibble(ar1 & 0x0F),
        }
    }
}


/// The SDM access-rights word: Meta(4) | File(4) | RFU(4) | Ctr(4), MSB to
/// LSB, emitted little-endian on the wire.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SdmAccessRights {
    pub meta: AccessCondition,
    pub file: AccessCondition,
    pub ctr: AccessCondition,
}
impl SdmAccessRights {
    pub fn to_word(&self) -> u16 {
        // widen before shifting; nibble shifts of 8 and 12 do not fit a u8
        (u16::from(self.meta.nibble()) << 12)
        | (u16::from(self.file.nibble()) << 8)
        | (0x0F << 4)
        | u16::from(self.ctr.nibble())
    }

    pub fn to_le_bytes(&self) -> [u8; 2] {
        self.to_word().to_le_bytes()
    }

    pub fn from_word(word: u16) -> Self {
        Self {
            meta: AccessCondition::from_nibble((word >> 12) as u8),
            file: AccessCondition::from_nibble((word >> 8) as u8),
            ctr: AccessCondition::from_nibble(word as u8),
        }
    }
}


/// The SDM part of a file's settings.
///
/// The offset fields are conditional on the wire; a field is `Some` exactly
/// when the options byte and access rights say the tag transmits it.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SdmSettings {
    pub options: u8,
    pub access: SdmAccessRights,
    pub uid_offset: Option<u32>,
    pub ctr_offset: Option<u32>,
    pub picc_data_offset: Option<u32>,
    pub mac_input_offset: Option<u32>,
    pub mac_offset: Option<u32>,
    pub enc_offset: Option<u32>,
    pub enc_length: Option<u32>,
    pub ctr_limit: Option<u32>,
}
impl Default for SdmAccessRights {
    fn default() -> Self {
        Self {
            meta: AccessCondition::Denied,
            file: AccessCondition::Denied,
            ctr: AccessCondition::Denied,
        }
    }
}


/// A decoded GetFileSettings response.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct FileSettings {
    pub file_type: u8,
    /// Mode bits 1:0 and the SDM-enabled bit 6, as received.
    pub file_option: u8,
    pub access: AccessRights,
    /// File size in bytes (3-byte little-endian on the wire).
    pub size: u32,
    pub sdm: Option<SdmSettings>,
}
impl FileSettings {
    /// Decodes a GetFileSettings response body.
    ///
    /// The conditional SDM offsets are included or skipped by exactly the
    /// rules [`FileSettings::change_payload`] uses to emit them; the two
    /// must agree or the tag rejects the next ChangeFileSettings with a
    /// length error.
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        if data.len() < 7 {
            return Err(Error::Parse("file settings too short"));
        }
        let file_type = data[0];
        let file_option = data[1];
        let access = AccessRights::from_bytes(data[2], data[3]);
        let size = u24_from_le([data[4], data[5], data[6]]);

        if file_option & 0x40 == 0 {
            return Ok(Self {
                file_type,
                file_option,
                access,
                size,
                sdm: None,
            });
        }

        let mut reader = OffsetReader { data, position: 7 };
        let options = reader.take_byte("file settings missing SDM options")?;
        let word_lo = reader.take_byte("file settings missing SDM access rights")?;
        let word_hi = reader.take_byte("file settings missing SDM access rights")?;
        let sdm_access = SdmAccessRights::from_word(u16::from_le_bytes([word_lo, word_hi]));

        let mut sdm = SdmSettings {
            options,
            access: sdm_access,
            ..SdmSettings::default()
        };

        if options & SDM_OPT_UID_MIRROR != 0 && sdm_access.meta.is_free() {
            sdm.uid_offset = Some(reader.take_u24("file settings missing UID offset")?);
        }
        if options & SDM_OPT_READ_CTR != 0 && sdm_access.meta.is_free() {
            sdm.ctr_offset = Some(reader.take_u24("file settings missing counter offset")?);
        }
        if let AccessCondition::Key(_) = sdm_access.meta {
            sdm.picc_data_offset = Some(reader.take_u24("file settings missing PICC data offset")?);
        }
        if !sdm_access.file.is_denied() {
            sdm.mac_input_offset = Some(reader.take_u24("file settings missing MAC input offset")?);
            sdm.mac_offset = Some(reader.take_u24("file settings missing MAC offset")?);
        }
        if options & SDM_OPT_ENC_FILE_DATA != 0 {
            sdm.enc_offset = Some(reader.take_u24("file settings missing ENC offset")?);
            sdm.enc_length = Some(reader.take_u24("file settings missing ENC length")?);
        }
        if options & SDM_OPT_READ_CTR_LIMIT != 0 {
            sdm.ctr_limit = Some(reader.take_u24("file settings missing counter limit")?);
        }

        Ok(Self {
            file_type,
            file_option,
            access,
            size,
            sdm: Some(sdm),
        })
    }

    /// Encodes the ChangeFileSettings data payload for these settings.
    ///
    /// `FileOption || AR1 || AR2` for the basic shape; the SDM shape appends
    /// the options byte, the little-endian access-rights word, and the
    /// conditional offsets in the tag's fixed inclusion order. Bit 6 of the
    /// emitted FileOption is set exactly when the SDM options byte is
    /// non-zero.
    pub fn change_payload(&self) -> Vec<u8> {
        let (ar1, ar2) = self.access.to_bytes();
        let comm_mode = self.file_option & 0x03;

        let Some(sdm) = &self.sdm else {
            return vec![comm_mode, ar1, ar2];
        };

        let mut file_option = comm_mode;
        if sdm.options != 0x00 {
            file_option |= 0x40;
        }

        let mut payload = Vec::with_capacity(32);
        payload.extend([file_option, ar1, ar2, sdm.options]);
        payload.extend(sdm.access.to_le_bytes());

        if sdm.options & SDM_OPT_UID_MIRROR != 0 && sdm.access.meta.is_free() {
            payload.extend(u24_to_le(sdm.uid_offset.unwrap_or(0)));
        }
        if sdm.options & SDM_OPT_READ_CTR != 0 && sdm.access.meta.is_free() {
            payload.extend(u24_to_le(sdm.ctr_offset.unwrap_or(0)));
        }
        if let AccessCondition::Key(_) = sdm.access.meta {
            payload.extend(u24_to_le(sdm.picc_data_offset.unwrap_or(0)));
        }
        if !sdm.access.file.is_denied() {
            payload.extend(u24_to_le(sdm.mac_input_offset.unwrap_or(0)));
            payload.extend(u24_to_le(sdm.mac_offset.unwrap_or(0)));
        }
        if sdm.options & SDM_OPT_ENC_FILE_DATA != 0 {
            payload.extend(u24_to_le(sdm.enc_offset.unwrap_or(0)));
            payload.extend(u24_to_le(sdm.enc_length.unwrap_or(0)));
        }
        if sdm.options & SDM_OPT_READ_CTR_LIMIT != 0 {
            payload.extend(u24_to_le(sdm.ctr_limit.unwrap_or(0)));
        }
        payload
    }
}

struct OffsetReader<'d> {
    data: &'d [u8],
    position: usize,
}
impl<'d> OffsetReader<'d> {
    fn take_byte(&mut self, context: &'static str) -> Result<u8, Error> {
        if self.position >= self.data.len() {
            return Err(Error::Parse(context));
        }
        let byte = self.data[self.position];
        self.position += 1;
        Ok(byte)
    }

    fn take_u24(&mut self, context: &'static str) -> Result<u32, Error> {
        if self.position + 3 > self.data.len() {
            return Err(Error::Parse(context));
        }
        let value = u24_from_le([
            self.data[self.position],
            self.data[self.position + 1],
            self.data[self.position + 2],
        ]);
        self.position += 3;
        Ok(value)
    }
}


pub(crate) fn check_file_number(file_no: u8) -> Result<(), Error> {
    if file_no > 0x1F {
        return Err(Error::OutOfRange { what: "file number", value: file_no.into() });
    }
    Ok(())
}

/// Reads file settings with the single plain form most tags accept
/// (Le = 0, wildcard).
pub fn get_file_settings_plain(tag: &mut dyn Transceiver, file_no: u8) -> Result<FileSettings, Error> {
    check_file_number(file_no)?;
    let apdu = [0x90, 0xF5, 0x00, 0x00, 0x01, file_no, 0x00];
    let response = transceive(tag, &apdu)?;
    if !response.status.is_success() {
        return Err(Error::status(0xF5, response.status));
    }
    FileSettings::parse(&response.data)
}

/// Reads file settings through the authenticated channel.
pub fn get_file_settings_secure(
    tag: &mut dyn Transceiver,
    session: &mut Session,
    file_no: u8,
) -> Result<FileSettings, Error> {
    check_file_number(file_no)?;
    let body = secure_messaging::execute(tag, session, 0xF5, &[file_no], &[])?;
    FileSettings::parse(&body)
}

/// Reads file settings, plain first, then through the session.
///
/// The plain forms are tried with Le = `0x20`, `0x10`, absent, and `0x00`;
/// tags differ in which encodings they tolerate, and the wildcard is the
/// one that works almost everywhere. If all four fail the authenticated
/// form is attempted up to three times, 100 ms apart, retrying only on
/// length-class errors, which absorbs the settling window right after a
/// ChangeFileSettings.
#[instrument(skip(tag, session))]
pub fn get_file_settings(
    tag: &mut dyn Transceiver,
    session: &mut Session,
    file_no: u8,
) -> Result<FileSettings, Error> {
    check_file_number(file_no)?;

    let plain_forms: [&[u8]; 4] = [
        &[0x90, 0xF5, 0x00, 0x00, 0x01, file_no, 0x20],
        &[0x90, 0xF5, 0x00, 0x00, 0x01, file_no, 0x10],
        &[0x90, 0xF5, 0x00, 0x00, 0x01, file_no],
        &[0x90, 0xF5, 0x00, 0x00, 0x01, file_no, 0x00],
    ];
    let mut plain_status = None;
    for (attempt, apdu) in plain_forms.iter().enumerate() {
        let response = transceive(tag, apdu)?;
        debug!(
            file_no,
            attempt = attempt + 1,
            status = %response.status,
            response_len = response.data.len(),
            "GetFileSettings plain attempt"
        );
        if response.status.is_success() {
            return FileSettings::parse(&response.data);
        }
        plain_status = Some(response.status);
    }

    // the loop above ran at least once
    let plain_status = plain_status.unwrap();
    warn!(
        file_no,
        last_status = %plain_status,
        "all plain GetFileSettings forms failed, falling back to secure messaging"
    );

    let mut last_error = None;
    for attempt in 0..3 {
        if attempt > 0 {
            thread::sleep(Duration::from_millis(100));
        }
        match get_file_settings_secure(tag, session, file_no) {
            Ok(settings) => return Ok(settings),
            Err(e) => {
                let retryable = e.is_length_error();
                last_error = Some(e);
                if !retryable {
                    break;
                }
            },
        }
    }
    Err(last_error.unwrap())
}

/// Writes file settings through the authenticated channel.
///
/// `settings.file_type` and `settings.size` are read-only properties of the
/// file and are not part of the payload.
#[instrument(skip(tag, session, settings))]
pub fn change_file_settings(
    tag: &mut dyn Transceiver,
    session: &mut Session,
    file_no: u8,
    settings: &FileSettings,
) -> Result<(), Error> {
    check_file_number(file_no)?;
    if let Some(sdm) = &settings.sdm {
        for (what, value) in [
            ("UID offset", sdm.uid_offset),
            ("counter offset", sdm.ctr_offset),
            ("PICC data offset", sdm.picc_data_offset),
            ("MAC input offset", sdm.mac_input_offset),
            ("MAC offset", sdm.mac_offset),
            ("ENC offset", sdm.enc_offset),
            ("ENC length", sdm.enc_length),
            ("counter limit", sdm.ctr_limit),
        ] {
            if let Some(value) = value {
                if value > 0xFF_FFFF {
                    return Err(Error::OutOfRange { what, value });
                }
            }
        }
    }
    let payload = settings.change_payload();
    secure_messaging::execute(tag, session, 0x5F, &[file_no], &payload)?;
    Ok(())
}
