//! ISO 7816 file-level plumbing: SELECT, READ BINARY, UPDATE BINARY.

use tracing::warn;

use crate::error::{Error, NdefError};
use crate::iso7816::apdu::StatusClass;
use crate::iso7816::card::{Transceiver, transceive, transceive_ok};


/// The NFC Forum NDEF Type 4 application.
pub const NDEF_AID: [u8; 7] = [0xD2, 0x76, 0x00, 0x00, 0x85, 0x01, 0x01];

/// Capability Container file.
pub const FILE_ID_CC: u16 = 0xE103;
/// NDEF file.
pub const FILE_ID_NDEF: u16 = 0xE104;
/// Proprietary data file.
pub const FILE_ID_PROPRIETARY: u16 = 0xE105;


/// Selects the NDEF application.
///
/// Any SELECT invalidates an active authentication session on the tag;
/// select first and authenticate afterwards.
pub fn select_ndef_application(tag: &mut dyn Transceiver) -> Result<(), Error> {
    let mut apdu = Vec::with_capacity(6 + NDEF_AID.len());
    apdu.extend([0x00, 0xA4, 0x04, 0x00, NDEF_AID.len() as u8]);
    apdu.extend(NDEF_AID);
    apdu.push(0x00);
    transceive_ok(tag, 0xA4, &apdu)?;
    Ok(())
}

/// Selects a file of the current application by its 16-bit identifier.
///
/// Like SELECT of an application, this invalidates an active authentication
/// session on the tag.
pub fn select_file(tag: &mut dyn Transceiver, file_id: u16) -> Result<(), Error> {
    let apdu = [0x00, 0xA4, 0x00, 0x0C, 0x02, (file_id >> 8) as u8, (file_id & 0xFF) as u8];
    transceive_ok(tag, 0xA4, &apdu)?;
    Ok(())
}

/// Reads up to 255 bytes from the selected file.
///
/// If the tag rejects the requested Le with `6C??`, the read is retried once
/// with the Le the tag suggested.
pub fn read_binary(tag: &mut dyn Transceiver, offset: u16, le: u8) -> Result<Vec<u8>, Error> {
    let mut apdu = [0x00, 0xB0, (offset >> 8) as u8, (offset & 0xFF) as u8, le];
    let mut response = transceive(tag, &apdu)?;

    if let StatusClass::WrongLe(correct_le) = response.status.class() {
        warn!(requested_le = le, correct_le, "READ BINARY Le rejected, retrying");
        apdu[4] = correct_le;
        response = transceive(tag, &apdu)?;
    }

    if !response.status.is_success() {
        return Err(Error::status(0xB0, response.status));
    }
    Ok(response.data)
}

/// Writes data to the selected file in 255-byte UPDATE BINARY chunks.
pub fn update_binary(tag: &mut dyn Transceiver, data: &[u8]) -> Result<(), Error> {
    let mut offset = 0usize;
    while offset < data.len() {
        let chunk = (data.len() - offset).min(0xFF);
        let mut apdu = Vec::with_capacity(5 + chunk);
        apdu.extend([0x00, 0xD6, (offset >> 8) as u8, (offset & 0xFF) as u8, chunk as u8]);
        apdu.extend(&data[offset..offset + chunk]);
        transceive_ok(tag, 0xD6, &apdu)?;
        offset += chunk;
    }
    Ok(())
}


/// The decoded Capability Container of the NDEF application.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct CapabilityContainer {
    pub cc_len: u16,
    pub mapping_version: u8,
    pub max_le: u16,
    pub max_lc: u16,
    pub ndef_file_id: u16,
    pub ndef_max_size: u16,
    pub ndef_read_access: u8,
    pub ndef_write_access: u8,
}
impl CapabilityContainer {
    /// Decodes the CC file contents.
    ///
    /// The NDEF file-control TLV (tag `0x04`) is required; trailing TLVs are
    /// ignored.
    pub fn parse(data: &[u8]) -> Result<Self, NdefError> {
        if data.len() < 15 {
            return Err(NdefError::Structure("CC file too short"));
        }
        if data[7] != 0x04 || data[8] < 6 {
            return Err(NdefError::Structure("CC has no NDEF file-control TLV"));
        }
        Ok(Self {
            cc_len: u16::from_be_bytes([data[0], data[1]]),
            mapping_version: data[2],
            max_le: u16::from_be_bytes([data[3], data[4]]),
            max_lc: u16::from_be_bytes([data[5], data[6]]),
            ndef_file_id: u16::from_be_bytes([data[9], data[10]]),
            ndef_max_size: u16::from_be_bytes([data[11], data[12]]),
            ndef_read_access: data[13],
            ndef_write_access: data[14],
        })
    }
}

/// Selects the NDEF application and reads the raw Capability Container file.
pub fn read_cc(tag: &mut dyn Transceiver) -> Result<Vec<u8>, Error> {
    select_ndef_application(tag)?;
    select_file(tag, FILE_ID_CC)?;
    read_binary(tag, 0x0000, 0x20)
}


#[cfg(test)]
mod tests {
    use super::CapabilityContainer;

    #[test]
    fn test_cc_parse() {
        // the factory CC of an NTAG 424 DNA
        let data = [
            0x00, 0x17, 0x20, 0x01, 0x00, 0x00, 0xFF,
            0x04, 0x06, 0xE1, 0x04, 0x01, 0x00, 0x00, 0x00,
            0x05, 0x06, 0xE1, 0x05, 0x00, 0x80, 0x82, 0x83,
        ];
        let cc = CapabilityContainer::parse(&data).unwrap();
        assert_eq!(cc.cc_len, 0x0017);
        assert_eq!(cc.mapping_version, 0x20);
        assert_eq!(cc.max_le, 0x0100);
        assert_eq!(cc.max_lc, 0x00FF);
        assert_eq!(cc.ndef_file_id, 0xE104);
        assert_eq!(cc.ndef_max_size, 0x0100);
        assert_eq!(cc.ndef_read_access, 0x00);
        assert_eq!(cc.ndef_write_access, 0x00);
    }

    #[test]
    fn test_cc_parse_rejects_short_or_tagless() {
        assert!(CapabilityContainer::parse(&[0x00; 10]).is_err());
        let mut data = [0u8; 15];
        data[7] = 0x05;
        assert!(CapabilityContainer::parse(&data).is_err());
    }
}
