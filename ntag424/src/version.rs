//! The GetVersion command and its decoded result.

use tracing::instrument;

use crate::error::Error;
use crate::iso7816::apdu::{SW_DESFIRE_OK, SW_MORE_DATA};
use crate::iso7816::card::{Transceiver, transceive};


/// Hardware and software identification of a tag, as returned by GetVersion.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TagVersion {
    pub hw_vendor_id: u8,
    pub hw_type: u8,
    pub hw_subtype: u8,
    pub hw_major_version: u8,
    pub hw_minor_version: u8,
    pub hw_storage_size: u8,
    pub hw_protocol: u8,
    pub sw_vendor_id: u8,
    pub sw_type: u8,
    pub sw_subtype: u8,
    pub sw_major_version: u8,
    pub sw_minor_version: u8,
    pub sw_storage_size: u8,
    pub sw_protocol: u8,
    pub uid: [u8; 7],
    pub batch_number: [u8; 5],
    pub fab_key: u8,
    /// Production year, one BCD digit per nibble.
    pub production_year: u8,
    pub production_week: u8,
}

fn version_frame(
    tag: &mut dyn Transceiver,
    ins: u8,
    expected_sw: u16,
    expected_len: usize,
) -> Result<Vec<u8>, Error> {
    let apdu = [0x90, ins, 0x00, 0x00, 0x00];
    let response = transceive(tag, &apdu)?;
    if response.status.to_word() != expected_sw || response.data.len() != expected_len {
        return Err(Error::status(0x60, response.status));
    }
    Ok(response.data)
}

/// Retrieves the tag version via the three-frame DESFire GetVersion exchange.
///
/// The first two frames carry 7 bytes of hardware and software info each and
/// must answer `91AF`; the final frame carries 14 bytes (UID, batch,
/// fabrication key, production date) and must answer `9100`.
#[instrument(skip(tag))]
pub fn get_version(tag: &mut dyn Transceiver) -> Result<TagVersion, Error> {
    let hardware = version_frame(tag, 0x60, SW_MORE_DATA, 7)?;
    let software = version_frame(tag, 0xAF, SW_MORE_DATA, 7)?;
    let production = version_frame(tag, 0xAF, SW_DESFIRE_OK, 14)?;

    let mut uid = [0u8; 7];
    uid.copy_from_slice(&production[0..7]);
    let mut batch_number = [0u8; 5];
    batch_number.copy_from_slice(&production[7..12]);

    Ok(TagVersion {
        hw_vendor_id: hardware[0],
        hw_type: hardware[1],
        hw_subtype: hardware[2],
        hw_major_version: hardware[3],
        hw_minor_version: hardware[4],
        hw_storage_size: hardware[5],
        hw_protocol: hardware[6],
        sw_vendor_id: software[0],
        sw_type: software[1],
        sw_subtype: software[2],
        sw_major_version: software[3],
        sw_minor_version: software[4],
        sw_storage_size: software[5],
        sw_protocol: software[6],
        uid,
        batch_number,
        fab_key: production[12],
        production_year: production[13] >> 4,
        production_week: production[13] & 0x0F,
    })
}
