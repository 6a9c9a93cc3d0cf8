//! File data transfer: DESFire ReadData/WriteData and NDEF file access.

use tracing::instrument;

use crate::crypt::u24_to_le;
use crate::error::Error;
use crate::iso7816::card::{Transceiver, transceive_ok};
use crate::iso7816::file::{self, CapabilityContainer, FILE_ID_CC, FILE_ID_NDEF};
use crate::secure_messaging::{self, Session};
use crate::settings::check_file_number;


// plain WriteData: Lc = 7 + chunk must fit a byte
const PLAIN_WRITE_CHUNK: usize = 248;
// secure WriteData: pad(7 + chunk) + MAC must fit, in whole blocks
const SECURE_WRITE_CHUNK: usize = 224;

fn check_extent(offset: u32, length: u32) -> Result<(), Error> {
    if offset > 0xFF_FFFF {
        return Err(Error::OutOfRange { what: "file offset", value: offset });
    }
    if length > 0xFF_FFFF {
        return Err(Error::OutOfRange { what: "read length", value: length });
    }
    Ok(())
}

/// Reads file data with the plain ReadData command.
///
/// Only permitted when the file's Read (or ReadWrite) access is free.
pub fn read_data_plain(
    tag: &mut dyn Transceiver,
    file_no: u8,
    offset: u32,
    length: u32,
) -> Result<Vec<u8>, Error> {
    check_file_number(file_no)?;
    check_extent(offset, length)?;

    let mut apdu = Vec::with_capacity(13);
    apdu.extend([0x90, 0xBD, 0x00, 0x00, 0x07, file_no]);
    apdu.extend(u24_to_le(offset));
    apdu.extend(u24_to_le(length));
    apdu.push(0x00);
    transceive_ok(tag, 0xBD, &apdu)
}

/// Reads file data through the authenticated channel.
///
/// A boundary error (`911C`, the requested extent lies past the end of the
/// file) is answered with an empty payload rather than a failure.
#[instrument(skip(tag, session))]
pub fn read_data(
    tag: &mut dyn Transceiver,
    session: &mut Session,
    file_no: u8,
    offset: u32,
    length: u32,
) -> Result<Vec<u8>, Error> {
    check_file_number(file_no)?;
    check_extent(offset, length)?;

    let mut command = Vec::with_capacity(7);
    command.push(file_no);
    command.extend(u24_to_le(offset));
    command.extend(u24_to_le(length));

    match secure_messaging::execute(tag, session, 0xBD, &[], &command) {
        Ok(data) => Ok(data),
        Err(e) if e.is_boundary_error() => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

/// Writes file data with the plain WriteData command, chunked to fit the
/// single-byte Lc.
///
/// Only permitted when the file's Write (or ReadWrite) access is free.
pub fn write_data_plain(
    tag: &mut dyn Transceiver,
    file_no: u8,
    offset: u32,
    data: &[u8],
) -> Result<(), Error> {
    check_file_number(file_no)?;
    check_extent(offset, data.len() as u32)?;

    let mut written = 0usize;
    while written < data.len() {
        let chunk = (data.len() - written).min(PLAIN_WRITE_CHUNK);
        let mut apdu = Vec::with_capacity(13 + chunk);
        apdu.extend([0x90, 0x3D, 0x00, 0x00, (7 + chunk) as u8, file_no]);
        apdu.extend(u24_to_le(offset + written as u32));
        apdu.extend(u24_to_le(chunk as u32));
        apdu.extend(&data[written..written + chunk]);
        apdu.push(0x00);
        transceive_ok(tag, 0x3D, &apdu)?;
        written += chunk;
    }
    Ok(())
}

/// Writes file data through the authenticated channel, chunked so the
/// encrypted payload and MAC fit each APDU.
#[instrument(skip(tag, session, data))]
pub fn write_data(
    tag: &mut dyn Transceiver,
    session: &mut Session,
    file_no: u8,
    offset: u32,
    data: &[u8],
) -> Result<(), Error> {
    check_file_number(file_no)?;
    check_extent(offset, data.len() as u32)?;

    let mut written = 0usize;
    while written < data.len() {
        let chunk = (data.len() - written).min(SECURE_WRITE_CHUNK);
        let mut command = Vec::with_capacity(7 + chunk);
        command.push(file_no);
        command.extend(u24_to_le(offset + written as u32));
        command.extend(u24_to_le(chunk as u32));
        command.extend(&data[written..written + chunk]);
        secure_messaging::execute(tag, session, 0x3D, &[], &command)?;
        written += chunk;
    }
    Ok(())
}


/// Reads the complete NDEF message from the NDEF file.
///
/// Selects the NDEF application, locates the NDEF file through the
/// Capability Container (defaulting to `0xE104` when the CC does not
/// decode), reads the big-endian NLEN header and streams the message in
/// READ BINARY chunks. The returned bytes do not include the NLEN header.
#[instrument(skip(tag))]
pub fn read_ndef(tag: &mut dyn Transceiver) -> Result<Vec<u8>, Error> {
    file::select_ndef_application(tag)?;

    file::select_file(tag, FILE_ID_CC)?;
    let cc = file::read_binary(tag, 0x0000, 0x0F)?;
    let ndef_file_id = match CapabilityContainer::parse(&cc) {
        Ok(cc) => cc.ndef_file_id,
        Err(_) => FILE_ID_NDEF,
    };

    file::select_file(tag, ndef_file_id)?;
    let nlen_bytes = file::read_binary(tag, 0x0000, 0x02)?;
    if nlen_bytes.len() < 2 {
        return Err(Error::Parse("NLEN read too short"));
    }
    let nlen = usize::from(u16::from_be_bytes([nlen_bytes[0], nlen_bytes[1]]));
    if nlen == 0 {
        return Ok(Vec::new());
    }

    let mut ndef = Vec::with_capacity(nlen);
    let mut offset = 2usize;
    let mut remaining = nlen;
    while remaining > 0 {
        let chunk = remaining.min(0xFF);
        let part = file::read_binary(tag, offset as u16, chunk as u8)?;
        if part.is_empty() {
            break;
        }
        remaining = remaining.saturating_sub(part.len());
        offset += part.len();
        ndef.extend(part);
    }
    Ok(ndef)
}

/// Writes a complete NDEF file (NLEN header included) without
/// authentication.
///
/// Permitted only when the NDEF file's Write access is free. Selecting the
/// application tears down any active session, so use this on unprovisioned
/// tags or after finishing authenticated work.
pub fn write_ndef_plain(tag: &mut dyn Transceiver, ndef: &[u8]) -> Result<(), Error> {
    file::select_ndef_application(tag)?;
    file::select_file(tag, FILE_ID_NDEF)?;
    file::update_binary(tag, ndef)
}

/// Writes a complete NDEF file while a session is held.
///
/// Skips the application SELECT to avoid tearing the session down on the
/// host side; the file SELECT it still has to issue invalidates the session
/// on most tag firmware anyway. Prefer [`write_ndef_plain`] with free write
/// access whenever the configuration allows it.
pub fn write_ndef_with_auth(tag: &mut dyn Transceiver, ndef: &[u8]) -> Result<(), Error> {
    file::select_file(tag, FILE_ID_NDEF)?;
    file::update_binary(tag, ndef)
}
