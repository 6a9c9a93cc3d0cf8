//! The transceiver boundary between the protocol engine and the reader.

use std::fmt;

use crate::error::Error;
use crate::iso7816::apdu::{Response, StatusWord};


/// An opaque failure inside the reader or its driver stack.
#[derive(Debug)]
pub struct TransportError(Box<dyn std::error::Error + Send + Sync + 'static>);
impl TransportError {
    pub fn new<E: std::error::Error + Send + Sync + 'static>(inner: E) -> Self {
        Self(Box::new(inner))
    }
}
impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport error: {}", self.0)
    }
}
impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.0.as_ref())
    }
}
impl From<pcsc::Error> for TransportError {
    fn from(value: pcsc::Error) -> Self { Self::new(value) }
}


/// A contactless channel that carries raw APDUs to a tag and back.
///
/// The driver never discovers readers, powers fields or polls for presence;
/// the host hands it something that can move bytes. Every call may block on
/// reader I/O.
pub trait Transceiver {
    /// Send a command APDU and return the full response including the
    /// trailing status word.
    fn transmit(&mut self, apdu: &[u8]) -> Result<Vec<u8>, TransportError>;
}
impl Transceiver for pcsc::Card {
    fn transmit(&mut self, apdu: &[u8]) -> Result<Vec<u8>, TransportError> {
        let mut receive_buffer = [0u8; pcsc::MAX_BUFFER_SIZE];
        let response = pcsc::Card::transmit(self, apdu, &mut receive_buffer)?;
        Ok(response.to_vec())
    }
}


/// Sends an APDU and splits the response into data and status word.
pub fn transceive(tag: &mut dyn Transceiver, apdu: &[u8]) -> Result<Response, Error> {
    let raw = tag.transmit(apdu)?;
    Response::from_slice(&raw)
        .ok_or(Error::ShortResponse { length: raw.len() })
}

/// Like [`transceive`], but fails unless the status word is `9000` or `9100`.
///
/// `ins` is only used to attribute the failure.
pub fn transceive_ok(tag: &mut dyn Transceiver, ins: u8, apdu: &[u8]) -> Result<Vec<u8>, Error> {
    let response = transceive(tag, apdu)?;
    if !response.status.is_success() {
        return Err(Error::status(ins, response.status));
    }
    Ok(response.data)
}

/// Retrieves the anticollision UID via the reader's GET DATA pass-through.
///
/// Tries Le=0 (wildcard) first, then Le=4.
pub fn get_uid(tag: &mut dyn Transceiver) -> Result<Vec<u8>, Error> {
    let mut last = StatusWord::default();
    for le in [0x00, 0x04] {
        let apdu = [0xFF, 0xCA, 0x00, 0x00, le];
        let response = transceive(tag, &apdu)?;
        if response.status.is_success() && !response.data.is_empty() {
            return Ok(response.data);
        }
        last = response.status;
    }
    Err(Error::status(0xCA, last))
}
