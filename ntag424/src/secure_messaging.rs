//! The authenticated secure-messaging layer.
//!
//! Every authenticated command is wrapped the same way: the payload is
//! padded and CBC-encrypted under a counter-derived IV, an 8-byte truncated
//! CMAC binds instruction, counter, transaction identifier, cleartext header
//! and ciphertext, and the response MAC is verified over the body exactly as
//! received before anything is decrypted.

use std::fmt;

use subtle::ConstantTimeEq;
use tracing::instrument;
use zeroize::Zeroizing;
use zeroize_derive::ZeroizeOnDrop;

use crate::crypt::{self, CryptoError};
use crate::error::Error;
use crate::iso7816::apdu::SW_DESFIRE_OK;
use crate::iso7816::card::{Transceiver, transceive};


/// The state established by a successful EV2First handshake.
///
/// A session is single-use-at-a-time: one outstanding command, commands in
/// counter order. It is invalidated by any SELECT on the tag, by a same-slot
/// ChangeKey, or by a response whose MAC does not verify; an invalidated
/// session deterministically refuses further secure commands without
/// touching the transport.
#[derive(ZeroizeOnDrop)]
pub struct Session {
    kenc: [u8; 16],
    kmac: [u8; 16],
    #[zeroize(skip)]
    ti: [u8; 4],
    #[zeroize(skip)]
    cmd_ctr: u16,
    #[zeroize(skip)]
    valid: bool,
}
impl Session {
    pub(crate) fn new(kenc: [u8; 16], kmac: [u8; 16], ti: [u8; 4]) -> Self {
        Self {
            kenc,
            kmac,
            ti,
            cmd_ctr: 0,
            valid: true,
        }
    }

    /// Reassembles a session from previously derived parts.
    ///
    /// This is the injection point for tests and for tooling that carries
    /// session state across process boundaries; normal callers obtain
    /// sessions from the EV2First handshake only.
    pub fn from_parts(kenc: [u8; 16], kmac: [u8; 16], ti: [u8; 4], cmd_ctr: u16) -> Self {
        Self {
            kenc,
            kmac,
            ti,
            cmd_ctr,
            valid: true,
        }
    }

    /// The transaction identifier the tag picked at EV2First.
    pub fn ti(&self) -> [u8; 4] {
        self.ti
    }

    /// The command counter; increments once per successful secure exchange.
    pub fn command_counter(&self) -> u16 {
        self.cmd_ctr
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Marks the session unusable. Further secure commands fail with
    /// [`Error::InvalidSession`].
    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    fn command_iv(&self) -> [u8; 16] {
        derive_iv(&self.kenc, [0xA5, 0x5A], &self.ti, self.cmd_ctr)
    }

    fn response_iv(&self) -> [u8; 16] {
        derive_iv(&self.kenc, [0x5A, 0xA5], &self.ti, self.cmd_ctr.wrapping_add(1))
    }
}
impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // key material stays out of Debug output
        write!(
            f,
            "Session {} ti: {:02X?}, cmd_ctr: 0x{:04X}, valid: {} {}",
            '{', self.ti, self.cmd_ctr, self.valid, '}',
        )
    }
}


/// Derives a secure-messaging IV: the AES-ECB encryption, under Kenc, of
/// `label || TI || counter_le || 00*8`.
///
/// The label is `A5 5A` on the command path and `5A A5` on the response
/// path; the response path uses the incremented counter.
pub fn derive_iv(kenc: &[u8; 16], label: [u8; 2], ti: &[u8; 4], counter: u16) -> [u8; 16] {
    let mut seed = [0u8; 16];
    seed[0..2].copy_from_slice(&label);
    seed[2..6].copy_from_slice(ti);
    seed[6..8].copy_from_slice(&counter.to_le_bytes());
    crypt::aes_ecb_encrypt_block(kenc, &seed)
}

fn command_mac_input(ins: u8, counter: u16, ti: &[u8; 4], header: &[u8], enc_data: &[u8]) -> Vec<u8> {
    let mut input = Vec::with_capacity(7 + header.len() + enc_data.len());
    input.push(ins);
    input.extend(counter.to_le_bytes());
    input.extend(ti);
    input.extend(header);
    input.extend(enc_data);
    input
}

fn response_mac_input(sw2: u8, counter: u16, ti: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let mut input = Vec::with_capacity(7 + body.len());
    input.push(sw2);
    input.extend(counter.to_le_bytes());
    input.extend(ti);
    input.extend(body);
    input
}

/// Builds the complete command APDU for an authenticated DESFire command.
///
/// `header` travels in cleartext after Lc (file numbers, key slots); `data`
/// is padded and encrypted. The session is not modified.
pub fn build_command(
    session: &Session,
    ins: u8,
    header: &[u8],
    data: &[u8],
) -> Result<Vec<u8>, Error> {
    if !session.valid {
        return Err(Error::InvalidSession);
    }

    let enc_data = if data.is_empty() {
        Vec::new()
    } else {
        let padded = Zeroizing::new(crypt::pad_iso9797_m2(data));
        crypt::aes_cbc_encrypt(&session.kenc, &session.command_iv(), &padded)?
    };

    let mac_input = command_mac_input(ins, session.cmd_ctr, &session.ti, header, &enc_data);
    let mac = crypt::truncate_mac(&crypt::aes_cmac(&session.kmac, &mac_input));

    let body_len = header.len() + enc_data.len() + mac.len();
    if body_len > 255 {
        return Err(Error::ApduTooLong { length: body_len });
    }

    let mut apdu = Vec::with_capacity(6 + body_len);
    apdu.extend([0x90, ins, 0x00, 0x00, body_len as u8]);
    apdu.extend(header);
    apdu.extend(&enc_data);
    apdu.extend(mac);
    apdu.push(0x00);
    Ok(apdu)
}

/// Runs one authenticated command round trip.
///
/// The response MAC is verified over the body exactly as received (any
/// leading status byte included); a mismatch invalidates the session. The
/// body is then interpreted by shape: a 16-byte-aligned remainder is
/// ciphertext to decrypt and unpad, a remainder of one status byte plus
/// aligned ciphertext is the same after stripping the `0x00`, and anything
/// else is a plain body returned as received (files whose CommMode is plain
/// answer this way even inside a session). The command counter increments
/// only on success.
#[instrument(skip(tag, session, header, data))]
pub fn execute(
    tag: &mut dyn Transceiver,
    session: &mut Session,
    ins: u8,
    header: &[u8],
    data: &[u8],
) -> Result<Vec<u8>, Error> {
    let apdu = build_command(session, ins, header, data)?;
    let response = transceive(tag, &apdu)?;
    if response.status.to_word() != SW_DESFIRE_OK {
        return Err(Error::status(ins, response.status));
    }
    if response.data.len() < 8 {
        return Err(Error::ShortResponse { length: response.data.len() });
    }

    let (body, received_mac) = response.data.split_at(response.data.len() - 8);
    let next_counter = session.cmd_ctr.wrapping_add(1);

    let mac_input = response_mac_input(response.status.sw2, next_counter, &session.ti, body);
    let expected_mac = crypt::truncate_mac(&crypt::aes_cmac(&session.kmac, &mac_input));
    if !bool::from(expected_mac[..].ct_eq(received_mac)) {
        session.invalidate();
        return Err(CryptoError::MacMismatch.into());
    }

    let payload = if body.is_empty() {
        Vec::new()
    } else if body.len() % 16 == 0 {
        decrypt_response_body(session, body)?
    } else if body.len() % 16 == 1 && body[0] == 0x00 {
        decrypt_response_body(session, &body[1..])?
    } else {
        // plain shape; the first byte is data, not a status
        body.to_vec()
    };

    session.cmd_ctr = next_counter;
    Ok(payload)
}

fn decrypt_response_body(session: &Session, ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
    let decrypted = Zeroizing::new(
        crypt::aes_cbc_decrypt(&session.kenc, &session.response_iv(), ciphertext)?
    );
    let unpadded = crypt::unpad_iso9797_m2(&decrypted)?;
    Ok(unpadded.to_vec())
}

/// Runs an authenticated command whose response carries no MAC, only a
/// status word.
///
/// The same-slot ChangeKey forms answer this way. Because the exchange
/// cannot be verified and the keys it touches are the session's own, the
/// session is invalidated on success and the command counter is left alone.
pub fn execute_status_only(
    tag: &mut dyn Transceiver,
    session: &mut Session,
    ins: u8,
    header: &[u8],
    data: &[u8],
) -> Result<(), Error> {
    let apdu = build_command(session, ins, header, data)?;
    let response = transceive(tag, &apdu)?;
    if response.status.to_word() != SW_DESFIRE_OK {
        return Err(Error::status(ins, response.status));
    }
    session.invalidate();
    Ok(())
}
