//! EV2First mutual authentication.

use std::fmt;

use rand::RngCore;
use rand::rngs::OsRng;
use tracing::{debug, instrument, warn};
use zeroize::Zeroizing;

use crate::crypt::{self, CryptoError};
use crate::error::Error;
use crate::iso7816::apdu::{SW_DESFIRE_OK, SW_MORE_DATA, StatusWord};
use crate::iso7816::card::{Transceiver, transceive};
use crate::secure_messaging::Session;


/// A failed EV2First handshake, attributed to one of its two phases.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct AuthError {
    /// 1 for the initial challenge request, 2 for the response exchange.
    pub phase: u8,
    /// The status word the tag answered with, if it answered at all.
    pub sw: Option<StatusWord>,
    /// The length of the response body.
    pub response_len: usize,
}
impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sw {
            Some(sw) => write!(f, "EV2First phase {} failed with status {} (response length {})", self.phase, sw, self.response_len),
            None => write!(f, "EV2First phase {} failed (response length {})", self.phase, self.response_len),
        }
    }
}
impl std::error::Error for AuthError {
}


fn session_vector(label: [u8; 2], rnd_a: &[u8; 16], rnd_b: &[u8; 16]) -> Zeroizing<[u8; 32]> {
    let mut sv = Zeroizing::new([0u8; 32]);
    sv[0..2].copy_from_slice(&label);
    sv[2..6].copy_from_slice(&[0x00, 0x01, 0x00, 0x80]);
    sv[6..8].copy_from_slice(&rnd_a[0..2]);
    for i in 0..6 {
        sv[8+i] = rnd_a[2+i] ^ rnd_b[i];
    }
    sv[14..24].copy_from_slice(&rnd_b[6..16]);
    sv[24..32].copy_from_slice(&rnd_a[8..16]);
    sv
}

/// Derives the session keys (Kenc, Kmac) from the application key and the
/// two handshake nonces.
///
/// Kenc is the CMAC of SV1 (label `A5 5A`), Kmac the CMAC of SV2 (label
/// `5A A5`); the rest of each seed vector interleaves RndA and RndB as the
/// tag does.
pub fn derive_session_keys(key: &[u8; 16], rnd_a: &[u8; 16], rnd_b: &[u8; 16]) -> ([u8; 16], [u8; 16]) {
    let sv1 = session_vector([0xA5, 0x5A], rnd_a, rnd_b);
    let sv2 = session_vector([0x5A, 0xA5], rnd_a, rnd_b);
    (crypt::aes_cmac(key, &sv1[..]), crypt::aes_cmac(key, &sv2[..]))
}

/// Performs the EV2First handshake against the given key slot.
///
/// On success the returned [`Session`] holds the derived Kenc/Kmac, the
/// transaction identifier chosen by the tag, and a command counter of zero.
pub fn authenticate_ev2_first(
    tag: &mut dyn Transceiver,
    key: &[u8; 16],
    slot: u8,
) -> Result<Session, Error> {
    let mut rnd_a = [0u8; 16];
    OsRng.fill_bytes(&mut rnd_a);
    authenticate_ev2_first_with(tag, key, slot, rnd_a)
}

/// The handshake with a caller-supplied RndA.
///
/// Deterministic RndA makes the whole handshake reproducible; production
/// callers go through [`authenticate_ev2_first`] instead.
#[instrument(skip(tag, key, rnd_a))]
pub fn authenticate_ev2_first_with(
    tag: &mut dyn Transceiver,
    key: &[u8; 16],
    slot: u8,
    rnd_a: [u8; 16],
) -> Result<Session, Error> {
    if slot > 0x0F {
        return Err(Error::OutOfRange { what: "key slot", value: slot.into() });
    }
    let zero_iv = [0u8; 16];

    // phase 1: request the encrypted RndB for the slot
    let apdu1 = [0x90, 0x71, 0x00, 0x00, 0x02, slot, 0x00, 0x00];
    let resp1 = transceive(tag, &apdu1)?;
    if resp1.status.to_word() != SW_MORE_DATA || resp1.data.len() != 16 {
        return Err(AuthError {
            phase: 1,
            sw: Some(resp1.status),
            response_len: resp1.data.len(),
        }.into());
    }
    let rnd_b_buf = Zeroizing::new(crypt::aes_cbc_decrypt(key, &zero_iv, &resp1.data)?);
    let mut rnd_b = Zeroizing::new([0u8; 16]);
    rnd_b.copy_from_slice(&rnd_b_buf);

    // phase 2: prove knowledge of RndB, receive TI and rotated RndA
    let rnd_b_rot = Zeroizing::new(crypt::rotate_left_1(&rnd_b));
    let mut plaintext = Zeroizing::new([0u8; 32]);
    plaintext[..16].copy_from_slice(&rnd_a);
    plaintext[16..].copy_from_slice(&rnd_b_rot[..]);
    let payload = crypt::aes_cbc_encrypt(key, &zero_iv, &plaintext[..])?;

    let mut apdu2 = Vec::with_capacity(6 + payload.len());
    apdu2.extend([0x90, 0xAF, 0x00, 0x00, 0x20]);
    apdu2.extend(&payload);
    apdu2.push(0x00);
    let resp2 = transceive(tag, &apdu2)?;
    if resp2.status.to_word() != SW_DESFIRE_OK || resp2.data.len() != 32 {
        return Err(AuthError {
            phase: 2,
            sw: Some(resp2.status),
            response_len: resp2.data.len(),
        }.into());
    }

    let decrypted = Zeroizing::new(crypt::aes_cbc_decrypt(key, &zero_iv, &resp2.data)?);
    let mut ti = [0u8; 4];
    ti.copy_from_slice(&decrypted[0..4]);
    let mut rnd_a_rot = [0u8; 16];
    rnd_a_rot.copy_from_slice(&decrypted[4..20]);
    if crypt::rotate_right_1(&rnd_a_rot) != rnd_a {
        // the tag holds a different key for this slot
        return Err(CryptoError::RndMismatch.into());
    }

    let (kenc, kmac) = derive_session_keys(key, &rnd_a, &rnd_b);
    debug!(slot, "EV2First session established");
    Ok(Session::new(kenc, kmac, ti))
}

/// Authenticates with a fixed ladder of (key, slot) combinations.
///
/// Tries, in order: the given key on `preferred_slot`, on `alt_slot` (if
/// different), on slot 0 (if neither slot is 0), and finally the all-zero
/// factory key on slot 0. Returns the first established session together
/// with the key and slot that worked, or the error of the last attempt.
#[instrument(skip(tag, key))]
pub fn authenticate_with_fallback(
    tag: &mut dyn Transceiver,
    key: &[u8; 16],
    preferred_slot: u8,
    alt_slot: u8,
) -> Result<(Session, [u8; 16], u8), Error> {
    let zero_key = [0u8; 16];

    let mut attempts: Vec<([u8; 16], u8, &'static str)> = Vec::with_capacity(4);
    attempts.push((*key, preferred_slot, "provided key, preferred slot"));
    if alt_slot != preferred_slot {
        attempts.push((*key, alt_slot, "provided key, alternate slot"));
    }
    if preferred_slot != 0 && alt_slot != 0 {
        attempts.push((*key, 0, "provided key, slot 0"));
    }
    if key != &zero_key {
        attempts.push((zero_key, 0, "all-zero key, slot 0"));
    }

    let mut last_error = None;
    for (i, (attempt_key, slot, method)) in attempts.into_iter().enumerate() {
        match authenticate_ev2_first(tag, &attempt_key, slot) {
            Ok(session) => {
                debug!(method, "authenticated");
                return Ok((session, attempt_key, slot));
            },
            Err(e) => {
                if i > 0 {
                    warn!(method, error = %e, "authentication attempt failed");
                }
                last_error = Some(e);
            },
        }
    }
    // the ladder always contains at least the first attempt
    Err(last_error.unwrap())
}
