//! Key management: the DESFire ChangeKey command and its three payload
//! shapes.

use tracing::instrument;
use zeroize::Zeroizing;

use crate::crypt::crc32_desfire;
use crate::error::Error;
use crate::iso7816::card::Transceiver;
use crate::secure_messaging::{self, Session};


fn check_slot(what: &'static str, slot: u8) -> Result<(), Error> {
    if slot > 0x0F {
        return Err(Error::OutOfRange { what, value: slot.into() });
    }
    Ok(())
}

/// `XOR(new, old) || version || CRC32(new)`, 21 bytes.
fn cross_slot_payload(new_key: &[u8; 16], old_key: &[u8; 16], version: u8) -> Zeroizing<[u8; 21]> {
    let mut payload = Zeroizing::new([0u8; 21]);
    for i in 0..16 {
        payload[i] = new_key[i] ^ old_key[i];
    }
    payload[16] = version;
    payload[17..21].copy_from_slice(&crc32_desfire(new_key).to_le_bytes());
    payload
}

/// `XOR(new, old) || version || CRC32(new) || CRC32(old)`, 25 bytes.
fn same_slot_payload(new_key: &[u8; 16], old_key: &[u8; 16], version: u8) -> Zeroizing<[u8; 25]> {
    let mut payload = Zeroizing::new([0u8; 25]);
    for i in 0..16 {
        payload[i] = new_key[i] ^ old_key[i];
    }
    payload[16] = version;
    payload[17..21].copy_from_slice(&crc32_desfire(new_key).to_le_bytes());
    payload[21..25].copy_from_slice(&crc32_desfire(old_key).to_le_bytes());
    payload
}

/// Changes the key in `target_slot`.
///
/// When the target differs from the authenticated slot this is an ordinary
/// secure exchange and the session stays usable. When the target *is* the
/// authenticated slot, the tag answers with a bare status word and discards
/// the session state on its side; on success the local session is
/// invalidated to match and the command counter is not incremented.
#[instrument(skip(tag, session, new_key, old_key))]
pub fn change_key(
    tag: &mut dyn Transceiver,
    session: &mut Session,
    auth_slot: u8,
    target_slot: u8,
    new_key: &[u8; 16],
    old_key: &[u8; 16],
    version: u8,
) -> Result<(), Error> {
    check_slot("authenticated key slot", auth_slot)?;
    check_slot("target key slot", target_slot)?;

    if target_slot == auth_slot {
        let payload = same_slot_payload(new_key, old_key, version);
        secure_messaging::execute_status_only(tag, session, 0xC4, &[target_slot], &payload[..])
    } else {
        let payload = cross_slot_payload(new_key, old_key, version);
        secure_messaging::execute(tag, session, 0xC4, &[target_slot], &payload[..])?;
        Ok(())
    }
}

/// Overwrites the authenticated slot with `new_key` without proving
/// knowledge of the old key: `new || version`, no XOR, no CRCs.
///
/// Some tag states accept only this form when rewinding keys to zeros; its
/// acceptance across all silicon labelled "NTAG 424 DNA" is not guaranteed.
/// The response is status-only and the session is invalidated on success.
#[instrument(skip(tag, session, new_key))]
pub fn reset_key(
    tag: &mut dyn Transceiver,
    session: &mut Session,
    slot: u8,
    new_key: &[u8; 16],
    version: u8,
) -> Result<(), Error> {
    check_slot("key slot", slot)?;

    let mut payload = Zeroizing::new([0u8; 17]);
    payload[..16].copy_from_slice(new_key);
    payload[16] = version;
    secure_messaging::execute_status_only(tag, session, 0xC4, &[slot], &payload[..])
}


#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_cross_slot_payload_layout() {
        let new_key = hex!("0123456789ABCDEF0123456789ABCDEF");
        let old_key = [0u8; 16];
        let payload = cross_slot_payload(&new_key, &old_key, 0x01);
        assert_eq!(payload.len(), 21);
        assert_eq!(&payload[..16], &new_key);
        assert_eq!(payload[16], 0x01);
        assert_eq!(&payload[17..21], &crc32_desfire(&new_key).to_le_bytes());
    }

    #[test]
    fn test_same_slot_payload_layout() {
        let new_key = [0x42u8; 16];
        let old_key = [0x17u8; 16];
        let payload = same_slot_payload(&new_key, &old_key, 0x00);
        assert_eq!(payload.len(), 25);
        assert!(payload[..16].iter().all(|&b| b == 0x42 ^ 0x17));
        assert_eq!(payload[16], 0x00);
        assert_eq!(&payload[17..21], &crc32_desfire(&new_key).to_le_bytes());
        assert_eq!(&payload[21..25], &crc32_desfire(&old_key).to_le_bytes());
    }
}
