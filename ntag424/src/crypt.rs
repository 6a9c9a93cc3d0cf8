//! Cryptographic primitives shared by authentication and secure messaging.

use std::fmt;

use aes::Aes128;
use block_padding::{Iso7816, RawPadding};
use cipher::{BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit};
use cipher::block_padding::NoPadding;
use cipher::generic_array::GenericArray;
use cmac::{Cmac, Mac};


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum CryptoError {
    /// CBC input whose length is not a multiple of the AES block size.
    Misaligned { length: usize },
    /// ISO 9797-1 method 2 padding is absent or malformed.
    Padding,
    /// A MAC received from the tag does not match the locally computed one.
    MacMismatch,
    /// The rotated RndA returned by the tag does not match the one we sent.
    RndMismatch,
}
impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Misaligned { length }
                => write!(f, "data length {} is not a multiple of the AES block size", length),
            Self::Padding
                => write!(f, "invalid ISO 9797-1 method 2 padding"),
            Self::MacMismatch
                => write!(f, "response MAC mismatch"),
            Self::RndMismatch
                => write!(f, "RndA returned by the tag does not match"),
        }
    }
}
impl std::error::Error for CryptoError {
}


/// Encrypts pre-padded data with AES-128 in CBC mode.
pub fn aes_cbc_encrypt(key: &[u8; 16], iv: &[u8; 16], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() % 16 != 0 {
        return Err(CryptoError::Misaligned { length: data.len() });
    }
    let mut buf = data.to_vec();
    cbc::Encryptor::<Aes128>::new(key.into(), iv.into())
        .encrypt_padded_mut::<NoPadding>(&mut buf, data.len())
        .map_err(|_| CryptoError::Misaligned { length: data.len() })?;
    Ok(buf)
}

/// Decrypts data with AES-128 in CBC mode.
///
/// Does not strip padding.
pub fn aes_cbc_decrypt(key: &[u8; 16], iv: &[u8; 16], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() % 16 != 0 {
        return Err(CryptoError::Misaligned { length: data.len() });
    }
    let mut buf = data.to_vec();
    cbc::Decryptor::<Aes128>::new(key.into(), iv.into())
        .decrypt_padded_mut::<NoPadding>(&mut buf)
        .map_err(|_| CryptoError::Misaligned { length: data.len() })?;
    Ok(buf)
}

/// Encrypts a single block with AES-128 in ECB mode.
///
/// Secure messaging derives its CBC initialization vectors this way; nothing
/// larger than one block is ever ECB-encrypted.
pub fn aes_ecb_encrypt_block(key: &[u8; 16], block: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(key.into());
    let mut buf = GenericArray::clone_from_slice(block);
    cipher.encrypt_block(&mut buf);
    buf.into()
}

/// Computes an AES-128 CMAC over the given message.
pub fn aes_cmac(key: &[u8; 16], message: &[u8]) -> [u8; 16] {
    let mut mac = <Cmac<Aes128> as KeyInit>::new(key.into());
    mac.update(message);
    mac.finalize().into_bytes().into()
}

/// Truncates a full 16-byte CMAC to the 8-byte form the tag transmits.
///
/// The tag keeps the bytes at the odd indices (1, 3, 5, ..., 15), in order.
pub fn truncate_mac(full: &[u8; 16]) -> [u8; 8] {
    let mut out = [0u8; 8];
    for (i, b) in out.iter_mut().enumerate() {
        *b = full[1 + 2 * i];
    }
    out
}

/// Pads a message according to ISO 9797-1 padding method 2.
///
/// A `0x80` marker followed by zero bytes up to the next multiple of 16.
/// Padding is always appended; a block-aligned message grows by a full block.
pub fn pad_iso9797_m2(data: &[u8]) -> Vec<u8> {
    let padded_len = (data.len() / 16 + 1) * 16;
    let mut buf = vec![0u8; padded_len];
    buf[..data.len()].copy_from_slice(data);
    Iso7816::raw_pad(&mut buf, data.len());
    buf
}

/// Strips ISO 9797-1 method 2 padding.
pub fn unpad_iso9797_m2(data: &[u8]) -> Result<&[u8], CryptoError> {
    let mut end = data.len();
    while end > 0 && data[end-1] == 0x00 {
        end -= 1;
    }
    if end == 0 || data[end-1] != 0x80 {
        return Err(CryptoError::Padding);
    }
    Ok(&data[..end-1])
}

/// Moves the first byte of a block to the end.
pub fn rotate_left_1(block: &[u8; 16]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..15].copy_from_slice(&block[1..]);
    out[15] = block[0];
    out
}

/// Moves the last byte of a block to the front.
pub fn rotate_right_1(block: &[u8; 16]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[0] = block[15];
    out[1..].copy_from_slice(&block[..15]);
    out
}

/// Encodes the low 24 bits of a value as 3 little-endian bytes.
pub fn u24_to_le(value: u32) -> [u8; 3] {
    [
        (value & 0xFF) as u8,
        ((value >> 8) & 0xFF) as u8,
        ((value >> 16) & 0xFF) as u8,
    ]
}

/// Decodes 3 little-endian bytes into a 24-bit value.
pub fn u24_from_le(bytes: [u8; 3]) -> u32 {
    u32::from(bytes[0])
    | (u32::from(bytes[1]) << 8)
    | (u32::from(bytes[2]) << 16)
}

/// Computes the DESFire CRC32 of the given data.
///
/// Reflected polynomial `0xEDB88320`, initial value `0xFFFFFFFF`, and
/// crucially *no* final XOR, which is where this differs from the usual
/// IEEE 802.3 convention.
pub fn crc32_desfire(data: &[u8]) -> u32 {
    const POLY: u32 = 0xEDB8_8320;
    let mut crc: u32 = 0xFFFF_FFFF;
    for &b in data {
        crc ^= u32::from(b);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ POLY;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}


#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_cmac_nist_vectors() {
        // NIST SP 800-38B appendix D.1
        let key = hex!("2b7e151628aed2a6abf7158809cf4f3c");
        assert_eq!(
            aes_cmac(&key, &[]),
            hex!("bb1d6929e95937287fa37d129b756746"),
        );
        assert_eq!(
            aes_cmac(&key, &hex!("6bc1bee22e409f96e93d7e117393172a")),
            hex!("070a16b46b4d4144f79bdd9dd04a287c"),
        );
    }

    #[test]
    fn test_cbc_round_trip() {
        let key = hex!("000102030405060708090a0b0c0d0e0f");
        let iv = hex!("101112131415161718191a1b1c1d1e1f");
        let plaintext = hex!("00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff");

        let ciphertext = aes_cbc_encrypt(&key, &iv, &plaintext).unwrap();
        assert_ne!(&ciphertext[..], &plaintext[..]);
        let decrypted = aes_cbc_decrypt(&key, &iv, &ciphertext).unwrap();
        assert_eq!(&decrypted[..], &plaintext[..]);
    }

    #[test]
    fn test_cbc_rejects_misaligned_input() {
        let key = [0u8; 16];
        let iv = [0u8; 16];
        assert_eq!(
            aes_cbc_encrypt(&key, &iv, &[0u8; 15]),
            Err(CryptoError::Misaligned { length: 15 }),
        );
        assert_eq!(
            aes_cbc_decrypt(&key, &iv, &[0u8; 17]),
            Err(CryptoError::Misaligned { length: 17 }),
        );
    }

    #[test]
    fn test_padding_round_trip() {
        for n in 0..=256 {
            let message: Vec<u8> = (0..n).map(|i| (i % 251) as u8).collect();
            let padded = pad_iso9797_m2(&message);
            assert_eq!(padded.len() % 16, 0);
            assert!(padded.len() > message.len());
            let unpadded = unpad_iso9797_m2(&padded).unwrap();
            assert_eq!(unpadded, &message[..]);
        }
    }

    #[test]
    fn test_padding_aligned_input_gains_full_block() {
        let message = [0xABu8; 32];
        let padded = pad_iso9797_m2(&message);
        assert_eq!(padded.len(), 48);
        assert_eq!(padded[32], 0x80);
        assert!(padded[33..].iter().all(|&b| b == 0x00));
    }

    #[test]
    fn test_unpad_rejects_garbage() {
        assert_eq!(unpad_iso9797_m2(&[0u8; 16]), Err(CryptoError::Padding));
        assert_eq!(unpad_iso9797_m2(&[]), Err(CryptoError::Padding));
        assert_eq!(unpad_iso9797_m2(&[0x42; 16][..15]), Err(CryptoError::Padding));
    }

    #[test]
    fn test_truncate_mac_takes_odd_bytes() {
        let full = hex!("000102030405060708090a0b0c0d0e0f");
        assert_eq!(truncate_mac(&full), hex!("01030507090b0d0f"));
    }

    #[test]
    fn test_rotation() {
        let block = hex!("000102030405060708090a0b0c0d0e0f");
        let left = rotate_left_1(&block);
        assert_eq!(left, hex!("0102030405060708090a0b0c0d0e0f00"));
        assert_eq!(rotate_right_1(&left), block);
    }

    #[test]
    fn test_u24_codec() {
        assert_eq!(u24_to_le(0x00002A), [0x2A, 0x00, 0x00]);
        assert_eq!(u24_to_le(0x123456), [0x56, 0x34, 0x12]);
        assert_eq!(u24_from_le([0x56, 0x34, 0x12]), 0x123456);
        for v in [0u32, 1, 0x80, 0xFFFF, 0xFFFFFF] {
            assert_eq!(u24_from_le(u24_to_le(v)), v);
        }
    }

    #[test]
    fn test_crc32_desfire() {
        // the reflected IEEE polynomial without the final XOR
        assert_eq!(crc32_desfire(b"123456789"), !0xCBF4_3926u32);
        assert_eq!(crc32_desfire(&[]), 0xFFFF_FFFF);
    }
}
