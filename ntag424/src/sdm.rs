//! Secure Dynamic Messaging: the NDEF URI template the tag mirrors into,
//! the per-tap session key, and MAC generation and verification.

use subtle::ConstantTimeEq;
use url::Url;

use crate::crypt;
use crate::error::{Error, NdefError};


const UID_PLACEHOLDER_LEN: usize = 14;
const CTR_PLACEHOLDER_LEN: usize = 6;
const MAC_PLACEHOLDER_LEN: usize = 16;

/// NFC Forum URI record prefix codes, most specific first.
const URI_PREFIXES: [(&str, u8); 4] = [
    ("https://www.", 0x02),
    ("http://www.", 0x01),
    ("https://", 0x04),
    ("http://", 0x03),
];


/// A laid-out NDEF message with SDM placeholders, and the offsets the tag
/// needs to mirror the dynamic fields into it.
///
/// All offsets are measured from the start of the NDEF file contents, NLEN
/// header included, because that is the coordinate system
/// ChangeFileSettings expects.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SdmTemplate {
    /// The fully-formed URL with zero-filled placeholders.
    pub url: String,
    /// The complete NDEF file contents, starting with the 2-byte big-endian
    /// NLEN.
    pub ndef: Vec<u8>,
    /// First placeholder character after `uid=`.
    pub uid_offset: u32,
    /// First placeholder character after `ctr=`.
    pub ctr_offset: u32,
    /// The `u` of `uid=`; MACing starts here.
    pub mac_input_offset: u32,
    /// First placeholder character after `mac=`.
    pub mac_offset: u32,
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

/// Builds the SDM NDEF template for a base URL.
///
/// The query is rebuilt so that `uid`, `ctr` and `mac` come first, in that
/// order, zero-filled to their mirror widths; other parameters survive in
/// their original order and any fragment is dropped. The query string is
/// assembled by hand because a map-based encoder would alphabetise it, and
/// the tag mirrors into fixed byte positions.
pub fn build_template(base_url: &str) -> Result<SdmTemplate, Error> {
    let mut parsed = Url::parse(base_url)
        .map_err(|_| NdefError::BadUrl)?;
    if parsed.host_str().is_none() {
        return Err(NdefError::NotAbsolute.into());
    }
    parsed.set_fragment(None);

    let passthrough: Vec<(String, String)> = parsed.query_pairs()
        .filter(|(key, _)| key != "uid" && key != "ctr" && key != "mac")
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    serializer.append_pair("uid", &"0".repeat(UID_PLACEHOLDER_LEN));
    serializer.append_pair("ctr", &"0".repeat(CTR_PLACEHOLDER_LEN));
    serializer.append_pair("mac", &"0".repeat(MAC_PLACEHOLDER_LEN));
    for (key, value) in &passthrough {
        serializer.append_pair(key, value);
    }
    parsed.set_query(Some(&serializer.finish()));

    let full_url = parsed.to_string();

    // NFC URI record prefix compression
    let mut prefix_code = 0x00;
    let mut uri = full_url.as_str();
    for (prefix, code) in URI_PREFIXES {
        if let Some(rest) = full_url.strip_prefix(prefix) {
            prefix_code = code;
            uri = rest;
            break;
        }
    }

    // NLEN(2) || D1 01 PL 55 || prefix code || URI
    let payload_len = 1 + uri.len();
    if payload_len > 255 {
        return Err(NdefError::TooLong { length: payload_len }.into());
    }
    let record_len = 4 + payload_len;
    let total_len = 2 + record_len;
    if total_len > 256 {
        return Err(NdefError::TooLong { length: total_len }.into());
    }

    let mut ndef = Vec::with_capacity(total_len);
    ndef.extend((record_len as u16).to_be_bytes());
    ndef.push(0xD1); // MB, ME, SR, TNF = well-known
    ndef.push(0x01); // type length
    ndef.push(payload_len as u8);
    ndef.push(0x55); // type 'U'
    ndef.push(prefix_code);
    ndef.extend(uri.bytes());

    let uid_index = find(&ndef, b"uid=")
        .ok_or(NdefError::MissingParameter("uid"))?;
    let ctr_index = find(&ndef, b"ctr=")
        .ok_or(NdefError::MissingParameter("ctr"))?;
    let mac_index = find(&ndef, b"mac=")
        .ok_or(NdefError::MissingParameter("mac"))?;

    let uid_offset = uid_index + 4;
    let ctr_offset = ctr_index + 4;
    let mac_offset = mac_index + 4;
    if uid_offset + UID_PLACEHOLDER_LEN > ndef.len()
            || ctr_offset + CTR_PLACEHOLDER_LEN > ndef.len()
            || mac_offset + MAC_PLACEHOLDER_LEN > ndef.len() {
        return Err(NdefError::Structure("placeholder runs past the end of the NDEF message").into());
    }

    Ok(SdmTemplate {
        url: full_url,
        ndef,
        uid_offset: uid_offset as u32,
        ctr_offset: ctr_offset as u32,
        mac_input_offset: uid_index as u32,
        mac_offset: mac_offset as u32,
    })
}


/// Derives the per-tap SDM session key from the SDM file key, the tag UID
/// and the little-endian read counter.
///
/// `K_sdm = CMAC(K_file, 3C C3 00 01 00 80 || UID || Ctr_le)`.
pub fn derive_sdm_session_key(file_key: &[u8; 16], uid: &[u8; 7], ctr_le: [u8; 3]) -> [u8; 16] {
    let mut sv = [0u8; 16];
    sv[0..6].copy_from_slice(&[0x3C, 0xC3, 0x00, 0x01, 0x00, 0x80]);
    sv[6..13].copy_from_slice(uid);
    sv[13..16].copy_from_slice(&ctr_le);
    crypt::aes_cmac(file_key, &sv)
}

fn sdm_mac(file_key: &[u8; 16], uid: &[u8; 7], ctr_be: [u8; 3]) -> [u8; 8] {
    let ctr_le = [ctr_be[2], ctr_be[1], ctr_be[0]];
    let session_key = derive_sdm_session_key(file_key, uid, ctr_le);

    let mac_input = format!(
        "uid={}&ctr={}&mac=",
        hex::encode_upper(uid),
        hex::encode_upper(ctr_be),
    );
    crypt::truncate_mac(&crypt::aes_cmac(&session_key, mac_input.as_bytes()))
}

/// Computes the URL a tag with the given UID, counter and SDM file key
/// would present on a tap.
///
/// This is the emulation/server side of SDM: the inverse of
/// [`verify_sdm_url`].
pub fn generate_sdm_url(
    base_url: &str,
    uid: &[u8; 7],
    counter: u32,
    file_key: &[u8; 16],
) -> Result<String, Error> {
    if counter > 0xFF_FFFF {
        return Err(Error::OutOfRange { what: "SDM read counter", value: counter });
    }
    let mut parsed = Url::parse(base_url)
        .map_err(|_| NdefError::BadUrl)?;
    if parsed.host_str().is_none() {
        return Err(NdefError::NotAbsolute.into());
    }

    let ctr_be = [(counter >> 16) as u8, (counter >> 8) as u8, counter as u8];
    let mac_hex = hex::encode_upper(sdm_mac(file_key, uid, ctr_be));

    let passthrough: Vec<(String, String)> = parsed.query_pairs()
        .filter(|(key, _)| key != "uid" && key != "ctr" && key != "mac")
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    serializer.append_pair("uid", &hex::encode_upper(uid));
    serializer.append_pair("ctr", &hex::encode_upper(ctr_be));
    serializer.append_pair("mac", &mac_hex);
    for (key, value) in &passthrough {
        serializer.append_pair(key, value);
    }
    parsed.set_query(Some(&serializer.finish()));

    Ok(parsed.to_string())
}


/// The decoded outcome of checking one tapped URL.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SdmVerification {
    pub uid: [u8; 7],
    /// The read counter, decoded from its big-endian URL form.
    pub counter: u32,
    /// Whether the presented MAC matches the recomputed one.
    pub mac_valid: bool,
    /// The MAC this host computed, uppercase hex; useful when diagnosing a
    /// mismatch.
    pub computed_mac: String,
}

fn query_parameter(url: &Url, name: &'static str) -> Result<String, NdefError> {
    url.query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
        .ok_or(NdefError::MissingParameter(name))
}

/// Verifies the MAC of a tapped SDM URL against the SDM file key.
///
/// Parses `uid`, `ctr` and `mac` from the query, recomputes the MAC via the
/// per-tap session key, and reports the outcome together with the decoded
/// counter.
pub fn verify_sdm_url(tapped_url: &str, file_key: &[u8; 16]) -> Result<SdmVerification, Error> {
    let parsed = Url::parse(tapped_url)
        .map_err(|_| NdefError::BadUrl)?;

    let uid_hex = query_parameter(&parsed, "uid")?;
    let ctr_hex = query_parameter(&parsed, "ctr")?;
    let mac_hex = query_parameter(&parsed, "mac")?;
    if uid_hex.len() != UID_PLACEHOLDER_LEN {
        return Err(NdefError::BadParameter("uid").into());
    }
    if ctr_hex.len() != CTR_PLACEHOLDER_LEN {
        return Err(NdefError::BadParameter("ctr").into());
    }
    if mac_hex.len() != MAC_PLACEHOLDER_LEN {
        return Err(NdefError::BadParameter("mac").into());
    }

    let uid: [u8; 7] = hex::decode(&uid_hex)
        .map_err(|_| NdefError::BadParameter("uid"))?
        .try_into()
        .map_err(|_| NdefError::BadParameter("uid"))?;
    let ctr_be: [u8; 3] = hex::decode(&ctr_hex)
        .map_err(|_| NdefError::BadParameter("ctr"))?
        .try_into()
        .map_err(|_| NdefError::BadParameter("ctr"))?;
    let presented: [u8; 8] = hex::decode(&mac_hex)
        .map_err(|_| NdefError::BadParameter("mac"))?
        .try_into()
        .map_err(|_| NdefError::BadParameter("mac"))?;

    let computed = sdm_mac(file_key, &uid, ctr_be);

    Ok(SdmVerification {
        uid,
        counter: u32::from(ctr_be[0]) << 16 | u32::from(ctr_be[1]) << 8 | u32::from(ctr_be[2]),
        mac_valid: bool::from(computed[..].ct_eq(&presented[..])),
        computed_mac: hex::encode_upper(computed),
    })
}
