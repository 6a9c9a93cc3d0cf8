//! Diagnostics: key-slot probing, PICC inventory commands, and pure
//! formatters for decoded structures.

use crate::auth;
use crate::error::Error;
use crate::iso7816::card::{Transceiver, transceive_ok};
use crate::iso7816::file::CapabilityContainer;
use crate::settings::FileSettings;
use crate::version::TagVersion;


/// The outcome of one EV2First attempt during a slot sweep.
#[derive(Debug)]
pub struct SlotProbe {
    pub slot: u8,
    pub result: Result<(), Error>,
}
impl SlotProbe {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }
}

/// Attempts EV2First once per slot with the given key.
///
/// The application is *not* re-selected between attempts; select it once
/// before calling. Each failure keeps its full structural context (phase,
/// status word, response length) for display.
pub fn diagnose_auth_slots(
    tag: &mut dyn Transceiver,
    key: &[u8; 16],
    slots: &[u8],
) -> Vec<SlotProbe> {
    slots.iter()
        .map(|&slot| SlotProbe {
            slot,
            result: auth::authenticate_ev2_first(tag, key, slot).map(|_| ()),
        })
        .collect()
}


/// Reads the application's key-settings byte and key count (plain
/// GetKeySettings).
pub fn get_key_settings(tag: &mut dyn Transceiver) -> Result<(u8, u8), Error> {
    let data = transceive_ok(tag, 0x45, &[0x90, 0x45, 0x00, 0x00, 0x00])?;
    if data.len() < 2 {
        return Err(Error::Parse("key settings response too short"));
    }
    Ok((data[0], data[1]))
}

/// Lists the file numbers of the selected application (plain GetFileIDs).
pub fn get_file_ids(tag: &mut dyn Transceiver) -> Result<Vec<u8>, Error> {
    transceive_ok(tag, 0x6F, &[0x90, 0x6F, 0x00, 0x00, 0x00])
}

/// Lists the 3-byte application identifiers on the PICC (plain
/// GetApplicationIDs).
pub fn get_application_ids(tag: &mut dyn Transceiver) -> Result<Vec<[u8; 3]>, Error> {
    let data = transceive_ok(tag, 0x6A, &[0x90, 0x6A, 0x00, 0x00, 0x00])?;
    if data.len() % 3 != 0 {
        return Err(Error::Parse("application ID list length not a multiple of 3"));
    }
    Ok(
        data.chunks_exact(3)
            .map(|chunk| [chunk[0], chunk[1], chunk[2]])
            .collect()
    )
}


/// Renders a file-settings snapshot as indented text.
pub fn format_file_settings(file_no: u8, settings: &FileSettings) -> String {
    let (ar1, ar2) = settings.access.to_bytes();
    let mut out = String::new();
    out.push_str(&format!("file {} access rights [raw {:02X} {:02X}]\n", file_no, ar1, ar2));
    out.push_str(&format!("  read:            {}\n", settings.access.read));
    out.push_str(&format!("  write:           {}\n", settings.access.write));
    out.push_str(&format!("  read+write:      {}\n", settings.access.read_write));
    out.push_str(&format!("  change settings: {}\n", settings.access.change));

    match &settings.sdm {
        Some(sdm) => {
            out.push_str(&format!("SDM: enabled, options 0x{:02X}\n", sdm.options));
            out.push_str(&format!("  MAC generation:  {}\n", sdm.access.file));
            out.push_str(&format!("  counter read:    {}\n", sdm.access.ctr));
            out.push_str(&format!("  meta read:       {}\n", sdm.access.meta));
            for (label, value) in [
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
                    out.push_str(&format!("  {}: {}\n", label, value));
                }
            }
        },
        None => out.push_str("SDM: disabled\n"),
    }
    out
}

/// Renders a GetVersion result as indented text.
pub fn format_version(version: &TagVersion) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "hardware: vendor 0x{:02X}, type 0x{:02X}.{:02X}, version {}.{}, storage 0x{:02X}, protocol 0x{:02X}\n",
        version.hw_vendor_id, version.hw_type, version.hw_subtype,
        version.hw_major_version, version.hw_minor_version,
        version.hw_storage_size, version.hw_protocol,
    ));
    out.push_str(&format!(
        "software: vendor 0x{:02X}, type 0x{:02X}.{:02X}, version {}.{}, storage 0x{:02X}, protocol 0x{:02X}\n",
        version.sw_vendor_id, version.sw_type, version.sw_subtype,
        version.sw_major_version, version.sw_minor_version,
        version.sw_storage_size, version.sw_protocol,
    ));
    out.push_str(&format!("uid: {}\n", hex::encode_upper(version.uid)));
    out.push_str(&format!("batch: {}\n", hex::encode_upper(version.batch_number)));
    out.push_str(&format!(
        "fabrication key 0x{:02X}, production year digit {:X}, week {}\n",
        version.fab_key, version.production_year, version.production_week,
    ));
    out
}

/// Renders a Capability Container as indented text.
pub fn format_capability_container(cc: &CapabilityContainer) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "CC: length {}, mapping version {}.{}, MLe {}, MLc {}\n",
        cc.cc_len, cc.mapping_version >> 4, cc.mapping_version & 0x0F, cc.max_le, cc.max_lc,
    ));
    out.push_str(&format!(
        "NDEF file: id 0x{:04X}, max size {}, read access 0x{:02X}, write access 0x{:02X}\n",
        cc.ndef_file_id, cc.ndef_max_size, cc.ndef_read_access, cc.ndef_write_access,
    ));
    out
}
