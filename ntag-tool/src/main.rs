use std::path::{Path, PathBuf};

use clap::Parser;
use ntag424::auth;
use ntag424::data;
use ntag424::diag;
use ntag424::error::Error;
use ntag424::iso7816::card::{self, Transceiver};
use ntag424::iso7816::file::{self, CapabilityContainer};
use ntag424::keys;
use ntag424::sdm;
use ntag424::secure_messaging::Session;
use ntag424::settings::{
    self, AccessCondition, AccessRights, FileSettings, SDM_OPT_READ_CTR, SDM_OPT_UID_MIRROR,
    SdmAccessRights, SdmSettings,
};
use ntag424::version;


#[derive(Clone, Debug, Eq, Hash, Ord, Parser, PartialEq, PartialOrd)]
enum Mode {
    /// List the available PC/SC readers.
    ListReaders,
    /// Dump UID, version, CC and file settings of the presented tag.
    Info(InfoOpts),
    /// Sweep the key slots with one key and report which ones authenticate.
    Diag(DiagOpts),
    /// Verify the MAC of a tapped SDM URL.
    VerifyUrl(VerifyUrlOpts),
    /// Build an SDM template for a URL, configure file 2 and write the NDEF.
    WriteUrl(WriteUrlOpts),
    /// Rewind a tag to factory state: zero keys, factory file settings,
    /// empty NDEF.
    Reset(ResetOpts),
}

#[derive(Clone, Debug, Default, Eq, Hash, Ord, Parser, PartialEq, PartialOrd)]
struct InfoOpts {
    #[arg(short, long = "reader", default_value = "0")]
    reader_index: usize,

    /// Application master key file (32 hex characters); factory zeros if
    /// absent.
    #[arg(short, long = "key")]
    key_path: Option<PathBuf>,
}

#[derive(Clone, Debug, Default, Eq, Hash, Ord, Parser, PartialEq, PartialOrd)]
struct DiagOpts {
    #[arg(short, long = "reader", default_value = "0")]
    reader_index: usize,

    #[arg(short, long = "key")]
    key_path: Option<PathBuf>,

    /// Highest slot to probe.
    #[arg(long, default_value = "4")]
    max_slot: u8,
}

#[derive(Clone, Debug, Default, Eq, Hash, Ord, Parser, PartialEq, PartialOrd)]
struct VerifyUrlOpts {
    /// The tapped URL, with uid/ctr/mac query parameters.
    url: String,

    /// SDM file key file (32 hex characters).
    #[arg(short, long = "key")]
    key_path: PathBuf,
}

#[derive(Clone, Debug, Default, Eq, Hash, Ord, Parser, PartialEq, PartialOrd)]
struct WriteUrlOpts {
    #[arg(short, long = "reader", default_value = "0")]
    reader_index: usize,

    /// Base URL; uid/ctr/mac placeholders are appended.
    base_url: String,

    /// Application master key file; factory zeros if absent.
    #[arg(short, long = "key")]
    key_path: Option<PathBuf>,

    /// Key slot that generates SDM MACs.
    #[arg(long, default_value = "2")]
    sdm_slot: u8,
}

#[derive(Clone, Debug, Default, Eq, Hash, Ord, Parser, PartialEq, PartialOrd)]
struct ResetOpts {
    #[arg(short, long = "reader", default_value = "0")]
    reader_index: usize,

    /// Application master key file; factory zeros if absent.
    #[arg(short, long = "key")]
    key_path: Option<PathBuf>,
}


fn load_key_hex_file(path: &Path) -> [u8; 16] {
    let content = std::fs::read_to_string(path)
        .unwrap_or_else(|e| panic!("failed to read key file {:?}: {}", path, e));
    let line = content.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_else(|| panic!("key file {:?} is empty", path));
    if line.len() != 32 {
        panic!("key file {:?} must hold 32 hex characters, found {}", path, line.len());
    }
    let bytes = hex::decode(line)
        .unwrap_or_else(|e| panic!("key file {:?} is not valid hex: {}", path, e));
    bytes.try_into().unwrap()
}

fn load_key_or_zeros(path: &Option<PathBuf>) -> [u8; 16] {
    match path {
        Some(path) => load_key_hex_file(path),
        None => [0u8; 16],
    }
}

/// Opens a session, honouring the test hooks this tool re-exposes.
///
/// The library takes RndA and injected session state as plain arguments;
/// the environment contract (`NTAG_RNDA`, `NTAG_KENC`/`NTAG_KMAC`/`NTAG_TI`/
/// `NTAG_CMDCTR`) is this tool's business, not the driver's.
fn open_session(tag: &mut dyn Transceiver, key: &[u8; 16]) -> Result<(Session, [u8; 16], u8), Error> {
    if let Some(session) = session_from_env() {
        return Ok((session, *key, 0));
    }
    if std::env::var_os("NTAG_RNDA").is_some() {
        let session = authenticate(tag, key, 0)?;
        return Ok((session, *key, 0));
    }
    auth::authenticate_with_fallback(tag, key, 0, 0)
}

/// EV2First with the deterministic-RndA hook applied when `NTAG_RNDA` is
/// set.
fn authenticate(tag: &mut dyn Transceiver, key: &[u8; 16], slot: u8) -> Result<Session, Error> {
    if let Some(rnd_a) = env_hex_16("NTAG_RNDA") {
        return auth::authenticate_ev2_first_with(tag, key, slot, rnd_a);
    }
    auth::authenticate_ev2_first(tag, key, slot)
}

fn env_hex_16(name: &str) -> Option<[u8; 16]> {
    let value = std::env::var(name).ok()?;
    let bytes = hex::decode(value.trim()).ok()?;
    bytes.try_into().ok()
}

/// Session injection from `NTAG_KENC` / `NTAG_KMAC` / `NTAG_TI` /
/// `NTAG_CMDCTR`, for replaying captured exchanges.
fn session_from_env() -> Option<Session> {
    let kenc = env_hex_16("NTAG_KENC")?;
    let kmac = env_hex_16("NTAG_KMAC")?;
    let ti: [u8; 4] = hex::decode(std::env::var("NTAG_TI").ok()?.trim()).ok()?.try_into().ok()?;
    let cmd_ctr = match std::env::var("NTAG_CMDCTR") {
        Ok(value) => u16::from_str_radix(value.trim(), 16).ok()?,
        Err(_) => 0,
    };
    Some(Session::from_parts(kenc, kmac, ti, cmd_ctr))
}

fn connect(reader_index: usize) -> pcsc::Card {
    let ctx = pcsc::Context::establish(pcsc::Scope::User)
        .expect("failed to establish PC/SC user context");

    let readers_buf_len = ctx.list_readers_len()
        .expect("failed to obtain length of buffer for PC/SC reader list");
    let mut readers_buf = vec![0u8; readers_buf_len];
    let mut readers = ctx.list_readers(&mut readers_buf)
        .expect("failed to list PC/SC readers");

    let Some(reader) = readers.nth(reader_index) else {
        panic!("no reader at index {}", reader_index)
    };
    match ctx.connect(reader, pcsc::ShareMode::Shared, pcsc::Protocols::ANY) {
        Ok(card) => card,
        Err(e) => panic!("failed to connect to tag: {}", e),
    }
}


fn run_info(opts: &InfoOpts) {
    let key = load_key_or_zeros(&opts.key_path);
    let mut card = connect(opts.reader_index);

    match card::get_uid(&mut card) {
        Ok(uid) => println!("uid: {}", hex::encode_upper(&uid)),
        Err(e) => println!("uid: unavailable ({})", e),
    }

    match version::get_version(&mut card) {
        Ok(tag_version) => print!("{}", diag::format_version(&tag_version)),
        Err(e) => println!("version: unavailable ({})", e),
    }

    match file::read_cc(&mut card).and_then(|raw| Ok(CapabilityContainer::parse(&raw)?)) {
        Ok(cc) => print!("{}", diag::format_capability_container(&cc)),
        Err(e) => println!("CC: unavailable ({})", e),
    }

    // a session for the secure GetFileSettings fallback; selecting above
    // killed any previous one
    file::select_ndef_application(&mut card).expect("failed to select NDEF application");
    match diag::get_key_settings(&mut card) {
        Ok((key_settings, key_count)) => {
            println!("key settings: 0x{:02X}, {} keys", key_settings, key_count);
        },
        Err(e) => println!("key settings: unavailable ({})", e),
    }

    let mut session = match open_session(&mut card, &key) {
        Ok((session, _, slot)) => {
            println!("authenticated on slot {}", slot);
            session
        },
        Err(e) => panic!("authentication failed: {}", e),
    };

    for file_no in [1, 2, 3] {
        match settings::get_file_settings(&mut card, &mut session, file_no) {
            Ok(file_settings) => print!("{}", diag::format_file_settings(file_no, &file_settings)),
            Err(e) => println!("file {} settings: unavailable ({})", file_no, e),
        }
    }
}

fn run_diag(opts: &DiagOpts) {
    let key = load_key_or_zeros(&opts.key_path);
    let mut card = connect(opts.reader_index);

    file::select_ndef_application(&mut card).expect("failed to select NDEF application");

    let slots: Vec<u8> = (0..=opts.max_slot.min(0x0F)).collect();
    for probe in diag::diagnose_auth_slots(&mut card, &key, &slots) {
        match &probe.result {
            Ok(()) => println!("slot {}: ok", probe.slot),
            Err(e) => println!("slot {}: {}", probe.slot, e),
        }
    }
}

fn run_verify_url(opts: &VerifyUrlOpts) {
    let key = load_key_hex_file(&opts.key_path);
    let verification = sdm::verify_sdm_url(&opts.url, &key)
        .expect("URL could not be checked");

    println!("uid:      {}", hex::encode_upper(verification.uid));
    println!("counter:  {}", verification.counter);
    println!("computed: {}", verification.computed_mac);
    if verification.mac_valid {
        println!("MAC: valid");
    } else {
        println!("MAC: INVALID");
        std::process::exit(1);
    }
}

fn run_write_url(opts: &WriteUrlOpts) {
    let key = load_key_or_zeros(&opts.key_path);
    let template = sdm::build_template(&opts.base_url)
        .expect("failed to build SDM template");
    println!("url: {}", template.url);
    println!("ndef: {} bytes", template.ndef.len());

    let mut card = connect(opts.reader_index);

    // write the template while write access is still free, then configure
    // the mirror offsets; both SELECTs invalidate any session, so
    // authenticate afterwards
    data::write_ndef_plain(&mut card, &template.ndef)
        .expect("failed to write NDEF template");

    file::select_ndef_application(&mut card).expect("failed to select NDEF application");
    let (mut session, _, slot) = open_session(&mut card, &key)
        .expect("authentication failed");
    println!("authenticated on slot {}", slot);

    let new_settings = FileSettings {
        file_type: 0x00,
        file_option: 0x40,
        access: AccessRights {
            read: AccessCondition::Free,
            write: AccessCondition::Free,
            read_write: AccessCondition::Free,
            change: AccessCondition::Key(0),
        },
        size: 0,
        sdm: Some(SdmSettings {
            options: SDM_OPT_UID_MIRROR | SDM_OPT_READ_CTR,
            access: SdmAccessRights {
                meta: AccessCondition::Free,
                file: AccessCondition::Key(opts.sdm_slot),
                ctr: AccessCondition::Free,
            },
            uid_offset: Some(template.uid_offset),
            ctr_offset: Some(template.ctr_offset),
            mac_input_offset: Some(template.mac_input_offset),
            mac_offset: Some(template.mac_offset),
            ..SdmSettings::default()
        }),
    };
    settings::change_file_settings(&mut card, &mut session, 2, &new_settings)
        .expect("failed to configure SDM");

    let after = settings::get_file_settings(&mut card, &mut session, 2)
        .expect("failed to read back file settings");
    print!("{}", diag::format_file_settings(2, &after));
}

fn run_reset(opts: &ResetOpts) {
    let key = load_key_or_zeros(&opts.key_path);
    let zero_key = [0u8; 16];
    let mut card = connect(opts.reader_index);

    match card::get_uid(&mut card) {
        Ok(uid) => println!("uid: {}", hex::encode_upper(&uid)),
        Err(e) => println!("uid: unavailable ({})", e),
    }

    file::select_ndef_application(&mut card).expect("failed to select NDEF application");
    let (mut session, effective_key, _) = open_session(&mut card, &key)
        .expect("authentication failed");
    if effective_key == zero_key {
        println!("authenticated with factory zeros; tag looks unprovisioned");
    } else {
        println!("authenticated with the application master key");
    }

    // factory file 2: plain, free read/write, SDM off
    let factory_settings = FileSettings {
        file_type: 0x00,
        file_option: 0x00,
        access: AccessRights {
            read: AccessCondition::Free,
            write: AccessCondition::Free,
            read_write: AccessCondition::Key(0),
            change: AccessCondition::Key(0),
        },
        size: 0,
        sdm: None,
    };
    settings::change_file_settings(&mut card, &mut session, 2, &factory_settings)
        .expect("failed to restore file 2 settings");
    println!("file 2 settings restored");

    // rewind the auxiliary slots first; slot 0 last, because changing it
    // kills the session. Each slot may still hold its factory zeros, so a
    // failed change is retried with the zero key as the old key, over a
    // fresh session.
    for slot in [1, 2, 3, 4] {
        match keys::change_key(&mut card, &mut session, 0, slot, &zero_key, &effective_key, 0x00) {
            Ok(()) => {
                println!("slot {} rewound to zeros", slot);
                continue;
            },
            Err(e) => println!("slot {}: {} (retrying with zero old key)", slot, e),
        }

        file::select_ndef_application(&mut card).expect("failed to re-select NDEF application");
        session = authenticate(&mut card, &effective_key, 0).expect("re-authentication failed");
        match keys::change_key(&mut card, &mut session, 0, slot, &zero_key, &zero_key, 0x00) {
            Ok(()) => println!("slot {} rewound to zeros", slot),
            Err(e) => println!("slot {}: {}", slot, e),
        }
    }
    keys::change_key(&mut card, &mut session, 0, 0, &zero_key, &effective_key, 0x00)
        .expect("failed to rewind slot 0");
    println!("slot 0 rewound to zeros (session closed)");

    // the session is gone; clear the NDEF file over the now-free write
    // access
    data::write_ndef_plain(&mut card, &[0x00, 0x00])
        .expect("failed to clear NDEF");
    println!("NDEF cleared");
}


fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mode = Mode::parse();
    match &mode {
        Mode::ListReaders => {
            let ctx = pcsc::Context::establish(pcsc::Scope::User)
                .expect("failed to establish PC/SC user context");
            let readers_buf_len = ctx.list_readers_len()
                .expect("failed to obtain length of buffer for PC/SC reader list");
            let mut readers_buf = vec![0u8; readers_buf_len];
            let readers = ctx.list_readers(&mut readers_buf)
                .expect("failed to list PC/SC readers");
            for (i, reader) in readers.enumerate() {
                println!("{}: {:?}", i, reader);
            }
        },
        Mode::Info(opts) => run_info(opts),
        Mode::Diag(opts) => run_diag(opts),
        Mode::VerifyUrl(opts) => run_verify_url(opts),
        Mode::WriteUrl(opts) => run_write_url(opts),
        Mode::Reset(opts) => run_reset(opts),
    }
}
