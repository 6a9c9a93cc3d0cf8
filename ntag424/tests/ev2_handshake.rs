use hex_literal::hex;
use ntag424::auth;
use ntag424::crypt;
use ntag424::error::Error;
use ntag424::iso7816::card::{Transceiver, TransportError};
use ntag424::settings;


const TAG_KEY: [u8; 16] = [0x00; 16];
const RND_A: [u8; 16] = [0x22; 16];
const RND_B: [u8; 16] = [0x11; 16];
const TI: [u8; 4] = hex!("A1A2A3A4");
const ZERO_IV: [u8; 16] = [0x00; 16];


/// A fake tag holding the all-zero key in slot 0 that walks through the
/// EV2First handshake and then answers one secure GetFileSettings.
///
/// Anything it does not expect is answered with 0x6988.
struct HandshakeTag {
    state: u8,
    rnd_a_seen: [u8; 16],
    transmit_count: usize,
}
impl HandshakeTag {
    fn new() -> Self {
        Self {
            state: 0,
            rnd_a_seen: [0u8; 16],
            transmit_count: 0,
        }
    }
}
impl Transceiver for HandshakeTag {
    fn transmit(&mut self, apdu: &[u8]) -> Result<Vec<u8>, TransportError> {
        self.transmit_count += 1;

        if apdu.len() == 8 && apdu[..5] == [0x90, 0x71, 0x00, 0x00, 0x02] {
            // phase 1; only slot 0 holds a key
            if apdu[5] != 0x00 {
                return Ok(vec![0x91, 0xAE]);
            }
            self.state = 1;
            let mut response = crypt::aes_cbc_encrypt(&TAG_KEY, &ZERO_IV, &RND_B).unwrap();
            response.extend([0x91, 0xAF]);
            return Ok(response);
        }

        if self.state == 1 && apdu.len() == 38 && apdu[..5] == [0x90, 0xAF, 0x00, 0x00, 0x20] {
            // phase 2: recover RndA, check RndB'
            let plaintext = crypt::aes_cbc_decrypt(&TAG_KEY, &ZERO_IV, &apdu[5..37]).unwrap();
            let mut rnd_a = [0u8; 16];
            rnd_a.copy_from_slice(&plaintext[..16]);
            if plaintext[16..32] != crypt::rotate_left_1(&RND_B) {
                return Ok(vec![0x91, 0xAE]);
            }
            self.rnd_a_seen = rnd_a;
            self.state = 2;

            let mut response_plain = Vec::with_capacity(32);
            response_plain.extend(TI);
            response_plain.extend(crypt::rotate_left_1(&rnd_a));
            response_plain.extend([0u8; 12]);
            let mut response = crypt::aes_cbc_encrypt(&TAG_KEY, &ZERO_IV, &response_plain).unwrap();
            response.extend([0x91, 0x00]);
            return Ok(response);
        }

        if self.state == 2 && apdu.len() == 15 && apdu[..6] == [0x90, 0xF5, 0x00, 0x00, 0x09, 0x02] {
            // secure GetFileSettings on file 2, counter 0
            let (_kenc, kmac) = auth::derive_session_keys(&TAG_KEY, &self.rnd_a_seen, &RND_B);

            let mut mac_input = vec![0xF5, 0x00, 0x00];
            mac_input.extend(TI);
            mac_input.push(0x02);
            let expected_mac = crypt::truncate_mac(&crypt::aes_cmac(&kmac, &mac_input));
            if apdu[6..14] != expected_mac {
                return Ok(vec![0x91, 0xAE]);
            }

            let body = [0x00, 0x00, 0xE0, 0xEE, 0x00, 0x00, 0x00];
            let mut response_mac_input = vec![0x00, 0x01, 0x00];
            response_mac_input.extend(TI);
            response_mac_input.extend(body);
            let mac = crypt::truncate_mac(&crypt::aes_cmac(&kmac, &response_mac_input));

            let mut response = body.to_vec();
            response.extend(mac);
            response.extend([0x91, 0x00]);
            return Ok(response);
        }

        Ok(vec![0x69, 0x88])
    }
}


#[test]
fn test_handshake_establishes_usable_session() {
    let mut tag = HandshakeTag::new();
    let mut session = auth::authenticate_ev2_first_with(&mut tag, &TAG_KEY, 0, RND_A)
        .expect("handshake failed");
    assert_eq!(session.ti(), TI);
    assert_eq!(session.command_counter(), 0);
    assert!(session.is_valid());

    // prove the derived Kenc/Kmac match the tag's by running a secure
    // exchange on top of them
    let settings = settings::get_file_settings_secure(&mut tag, &mut session, 2)
        .expect("secure GetFileSettings failed");
    assert_eq!(settings.access.to_bytes(), (0xE0, 0xEE));
    assert_eq!(session.command_counter(), 1);
}

#[test]
fn test_handshake_random_rnd_a() {
    let mut tag = HandshakeTag::new();
    let session = auth::authenticate_ev2_first(&mut tag, &TAG_KEY, 0).expect("handshake failed");
    assert_eq!(session.ti(), TI);
}

#[test]
fn test_phase_1_failure_carries_status_and_length() {
    let mut tag = HandshakeTag::new();
    let result = auth::authenticate_ev2_first_with(&mut tag, &TAG_KEY, 3, RND_A);
    match result {
        Err(Error::Auth(e)) => {
            assert_eq!(e.phase, 1);
            assert_eq!(e.sw.unwrap().to_word(), 0x91AE);
            assert_eq!(e.response_len, 0);
        },
        other => panic!("expected phase-1 auth error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_slot_out_of_range() {
    let mut tag = HandshakeTag::new();
    let result = auth::authenticate_ev2_first_with(&mut tag, &TAG_KEY, 0x10, RND_A);
    assert!(matches!(result, Err(Error::OutOfRange { .. })));
    assert_eq!(tag.transmit_count, 0);
}

#[test]
fn test_wrong_key_is_rejected_in_phase_2() {
    // a key the tag does not hold decrypts RndB into garbage; the tag then
    // answers phase 2 with 91AE
    let mut tag = HandshakeTag::new();
    let wrong_key = [0x42u8; 16];
    let result = auth::authenticate_ev2_first_with(&mut tag, &wrong_key, 0, RND_A);
    match result {
        Err(Error::Auth(e)) => assert_eq!(e.phase, 2),
        other => panic!("expected phase-2 auth error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_fallback_ladder_reaches_factory_key() {
    let mut tag = HandshakeTag::new();
    let provisioned_key = [0x42u8; 16];
    let (session, effective_key, effective_slot) =
        auth::authenticate_with_fallback(&mut tag, &provisioned_key, 1, 2)
            .expect("fallback never succeeded");
    assert_eq!(effective_key, TAG_KEY);
    assert_eq!(effective_slot, 0);
    assert!(session.is_valid());
}

#[test]
fn test_fallback_returns_last_error_when_everything_fails() {
    // slots 1 and 2 answer 91AE at phase 1, and the tag key is not the
    // all-zero key this time, so the zero-key rung fails in phase 2 as well
    struct RejectingTag;
    impl Transceiver for RejectingTag {
        fn transmit(&mut self, apdu: &[u8]) -> Result<Vec<u8>, TransportError> {
            if apdu.len() == 8 && apdu[..5] == [0x90, 0x71, 0x00, 0x00, 0x02] {
                return Ok(vec![0x91, 0xAE]);
            }
            Ok(vec![0x69, 0x88])
        }
    }

    let mut tag = RejectingTag;
    let result = auth::authenticate_with_fallback(&mut tag, &[0x42u8; 16], 1, 2);
    match result {
        Err(Error::Auth(e)) => assert_eq!(e.phase, 1),
        other => panic!("expected auth error, got {:?}", other.map(|_| ())),
    }
}
