//! Decoders must not care how the handshake was cut into reads.

use proptest::prelude::*;
use protogate_detect::{
    default_protocols, ConnectionParameters, Decoded, DecodeError, MatchOutcome, ProtocolMatcher,
};

fn stomp_connect() -> Vec<u8> {
    b"CONNECT\naccept-version:1.2\nhost:broker0\nlogin:guest\n\n\0".to_vec()
}

fn http_request() -> Vec<u8> {
    b"GET /status HTTP/1.1\r\nHost: API.example.com:8080\r\nAccept: */*\r\n\r\n".to_vec()
}

fn mqtt_connect() -> Vec<u8> {
    let mut body = vec![0x00, 0x04];
    body.extend_from_slice(b"MQTT");
    body.push(4);
    body.push(0x80 | 0x40 | 0x02);
    body.extend_from_slice(&30u16.to_be_bytes());
    for s in ["client-7", "tenant-a/alice", "secret"] {
        body.extend_from_slice(&(s.len() as u16).to_be_bytes());
        body.extend_from_slice(s.as_bytes());
    }
    let mut packet = vec![0x10, body.len() as u8];
    packet.extend_from_slice(&body);
    packet
}

fn amqp_open() -> Vec<u8> {
    let mut fields = vec![0xa1, 11];
    fields.extend_from_slice(b"container-1");
    fields.extend_from_slice(&[0xa1, 7]);
    fields.extend_from_slice(b"broker1");
    let mut body = vec![0x00, 0x53, 0x10, 0xc0, (fields.len() + 1) as u8, 2];
    body.extend_from_slice(&fields);

    let mut bytes = b"AMQP\x00\x01\x00\x00".to_vec();
    bytes.extend_from_slice(&((8 + body.len()) as u32).to_be_bytes());
    bytes.extend_from_slice(&[2, 0, 0, 0]);
    bytes.extend_from_slice(&body);
    bytes
}

fn amqp_sasl_init() -> Vec<u8> {
    let mut fields = vec![0xa3, 5];
    fields.extend_from_slice(b"PLAIN");
    let response = b"\x00alice\x00secret";
    fields.extend_from_slice(&[0xa0, response.len() as u8]);
    fields.extend_from_slice(response);
    fields.extend_from_slice(&[0xa1, 7]);
    fields.extend_from_slice(b"vh-sasl");
    let mut body = vec![0x00, 0x53, 0x41, 0xc0, (fields.len() + 1) as u8, 3];
    body.extend_from_slice(&fields);

    let mut bytes = b"AMQP\x03\x01\x00\x00".to_vec();
    bytes.extend_from_slice(&((8 + body.len()) as u32).to_be_bytes());
    bytes.extend_from_slice(&[2, 1, 0, 0]);
    bytes.extend_from_slice(&body);
    bytes
}

fn openwire_info() -> Vec<u8> {
    let mut map = 1u32.to_be_bytes().to_vec();
    map.extend_from_slice(&4u16.to_be_bytes());
    map.extend_from_slice(b"Host");
    map.push(9);
    map.extend_from_slice(&9u16.to_be_bytes());
    map.extend_from_slice(b"broker-ow");

    let mut command = vec![1];
    command.extend_from_slice(b"ActiveMQ");
    command.extend_from_slice(&12u32.to_be_bytes());
    command.push(1);
    command.extend_from_slice(&(map.len() as u32).to_be_bytes());
    command.extend_from_slice(&map);

    let mut bytes = (command.len() as u32).to_be_bytes().to_vec();
    bytes.extend_from_slice(&command);
    bytes
}

fn tls_client_hello() -> Vec<u8> {
    let name = b"secure.example.com";
    let mut sni = Vec::new();
    sni.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
    sni.push(0);
    sni.extend_from_slice(&(name.len() as u16).to_be_bytes());
    sni.extend_from_slice(name);

    let mut extensions = vec![0x00, 0x00];
    extensions.extend_from_slice(&(sni.len() as u16).to_be_bytes());
    extensions.extend_from_slice(&sni);

    let mut hello = vec![0x03, 0x03];
    hello.extend_from_slice(&[0x42; 32]);
    hello.extend_from_slice(&[0x00, 0x00, 0x02, 0x13, 0x01, 0x01, 0x00]);
    hello.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    hello.extend_from_slice(&extensions);

    let mut handshake = vec![0x01, 0x00];
    handshake.extend_from_slice(&(hello.len() as u16).to_be_bytes());
    handshake.extend_from_slice(&hello);

    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}

/// Drive matcher and decoder the way a session does, one chunk per read.
fn run(bytes: &[u8], cuts: &[usize]) -> Result<(&'static str, ConnectionParameters), DecodeError> {
    let matcher = ProtocolMatcher::new(default_protocols());
    let mut prefix = Vec::new();
    let mut decoder = None;
    let mut protocol_name = "";

    let mut start = 0;
    let mut boundaries: Vec<usize> = cuts.iter().copied().filter(|c| *c > 0 && *c < bytes.len()).collect();
    boundaries.sort_unstable();
    boundaries.dedup();
    boundaries.push(bytes.len());

    for end in boundaries {
        let chunk = &bytes[start..end];
        start = end;

        if decoder.is_none() {
            prefix.extend_from_slice(chunk);
            match matcher.detect(&prefix) {
                MatchOutcome::Matched(protocol) => {
                    protocol_name = protocol.name();
                    let mut d = protocol.decoder();
                    if let Decoded::Complete(params) = d.decode(&prefix)? {
                        return Ok((protocol_name, params));
                    }
                    decoder = Some(d);
                }
                MatchOutcome::NoMatchYet => {}
                MatchOutcome::NoneMatched => panic!("no protocol matched"),
            }
            continue;
        }

        if let Some(d) = decoder.as_mut() {
            if let Decoded::Complete(params) = d.decode(chunk)? {
                return Ok((protocol_name, params));
            }
        }
    }

    panic!("handshake did not complete")
}

fn handshakes() -> Vec<Vec<u8>> {
    vec![
        stomp_connect(),
        http_request(),
        mqtt_connect(),
        amqp_open(),
        amqp_sasl_init(),
        openwire_info(),
        tls_client_hello(),
    ]
}

#[test]
fn test_single_chunk_results() {
    let expected = [
        ("stomp", Some("broker0"), Some("guest")),
        ("http", Some("api.example.com"), None),
        ("mqtt", Some("tenant-a"), Some("alice")),
        ("amqp", Some("broker1"), None),
        ("amqp", Some("vh-sasl"), Some("alice")),
        ("openwire", Some("broker-ow"), None),
        ("tls", Some("secure.example.com"), None),
    ];
    for (bytes, (name, vhost, user)) in handshakes().iter().zip(expected) {
        let (detected, params) = run(bytes, &[]).unwrap();
        assert_eq!(detected, name);
        assert_eq!(params.virtual_host.as_deref(), vhost, "{name}");
        assert_eq!(params.user.as_deref(), user, "{name}");
    }
}

#[test]
fn test_byte_at_a_time_matches_single_chunk() {
    for bytes in handshakes() {
        let cuts: Vec<usize> = (1..bytes.len()).collect();
        assert_eq!(run(&bytes, &cuts).unwrap(), run(&bytes, &[]).unwrap());
    }
}

proptest! {
    #[test]
    fn prop_random_chunking_is_irrelevant(
        which in 0usize..7,
        cuts in proptest::collection::vec(0usize..512, 0..24),
    ) {
        let bytes = &handshakes()[which];
        prop_assert_eq!(run(bytes, &cuts).unwrap(), run(bytes, &[]).unwrap());
    }
}
