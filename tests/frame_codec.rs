use zbgateway::gateway::checksum;
use zbgateway::gateway::frame::{classify, decode, seal, DEFAULT_SECRET_KEY};
use zbgateway::gateway::{Command, FrameError, InboundKind, Role};

#[test]
fn encoded_commands_decode_to_the_same_id_and_verb() {
    let commands = [
        Command::new("D1", "CHECK"),
        Command::new("TBE0001", "led_status:1").with_key("k9"),
        Command::new("node-7", "set_secret_key:abc"),
        Command::new("D2", "get_data"),
    ];
    for command in commands {
        let line = command.encode(DEFAULT_SECRET_KEY);
        let frame = decode(&line).unwrap();
        assert_eq!(Some(frame.id.as_str()), command.target_id());
        assert_eq!(frame.verb(), Some(command.verb.as_str()));
        assert_eq!(
            frame.secret_key.as_deref(),
            Some(command.secret_key.as_deref().unwrap_or(DEFAULT_SECRET_KEY))
        );
    }
}

#[test]
fn checksum_covers_everything_before_the_delimiter() {
    let line = seal("ID:D1,SECRET_KEY:123,CMD:CHECK");
    let (body, hex) = checksum::split(line.trim_end()).unwrap();
    assert_eq!(body, "ID:D1,SECRET_KEY:123,CMD:CHECK");
    assert_eq!(hex, checksum::to_hex(checksum::compute(body.as_bytes())));
    assert!(hex.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
}

#[test]
fn data_payload_keeps_its_commas() {
    let frame = decode(&seal("ID:S1,DATA:temp:21.5,hum:40,lux:3")).unwrap();
    assert_eq!(frame.role, Role::Data("temp:21.5,hum:40,lux:3".to_string()));
    assert_eq!(
        classify(&frame),
        InboundKind::Data("temp:21.5,hum:40,lux:3".to_string())
    );
}

#[test]
fn integrity_is_checked_before_structure() {
    assert_eq!(decode("ID:D1,CMD:CHECK"), Err(FrameError::Integrity));
    assert_eq!(decode("ID:D1,CMD:CHECK,CRC:DEADBEEF"), Err(FrameError::Integrity));
    assert!(matches!(decode(&seal("ID:D1,FOO:bar")), Err(FrameError::Malformed(_))));
    assert!(matches!(decode(&seal("CMD:CHECK")), Err(FrameError::Malformed(_))));
}

#[test]
fn classifies_well_known_verbs() {
    let cases = [
        ("ID:D1,CMD:BRD:DISC", InboundKind::Discovery),
        ("ID:D1,CMD:led_status:0", InboundKind::Status("0".into())),
        ("ID:D1,CMD:reset_data", InboundKind::ResetData),
        ("ID:D1,CMD:get_data", InboundKind::DataRequest),
        ("ID:D1,CMD:set_secret_key:s3", InboundKind::SecretKey("s3".into())),
        ("ID:D1,CMD:CHECK", InboundKind::Check),
        ("ID:D1,CMD:door:open", InboundKind::Passthrough("door:open".into())),
    ];
    for (body, expected) in cases {
        let frame = decode(&seal(body)).unwrap();
        assert_eq!(classify(&frame), expected, "{}", body);
    }
}

#[test]
fn decoded_frame_serializes_for_the_cli() {
    let frame = decode(&seal("ID:D1,SECRET_KEY:123,CMD:CHECK")).unwrap();
    let json = serde_json::to_value(&frame).unwrap();
    assert_eq!(json["id"], "D1");
    assert_eq!(json["secret_key"], "123");
    assert_eq!(json["role"]["cmd"], "CHECK");
}
