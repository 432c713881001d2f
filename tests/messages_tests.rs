use base64::Engine;
use voice_console::audio::AudioFrame;
use voice_console::transport::messages::decode_audio;
use voice_console::transport::{ClientMessage, ServerMessage};

#[test]
fn test_audio_frame_serialization() {
    let frame = AudioFrame {
        samples: vec![0, 1, -1, i16::MAX, i16::MIN],
        sample_rate: 44100,
        sequence: 7,
    };

    let json = serde_json::to_string(&ClientMessage::audio(&frame, Some("pcm16le"))).unwrap();
    assert!(json.contains("\"type\":\"AUDIO\""));
    assert!(json.contains("\"sampleRate\":44100"));
    assert!(json.contains("\"format\":\"pcm16le\""));

    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(value["audio"].as_str().unwrap())
        .unwrap();
    assert_eq!(
        bytes,
        vec![0x00, 0x00, 0x01, 0x00, 0xff, 0xff, 0xff, 0x7f, 0x00, 0x80]
    );
}

#[test]
fn test_audio_frame_without_format_tag() {
    let frame = AudioFrame {
        samples: vec![1, 2],
        sample_rate: 16000,
        sequence: 0,
    };

    for format in [None, Some("")] {
        let json = serde_json::to_string(&ClientMessage::audio(&frame, format)).unwrap();
        assert!(!json.contains("format"), "{}", json);
    }
}

#[test]
fn test_ping_serialization() {
    let json = serde_json::to_string(&ClientMessage::Ping).unwrap();
    assert_eq!(json, r#"{"type":"PING"}"#);
}

#[test]
fn test_server_message_kinds() {
    let cases = [
        (r#"{"type":"AUDIO","audio":"AAA=","sampleRate":24000}"#, "AUDIO"),
        (r#"{"type":"TEXT_FALLBACK","text":"Hello"}"#, "TEXT_FALLBACK"),
        (r#"{"type":"INTERRUPT"}"#, "INTERRUPT"),
        (r#"{"type":"MAX_DURATION_REACHED"}"#, "MAX_DURATION_REACHED"),
        (r#"{"type":"ERROR","message":"boom"}"#, "ERROR"),
        (r#"{"type":"PONG"}"#, "PONG"),
    ];

    for (json, kind) in cases {
        let msg: ServerMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.kind(), kind);
    }
}

#[test]
fn test_server_audio_deserialization() {
    let json = r#"{"type":"AUDIO","audio":"AQD//w==","sampleRate":48000}"#;
    let msg: ServerMessage = serde_json::from_str(json).unwrap();

    match msg {
        ServerMessage::Audio { audio, sample_rate } => {
            assert_eq!(sample_rate, 48000);
            let frame = decode_audio(&audio, sample_rate, 3).unwrap();
            assert_eq!(frame.samples, vec![1, -1]);
            assert_eq!(frame.sequence, 3);
        }
        other => panic!("expected AUDIO, got {:?}", other),
    }
}

#[test]
fn test_error_without_message() {
    let msg: ServerMessage = serde_json::from_str(r#"{"type":"ERROR"}"#).unwrap();
    assert_eq!(
        msg,
        ServerMessage::Error {
            message: String::new()
        }
    );
}

#[test]
fn test_extra_fields_are_ignored() {
    let json = r#"{"type":"INTERRUPT","reason":"barge-in","at":12}"#;
    let msg: ServerMessage = serde_json::from_str(json).unwrap();
    assert_eq!(msg, ServerMessage::Interrupt);
}

#[test]
fn test_unknown_type_is_rejected() {
    assert!(serde_json::from_str::<ServerMessage>(r#"{"type":"TRANSCRIPT","text":"x"}"#).is_err());
    assert!(serde_json::from_str::<ServerMessage>(r#"{"text":"x"}"#).is_err());
}

#[test]
fn test_decode_audio_rejects_bad_payloads() {
    assert!(decode_audio("not base64!", 24000, 0).is_err());
    assert!(decode_audio("AAA=", 0, 0).is_err());
}

#[test]
fn test_decode_audio_drops_odd_trailing_byte() {
    // Three bytes: one full sample plus a stray byte
    let frame = decode_audio("AQAC", 24000, 0).unwrap();
    assert_eq!(frame.samples, vec![1]);
}
