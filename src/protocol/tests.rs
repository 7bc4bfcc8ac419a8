//! Protocol module tests

use super::*;

#[test]
fn test_topic_parse_valid() {
    let topic = Topic::parse("news").unwrap();
    assert_eq!(topic.as_str(), "news");

    // Slashes and dots are opaque characters, not hierarchy
    assert!(Topic::parse("orders/eu-west/created").is_ok());
    assert!(Topic::parse("a").is_ok());
    assert!(Topic::parse("emoji-✨").is_ok());
    assert!(Topic::parse(&"x".repeat(MAX_TOPIC_LENGTH)).is_ok());
}

#[test]
fn test_topic_parse_empty() {
    assert_eq!(Topic::parse(""), Err(TopicError::Empty));
}

#[test]
fn test_topic_parse_too_long() {
    let name = "x".repeat(MAX_TOPIC_LENGTH + 1);
    assert_eq!(Topic::parse(&name), Err(TopicError::TooLong));
}

#[test]
fn test_topic_parse_control_characters() {
    assert_eq!(Topic::parse("a\nb"), Err(TopicError::ControlCharacter));
    assert_eq!(Topic::parse("a\tb"), Err(TopicError::ControlCharacter));
    assert_eq!(Topic::parse("a\x7fb"), Err(TopicError::ControlCharacter));
    assert_eq!(Topic::parse("\x00"), Err(TopicError::ControlCharacter));
}

#[test]
fn test_topic_equality_and_borrow() {
    let a = Topic::parse("news").unwrap();
    let b = Topic::parse("news").unwrap();
    assert_eq!(a, b);

    let borrowed: &str = std::borrow::Borrow::borrow(&a);
    assert_eq!(borrowed, "news");
}

#[test]
fn test_connection_id_unique_and_ordered() {
    let a = ConnectionId::next();
    let b = ConnectionId::next();
    assert_ne!(a, b);
    assert!(a < b);
}

#[test]
fn test_decode_subscribe_frame() {
    let frame = ClientFrame::decode(br#"{"type":"subscribe","topic":"news"}"#).unwrap();
    assert_eq!(
        frame,
        ClientFrame::Subscribe {
            topic: "news".to_string()
        }
    );
}

#[test]
fn test_decode_unsubscribe_frame() {
    let frame = ClientFrame::decode(br#"{"type":"unsubscribe","topic":"news"}"#).unwrap();
    assert_eq!(
        frame,
        ClientFrame::Unsubscribe {
            topic: "news".to_string()
        }
    );
}

#[test]
fn test_decode_publish_frame() {
    let frame =
        ClientFrame::decode(br#"{"type":"publish","topic":"news","payload":"hello"}"#).unwrap();
    assert_eq!(
        frame,
        ClientFrame::Publish {
            topic: "news".to_string(),
            payload: "hello".to_string()
        }
    );
}

#[test]
fn test_decode_rejects_unknown_type() {
    assert!(ClientFrame::decode(br#"{"type":"shout","topic":"news"}"#).is_err());
}

#[test]
fn test_decode_rejects_missing_fields() {
    assert!(ClientFrame::decode(br#"{"type":"publish","topic":"news"}"#).is_err());
    assert!(ClientFrame::decode(br#"{"type":"subscribe"}"#).is_err());
}

#[test]
fn test_decode_rejects_non_json() {
    assert!(ClientFrame::decode(b"SUBSCRIBE news").is_err());
    assert!(ClientFrame::decode(b"").is_err());
}

#[test]
fn test_server_frame_round_trip() {
    let frame = ServerFrame::error(reason::INVALID_TOPIC, "topic name is empty");
    let bytes = frame.encode().unwrap();
    let decoded: ServerFrame = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(decoded, frame);
}

#[test]
fn test_encode_delivery_matches_message_frame() {
    let topic = Topic::parse("news").unwrap();
    let bytes = encode_delivery(&topic, "breaking: it works").unwrap();
    let decoded: ServerFrame = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(
        decoded,
        ServerFrame::Message {
            topic: "news".to_string(),
            payload: "breaking: it works".to_string()
        }
    );
}

#[test]
fn test_encode_delivery_escapes_payload() {
    let topic = Topic::parse("logs").unwrap();
    let payload = "line one\nline \"two\"";
    let bytes = encode_delivery(&topic, payload).unwrap();
    let decoded: ServerFrame = serde_json::from_slice(&bytes).unwrap();
    match decoded {
        ServerFrame::Message { payload: p, .. } => assert_eq!(p, payload),
        other => panic!("expected message frame, got {:?}", other),
    }
}
