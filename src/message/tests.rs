use super::crypto::{self, Keypair};
use super::data::{self, ActionKind, ActionTable, ChirpAdd, MessageData};
use super::message::Message;
use crate::utils::ErrorKind;
use serde_json::json;

#[test]
fn new_message_has_consistent_id() {
    let keys = Keypair::generate();
    let msg = Message::new(&keys, br#"{"object":"chirp","action":"add"}"#);

    assert_eq!(msg.sender, keys.public_key());
    assert_eq!(msg.message_id, Message::compute_id(&msg.data, &msg.signature));
    let raw = msg.raw_data().unwrap();
    crypto::verify(&msg.sender, &raw, &msg.signature).unwrap();
}

#[test]
fn message_json_uses_wire_field_names() {
    let keys = Keypair::generate();
    let msg = Message::new(&keys, b"{}");
    let value = serde_json::to_value(&msg).unwrap();

    for field in ["data", "sender", "signature", "message_id", "witness_signatures"] {
        assert!(value.get(field).is_some(), "missing {field}");
    }
}

#[test]
fn witness_signatures_default_to_empty() {
    let value = json!({
        "data": "e30=",
        "sender": "a",
        "signature": "b",
        "message_id": "c"
    });
    let msg: Message = serde_json::from_value(value).unwrap();
    assert!(msg.witness_signatures.is_empty());
}

#[test]
fn table_resolves_every_kind() {
    let table = ActionTable::standard();
    for kind in ActionKind::ALL {
        assert_eq!(table.resolve(kind.object(), kind.action()), Some(kind));
    }
    assert_eq!(table.resolve("lao", "dance"), None);
}

#[test]
fn parse_chirp_add() {
    let table = ActionTable::standard();
    let raw = json!({
        "object": "chirp",
        "action": "add",
        "text": "hello",
        "timestamp": 1_700_000_000
    })
    .to_string();

    let data = MessageData::parse(&table, raw.as_bytes()).unwrap();
    assert_eq!(data.kind(), ActionKind::ChirpAdd);
    match data {
        MessageData::ChirpAdd(chirp) => {
            assert_eq!(chirp.text, "hello");
            assert_eq!(chirp.parent_id, None);
        }
        other => panic!("unexpected payload {other:?}"),
    }
}

#[test]
fn parse_rejects_unknown_pair() {
    let table = ActionTable::standard();
    let raw = br#"{"object":"chirp","action":"shout"}"#;
    let err = MessageData::parse(&table, raw).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidMessageField);
}

#[test]
fn parse_rejects_missing_fields() {
    let table = ActionTable::standard();
    let raw = br#"{"object":"chirp","action":"add"}"#;
    let err = MessageData::parse(&table, raw).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidMessageField);
}

#[test]
fn encode_data_adds_header() {
    let chirp = ChirpAdd {
        text: "hi".into(),
        parent_id: None,
        timestamp: 5,
    };
    let raw = data::encode_data(ActionKind::ChirpAdd, &chirp).unwrap();
    let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();
    assert_eq!(value["object"], "chirp");
    assert_eq!(value["action"], "add");

    let table = ActionTable::standard();
    assert_eq!(
        MessageData::parse(&table, &raw).unwrap(),
        MessageData::ChirpAdd(chirp)
    );
}
