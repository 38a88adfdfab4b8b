use std::sync::Barrier;
use std::thread;

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tungstenite::protocol::Message as WsMessage;

use super::{ChannelType, DeliveryMode, Outcome, ROOT, Validation, Validator, depth, lao_of};
use crate::client::Client;
use crate::config::{ServerSettings, Settings};
use crate::message::data::ActionKind;
use crate::message::{Keypair, Message, MessageData, WitnessSignature, crypto};
use crate::testing::{Fixture, chirp_add, chirp_channel, lao_create, roll_call, signed};
use crate::utils::ErrorKind;

fn setup_lao(fx: &Fixture, organizer: &Keypair, attendees: &[&Keypair]) -> String {
    let (lao, create) = lao_create(organizer, "lao");
    fx.dispatcher.dispatch(ROOT, &create, DeliveryMode::Direct).unwrap();
    if !attendees.is_empty() {
        let keys: Vec<String> = attendees.iter().map(|k| k.public_key()).collect();
        for msg in roll_call(organizer, &lao, &keys) {
            fx.dispatcher.dispatch(&lao, &msg, DeliveryMode::Direct).unwrap();
        }
    }
    lao
}

#[test]
fn path_helpers() {
    assert_eq!(depth(ROOT), 1);
    assert_eq!(depth("/root/L/social/K"), 4);
    assert_eq!(lao_of("/root/L/social/K").as_deref(), Some("/root/L"));
    assert_eq!(lao_of(ROOT), None);
}

#[test]
fn validator_rejects_wrong_message_id() {
    let fx = Fixture::new();
    let keys = Keypair::generate();
    let mut msg = chirp_add(&keys, "hello", 1);
    msg.message_id = crypto::hash(&["something", "else"]);

    let err = Validator::new(fx.store.clone())
        .validate(&msg, DeliveryMode::Direct)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidAction);
}

#[test]
fn validator_rejects_tampered_data() {
    let fx = Fixture::new();
    let keys = Keypair::generate();
    let mut msg = chirp_add(&keys, "hello", 1);
    msg.data = crypto::encode(br#"{"object":"chirp","action":"add","text":"bye","timestamp":1}"#);
    msg.message_id = Message::compute_id(&msg.data, &msg.signature);

    let err = Validator::new(fx.store.clone())
        .validate(&msg, DeliveryMode::Direct)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidMessageField);
}

#[test]
fn validator_checks_witness_signatures() {
    let fx = Fixture::new();
    let keys = Keypair::generate();
    let witness = Keypair::generate();
    let mut msg = chirp_add(&keys, "hello", 1);
    let id_bytes = crypto::decode("message_id", &msg.message_id).unwrap();
    msg.witness_signatures.push(WitnessSignature {
        witness: witness.public_key(),
        signature: witness.sign(&id_bytes),
    });
    let validator = Validator::new(fx.store.clone());
    assert_eq!(
        validator.validate(&msg, DeliveryMode::Direct).unwrap(),
        Validation::Fresh
    );

    msg.witness_signatures[0].signature = witness.sign(b"not the id");
    let err = validator.validate(&msg, DeliveryMode::Direct).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidMessageField);
}

#[test]
fn lao_create_builds_channels_and_greeting() {
    let mut fx = Fixture::new();
    let organizer = Keypair::generate();
    let (lao, create) = lao_create(&organizer, "my lao");

    let outcome = fx.dispatcher.dispatch(ROOT, &create, DeliveryMode::Direct).unwrap();
    assert_eq!(outcome, Outcome::Applied);

    for (path, kind) in [
        (lao.clone(), ChannelType::Lao),
        (format!("{lao}/social/posts"), ChannelType::Posts),
        (format!("{lao}/social/reactions"), ChannelType::Reaction),
        (format!("{lao}/coin"), ChannelType::Coin),
    ] {
        assert_eq!(fx.store.get_channel_type(&path).unwrap(), kind);
        assert!(fx.broker.has_channel(&path));
    }

    let history = fx.store.get_all_messages_from_channel(&lao).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0], create);
    let greet = MessageData::parse(
        &crate::message::ActionTable::standard(),
        &history[1].raw_data().unwrap(),
    )
    .unwrap();
    assert_eq!(greet.kind(), ActionKind::LaoGreet);
    assert_eq!(history[1].sender, fx.dispatcher.server_key());

    let accepted = fx.accepted.try_recv().unwrap();
    assert_eq!(accepted.channel, ROOT);
    assert_eq!(accepted.message, create);
}

#[test]
fn lao_create_requires_organizer_signature() {
    let fx = Fixture::new();
    let organizer = Keypair::generate();
    let impostor = Keypair::generate();
    let (_, genuine) = lao_create(&organizer, "lao");
    let data = genuine.raw_data().unwrap();
    let forged = Message::new(&impostor, &data);

    let err = fx.dispatcher.dispatch(ROOT, &forged, DeliveryMode::Direct).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AccessDenied);
}

#[test]
fn lao_create_respects_configured_owner() {
    let owner = Keypair::generate();
    let fx = Fixture::with_settings(ServerSettings {
        owner_public_key: Some(owner.public_key()),
        ..Settings::default().server
    });
    let (_, create) = lao_create(&Keypair::generate(), "lao");
    let err = fx.dispatcher.dispatch(ROOT, &create, DeliveryMode::Direct).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AccessDenied);

    let (_, create) = lao_create(&owner, "lao");
    fx.dispatcher.dispatch(ROOT, &create, DeliveryMode::Direct).unwrap();
}

#[test]
fn duplicate_direct_publish_is_invalid_action() {
    let fx = Fixture::new();
    let (_, create) = lao_create(&Keypair::generate(), "lao");
    fx.dispatcher.dispatch(ROOT, &create, DeliveryMode::Direct).unwrap();

    let err = fx.dispatcher.dispatch(ROOT, &create, DeliveryMode::Direct).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidAction);
}

#[test]
fn replayed_message_is_a_no_op() {
    let mut fx = Fixture::new();
    let (lao, create) = lao_create(&Keypair::generate(), "lao");
    assert_eq!(
        fx.dispatcher.dispatch(ROOT, &create, DeliveryMode::Replay).unwrap(),
        Outcome::Applied
    );
    let before = fx.store.get_all_messages_from_channel(&lao).unwrap();

    assert_eq!(
        fx.dispatcher.dispatch(ROOT, &create, DeliveryMode::Replay).unwrap(),
        Outcome::AlreadyKnown
    );
    assert_eq!(fx.store.get_all_messages_from_channel(&lao).unwrap(), before);
    // replayed messages are not gossiped again by this server
    assert!(fx.accepted.try_recv().is_err());
}

#[test]
fn unknown_channel_is_invalid_resource() {
    let fx = Fixture::new();
    let msg = chirp_add(&Keypair::generate(), "hi", 1);
    let err = fx
        .dispatcher
        .dispatch("/root/nowhere/social/x", &msg, DeliveryMode::Direct)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidResource);
}

#[test]
fn wrong_action_for_channel_type_is_rejected() {
    let fx = Fixture::new();
    let msg = chirp_add(&Keypair::generate(), "hi", 1);
    let err = fx.dispatcher.dispatch(ROOT, &msg, DeliveryMode::Direct).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidMessageField);
    assert!(!fx.store.has_message(&msg.message_id).unwrap());
}

#[test]
fn roll_call_close_creates_chirp_channels() {
    let fx = Fixture::new();
    let organizer = Keypair::generate();
    let alice = Keypair::generate();
    let bob = Keypair::generate();
    let lao = setup_lao(&fx, &organizer, &[&alice, &bob]);

    for author in [&alice, &bob] {
        assert_eq!(
            fx.store.get_channel_type(&chirp_channel(&lao, author)).unwrap(),
            ChannelType::Chirp
        );
    }
    // lao#create, lao#greet and the three roll call messages
    let history = fx.store.get_all_messages_from_channel(&lao).unwrap();
    assert_eq!(history.len(), 5);
}

#[test]
fn roll_call_open_requires_previous_create() {
    let fx = Fixture::new();
    let organizer = Keypair::generate();
    let lao = setup_lao(&fx, &organizer, &[]);
    let [_create, open, _close] = roll_call(&organizer, &lao, &[]);

    let err = fx.dispatcher.dispatch(&lao, &open, DeliveryMode::Direct).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidMessageField);
}

#[test]
fn roll_call_by_non_organizer_is_denied() {
    let fx = Fixture::new();
    let organizer = Keypair::generate();
    let lao = setup_lao(&fx, &organizer, &[]);
    let [create, _, _] = roll_call(&Keypair::generate(), &lao, &[]);

    let err = fx.dispatcher.dispatch(&lao, &create, DeliveryMode::Direct).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AccessDenied);
}

#[test]
fn chirp_add_derives_notification_on_posts() {
    let fx = Fixture::new();
    let organizer = Keypair::generate();
    let alice = Keypair::generate();
    let lao = setup_lao(&fx, &organizer, &[&alice]);

    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let subscriber = Client::new(tx);
    let subscriber_id = subscriber.id.clone();
    fx.broker.register_client(subscriber);
    let posts = format!("{lao}/social/posts");
    fx.broker.subscribe(&posts, subscriber_id).unwrap();

    let chirp = chirp_add(&alice, "hello world", 42);
    fx.dispatcher
        .dispatch(&chirp_channel(&lao, &alice), &chirp, DeliveryMode::Direct)
        .unwrap();

    let history = fx.store.get_all_messages_from_channel(&posts).unwrap();
    assert_eq!(history.len(), 1);
    let notify: Value = serde_json::from_slice(&history[0].raw_data().unwrap()).unwrap();
    assert_eq!(notify["object"], "chirp");
    assert_eq!(notify["action"], "notify_add");
    assert_eq!(notify["chirp_id"], chirp.message_id.as_str());
    assert_eq!(notify["timestamp"], 42);

    let WsMessage::Text(text) = rx.try_recv().unwrap() else {
        panic!("expected a broadcast frame");
    };
    let frame: Value = serde_json::from_str(text.as_str()).unwrap();
    assert_eq!(frame["params"]["message"]["message_id"], history[0].message_id.as_str());
}

#[test]
fn chirp_rules() {
    let fx = Fixture::new();
    let organizer = Keypair::generate();
    let alice = Keypair::generate();
    let mallory = Keypair::generate();
    let lao = setup_lao(&fx, &organizer, &[&alice]);
    let channel = chirp_channel(&lao, &alice);

    let too_long = chirp_add(&alice, &"x".repeat(301), 1);
    let err = fx.dispatcher.dispatch(&channel, &too_long, DeliveryMode::Direct).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidMessageField);

    let intruder = chirp_add(&mallory, "hi", 1);
    let err = fx.dispatcher.dispatch(&channel, &intruder, DeliveryMode::Direct).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AccessDenied);

    let chirp = chirp_add(&alice, "hi", 1);
    fx.dispatcher.dispatch(&channel, &chirp, DeliveryMode::Direct).unwrap();
    let delete = signed(
        &alice,
        ActionKind::ChirpDelete,
        json!({ "chirp_id": chirp.message_id, "timestamp": 2 }),
    );
    fx.dispatcher.dispatch(&channel, &delete, DeliveryMode::Direct).unwrap();

    let posts = fx
        .store
        .get_all_messages_from_channel(&format!("{lao}/social/posts"))
        .unwrap();
    assert_eq!(posts.len(), 2);
}

#[test]
fn posts_channel_is_read_only() {
    let fx = Fixture::new();
    let organizer = Keypair::generate();
    let lao = setup_lao(&fx, &organizer, &[]);
    let msg = chirp_add(&organizer, "sneaky", 1);

    let err = fx
        .dispatcher
        .dispatch(&format!("{lao}/social/posts"), &msg, DeliveryMode::Direct)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidAction);
}

#[test]
fn reactions_need_attendee_and_existing_chirp() {
    let fx = Fixture::new();
    let organizer = Keypair::generate();
    let alice = Keypair::generate();
    let lao = setup_lao(&fx, &organizer, &[&alice]);
    let reactions = format!("{lao}/social/reactions");

    let chirp = chirp_add(&alice, "react to me", 1);
    fx.dispatcher
        .dispatch(&chirp_channel(&lao, &alice), &chirp, DeliveryMode::Direct)
        .unwrap();

    let outsider = signed(
        &Keypair::generate(),
        ActionKind::ReactionAdd,
        json!({ "reaction_codepoint": "👍", "chirp_id": chirp.message_id, "timestamp": 2 }),
    );
    let err = fx.dispatcher.dispatch(&reactions, &outsider, DeliveryMode::Direct).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AccessDenied);

    let dangling = signed(
        &alice,
        ActionKind::ReactionAdd,
        json!({ "reaction_codepoint": "👍", "chirp_id": "missing", "timestamp": 2 }),
    );
    let err = fx.dispatcher.dispatch(&reactions, &dangling, DeliveryMode::Direct).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidResource);

    let like = signed(
        &alice,
        ActionKind::ReactionAdd,
        json!({ "reaction_codepoint": "👍", "chirp_id": chirp.message_id, "timestamp": 3 }),
    );
    fx.dispatcher.dispatch(&reactions, &like, DeliveryMode::Direct).unwrap();
    let unlike = signed(
        &alice,
        ActionKind::ReactionDelete,
        json!({ "reaction_id": like.message_id, "timestamp": 4 }),
    );
    fx.dispatcher.dispatch(&reactions, &unlike, DeliveryMode::Direct).unwrap();
}

#[test]
fn election_lifecycle() {
    let fx = Fixture::new();
    let organizer = Keypair::generate();
    let voter = Keypair::generate();
    let lao = setup_lao(&fx, &organizer, &[&voter]);
    let lao_id = lao.trim_start_matches("/root/").to_string();

    let election_id = crypto::hash(&["Election", &lao_id, "100", "board"]);
    let setup = signed(
        &organizer,
        ActionKind::ElectionSetup,
        json!({
            "id": election_id,
            "lao": lao_id,
            "name": "board",
            "version": "SECRET_BALLOT",
            "created_at": 100,
            "start_time": 100,
            "end_time": 200,
            "questions": [{
                "id": "q1",
                "question": "who?",
                "voting_method": "Plurality",
                "ballot_options": ["a", "b"],
            }],
        }),
    );
    fx.dispatcher.dispatch(&lao, &setup, DeliveryMode::Direct).unwrap();
    let election = format!("{lao}/{election_id}");
    assert_eq!(fx.store.get_channel_type(&election).unwrap(), ChannelType::Election);

    let history = fx.store.get_all_messages_from_channel(&election).unwrap();
    assert_eq!(history.len(), 2, "setup copy and election key");

    let vote = |keys: &Keypair, ts: i64| {
        signed(
            keys,
            ActionKind::ElectionCastVote,
            json!({
                "lao": lao_id,
                "election": election_id,
                "created_at": ts,
                "votes": [{ "id": "v", "question": "q1", "vote": 0 }],
            }),
        )
    };

    let early = vote(&voter, 101);
    let err = fx.dispatcher.dispatch(&election, &early, DeliveryMode::Direct).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidAction);

    let open = signed(
        &organizer,
        ActionKind::ElectionOpen,
        json!({ "lao": lao_id, "election": election_id, "opened_at": 102 }),
    );
    fx.dispatcher.dispatch(&election, &open, DeliveryMode::Direct).unwrap();

    let stranger = vote(&Keypair::generate(), 103);
    let err = fx.dispatcher.dispatch(&election, &stranger, DeliveryMode::Direct).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AccessDenied);

    fx.dispatcher
        .dispatch(&election, &vote(&voter, 104), DeliveryMode::Direct)
        .unwrap();

    let end = signed(
        &organizer,
        ActionKind::ElectionEnd,
        json!({
            "lao": lao_id,
            "election": election_id,
            "created_at": 105,
            "registered_votes": "",
        }),
    );
    fx.dispatcher.dispatch(&election, &end, DeliveryMode::Direct).unwrap();
}

#[test]
fn coin_transaction_bounds() {
    let fx = Fixture::new();
    let organizer = Keypair::generate();
    let lao = setup_lao(&fx, &organizer, &[]);
    let coin = format!("{lao}/coin");

    let tx = |value: i64| {
        signed(
            &organizer,
            ActionKind::CoinPostTransaction,
            json!({
                "transaction_id": format!("tx-{value}"),
                "transaction": {
                    "version": 1,
                    "inputs": [{ "tx_out_hash": "h", "tx_out_index": 0, "script": {} }],
                    "outputs": [{ "value": value, "script": {} }],
                    "lock_time": 0,
                },
            }),
        )
    };

    let err = fx.dispatcher.dispatch(&coin, &tx(-1), DeliveryMode::Direct).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidMessageField);
    fx.dispatcher.dispatch(&coin, &tx(10), DeliveryMode::Direct).unwrap();
}

#[test]
fn witness_signature_over_known_message() {
    let fx = Fixture::new();
    let organizer = Keypair::generate();
    let witness = Keypair::generate();
    let lao = setup_lao(&fx, &organizer, &[]);
    let target = fx.store.get_all_messages_from_channel(&lao).unwrap()[0].clone();

    let id_bytes = crypto::decode("message_id", &target.message_id).unwrap();
    let good = signed(
        &witness,
        ActionKind::MessageWitness,
        json!({ "message_id": target.message_id, "signature": witness.sign(&id_bytes) }),
    );
    fx.dispatcher.dispatch(&lao, &good, DeliveryMode::Direct).unwrap();

    let unknown = signed(
        &witness,
        ActionKind::MessageWitness,
        json!({ "message_id": crypto::hash(&["nope"]), "signature": witness.sign(b"x") }),
    );
    let err = fx.dispatcher.dispatch(&lao, &unknown, DeliveryMode::Direct).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidResource);
}

fn race<T: Send>(first: impl FnOnce() -> T + Send, second: impl FnOnce() -> T + Send) -> (T, T) {
    let barrier = Barrier::new(2);
    thread::scope(|s| {
        let a = s.spawn(|| {
            barrier.wait();
            first()
        });
        let b = s.spawn(|| {
            barrier.wait();
            second()
        });
        (a.join().unwrap(), b.join().unwrap())
    })
}

#[test]
fn racing_roll_call_closes_apply_once() {
    let fx = Fixture::new();
    for round in 0..50 {
        let organizer = Keypair::generate();
        let lao = setup_lao(&fx, &organizer, &[]);
        let [create, open, close] = roll_call(&organizer, &lao, &[]);
        fx.dispatcher.dispatch(&lao, &create, DeliveryMode::Direct).unwrap();
        fx.dispatcher.dispatch(&lao, &open, DeliveryMode::Direct).unwrap();

        let lao_id = lao.trim_start_matches("/root/");
        let create_id = crypto::hash(&["R", lao_id, "10", "roll call"]);
        let open_id = crypto::hash(&["R", lao_id, &create_id, "11"]);
        let other_close = signed(
            &organizer,
            ActionKind::RollCallClose,
            json!({
                "update_id": crypto::hash(&["R", lao_id, &open_id, "13"]),
                "closes": open_id,
                "closed_at": 13,
                "attendees": [],
            }),
        );

        let dispatcher = &fx.dispatcher;
        let (a, b) = race(
            || dispatcher.dispatch(&lao, &close, DeliveryMode::Direct),
            || dispatcher.dispatch(&lao, &other_close, DeliveryMode::Direct),
        );
        let refused = match (a, b) {
            (Ok(_), Err(err)) | (Err(err), Ok(_)) => err,
            other => panic!("round {round}: both closes ended as {other:?}"),
        };
        assert_eq!(refused.kind(), ErrorKind::InvalidMessageField);

        let closes = [&close, &other_close]
            .iter()
            .filter(|m| fx.store.has_message(&m.message_id).unwrap())
            .count();
        assert_eq!(closes, 1, "round {round}");
    }
}

#[test]
fn racing_direct_duplicates_are_invalid_action() {
    let fx = Fixture::new();
    for round in 0..50 {
        let (lao, create) = lao_create(&Keypair::generate(), "lao");
        let dispatcher = &fx.dispatcher;
        let (a, b) = race(
            || dispatcher.dispatch(ROOT, &create, DeliveryMode::Direct),
            || dispatcher.dispatch(ROOT, &create, DeliveryMode::Direct),
        );
        let refused = match (a, b) {
            (Ok(_), Err(err)) | (Err(err), Ok(_)) => err,
            other => panic!("round {round}: duplicate publish ended as {other:?}"),
        };
        assert_eq!(refused.kind(), ErrorKind::InvalidAction, "round {round}");
        // lao#create plus the server's greeting
        assert_eq!(fx.store.get_all_messages_from_channel(&lao).unwrap().len(), 2);
    }
}
