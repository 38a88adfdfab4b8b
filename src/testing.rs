//! Fixtures shared by the unit tests.

use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::broker::Broker;
use crate::channel::{Accepted, Dispatcher, ROOT};
use crate::config::{ServerSettings, Settings};
use crate::message::data::{self, ActionKind};
use crate::message::{Keypair, Message, crypto};
use crate::persistence::Store;

pub struct Fixture {
    pub store: Store,
    pub broker: Arc<Broker>,
    pub dispatcher: Arc<Dispatcher>,
    pub accepted: mpsc::UnboundedReceiver<Accepted>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_settings(Settings::default().server)
    }

    pub fn with_settings(settings: ServerSettings) -> Self {
        let store = Store::temporary().unwrap();
        let broker = Arc::new(Broker::new());
        let keys = store.server_keypair().unwrap();
        let (tx, accepted) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            broker.clone(),
            keys,
            settings,
            tx,
        ));
        Self {
            store,
            broker,
            dispatcher,
            accepted,
        }
    }
}

pub fn signed(keys: &Keypair, kind: ActionKind, payload: Value) -> Message {
    let raw = data::encode_data(kind, &payload).unwrap();
    Message::new(keys, &raw)
}

fn lao_id(lao: &str) -> &str {
    lao.trim_start_matches("/root/")
}

/// `lao#create` by `organizer`; returns the LAO path and the message.
pub fn lao_create(organizer: &Keypair, name: &str) -> (String, Message) {
    let creation = 1_700_000_000_i64;
    let id = crypto::hash(&[&organizer.public_key(), &creation.to_string(), name]);
    let msg = signed(
        organizer,
        ActionKind::LaoCreate,
        json!({
            "id": id,
            "name": name,
            "creation": creation,
            "organizer": organizer.public_key(),
            "witnesses": [],
        }),
    );
    (format!("{ROOT}/{id}"), msg)
}

/// `roll_call#create`, `#open` and `#close` admitting `attendees`.
pub fn roll_call(organizer: &Keypair, lao: &str, attendees: &[String]) -> [Message; 3] {
    let lao_id = lao_id(lao);
    let create_id = crypto::hash(&["R", lao_id, "10", "roll call"]);
    let create = signed(
        organizer,
        ActionKind::RollCallCreate,
        json!({
            "id": create_id,
            "name": "roll call",
            "creation": 10,
            "proposed_start": 10,
            "proposed_end": 20,
            "location": "hall",
        }),
    );
    let open_id = crypto::hash(&["R", lao_id, &create_id, "11"]);
    let open = signed(
        organizer,
        ActionKind::RollCallOpen,
        json!({ "update_id": open_id, "opens": create_id, "opened_at": 11 }),
    );
    let close_id = crypto::hash(&["R", lao_id, &open_id, "12"]);
    let close = signed(
        organizer,
        ActionKind::RollCallClose,
        json!({
            "update_id": close_id,
            "closes": open_id,
            "closed_at": 12,
            "attendees": attendees,
        }),
    );
    [create, open, close]
}

pub fn chirp_add(author: &Keypair, text: &str, timestamp: i64) -> Message {
    signed(
        author,
        ActionKind::ChirpAdd,
        json!({ "text": text, "timestamp": timestamp }),
    )
}

pub fn chirp_channel(lao: &str, author: &Keypair) -> String {
    format!("{lao}/social/{}", author.public_key())
}
