use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use popmesh::client::SocketKind;
use popmesh::config::Settings;
use popmesh::hub::Hub;
use popmesh::message::data::{ActionKind, encode_data};
use popmesh::message::{Keypair, Message, crypto};
use popmesh::persistence::Store;
use popmesh::transport::websocket::{connect_peer, fetch_catchup, serve};

struct Server {
    hub: Arc<Hub>,
    client_url: String,
    server_url: String,
}

async fn listen(hub: &Arc<Hub>, kind: SocketKind) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    tokio::spawn(serve(listener, hub.clone(), kind));
    url
}

async fn server() -> Server {
    let mut settings = Settings::default();
    settings.gossip.rumor_interval_ms = 100;
    settings.gossip.heartbeat_interval_ms = 200;
    settings.workers.shutdown_grace_secs = 1;
    let hub = Hub::new(settings, Store::temporary().unwrap()).unwrap();
    hub.start();
    let client_url = listen(&hub, SocketKind::Client).await;
    let server_url = listen(&hub, SocketKind::Server).await;
    Server {
        hub,
        client_url,
        server_url,
    }
}

fn lao_create(organizer: &Keypair, name: &str) -> (String, Message) {
    let creation = 1_700_000_000_i64;
    let id = crypto::hash(&[&organizer.public_key(), &creation.to_string(), name]);
    let payload = json!({
        "id": id,
        "name": name,
        "creation": creation,
        "organizer": organizer.public_key(),
        "witnesses": [],
    });
    let raw = encode_data(ActionKind::LaoCreate, &payload).unwrap();
    (format!("/root/{id}"), Message::new(organizer, &raw))
}

async fn publish(url: &str, channel: &str, message: &Message) -> Value {
    let (mut ws, _) = connect_async(url).await.unwrap();
    let frame = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "publish",
        "params": { "channel": channel, "message": message },
    });
    ws.send(WsMessage::text(frame.to_string())).await.unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("publish was never answered")
        .unwrap()
        .unwrap();
    serde_json::from_str(reply.to_text().unwrap()).unwrap()
}

/// Poll `url` until `channel` holds at least `count` messages.
async fn wait_for_history(url: &str, channel: &str, count: usize) -> Vec<Message> {
    let poll = async {
        loop {
            if let Ok(history) = fetch_catchup(url, channel).await {
                if history.len() >= count {
                    return history;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(10), poll)
        .await
        .expect("channel never replicated")
}

async fn wait_for_peers(hub: &Hub) {
    let poll = async {
        while hub.broker().known_peers().is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), poll)
        .await
        .expect("peers never greeted each other");
}

#[tokio::test]
async fn rumor_replicates_a_new_lao() {
    let a = server().await;
    let b = server().await;
    connect_peer(b.hub.clone(), &a.server_url).await.unwrap();
    wait_for_peers(&a.hub).await;
    wait_for_peers(&b.hub).await;

    let (lao, create) = lao_create(&Keypair::generate(), "replicated");
    let reply = publish(&a.client_url, "/root", &create).await;
    assert_eq!(reply["result"], 0);

    // the create copy plus b's own greeting
    let history = wait_for_history(&b.client_url, &lao, 2).await;
    assert_eq!(history[0], create);
    let b_id = b.hub.server_id();
    assert!(history.iter().any(|m| m.sender == b_id));

    let on_a = fetch_catchup(&a.client_url, &lao).await.unwrap();
    assert_eq!(on_a[0].message_id, history[0].message_id);

    a.hub.shutdown().await;
    b.hub.shutdown().await;
}

#[tokio::test]
async fn late_peer_catches_up() {
    let a = server().await;
    let (lao, create) = lao_create(&Keypair::generate(), "before the peer");
    let reply = publish(&a.client_url, "/root", &create).await;
    assert_eq!(reply["result"], 0);

    let b = server().await;
    connect_peer(b.hub.clone(), &a.server_url).await.unwrap();

    let history = wait_for_history(&b.client_url, &lao, 2).await;
    assert_eq!(history[0], create);
    assert!(b.hub.store().has_message(&create.message_id).unwrap());

    a.hub.shutdown().await;
    b.hub.shutdown().await;
}

#[tokio::test]
async fn direct_duplicate_is_refused_over_the_wire() {
    let a = server().await;
    let (_, create) = lao_create(&Keypair::generate(), "twice");
    assert_eq!(publish(&a.client_url, "/root", &create).await["result"], 0);

    let again = publish(&a.client_url, "/root", &create).await;
    assert_eq!(again["error"]["code"], -1);

    a.hub.shutdown().await;
}
