use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tungstenite::protocol::Message as WsMessage;

use crate::transport::message::{self, Method};
use crate::utils::{PopError, Result};

/// Who is on the other end of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Client,
    Server,
}

/// A connected WebSocket, either a client or a peer server.
///
/// Each socket is uniquely identified by an `id` and has a channel (`sender`)
/// drained by the connection's write loop. Sends never block: a closed socket
/// only makes them fail.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: String,
    pub kind: SocketKind,
    pub sender: UnboundedSender<WsMessage>,
}

impl Client {
    pub fn new(sender: UnboundedSender<WsMessage>) -> Self {
        Self {
            id: format!("client-{}", uuid::Uuid::new_v4()),
            kind: SocketKind::Client,
            sender,
        }
    }

    pub fn server(sender: UnboundedSender<WsMessage>) -> Self {
        Self {
            id: format!("server-{}", uuid::Uuid::new_v4()),
            kind: SocketKind::Server,
            sender,
        }
    }

    pub fn is_server(&self) -> bool {
        self.kind == SocketKind::Server
    }

    /// Queue `text` for the write loop; false once the socket is gone.
    pub fn send(&self, text: String) -> bool {
        match self.sender.send(WsMessage::text(text)) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(socket = %self.id, error = %e, "send on closed socket");
                false
            }
        }
    }

    pub fn send_query(&self, id: Option<i64>, method: &Method) -> Result<()> {
        let text = message::query(id, method)?;
        if self.send(text) {
            Ok(())
        } else {
            Err(PopError::internal(format!("socket {} is closed", self.id)))
        }
    }

    pub fn send_result(&self, id: i64, result: Value) {
        self.send(message::result(id, result));
    }

    pub fn send_error(&self, id: Option<i64>, err: &PopError) {
        self.send(message::error(id, err));
    }
}
