//! JSON-RPC frames exchanged with clients and peer servers.
//!
//! Queries look like `{"jsonrpc": "2.0", "id": 3, "method": "publish",
//! "params": {...}}`; `id` is absent for notifications (`broadcast`,
//! `heartbeat`, `greet_server`). Answers echo the id with either a `result`
//! or an `error` object `{code, description}`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::gossip::{Rumor, RumorState};
use crate::message::Message;
use crate::utils::{PopError, Result};

pub const JSONRPC_VERSION: &str = "2.0";

/// Channel path -> message ids.
pub type MessageIds = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelParams {
    pub channel: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub channel: String,
    pub message: Message,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerGreeting {
    pub public_key: String,
    pub client_address: String,
    pub server_address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum Method {
    Publish(ChannelMessage),
    Subscribe(ChannelParams),
    Unsubscribe(ChannelParams),
    Catchup(ChannelParams),
    Broadcast(ChannelMessage),
    Heartbeat(MessageIds),
    GetMessagesById(MessageIds),
    Rumor(Rumor),
    RumorState(RumorState),
    GreetServer(ServerGreeting),
}

impl Method {
    pub fn name(&self) -> &'static str {
        match self {
            Method::Publish(_) => "publish",
            Method::Subscribe(_) => "subscribe",
            Method::Unsubscribe(_) => "unsubscribe",
            Method::Catchup(_) => "catchup",
            Method::Broadcast(_) => "broadcast",
            Method::Heartbeat(_) => "heartbeat",
            Method::GetMessagesById(_) => "get_messages_by_id",
            Method::Rumor(_) => "rumor",
            Method::RumorState(_) => "rumor_state",
            Method::GreetServer(_) => "greet_server",
        }
    }

    /// Methods only another server may call.
    pub fn server_only(&self) -> bool {
        matches!(
            self,
            Method::Heartbeat(_)
                | Method::GetMessagesById(_)
                | Method::Rumor(_)
                | Method::RumorState(_)
                | Method::GreetServer(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: i32,
    pub description: String,
}

impl From<&PopError> for ErrorBody {
    fn from(err: &PopError) -> Self {
        Self {
            code: err.code(),
            description: err.description().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Query {
        id: Option<i64>,
        method: Method,
    },
    Answer {
        id: i64,
        result: std::result::Result<Value, ErrorBody>,
    },
}

impl Frame {
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text).map_err(|e| {
            PopError::invalid_message_field("frame is not valid JSON").with_source(e)
        })?;
        let id = value.get("id").and_then(Value::as_i64);

        if value.get("method").is_some() {
            let method: Method = serde_json::from_value(value).map_err(|e| {
                PopError::invalid_message_field("unknown method or malformed params").with_source(e)
            })?;
            return Ok(Frame::Query { id, method });
        }

        let id = id.ok_or_else(|| PopError::invalid_message_field("answer without id"))?;
        if let Some(error) = value.get("error") {
            let body: ErrorBody = serde_json::from_value(error.clone()).map_err(|e| {
                PopError::invalid_message_field("malformed error object").with_source(e)
            })?;
            return Ok(Frame::Answer {
                id,
                result: Err(body),
            });
        }
        match value.get("result") {
            Some(result) => Ok(Frame::Answer {
                id,
                result: Ok(result.clone()),
            }),
            None => Err(PopError::invalid_message_field(
                "frame has neither method, result nor error",
            )),
        }
    }
}

pub fn query(id: Option<i64>, method: &Method) -> Result<String> {
    let mut value = serde_json::to_value(method)?;
    if let Some(map) = value.as_object_mut() {
        map.insert("jsonrpc".to_string(), JSONRPC_VERSION.into());
        if let Some(id) = id {
            map.insert("id".to_string(), id.into());
        }
    }
    Ok(value.to_string())
}

pub fn result(id: i64, result: Value) -> String {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "result": result,
    })
    .to_string()
}

pub fn error(id: Option<i64>, err: &PopError) -> String {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": ErrorBody::from(err),
    })
    .to_string()
}
