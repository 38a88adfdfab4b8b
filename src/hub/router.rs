//! JSON-RPC method routing for one inbound frame.

use serde_json::{Value, json};

use crate::channel::DeliveryMode;
use crate::client::Client;
use crate::gossip::PendingQuery;
use crate::hub::Hub;
use crate::transport::message::{ChannelMessage, ChannelParams, ErrorBody, Frame, Method};
use crate::utils::{PopError, Result};

/// Parse `text`, run it and answer on `socket`.
pub fn handle_frame(hub: &Hub, socket: &Client, text: &str) {
    let frame = match Frame::parse(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(socket = %socket.id, error = %e, "unreadable frame");
            socket.send_error(None, &e);
            return;
        }
    };

    match frame {
        Frame::Answer { id, result } => handle_answer(hub, socket, id, result),
        Frame::Query { id, method } => {
            let name = method.name();
            match handle_query(hub, socket, id, method) {
                Ok(Some(value)) => {
                    if let Some(id) = id {
                        socket.send_result(id, value);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!(socket = %socket.id, method = name, error = %e, "query failed");
                    socket.send_error(id, &e);
                }
            }
        }
    }
}

/// `Ok(None)` means the handler already answered or nothing is owed.
fn handle_query(
    hub: &Hub,
    socket: &Client,
    id: Option<i64>,
    method: Method,
) -> Result<Option<Value>> {
    if method.server_only() && !socket.is_server() {
        return Err(PopError::access_denied(format!(
            "{} is only accepted from other servers",
            method.name()
        )));
    }

    match method {
        Method::Publish(ChannelMessage { channel, message }) => {
            hub.dispatcher
                .dispatch(&channel, &message, DeliveryMode::Direct)?;
            Ok(Some(json!(0)))
        }
        Method::Subscribe(ChannelParams { channel }) => {
            hub.broker.subscribe(&channel, socket.id.clone())?;
            Ok(Some(json!(0)))
        }
        Method::Unsubscribe(ChannelParams { channel }) => {
            hub.broker.unsubscribe(&channel, &socket.id)?;
            Ok(Some(json!(0)))
        }
        Method::Catchup(ChannelParams { channel }) => {
            if !hub.store.has_channel(&channel)? {
                return Err(PopError::invalid_resource(format!(
                    "channel {channel} does not exist"
                )));
            }
            let messages = hub.store.get_all_messages_from_channel(&channel)?;
            Ok(Some(serde_json::to_value(messages)?))
        }
        Method::Broadcast(_) => Err(PopError::invalid_action(
            "broadcast frames only flow from a server to its subscribers",
        )),
        Method::Heartbeat(advertised) => {
            hub.heartbeats.handle_heartbeat(socket, &advertised)?;
            Ok(Some(json!(0)))
        }
        Method::GetMessagesById(requested) => {
            Ok(Some(hub.heartbeats.handle_get_messages_by_id(&requested)?))
        }
        Method::Rumor(rumor) => {
            let origin = rumor.sender_id.clone();
            let rumor_id = rumor.rumor_id;
            let report = hub.rumors.handle_rumor(socket, id, rumor);
            tracing::debug!(
                origin = %origin,
                rumor_id,
                applied = report.applied,
                parked = report.parked,
                "rumor processed"
            );
            Ok(None)
        }
        Method::RumorState(state) => Ok(Some(hub.rumors.handle_rumor_state(&state)?)),
        Method::GreetServer(greeting) => {
            hub.on_greeting(socket, greeting)?;
            Ok(Some(json!(0)))
        }
    }
}

fn handle_answer(
    hub: &Hub,
    socket: &Client,
    id: i64,
    result: std::result::Result<Value, ErrorBody>,
) {
    if !socket.is_server() {
        tracing::warn!(socket = %socket.id, query_id = id, "answer from a client socket ignored");
        return;
    }
    match hub.queries.take_from(id, &socket.id) {
        Some(PendingQuery::Rumor { rumor, peer }) => {
            hub.rumors.handle_answer(&peer, rumor, result);
        }
        Some(PendingQuery::GetMessagesById { peer }) => {
            match hub.heartbeats.handle_messages_answer(&peer, result) {
                Ok(report) => tracing::info!(
                    peer = %peer,
                    applied = report.applied,
                    parked = report.parked,
                    "heartbeat repair applied"
                ),
                Err(e) => tracing::warn!(peer = %peer, error = %e, "heartbeat repair failed"),
            }
        }
        Some(PendingQuery::RumorState { peer }) => {
            match hub.rumors.handle_state_answer(&peer, result) {
                Ok(report) if report.applied > 0 || report.parked > 0 => tracing::info!(
                    peer = %peer,
                    applied = report.applied,
                    parked = report.parked,
                    "caught up on missed rumors"
                ),
                Ok(_) => {}
                Err(e) => tracing::warn!(peer = %peer, error = %e, "rumor state exchange failed"),
            }
        }
        None => tracing::debug!(socket = %socket.id, query_id = id, "answer to unknown query"),
    }
}
