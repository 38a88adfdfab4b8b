//! Anti-entropy between servers.
//!
//! A heartbeat advertises every base message id this server holds, per
//! channel. The receiver pulls the ids it lacks with `get_messages_by_id` and
//! feeds the answer through the same replay loop as rumors.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::broker::Broker;
use crate::client::Client;
use crate::gossip::queries::{PendingQueries, PendingQuery};
use crate::gossip::replay::{ReplayReport, Replayer};
use crate::message::Message;
use crate::persistence::Store;
use crate::transport::message::{ErrorBody, MessageIds, Method};
use crate::utils::{PopError, Result};

pub struct HeartbeatExchange {
    store: Store,
    broker: Arc<Broker>,
    queries: Arc<PendingQueries>,
    replayer: Arc<Replayer>,
}

impl HeartbeatExchange {
    pub fn new(
        store: Store,
        broker: Arc<Broker>,
        queries: Arc<PendingQueries>,
        replayer: Arc<Replayer>,
    ) -> Self {
        Self {
            store,
            broker,
            queries,
            replayer,
        }
    }

    /// Heartbeat every connected peer; returns how many were reached.
    pub fn send_heartbeats(&self) -> Result<usize> {
        let peers = self.broker.peers();
        if peers.is_empty() {
            return Ok(0);
        }
        let method = Method::Heartbeat(self.store.get_params_heartbeat()?);
        let mut sent = 0;
        for peer in &peers {
            match peer.send_query(None, &method) {
                Ok(()) => sent += 1,
                Err(e) => tracing::debug!(peer = %peer.id, error = %e, "heartbeat not sent"),
            }
        }
        Ok(sent)
    }

    pub fn send_heartbeat_to(&self, peer: &Client) -> Result<()> {
        let method = Method::Heartbeat(self.store.get_params_heartbeat()?);
        peer.send_query(None, &method)
    }

    /// Pull from `socket` whatever it advertised that we do not hold.
    /// Returns the query id of the pull, if one was needed.
    pub fn handle_heartbeat(&self, socket: &Client, advertised: &MessageIds) -> Result<Option<i64>> {
        let missing = self.store.get_params_for_get_messages_by_id(advertised)?;
        if missing.is_empty() {
            return Ok(None);
        }

        let count: usize = missing.values().map(Vec::len).sum();
        let id = self.queries.register(PendingQuery::GetMessagesById {
            peer: socket.id.clone(),
        });
        if let Err(e) = socket.send_query(Some(id), &Method::GetMessagesById(missing)) {
            self.queries.take(id);
            return Err(e);
        }
        tracing::info!(peer = %socket.id, missing = count, "pulling messages after heartbeat");
        Ok(Some(id))
    }

    /// Answer a pull with the base messages we hold among those requested.
    pub fn handle_get_messages_by_id(&self, requested: &MessageIds) -> Result<Value> {
        let messages = self.store.get_messages_by_id(requested)?;
        Ok(serde_json::to_value(messages)?)
    }

    /// Replay the messages a peer sent back for one of our pulls.
    pub fn handle_messages_answer(
        &self,
        peer: &str,
        result: std::result::Result<Value, ErrorBody>,
    ) -> Result<ReplayReport> {
        let value = result.map_err(|body| {
            PopError::invalid_action(format!(
                "peer {peer} refused get_messages_by_id: {}",
                body.description
            ))
        })?;
        let batch: BTreeMap<String, Vec<Message>> = serde_json::from_value(value).map_err(|e| {
            PopError::invalid_message_field("malformed get_messages_by_id answer").with_source(e)
        })?;
        Ok(self.replayer.process(batch))
    }
}
