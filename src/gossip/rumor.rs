//! Rumor mongering.
//!
//! Messages accepted from local clients are batched into "my rumor". Once the
//! batch is full it is cut with the next local rumor id and pushed to every
//! connected peer. A peer that already had it answers `DuplicateResource`;
//! each such answer makes this server stop with probability
//! `stop_probability`, otherwise the same rumor goes out again to another peer.
//!
//! A server receiving a duplicate rumor forwards it under the same coin flip
//! rather than unconditionally, so a rumor circulating on a cycle of peers dies
//! out geometrically instead of looping.
//!
//! Rumors from one origin are accepted strictly in id order. A server that
//! sees a rumor ahead of what it holds, or that just met a peer, sends a
//! `rumor_state` with the last id it accepted per origin; the peer answers with
//! every logged rumor past those ids, oldest first.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::broker::Broker;
use crate::channel::Accepted;
use crate::client::Client;
use crate::config::GossipSettings;
use crate::gossip::queries::{PendingQueries, PendingQuery};
use crate::gossip::replay::{ReplayReport, Replayer};
use crate::message::Message;
use crate::persistence::Store;
use crate::transport::message::{ErrorBody, Method};
use crate::utils::{ErrorKind, PopError, Result};

/// A batch of messages authored through one server, numbered per origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rumor {
    pub sender_id: String,
    pub rumor_id: u64,
    pub messages: BTreeMap<String, Vec<Message>>,
}

impl Rumor {
    pub fn len(&self) -> usize {
        self.messages.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Last rumor id accepted per origin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RumorState {
    pub state: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GossipPolicy {
    pub stop_probability: f64,
    pub batch_size: usize,
}

impl GossipPolicy {
    pub fn from_settings(settings: &GossipSettings) -> Self {
        Self {
            stop_probability: settings.stop_probability,
            batch_size: settings.rumor_batch_size.max(1),
        }
    }

    /// Coin flip taken on every duplicate answer.
    pub fn should_stop<R: Rng + ?Sized>(&self, rng: &mut R) -> bool {
        rng.gen_bool(self.stop_probability.clamp(0.0, 1.0))
    }
}

pub struct RumorEngine {
    store: Store,
    broker: Arc<Broker>,
    queries: Arc<PendingQueries>,
    replayer: Arc<Replayer>,
    policy: GossipPolicy,
    server_id: String,
    /// Own rumors no peer could be reached for yet, oldest first.
    stalled: Mutex<VecDeque<Rumor>>,
}

impl RumorEngine {
    pub fn new(
        store: Store,
        broker: Arc<Broker>,
        queries: Arc<PendingQueries>,
        replayer: Arc<Replayer>,
        policy: GossipPolicy,
        server_id: String,
    ) -> Self {
        Self {
            store,
            broker,
            queries,
            replayer,
            policy,
            server_id,
            stalled: Mutex::new(VecDeque::new()),
        }
    }

    fn stalled(&self) -> MutexGuard<'_, VecDeque<Rumor>> {
        self.stalled.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stalled_len(&self) -> usize {
        self.stalled().len()
    }

    /// Add a locally accepted message to my rumor; cut and send it once the
    /// batch is full.
    pub fn enqueue(&self, accepted: Accepted) -> Result<()> {
        let count = self
            .store
            .add_message_to_my_rumor(&accepted.channel, &accepted.message)?;
        if count >= self.policy.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Retry stalled rumors, then cut and send whatever my rumor holds.
    pub fn flush(&self) -> Result<()> {
        self.retry_stalled();
        if let Some(rumor) = self.store.get_and_increment_my_rumor(&self.server_id)? {
            tracing::debug!(rumor_id = rumor.rumor_id, messages = rumor.len(), "rumor cut");
            if self.send_to_peers(&rumor, None) == 0 {
                tracing::debug!(rumor_id = rumor.rumor_id, "no peer reachable, rumor stalled");
                self.stalled().push_back(rumor);
            }
        }
        Ok(())
    }

    pub fn retry_stalled(&self) {
        let pending: Vec<Rumor> = self.stalled().drain(..).collect();
        if pending.is_empty() {
            return;
        }
        let mut still_stalled = VecDeque::new();
        for rumor in pending {
            if self.send_to_peers(&rumor, None) == 0 {
                still_stalled.push_back(rumor);
            } else {
                tracing::info!(rumor_id = rumor.rumor_id, "stalled rumor sent");
            }
        }
        let mut stalled = self.stalled();
        // rumors stalled while we were sending go after the older ones
        still_stalled.extend(stalled.drain(..));
        *stalled = still_stalled;
    }

    fn send_to(&self, peer: &Client, rumor: &Rumor) -> bool {
        let id = self.queries.register(PendingQuery::Rumor {
            rumor: rumor.clone(),
            peer: peer.id.clone(),
        });
        match peer.send_query(Some(id), &Method::Rumor(rumor.clone())) {
            Ok(()) => true,
            Err(e) => {
                self.queries.take(id);
                tracing::warn!(peer = %peer.id, rumor_id = rumor.rumor_id, error = %e, "failed to send rumor");
                false
            }
        }
    }

    /// Send `rumor` to every peer except `exclude`; returns how many got it.
    fn send_to_peers(&self, rumor: &Rumor, exclude: Option<&str>) -> usize {
        self.broker
            .peers()
            .iter()
            .filter(|peer| Some(peer.id.as_str()) != exclude)
            .filter(|peer| self.send_to(peer, rumor))
            .count()
    }

    /// Handle an inbound rumor: acknowledge, forward, then replay its messages.
    pub fn handle_rumor(&self, socket: &Client, id: Option<i64>, rumor: Rumor) -> ReplayReport {
        let answer = |outcome: std::result::Result<Value, &PopError>| {
            if let Some(id) = id {
                match outcome {
                    Ok(value) => socket.send_result(id, value),
                    Err(e) => socket.send_error(Some(id), e),
                }
            }
        };

        match self.store.store_rumor(&rumor) {
            Ok(()) => {
                answer(Ok(json!(0)));
                tracing::info!(
                    origin = %rumor.sender_id,
                    rumor_id = rumor.rumor_id,
                    messages = rumor.len(),
                    "rumor accepted"
                );
                self.send_to_peers(&rumor, Some(&socket.id));
                self.replayer.process(rumor.messages)
            }
            Err(e) if e.kind() == ErrorKind::DuplicateResource => {
                answer(Err(&e));
                if self.is_ahead(&rumor) {
                    tracing::info!(
                        origin = %rumor.sender_id,
                        rumor_id = rumor.rumor_id,
                        "rumor ahead of the local state, asking for the gap"
                    );
                    if let Err(e) = self.send_rumor_state_to(socket) {
                        tracing::warn!(peer = %socket.id, error = %e, "failed to send rumor state");
                    }
                    return ReplayReport::default();
                }
                tracing::debug!(origin = %rumor.sender_id, rumor_id = rumor.rumor_id, "duplicate rumor");
                // forwarded with the odds the mongering side keeps going with
                if !self.policy.should_stop(&mut rand::thread_rng()) {
                    self.send_to_peers(&rumor, Some(&socket.id));
                }
                ReplayReport::default()
            }
            Err(e) => {
                answer(Err(&e));
                tracing::error!(origin = %rumor.sender_id, error = %e, "failed to record rumor");
                ReplayReport::default()
            }
        }
    }

    /// True if `rumor` skips ids we have not accepted from its origin yet.
    fn is_ahead(&self, rumor: &Rumor) -> bool {
        match self.store.last_rumor_id(&rumor.sender_id) {
            Ok(Some(last)) => rumor.rumor_id > last,
            Ok(None) => true,
            Err(e) => {
                tracing::error!(origin = %rumor.sender_id, error = %e, "failed to read rumor state");
                false
            }
        }
    }

    /// Ask `peer` for the rumors we are missing.
    pub fn send_rumor_state_to(&self, peer: &Client) -> Result<()> {
        let state = RumorState {
            state: self.store.get_rumor_state()?,
        };
        let id = self.queries.register(PendingQuery::RumorState {
            peer: peer.id.clone(),
        });
        if let Err(e) = peer.send_query(Some(id), &Method::RumorState(state)) {
            self.queries.take(id);
            return Err(e);
        }
        Ok(())
    }

    /// Send our rumor state to every peer; returns how many got it.
    pub fn send_rumor_state(&self) -> Result<usize> {
        let mut sent = 0;
        for peer in self.broker.peers() {
            match self.send_rumor_state_to(&peer) {
                Ok(()) => sent += 1,
                Err(e) => tracing::warn!(peer = %peer.id, error = %e, "failed to send rumor state"),
            }
        }
        Ok(sent)
    }

    /// Logged rumors the sender of `state` has not accepted yet.
    pub fn handle_rumor_state(&self, state: &RumorState) -> Result<Value> {
        let missing = self.store.get_rumors_after(&state.state)?;
        if !missing.is_empty() {
            tracing::debug!(rumors = missing.len(), "peer is behind, sending logged rumors");
        }
        Ok(serde_json::to_value(missing)?)
    }

    /// Accept and replay the rumors a peer sent back for our rumor state.
    /// They are not forwarded: every other peer runs its own exchange.
    pub fn handle_state_answer(
        &self,
        peer: &str,
        result: std::result::Result<Value, ErrorBody>,
    ) -> Result<ReplayReport> {
        let value = result.map_err(|body| {
            PopError::invalid_action(format!(
                "peer {peer} refused rumor_state: {}",
                body.description
            ))
        })?;
        let rumors: Vec<Rumor> = serde_json::from_value(value).map_err(|e| {
            PopError::invalid_message_field("malformed rumor_state answer").with_source(e)
        })?;

        let mut report = ReplayReport::default();
        for rumor in rumors {
            match self.store.store_rumor(&rumor) {
                Ok(()) => {
                    tracing::debug!(peer, origin = %rumor.sender_id, rumor_id = rumor.rumor_id, "missed rumor recovered");
                    report.absorb(self.replayer.process(rumor.messages));
                }
                // already accepted, or still past a gap the peer shares
                Err(e) if e.kind() == ErrorKind::DuplicateResource => {}
                Err(e) => return Err(e),
            }
        }
        Ok(report)
    }

    /// React to a peer's answer to one of our rumors. Returns true if the
    /// rumor was sent again.
    pub fn handle_answer(
        &self,
        peer: &str,
        rumor: Rumor,
        result: std::result::Result<Value, ErrorBody>,
    ) -> bool {
        self.handle_answer_with(peer, rumor, result, &mut rand::thread_rng())
    }

    pub fn handle_answer_with<R: Rng + ?Sized>(
        &self,
        peer: &str,
        rumor: Rumor,
        result: std::result::Result<Value, ErrorBody>,
        rng: &mut R,
    ) -> bool {
        let error = match result {
            Ok(_) => {
                tracing::debug!(peer, rumor_id = rumor.rumor_id, "rumor delivered");
                return false;
            }
            Err(error) => error,
        };

        if ErrorKind::from_code(error.code) != ErrorKind::DuplicateResource {
            tracing::warn!(
                peer,
                rumor_id = rumor.rumor_id,
                code = error.code,
                description = %error.description,
                "rumor rejected, stop mongering"
            );
            return false;
        }
        if self.policy.should_stop(rng) {
            tracing::debug!(peer, rumor_id = rumor.rumor_id, "peer already knew, stop mongering");
            return false;
        }

        let others: Vec<Client> = self
            .broker
            .peers()
            .into_iter()
            .filter(|candidate| candidate.id != peer)
            .collect();
        match others.choose(rng) {
            Some(next) => {
                tracing::debug!(from = peer, to = %next.id, rumor_id = rumor.rumor_id, "mongering rumor again");
                self.send_to(next, &rumor)
            }
            None => false,
        }
    }
}
