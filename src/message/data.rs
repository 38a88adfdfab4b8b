//! Typed message payloads.
//!
//! Every payload carries an `object` and an `action` field. The pair is
//! resolved once through an `ActionTable` (built at startup) into an
//! `ActionKind`, and the payload is then decoded into the matching
//! `MessageData` variant.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::utils::{PopError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    LaoCreate,
    LaoGreet,
    RollCallCreate,
    RollCallOpen,
    RollCallReopen,
    RollCallClose,
    MeetingCreate,
    MeetingState,
    MessageWitness,
    ElectionSetup,
    ElectionKey,
    ElectionOpen,
    ElectionCastVote,
    ElectionEnd,
    ChirpAdd,
    ChirpDelete,
    ChirpNotifyAdd,
    ChirpNotifyDelete,
    ReactionAdd,
    ReactionDelete,
    CoinPostTransaction,
}

impl ActionKind {
    pub const ALL: [ActionKind; 21] = [
        ActionKind::LaoCreate,
        ActionKind::LaoGreet,
        ActionKind::RollCallCreate,
        ActionKind::RollCallOpen,
        ActionKind::RollCallReopen,
        ActionKind::RollCallClose,
        ActionKind::MeetingCreate,
        ActionKind::MeetingState,
        ActionKind::MessageWitness,
        ActionKind::ElectionSetup,
        ActionKind::ElectionKey,
        ActionKind::ElectionOpen,
        ActionKind::ElectionCastVote,
        ActionKind::ElectionEnd,
        ActionKind::ChirpAdd,
        ActionKind::ChirpDelete,
        ActionKind::ChirpNotifyAdd,
        ActionKind::ChirpNotifyDelete,
        ActionKind::ReactionAdd,
        ActionKind::ReactionDelete,
        ActionKind::CoinPostTransaction,
    ];

    pub fn object(self) -> &'static str {
        match self {
            ActionKind::LaoCreate | ActionKind::LaoGreet => "lao",
            ActionKind::RollCallCreate
            | ActionKind::RollCallOpen
            | ActionKind::RollCallReopen
            | ActionKind::RollCallClose => "roll_call",
            ActionKind::MeetingCreate | ActionKind::MeetingState => "meeting",
            ActionKind::MessageWitness => "message",
            ActionKind::ElectionSetup
            | ActionKind::ElectionKey
            | ActionKind::ElectionOpen
            | ActionKind::ElectionCastVote
            | ActionKind::ElectionEnd => "election",
            ActionKind::ChirpAdd
            | ActionKind::ChirpDelete
            | ActionKind::ChirpNotifyAdd
            | ActionKind::ChirpNotifyDelete => "chirp",
            ActionKind::ReactionAdd | ActionKind::ReactionDelete => "reaction",
            ActionKind::CoinPostTransaction => "coin",
        }
    }

    pub fn action(self) -> &'static str {
        match self {
            ActionKind::LaoCreate
            | ActionKind::RollCallCreate
            | ActionKind::MeetingCreate => "create",
            ActionKind::LaoGreet => "greet",
            ActionKind::RollCallOpen | ActionKind::ElectionOpen => "open",
            ActionKind::RollCallReopen => "reopen",
            ActionKind::RollCallClose => "close",
            ActionKind::MeetingState => "state",
            ActionKind::MessageWitness => "witness",
            ActionKind::ElectionSetup => "setup",
            ActionKind::ElectionKey => "key",
            ActionKind::ElectionCastVote => "cast_vote",
            ActionKind::ElectionEnd => "end",
            ActionKind::ChirpAdd | ActionKind::ReactionAdd => "add",
            ActionKind::ChirpDelete | ActionKind::ReactionDelete => "delete",
            ActionKind::ChirpNotifyAdd => "notify_add",
            ActionKind::ChirpNotifyDelete => "notify_delete",
            ActionKind::CoinPostTransaction => "post_transaction",
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.object(), self.action())
    }
}

/// `object#action` -> `ActionKind`, built once at startup.
#[derive(Debug, Clone)]
pub struct ActionTable {
    entries: HashMap<String, ActionKind>,
}

impl ActionTable {
    pub fn standard() -> Self {
        let entries = ActionKind::ALL
            .iter()
            .map(|kind| (kind.to_string(), *kind))
            .collect();
        Self { entries }
    }

    pub fn resolve(&self, object: &str, action: &str) -> Option<ActionKind> {
        self.entries.get(format!("{object}#{action}").as_str()).copied()
    }
}

impl Default for ActionTable {
    fn default() -> Self {
        Self::standard()
    }
}

#[derive(Debug, Deserialize)]
struct DataHeader {
    object: String,
    action: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaoCreate {
    pub id: String,
    pub name: String,
    pub creation: i64,
    pub organizer: String,
    #[serde(default)]
    pub witnesses: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerAddress {
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaoGreet {
    pub lao: String,
    pub frontend: String,
    pub address: String,
    pub peers: Vec<PeerAddress>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollCallCreate {
    pub id: String,
    pub name: String,
    pub creation: i64,
    pub proposed_start: i64,
    pub proposed_end: i64,
    pub location: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Shared by `roll_call#open` and `roll_call#reopen`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollCallOpen {
    pub update_id: String,
    pub opens: String,
    pub opened_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollCallClose {
    pub update_id: String,
    pub closes: String,
    pub closed_at: i64,
    pub attendees: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeetingCreate {
    pub id: String,
    pub name: String,
    pub creation: i64,
    pub start: i64,
    #[serde(default)]
    pub end: Option<i64>,
    #[serde(default)]
    pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeetingState {
    pub id: String,
    pub name: String,
    pub last_modified: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageWitness {
    pub message_id: String,
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub question: String,
    pub voting_method: String,
    pub ballot_options: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElectionSetup {
    pub id: String,
    pub lao: String,
    pub name: String,
    pub version: String,
    pub created_at: i64,
    pub start_time: i64,
    pub end_time: i64,
    pub questions: Vec<Question>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElectionKey {
    pub election: String,
    pub election_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElectionOpen {
    pub lao: String,
    pub election: String,
    pub opened_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub id: String,
    pub question: String,
    pub vote: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CastVote {
    pub lao: String,
    pub election: String,
    pub created_at: i64,
    pub votes: Vec<Vote>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElectionEnd {
    pub lao: String,
    pub election: String,
    pub created_at: i64,
    pub registered_votes: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChirpAdd {
    pub text: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChirpDelete {
    pub chirp_id: String,
    pub timestamp: i64,
}

/// Server-derived announcement on the LAO's `social/posts` channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChirpNotify {
    pub chirp_id: String,
    pub channel: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionAdd {
    pub reaction_codepoint: String,
    pub chirp_id: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionDelete {
    pub reaction_id: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxInput {
    pub tx_out_hash: String,
    pub tx_out_index: u32,
    pub script: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxOutput {
    pub value: i64,
    pub script: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostTransaction {
    pub transaction_id: String,
    pub transaction: Transaction,
}

/// One variant per `object#action` the hub understands.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageData {
    LaoCreate(LaoCreate),
    LaoGreet(LaoGreet),
    RollCallCreate(RollCallCreate),
    RollCallOpen(RollCallOpen),
    RollCallReopen(RollCallOpen),
    RollCallClose(RollCallClose),
    MeetingCreate(MeetingCreate),
    MeetingState(MeetingState),
    MessageWitness(MessageWitness),
    ElectionSetup(ElectionSetup),
    ElectionKey(ElectionKey),
    ElectionOpen(ElectionOpen),
    ElectionCastVote(CastVote),
    ElectionEnd(ElectionEnd),
    ChirpAdd(ChirpAdd),
    ChirpDelete(ChirpDelete),
    ChirpNotifyAdd(ChirpNotify),
    ChirpNotifyDelete(ChirpNotify),
    ReactionAdd(ReactionAdd),
    ReactionDelete(ReactionDelete),
    CoinPostTransaction(PostTransaction),
}

fn decode<T: DeserializeOwned>(kind: ActionKind, raw: &[u8]) -> Result<T> {
    serde_json::from_slice(raw).map_err(|e| {
        PopError::invalid_message_field(format!("failed to decode {kind} data")).with_source(e)
    })
}

impl MessageData {
    pub fn parse(table: &ActionTable, raw: &[u8]) -> Result<Self> {
        let header: DataHeader = serde_json::from_slice(raw).map_err(|e| {
            PopError::invalid_message_field("message data has no object#action").with_source(e)
        })?;
        let kind = table
            .resolve(&header.object, &header.action)
            .ok_or_else(|| {
                PopError::invalid_message_field(format!(
                    "unknown object#action {}#{}",
                    header.object, header.action
                ))
            })?;

        Ok(match kind {
            ActionKind::LaoCreate => MessageData::LaoCreate(decode(kind, raw)?),
            ActionKind::LaoGreet => MessageData::LaoGreet(decode(kind, raw)?),
            ActionKind::RollCallCreate => MessageData::RollCallCreate(decode(kind, raw)?),
            ActionKind::RollCallOpen => MessageData::RollCallOpen(decode(kind, raw)?),
            ActionKind::RollCallReopen => MessageData::RollCallReopen(decode(kind, raw)?),
            ActionKind::RollCallClose => MessageData::RollCallClose(decode(kind, raw)?),
            ActionKind::MeetingCreate => MessageData::MeetingCreate(decode(kind, raw)?),
            ActionKind::MeetingState => MessageData::MeetingState(decode(kind, raw)?),
            ActionKind::MessageWitness => MessageData::MessageWitness(decode(kind, raw)?),
            ActionKind::ElectionSetup => MessageData::ElectionSetup(decode(kind, raw)?),
            ActionKind::ElectionKey => MessageData::ElectionKey(decode(kind, raw)?),
            ActionKind::ElectionOpen => MessageData::ElectionOpen(decode(kind, raw)?),
            ActionKind::ElectionCastVote => MessageData::ElectionCastVote(decode(kind, raw)?),
            ActionKind::ElectionEnd => MessageData::ElectionEnd(decode(kind, raw)?),
            ActionKind::ChirpAdd => MessageData::ChirpAdd(decode(kind, raw)?),
            ActionKind::ChirpDelete => MessageData::ChirpDelete(decode(kind, raw)?),
            ActionKind::ChirpNotifyAdd => MessageData::ChirpNotifyAdd(decode(kind, raw)?),
            ActionKind::ChirpNotifyDelete => MessageData::ChirpNotifyDelete(decode(kind, raw)?),
            ActionKind::ReactionAdd => MessageData::ReactionAdd(decode(kind, raw)?),
            ActionKind::ReactionDelete => MessageData::ReactionDelete(decode(kind, raw)?),
            ActionKind::CoinPostTransaction => {
                MessageData::CoinPostTransaction(decode(kind, raw)?)
            }
        })
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            MessageData::LaoCreate(_) => ActionKind::LaoCreate,
            MessageData::LaoGreet(_) => ActionKind::LaoGreet,
            MessageData::RollCallCreate(_) => ActionKind::RollCallCreate,
            MessageData::RollCallOpen(_) => ActionKind::RollCallOpen,
            MessageData::RollCallReopen(_) => ActionKind::RollCallReopen,
            MessageData::RollCallClose(_) => ActionKind::RollCallClose,
            MessageData::MeetingCreate(_) => ActionKind::MeetingCreate,
            MessageData::MeetingState(_) => ActionKind::MeetingState,
            MessageData::MessageWitness(_) => ActionKind::MessageWitness,
            MessageData::ElectionSetup(_) => ActionKind::ElectionSetup,
            MessageData::ElectionKey(_) => ActionKind::ElectionKey,
            MessageData::ElectionOpen(_) => ActionKind::ElectionOpen,
            MessageData::ElectionCastVote(_) => ActionKind::ElectionCastVote,
            MessageData::ElectionEnd(_) => ActionKind::ElectionEnd,
            MessageData::ChirpAdd(_) => ActionKind::ChirpAdd,
            MessageData::ChirpDelete(_) => ActionKind::ChirpDelete,
            MessageData::ChirpNotifyAdd(_) => ActionKind::ChirpNotifyAdd,
            MessageData::ChirpNotifyDelete(_) => ActionKind::ChirpNotifyDelete,
            MessageData::ReactionAdd(_) => ActionKind::ReactionAdd,
            MessageData::ReactionDelete(_) => ActionKind::ReactionDelete,
            MessageData::CoinPostTransaction(_) => ActionKind::CoinPostTransaction,
        }
    }
}

/// Serialize `payload` with its `object` and `action` fields filled in.
pub fn encode_data<T: Serialize>(kind: ActionKind, payload: &T) -> Result<Vec<u8>> {
    let mut value = serde_json::to_value(payload)?;
    let map = value
        .as_object_mut()
        .ok_or_else(|| PopError::internal("message data must be a JSON object"))?;
    map.insert("object".to_string(), kind.object().into());
    map.insert("action".to_string(), kind.action().into());
    Ok(serde_json::to_vec(&value)?)
}
