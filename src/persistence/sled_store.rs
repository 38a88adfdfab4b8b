//! Durable state backed by `sled`.
//!
//! One tree per concern:
//! - `messages`: message id -> `StoredMessage`
//! - `inbox`: `<channel>\0<seq>` -> `InboxEntry`, scanned for catchup in
//!   receipt order
//! - `channels`: path -> `ChannelRecord`
//! - `state`: topic-handler key/value state (JSON)
//! - `rumors`: origin server id -> last accepted rumor id
//! - `rumor_log`: `<origin>\0<rumor id>` -> `Rumor`, replayed to peers that
//!   fell behind
//! - `my_rumor`: the local rumor being filled and the next local rumor id
//! - `unprocessed`: `<channel>\0<message id>` -> `ParkedMessage`
//! - `keys`: the server's own secret key
//!
//! Every write a dispatch causes goes through `apply`, which runs as a
//! single multi-tree transaction.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionalTree, abort};
use sled::{Db, Transactional, Tree};

use crate::channel::{ChannelType, ROOT};
use crate::gossip::Rumor;
use crate::message::{Keypair, Message};
use crate::persistence::changeset::{ChannelRecord, Changeset};
use crate::utils::{PopError, Result};

const SERVER_SECRET_KEY: &[u8] = b"server_secret";
const MY_RUMOR_PENDING: &[u8] = b"pending";
const MY_RUMOR_NEXT_ID: &[u8] = b"next_id";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub message: Message,
    /// Channel the message was first stored on.
    pub channel: String,
    pub base: bool,
    /// Receipt time in milliseconds.
    pub stored_at: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct InboxEntry {
    message_id: String,
    base: bool,
    stored_at: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ParkedMessage {
    pub channel: String,
    pub message: Message,
    pub attempts: u32,
    pub abandoned: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
struct PendingRumor {
    messages: BTreeMap<String, Vec<Message>>,
}

impl PendingRumor {
    fn len(&self) -> usize {
        self.messages.values().map(Vec::len).sum()
    }
}

#[derive(Clone)]
pub struct Store {
    db: Db,
    messages: Tree,
    inbox: Tree,
    channels: Tree,
    state: Tree,
    rumors: Tree,
    rumor_log: Tree,
    my_rumor: Tree,
    unprocessed: Tree,
    keys: Tree,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("db", &"sled::Db").finish()
    }
}

fn channel_key(channel: &str, suffix: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(channel.len() + 1 + suffix.len());
    key.extend_from_slice(channel.as_bytes());
    key.push(0);
    key.extend_from_slice(suffix);
    key
}

fn channel_prefix(channel: &str) -> Vec<u8> {
    channel_key(channel, &[])
}

fn channel_from_key(key: &[u8]) -> Option<String> {
    let end = key.iter().position(|b| *b == 0)?;
    String::from_utf8(key[..end].to_vec()).ok()
}

fn decode_u64(bytes: &[u8]) -> Result<u64> {
    let array: [u8; 8] = bytes
        .try_into()
        .map_err(|_| PopError::internal("corrupt counter in store"))?;
    Ok(u64::from_be_bytes(array))
}

fn abort_with<T>(
    err: impl Into<PopError>,
) -> std::result::Result<T, ConflictableTransactionError<PopError>> {
    abort(err.into())
}

/// Next rumor id expected from an origin whose last accepted id is `last`.
fn rumor_is_next(last: Option<u64>, rumor_id: u64) -> bool {
    match last {
        None => rumor_id == 0,
        Some(last) => last.checked_add(1) == Some(rumor_id),
    }
}

impl Store {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_db(sled::open(path)?)
    }

    /// An in-memory database removed on drop.
    pub fn temporary() -> Result<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> Result<Self> {
        let store = Self {
            messages: db.open_tree("messages")?,
            inbox: db.open_tree("inbox")?,
            channels: db.open_tree("channels")?,
            state: db.open_tree("state")?,
            rumors: db.open_tree("rumors")?,
            rumor_log: db.open_tree("rumor_log")?,
            my_rumor: db.open_tree("my_rumor")?,
            unprocessed: db.open_tree("unprocessed")?,
            keys: db.open_tree("keys")?,
            db,
        };
        store.ensure_root()?;
        Ok(store)
    }

    fn ensure_root(&self) -> Result<()> {
        if !self.has_channel(ROOT)? {
            self.add_channel(ROOT, ChannelType::Root, ROOT)?;
        }
        Ok(())
    }

    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }

    // ---- messages ----

    pub fn has_message(&self, message_id: &str) -> Result<bool> {
        Ok(self.messages.contains_key(message_id.as_bytes())?)
    }

    pub fn get_message(&self, message_id: &str) -> Result<Option<StoredMessage>> {
        match self.messages.get(message_id.as_bytes())? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Store a client message on `channel` with no other side effect.
    pub fn store_message_and_data(&self, channel: &str, message: &Message) -> Result<()> {
        let mut changeset = Changeset::new();
        changeset.stage_trigger(channel, message.clone());
        self.apply(&changeset)
    }

    /// Commit every write of `changeset` atomically.
    ///
    /// Fails with `DuplicateResource` if a staged message was already stored
    /// or a staged channel already exists; nothing is written in that case.
    pub fn apply(&self, changeset: &Changeset) -> Result<()> {
        let now = Utc::now().timestamp_millis();

        let mut messages = Vec::with_capacity(changeset.messages.len());
        for staged in &changeset.messages {
            let stored = serde_json::to_vec(&StoredMessage {
                message: staged.message.clone(),
                channel: staged.channel.clone(),
                base: staged.base,
                stored_at: now,
            })?;
            let entry = serde_json::to_vec(&InboxEntry {
                message_id: staged.message.message_id.clone(),
                base: staged.base,
                stored_at: now,
            })?;
            let inbox_key = channel_key(&staged.channel, &self.db.generate_id()?.to_be_bytes());
            messages.push((staged, stored, inbox_key, entry));
        }

        let mut channels = Vec::with_capacity(changeset.channels.len());
        for (path, record) in &changeset.channels {
            channels.push((path.as_str(), serde_json::to_vec(record)?));
        }

        (
            &self.messages,
            &self.inbox,
            &self.channels,
            &self.state,
            &self.unprocessed,
        )
            .transaction(|(tx_messages, tx_inbox, tx_channels, tx_state, tx_unprocessed)| {
                let mut written = HashSet::new();
                for (staged, stored, inbox_key, entry) in &messages {
                    let id = staged.message.message_id.as_str();
                    let first_copy = written.insert(id);
                    if first_copy {
                        if tx_messages.get(id.as_bytes())?.is_some() {
                            return abort_with(PopError::duplicate_resource(format!(
                                "message {id} already stored"
                            )));
                        }
                        tx_messages.insert(id.as_bytes(), stored.as_slice())?;
                    }
                    tx_inbox.insert(inbox_key.as_slice(), entry.as_slice())?;
                    if staged.base {
                        tx_unprocessed.remove(channel_key(&staged.channel, id.as_bytes()))?;
                    }
                }

                for (path, record) in &channels {
                    if tx_channels.get(path.as_bytes())?.is_some() {
                        return abort_with(PopError::duplicate_resource(format!(
                            "channel {path} already exists"
                        )));
                    }
                    tx_channels.insert(path.as_bytes(), record.as_slice())?;
                }

                for (key, value) in &changeset.state {
                    tx_state.insert(key.as_bytes(), value.as_slice())?;
                }
                Ok(())
            })?;
        Ok(())
    }

    /// Every message of `channel`, base and derived, in receipt order.
    pub fn get_all_messages_from_channel(&self, channel: &str) -> Result<Vec<Message>> {
        let mut result = Vec::new();
        for item in self.inbox.scan_prefix(channel_prefix(channel)) {
            let (_, raw) = item?;
            let entry: InboxEntry = serde_json::from_slice(&raw)?;
            if let Some(stored) = self.get_message(&entry.message_id)? {
                result.push(stored.message);
            }
        }
        Ok(result)
    }

    // ---- channels ----

    pub fn has_channel(&self, path: &str) -> Result<bool> {
        Ok(self.channels.contains_key(path.as_bytes())?)
    }

    pub fn get_channel(&self, path: &str) -> Result<Option<ChannelRecord>> {
        match self.channels.get(path.as_bytes())? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn get_channel_type(&self, path: &str) -> Result<ChannelType> {
        self.get_channel(path)?
            .map(|record| record.kind)
            .ok_or_else(|| PopError::invalid_resource(format!("channel {path} does not exist")))
    }

    pub fn add_channel(&self, path: &str, kind: ChannelType, lao: &str) -> Result<()> {
        let record = serde_json::to_vec(&ChannelRecord {
            kind,
            lao: lao.to_string(),
        })?;
        self.channels.insert(path.as_bytes(), record)?;
        Ok(())
    }

    pub fn all_channels(&self) -> Result<Vec<(String, ChannelRecord)>> {
        let mut result = Vec::new();
        for item in self.channels.iter() {
            let (key, raw) = item?;
            let path = String::from_utf8(key.to_vec())
                .map_err(|e| PopError::internal("corrupt channel path").with_source(e))?;
            result.push((path, serde_json::from_slice(&raw)?));
        }
        Ok(result)
    }

    // ---- topic state ----

    pub fn get_state<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.state.get(key.as_bytes())? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    // ---- rumors ----

    /// Last rumor id accepted from `origin`.
    pub fn last_rumor_id(&self, origin: &str) -> Result<Option<u64>> {
        match self.rumors.get(origin.as_bytes())? {
            Some(raw) => Ok(Some(decode_u64(&raw)?)),
            None => Ok(None),
        }
    }

    /// True if `rumor_id` is exactly the next id expected from `origin`.
    pub fn check_rumor(&self, origin: &str, rumor_id: u64) -> Result<bool> {
        Ok(rumor_is_next(self.last_rumor_id(origin)?, rumor_id))
    }

    /// Accept `rumor` in one transaction: check and advance its origin's
    /// counter, log it, and park every message it carries that is not stored
    /// yet. Replay clears the parked copies as it applies them, so a rumor
    /// interrupted halfway is resumed from the parked set.
    ///
    /// Anything but the next expected id is a `DuplicateResource`.
    pub fn store_rumor(&self, rumor: &Rumor) -> Result<()> {
        let logged = serde_json::to_vec(rumor)?;
        let log_key = channel_key(&rumor.sender_id, &rumor.rumor_id.to_be_bytes());
        let mut parked = Vec::with_capacity(rumor.len());
        for (channel, messages) in &rumor.messages {
            for message in messages {
                let record = serde_json::to_vec(&ParkedMessage {
                    channel: channel.clone(),
                    message: message.clone(),
                    attempts: 0,
                    abandoned: false,
                })?;
                let key = channel_key(channel, message.message_id.as_bytes());
                parked.push((message.message_id.as_str(), key, record));
            }
        }

        (
            &self.rumors,
            &self.rumor_log,
            &self.messages,
            &self.unprocessed,
        )
            .transaction(|(tx_rumors, tx_log, tx_messages, tx_unprocessed)| {
                tx_log.insert(log_key.as_slice(), logged.as_slice())?;
                for (id, key, record) in &parked {
                    if tx_messages.get(id.as_bytes())?.is_none()
                        && tx_unprocessed.get(key.as_slice())?.is_none()
                    {
                        tx_unprocessed.insert(key.as_slice(), record.as_slice())?;
                    }
                }
                // aborts the whole intake when the rumor is out of sequence
                record_rumor(tx_rumors, &rumor.sender_id, rumor.rumor_id)
            })?;
        Ok(())
    }

    /// Last accepted rumor id per origin, our own included.
    pub fn get_rumor_state(&self) -> Result<BTreeMap<String, u64>> {
        let mut state = BTreeMap::new();
        for item in self.rumors.iter() {
            let (key, raw) = item?;
            let origin = String::from_utf8(key.to_vec())
                .map_err(|e| PopError::internal("corrupt rumor origin").with_source(e))?;
            state.insert(origin, decode_u64(&raw)?);
        }
        Ok(state)
    }

    /// Logged rumors a peer at `peer_state` has not accepted yet, grouped by
    /// origin in increasing rumor id order.
    pub fn get_rumors_after(&self, peer_state: &BTreeMap<String, u64>) -> Result<Vec<Rumor>> {
        let mut missing = Vec::new();
        for (origin, _) in self.get_rumor_state()? {
            let first = match peer_state.get(&origin) {
                Some(last) => match last.checked_add(1) {
                    Some(next) => next,
                    None => continue,
                },
                None => 0,
            };
            let prefix = channel_prefix(&origin);
            let start = channel_key(&origin, &first.to_be_bytes());
            for item in self.rumor_log.range(start..) {
                let (key, raw) = item?;
                if !key.starts_with(&prefix) {
                    break;
                }
                missing.push(serde_json::from_slice(&raw)?);
            }
        }
        Ok(missing)
    }

    /// Append a locally accepted message to the rumor being filled; returns
    /// how many messages it now holds.
    pub fn add_message_to_my_rumor(&self, channel: &str, message: &Message) -> Result<usize> {
        let count = self.my_rumor.transaction(|tx| {
            let mut pending: PendingRumor = match tx.get(MY_RUMOR_PENDING)? {
                Some(raw) => match serde_json::from_slice(&raw) {
                    Ok(pending) => pending,
                    Err(e) => return abort_with(e),
                },
                None => PendingRumor::default(),
            };
            pending
                .messages
                .entry(channel.to_string())
                .or_default()
                .push(message.clone());
            let raw = match serde_json::to_vec(&pending) {
                Ok(raw) => raw,
                Err(e) => return abort_with(e),
            };
            tx.insert(MY_RUMOR_PENDING, raw)?;
            Ok(pending.len())
        })?;
        Ok(count)
    }

    /// Cut the rumor being filled: assign it the next local rumor id, record
    /// that id as accepted from ourselves and start an empty one. `None` when
    /// there is nothing to send.
    pub fn get_and_increment_my_rumor(&self, server_id: &str) -> Result<Option<Rumor>> {
        let rumor = (&self.my_rumor, &self.rumors, &self.rumor_log).transaction(
            |(tx_mine, tx_rumors, tx_log)| {
                let pending: PendingRumor = match tx_mine.get(MY_RUMOR_PENDING)? {
                    Some(raw) => match serde_json::from_slice(&raw) {
                        Ok(pending) => pending,
                        Err(e) => return abort_with(e),
                    },
                    None => return Ok(None),
                };
                if pending.messages.is_empty() {
                    return Ok(None);
                }
                let rumor_id = match tx_mine.get(MY_RUMOR_NEXT_ID)? {
                    Some(raw) => match decode_u64(&raw) {
                        Ok(id) => id,
                        Err(e) => return abort_with(e),
                    },
                    None => 0,
                };

                record_rumor(tx_rumors, server_id, rumor_id)?;
                tx_mine.insert(MY_RUMOR_NEXT_ID, (rumor_id + 1).to_be_bytes().to_vec())?;
                tx_mine.remove(MY_RUMOR_PENDING)?;

                let rumor = Rumor {
                    sender_id: server_id.to_string(),
                    rumor_id,
                    messages: pending.messages,
                };
                let logged = match serde_json::to_vec(&rumor) {
                    Ok(logged) => logged,
                    Err(e) => return abort_with(e),
                };
                tx_log.insert(channel_key(server_id, &rumor_id.to_be_bytes()), logged)?;
                Ok(Some(rumor))
            },
        )?;
        Ok(rumor)
    }

    // ---- unprocessed ----

    /// Park a message that could not be dispatched yet. Parking the same
    /// message twice keeps the first record and its attempt counter.
    pub fn park_unprocessed(&self, channel: &str, message: &Message) -> Result<()> {
        let parked = serde_json::to_vec(&ParkedMessage {
            channel: channel.to_string(),
            message: message.clone(),
            attempts: 0,
            abandoned: false,
        })?;
        let key = channel_key(channel, message.message_id.as_bytes());
        let _ = self
            .unprocessed
            .compare_and_swap(key, None as Option<&[u8]>, Some(parked))?;
        Ok(())
    }

    pub fn get_parked(&self, channel: &str, message_id: &str) -> Result<Option<ParkedMessage>> {
        match self.unprocessed.get(channel_key(channel, message_id.as_bytes()))? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Drop a parked message that turned out to be stored already.
    pub fn discard_parked(&self, channel: &str, message_id: &str) -> Result<()> {
        self.unprocessed
            .remove(channel_key(channel, message_id.as_bytes()))?;
        Ok(())
    }

    /// Parked messages still eligible for retry, grouped by channel.
    pub fn get_unprocessed_messages_by_channel(&self) -> Result<BTreeMap<String, Vec<Message>>> {
        let mut result: BTreeMap<String, Vec<Message>> = BTreeMap::new();
        for item in self.unprocessed.iter() {
            let (_, raw) = item?;
            let parked: ParkedMessage = serde_json::from_slice(&raw)?;
            if !parked.abandoned {
                result.entry(parked.channel).or_default().push(parked.message);
            }
        }
        Ok(result)
    }

    /// Count one more failed retry. Returns true once the message has used up
    /// `max_attempts` and is no longer retried.
    pub fn record_unprocessed_failure(
        &self,
        channel: &str,
        message_id: &str,
        max_attempts: u32,
    ) -> Result<bool> {
        let key = channel_key(channel, message_id.as_bytes());
        let abandoned = self.unprocessed.transaction(|tx| {
            let Some(raw) = tx.get(&key)? else {
                return Ok(false);
            };
            let mut parked: ParkedMessage = match serde_json::from_slice(&raw) {
                Ok(parked) => parked,
                Err(e) => return abort_with(e),
            };
            parked.attempts = parked.attempts.saturating_add(1);
            parked.abandoned = parked.attempts >= max_attempts;
            let raw = match serde_json::to_vec(&parked) {
                Ok(raw) => raw,
                Err(e) => return abort_with(e),
            };
            tx.insert(key.as_slice(), raw)?;
            Ok(parked.abandoned)
        })?;
        Ok(abandoned)
    }

    // ---- heartbeats ----

    /// Base message ids held per channel.
    pub fn get_params_heartbeat(&self) -> Result<BTreeMap<String, Vec<String>>> {
        let mut result: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for item in self.inbox.iter() {
            let (key, raw) = item?;
            let entry: InboxEntry = serde_json::from_slice(&raw)?;
            if !entry.base {
                continue;
            }
            if let Some(channel) = channel_from_key(&key) {
                result.entry(channel).or_default().push(entry.message_id);
            }
        }
        Ok(result)
    }

    /// The subset of `advertised` ids this store does not hold yet.
    pub fn get_params_for_get_messages_by_id(
        &self,
        advertised: &BTreeMap<String, Vec<String>>,
    ) -> Result<BTreeMap<String, Vec<String>>> {
        let mut missing = BTreeMap::new();
        for (channel, ids) in advertised {
            let mut absent = Vec::new();
            for id in ids {
                if !self.has_message(id)? {
                    absent.push(id.clone());
                }
            }
            if !absent.is_empty() {
                missing.insert(channel.clone(), absent);
            }
        }
        Ok(missing)
    }

    /// Base messages matching `requested`, grouped by channel. Unknown ids
    /// and derived messages are skipped.
    pub fn get_messages_by_id(
        &self,
        requested: &BTreeMap<String, Vec<String>>,
    ) -> Result<BTreeMap<String, Vec<Message>>> {
        let mut result: BTreeMap<String, Vec<Message>> = BTreeMap::new();
        for (channel, ids) in requested {
            for id in ids {
                match self.get_message(id)? {
                    Some(stored) if stored.base && &stored.channel == channel => {
                        result.entry(channel.clone()).or_default().push(stored.message);
                    }
                    _ => {}
                }
            }
        }
        Ok(result)
    }

    // ---- keys ----

    /// The server's keypair, generated and persisted on first use.
    pub fn server_keypair(&self) -> Result<Keypair> {
        if let Some(raw) = self.keys.get(SERVER_SECRET_KEY)? {
            return Keypair::from_secret_bytes(&raw);
        }
        let fresh = Keypair::generate();
        let secret = fresh.secret_bytes();
        match self.keys.compare_and_swap(
            SERVER_SECRET_KEY,
            None as Option<&[u8]>,
            Some(&secret[..]),
        )? {
            Ok(()) => Ok(fresh),
            // another caller won the race
            Err(conflict) => match conflict.current {
                Some(raw) => Keypair::from_secret_bytes(&raw),
                None => Err(PopError::internal("server key vanished during creation")),
            },
        }
    }
}

fn record_rumor(
    tx: &TransactionalTree,
    origin: &str,
    rumor_id: u64,
) -> std::result::Result<(), ConflictableTransactionError<PopError>> {
    let last = match tx.get(origin.as_bytes())? {
        Some(raw) => match decode_u64(&raw) {
            Ok(last) => Some(last),
            Err(e) => return abort(e),
        },
        None => None,
    };
    if !rumor_is_next(last, rumor_id) {
        return abort(PopError::duplicate_resource(format!(
            "rumor {rumor_id} from {origin} is not the next expected"
        )));
    }
    tx.insert(origin.as_bytes(), rumor_id.to_be_bytes().to_vec())?;
    Ok(())
}
