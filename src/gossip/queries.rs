use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::gossip::Rumor;

/// An outbound query still waiting for its answer.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingQuery {
    Rumor { rumor: Rumor, peer: String },
    GetMessagesById { peer: String },
    RumorState { peer: String },
}

impl PendingQuery {
    pub fn peer(&self) -> &str {
        match self {
            PendingQuery::Rumor { peer, .. }
            | PendingQuery::GetMessagesById { peer }
            | PendingQuery::RumorState { peer } => peer,
        }
    }
}

/// Query ids handed out by this server and what each one was for.
///
/// Ids are unique for the lifetime of the process. An answer only claims a
/// query if it arrives on the socket the query was sent to.
#[derive(Debug, Default)]
pub struct PendingQueries {
    next_id: AtomicI64,
    pending: Mutex<HashMap<i64, PendingQuery>>,
}

impl PendingQueries {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<i64, PendingQuery>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate an id for `query` and remember it until the answer comes.
    pub fn register(&self, query: PendingQuery) -> i64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(id, query);
        id
    }

    /// Claim the query answered by `id`. A second answer finds nothing.
    pub fn take(&self, id: i64) -> Option<PendingQuery> {
        self.lock().remove(&id)
    }

    /// Like `take`, but leaves the query pending unless it was sent to `peer`.
    pub fn take_from(&self, id: i64, peer: &str) -> Option<PendingQuery> {
        let mut pending = self.lock();
        match pending.get(&id) {
            Some(query) if query.peer() == peer => pending.remove(&id),
            _ => None,
        }
    }

    /// Forget every query sent to a socket that went away.
    pub fn drop_peer(&self, peer: &str) -> usize {
        let mut pending = self.lock();
        let before = pending.len();
        pending.retain(|_, query| query.peer() != peer);
        before - pending.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
