//! Shallow-first grouped dispatch of messages learned from other servers.
//!
//! A batch (the content of a rumor or of a `get_messages_by_id` answer) is
//! grouped by channel and the groups are tried parents first: `/root` before
//! `/root/<lao>` before `/root/<lao>/social/<key>`. Whatever still fails after
//! the last pass is parked in the store and retried when later batches land.
//! Rumor content is parked before the first pass (see `Store::store_rumor`),
//! so `retry_parked` at startup finishes a rumor cut short by a crash.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::channel::{DeliveryMode, Dispatcher, Outcome, depth};
use crate::message::Message;
use crate::persistence::Store;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayReport {
    pub applied: usize,
    pub already_known: usize,
    pub parked: usize,
    pub abandoned: usize,
}

impl ReplayReport {
    pub(crate) fn absorb(&mut self, other: ReplayReport) {
        self.applied += other.applied;
        self.already_known += other.already_known;
        self.parked += other.parked;
        self.abandoned += other.abandoned;
    }
}

type Groups = Vec<(String, Vec<Message>)>;

fn into_groups(batch: BTreeMap<String, Vec<Message>>) -> Groups {
    let mut groups: Groups = batch
        .into_iter()
        .filter(|(_, messages)| !messages.is_empty())
        .collect();
    groups.sort_by(|(a, _), (b, _)| depth(a).cmp(&depth(b)).then_with(|| a.cmp(b)));
    groups
}

pub struct Replayer {
    dispatcher: Arc<Dispatcher>,
    store: Store,
    max_passes: usize,
    max_attempts: u32,
}

impl Replayer {
    pub fn new(dispatcher: Arc<Dispatcher>, max_passes: usize, max_attempts: u32) -> Self {
        Self {
            store: dispatcher.store().clone(),
            dispatcher,
            max_passes: max_passes.max(1),
            max_attempts,
        }
    }

    /// Drop the parked copy of a message that turned out to be stored already.
    fn discard(&self, channel: &str, message_id: &str) {
        if let Err(e) = self.store.discard_parked(channel, message_id) {
            tracing::error!(channel, message_id, error = %e, "failed to discard parked message");
        }
    }

    /// One grouped pass; failed messages stay in their group.
    fn pass(&self, groups: &mut Groups, report: &mut ReplayReport) -> bool {
        let mut progress = false;
        for (channel, messages) in groups.iter_mut() {
            let mut remaining = Vec::new();
            for message in messages.drain(..) {
                match self.dispatcher.dispatch(channel, &message, DeliveryMode::Replay) {
                    Ok(Outcome::Applied) => {
                        report.applied += 1;
                        progress = true;
                    }
                    Ok(Outcome::AlreadyKnown) => {
                        report.already_known += 1;
                        progress = true;
                        self.discard(channel, &message.message_id);
                    }
                    Err(e) => {
                        tracing::debug!(
                            channel = %channel,
                            message_id = %message.message_id,
                            error = %e,
                            "replay deferred"
                        );
                        remaining.push(message);
                    }
                }
            }
            *messages = remaining;
        }
        groups.retain(|(_, messages)| !messages.is_empty());
        progress
    }

    /// Dispatch `batch` in up to `max_passes` passes, park the leftovers, then
    /// give every parked message one more try.
    pub fn process(&self, batch: BTreeMap<String, Vec<Message>>) -> ReplayReport {
        let mut groups = into_groups(batch);
        let mut report = ReplayReport::default();

        for _ in 0..self.max_passes {
            if groups.is_empty() || !self.pass(&mut groups, &mut report) {
                break;
            }
        }

        for (channel, messages) in &groups {
            for message in messages {
                match self.store.park_unprocessed(channel, message) {
                    Ok(()) => {
                        report.parked += 1;
                        tracing::warn!(
                            channel = %channel,
                            message_id = %message.message_id,
                            "message parked as unprocessed"
                        );
                    }
                    Err(e) => tracing::error!(
                        channel = %channel,
                        message_id = %message.message_id,
                        error = %e,
                        "failed to park message"
                    ),
                }
            }
        }

        report.absorb(self.retry_parked());
        report
    }

    /// One grouped pass over every parked message. Each failure uses up one
    /// attempt of the message's retry budget.
    pub fn retry_parked(&self) -> ReplayReport {
        let mut report = ReplayReport::default();
        let parked = match self.store.get_unprocessed_messages_by_channel() {
            Ok(parked) => parked,
            Err(e) => {
                tracing::error!(error = %e, "failed to load unprocessed messages");
                return report;
            }
        };

        for (channel, messages) in into_groups(parked) {
            for message in messages {
                let id = &message.message_id;
                match self.dispatcher.dispatch(&channel, &message, DeliveryMode::Replay) {
                    // applying a message clears its parked copy
                    Ok(Outcome::Applied) => report.applied += 1,
                    Ok(Outcome::AlreadyKnown) => {
                        report.already_known += 1;
                        self.discard(&channel, id);
                    }
                    Err(err) => {
                        match self
                            .store
                            .record_unprocessed_failure(&channel, id, self.max_attempts)
                        {
                            Ok(true) => {
                                report.abandoned += 1;
                                tracing::warn!(
                                    channel = %channel,
                                    message_id = %id,
                                    error = %err,
                                    "giving up on unprocessed message"
                                );
                            }
                            Ok(false) => {}
                            Err(e) => tracing::error!(channel = %channel, message_id = %id, error = %e, "failed to count retry"),
                        }
                    }
                }
            }
        }

        if report.applied > 0 {
            tracing::info!(applied = report.applied, "resolved unprocessed messages");
        }
        report
    }
}
