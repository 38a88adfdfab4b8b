//! Election channel: open, cast_vote and end, in that order.

use serde::{Deserialize, Serialize};

use crate::channel::dispatcher::{ChannelHandler, HandlerContext, unsupported};
use crate::channel::lao::{attendees, lao_id, load_lao, require_organizer};
use crate::channel::{ChannelType, lao_of};
use crate::message::data::CastVote;
use crate::message::{Message, MessageData};
use crate::persistence::{Changeset, Store};
use crate::utils::{PopError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElectionStatus {
    Setup,
    Open,
    Ended,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElectionState {
    pub status: ElectionStatus,
    pub questions: Vec<String>,
    pub secret: bool,
}

pub fn election_state_key(election: &str) -> String {
    format!("election:{election}")
}

fn load_election(store: &Store, election: &str) -> Result<ElectionState> {
    store
        .get_state(&election_state_key(election))?
        .ok_or_else(|| PopError::invalid_resource(format!("election {election} does not exist")))
}

fn check_ids(channel: &str, lao: &str, lao_field: &str, election_field: &str) -> Result<()> {
    let election_id = channel.rsplit('/').next().unwrap_or_default();
    if lao_field != lao_id(lao) || election_field != election_id {
        return Err(PopError::invalid_message_field(
            "lao or election id does not match the channel",
        ));
    }
    Ok(())
}

fn with_status(mut state: ElectionState, status: ElectionStatus, key: &str) -> Result<Changeset> {
    state.status = status;
    let mut changeset = Changeset::new();
    changeset.set_state(key, &state)?;
    Ok(changeset)
}

pub struct ElectionHandler;

impl ChannelHandler for ElectionHandler {
    fn handle(
        &self,
        ctx: &HandlerContext<'_>,
        channel: &str,
        message: &Message,
        data: MessageData,
    ) -> Result<Changeset> {
        let lao = lao_of(channel)
            .ok_or_else(|| PopError::invalid_resource(format!("{channel} is not under a lao")))?;
        let lao_state = load_lao(ctx.store, &lao)?;
        let state = load_election(ctx.store, channel)?;
        let key = election_state_key(channel);

        match data {
            MessageData::ElectionOpen(open) => {
                require_organizer(&lao_state, message)?;
                check_ids(channel, &lao, &open.lao, &open.election)?;
                if state.status != ElectionStatus::Setup {
                    return Err(PopError::invalid_action("election is not in setup state"));
                }
                with_status(state, ElectionStatus::Open, &key)
            }
            MessageData::ElectionCastVote(vote) => {
                check_ids(channel, &lao, &vote.lao, &vote.election)?;
                cast_vote(ctx.store, &lao, message, &state, &vote)?;
                Ok(Changeset::new())
            }
            MessageData::ElectionEnd(end) => {
                require_organizer(&lao_state, message)?;
                check_ids(channel, &lao, &end.lao, &end.election)?;
                if state.status != ElectionStatus::Open {
                    return Err(PopError::invalid_action("election is not open"));
                }
                with_status(state, ElectionStatus::Ended, &key)
            }
            // election#key only ever comes from the server that ran the setup
            other => Err(unsupported(ChannelType::Election, &other)),
        }
    }
}

fn cast_vote(
    store: &Store,
    lao: &str,
    message: &Message,
    state: &ElectionState,
    vote: &CastVote,
) -> Result<()> {
    if state.status != ElectionStatus::Open {
        return Err(PopError::invalid_action("election is not open"));
    }
    if !attendees(store, lao)?.contains(&message.sender) {
        return Err(PopError::access_denied(
            "sender is not an attendee of the last roll call",
        ));
    }
    for ballot in &vote.votes {
        if !state.questions.contains(&ballot.question) {
            return Err(PopError::invalid_message_field(format!(
                "question {} does not exist",
                ballot.question
            )));
        }
    }
    Ok(())
}
