//! Social media channels of a LAO.
//!
//! - `<lao>/social/<attendee>`: the attendee's own chirps
//! - `<lao>/social/posts`: server announcements of every chirp, read-only
//! - `<lao>/social/reactions`: reactions to chirps

use serde::{Deserialize, Serialize};

use crate::channel::dispatcher::{ChannelHandler, HandlerContext, unsupported};
use crate::channel::lao::attendees;
use crate::channel::{ChannelType, lao_of, posts_channel};
use crate::message::data::{ActionKind, ChirpNotify};
use crate::message::{Message, MessageData};
use crate::persistence::Changeset;
use crate::utils::{PopError, Result};

pub const MAX_CHIRP_CHARS: usize = 300;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChirpState {
    pub channel: String,
    pub sender: String,
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionState {
    pub sender: String,
    pub deleted: bool,
}

fn chirp_key(chirp_id: &str) -> String {
    format!("chirp:{chirp_id}")
}

fn reaction_key(reaction_id: &str) -> String {
    format!("reaction:{reaction_id}")
}

fn lao_path(channel: &str) -> Result<String> {
    lao_of(channel).ok_or_else(|| PopError::invalid_resource(format!("{channel} is not under a lao")))
}

pub struct ChirpHandler;

impl ChannelHandler for ChirpHandler {
    fn handle(
        &self,
        ctx: &HandlerContext<'_>,
        channel: &str,
        message: &Message,
        data: MessageData,
    ) -> Result<Changeset> {
        let owner = channel.rsplit('/').next().unwrap_or_default();
        if message.sender != owner {
            return Err(PopError::access_denied(
                "only the owner of a chirp channel may post on it",
            ));
        }
        let lao = lao_path(channel)?;

        let (kind, chirp_id, timestamp, state) = match data {
            MessageData::ChirpAdd(add) => {
                if add.text.chars().count() > MAX_CHIRP_CHARS {
                    return Err(PopError::invalid_message_field(format!(
                        "chirp text exceeds {MAX_CHIRP_CHARS} characters"
                    )));
                }
                let state = ChirpState {
                    channel: channel.to_string(),
                    sender: message.sender.clone(),
                    deleted: false,
                };
                (ActionKind::ChirpNotifyAdd, message.message_id.clone(), add.timestamp, state)
            }
            MessageData::ChirpDelete(delete) => {
                let mut state: ChirpState = ctx
                    .store
                    .get_state(&chirp_key(&delete.chirp_id))?
                    .ok_or_else(|| {
                        PopError::invalid_resource(format!("chirp {} does not exist", delete.chirp_id))
                    })?;
                if state.channel != channel || state.sender != message.sender {
                    return Err(PopError::access_denied("only the author may delete a chirp"));
                }
                if state.deleted {
                    return Err(PopError::invalid_action("chirp is already deleted"));
                }
                state.deleted = true;
                (ActionKind::ChirpNotifyDelete, delete.chirp_id, delete.timestamp, state)
            }
            other => return Err(unsupported(ChannelType::Chirp, &other)),
        };

        let mut changeset = Changeset::new();
        changeset.set_state(chirp_key(&chirp_id), &state)?;
        let notify = ChirpNotify {
            chirp_id,
            channel: channel.to_string(),
            timestamp,
        };
        changeset.stage_message(&posts_channel(&lao), ctx.derive(kind, &notify)?, false);
        Ok(changeset)
    }
}

/// Only servers write to the posts channel.
pub struct PostsHandler;

impl ChannelHandler for PostsHandler {
    fn handle(
        &self,
        _ctx: &HandlerContext<'_>,
        channel: &str,
        _message: &Message,
        _data: MessageData,
    ) -> Result<Changeset> {
        Err(PopError::invalid_action(format!("{channel} is read-only")))
    }
}

pub struct ReactionHandler;

impl ChannelHandler for ReactionHandler {
    fn handle(
        &self,
        ctx: &HandlerContext<'_>,
        channel: &str,
        message: &Message,
        data: MessageData,
    ) -> Result<Changeset> {
        let lao = lao_path(channel)?;
        if !attendees(ctx.store, &lao)?.contains(&message.sender) {
            return Err(PopError::access_denied(
                "only attendees of the last roll call may react",
            ));
        }

        let mut changeset = Changeset::new();
        match data {
            MessageData::ReactionAdd(add) => {
                let chirp: Option<ChirpState> = ctx.store.get_state(&chirp_key(&add.chirp_id))?;
                if !chirp.is_some_and(|chirp| !chirp.deleted) {
                    return Err(PopError::invalid_resource(format!(
                        "chirp {} does not exist",
                        add.chirp_id
                    )));
                }
                changeset.set_state(
                    reaction_key(&message.message_id),
                    &ReactionState {
                        sender: message.sender.clone(),
                        deleted: false,
                    },
                )?;
            }
            MessageData::ReactionDelete(delete) => {
                let mut state: ReactionState = ctx
                    .store
                    .get_state(&reaction_key(&delete.reaction_id))?
                    .ok_or_else(|| {
                        PopError::invalid_resource(format!(
                            "reaction {} does not exist",
                            delete.reaction_id
                        ))
                    })?;
                if state.sender != message.sender {
                    return Err(PopError::access_denied("only the author may delete a reaction"));
                }
                if state.deleted {
                    return Err(PopError::invalid_action("reaction is already deleted"));
                }
                state.deleted = true;
                changeset.set_state(reaction_key(&delete.reaction_id), &state)?;
            }
            other => return Err(unsupported(ChannelType::Reaction, &other)),
        }
        Ok(changeset)
    }
}
