//! LAO channel: roll calls, meetings, witnessing and election setup.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::channel::dispatcher::{ChannelHandler, HandlerContext, unsupported};
use crate::channel::election::{ElectionState, ElectionStatus, election_state_key};
use crate::channel::{ChannelType, ROOT, chirp_channel};
use crate::message::data::{
    ActionKind, ElectionKey, ElectionSetup, MessageWitness, RollCallClose, RollCallCreate,
    RollCallOpen,
};
use crate::message::{Keypair, Message, MessageData, crypto};
use crate::persistence::{Changeset, Store};
use crate::utils::{PopError, Result};

const ROLL_CALL_FLAG: &str = "R";
const ELECTION_FLAG: &str = "Election";
const OPEN_BALLOT: &str = "OPEN_BALLOT";
const SECRET_BALLOT: &str = "SECRET_BALLOT";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaoState {
    pub organizer: String,
    pub witnesses: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollCallStep {
    Created,
    Opened,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollCallState {
    /// Roll call id after a create, update id after an open/reopen/close.
    pub last_id: String,
    pub step: RollCallStep,
    /// Attendees of the last closed roll call.
    pub attendees: Vec<String>,
}

pub fn lao_state_key(lao: &str) -> String {
    format!("lao:{lao}")
}

fn roll_call_key(lao: &str) -> String {
    format!("roll_call:{lao}")
}

/// The LAO id: its path without the `/root/` prefix.
pub(crate) fn lao_id(lao: &str) -> &str {
    lao.strip_prefix(ROOT)
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or(lao)
}

pub(crate) fn load_lao(store: &Store, lao: &str) -> Result<LaoState> {
    store
        .get_state(&lao_state_key(lao))?
        .ok_or_else(|| PopError::invalid_resource(format!("lao {lao} does not exist")))
}

pub(crate) fn require_organizer(state: &LaoState, message: &Message) -> Result<()> {
    if message.sender != state.organizer {
        return Err(PopError::access_denied(
            "sender public key does not match organizer public key",
        ));
    }
    Ok(())
}

/// Attendees of the LAO's last closed roll call; empty before the first one.
pub(crate) fn attendees(store: &Store, lao: &str) -> Result<Vec<String>> {
    Ok(store
        .get_state::<RollCallState>(&roll_call_key(lao))?
        .map(|state| state.attendees)
        .unwrap_or_default())
}

pub struct LaoHandler;

impl ChannelHandler for LaoHandler {
    fn handle(
        &self,
        ctx: &HandlerContext<'_>,
        channel: &str,
        message: &Message,
        data: MessageData,
    ) -> Result<Changeset> {
        let lao = load_lao(ctx.store, channel)?;

        match data {
            MessageData::RollCallCreate(create) => {
                require_organizer(&lao, message)?;
                roll_call_create(ctx.store, channel, create)
            }
            MessageData::RollCallOpen(open) => {
                require_organizer(&lao, message)?;
                roll_call_open(ctx.store, channel, open, false)
            }
            MessageData::RollCallReopen(open) => {
                require_organizer(&lao, message)?;
                roll_call_open(ctx.store, channel, open, true)
            }
            MessageData::RollCallClose(close) => {
                require_organizer(&lao, message)?;
                roll_call_close(ctx.store, channel, message, close)
            }
            MessageData::ElectionSetup(setup) => {
                require_organizer(&lao, message)?;
                election_setup(ctx, channel, message, setup)
            }
            MessageData::MeetingCreate(_) | MessageData::MeetingState(_) => {
                if message.sender != lao.organizer && !lao.witnesses.contains(&message.sender) {
                    return Err(PopError::access_denied(
                        "only the organizer or a witness may manage meetings",
                    ));
                }
                Ok(Changeset::new())
            }
            MessageData::MessageWitness(witness) => witness_message(ctx.store, message, witness),
            MessageData::LaoGreet(_) => Err(PopError::invalid_action(
                "lao#greet is only created by servers",
            )),
            other => Err(unsupported(ChannelType::Lao, &other)),
        }
    }
}

fn roll_call_create(store: &Store, lao: &str, create: RollCallCreate) -> Result<Changeset> {
    let expected = crypto::hash(&[
        ROLL_CALL_FLAG,
        lao_id(lao),
        &create.creation.to_string(),
        &create.name,
    ]);
    if create.id != expected {
        return Err(PopError::invalid_message_field(format!(
            "roll call id is {}, should be {expected}",
            create.id
        )));
    }
    if create.proposed_end < create.proposed_start {
        return Err(PopError::invalid_message_field(
            "roll call cannot end before it starts",
        ));
    }

    let mut changeset = Changeset::new();
    changeset.set_state(
        roll_call_key(lao),
        &RollCallState {
            last_id: create.id,
            step: RollCallStep::Created,
            attendees: attendees(store, lao)?,
        },
    )?;
    Ok(changeset)
}

fn roll_call_open(store: &Store, lao: &str, open: RollCallOpen, reopen: bool) -> Result<Changeset> {
    let expected = crypto::hash(&[
        ROLL_CALL_FLAG,
        lao_id(lao),
        &open.opens,
        &open.opened_at.to_string(),
    ]);
    if open.update_id != expected {
        return Err(PopError::invalid_message_field(format!(
            "roll call update id is {}, should be {expected}",
            open.update_id
        )));
    }

    let state: Option<RollCallState> = store.get_state(&roll_call_key(lao))?;
    let valid_previous = state.as_ref().is_some_and(|state| {
        state.last_id == open.opens
            && match state.step {
                RollCallStep::Created => !reopen,
                RollCallStep::Closed => true,
                RollCallStep::Opened => false,
            }
    });
    if !valid_previous {
        return Err(PopError::invalid_message_field("previous id does not exist"));
    }

    let mut changeset = Changeset::new();
    changeset.set_state(
        roll_call_key(lao),
        &RollCallState {
            last_id: open.update_id,
            step: RollCallStep::Opened,
            attendees: state.map(|state| state.attendees).unwrap_or_default(),
        },
    )?;
    Ok(changeset)
}

fn roll_call_close(
    store: &Store,
    lao: &str,
    message: &Message,
    close: RollCallClose,
) -> Result<Changeset> {
    let expected = crypto::hash(&[
        ROLL_CALL_FLAG,
        lao_id(lao),
        &close.closes,
        &close.closed_at.to_string(),
    ]);
    if close.update_id != expected {
        return Err(PopError::invalid_message_field(format!(
            "roll call update id is {}, should be {expected}",
            close.update_id
        )));
    }

    let state: Option<RollCallState> = store.get_state(&roll_call_key(lao))?;
    let valid_previous = state
        .as_ref()
        .is_some_and(|state| state.last_id == close.closes && state.step == RollCallStep::Opened);
    if !valid_previous {
        return Err(PopError::invalid_message_field("previous id does not exist"));
    }

    let mut changeset = Changeset::new();
    let mut seen = HashSet::new();
    for attendee in &close.attendees {
        crypto::public_key(attendee)?;
        let path = chirp_channel(lao, attendee);
        if seen.insert(attendee.as_str()) && !store.has_channel(&path)? {
            changeset.add_channel(path, ChannelType::Chirp, lao);
        }
    }
    changeset.set_state(
        roll_call_key(lao),
        &RollCallState {
            last_id: close.update_id,
            step: RollCallStep::Closed,
            attendees: close.attendees,
        },
    )?;

    // the close is persisted by this changeset, not again by the dispatcher
    changeset.stage_message(lao, message.clone(), true);
    changeset.suppress_trigger();
    Ok(changeset)
}

fn election_setup(
    ctx: &HandlerContext<'_>,
    lao: &str,
    message: &Message,
    setup: ElectionSetup,
) -> Result<Changeset> {
    if setup.lao != lao_id(lao) {
        return Err(PopError::invalid_message_field(format!(
            "election lao is {}, should be {}",
            setup.lao,
            lao_id(lao)
        )));
    }
    let expected = crypto::hash(&[
        ELECTION_FLAG,
        lao_id(lao),
        &setup.created_at.to_string(),
        &setup.name,
    ]);
    if setup.id != expected {
        return Err(PopError::invalid_message_field(format!(
            "election id is {}, should be {expected}",
            setup.id
        )));
    }
    if setup.questions.is_empty() {
        return Err(PopError::invalid_message_field("election has no questions"));
    }
    if setup.end_time < setup.start_time {
        return Err(PopError::invalid_message_field(
            "election cannot end before it starts",
        ));
    }
    let secret = match setup.version.as_str() {
        OPEN_BALLOT => false,
        SECRET_BALLOT => true,
        other => {
            return Err(PopError::invalid_message_field(format!(
                "unknown election version {other}"
            )));
        }
    };

    let election = format!("{lao}/{}", setup.id);
    if ctx.store.has_channel(&election)? {
        return Err(PopError::duplicate_resource(format!(
            "election {election} already exists"
        )));
    }

    let mut changeset = Changeset::new();
    changeset.add_channel(election.as_str(), ChannelType::Election, lao);
    changeset.set_state(
        election_state_key(&election),
        &ElectionState {
            status: ElectionStatus::Setup,
            questions: setup.questions.iter().map(|q| q.id.clone()).collect(),
            secret,
        },
    )?;
    changeset.stage_message(&election, message.clone(), false);

    if secret {
        let key = ElectionKey {
            election: setup.id,
            election_key: Keypair::generate().public_key(),
        };
        changeset.stage_message(&election, ctx.derive(ActionKind::ElectionKey, &key)?, false);
    }
    Ok(changeset)
}

fn witness_message(store: &Store, message: &Message, witness: MessageWitness) -> Result<Changeset> {
    if !store.has_message(&witness.message_id)? {
        return Err(PopError::invalid_resource(format!(
            "witnessed message {} is unknown",
            witness.message_id
        )));
    }
    let id_bytes = crypto::decode("message_id", &witness.message_id)?;
    crypto::verify(&message.sender, &id_bytes, &witness.signature)?;
    Ok(Changeset::new())
}
