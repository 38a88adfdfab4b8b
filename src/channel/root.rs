use crate::channel::dispatcher::{ChannelHandler, HandlerContext, unsupported};
use crate::channel::lao::{LaoState, lao_state_key};
use crate::channel::{ChannelType, ROOT, coin_channel, posts_channel, reactions_channel};
use crate::message::data::{ActionKind, LaoCreate, LaoGreet, PeerAddress};
use crate::message::{Message, MessageData, crypto};
use crate::persistence::Changeset;
use crate::utils::{PopError, Result};

/// `/root` only accepts `lao#create`.
pub struct RootHandler;

impl ChannelHandler for RootHandler {
    fn handle(
        &self,
        ctx: &HandlerContext<'_>,
        _channel: &str,
        message: &Message,
        data: MessageData,
    ) -> Result<Changeset> {
        match data {
            MessageData::LaoCreate(create) => create_lao(ctx, message, create),
            other => Err(unsupported(ChannelType::Root, &other)),
        }
    }
}

fn create_lao(ctx: &HandlerContext<'_>, message: &Message, create: LaoCreate) -> Result<Changeset> {
    let expected = crypto::hash(&[
        &create.organizer,
        &create.creation.to_string(),
        &create.name,
    ]);
    if create.id != expected {
        return Err(PopError::invalid_message_field(format!(
            "lao id is {}, should be {expected}",
            create.id
        )));
    }
    if create.name.is_empty() {
        return Err(PopError::invalid_message_field("lao name must not be empty"));
    }
    if message.sender != create.organizer {
        return Err(PopError::access_denied("sender must be the lao organizer"));
    }
    if let Some(owner) = &ctx.settings.owner_public_key {
        if &message.sender != owner {
            return Err(PopError::access_denied("only the server owner may create a lao"));
        }
    }

    let lao = format!("{ROOT}/{}", create.id);
    if ctx.store.has_channel(&lao)? {
        return Err(PopError::duplicate_resource(format!("lao {lao} already exists")));
    }

    let mut changeset = Changeset::new();
    changeset.add_channel(lao.as_str(), ChannelType::Lao, &lao);
    changeset.add_channel(posts_channel(&lao), ChannelType::Posts, &lao);
    changeset.add_channel(reactions_channel(&lao), ChannelType::Reaction, &lao);
    changeset.add_channel(coin_channel(&lao), ChannelType::Coin, &lao);
    changeset.set_state(
        lao_state_key(&lao),
        &LaoState {
            organizer: create.organizer.clone(),
            witnesses: create.witnesses.clone(),
        },
    )?;

    // the lao channel starts with its own creation message
    changeset.stage_message(&lao, message.clone(), false);

    let greet = LaoGreet {
        lao: create.id,
        frontend: create.organizer,
        address: ctx.settings.public_client_address.clone(),
        peers: ctx
            .broker
            .known_peers()
            .into_iter()
            .map(|address| PeerAddress { address })
            .collect(),
    };
    changeset.stage_message(&lao, ctx.derive(ActionKind::LaoGreet, &greet)?, false);
    Ok(changeset)
}
