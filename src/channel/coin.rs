use crate::channel::ChannelType;
use crate::channel::dispatcher::{ChannelHandler, HandlerContext, unsupported};
use crate::message::data::PostTransaction;
use crate::message::{Message, MessageData};
use crate::persistence::Changeset;
use crate::utils::{PopError, Result};

/// `coin#post_transaction` on `<lao>/coin`.
pub struct CoinHandler;

impl ChannelHandler for CoinHandler {
    fn handle(
        &self,
        _ctx: &HandlerContext<'_>,
        _channel: &str,
        _message: &Message,
        data: MessageData,
    ) -> Result<Changeset> {
        match data {
            MessageData::CoinPostTransaction(post) => {
                check_transaction(&post)?;
                Ok(Changeset::new())
            }
            other => Err(unsupported(ChannelType::Coin, &other)),
        }
    }
}

fn check_transaction(post: &PostTransaction) -> Result<()> {
    let tx = &post.transaction;
    if tx.inputs.is_empty() {
        return Err(PopError::invalid_message_field("transaction has no inputs"));
    }
    if tx.outputs.is_empty() {
        return Err(PopError::invalid_message_field("transaction has no outputs"));
    }

    let mut total: i64 = 0;
    for output in &tx.outputs {
        if output.value < 0 {
            return Err(PopError::invalid_message_field(
                "transaction output value is negative",
            ));
        }
        total = total
            .checked_add(output.value)
            .ok_or_else(|| PopError::invalid_message_field("transaction output sum overflows"))?;
    }
    Ok(())
}
