//! Channels: the `/root`-rooted tree of append-only logs.
//!
//! Every incoming message goes through the `Validator` and then the
//! `Dispatcher`, which hands it to the topic handler registered for the
//! channel's type. Handlers never write to the store directly; they return a
//! `Changeset` that the dispatcher applies in one transaction.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod coin;
pub mod dispatcher;
pub mod election;
pub mod lao;
pub mod root;
pub mod social;
pub mod validator;

pub use dispatcher::{Accepted, ChannelHandler, Dispatcher, HandlerContext, Outcome};
pub use validator::{DeliveryMode, Validation, Validator};

pub const ROOT: &str = "/root";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    Root,
    Lao,
    Election,
    Chirp,
    Posts,
    Reaction,
    Coin,
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelType::Root => "root",
            ChannelType::Lao => "lao",
            ChannelType::Election => "election",
            ChannelType::Chirp => "chirp",
            ChannelType::Posts => "posts",
            ChannelType::Reaction => "reaction",
            ChannelType::Coin => "coin",
        };
        f.write_str(name)
    }
}

/// Number of path segments; `/root` is 1. Parents always sort before children.
pub fn depth(path: &str) -> usize {
    path.split('/').filter(|segment| !segment.is_empty()).count()
}

/// `/root/<lao id>` for any channel under a LAO.
pub fn lao_of(path: &str) -> Option<String> {
    let mut segments = path.split('/').filter(|segment| !segment.is_empty());
    match (segments.next(), segments.next()) {
        (Some("root"), Some(lao)) => Some(format!("{ROOT}/{lao}")),
        _ => None,
    }
}

pub fn posts_channel(lao: &str) -> String {
    format!("{lao}/social/posts")
}

pub fn reactions_channel(lao: &str) -> String {
    format!("{lao}/social/reactions")
}

pub fn coin_channel(lao: &str) -> String {
    format!("{lao}/coin")
}

pub fn chirp_channel(lao: &str, attendee: &str) -> String {
    format!("{lao}/social/{attendee}")
}

#[cfg(test)]
mod tests;
