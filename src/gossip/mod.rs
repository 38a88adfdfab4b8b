//! Server-to-server replication.
//!
//! - `rumor`: push gossip of locally published messages
//! - `heartbeat`: pull repair of whatever gossip missed
//! - `replay`: the shallow-first dispatch loop both of them feed
//! - `queries`: outbound queries waiting for an answer

pub mod heartbeat;
pub mod queries;
pub mod replay;
pub mod rumor;

pub use heartbeat::HeartbeatExchange;
pub use queries::{PendingQueries, PendingQuery};
pub use replay::{ReplayReport, Replayer};
pub use rumor::{GossipPolicy, Rumor, RumorEngine, RumorState};
