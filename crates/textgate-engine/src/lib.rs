//! Pipeline engine — the per-bot stages and the scheduler that drives
//! them.
//!
//! Stage order within a tick: invitation acceptor → inbox puller
//! (which invokes the command interpreter after persisting) → reply
//! pusher → SMS dispatcher. Stages share nothing but the store; the
//! scheduler serializes a bot's pipeline with a named lock.

pub mod commands;
pub mod dispatch;
pub mod invites;
pub mod notify;
pub mod pull;
pub mod push;
pub mod scheduler;

use async_trait::async_trait;

use textgate_core::error::Result;
use textgate_core::model::Bot;

/// Outbound port for operator-facing mail. The command interpreter and
/// the dispatcher hand rendered replies to this instead of holding a
/// pusher directly; in tests a capturing stub stands in.
#[async_trait]
pub trait ReplyPort: Send + Sync {
    /// Deliver `content` as a reply to the portal thread identified by
    /// `portal_message_id`.
    async fn send_reply(&self, bot: &Bot, portal_message_id: &str, content: &str) -> Result<()>;
}
