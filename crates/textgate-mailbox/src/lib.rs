//! Mailbox adapter — scoped IMAP access for invitation handling.
//!
//! Each bot owns a mailbox that receives the portal's invitation
//! emails. The adapter opens a TLS IMAP connection, searches by
//! subject within a day window, fetches and parses candidates, and
//! deletes consumed invites. Connections are short-lived: open, work,
//! log out.

pub mod imap;
pub mod invite;

pub use imap::Mailbox;
pub use invite::{invite_from_raw, parse_invite, Invite};
