//! Portal integration — authenticated sessions, inbox scraping, and
//! rendered form submission through the headless-browser service.
//!
//! The portal is a legacy ASP.NET application: plain GET/POST works for
//! login and for walking the inbox grid, but the reply/compose/accept
//! pages only submit reliably with client-side JavaScript running, so
//! those go through the Splash client in [`splash`] with the Lua
//! sources shipped under `scripts/`.

pub mod forms;
pub mod inbox;
pub mod session;
pub mod splash;
