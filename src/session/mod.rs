//! Session state
//!
//! Everything a logged-in peer knows locally:
//! - `conversation` - per-friend message log, history hydration state and
//!   unread / active-chat flags
//! - `state` - the single owner of identity, friend set and conversations,
//!   serialized behind one lock

pub mod conversation;
pub mod state;

pub use conversation::{ChatLine, Conversation, HistoryState, Sender};
pub use state::{FriendStatus, Identity, SessionState};
