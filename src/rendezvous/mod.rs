//! Rendezvous directory service
//!
//! Maps usernames to addresses and keeps friendships and a copy of every
//! chat line. [`server::RendezvousServer`] speaks the HTTP+JSON API that
//! [`crate::directory::DirectoryClient`] consumes; [`store::DirectoryStore`]
//! keeps the data in SQLite.

pub mod server;
pub mod store;

pub use server::RendezvousServer;
pub use store::{DirectoryStore, RequestLogEntry};
