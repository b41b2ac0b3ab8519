//! Realtime user/vendor support chat for the marketplace: socket hub with
//! presence, rooms, persisted relay and unread fan-out, plus the client state
//! that renders it.

pub mod auth;
pub mod bus;
pub mod chat;
pub mod client;
pub mod config;
pub mod entity;
pub mod error;
pub mod protocol;
pub mod realtime;
pub mod server;
pub mod store;
