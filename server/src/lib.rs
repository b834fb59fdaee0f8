//! # Pong Server Library
//!
//! Authoritative server for networked multiplayer Pong. Clients connect
//! over WebSocket and exchange JSON events; all simulation runs here at a
//! fixed tick rate and clients only render what they are told.
//!
//! Rooms live in the in-memory [`room::RoomManager`]; every started game
//! gets its own [`session`] task driving the [`physics`] engine; the
//! [`store::SessionStore`] trait is the swappable persistence boundary
//! behind it all.

pub mod auth;
pub mod error;
pub mod gateway;
pub mod physics;
pub mod room;
pub mod session;
pub mod store;
