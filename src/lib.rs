//! Real-time WebSocket message relay built around a single broadcast hub.
//!
//! Clients upgrade at `/chat/:channel`, identify themselves with a join
//! message, and receive every message broadcast to their channel until they
//! disconnect. Each module focuses on a concrete responsibility:
//!
//! - [`cli`] parses the command-line interface for the relay binary.
//! - [`hub`] owns the channel-membership table and serializes register,
//!   unregister, and broadcast events through one event loop.
//! - [`connection`] bridges one WebSocket to the hub's event vocabulary.
//! - [`message`] defines the JSON wire protocol and its decode errors.
//! - [`server`] wires the hub and the axum upgrade endpoint together.
//!
//! Integration tests use this crate directly to exercise the hub state
//! machine and the wire protocol.

pub mod cli;
pub mod connection;
pub mod hub;
pub mod message;
pub mod server;
