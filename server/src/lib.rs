//! Authoritative asteroids server.
//!
//! The server owns the entire game simulation: clients submit intents
//! (movement, shots) over TCP and receive authoritative world snapshots every
//! tick. [`game`] holds the fixed-cadence simulation engine, [`network`] the
//! session and transport layer around it.

pub mod collision;
pub mod entities;
pub mod game;
pub mod network;
pub mod registry;
