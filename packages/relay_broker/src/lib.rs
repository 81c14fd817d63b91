//! Rendezvous broker: clients register under a public identity, ask the
//! broker to connect them to another identity, and once both sides accept,
//! the broker relays raw bytes between the two connections.

pub mod broker;
pub mod client;
pub mod config;
pub mod error;
pub mod metrics;
pub mod server;
pub mod session;
pub mod token;
pub mod transport;
