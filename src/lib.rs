//! Ferry: push files over TCP to a single-threaded, poll-driven receiver.
//!
//! Both ends are explicit state machines driven by [`fsm::run`]. The sender
//! is [`client::ClientSession`] and the receiver is [`server::ServerSession`].
//! Frames on the wire are described in [`codec`].

#[cfg(not(unix))]
compile_error!("ferry relies on unix file descriptors for readiness polling");

pub mod cli;
pub mod client;
pub mod codec;
pub mod error;
pub mod fsm;
pub mod journal;
pub mod logger;
pub mod mux;
pub mod net;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod signal;
