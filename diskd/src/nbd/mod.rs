//! NBD server for diskd.
//!
//! This module wraps the `nbd` crate's protocol types with a server that
//! serves any [`Storage`](crate::store::Storage) backend.
//!
//! # Architecture
//!
//! - [`NbdServer`] handles a single NBD connection (greeting and transmission)
//! - [`Listener`] trait abstracts over session sources (TCP, socket pair)
//! - [`HandoffListener`] yields the server end of a device socket pair
//!
//! Every session goes through `Daemon::listen()`, whatever its source.

mod listener;
mod server;

pub use listener::{HandoffListener, Listener};
#[cfg(test)]
pub(crate) use listener::StreamListener;
// Re-export protocol types from the nbd crate
pub use nbd::{NbdCommand, NbdReply, NbdRequest};
pub use server::NbdServer;
