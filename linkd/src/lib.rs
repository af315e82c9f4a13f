//! The PPP controller daemon: session registry, option store, the client
//! control protocol on the local socket, and the reactor tying them to the
//! L2TP engine.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod buffer;
pub mod client;
pub mod manager;
pub mod msg;
pub mod options;
pub mod server;
pub mod session;
