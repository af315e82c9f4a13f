//! Userland L2TP control-channel engine: wire codec, UDP endpoint
//! management and the per-tunnel reliable delivery machinery (RFC 2661
//! control messages over UDP, with sliding-window retransmission and
//! out-of-order reassembly).

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod engine;
pub mod seq;
pub mod support;
pub mod transport;
pub mod tunnel;
pub mod wire;

pub use crate::engine::{Command, Engine, Handle, Reply};
pub use crate::support::{Event, HostId, TunnelHost, Verdict};
