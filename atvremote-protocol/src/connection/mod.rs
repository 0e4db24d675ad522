//! Control Connection
//!
//! The per-device TLS control channel with its keepalive and reconnect logic.

pub mod control;

pub use control::{
    ControlChannel, ControlState, CONNECT_TIMEOUT, MAX_MISSED_PINGS, PING_TIMEOUT, RECONNECT_DELAY,
};
