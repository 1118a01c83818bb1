//! WebSocket transport: wire codec, per-connection wrapper, upgrade glue.

pub mod codec;
pub mod connection;
pub mod handler;
