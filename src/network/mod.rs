//! Per-network connection handling: socket lifecycle, line framing, the
//! throttled send queue, ping watchdog and reconnect backoff.

mod codec;
mod connection;
mod tls;

pub use codec::LineCodec;
pub use connection::run_network;
