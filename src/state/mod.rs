//! Per-network state: the entity records and the `Network` container that
//! owns one connection's users, servers, channels and mode maps.

mod casemap;
mod channel;
mod network;
mod server;
mod user;

pub use casemap::Casemapping;
pub use channel::{Channel, PrefixLevel};
pub use network::Network;
pub use server::Server;
pub use user::User;

#[cfg(test)]
pub use network::test_support;

/// Current unix time in seconds.
pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}
