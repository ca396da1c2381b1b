//! Protocol drivers.
//!
//! Each driver translates one IRCd's S2S wire dialect into the common hook
//! vocabulary and back. Drivers are synchronous state machines over the
//! owning network's indexes; the async connection loop feeds them lines and
//! periodic ticks.

pub mod base;
pub mod clientbot;
pub mod hybrid;
pub mod inspircd;
pub mod ngircd;
pub mod p10;
pub mod stub;
pub mod ts6;
pub mod unreal;

use crate::error::{OutgoingError, OutgoingResult, ProtocolError};
use crate::hooks::HookEvent;
use crate::modes::ModeChange;
use crate::state::Network;

/// Static capability flags of a protocol dialect.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtocolCaps {
    /// Can introduce virtual users (everything but Clientbot).
    pub can_spawn_clients: bool,
    /// Channel creation timestamps are real and arbitrated.
    pub has_ts: bool,
    /// Can host relay subservers.
    pub can_host_relay: bool,
    /// Tracks which server a user sits on.
    pub can_track_servers: bool,
    /// Nicks may contain '/'.
    pub slash_in_nicks: bool,
    /// Hosts may contain '/'.
    pub slash_in_hosts: bool,
    /// Hosts may contain '_'.
    pub underscore_in_hosts: bool,
    /// Native @#channel / +#channel messaging support.
    pub has_statusmsg: bool,
    /// No explicit end-of-burst; a timer synthesises ENDBURST.
    pub needs_eob_synth: bool,
}

/// Options for introducing a virtual client.
#[derive(Debug, Clone)]
pub struct SpawnOpts {
    pub nick: String,
    pub ident: String,
    pub host: String,
    pub realhost: Option<String>,
    pub ip: String,
    pub realname: String,
    pub modes: Vec<ModeChange>,
    pub opertype: String,
    /// Owning internal server; defaults to the main pseudoserver.
    pub server: Option<String>,
    pub ts: Option<i64>,
    pub manipulatable: bool,
}

impl SpawnOpts {
    pub fn new(nick: &str) -> Self {
        Self {
            nick: nick.to_string(),
            ident: "null".to_string(),
            host: "null".to_string(),
            realhost: None,
            ip: "0.0.0.0".to_string(),
            realname: String::new(),
            modes: Vec::new(),
            opertype: String::new(),
            server: None,
            ts: None,
            manipulatable: false,
        }
    }
}

/// Remote-changeable client field for `update_client`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientField {
    Host,
    Ident,
    Gecos,
}

impl ClientField {
    pub fn name(self) -> &'static str {
        match self {
            ClientField::Host => "HOST",
            ClientField::Ident => "IDENT",
            ClientField::Gecos => "GECOS",
        }
    }
}

/// A protocol driver: handshake, line handler and the outgoing verb set.
///
/// Every outgoing verb validates that the source is ours (owned by an
/// internal server) and returns `OutgoingError::InvalidSource` otherwise.
/// Unknown targets are reported as `UnknownTarget` and dropped by callers.
pub trait Protocol: Send + Sync {
    fn name(&self) -> &'static str;
    fn caps(&self) -> &ProtocolCaps;

    /// Send the link handshake after the socket comes up.
    fn post_connect(&self, net: &Network) -> Result<(), ProtocolError>;

    /// Handle one inbound line, mutating state and returning hook events.
    fn handle_line(&self, net: &Network, line: &str)
    -> Result<Vec<HookEvent>, ProtocolError>;

    /// Periodic driver work (ping scheduling is handled by the IO loop).
    fn tick(&self, _net: &Network) {}

    // ------------------------------------------------------------------
    // Outgoing API
    // ------------------------------------------------------------------

    /// Introduce a virtual user, returning its UID.
    fn spawn_client(&self, net: &Network, opts: SpawnOpts) -> Result<String, OutgoingError>;

    /// Introduce a virtual server behind ours, returning its SID.
    fn spawn_server(
        &self,
        net: &Network,
        name: &str,
        desc: &str,
    ) -> Result<String, OutgoingError>;

    fn join(&self, net: &Network, client: &str, channel: &str) -> OutgoingResult;

    /// Burst one or more users (with prefix mode letters) into a channel.
    fn sjoin(
        &self,
        net: &Network,
        server: &str,
        channel: &str,
        users: &[(String, String)],
        ts: Option<i64>,
        modes: &[ModeChange],
    ) -> OutgoingResult;

    fn part(&self, net: &Network, client: &str, channel: &str, reason: &str)
    -> OutgoingResult;
    fn quit(&self, net: &Network, client: &str, reason: &str) -> OutgoingResult;
    fn kick(
        &self,
        net: &Network,
        source: &str,
        channel: &str,
        target: &str,
        reason: &str,
    ) -> OutgoingResult;
    fn kill(&self, net: &Network, source: &str, target: &str, reason: &str)
    -> OutgoingResult;
    fn nick(&self, net: &Network, client: &str, newnick: &str) -> OutgoingResult;
    fn mode(
        &self,
        net: &Network,
        source: &str,
        target: &str,
        modes: &[ModeChange],
    ) -> OutgoingResult;
    fn topic(&self, net: &Network, source: &str, channel: &str, text: &str)
    -> OutgoingResult;
    /// Topic change from a server, as used during bursts and CLAIM
    /// restoration.
    fn topic_burst(
        &self,
        net: &Network,
        source: &str,
        channel: &str,
        text: &str,
    ) -> OutgoingResult;
    fn message(&self, net: &Network, source: &str, target: &str, text: &str)
    -> OutgoingResult;
    fn notice(&self, net: &Network, source: &str, target: &str, text: &str)
    -> OutgoingResult;
    fn invite(&self, net: &Network, source: &str, target: &str, channel: &str)
    -> OutgoingResult;
    fn knock(&self, net: &Network, source: &str, channel: &str, text: &str)
    -> OutgoingResult;
    fn numeric(
        &self,
        net: &Network,
        source: &str,
        numeric: u16,
        target: &str,
        text: &str,
    ) -> OutgoingResult;
    fn update_client(
        &self,
        net: &Network,
        target: &str,
        field: ClientField,
        text: &str,
    ) -> OutgoingResult;
    fn away(&self, net: &Network, client: &str, text: &str) -> OutgoingResult;
    /// Send the periodic uplink PING.
    fn ping(&self, net: &Network);
    fn squit(&self, net: &Network, source: &str, target: &str, reason: &str)
    -> OutgoingResult;
}

/// Build the driver for a configured protocol name. Config validation
/// guarantees the name is known.
pub fn build(protocol: &str) -> Box<dyn Protocol> {
    match protocol {
        "ts6" => Box::new(ts6::Ts6Protocol::new(ts6::Flavor::Charybdis)),
        "ratbox" => Box::new(ts6::Ts6Protocol::new(ts6::Flavor::Ratbox)),
        "hybrid" => Box::new(hybrid::HybridProtocol::new()),
        "inspircd" => Box::new(inspircd::InspircdProtocol::new()),
        "unreal" => Box::new(unreal::UnrealProtocol::new()),
        "p10" => Box::new(p10::P10Protocol::new()),
        "ngircd" => Box::new(ngircd::NgircdProtocol::new()),
        "clientbot" => Box::new(clientbot::ClientbotProtocol::new()),
        _ => Box::new(stub::StubProtocol::new()),
    }
}

/// Validate that `source` is one of our clients; returns `InvalidSource`
/// otherwise.
pub fn require_internal_client(net: &Network, source: &str) -> OutgoingResult {
    if net.is_internal_client(source) {
        Ok(())
    } else {
        Err(OutgoingError::InvalidSource(source.to_string()))
    }
}

/// Validate that `source` is one of our servers.
pub fn require_internal_server(net: &Network, source: &str) -> OutgoingResult {
    if net.is_internal_server(source) {
        Ok(())
    } else {
        Err(OutgoingError::InvalidSource(source.to_string()))
    }
}

/// Validate that `source` is ours, client or server.
pub fn require_internal(net: &Network, source: &str) -> OutgoingResult {
    if net.is_internal(source) {
        Ok(())
    } else {
        Err(OutgoingError::InvalidSource(source.to_string()))
    }
}
