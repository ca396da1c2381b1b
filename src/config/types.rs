//! Core config struct definitions.

use std::collections::HashMap;

use serde::Deserialize;

use super::defaults::*;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub format: LogFormat,
}

/// Identity of the main service client spawned on every network.
#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    #[serde(default = "default_nick")]
    pub nick: String,
    #[serde(default = "default_ident")]
    pub ident: String,
    #[serde(default = "default_realname")]
    pub realname: String,
    #[serde(default = "default_serverdesc")]
    pub serverdesc: String,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            nick: default_nick(),
            ident: default_ident(),
            realname: default_realname(),
            serverdesc: default_serverdesc(),
        }
    }
}

/// Relay tunables shared by all networks.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Nick/netname separator for clone nicks.
    #[serde(default = "default_separator")]
    pub separator: String,
    /// Whether clone nicks get a /network tag by default.
    #[serde(default = "default_true")]
    pub tag_nicks: bool,
    /// Globs of nicks that are always tagged even with tag_nicks off.
    #[serde(default)]
    pub forcetag_nicks: Vec<String>,
    /// Set +hideoper on remote opers where supported.
    #[serde(default = "default_true")]
    pub hideoper: bool,
    /// Propagate real IPs/hosts of users to remote networks.
    #[serde(default)]
    pub show_ips: bool,
    /// Show "<uplink> <split>" quits instead of "*.net *.split".
    #[serde(default)]
    pub show_netsplits: bool,
    /// Template announced to leaf channels when a home network drops.
    /// Supports $network, $channel, $homenetwork, $homechannel.
    #[serde(default)]
    pub disconnect_announcement: Option<String>,
    /// Suffix of relay subserver names ("<netname>.<suffix>").
    #[serde(default = "default_server_suffix")]
    pub server_suffix: String,
    /// Clientbot mode relaying: "none", "half" or "full".
    #[serde(default = "default_modesync")]
    pub clientbot_modesync: String,
    /// Relay channel messages from senders with no clone via the main bot.
    #[serde(default = "default_true")]
    pub accept_weird_senders: bool,
    /// Allow private messages to users behind a Clientbot link.
    #[serde(default)]
    pub allow_clientbot_pms: bool,
    /// Where the channel link table is persisted.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            separator: default_separator(),
            tag_nicks: true,
            forcetag_nicks: Vec::new(),
            hideoper: true,
            show_ips: false,
            show_netsplits: false,
            disconnect_announcement: None,
            server_suffix: default_server_suffix(),
            clientbot_modesync: default_modesync(),
            accept_weird_senders: true,
            allow_clientbot_pms: false,
            db_path: default_db_path(),
        }
    }
}

/// One network block.
#[derive(Debug, Clone, Deserialize)]
pub struct NetConfig {
    /// Remote server IP/hostname to connect to.
    pub ip: String,
    pub port: u16,
    /// Protocol driver: ts6, ratbox, hybrid, inspircd, unreal, p10,
    /// ngircd, clientbot or stub.
    pub protocol: String,
    /// Password we send in PASS.
    #[serde(default)]
    pub sendpass: String,
    /// Password we expect back from the uplink.
    #[serde(default)]
    pub recvpass: String,
    /// Our server name on this network.
    #[serde(default)]
    pub hostname: String,
    /// Our SID.
    #[serde(default)]
    pub sid: String,
    /// SID allocation space for relay subservers: a template like "8##"
    /// (TS6) or a numeric "MIN-MAX" range (P10).
    #[serde(default)]
    pub sidrange: String,
    /// Display name of the network; defaults to the config key.
    #[serde(default)]
    pub netname: Option<String>,
    /// Channels the main service client joins after burst.
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default = "default_maxnicklen")]
    pub maxnicklen: usize,
    #[serde(default = "default_pingfreq")]
    pub pingfreq: u64,
    /// Reconnect delay in seconds; negative disables reconnection.
    #[serde(default = "default_autoconnect")]
    pub autoconnect: i64,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default)]
    pub ssl_certfile: Option<String>,
    #[serde(default)]
    pub ssl_keyfile: Option<String>,
    /// SHA-1 fingerprint pin (hex); mismatch aborts the connection.
    #[serde(default)]
    pub ssl_fingerprint: Option<String>,
    #[serde(default)]
    pub sasl_user: Option<String>,
    #[serde(default)]
    pub sasl_pass: Option<String>,
    #[serde(default = "default_sasl_mech")]
    pub sasl_mech: String,
    /// Raw lines sent after registration (clientbot).
    #[serde(default)]
    pub autoperform: Vec<String>,
    /// Per-network override of relay.separator.
    #[serde(default)]
    pub separator: Option<String>,
    /// Per-network override of relay.tag_nicks.
    #[serde(default)]
    pub relay_tag_nicks: Option<bool>,
    /// Force '/' in relayed nicks even if the IRCd rejects it.
    #[serde(default)]
    pub relay_force_slashes: bool,
    /// Never share this network's real IPs with the relay.
    #[serde(default)]
    pub relay_no_ips: bool,
    #[serde(default)]
    pub serverdesc: Option<String>,
    /// Track oper status from WHO replies (clientbot).
    #[serde(default = "default_true")]
    pub clientbot_track_oper: bool,
    /// Outgoing messages per second; <= 0 disables pacing.
    #[serde(default = "default_throttle")]
    pub throttle: f64,
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bot: BotConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub servers: HashMap<String, NetConfig>,
}
