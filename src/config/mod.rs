//! Configuration loading and management.
//!
//! Split into logical submodules:
//! - [`types`]: Core config struct definitions (Config, BotConfig, NetConfig)
//! - [`defaults`]: serde default helpers
//! - [`validation`]: startup validation (collects all errors before exit)

mod defaults;
mod types;
mod validation;

pub use types::{BotConfig, Config, LogConfig, LogFormat, NetConfig, RelayConfig};
pub use validation::validate;

use crate::error::ConfigError;

impl Config {
    /// Load and parse a TOML config file.
    pub fn load(path: &str) -> Result<Config, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r##"
        [bot]
        nick = "slink"

        [servers.overdrive]
        ip = "127.0.0.1"
        port = 7000
        protocol = "ts6"
        sendpass = "hunter2"
        recvpass = "hunter2"
        hostname = "relay.overdrive.example"
        sid = "0SL"
        sidrange = "8##"
        netname = "OVERdrive-IRC"
        channels = ["#lounge"]
    "##;

    #[test]
    fn test_parse_minimal() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        assert_eq!(config.bot.nick, "slink");
        let net = &config.servers["overdrive"];
        assert_eq!(net.port, 7000);
        assert_eq!(net.protocol, "ts6");
        assert_eq!(net.maxnicklen, 30);
        assert!(net.autoconnect < 0);
        assert_eq!(config.relay.separator, "/");
        assert!(config.relay.tag_nicks);
    }

    #[test]
    fn test_validate_minimal_passes() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_validate_rejects_unknown_protocol() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.servers.get_mut("overdrive").unwrap().protocol = "efnet".to_string();
        let errors = validate(&config).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("protocol")));
    }

    #[test]
    fn test_validate_requires_sid_for_s2s() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.servers.get_mut("overdrive").unwrap().sid = String::new();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_clientbot_needs_no_passwords() {
        let raw = r#"
            [bot]

            [servers.freenode]
            ip = "irc.example.org"
            port = 6667
            protocol = "clientbot"
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert!(validate(&config).is_ok());
    }
}
