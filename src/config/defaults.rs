//! serde default helpers shared by the config types.

pub fn default_true() -> bool {
    true
}

pub fn default_maxnicklen() -> usize {
    30
}

pub fn default_pingfreq() -> u64 {
    90
}

/// Autoconnect is off unless a non-negative retry delay is configured.
pub fn default_autoconnect() -> i64 {
    -1
}

pub fn default_sasl_mech() -> String {
    "PLAIN".to_string()
}

pub fn default_separator() -> String {
    "/".to_string()
}

pub fn default_server_suffix() -> String {
    "relay".to_string()
}

pub fn default_modesync() -> String {
    "none".to_string()
}

pub fn default_db_path() -> String {
    "relaydb.json".to_string()
}

pub fn default_nick() -> String {
    "slink".to_string()
}

pub fn default_ident() -> String {
    "slink".to_string()
}

pub fn default_realname() -> String {
    "Straylight Relay".to_string()
}

pub fn default_serverdesc() -> String {
    "Straylight relay server".to_string()
}

/// Outgoing messages per second; zero or negative disables pacing.
pub fn default_throttle() -> f64 {
    100.0
}
