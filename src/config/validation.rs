//! Startup configuration validation.
//!
//! All problems are collected into one list so the operator sees the whole
//! story instead of fixing errors one restart at a time.

use super::types::Config;

const PROTOCOLS: &[&str] = &[
    "ts6", "ratbox", "hybrid", "inspircd", "unreal", "p10", "ngircd", "clientbot", "stub",
];

/// Protocols that speak a real S2S link and therefore need the full set of
/// identity options.
fn is_s2s(protocol: &str) -> bool {
    !matches!(protocol, "clientbot" | "stub")
}

/// Protocols that use numeric SIDs (ngircd derives its ID from the
/// hostname instead).
fn needs_sid(protocol: &str) -> bool {
    is_s2s(protocol) && protocol != "ngircd"
}

pub fn validate(config: &Config) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if config.servers.is_empty() {
        errors.push("no networks configured".to_string());
    }

    for (name, net) in &config.servers {
        let ctx = |msg: String| format!("network {name}: {msg}");

        if net.port == 0 {
            errors.push(ctx(format!("invalid port {}", net.port)));
        }
        if net.ip.is_empty() {
            errors.push(ctx("missing ip".to_string()));
        }
        if !PROTOCOLS.contains(&net.protocol.as_str()) {
            errors.push(ctx(format!(
                "unknown protocol {:?} (valid: {})",
                net.protocol,
                PROTOCOLS.join(", ")
            )));
        }
        if net.maxnicklen == 0 {
            errors.push(ctx("maxnicklen must be positive".to_string()));
        }
        if net.pingfreq == 0 {
            errors.push(ctx("pingfreq must be positive".to_string()));
        }

        if is_s2s(net.protocol.as_str()) {
            if net.hostname.is_empty() {
                errors.push(ctx("missing hostname".to_string()));
            }
            if net.sendpass.is_empty() {
                errors.push(ctx("missing sendpass".to_string()));
            }
            if net.recvpass.is_empty() {
                errors.push(ctx("missing recvpass".to_string()));
            }
        }

        if needs_sid(net.protocol.as_str()) && net.sid.is_empty() {
            errors.push(ctx("missing sid".to_string()));
        }

        if let Some(fp) = &net.ssl_fingerprint {
            let stripped: String = fp.chars().filter(|c| *c != ':').collect();
            if stripped.len() != 40 || !stripped.chars().all(|c| c.is_ascii_hexdigit()) {
                errors.push(ctx(format!(
                    "ssl_fingerprint {fp:?} is not a SHA-1 hex digest"
                )));
            }
        }
    }

    if !["none", "half", "full"].contains(&config.relay.clientbot_modesync.as_str()) {
        errors.push(format!(
            "relay.clientbot_modesync {:?}: valid values are none, half, full",
            config.relay.clientbot_modesync
        ));
    }

    if errors.is_empty() { Ok(()) } else { Err(errors) }
}
