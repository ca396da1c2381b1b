//! Nick and hostname normalisation for relay clones.
//!
//! Remote networks have their own nick grammars and length limits; a clone
//! must come out the other side syntactically valid, tagged with its home
//! network, and free of collisions with real users.

use tracing::debug;

use crate::state::Network;

const FALLBACK_SEPARATOR: char = '|';

fn is_allowed_nick_char(c: char, allow_slashes: bool) -> bool {
    c.is_ascii_alphanumeric()
        || "^|\\-_[]{}`".contains(c)
        || (allow_slashes && c == '/')
}

/// Build a nick for a clone of `nick` from `homenet` that is legal on
/// `net`. `times_tagged` forces the /network tag (and grows the separator
/// on repeated collisions); `uid` is the clone the nick is for, so a clone
/// never collides with itself.
pub fn normalize_nick(
    net: &Network,
    homenet: &str,
    nick: &str,
    times_tagged: u32,
    uid: &str,
) -> String {
    let conf = net.config();
    let serverdata = net.serverdata();
    let mut separator = serverdata
        .separator
        .clone()
        .unwrap_or_else(|| conf.relay.separator.clone());
    if separator.is_empty() {
        separator = "/".to_string();
    }

    let mut times_tagged = times_tagged;
    if times_tagged == 0 {
        let tag_nicks = serverdata.relay_tag_nicks.unwrap_or(conf.relay.tag_nicks);
        if tag_nicks {
            times_tagged = 1;
        } else {
            for pattern in &conf.relay.forcetag_nicks {
                if glob::Pattern::new(pattern).is_ok_and(|p| {
                    p.matches_with(
                        nick,
                        glob::MatchOptions {
                            case_sensitive: false,
                            ..Default::default()
                        },
                    )
                }) {
                    debug!(nick = %nick, pattern = %pattern, "forcetag_nicks matched; tagging");
                    times_tagged = 1;
                    break;
                }
            }
        }
    }

    let orig_nick = nick;
    let maxnicklen = net.maxnicklen.load(std::sync::atomic::Ordering::SeqCst);

    // Most TS6-family IRCds will SQUIT over a '/' in a nick, so fall back
    // to '|' unless the protocol (or the operator) says otherwise.
    let allow_slashes =
        net.protocol.caps().slash_in_nicks || serverdata.relay_force_slashes;
    let mut nick = nick.to_string();
    if !allow_slashes || !separator.contains('/') {
        separator = separator.replace('/', &FALLBACK_SEPARATOR.to_string());
        nick = nick.replace('/', &FALLBACK_SEPARATOR.to_string());
    }

    // Nicks starting with a digit or '-' are invalid on the wire.
    if nick.starts_with(|c: char| c.is_ascii_digit() || c == '-') {
        nick.insert(0, '_');
    }

    let suffix = if times_tagged >= 1 {
        let mut sep_chars = separator.chars();
        let first = sep_chars.next().unwrap_or('|');
        let rest: String = sep_chars.collect();
        format!(
            "{}{}{}",
            first.to_string().repeat(times_tagged as usize),
            rest,
            homenet
        )
    } else {
        String::new()
    };

    // The /network tag always survives truncation; the nick body pays.
    let allowed = maxnicklen.saturating_sub(suffix.chars().count());
    let mut nick: String = nick.chars().take(allowed).collect();
    nick.push_str(&suffix);

    nick = nick
        .chars()
        .map(|c| {
            if is_allowed_nick_char(c, allow_slashes) {
                c
            } else {
                FALLBACK_SEPARATOR
            }
        })
        .collect();

    // Collision with someone who isn't the clone we're placing: grow the
    // tag and retry.
    if let Some(holder) = net.nick_to_uid(&nick)
        && holder != uid
    {
        debug!(nick = %nick, "normalized nick in use; incrementing tag");
        return normalize_nick(net, homenet, orig_nick, times_tagged + 1, uid);
    }

    debug_assert!(
        nick.chars().count() <= maxnicklen,
        "normalized nick {nick:?} over the length limit"
    );
    nick
}

/// Keep a hostname within the target network's grammar: letters, digits,
/// `.:-`, plus `/` and `_` where the IRCd accepts them. 63 chars max.
pub fn normalize_host(net: &Network, host: &str) -> String {
    let caps = net.protocol.caps();
    host.chars()
        .map(|c| {
            let ok = c.is_ascii_alphanumeric()
                || ".:-".contains(c)
                || (caps.slash_in_hosts && c == '/')
                || (caps.underscore_in_hosts && c == '_');
            if ok { c } else { '-' }
        })
        .take(63)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::{test_net, test_net_with_protocol};
    use std::sync::Arc;

    #[test]
    fn test_tagging_appends_network() {
        let net = test_net("overdrive");
        let nick = normalize_nick(&net, "testnet", "GLolol", 0, "");
        assert_eq!(nick, "GLolol/testnet");
    }

    #[test]
    fn test_separator_falls_back_without_slash_support() {
        // TS6 (charybdis) rejects slashes in nicks.
        let net = test_net_with_protocol("charybdis", "ts6");
        let nick = normalize_nick(&net, "testnet", "web/user", 0, "");
        assert_eq!(nick, "web|user|testnet");
    }

    #[test]
    fn test_digit_start_gets_underscore() {
        let net = test_net("overdrive");
        let nick = normalize_nick(&net, "tn", "9pfG", 0, "");
        assert_eq!(nick, "_9pfG/tn");
    }

    #[test]
    fn test_truncation_preserves_suffix() {
        let net = test_net("overdrive");
        let long = "a".repeat(50);
        let nick = normalize_nick(&net, "tn", &long, 0, "");
        assert!(nick.chars().count() <= 30);
        assert!(nick.ends_with("/tn"));
    }

    #[test]
    fn test_collision_bumps_tag() {
        let net = test_net("overdrive");
        // A native user already holds the normalized name.
        let squatter = net.spawn_test_user("GLolol/tn", "001");
        let nick = normalize_nick(&net, "tn", "GLolol", 0, "PUID-clone");
        assert_eq!(nick, "GLolol//tn");
        // The clone itself holding the nick is not a collision.
        let renick = normalize_nick(&net, "tn", "GLolol", 0, &squatter);
        assert_eq!(renick, "GLolol/tn");
    }

    #[test]
    fn test_forced_tag_on_save() {
        // SAVE handling retries with times_tagged forced to 1.
        let net = test_net("overdrive");
        let nick = normalize_nick(&net, "tn", "clash", 1, "");
        assert_eq!(nick, "clash/tn");
    }

    #[test]
    fn test_invalid_chars_replaced(){
        let net = test_net("overdrive");
        let nick = normalize_nick(&net, "tn", "we:ird*nick", 0, "");
        assert_eq!(nick, "we|ird|nick/tn");
    }

    fn host_of(net: &Arc<crate::state::Network>, host: &str) -> String {
        normalize_host(net, host)
    }

    #[test]
    fn test_host_normalisation() {
        let stub = test_net("stubby");
        // Stub allows slashes and underscores.
        assert_eq!(host_of(&stub, "gate/way_1.example"), "gate/way_1.example");

        let hybrid = test_net_with_protocol("hyb", "hybrid");
        // Hybrid allows neither slashes nor underscores.
        assert_eq!(host_of(&hybrid, "gate/way_1.example"), "gate-way-1.example");

        let long = "h".repeat(80);
        assert_eq!(host_of(&stub, &long).len(), 63);
    }
}
