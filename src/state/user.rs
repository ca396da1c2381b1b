//! User records.

use std::collections::HashSet;

/// One user somewhere on a linked network, keyed by an opaque UID string.
///
/// Relay clones carry `remote = (origin_network, origin_uid)`; service bots
/// carry `service = <registry name>`. Everything else is plain IRC state.
#[derive(Debug, Clone)]
pub struct User {
    pub nick: String,
    pub ts: i64,
    pub uid: String,
    /// SID of the server this user sits on.
    pub server: String,
    pub ident: String,
    pub host: String,
    pub realhost: String,
    pub ip: String,
    pub realname: String,
    /// Last nick-change timestamp.
    pub nick_ts: i64,
    /// Non-prefix user modes as (letter, optional argument) pairs.
    pub modes: HashSet<(char, Option<String>)>,
    /// Casemapped names of every channel this user is in.
    pub channels: HashSet<String>,
    /// Away message; empty when present.
    pub away: String,
    /// Oper type string; empty when not opered.
    pub opertype: String,
    /// Services account name; empty when logged out.
    pub services_account: String,
    /// Whether plugins may puppet this client.
    pub manipulatable: bool,
    /// Set on relay clones: (home network, home UID).
    pub remote: Option<(String, String)>,
    /// Set on registered service bots: the service name.
    pub service: Option<String>,
}

impl User {
    pub fn new(nick: &str, ts: i64, uid: &str, server: &str) -> Self {
        Self {
            nick: nick.to_string(),
            ts,
            uid: uid.to_string(),
            server: server.to_string(),
            ident: "null".to_string(),
            host: "null".to_string(),
            realhost: "null".to_string(),
            ip: "0.0.0.0".to_string(),
            realname: String::new(),
            nick_ts: ts,
            modes: HashSet::new(),
            channels: HashSet::new(),
            away: String::new(),
            opertype: String::new(),
            services_account: String::new(),
            manipulatable: false,
            remote: None,
            service: None,
        }
    }

    /// Whether this user has a given mode letter set (any argument).
    pub fn has_mode(&self, letter: char) -> bool {
        self.modes.iter().any(|(m, _)| *m == letter)
    }

    pub fn is_oper(&self) -> bool {
        !self.opertype.is_empty() || self.has_mode('o')
    }

    pub fn is_relay_clone(&self) -> bool {
        self.remote.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_mode() {
        let mut u = User::new("gl", 100, "42XAAAAAB", "42X");
        u.modes.insert(('i', None));
        u.modes.insert(('s', Some("+cn".to_string())));
        assert!(u.has_mode('i'));
        assert!(u.has_mode('s'));
        assert!(!u.has_mode('o'));
    }

    #[test]
    fn test_oper_detection() {
        let mut u = User::new("gl", 100, "42XAAAAAB", "42X");
        assert!(!u.is_oper());
        u.modes.insert(('o', None));
        assert!(u.is_oper());
    }
}
