//! A do-nothing protocol driver.
//!
//! Keeps all the state bookkeeping of a real S2S driver but emits a plain
//! debug wire format. Used by the test suite and as a placeholder for
//! networks that are configured but not yet migrated to a real driver.

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::{OutgoingError, OutgoingResult, ProtocolError};
use crate::hooks::HookEvent;
use crate::ids::{Ts6SidGenerator, Ts6UidGenerator};
use crate::modes::{self, ModeChange, join_modes};
use crate::protocols::{
    ClientField, Protocol, ProtocolCaps, SpawnOpts, base, require_internal, require_internal_client,
    require_internal_server,
};
use crate::state::{Network, Server, now_ts};

pub struct StubProtocol {
    caps: ProtocolCaps,
    uidgens: DashMap<String, Ts6UidGenerator>,
    sidgen: Mutex<Option<Ts6SidGenerator>>,
}

impl StubProtocol {
    pub fn new() -> Self {
        Self {
            caps: ProtocolCaps {
                can_spawn_clients: true,
                has_ts: true,
                can_host_relay: true,
                can_track_servers: true,
                slash_in_nicks: true,
                slash_in_hosts: true,
                underscore_in_hosts: true,
                has_statusmsg: false,
                needs_eob_synth: false,
            },
            uidgens: DashMap::new(),
            sidgen: Mutex::new(None),
        }
    }

    fn next_uid(&self, server: &str) -> Result<String, OutgoingError> {
        self.uidgens
            .entry(server.to_string())
            .or_insert_with(|| Ts6UidGenerator::new(server))
            .next_uid()
            .map_err(|_| OutgoingError::UnknownTarget("uid space exhausted".to_string()))
    }
}

impl Default for StubProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl Protocol for StubProtocol {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn caps(&self) -> &ProtocolCaps {
        &self.caps
    }

    fn post_connect(&self, net: &Network) -> Result<(), ProtocolError> {
        net.connected
            .store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    fn handle_line(
        &self,
        _net: &Network,
        _line: &str,
    ) -> Result<Vec<HookEvent>, ProtocolError> {
        Ok(Vec::new())
    }

    fn spawn_client(&self, net: &Network, opts: SpawnOpts) -> Result<String, OutgoingError> {
        let server = opts.server.clone().unwrap_or_else(|| net.sid());
        let uid = self.next_uid(&server)?;
        let user = base::spawn_state(net, &uid, &opts)?;
        net.send(&format!(
            ":{server} UID {} {} {} :{}",
            user.nick, uid, user.host, user.realname
        ));
        Ok(uid)
    }

    fn spawn_server(
        &self,
        net: &Network,
        name: &str,
        desc: &str,
    ) -> Result<String, OutgoingError> {
        let mut sidgen = self.sidgen.lock();
        let generator = sidgen.get_or_insert_with(|| {
            let range = net.serverdata().sidrange;
            let template = if range.is_empty() { "9##" } else { &range };
            Ts6SidGenerator::new(template).unwrap_or_else(|_| {
                Ts6SidGenerator::new("9##").expect("static template is valid")
            })
        });
        let sid = loop {
            let candidate = generator
                .next_sid()
                .map_err(|_| OutgoingError::UnknownTarget("sid space exhausted".to_string()))?;
            if !net.servers.contains_key(&candidate) {
                break candidate;
            }
        };
        let uplink = net.sid();
        let mut server = Server::new(Some(&uplink), name, true, desc);
        server.has_eob = true;
        net.servers.insert(sid.clone(), server);
        net.send(&format!(":{uplink} SERVER {name} 1 {sid} :{desc}"));
        Ok(sid)
    }

    fn join(&self, net: &Network, client: &str, channel: &str) -> OutgoingResult {
        require_internal_client(net, client)?;
        net.add_user_to_channel(client, channel);
        net.send(&format!(":{client} JOIN {channel}"));
        Ok(())
    }

    fn sjoin(
        &self,
        net: &Network,
        server: &str,
        channel: &str,
        users: &[(String, String)],
        ts: Option<i64>,
        modes: &[ModeChange],
    ) -> OutgoingResult {
        require_internal_server(net, server)?;
        let key = net.get_or_create_channel(channel);
        let ts = ts
            .or_else(|| net.channel_snapshot(&key).map(|c| c.ts))
            .unwrap_or_else(now_ts);
        if let Some(mut chan) = net.channels.get_mut(&key)
            && ts < chan.ts
        {
            chan.ts = ts;
        }
        modes::apply_modes(net, &key, modes);
        for (prefixes, uid) in users {
            net.add_user_to_channel(uid, &key);
            let changes: Vec<ModeChange> = prefixes
                .chars()
                .map(|letter| ModeChange::plus(letter, Some(uid.as_str())))
                .collect();
            modes::apply_modes(net, &key, &changes);
        }
        net.send(&format!(
            ":{server} SJOIN {ts} {key} {} :{}",
            join_modes(modes, false),
            users
                .iter()
                .map(|(p, u)| format!("{p}{u}"))
                .collect::<Vec<_>>()
                .join(" ")
        ));
        Ok(())
    }

    fn part(&self, net: &Network, client: &str, channel: &str, reason: &str)
    -> OutgoingResult {
        require_internal_client(net, client)?;
        net.remove_user_from_channel(client, channel);
        net.send(&format!(":{client} PART {channel} :{reason}"));
        Ok(())
    }

    fn quit(&self, net: &Network, client: &str, reason: &str) -> OutgoingResult {
        require_internal_client(net, client)?;
        net.remove_client(client);
        net.send(&format!(":{client} QUIT :{reason}"));
        Ok(())
    }

    fn kick(
        &self,
        net: &Network,
        source: &str,
        channel: &str,
        target: &str,
        reason: &str,
    ) -> OutgoingResult {
        require_internal(net, source)?;
        net.remove_user_from_channel(target, channel);
        net.send(&format!(":{source} KICK {channel} {target} :{reason}"));
        Ok(())
    }

    fn kill(&self, net: &Network, source: &str, target: &str, reason: &str)
    -> OutgoingResult {
        require_internal(net, source)?;
        net.remove_client(target);
        net.send(&format!(":{source} KILL {target} :Killed ({reason})"));
        Ok(())
    }

    fn nick(&self, net: &Network, client: &str, newnick: &str) -> OutgoingResult {
        require_internal_client(net, client)?;
        if let Some(mut user) = net.users.get_mut(client) {
            user.nick = newnick.to_string();
            user.nick_ts = now_ts();
        }
        net.send(&format!(":{client} NICK {newnick}"));
        Ok(())
    }

    fn mode(
        &self,
        net: &Network,
        source: &str,
        target: &str,
        changes: &[ModeChange],
    ) -> OutgoingResult {
        require_internal(net, source)?;
        modes::apply_modes(net, target, changes);
        net.send(&format!(
            ":{source} MODE {target} {}",
            join_modes(changes, false)
        ));
        Ok(())
    }

    fn topic(&self, net: &Network, source: &str, channel: &str, text: &str)
    -> OutgoingResult {
        require_internal_client(net, source)?;
        let key = net.to_lower(channel);
        if let Some(mut chan) = net.channels.get_mut(&key) {
            chan.topic = text.to_string();
            chan.topicset = true;
        }
        net.send(&format!(":{source} TOPIC {channel} :{text}"));
        Ok(())
    }

    fn topic_burst(
        &self,
        net: &Network,
        source: &str,
        channel: &str,
        text: &str,
    ) -> OutgoingResult {
        require_internal_server(net, source)?;
        let key = net.to_lower(channel);
        if let Some(mut chan) = net.channels.get_mut(&key) {
            chan.topic = text.to_string();
            chan.topicset = true;
        }
        net.send(&format!(":{source} TB {channel} :{text}"));
        Ok(())
    }

    fn message(&self, net: &Network, source: &str, target: &str, text: &str)
    -> OutgoingResult {
        require_internal_client(net, source)?;
        net.send(&format!(":{source} PRIVMSG {target} :{text}"));
        Ok(())
    }

    fn notice(&self, net: &Network, source: &str, target: &str, text: &str)
    -> OutgoingResult {
        require_internal(net, source)?;
        net.send(&format!(":{source} NOTICE {target} :{text}"));
        Ok(())
    }

    fn invite(&self, net: &Network, source: &str, target: &str, channel: &str)
    -> OutgoingResult {
        require_internal_client(net, source)?;
        net.send(&format!(":{source} INVITE {target} {channel}"));
        Ok(())
    }

    fn knock(&self, net: &Network, source: &str, channel: &str, text: &str)
    -> OutgoingResult {
        require_internal_client(net, source)?;
        net.send(&format!(":{source} KNOCK {channel} :{text}"));
        Ok(())
    }

    fn numeric(
        &self,
        net: &Network,
        source: &str,
        numeric: u16,
        target: &str,
        text: &str,
    ) -> OutgoingResult {
        require_internal_server(net, source)?;
        net.send(&format!(":{source} {numeric:03} {target} {text}"));
        Ok(())
    }

    fn update_client(
        &self,
        net: &Network,
        target: &str,
        field: ClientField,
        text: &str,
    ) -> OutgoingResult {
        let Some(mut user) = net.users.get_mut(target) else {
            return Err(OutgoingError::UnknownTarget(target.to_string()));
        };
        match field {
            ClientField::Host => user.host = text.to_string(),
            ClientField::Ident => user.ident = text.to_string(),
            ClientField::Gecos => user.realname = text.to_string(),
        }
        drop(user);
        net.send(&format!(
            ":{} CHG{} {target} :{text}",
            net.sid(),
            field.name()
        ));
        Ok(())
    }

    fn away(&self, net: &Network, client: &str, text: &str) -> OutgoingResult {
        require_internal_client(net, client)?;
        if let Some(mut user) = net.users.get_mut(client) {
            user.away = text.to_string();
        }
        if text.is_empty() {
            net.send(&format!(":{client} AWAY"));
        } else {
            net.send(&format!(":{client} AWAY :{text}"));
        }
        Ok(())
    }

    fn ping(&self, net: &Network) {
        let sid = net.sid();
        net.send(&format!(":{sid} PING {sid}"));
    }

    fn squit(&self, net: &Network, source: &str, target: &str, reason: &str)
    -> OutgoingResult {
        require_internal_server(net, source)?;
        let members: Vec<String> = net
            .servers
            .get(target)
            .map(|s| s.users.iter().cloned().collect())
            .unwrap_or_default();
        for uid in members {
            net.remove_client(&uid);
        }
        net.servers.remove(target);
        net.send(&format!(":{source} SQUIT {target} :{reason}"));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::test_net;

    #[test]
    fn test_spawn_and_join_updates_state() {
        let net = test_net("stubnet");
        let uid = net
            .protocol
            .spawn_client(&net, SpawnOpts::new("gl"))
            .unwrap();
        assert!(net.users.contains_key(&uid));
        assert!(net.is_internal_client(&uid));

        net.protocol.join(&net, &uid, "#Test").unwrap();
        assert!(net.channel_snapshot("#test").unwrap().users.contains(&uid));

        net.protocol.quit(&net, &uid, "bye").unwrap();
        assert!(!net.users.contains_key(&uid));
        assert!(net.channel_snapshot("#test").is_none());
    }

    #[test]
    fn test_spawn_server_allocates_sids() {
        let net = test_net("stubnet");
        let sid = net
            .protocol
            .spawn_server(&net, "b.relay", "relay server")
            .unwrap();
        assert!(net.is_internal_server(&sid));
        let sid2 = net
            .protocol
            .spawn_server(&net, "c.relay", "relay server")
            .unwrap();
        assert_ne!(sid, sid2);
    }

    #[test]
    fn test_invalid_source_is_rejected() {
        let net = test_net("stubnet");
        let external = net.spawn_test_user("them", "001");
        let err = net
            .protocol
            .join(&net, &external, "#test")
            .unwrap_err();
        assert!(matches!(err, OutgoingError::InvalidSource(_)));
    }
}
