//! IRCd-Hybrid protocol driver.
//!
//! Hybrid speaks TS6 framing but diverges on user introduction (a 10-field
//! UID with an inline account), topic bursts (TBURST), services metadata
//! (SVSMODE) and an explicit end-of-burst (EOB). Everything else delegates
//! to the TS6 core.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{OutgoingError, OutgoingResult, ProtocolError};
use crate::hooks::{HookEvent, HookPayload};
use crate::ids::Ts6UidGenerator;
use crate::modes::{self, ModeChange, ModeMap, join_modes};
use crate::protocols::{
    ClientField, Protocol, ProtocolCaps, SpawnOpts, base, require_internal_server, ts6,
};
use crate::state::{Network, PrefixLevel, now_ts};

pub struct HybridProtocol {
    inner: ts6::Ts6Protocol,
    caps: ProtocolCaps,
    uidgens: Mutex<HashMap<String, Ts6UidGenerator>>,
}

impl HybridProtocol {
    pub fn new() -> Self {
        Self {
            inner: ts6::Ts6Protocol::new(ts6::Flavor::Ratbox),
            caps: ProtocolCaps {
                can_spawn_clients: true,
                has_ts: true,
                can_host_relay: true,
                can_track_servers: true,
                slash_in_nicks: false,
                slash_in_hosts: false,
                underscore_in_hosts: false,
                has_statusmsg: true,
                needs_eob_synth: false,
            },
            uidgens: Mutex::new(HashMap::new()),
        }
    }

    fn setup_modes(&self, net: &Network) {
        let mut cmodes = ModeMap::rfc1459_cmodes();
        for (name, letter) in [
            ("blockcolor", 'c'),
            ("noctcp", 'C'),
            ("regmoderated", 'M'),
            ("operonly", 'O'),
            ("regonly", 'R'),
            ("sslonly", 'S'),
            ("banexception", 'e'),
            ("noknock", 'p'),
            ("registered", 'r'),
            ("invex", 'I'),
        ] {
            cmodes.insert(name, letter);
        }
        cmodes.type_a = "beI".to_string();
        cmodes.type_b = "k".to_string();
        cmodes.type_c = "l".to_string();
        cmodes.type_d = "cimnprstCMORS".to_string();
        // Halfops are mandatory on Hybrid.
        cmodes.set_prefixes(&[
            (PrefixLevel::Op, 'o', '@'),
            (PrefixLevel::Halfop, 'h', '%'),
            (PrefixLevel::Voice, 'v', '+'),
        ]);
        net.set_cmodes(cmodes);

        let mut umodes = ModeMap::rfc1459_umodes();
        for (name, letter) in [
            ("cloak", 'x'),
            ("hidechans", 'p'),
            ("regdeaf", 'R'),
            ("deaf", 'D'),
            ("callerid", 'g'),
            ("admin", 'a'),
            ("hideoper", 'H'),
            ("hideidle", 'q'),
            ("registered", 'r'),
            ("ssl", 'S'),
            ("locops", 'l'),
        ] {
            umodes.insert(name, letter);
        }
        umodes.type_d = "DGHRSWabcdefgijklnopqrsuwxy".to_string();
        net.set_umodes(umodes);
    }

    fn handle_uid(&self, net: &Network, sender: &str, args: &[String]) -> Vec<HookEvent> {
        // <- :0UY UID dan 1 1451041551 +Facdeiklosuw ~ident localhost 127.0.0.1 0UYAAAAAB * :realname
        let (Some(nick), Some(ts), Some(umodes), Some(ident), Some(host), Some(ip), Some(uid)) = (
            args.first(),
            args.get(2),
            args.get(3),
            args.get(4),
            args.get(5),
            args.get(6),
            args.get(7),
        ) else {
            return Vec::new();
        };
        let account = args.get(8).filter(|a| a.as_str() != "*").cloned();
        let realname = args.last().cloned().unwrap_or_default();
        let ts = ts.parse().unwrap_or_else(|_| now_ts());
        base::register_user(net, sender, uid, nick, ts, ident, host, host, ip, &realname);
        let parsed = modes::parse_modes(net, uid, &[umodes.as_str()]);
        modes::apply_modes(net, uid, &parsed);

        let mut events = vec![HookEvent::new(
            sender,
            HookPayload::Uid {
                uid: uid.clone(),
                ts,
                nick: nick.clone(),
                ident: ident.clone(),
                host: host.clone(),
                realhost: None,
                ip: ip.clone(),
            },
        )];
        if parsed.iter().any(|m| m.adding && m.letter == 'o') {
            events.push(HookEvent::new(
                uid,
                HookPayload::Opered {
                    opertype: "IRC Operator".to_string(),
                },
            ));
        }
        if let Some(account) = account {
            if let Some(mut user) = net.users.get_mut(uid) {
                user.services_account = account.clone();
            }
            events.push(HookEvent::new(uid, HookPayload::ServicesLogin { account }));
        }
        events
    }

    fn handle_svsmode(&self, net: &Network, sender: &str, args: &[String]) -> Vec<HookEvent> {
        // <- :5ANAAAAAG SVSMODE 5HYAAAAAA 1460175209 +d GL
        let Some(target) = args.first().cloned() else {
            return Vec::new();
        };
        if args.len() < 3 {
            return Vec::new();
        }
        let mode_args: Vec<&str> = args[2..].iter().map(String::as_str).collect();
        let mut parsed = modes::parse_modes(net, &target, &mode_args);
        let mut events = Vec::new();

        parsed.retain(|change| {
            match (change.adding, change.letter) {
                (true, 'd') => {
                    // Account login propagation; "*" means logout.
                    let account = args.last().filter(|a| a.as_str() != "*").cloned();
                    let account = account.unwrap_or_default();
                    if let Some(mut user) = net.users.get_mut(&target) {
                        user.services_account = account.clone();
                    }
                    events.push(HookEvent::new(
                        &target,
                        HookPayload::ServicesLogin { account },
                    ));
                    false
                }
                (true, 'x') => {
                    // Cloak assignment doubles as a host change.
                    if let Some(newhost) = args.last() {
                        if let Some(mut user) = net.users.get_mut(&target) {
                            user.host = newhost.clone();
                        }
                        events.push(HookEvent::new(
                            sender,
                            HookPayload::ChgHost {
                                target: target.clone(),
                                newhost: newhost.clone(),
                            },
                        ));
                    }
                    false
                }
                _ => true,
            }
        });

        if !parsed.is_empty() {
            modes::apply_modes(net, &target, &parsed);
            events.push(HookEvent::new(
                sender,
                HookPayload::Mode {
                    target,
                    modes: parsed,
                    channeldata: None,
                },
            ));
        }
        events
    }
}

impl Default for HybridProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl Protocol for HybridProtocol {
    fn name(&self) -> &'static str {
        "hybrid"
    }

    fn caps(&self) -> &ProtocolCaps {
        &self.caps
    }

    fn post_connect(&self, net: &Network) -> Result<(), ProtocolError> {
        self.uidgens.lock().clear();
        let conf = net.serverdata();
        self.setup_modes(net);

        net.send(&format!("PASS {} TS 6 :{}", conf.sendpass, conf.sid));
        net.send("CAPAB :TBURST DLN KNOCK UNDLN UNKLN KLN ENCAP IE EX HOPS CHW SVS CLUSTER EOB QS");
        net.send(&format!(
            "SERVER {} 0 :{}",
            conf.hostname,
            conf.serverdesc
                .unwrap_or_else(|| net.config().bot.serverdesc.clone())
        ));
        // Hybrid expects our end-of-burst straight away.
        net.send(&format!(":{} EOB", conf.sid));
        Ok(())
    }

    fn handle_line(
        &self,
        net: &Network,
        line: &str,
    ) -> Result<Vec<HookEvent>, ProtocolError> {
        let Some((sender, command, args)) = base::split_line(line) else {
            return Ok(Vec::new());
        };

        // Hybrid-specific commands; the rest is stock TS6.
        match (sender.as_deref(), command.as_str()) {
            (None, "CAPAB") => {
                let caps: Vec<String> = args
                    .last()
                    .map(|s| s.split_whitespace().map(str::to_string).collect())
                    .unwrap_or_default();
                for required in ["EX", "IE", "SVS", "EOB", "HOPS", "QS", "TBURST"] {
                    if !caps.iter().any(|c| c == required) {
                        return Err(ProtocolError::MissingCapability(required.to_string()));
                    }
                }
                self.inner.set_uplink_caps(caps);
                net.connected
                    .store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(Vec::new())
            }
            (Some(_), "UID") => {
                let sender = sender.as_deref().unwrap_or_default();
                Ok(self.handle_uid(net, sender, &args))
            }
            (Some(raw), "TBURST") => {
                // <- :0UY TBURST 1459308205 #testchan 1459309379 dan!~d@localhost :sdf
                let (Some(channel), Some(ts)) = (args.get(1), args.get(2)) else {
                    return Ok(Vec::new());
                };
                let key = net.to_lower(channel);
                let topic = args.last().cloned().unwrap_or_default();
                let setter = args.get(3).cloned().unwrap_or_default();
                let oldtopic = net.channel_snapshot(&key).map(|c| c.topic);
                if let Some(mut chan) = net.channels.get_mut(&key) {
                    chan.topic = topic.clone();
                    chan.topicset = true;
                }
                let sender = base::resolve_sender(net, raw).unwrap_or_else(|| raw.to_string());
                Ok(vec![HookEvent::renamed(
                    &sender,
                    "TOPIC",
                    HookPayload::Topic {
                        channel: key,
                        text: topic,
                        oldtopic,
                        setter,
                        ts: ts.parse().unwrap_or_else(|_| now_ts()),
                    },
                )])
            }
            (Some(raw), "SVSMODE") => {
                let sender = base::resolve_sender(net, raw).unwrap_or_else(|| raw.to_string());
                Ok(self.handle_svsmode(net, &sender, &args))
            }
            (Some(raw), "EOB") => {
                let sender = base::resolve_sender(net, raw).unwrap_or_else(|| raw.to_string());
                if let Some(mut server) = net.servers.get_mut(&sender) {
                    server.has_eob = true;
                }
                if Some(sender.clone()) == net.uplink() {
                    debug!(net = %net.name, "end of burst received");
                    Ok(vec![HookEvent::new(&sender, HookPayload::Endburst)])
                } else {
                    Ok(Vec::new())
                }
            }
            _ => self.inner.handle_line(net, line),
        }
    }

    fn spawn_client(&self, net: &Network, opts: SpawnOpts) -> Result<String, OutgoingError> {
        let server = opts.server.clone().unwrap_or_else(|| net.sid());
        if !net.is_internal_server(&server) {
            return Err(OutgoingError::InvalidSource(server));
        }
        let uid = self
            .uidgens
            .lock()
            .entry(server.clone())
            .or_insert_with(|| Ts6UidGenerator::new(&server))
            .next_uid()
            .map_err(|_| OutgoingError::UnknownTarget("uid space exhausted".to_string()))?;
        let user = base::spawn_state(net, &uid, &opts)?;
        let raw_modes = join_modes(&opts.modes, true);
        let modestring = raw_modes.split(' ').next().unwrap_or("+");
        net.send(&format!(
            ":{server} UID {} 1 {} {} {} {} {} {} * :{}",
            user.nick, user.ts, modestring, user.ident, user.host, user.ip, uid, user.realname
        ));
        Ok(uid)
    }

    fn spawn_server(
        &self,
        net: &Network,
        name: &str,
        desc: &str,
    ) -> Result<String, OutgoingError> {
        let sid = self.inner.spawn_server(net, name, desc)?;
        // Leaf servers announce their own end-of-burst.
        net.send(&format!(":{sid} EOB"));
        Ok(sid)
    }

    fn join(&self, net: &Network, client: &str, channel: &str) -> OutgoingResult {
        self.inner.join(net, client, channel)
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
        self.inner.sjoin(net, server, channel, users, ts, modes)
    }

    fn part(&self, net: &Network, client: &str, channel: &str, reason: &str)
    -> OutgoingResult {
        self.inner.part(net, client, channel, reason)
    }

    fn quit(&self, net: &Network, client: &str, reason: &str) -> OutgoingResult {
        self.inner.quit(net, client, reason)
    }

    fn kick(
        &self,
        net: &Network,
        source: &str,
        channel: &str,
        target: &str,
        reason: &str,
    ) -> OutgoingResult {
        self.inner.kick(net, source, channel, target, reason)
    }

    fn kill(&self, net: &Network, source: &str, target: &str, reason: &str)
    -> OutgoingResult {
        self.inner.kill(net, source, target, reason)
    }

    fn nick(&self, net: &Network, client: &str, newnick: &str) -> OutgoingResult {
        self.inner.nick(net, client, newnick)
    }

    fn mode(
        &self,
        net: &Network,
        source: &str,
        target: &str,
        modes: &[ModeChange],
    ) -> OutgoingResult {
        self.inner.mode(net, source, target, modes)
    }

    fn topic(&self, net: &Network, source: &str, channel: &str, text: &str)
    -> OutgoingResult {
        self.inner.topic(net, source, channel, text)
    }

    fn topic_burst(
        &self,
        net: &Network,
        source: &str,
        channel: &str,
        text: &str,
    ) -> OutgoingResult {
        // <- :0UY TBURST 1459308205 #testchan 1459309379 dan!~d@localhost :sdf
        require_internal_server(net, source)?;
        let key = net.to_lower(channel);
        let ts = net.channel_snapshot(&key).map(|c| c.ts).unwrap_or_else(now_ts);
        let setter = net
            .servers
            .get(source)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| source.to_string());
        net.send(&format!(
            ":{source} TBURST {ts} {key} {} {setter} :{text}",
            now_ts()
        ));
        if let Some(mut chan) = net.channels.get_mut(&key) {
            chan.topic = text.to_string();
            chan.topicset = true;
        }
        Ok(())
    }

    fn message(&self, net: &Network, source: &str, target: &str, text: &str)
    -> OutgoingResult {
        self.inner.message(net, source, target, text)
    }

    fn notice(&self, net: &Network, source: &str, target: &str, text: &str)
    -> OutgoingResult {
        self.inner.notice(net, source, target, text)
    }

    fn invite(&self, net: &Network, source: &str, target: &str, channel: &str)
    -> OutgoingResult {
        self.inner.invite(net, source, target, channel)
    }

    fn knock(&self, net: &Network, source: &str, channel: &str, text: &str)
    -> OutgoingResult {
        self.inner.knock(net, source, channel, text)
    }

    fn numeric(
        &self,
        net: &Network,
        source: &str,
        numeric: u16,
        target: &str,
        text: &str,
    ) -> OutgoingResult {
        self.inner.numeric(net, source, numeric, target, text)
    }

    fn update_client(
        &self,
        net: &Network,
        target: &str,
        field: ClientField,
        text: &str,
    ) -> OutgoingResult {
        // Host changes are a forced "+x <host>" SVSMODE on Hybrid.
        if field != ClientField::Host {
            return Err(OutgoingError::NotImplemented("update_client"));
        }
        let ts = net
            .users
            .get(target)
            .map(|u| u.ts)
            .ok_or_else(|| OutgoingError::UnknownTarget(target.to_string()))?;
        net.send(&format!(":{} SVSMODE {target} {ts} +x {text}", net.sid()));
        if let Some(mut user) = net.users.get_mut(target) {
            user.host = text.to_string();
        }
        Ok(())
    }

    fn away(&self, net: &Network, client: &str, text: &str) -> OutgoingResult {
        self.inner.away(net, client, text)
    }

    fn ping(&self, net: &Network) {
        self.inner.ping(net)
    }

    fn squit(&self, net: &Network, source: &str, target: &str, reason: &str)
    -> OutgoingResult {
        self.inner.squit(net, source, target, reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::state::test_support::test_net_with_protocol;

    fn hybrid_net() -> Arc<Network> {
        let net = test_net_with_protocol("hybnet", "hybrid");
        net.protocol.post_connect(&net).unwrap();
        net.protocol
            .handle_line(&net, "PASS linkage TS 6 :0UY")
            .unwrap();
        net.protocol
            .handle_line(
                &net,
                "CAPAB :UNDLN UNKLN KLN TBURST KNOCK ENCAP DLN IE EX HOPS CHW SVS CLUSTER EOB QS",
            )
            .unwrap();
        net
    }

    #[test]
    fn test_uid_with_account_emits_login() {
        let net = hybrid_net();
        let events = net
            .protocol
            .handle_line(
                &net,
                ":0UY UID dan 1 1451041551 +i ~ident localhost 127.0.0.1 0UYAAAAAB danacct :realname",
            )
            .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].command, "CLIENT_SERVICES_LOGIN");
        assert_eq!(
            net.users.get("0UYAAAAAB").unwrap().services_account,
            "danacct"
        );
    }

    #[test]
    fn test_svsmode_login_logout() {
        let net = hybrid_net();
        net.protocol
            .handle_line(
                &net,
                ":0UY UID dan 1 1451041551 +i ~d localhost 127.0.0.1 0UYAAAAAB * :r",
            )
            .unwrap();
        let events = net
            .protocol
            .handle_line(&net, ":0UY SVSMODE 0UYAAAAAB 1460175209 +d GL")
            .unwrap();
        assert_eq!(events[0].command, "CLIENT_SERVICES_LOGIN");
        assert_eq!(net.users.get("0UYAAAAAB").unwrap().services_account, "GL");

        net.protocol
            .handle_line(&net, ":0UY SVSMODE 0UYAAAAAB 1460175209 +d *")
            .unwrap();
        assert_eq!(net.users.get("0UYAAAAAB").unwrap().services_account, "");
    }

    #[test]
    fn test_eob_fires_endburst() {
        let net = hybrid_net();
        let events = net.protocol.handle_line(&net, ":0UY EOB").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].command, "ENDBURST");
    }

    #[test]
    fn test_halfop_prefix_known() {
        let net = hybrid_net();
        assert_eq!(
            net.cmodes().prefix_letter(PrefixLevel::Halfop),
            Some('h')
        );
    }
}
