//! End-to-end relay behaviour over in-memory network pairs.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::sync::mpsc;

use super::*;
use crate::hooks::HookPayload;
use crate::modes;
use crate::protocols::base;
use crate::state::test_support::test_config_protocols;

struct Fixture {
    world: Arc<World>,
    relay: Arc<Relay>,
    alpha: Arc<Network>,
    beta: Arc<Network>,
    _dir: tempfile::TempDir,
}

fn fixture() -> Fixture {
    let config = test_config_protocols(&[("alpha", "stub"), ("beta", "stub")]);
    let world = World::new(config.clone());
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("relaydb.json");
    let relay = Relay::start(&world, db_path.to_str().expect("utf-8 path"));

    let mut nets = Vec::new();
    for name in ["alpha", "beta"] {
        let net = Network::new(name, config.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        std::mem::forget(rx);
        net.attach_sender(tx);
        net.connected.store(true, Ordering::SeqCst);
        world.networks.insert(name.to_string(), net.clone());
        nets.push(net);
    }
    let beta = nets.pop().expect("beta");
    let alpha = nets.pop().expect("alpha");
    Fixture {
        world,
        relay,
        alpha,
        beta,
        _dir: dir,
    }
}

/// Capture outgoing wire lines of a network from this point on.
fn capture(net: &Arc<Network>) -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    net.attach_sender(tx);
    rx
}

fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<String> {
    let mut out = Vec::new();
    while let Ok(line) = rx.try_recv() {
        out.push(line);
    }
    out
}

fn link_channels(f: &Fixture, channel: &str) {
    {
        let mut db = f.relay.db();
        assert!(db.create("alpha", channel, "op!op@test"));
        db.link(
            &("alpha".to_string(), channel.to_string()),
            "beta",
            channel,
        )
        .expect("link");
    }
    f.relay.save_db();
}

fn join_and_relay(f: &Fixture, uid: &str, channel: &str) {
    f.alpha.spawn_test_channel(channel, 1000, &[uid]);
    let ts = f.alpha.channel_snapshot(channel).unwrap().ts;
    f.world.hooks.dispatch(
        &f.world,
        &f.alpha,
        uid,
        "JOIN",
        &HookPayload::Join {
            channel: channel.to_string(),
            users: vec![uid.to_string()],
            ts,
            modes: Vec::new(),
            burst: false,
            channeldata: None,
        },
    );
}

fn clone_of(f: &Fixture, uid: &str) -> Option<String> {
    f.relay
        .relayusers
        .get(&("alpha".to_string(), uid.to_string()))
        .and_then(|map| map.get("beta").cloned())
}

#[test]
fn test_clone_spawn_on_join() {
    let f = fixture();
    link_channels(&f, "#x");
    let u = f.alpha.spawn_test_user("GLolol", "001");
    join_and_relay(&f, &u, "#x");

    let clone = clone_of(&f, &u).expect("clone spawned");
    let clone_user = f.beta.users.get(&clone).expect("clone exists").clone();
    assert_eq!(clone_user.nick, "GLolol/alpha");
    assert_eq!(clone_user.remote, Some(("alpha".to_string(), u.clone())));
    assert!(
        f.beta
            .channel_snapshot("#x")
            .expect("channel exists")
            .users
            .contains(&clone)
    );
    // The clone sits on a relay subserver, not on our main pseudoserver.
    let subserver = f.beta.users.get(&clone).unwrap().server.clone();
    assert_eq!(
        f.beta.servers.get(&subserver).unwrap().remote,
        Some("alpha".to_string())
    );
    assert_eq!(
        f.relay.relayservers.get("beta").unwrap().get("alpha"),
        Some(&subserver)
    );

    // A second shared channel reuses the same clone.
    {
        let mut db = f.relay.db();
        db.create("alpha", "#y", "op!op@test");
        db.link(&("alpha".to_string(), "#y".to_string()), "beta", "#y")
            .unwrap();
    }
    join_and_relay(&f, &u, "#y");
    assert_eq!(clone_of(&f, &u).as_ref(), Some(&clone));
    assert!(
        f.beta
            .channel_snapshot("#y")
            .unwrap()
            .users
            .contains(&clone)
    );
}

#[test]
fn test_clones_are_never_cloned() {
    let f = fixture();
    link_channels(&f, "#x");
    let u = f.alpha.spawn_test_user("gl", "001");
    join_and_relay(&f, &u, "#x");
    let clone = clone_of(&f, &u).unwrap();

    // Re-relaying the clone's join from beta must not create a clone of
    // the clone back on alpha.
    let ts = f.beta.channel_snapshot("#x").unwrap().ts;
    f.world.hooks.dispatch(
        &f.world,
        &f.beta,
        &clone,
        "JOIN",
        &HookPayload::Join {
            channel: "#x".to_string(),
            users: vec![clone.clone()],
            ts,
            modes: Vec::new(),
            burst: false,
            channeldata: None,
        },
    );
    assert!(
        f.relay
            .relayusers
            .get(&("beta".to_string(), clone.clone()))
            .is_none(),
        "clone was cloned back"
    );
}

#[test]
fn test_quit_removes_clones() {
    let f = fixture();
    link_channels(&f, "#x");
    let u = f.alpha.spawn_test_user("gl", "001");
    join_and_relay(&f, &u, "#x");
    let clone = clone_of(&f, &u).unwrap();

    f.alpha.remove_client(&u);
    f.world.hooks.dispatch(
        &f.world,
        &f.alpha,
        &u,
        "QUIT",
        &HookPayload::Quit {
            text: "Quit: bye".to_string(),
        },
    );
    assert!(!f.beta.users.contains_key(&clone));
    assert!(clone_of(&f, &u).is_none());
}

#[test]
fn test_nick_change_renames_clone() {
    let f = fixture();
    link_channels(&f, "#x");
    let u = f.alpha.spawn_test_user("gl", "001");
    join_and_relay(&f, &u, "#x");
    let clone = clone_of(&f, &u).unwrap();

    if let Some(mut user) = f.alpha.users.get_mut(&u) {
        user.nick = "gl-away".to_string();
    }
    f.world.hooks.dispatch(
        &f.world,
        &f.alpha,
        &u,
        "NICK",
        &HookPayload::Nick {
            newnick: "gl-away".to_string(),
            oldnick: "gl".to_string(),
            ts: 12345,
        },
    );
    assert_eq!(f.beta.users.get(&clone).unwrap().nick, "gl-away/alpha");
}

#[test]
fn test_claim_blocks_mode_and_reverts() {
    let f = fixture();
    link_channels(&f, "#y");
    f.relay
        .set_claim(&f.alpha, "#y", &["alpha".to_string()])
        .unwrap();

    let u = f.alpha.spawn_test_user("gl", "001");
    join_and_relay(&f, &u, "#y");

    // A non-opped native user on the leaf sets +m.
    let villain = f.beta.spawn_test_user("villain", "002");
    f.beta.spawn_test_channel("#y", 1000, &[&villain]);
    let before = f.beta.channel_snapshot("#y").unwrap();
    modes::apply_modes(&f.beta, "#y", &[ModeChange::plus('m', None)]);
    f.world.hooks.dispatch(
        &f.world,
        &f.beta,
        &villain,
        "MODE",
        &HookPayload::Mode {
            target: "#y".to_string(),
            modes: vec![ModeChange::plus('m', None)],
            channeldata: Some(before),
        },
    );
    // The stub driver applies our reversal immediately.
    let after = f.beta.channel_snapshot("#y").unwrap();
    assert!(
        !after.modes.contains(&('m', None)),
        "unauthorised mode was not reverted"
    );
}

#[test]
fn test_claim_allows_home_network_modes() {
    let f = fixture();
    link_channels(&f, "#y");
    f.relay
        .set_claim(&f.alpha, "#y", &["alpha".to_string()])
        .unwrap();
    let u = f.alpha.spawn_test_user("gl", "001");
    join_and_relay(&f, &u, "#y");

    // Home-side modes pass CLAIM and propagate to the leaf.
    let before = f.alpha.channel_snapshot("#y").unwrap();
    modes::apply_modes(&f.alpha, "#y", &[ModeChange::plus('m', None)]);
    f.world.hooks.dispatch(
        &f.world,
        &f.alpha,
        &u,
        "MODE",
        &HookPayload::Mode {
            target: "#y".to_string(),
            modes: vec![ModeChange::plus('m', None)],
            channeldata: Some(before),
        },
    );
    assert!(f.alpha.channel_snapshot("#y").unwrap().modes.contains(&('m', None)));
    assert!(f.beta.channel_snapshot("#y").unwrap().modes.contains(&('m', None)));
}

#[test]
fn test_claim_blocks_kick_and_rejoins_clone() {
    let f = fixture();
    link_channels(&f, "#y");
    f.relay
        .set_claim(&f.alpha, "#y", &["alpha".to_string()])
        .unwrap();

    let u = f.alpha.spawn_test_user("gl", "001");
    // Give the home user op so the rejoin restores it.
    f.alpha.spawn_test_channel("#y", 1000, &[&u]);
    modes::apply_modes(&f.alpha, "#y", &[ModeChange::plus('o', Some(u.as_str()))]);
    join_and_relay(&f, &u, "#y");
    let clone = clone_of(&f, &u).unwrap();
    assert!(f.beta.channel_snapshot("#y").unwrap().users.contains(&clone));

    let kicker = f.beta.spawn_test_user("badguy", "002");
    f.beta.spawn_test_channel("#y", 1000, &[&kicker]);

    let mut wire = capture(&f.beta);
    // Simulate the kick having happened on beta.
    f.beta.remove_user_from_channel(&clone, "#y");
    f.world.hooks.dispatch(
        &f.world,
        &f.beta,
        &kicker,
        "KICK",
        &HookPayload::Kick {
            channel: "#y".to_string(),
            target: clone.clone(),
            text: "get out".to_string(),
        },
    );

    let chan = f.beta.channel_snapshot("#y").unwrap();
    assert!(chan.users.contains(&clone), "clone was not rejoined");
    assert!(
        chan.has_prefix(crate::state::PrefixLevel::Op, &clone),
        "clone lost its op on rejoin"
    );
    let lines = drain(&mut wire);
    assert!(
        lines.iter().any(|l| l.contains("NOTICE") && l.contains("claimed")),
        "kicker was not notified: {lines:?}"
    );
}

#[test]
fn test_kick_passes_claim_when_opped() {
    let f = fixture();
    link_channels(&f, "#y");
    f.relay
        .set_claim(&f.alpha, "#y", &["alpha".to_string()])
        .unwrap();

    let u = f.alpha.spawn_test_user("gl", "001");
    join_and_relay(&f, &u, "#y");
    let clone = clone_of(&f, &u).unwrap();

    let op = f.beta.spawn_test_user("chanop", "002");
    f.beta.spawn_test_channel("#y", 1000, &[&op]);
    modes::apply_modes(&f.beta, "#y", &[ModeChange::plus('o', Some(op.as_str()))]);

    f.beta.remove_user_from_channel(&clone, "#y");
    f.world.hooks.dispatch(
        &f.world,
        &f.beta,
        &op,
        "KICK",
        &HookPayload::Kick {
            channel: "#y".to_string(),
            target: clone.clone(),
            text: "ok".to_string(),
        },
    );
    // The kick propagated home: the original user left the alpha channel.
    assert!(
        !f.alpha
            .channel_snapshot("#y")
            .map(|c| c.users.contains(&u))
            .unwrap_or(false),
        "kick was not relayed to the home network"
    );
}

#[test]
fn test_netsplit_of_subserver_purges_and_reinitializes() {
    let f = fixture();
    link_channels(&f, "#x");
    let u = f.alpha.spawn_test_user("gl", "001");
    join_and_relay(&f, &u, "#x");
    let old_clone = clone_of(&f, &u).unwrap();
    let subserver = f.beta.users.get(&old_clone).unwrap().server.clone();

    // Split the subserver on beta at the state level, then deliver the
    // resulting hook.
    let payload = base::squit_common(&f.beta, &subserver, "*.net *.split").unwrap();
    f.world
        .hooks
        .dispatch(&f.world, &f.beta, "002", "SQUIT", &payload);

    // Mapping was purged and, because alpha is still up, the channel was
    // reinitialised with a fresh clone.
    let new_clone = clone_of(&f, &u).expect("clone respawned after split");
    assert_ne!(new_clone, old_clone);
    assert!(
        f.beta
            .channel_snapshot("#x")
            .unwrap()
            .users
            .contains(&new_clone)
    );
}

#[test]
fn test_save_retags_clone_nick() {
    let f = fixture();
    link_channels(&f, "#x");
    let u = f.alpha.spawn_test_user("gl", "001");
    join_and_relay(&f, &u, "#x");
    let clone = clone_of(&f, &u).unwrap();

    // A native user stole the clone's nick; the server SAVEd our clone to
    // its UID.
    f.beta.spawn_test_user("gl/alpha", "002");
    if let Some(mut user) = f.beta.users.get_mut(&clone) {
        user.nick = clone.clone();
    }
    f.world.hooks.dispatch(
        &f.world,
        &f.beta,
        "002",
        "SAVE",
        &HookPayload::Save {
            target: clone.clone(),
        },
    );
    assert_eq!(
        f.beta.users.get(&clone).unwrap().nick,
        "gl//alpha",
        "tag was not bumped"
    );
}

#[test]
fn test_kill_of_clone_is_blocked_and_respawned() {
    let f = fixture();
    link_channels(&f, "#x");
    let u = f.alpha.spawn_test_user("gl", "001");
    join_and_relay(&f, &u, "#x");
    let clone = clone_of(&f, &u).unwrap();

    let killer = f.beta.spawn_test_user("killer", "002");
    // The kill removed the clone from beta's state.
    let userdata = f.beta.remove_client(&clone);
    f.world.hooks.dispatch(
        &f.world,
        &f.beta,
        &killer,
        "KILL",
        &HookPayload::Kill {
            target: clone.clone(),
            text: "Killed (killer (die))".to_string(),
            userdata,
        },
    );

    let new_clone = clone_of(&f, &u).expect("clone respawned after kill");
    assert!(f.beta.users.contains_key(&new_clone));
    assert!(
        f.beta
            .channel_snapshot("#x")
            .unwrap()
            .users
            .contains(&new_clone)
    );
}

#[test]
fn test_channel_message_routes_to_clone() {
    let f = fixture();
    link_channels(&f, "#x");
    let u = f.alpha.spawn_test_user("gl", "001");
    join_and_relay(&f, &u, "#x");
    let clone = clone_of(&f, &u).unwrap();

    let mut wire = capture(&f.beta);
    f.world.hooks.dispatch(
        &f.world,
        &f.alpha,
        &u,
        "PRIVMSG",
        &HookPayload::Privmsg {
            target: "#x".to_string(),
            text: "hello from alpha".to_string(),
        },
    );
    let lines = drain(&mut wire);
    assert!(
        lines
            .iter()
            .any(|l| l.starts_with(&format!(":{clone} PRIVMSG #x"))),
        "message did not ride the clone: {lines:?}"
    );
}

#[test]
fn test_private_message_requires_common_channel() {
    let f = fixture();
    link_channels(&f, "#x");
    let u = f.alpha.spawn_test_user("gl", "001");
    join_and_relay(&f, &u, "#x");
    let clone = clone_of(&f, &u).unwrap();

    // A beta user with no shared channel tries to PM the clone.
    let outsider = f.beta.spawn_test_user("outsider", "002");
    let mut wire = capture(&f.beta);
    f.world.hooks.dispatch(
        &f.world,
        &f.beta,
        &outsider,
        "PRIVMSG",
        &HookPayload::Privmsg {
            target: clone.clone(),
            text: "psst".to_string(),
        },
    );
    let lines = drain(&mut wire);
    assert!(
        lines
            .iter()
            .any(|l| l.contains("NOTICE") && l.contains("common channel")),
        "no explanation notice was sent: {lines:?}"
    );
    // Nothing arrived on alpha for the original user.
    assert!(f.alpha.users.get(&u).is_some());
}

#[test]
fn test_topic_relays_and_claim_restores() {
    let f = fixture();
    link_channels(&f, "#x");
    f.relay
        .set_claim(&f.alpha, "#x", &["alpha".to_string()])
        .unwrap();
    let u = f.alpha.spawn_test_user("gl", "001");
    join_and_relay(&f, &u, "#x");

    // Home topic propagates to the leaf.
    if let Some(mut chan) = f.alpha.channels.get_mut("#x") {
        chan.topic = "welcome".to_string();
        chan.topicset = true;
    }
    f.world.hooks.dispatch(
        &f.world,
        &f.alpha,
        &u,
        "TOPIC",
        &HookPayload::Topic {
            channel: "#x".to_string(),
            text: "welcome".to_string(),
            oldtopic: Some(String::new()),
            setter: "gl".to_string(),
            ts: 1000,
        },
    );
    assert_eq!(f.beta.channel_snapshot("#x").unwrap().topic, "welcome");

    // An unauthorised topic change on the leaf gets restored.
    let villain = f.beta.spawn_test_user("villain", "002");
    f.beta.spawn_test_channel("#x", 1000, &[&villain]);
    if let Some(mut chan) = f.beta.channels.get_mut("#x") {
        chan.topic = "defaced".to_string();
    }
    f.world.hooks.dispatch(
        &f.world,
        &f.beta,
        &villain,
        "TOPIC",
        &HookPayload::Topic {
            channel: "#x".to_string(),
            text: "defaced".to_string(),
            oldtopic: Some("welcome".to_string()),
            setter: "villain".to_string(),
            ts: 1001,
        },
    );
    assert_eq!(
        f.beta.channel_snapshot("#x").unwrap().topic,
        "welcome",
        "defaced topic was not restored"
    );
}

#[test]
fn test_disconnect_purges_network() {
    let f = fixture();
    link_channels(&f, "#x");
    let u = f.alpha.spawn_test_user("gl", "001");
    join_and_relay(&f, &u, "#x");
    let clone = clone_of(&f, &u).unwrap();
    let subserver = f.beta.users.get(&clone).unwrap().server.clone();

    f.world.hooks.dispatch(
        &f.world,
        &f.alpha,
        "9ZZ",
        "DISCONNECT",
        &HookPayload::Disconnect {
            was_successful: true,
        },
    );
    assert!(clone_of(&f, &u).is_none());
    assert!(
        !f.beta.servers.contains_key(&subserver),
        "relay subserver survived the disconnect"
    );
    assert!(f.relay.relayservers.get("beta").is_none_or(|m| !m.contains_key("alpha")));
}

#[test]
fn test_oper_clone_gets_tagged_opertype() {
    let f = fixture();
    link_channels(&f, "#x");
    let u = f.alpha.spawn_test_user("oper", "001");
    if let Some(mut user) = f.alpha.users.get_mut(&u) {
        user.modes.insert(('o', None));
        user.opertype = "Network Administrator".to_string();
    }
    join_and_relay(&f, &u, "#x");
    let clone = clone_of(&f, &u).unwrap();
    assert_eq!(
        f.beta.users.get(&clone).unwrap().opertype,
        "Network Administrator (on alpha)"
    );
}

#[test]
fn test_umode_whitelist_filters() {
    let f = fixture();
    let changes = vec![
        ModeChange::plus('i', None), // invisible: whitelisted
        ModeChange::plus('s', None), // snomask: not whitelisted
    ];
    let supported = f.relay.get_supported_umodes(&f.alpha, &f.beta, &changes);
    assert_eq!(supported.len(), 1);
    assert_eq!(supported[0].letter, 'i');
}

#[test]
fn test_cmode_translation_drops_bad_bans() {
    let f = fixture();
    link_channels(&f, "#x");
    let u = f.alpha.spawn_test_user("gl", "001");
    join_and_relay(&f, &u, "#x");

    let changes = vec![
        ModeChange::plus('b', Some("*!*@bad.host")),
        ModeChange::plus('b', Some("not-a-hostmask")),
        ModeChange::plus('t', None),
    ];
    let supported = f
        .relay
        .get_supported_cmodes(&f.world, &f.alpha, &f.beta, "#x", &changes);
    let letters: Vec<char> = supported.iter().map(|m| m.letter).collect();
    assert!(letters.contains(&'b'));
    assert!(letters.contains(&'t'));
    assert_eq!(
        supported.iter().filter(|m| m.letter == 'b').count(),
        1,
        "malformed ban mask was relayed"
    );
}
