//! Relay hook subscriptions: everything that reacts to protocol events.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::hooks::{HookContext, HookPayload, PRIORITY_DEFAULT};
use crate::modes::{self, ModeChange};
use crate::relay::{Relay, normalize_nick, normalize_host};
use crate::state::Network;
use crate::world::World;

/// Substitute `$key` placeholders in the disconnect announcement template.
fn substitute(template: &str, pairs: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in pairs {
        out = out.replace(&format!("${key}"), value);
    }
    out
}

/// Iterate over a snapshot of the clones of (net, uid).
fn for_each_clone(
    relay: &Relay,
    world: &Arc<World>,
    net: &Network,
    uid: &str,
    mut f: impl FnMut(&Arc<Network>, &str),
) {
    let clones: Vec<(String, String)> = relay
        .relayusers
        .get(&(net.name.clone(), uid.to_string()))
        .map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();
    for (netname, clone) in clones {
        if let Some(remote) = world.get_network(&netname) {
            f(&remote, &clone);
        }
    }
}

/// Rename a clone after a collision, forcing at least one tag.
fn nick_collide(world: &Arc<World>, net: &Arc<Network>, target: &str) {
    let Some((homenet, home_uid)) = Relay::get_orig_user(net, target) else {
        return;
    };
    let Some(home) = world.get_network(&homenet) else {
        return;
    };
    let Some(nick) = home.users.get(&home_uid).map(|u| u.nick.clone()) else {
        return;
    };
    let newnick = normalize_nick(net, &homenet, &nick, 1, target);
    debug!(net = %net.name, clone = %target, newnick = %newnick, "fixing collided clone nick");
    if let Err(e) = net.protocol.nick(net, target, &newnick) {
        warn!(net = %net.name, error = %e, "failed to rename collided clone");
    }
}

/// Relay a (real) user's nick change to all of their clones.
fn relay_nick_change(relay: &Relay, world: &Arc<World>, net: &Network, uid: &str, newnick: &str) {
    for_each_clone(relay, world, net, uid, |remote, clone| {
        let normalized = normalize_nick(remote, &net.name, newnick, 0, clone);
        let current = remote.users.get(clone).map(|u| u.nick.clone());
        if current.as_deref() != Some(normalized.as_str())
            && let Err(e) = remote.protocol.nick(remote, clone, &normalized)
        {
            debug!(net = %remote.name, error = %e, "nick relay failed");
        }
    });
}

/// Quit all clones of a user and forget them.
fn quit_all_clones(relay: &Relay, world: &Arc<World>, net: &Network, uid: &str, text: &str) {
    for_each_clone(relay, world, net, uid, |remote, clone| {
        if let Err(e) = remote.protocol.quit(remote, clone, text) {
            debug!(net = %remote.name, error = %e, "quit relay failed");
        }
    });
    relay.relayusers.remove(&(net.name.clone(), uid.to_string()));
}

pub fn register(world: &Arc<World>, relay: &Arc<Relay>) {
    // ------------------------------------------------------------------
    // JOIN / SJOIN
    // ------------------------------------------------------------------
    for event in ["JOIN", "SJOIN"] {
        let relay = relay.clone();
        world.hooks.add_hook(event, "relay.join", PRIORITY_DEFAULT, move |ctx: &HookContext| {
            let HookPayload::Join {
                channel,
                users,
                ts,
                channeldata,
                ..
            } = ctx.payload
            else {
                return true;
            };
            if relay
                .get_relay(&(ctx.net.name.clone(), channel.clone()))
                .is_none()
            {
                return true;
            }

            let claim_passed = relay.check_claim(ctx.net, channel, ctx.source, None);
            if let Some(oldchan) = channeldata
                && !claim_passed
            {
                // A non-claimed server burst modes at us; revert every
                // prefix-mode grant it smuggled in.
                let current = ctx.net.channel_snapshot(channel);
                let cmodes = ctx.net.cmodes();
                let mut reverts = Vec::new();
                for user in users {
                    let old_levels = oldchan.get_prefix_modes(user);
                    let new_levels = current
                        .as_ref()
                        .map(|c| c.get_prefix_modes(user))
                        .unwrap_or_default();
                    for level in new_levels {
                        if !old_levels.contains(&level)
                            && let Some(letter) = cmodes.prefix_letter(level)
                        {
                            reverts.push(ModeChange::minus(letter, Some(user.as_str())));
                        }
                    }
                }
                if !reverts.is_empty() {
                    debug!(net = %ctx.net.name, channel = %channel, "reverting burst modes (CLAIM)");
                    let sid = ctx.net.sid();
                    let _ = ctx.net.protocol.mode(ctx.net, &sid, channel, &reverts);
                }
            }

            relay.relay_joins(ctx.world, ctx.net, channel, users, *ts, false);
            true
        });
    }

    // ------------------------------------------------------------------
    // QUIT
    // ------------------------------------------------------------------
    {
        let relay = relay.clone();
        world.hooks.add_hook("QUIT", "relay.quit", PRIORITY_DEFAULT, move |ctx: &HookContext| {
            let HookPayload::Quit { text } = ctx.payload else {
                return true;
            };
            quit_all_clones(&relay, ctx.world, ctx.net, ctx.source, text);
            true
        });
    }

    // ------------------------------------------------------------------
    // SQUIT (netsplits)
    // ------------------------------------------------------------------
    {
        let relay = relay.clone();
        world.hooks.add_hook("SQUIT", "relay.squit", PRIORITY_DEFAULT, move |ctx: &HookContext| {
            let HookPayload::Squit {
                target,
                users,
                name,
                uplink,
                ..
            } = ctx.payload
            else {
                return true;
            };

            let is_relay_server = relay
                .relayservers
                .get(&ctx.net.name)
                .is_some_and(|map| map.values().any(|sid| sid == target));
            if is_relay_server {
                // Someone split one of our relay subservers. Clean up the
                // mappings and rebuild once the represented net is ready.
                let remotenet = name.split('.').next().unwrap_or(name).to_string();
                if let Some(mut map) = relay.relayservers.get_mut(&ctx.net.name) {
                    map.remove(&remotenet);
                }
                relay.relayusers.retain(|(home, _), targets| {
                    if *home == remotenet {
                        targets.remove(&ctx.net.name);
                    }
                    true
                });
                if let Some(remote) = ctx.world.get_network(&remotenet)
                    && remote.is_connected()
                {
                    info!(net = %ctx.net.name, remote = %remotenet, "relay subserver split; reinitializing");
                    relay.initialize_all(ctx.world, &remote);
                }
            } else {
                // A real netsplit: fake quits for everyone lost.
                let show_splits = ctx.world.config().relay.show_netsplits;
                let text = if show_splits {
                    let uplink_name = uplink
                        .as_ref()
                        .and_then(|sid| ctx.net.servers.get(sid).map(|s| s.name.clone()))
                        .unwrap_or_else(|| "*.net".to_string());
                    format!("{uplink_name} {name}")
                } else {
                    "*.net *.split".to_string()
                };
                for uid in users {
                    quit_all_clones(&relay, ctx.world, ctx.net, uid, &text);
                }
            }
            true
        });
    }

    // ------------------------------------------------------------------
    // NICK / SAVE / SVSNICK
    // ------------------------------------------------------------------
    {
        let relay = relay.clone();
        world.hooks.add_hook("NICK", "relay.nick", PRIORITY_DEFAULT, move |ctx: &HookContext| {
            let HookPayload::Nick { newnick, .. } = ctx.payload else {
                return true;
            };
            relay_nick_change(&relay, ctx.world, ctx.net, ctx.source, newnick);
            true
        });
    }
    {
        let relay = relay.clone();
        world.hooks.add_hook("SAVE", "relay.save", PRIORITY_DEFAULT, move |ctx: &HookContext| {
            let HookPayload::Save { target } = ctx.payload else {
                return true;
            };
            if Relay::is_relay_client(ctx.net, target) {
                // One of our clones lost a nick fight; retag it.
                nick_collide(ctx.world, ctx.net, target);
            } else {
                // A real user got saved; relay the forced change like any
                // other rename (their nick is now their UID).
                relay_nick_change(&relay, ctx.world, ctx.net, target, target);
            }
            true
        });
    }
    {
        world.hooks.add_hook(
            "SVSNICK",
            "relay.svsnick",
            PRIORITY_DEFAULT,
            move |ctx: &HookContext| {
                let HookPayload::SvsNick { target, .. } = ctx.payload else {
                    return true;
                };
                if Relay::is_relay_client(ctx.net, target) {
                    nick_collide(ctx.world, ctx.net, target);
                }
                true
            },
        );
    }

    // ------------------------------------------------------------------
    // PART
    // ------------------------------------------------------------------
    {
        let relay = relay.clone();
        world.hooks.add_hook("PART", "relay.part", PRIORITY_DEFAULT, move |ctx: &HookContext| {
            let HookPayload::Part { channels, text } = ctx.payload else {
                return true;
            };
            let pseudoclient = ctx.net.pseudoclient.read().clone();
            if Some(ctx.source.to_string()) == pseudoclient {
                // The main client was force-parted. On clientbot treat it
                // as a channel clear and rejoin.
                if !ctx.net.protocol.caps().can_spawn_clients {
                    for channel in channels {
                        if relay
                            .get_relay(&(ctx.net.name.clone(), channel.clone()))
                            .is_none()
                        {
                            continue;
                        }
                        let members: Vec<String> = ctx
                            .net
                            .channel_snapshot(channel)
                            .map(|c| c.users.iter().cloned().collect())
                            .unwrap_or_default();
                        for user in members {
                            if ctx.net.is_internal_client(&user)
                                || Relay::is_relay_client(ctx.net, &user)
                            {
                                continue;
                            }
                            let payload = HookPayload::Kick {
                                channel: channel.clone(),
                                target: user,
                                text: format!("Clientbot was force parted (Reason: {text})"),
                            };
                            let sid = ctx.net.sid();
                            ctx.world
                                .hooks
                                .dispatch(ctx.world, ctx.net, &sid, "KICK", &payload);
                        }
                        if let Some(uid) = &pseudoclient {
                            let _ = ctx.net.protocol.join(ctx.net, uid, channel);
                        }
                    }
                }
                return true;
            }

            for channel in channels {
                for_each_clone(&relay, ctx.world, ctx.net, ctx.source, |remote, clone| {
                    let Some(remotechan) =
                        relay.get_remote_channel(ctx.net, remote, channel)
                    else {
                        return;
                    };
                    if let Err(e) = remote.protocol.part(remote, clone, &remotechan, text) {
                        debug!(net = %remote.name, error = %e, "part relay failed");
                        return;
                    }
                    relay.quit_if_idle(remote, ctx.net, ctx.source, clone);
                });
            }
            true
        });
    }

    // ------------------------------------------------------------------
    // PRIVMSG / NOTICE
    // ------------------------------------------------------------------
    for event in ["PRIVMSG", "NOTICE"] {
        let relay = relay.clone();
        world.hooks.add_hook(event, "relay.messages", PRIORITY_DEFAULT, move |ctx: &HookContext| {
            let (target, text, notice) = match ctx.payload {
                HookPayload::Privmsg { target, text } => (target, text, false),
                HookPayload::Notice { target, text } => (target, text, true),
                _ => return true,
            };
            // PMs between our own clients would loop.
            if ctx.net.is_internal_client(ctx.source)
                && ctx.net.is_internal_client(target)
            {
                return true;
            }
            let sender_is_server = ctx.net.servers.contains_key(ctx.source);
            if sender_is_server && !notice {
                debug!(net = %ctx.net.name, "dropping PRIVMSG from a server");
                return true;
            }

            // Keep status prefixes (@#chan) aside while resolving.
            let (prefix, bare_target) = match target.find('#') {
                Some(pos) => (&target[..pos], &target[pos..]),
                None => ("", target.as_str()),
            };

            if bare_target.starts_with('#') {
                for remote in ctx.world.all_networks() {
                    if remote.name == ctx.net.name
                        || !remote.is_connected()
                        || !ctx.net.is_connected()
                    {
                        continue;
                    }
                    let Some(real_target) =
                        relay.get_remote_channel(ctx.net, &remote, bare_target)
                    else {
                        continue;
                    };

                    let clone =
                        relay.get_remote_user(ctx.world, ctx.net, &remote, ctx.source, false, 0);
                    let (sender, real_text) = match clone {
                        Some(clone) => (clone, text.clone()),
                        None => {
                            if !ctx.world.config().relay.accept_weird_senders {
                                continue;
                            }
                            // Route clone-less senders through the main
                            // client (or our subserver SID for notices),
                            // tagging the origin.
                            let real_text = if !sender_is_server
                                && ctx.world.services.by_uid(ctx.net, ctx.source).is_none()
                            {
                                format!(
                                    "<{}/{}> {}",
                                    ctx.net.get_friendly_name(ctx.source),
                                    ctx.net.name,
                                    text
                                )
                            } else {
                                text.clone()
                            };
                            let via = if notice {
                                relay.get_remote_sid(&remote, ctx.net, false)
                            } else {
                                remote.pseudoclient.read().clone()
                            };
                            let Some(via) = via else {
                                continue;
                            };
                            (via, real_text)
                        }
                    };

                    let full_target = format!("{prefix}{real_target}");
                    let result = if notice {
                        remote.protocol.notice(&remote, &sender, &full_target, &real_text)
                    } else {
                        remote.protocol.message(&remote, &sender, &full_target, &real_text)
                    };
                    if let Err(e) = result {
                        warn!(net = %remote.name, error = %e, "message relay failed");
                    }
                }
            } else {
                // Private message to a clone.
                let Some((homenet, real_target)) = Relay::get_orig_user(ctx.net, bare_target)
                else {
                    return true;
                };
                let has_common = relay
                    .relayusers
                    .get(&(ctx.net.name.clone(), ctx.source.to_string()))
                    .is_some_and(|map| map.contains_key(&homenet));
                if !has_common {
                    let nick = ctx.net.get_friendly_name(bare_target);
                    ctx.net.msg(
                        ctx.source,
                        &format!(
                            "You must be in a common channel with {nick} in order to send messages."
                        ),
                        true,
                    );
                    return true;
                }
                let Some(remote) = ctx.world.get_network(&homenet) else {
                    return true;
                };
                if !remote.protocol.caps().can_spawn_clients
                    && !ctx.world.config().relay.allow_clientbot_pms
                {
                    ctx.net.msg(
                        ctx.source,
                        "Private messages to users connected via Clientbot have been administratively disabled.",
                        true,
                    );
                    return true;
                }
                let Some(sender) =
                    relay.get_remote_user(ctx.world, ctx.net, &remote, ctx.source, false, 0)
                else {
                    return true;
                };
                let result = if notice {
                    remote.protocol.notice(&remote, &sender, &real_target, text)
                } else {
                    remote.protocol.message(&remote, &sender, &real_target, text)
                };
                if let Err(e) = result {
                    warn!(net = %remote.name, error = %e, "private message relay failed");
                }
            }
            true
        });
    }

    // ------------------------------------------------------------------
    // KICK
    // ------------------------------------------------------------------
    {
        let relay = relay.clone();
        world.hooks.add_hook("KICK", "relay.kick", PRIORITY_DEFAULT, move |ctx: &HookContext| {
            let HookPayload::Kick {
                channel,
                target,
                text,
            } = ctx.payload
            else {
                return true;
            };
            let kicker = ctx.source;
            let pseudoclient = ctx.net.pseudoclient.read().clone();

            // Clientbot: kicking the relayer bot clears the channel.
            if !ctx.net.protocol.caps().can_spawn_clients
                && pseudoclient.as_deref() == Some(target.as_str())
            {
                let members: Vec<String> = ctx
                    .net
                    .channel_snapshot(channel)
                    .map(|c| c.users.iter().cloned().collect())
                    .unwrap_or_default();
                for user in members {
                    if ctx.net.is_internal_client(&user) || Relay::is_relay_client(ctx.net, &user)
                    {
                        continue;
                    }
                    let payload = HookPayload::Kick {
                        channel: channel.clone(),
                        target: user,
                        text: format!(
                            "Clientbot kicked by {} (Reason: {})",
                            ctx.net.get_friendly_name(kicker),
                            text
                        ),
                    };
                    let sid = ctx.net.sid();
                    ctx.world
                        .hooks
                        .dispatch(ctx.world, ctx.net, &sid, "KICK", &payload);
                }
                return true;
            }

            if relay
                .get_relay(&(ctx.net.name.clone(), channel.clone()))
                .is_none()
                || ctx.world.services.by_uid(ctx.net, target).is_some()
            {
                return true;
            }

            let origuser = Relay::get_orig_user(ctx.net, target);
            for remote in ctx.world.all_networks() {
                if remote.name == ctx.net.name || !remote.is_connected() {
                    continue;
                }
                let Some(remotechan) = relay.get_remote_channel(ctx.net, &remote, channel)
                else {
                    continue;
                };
                let real_kicker =
                    relay.get_remote_user(ctx.world, ctx.net, &remote, kicker, false, 0);

                let real_target = if !Relay::is_relay_client(ctx.net, target) {
                    // Both kicker and target are native here; the IRCd has
                    // already sorted out permissions.
                    relay.get_remote_user(ctx.world, ctx.net, &remote, target, false, 0)
                } else {
                    let real_target = relay.get_orig_user_on(ctx.world, ctx.net, target, &remote);
                    if !relay.check_claim(ctx.net, channel, kicker, None) {
                        // CLAIM says no: put the clone back with the modes
                        // it had, and tell the kicker why.
                        let modes = real_target
                            .as_ref()
                            .map(|rt| {
                                Relay::get_prefix_modes_str(
                                    &remote, ctx.net, &remotechan, rt, None,
                                )
                            })
                            .unwrap_or_default();
                        let sid = ctx.net.sid();
                        let _ = ctx.net.protocol.sjoin(
                            ctx.net,
                            &sid,
                            channel,
                            &[(modes, target.clone())],
                            None,
                            &[],
                        );
                        if ctx.net.users.contains_key(kicker) {
                            info!(
                                net = %ctx.net.name,
                                kicker = %ctx.net.get_friendly_name(kicker),
                                channel = %channel,
                                "blocked kick of relay client (CLAIM)"
                            );
                            ctx.net.msg(
                                kicker,
                                &format!(
                                    "This channel is claimed; your kick to {channel} has been blocked because you are not (half)opped."
                                ),
                                true,
                            );
                        }
                        return true;
                    }
                    real_target
                };

                let Some(real_target) = real_target else {
                    continue;
                };
                if let Some(real_kicker) = real_kicker {
                    let _ = remote
                        .protocol
                        .kick(&remote, &real_kicker, &remotechan, &real_target, text);
                } else {
                    // Kick came from a server or someone with no clone
                    // there; attribute it in the reason text.
                    let kname = ctx.net.get_friendly_name(kicker);
                    let text = if ctx.net.protocol.caps().can_spawn_clients {
                        format!("({}/{}) {}", kname, ctx.net.name, text)
                    } else {
                        text.clone()
                    };
                    let rsid = relay
                        .get_remote_sid(&remote, ctx.net, true)
                        .unwrap_or_else(|| remote.sid());
                    let _ = remote
                        .protocol
                        .kick(&remote, &rsid, &remotechan, &real_target, &text);
                }
                if origuser.is_none() {
                    relay.quit_if_idle(&remote, ctx.net, target, &real_target);
                }
            }

            // A kicked clone that lost its last shared channel goes away.
            if let Some(origuser) = origuser {
                let idle = ctx
                    .net
                    .users
                    .get(target)
                    .is_some_and(|u| u.channels.is_empty());
                if idle {
                    if let Some(mut map) = relay.relayusers.get_mut(&origuser) {
                        map.remove(&ctx.net.name);
                    }
                    let _ = ctx
                        .net
                        .protocol
                        .quit(ctx.net, target, "Left all shared channels.");
                }
            }
            true
        });
    }

    // ------------------------------------------------------------------
    // CHGHOST / CHGIDENT / CHGNAME
    // ------------------------------------------------------------------
    for event in ["CHGHOST", "CHGIDENT", "CHGNAME"] {
        let relay = relay.clone();
        world.hooks.add_hook(event, "relay.chgclient", PRIORITY_DEFAULT, move |ctx: &HookContext| {
            use crate::protocols::ClientField;
            let (target, field, value) = match ctx.payload {
                HookPayload::ChgHost { target, newhost } => {
                    (target, ClientField::Host, newhost.clone())
                }
                HookPayload::ChgIdent { target, newident } => {
                    (target, ClientField::Ident, newident.clone())
                }
                HookPayload::ChgName { target, newgecos } => {
                    (target, ClientField::Gecos, newgecos.clone())
                }
                _ => return true,
            };
            for_each_clone(&relay, ctx.world, ctx.net, target, |remote, clone| {
                let text = if field == ClientField::Host {
                    normalize_host(remote, &value)
                } else {
                    value.clone()
                };
                if let Err(e) = remote.protocol.update_client(remote, clone, field, &text) {
                    // Not every IRCd can change every field remotely.
                    debug!(net = %remote.name, error = %e, "update_client skipped");
                }
            });
            true
        });
    }

    // ------------------------------------------------------------------
    // MODE
    // ------------------------------------------------------------------
    {
        let relay = relay.clone();
        world.hooks.add_hook("MODE", "relay.mode", PRIORITY_DEFAULT, move |ctx: &HookContext| {
            let HookPayload::Mode {
                target,
                modes: changes,
                channeldata,
            } = ctx.payload
            else {
                return true;
            };

            if target.starts_with('#') {
                if !relay.check_claim(ctx.net, target, ctx.source, channeldata.as_ref()) {
                    // Blocked by CLAIM: revert the change atomically.
                    let reversed = modes::reverse_modes(
                        ctx.net,
                        target,
                        changes,
                        channeldata.as_ref(),
                    );
                    debug!(net = %ctx.net.name, channel = %target, "reversing mode change (CLAIM)");
                    if !reversed.is_empty() {
                        let sid = ctx.net.sid();
                        let _ = ctx.net.protocol.mode(ctx.net, &sid, target, &reversed);
                    }
                    return true;
                }
                for remote in ctx.world.all_networks() {
                    if remote.name == ctx.net.name || !remote.is_connected() {
                        continue;
                    }
                    let Some(remotechan) = relay.get_remote_channel(ctx.net, &remote, target)
                    else {
                        continue;
                    };
                    let supported =
                        relay.get_supported_cmodes(ctx.world, ctx.net, &remote, target, changes);
                    if supported.is_empty() {
                        continue;
                    }
                    // Mode from a user with a clone rides the clone; else
                    // it comes from our subserver.
                    let via = relay
                        .get_remote_user(ctx.world, ctx.net, &remote, ctx.source, false, 0)
                        .or_else(|| relay.get_remote_sid(&remote, ctx.net, true))
                        .unwrap_or_else(|| remote.sid());
                    let _ = remote.protocol.mode(&remote, &via, &remotechan, &supported);
                }
            } else {
                // User modes relay only onto the user's own clones.
                for remote in ctx.world.all_networks() {
                    if remote.name == ctx.net.name || !remote.is_connected() {
                        continue;
                    }
                    let mut supported = relay.get_supported_umodes(ctx.net, &remote, changes);
                    // Mirror oper-ups and -downs as hideoper changes.
                    if let Some(hideoper) = remote.umodes().letter("hideoper") {
                        if changes.iter().any(|m| m.adding && m.letter == 'o') {
                            supported.push(ModeChange::plus(hideoper, None));
                        } else if changes.iter().any(|m| !m.adding && m.letter == 'o') {
                            supported.push(ModeChange::minus(hideoper, None));
                        }
                    }
                    let Some(clone) =
                        relay.get_remote_user(ctx.world, ctx.net, &remote, target, false, 0)
                    else {
                        continue;
                    };
                    if !supported.is_empty() {
                        let _ = remote.protocol.mode(&remote, &clone, &clone, &supported);
                    }
                }
            }
            true
        });
    }

    // ------------------------------------------------------------------
    // TOPIC
    // ------------------------------------------------------------------
    {
        let relay = relay.clone();
        world.hooks.add_hook("TOPIC", "relay.topic", PRIORITY_DEFAULT, move |ctx: &HookContext| {
            let HookPayload::Topic {
                channel,
                text,
                oldtopic,
                ..
            } = ctx.payload
            else {
                return true;
            };
            if relay.check_claim(ctx.net, channel, ctx.source, None) {
                for remote in ctx.world.all_networks() {
                    if remote.name == ctx.net.name || !remote.is_connected() {
                        continue;
                    }
                    let Some(remotechan) = relay.get_remote_channel(ctx.net, &remote, channel)
                    else {
                        continue;
                    };
                    // Don't echo identical topics back and forth.
                    if remote
                        .channel_snapshot(&remotechan)
                        .is_some_and(|c| c.topic == *text)
                    {
                        continue;
                    }
                    let clone =
                        relay.get_remote_user(ctx.world, ctx.net, &remote, ctx.source, false, 0);
                    match clone {
                        Some(clone) => {
                            let _ = remote.protocol.topic(&remote, &clone, &remotechan, text);
                        }
                        None => {
                            if let Some(rsid) = relay.get_remote_sid(&remote, ctx.net, true) {
                                let _ = remote
                                    .protocol
                                    .topic_burst(&remote, &rsid, &remotechan, text);
                            }
                        }
                    }
                }
            } else if let Some(oldtopic) = oldtopic {
                // Blocked by CLAIM: restore the previous topic.
                let sid = ctx.net.sid();
                let _ = ctx.net.protocol.topic_burst(ctx.net, &sid, channel, oldtopic);
            }
            true
        });
    }

    // ------------------------------------------------------------------
    // KILL
    // ------------------------------------------------------------------
    {
        let relay = relay.clone();
        world.hooks.add_hook("KILL", "relay.kill", PRIORITY_DEFAULT, move |ctx: &HookContext| {
            let HookPayload::Kill {
                target,
                text,
                userdata,
            } = ctx.payload
            else {
                return true;
            };
            let realuser = userdata
                .as_ref()
                .and_then(|u| u.remote.clone())
                .or_else(|| Relay::get_orig_user(ctx.net, target));

            match realuser {
                Some((homenet, home_uid)) if homenet != ctx.net.name => {
                    // Killing over the relay is not allowed: respawn the
                    // clone and rejoin it everywhere it belongs.
                    if let Some(mut map) = relay
                        .relayusers
                        .get_mut(&(homenet.clone(), home_uid.clone()))
                    {
                        map.remove(&ctx.net.name);
                    }
                    let Some(home) = ctx.world.get_network(&homenet) else {
                        return true;
                    };
                    let channels: Vec<String> = home
                        .users
                        .get(&home_uid)
                        .map(|u| u.channels.iter().cloned().collect())
                        .unwrap_or_default();
                    for homechan in channels {
                        let Some(localchan) =
                            relay.get_remote_channel(&home, ctx.net, &homechan)
                        else {
                            continue;
                        };
                        let modes = Relay::get_prefix_modes_str(
                            &home, ctx.net, &homechan, &home_uid, None,
                        );
                        let Some(clone) = relay
                            .get_remote_user(ctx.world, &home, ctx.net, &home_uid, true, 1)
                        else {
                            continue;
                        };
                        if let Some(rsid) = relay.get_remote_sid(ctx.net, &home, true) {
                            let _ = ctx.net.protocol.sjoin(
                                ctx.net,
                                &rsid,
                                &localchan,
                                &[(modes.clone(), clone)],
                                None,
                                &[],
                            );
                        }
                    }
                    info!(
                        net = %ctx.net.name,
                        killer = %ctx.net.get_friendly_name(ctx.source),
                        reason = %text,
                        "blocked kill of relay client"
                    );
                    if ctx.net.users.contains_key(ctx.source) {
                        ctx.net.msg(
                            ctx.source,
                            "Your kill has been blocked because killing users over the relay is not allowed.",
                            true,
                        );
                    }
                }
                _ => {
                    // Local user killed; some IRCds don't send a QUIT for
                    // these, so mirror it ourselves.
                    if userdata.is_some() {
                        quit_all_clones(&relay, ctx.world, ctx.net, target, text);
                    }
                }
            }
            true
        });
    }

    // ------------------------------------------------------------------
    // AWAY
    // ------------------------------------------------------------------
    {
        let relay = relay.clone();
        world.hooks.add_hook("AWAY", "relay.away", PRIORITY_DEFAULT, move |ctx: &HookContext| {
            let HookPayload::Away { text } = ctx.payload else {
                return true;
            };
            for_each_clone(&relay, ctx.world, ctx.net, ctx.source, |remote, clone| {
                let _ = remote.protocol.away(remote, clone, text);
            });
            true
        });
    }

    // ------------------------------------------------------------------
    // INVITE
    // ------------------------------------------------------------------
    {
        let relay = relay.clone();
        world.hooks.add_hook("INVITE", "relay.invite", PRIORITY_DEFAULT, move |ctx: &HookContext| {
            let HookPayload::Invite { target, channel } = ctx.payload else {
                return true;
            };
            if !Relay::is_relay_client(ctx.net, target) {
                return true;
            }
            let Some((remotenet, remoteuser)) = Relay::get_orig_user(ctx.net, target) else {
                return true;
            };
            let Some(remote) = ctx.world.get_network(&remotenet) else {
                return true;
            };
            let remotechan = relay.get_remote_channel(ctx.net, &remote, channel);
            let remotesource =
                relay.get_remote_user(ctx.world, ctx.net, &remote, ctx.source, false, 0);
            match (remotesource, remotechan) {
                (None, _) => {
                    let nick = ctx.net.get_friendly_name(target);
                    ctx.net.msg(
                        ctx.source,
                        &format!("You must be in a common channel with {nick} to invite them to channels."),
                        true,
                    );
                }
                (_, None) => {
                    ctx.net.msg(
                        ctx.source,
                        "You cannot invite someone to a channel not on their network!",
                        true,
                    );
                }
                (Some(remotesource), Some(remotechan)) => {
                    let _ = remote
                        .protocol
                        .invite(&remote, &remotesource, &remoteuser, &remotechan);
                }
            }
            true
        });
    }

    // ------------------------------------------------------------------
    // ENDBURST
    // ------------------------------------------------------------------
    {
        let relay = relay.clone();
        world.hooks.add_hook(
            "ENDBURST",
            "relay.endburst",
            PRIORITY_DEFAULT - 100,
            move |ctx: &HookContext| {
                if Some(ctx.source.to_string()) == ctx.net.uplink() {
                    relay.initialize_all(ctx.world, ctx.net);
                }
                true
            },
        );
    }

    // ------------------------------------------------------------------
    // CLIENT_OPERED / CLIENT_SERVICES_LOGIN
    // ------------------------------------------------------------------
    {
        let relay = relay.clone();
        world.hooks.add_hook(
            "CLIENT_OPERED",
            "relay.operup",
            PRIORITY_DEFAULT,
            move |ctx: &HookContext| {
                let HookPayload::Opered { opertype } = ctx.payload else {
                    return true;
                };
                let tagged = format!("{} (on {})", opertype, ctx.net.full_netname());
                for_each_clone(&relay, ctx.world, ctx.net, ctx.source, |remote, clone| {
                    if let Some(mut user) = remote.users.get_mut(clone) {
                        user.opertype = tagged.clone();
                    }
                });
                true
            },
        );
    }
    {
        let relay = relay.clone();
        world.hooks.add_hook(
            "CLIENT_SERVICES_LOGIN",
            "relay.login",
            PRIORITY_DEFAULT,
            move |ctx: &HookContext| {
                let HookPayload::ServicesLogin { account } = ctx.payload else {
                    return true;
                };
                for_each_clone(&relay, ctx.world, ctx.net, ctx.source, |remote, clone| {
                    if let Some(mut user) = remote.users.get_mut(clone) {
                        user.services_account = account.clone();
                    }
                });
                true
            },
        );
    }

    // ------------------------------------------------------------------
    // WHOIS of relay clones
    // ------------------------------------------------------------------
    {
        world.hooks.add_hook("WHOIS", "relay.whois", PRIORITY_DEFAULT, move |ctx: &HookContext| {
            let HookPayload::Whois { target, server } = ctx.payload else {
                return true;
            };
            let Some((homenet, home_uid)) = Relay::get_orig_user(ctx.net, target) else {
                return true;
            };
            let Some(home) = ctx.world.get_network(&homenet) else {
                return true;
            };
            let Some(homeuser) = home.users.get(&home_uid).map(|u| u.clone()) else {
                return true;
            };
            let nick = ctx.net.get_friendly_name(target);
            let _ = ctx.net.protocol.numeric(
                ctx.net,
                server,
                320,
                ctx.source,
                &format!(
                    "{nick} :is a remote user connected via the relay. Home network: {}; Home nick: {}",
                    home.full_netname(),
                    homeuser.nick
                ),
            );
            let _ = ctx.net.protocol.numeric(
                ctx.net,
                server,
                318,
                ctx.source,
                &format!("{nick} :End of /WHOIS list"),
            );
            true
        });
    }

    // ------------------------------------------------------------------
    // DISCONNECT
    // ------------------------------------------------------------------
    {
        let relay = relay.clone();
        world.hooks.add_hook(
            "DISCONNECT",
            "relay.disconnect",
            PRIORITY_DEFAULT,
            move |ctx: &HookContext| {
                let HookPayload::Disconnect { was_successful } = ctx.payload else {
                    return true;
                };
                let netname = ctx.net.name.clone();

                // Drop every clone mapping touching this network.
                relay.relayusers.retain(|(home, _), targets| {
                    targets.remove(&netname);
                    home != &netname
                });

                // SQUIT the subservers representing this network elsewhere.
                for remote in ctx.world.all_networks() {
                    if remote.name == netname {
                        continue;
                    }
                    let rsid = relay
                        .relayservers
                        .get(&remote.name)
                        .and_then(|map| map.get(&netname).cloned());
                    if let Some(rsid) = rsid {
                        let sid = remote.sid();
                        let _ = remote.protocol.squit(
                            &remote,
                            &sid,
                            &rsid,
                            "Relay network lost connection.",
                        );
                        if let Some(mut map) = relay.relayservers.get_mut(&remote.name) {
                            map.remove(&netname);
                        }
                    }
                }
                relay.relayservers.remove(&netname);

                // Announce the loss to every leaf of channels homed here.
                let announcement = ctx.world.config().relay.disconnect_announcement.clone();
                if let Some(template) = announcement
                    && *was_successful
                {
                    let leaves: Vec<((String, String), (String, String))> = {
                        let db = relay.db();
                        db.iter()
                            .filter(|(home, _)| home.0 == netname)
                            .flat_map(|(home, entry)| {
                                entry
                                    .links
                                    .iter()
                                    .map(|leaf| (home.clone(), leaf.clone()))
                                    .collect::<Vec<_>>()
                            })
                            .collect()
                    };
                    for ((homenet, homechan), (leafnet, leafchan)) in leaves {
                        let Some(remote) = ctx.world.get_network(&leafnet) else {
                            continue;
                        };
                        if !remote.is_connected() {
                            continue;
                        }
                        let text = substitute(
                            &template,
                            &[
                                ("homenetwork", homenet.as_str()),
                                ("homechannel", homechan.as_str()),
                                ("network", leafnet.as_str()),
                                ("channel", leafchan.as_str()),
                            ],
                        );
                        remote.msg(&leafchan, &text, false);
                    }
                }
                true
            },
        );
    }
}
