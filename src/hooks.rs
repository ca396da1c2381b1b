//! The hook bus: named events dispatched to priority-ordered handlers.
//!
//! Protocol drivers translate wire traffic into hook events; the relay and
//! the service registry subscribe to them. Handler failures are isolated so
//! one misbehaving subscriber cannot take down the chain, and a handler can
//! return `false` to suppress delivery to the rest of the chain.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error};

use crate::modes::ModeChange;
use crate::state::{Channel, Network, Server, User};
use crate::world::World;

/// Default priority for handlers that don't care about ordering.
pub const PRIORITY_DEFAULT: i32 = 500;

/// One hook event emitted by a protocol driver.
#[derive(Debug, Clone)]
pub struct HookEvent {
    /// UID or SID the event originated from.
    pub source: String,
    /// Event name; usually `payload.name()` but drivers may re-label
    /// (e.g. a forced part delivered as KICK).
    pub command: String,
    pub payload: HookPayload,
}

impl HookEvent {
    pub fn new(source: &str, payload: HookPayload) -> Self {
        Self {
            source: source.to_string(),
            command: payload.name().to_string(),
            payload,
        }
    }

    pub fn renamed(source: &str, command: &str, payload: HookPayload) -> Self {
        Self {
            source: source.to_string(),
            command: command.to_string(),
            payload,
        }
    }
}

/// Protocol-agnostic event payloads, named per the cross-protocol hook
/// vocabulary.
#[derive(Debug, Clone)]
pub enum HookPayload {
    /// A new user was introduced.
    Uid {
        uid: String,
        ts: i64,
        nick: String,
        ident: String,
        host: String,
        realhost: Option<String>,
        ip: String,
    },
    Quit {
        text: String,
    },
    Kill {
        target: String,
        text: String,
        /// The removed record when the KILL wasn't preceded by a QUIT.
        userdata: Option<User>,
    },
    /// JOIN and SJOIN (channel burst; `burst` set) share one payload.
    Join {
        channel: String,
        users: Vec<String>,
        ts: i64,
        modes: Vec<ModeChange>,
        burst: bool,
        /// Pre-burst channel state, for CLAIM diffing.
        channeldata: Option<Channel>,
    },
    Part {
        channels: Vec<String>,
        text: String,
    },
    Kick {
        channel: String,
        target: String,
        text: String,
    },
    Nick {
        newnick: String,
        oldnick: String,
        ts: i64,
    },
    /// Forced nick-to-UID collision resolution.
    Save {
        target: String,
    },
    SvsNick {
        target: String,
        newnick: String,
    },
    Mode {
        target: String,
        modes: Vec<ModeChange>,
        /// Pre-change channel state, for CLAIM reversion.
        channeldata: Option<Channel>,
    },
    Topic {
        channel: String,
        text: String,
        oldtopic: Option<String>,
        setter: String,
        ts: i64,
    },
    Squit {
        target: String,
        users: Vec<String>,
        name: String,
        uplink: Option<String>,
        /// Channel name -> nicks that were lost there.
        nicks: HashMap<String, Vec<String>>,
        serverdata: Option<Server>,
    },
    ChgHost {
        target: String,
        newhost: String,
    },
    ChgIdent {
        target: String,
        newident: String,
    },
    ChgName {
        target: String,
        newgecos: String,
    },
    Away {
        text: String,
    },
    Invite {
        target: String,
        channel: String,
    },
    Knock {
        channel: String,
        text: String,
    },
    ServicesLogin {
        account: String,
    },
    Opered {
        opertype: String,
    },
    Endburst,
    Disconnect {
        was_successful: bool,
    },
    Privmsg {
        target: String,
        text: String,
    },
    Notice {
        target: String,
        text: String,
    },
    Whois {
        target: String,
        server: String,
    },
}

impl HookPayload {
    pub fn name(&self) -> &'static str {
        match self {
            HookPayload::Uid { .. } => "UID",
            HookPayload::Quit { .. } => "QUIT",
            HookPayload::Kill { .. } => "KILL",
            HookPayload::Join { burst: true, .. } => "SJOIN",
            HookPayload::Join { burst: false, .. } => "JOIN",
            HookPayload::Part { .. } => "PART",
            HookPayload::Kick { .. } => "KICK",
            HookPayload::Nick { .. } => "NICK",
            HookPayload::Save { .. } => "SAVE",
            HookPayload::SvsNick { .. } => "SVSNICK",
            HookPayload::Mode { .. } => "MODE",
            HookPayload::Topic { .. } => "TOPIC",
            HookPayload::Squit { .. } => "SQUIT",
            HookPayload::ChgHost { .. } => "CHGHOST",
            HookPayload::ChgIdent { .. } => "CHGIDENT",
            HookPayload::ChgName { .. } => "CHGNAME",
            HookPayload::Away { .. } => "AWAY",
            HookPayload::Invite { .. } => "INVITE",
            HookPayload::Knock { .. } => "KNOCK",
            HookPayload::ServicesLogin { .. } => "CLIENT_SERVICES_LOGIN",
            HookPayload::Opered { .. } => "CLIENT_OPERED",
            HookPayload::Endburst => "ENDBURST",
            HookPayload::Disconnect { .. } => "DISCONNECT",
            HookPayload::Privmsg { .. } => "PRIVMSG",
            HookPayload::Notice { .. } => "NOTICE",
            HookPayload::Whois { .. } => "WHOIS",
        }
    }
}

/// Everything a handler gets to see.
pub struct HookContext<'a> {
    pub world: &'a Arc<World>,
    pub net: &'a Arc<Network>,
    pub source: &'a str,
    pub command: &'a str,
    pub payload: &'a HookPayload,
}

type Handler = Box<dyn Fn(&HookContext) -> bool + Send + Sync>;

struct Registration {
    priority: i32,
    seq: u64,
    label: String,
    handler: Handler,
}

/// Process-wide event-name -> ordered handler list map.
#[derive(Default)]
pub struct HookBus {
    handlers: RwLock<HashMap<String, Vec<Registration>>>,
    next_seq: RwLock<u64>,
}

impl HookBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `command`. Higher priorities run first;
    /// registration order breaks ties.
    pub fn add_hook(
        &self,
        command: &str,
        label: &str,
        priority: i32,
        handler: impl Fn(&HookContext) -> bool + Send + Sync + 'static,
    ) {
        let seq = {
            let mut seq = self.next_seq.write();
            *seq += 1;
            *seq
        };
        let mut handlers = self.handlers.write();
        let list = handlers.entry(command.to_string()).or_default();
        list.push(Registration {
            priority,
            seq,
            label: label.to_string(),
            handler: Box::new(handler),
        });
        list.sort_by_key(|r| (-r.priority, r.seq));
    }

    /// Dispatch one event. Panics inside a handler are caught and logged;
    /// a handler returning `false` short-circuits the rest of the chain.
    ///
    /// Handlers may dispatch further events recursively. Registration must
    /// finish before the first dispatch (it does: all add_hook calls happen
    /// during startup).
    pub fn dispatch(
        &self,
        world: &Arc<World>,
        net: &Arc<Network>,
        source: &str,
        command: &str,
        payload: &HookPayload,
    ) {
        debug!(net = %net.name, source = %source, hook = %command, "dispatching hook");
        let handlers = self.handlers.read();
        let Some(list) = handlers.get(command) else {
            return;
        };
        let ctx = HookContext {
            world,
            net,
            source,
            command,
            payload,
        };
        for registration in list {
            match std::panic::catch_unwind(AssertUnwindSafe(|| (registration.handler)(&ctx))) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(
                        net = %net.name,
                        hook = %command,
                        handler = %registration.label,
                        "handler suppressed further delivery"
                    );
                    break;
                }
                Err(_) => {
                    error!(
                        net = %net.name,
                        hook = %command,
                        handler = %registration.label,
                        "handler panicked; continuing with remaining handlers"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::test_net;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fire(bus: &HookBus, world: &Arc<World>, command: &str) {
        let net = test_net("hooknet");
        bus.dispatch(world, &net, "42X", command, &HookPayload::Endburst);
    }

    #[test]
    fn test_priority_and_insertion_order() {
        let bus = HookBus::new();
        let world = World::new_for_tests();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for (label, priority) in [("low", 100), ("first", 900), ("second", 900)] {
            let order = order.clone();
            bus.add_hook("ENDBURST", label, priority, move |_| {
                order.lock().push(label);
                true
            });
        }
        fire(&bus, &world, "ENDBURST");
        assert_eq!(*order.lock(), vec!["first", "second", "low"]);
    }

    #[test]
    fn test_false_short_circuits() {
        let bus = HookBus::new();
        let world = World::new_for_tests();
        let calls = Arc::new(AtomicUsize::new(0));

        bus.add_hook("ENDBURST", "gate", PRIORITY_DEFAULT, |_| false);
        {
            let calls = calls.clone();
            bus.add_hook("ENDBURST", "late", PRIORITY_DEFAULT, move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                true
            });
        }
        fire(&bus, &world, "ENDBURST");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panic_is_isolated() {
        let bus = HookBus::new();
        let world = World::new_for_tests();
        let calls = Arc::new(AtomicUsize::new(0));

        bus.add_hook("ENDBURST", "bad", PRIORITY_DEFAULT, |_| {
            panic!("handler bug")
        });
        {
            let calls = calls.clone();
            bus.add_hook("ENDBURST", "good", PRIORITY_DEFAULT, move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                true
            });
        }
        fire(&bus, &world, "ENDBURST");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_payload_names() {
        assert_eq!(
            HookPayload::Join {
                channel: "#x".into(),
                users: vec![],
                ts: 0,
                modes: vec![],
                burst: true,
                channeldata: None,
            }
            .name(),
            "SJOIN"
        );
        assert_eq!(HookPayload::Endburst.name(), "ENDBURST");
    }
}
