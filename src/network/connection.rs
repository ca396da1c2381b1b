//! The per-network connection loop.
//!
//! One task per network: connect (with TLS and fingerprint pinning where
//! configured), drive the handshake, feed inbound lines to the protocol
//! driver, dispatch the resulting hooks, keep the link alive with pings,
//! and reconnect with backoff when the link drops.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, interval, timeout};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn};

use crate::error::ProtocolError;
use crate::hooks::HookPayload;
use crate::network::codec::LineCodec;
use crate::network::tls;
use crate::state::{Network, now_ts};
use crate::world::World;

/// Delay before the synthetic ENDBURST on protocols without an explicit
/// end-of-burst.
const EOB_SYNTH_DELAY: Duration = Duration::from_secs(2);

/// Run one network until shutdown. Handles reconnects internally.
pub async fn run_network(world: Arc<World>, net: Arc<Network>) {
    let mut shutdown = world.shutdown_signal();
    loop {
        net.init_vars();
        let conf = net.serverdata();
        info!(net = %net.name, ip = %conf.ip, port = conf.port, "connecting");

        let result = attempt(&world, &net, &mut shutdown).await;
        let was_successful = net.was_successful.load(Ordering::SeqCst);
        net.detach_sender();
        net.connected.store(false, Ordering::SeqCst);

        match &result {
            Ok(()) => info!(net = %net.name, "disconnected"),
            Err(e) => warn!(
                net = %net.name,
                error = %e,
                error_code = e.error_code(),
                "connection failed"
            ),
        }

        // DISCONNECT fires exactly once per attempt, after state cleanup.
        let source = net.uplink().unwrap_or_else(|| net.sid());
        world.hooks.dispatch(
            &world,
            &net,
            &source,
            "DISCONNECT",
            &HookPayload::Disconnect { was_successful },
        );

        if let Err(e) = &result
            && e.is_process_fatal()
        {
            error!(net = %net.name, error = %e, "fatal error; aborting");
            world.begin_shutdown();
            return;
        }
        if world.is_shutting_down() || net.aborted.load(Ordering::SeqCst) {
            return;
        }
        let autoconnect = net.serverdata().autoconnect;
        if autoconnect < 0 {
            info!(net = %net.name, "autoconnect disabled; giving up");
            return;
        }
        let jitter = rand::thread_rng().gen_range(0..=3);
        let delay = Duration::from_secs(autoconnect.max(1) as u64 + jitter);
        debug!(net = %net.name, delay = ?delay, "reconnecting after backoff");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => return,
        }
    }
}

async fn attempt(
    world: &Arc<World>,
    net: &Arc<Network>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), ProtocolError> {
    let conf = net.serverdata();
    // The initial connection timeout is deliberately the ping frequency:
    // small compared to the steady-state dead-link window.
    let connect = TcpStream::connect((conf.ip.clone(), conf.port));
    let tcp = timeout(Duration::from_secs(conf.pingfreq), connect)
        .await
        .map_err(|_| {
            ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "connect timed out",
            ))
        })??;
    tcp.set_nodelay(true).ok();

    if conf.ssl {
        let stream = tls::upgrade(&net.name, &conf, tcp).await?;
        run_io(world, net, stream, shutdown).await
    } else {
        run_io(world, net, tcp, shutdown).await
    }
}

/// Writer half: drain the send queue at the configured pace.
async fn write_loop<W: AsyncWrite + Unpin>(
    netname: String,
    writer: W,
    mut rx: mpsc::UnboundedReceiver<String>,
    throttle: f64,
) {
    let mut sink = FramedWrite::new(writer, LineCodec::new());
    let delay = if throttle > 0.0 {
        Some(Duration::from_secs_f64(1.0 / throttle))
    } else {
        None
    };
    while let Some(line) = rx.recv().await {
        debug!(net = %netname, line = %line, "-> sending");
        if sink.send(line).await.is_err() {
            break;
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

async fn run_io<S: AsyncRead + AsyncWrite + Unpin + Send + 'static>(
    world: &Arc<World>,
    net: &Arc<Network>,
    stream: S,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), ProtocolError> {
    let conf = net.serverdata();
    let (read_half, write_half) = tokio::io::split(stream);
    let (tx, rx) = mpsc::unbounded_channel();
    net.attach_sender(tx);
    let writer = tokio::spawn(write_loop(
        net.name.clone(),
        write_half,
        rx,
        conf.throttle,
    ));

    let result = read_loop(world, net, read_half, shutdown).await;

    // Dropping our sender ends the writer once the queue drains.
    net.detach_sender();
    let _ = timeout(Duration::from_secs(2), writer).await;
    result
}

async fn read_loop<R: AsyncRead + Unpin>(
    world: &Arc<World>,
    net: &Arc<Network>,
    reader: R,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), ProtocolError> {
    let conf = net.serverdata();
    let mut framed = FramedRead::new(reader, LineCodec::new());

    net.protocol.post_connect(net)?;

    let mut ping_timer = interval(Duration::from_secs(conf.pingfreq));
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping_timer.reset();
    let mut tick_timer = interval(Duration::from_secs(1));
    // Synthetic end-of-burst for protocols with no explicit one (TS6).
    let mut eob_synth_at: Option<Instant> = None;
    let mut eob_synth_done = false;

    loop {
        tokio::select! {
            maybe_line = framed.next() => {
                let line = match maybe_line {
                    Some(Ok(line)) => line,
                    Some(Err(e)) => return Err(ProtocolError::Io(e)),
                    None => {
                        return Err(ProtocolError::Io(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "uplink closed the connection",
                        )));
                    }
                };
                net.last_in.store(now_ts(), Ordering::SeqCst);
                if line.is_empty() {
                    continue;
                }
                debug!(net = %net.name, line = %line, "<- received");
                let events = net.protocol.handle_line(net, &line)?;
                for event in events {
                    if event.command == "ENDBURST" {
                        net.was_successful.store(true, Ordering::SeqCst);
                    }
                    world
                        .hooks
                        .dispatch(world, net, &event.source, &event.command, &event.payload);
                }
                if net.protocol.caps().needs_eob_synth
                    && !eob_synth_done
                    && eob_synth_at.is_none()
                    && net.is_connected()
                {
                    eob_synth_at = Some(Instant::now() + EOB_SYNTH_DELAY);
                }
            }
            _ = ping_timer.tick() => {
                let idle = now_ts() - net.last_in.load(Ordering::SeqCst);
                if idle > (conf.pingfreq * 2) as i64 {
                    return Err(ProtocolError::PingTimeout(idle as u64));
                }
                net.protocol.ping(net);
            }
            _ = tick_timer.tick() => {
                if net.aborted.load(Ordering::SeqCst) {
                    // Removed by rehash or shutting down.
                    return Ok(());
                }
                net.protocol.tick(net);
                if let Some(at) = eob_synth_at
                    && Instant::now() >= at
                {
                    eob_synth_at = None;
                    eob_synth_done = true;
                    net.was_successful.store(true, Ordering::SeqCst);
                    let source = net.uplink().unwrap_or_else(|| net.sid());
                    debug!(net = %net.name, "synthesising ENDBURST");
                    world
                        .hooks
                        .dispatch(world, net, &source, "ENDBURST", &HookPayload::Endburst);
                }
            }
            _ = shutdown.changed() => {
                debug!(net = %net.name, "shutdown requested; closing link");
                return Ok(());
            }
        }
    }
}
