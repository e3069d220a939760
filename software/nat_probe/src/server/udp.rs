//! UDP device status protocol.
//!
//! A UDP device confirms a reply by sending its next datagram. Replies wait in
//! the timeout tracker until that happens or their timer fires.

use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use crossbeam::sync::WaitGroup;
use tracing::{debug, info, warn};

use nat_probe_shared::ERROR_REPLY;

use super::{Context, spawn_handler};
use crate::composer::compose_reply;
use crate::error::TransportError;
use crate::log_entry::{LogEntry, Payload, Protocol};
use crate::tracker::{TimeoutTracker, TimerOutcome};

pub(crate) struct UdpContext {
    pub socket: UdpSocket,
    pub tracker: Arc<TimeoutTracker>,
    pub shared: Arc<Context>,
}

/// Receive datagrams until `stop` is set, handing each to its own thread.
pub(crate) fn accept_loop(ctx: Arc<UdpContext>, stop: &AtomicBool, handlers: &WaitGroup) {
    // Room for the longest accepted message, its newline, and one byte
    // to tell when a datagram was cut short
    let mut buf = vec![0_u8; ctx.shared.max_message_len + 2];

    while !stop.load(Ordering::Acquire) {
        let (size, addr) = match ctx.socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
            Err(e) => {
                warn!("Error reading UDP socket: {e}");
                continue;
            }
        };
        let received = Utc::now();
        let payload = buf[..size].to_vec();

        let ctx = Arc::clone(&ctx);
        spawn_handler(format!("udp-{addr}"), handlers, move || {
            handle_datagram(&ctx, addr, received, &payload)
        });
    }

    debug!("UDP acceptor stopped");
}

fn handle_datagram(ctx: &UdpContext, addr: SocketAddr, received: DateTime<Utc>, payload: &[u8]) {
    let shared = &ctx.shared;

    let decoded = shared
        .check_len(payload)
        .and_then(|()| shared.codec.decode_device_status(payload));
    let message = match decoded {
        Ok(message) => message,
        Err(e) => {
            warn!(%addr, "Rejected UDP message: {e}");
            if let Err(e) = ctx.socket.send_to(ERROR_REPLY, addr) {
                debug!(%addr, "Failed to send UDP error reply: {e}");
            }
            return;
        }
    };
    info!(%addr, "UDP packet received");

    // A new datagram means the previous reply made it through the NAT
    if let Some(previous) = ctx.tracker.confirm(addr) {
        info!(%addr, trace_id = %previous.trace_id, "UDP reply confirmed");
        shared.sink.submit(previous);
    }

    let interval = message.interval;
    let entry = LogEntry::new(
        Protocol::Udp,
        addr,
        received,
        Payload::Nat(message),
        &shared.version,
    );
    let trace_id = entry.trace_id;
    let reply = compose_reply(interval, received, trace_id, &shared.version);

    // Registered before sending, so the device's next datagram always finds it
    let timer = match ctx.tracker.register(addr, entry) {
        Ok((timer, displaced)) => {
            if let Some(displaced) = displaced {
                info!(%addr, trace_id = %displaced.trace_id, "UDP reply superseded before confirmation");
                shared.sink.submit(displaced);
            }
            timer
        }
        // Shutting down; nobody is left to wait for the next datagram
        Err(entry) => {
            shared.sink.submit(entry);
            return;
        }
    };

    if let Err(source) = ctx.socket.send_to(reply.as_bytes(), addr) {
        warn!(%trace_id, "{}", TransportError::Write { addr, source });
        if let Some(unsent) = ctx.tracker.expire(&timer) {
            shared.sink.submit(unsent);
        }
        return;
    }
    debug!(%addr, %trace_id, "UDP packet sent");

    if timer.wait() == TimerOutcome::Fired {
        if let Some(expired) = ctx.tracker.expire(&timer) {
            info!(%addr, %trace_id, "UDP connection to {addr} timed out");
            shared.sink.submit(expired);
        }
    }
}
