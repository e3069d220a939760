//! TCP device status protocol and the AT-command sub-protocol.
//!
//! Messages on a connection are newline-delimited and handled strictly in
//! order. On the device status protocol, a reply counts as received once the
//! device sends anything else; a failed write or a closed connection means it
//! was not.

use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use crossbeam::sync::WaitGroup;
use tracing::{debug, info, warn};

use nat_probe_shared::{ERROR_REPLY, MessageCodec, ValidationError};

use super::{Context, POLL_INTERVAL, spawn_handler};
use crate::composer::compose_reply;
use crate::error::TransportError;
use crate::log_entry::{LogEntry, Payload, Protocol};
use crate::session::TcpSession;

/// Which protocol a TCP listener speaks
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TcpService {
    DeviceStatus,
    AtCommand,
}

impl TcpService {
    pub fn acceptor_name(self) -> &'static str {
        match self {
            TcpService::DeviceStatus => "tcp-acceptor",
            TcpService::AtCommand => "at-acceptor",
        }
    }

    fn thread_prefix(self) -> &'static str {
        match self {
            TcpService::DeviceStatus => "tcp",
            TcpService::AtCommand => "at",
        }
    }

    /// Validate one message, returning its payload and requested reply delay.
    fn decode(self, codec: &MessageCodec, line: &[u8]) -> Result<(Payload, u64), ValidationError> {
        match self {
            TcpService::DeviceStatus => codec.decode_device_status(line).map(|message| {
                let interval = message.interval;
                (Payload::Nat(message), interval)
            }),
            TcpService::AtCommand => codec
                .decode_at_command(line)
                .map(|message| (Payload::AtCommand(message), 0)),
        }
    }
}

pub(crate) struct TcpContext {
    pub service: TcpService,
    pub shared: Arc<Context>,
    pub read_timeout: Option<Duration>,
    pub connections: Arc<ConnectionSet>,
}

/// Accept connections until `stop` is set, handing each to its own thread.
pub(crate) fn accept_loop(
    listener: TcpListener,
    ctx: Arc<TcpContext>,
    stop: &AtomicBool,
    handlers: &WaitGroup,
) {
    while !stop.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, addr)) => {
                let ctx = Arc::clone(&ctx);
                let name = format!("{}-{addr}", ctx.service.thread_prefix());
                spawn_handler(name, handlers, move || handle_connection(&ctx, stream, addr));
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                warn!("Error accepting {:?} connection: {e}", ctx.service);
                thread::sleep(POLL_INTERVAL);
            }
        }
    }

    debug!("{:?} acceptor stopped", ctx.service);
}

fn handle_connection(ctx: &TcpContext, stream: TcpStream, addr: SocketAddr) {
    let prepared = stream
        .set_nonblocking(false)
        .and_then(|()| stream.set_read_timeout(ctx.read_timeout));
    if let Err(e) = prepared {
        warn!(%addr, "Failed to configure TCP connection: {e}");
        return;
    }
    let _tracked = match ctx.connections.track(&stream) {
        Ok(tracked) => tracked,
        Err(e) => {
            warn!(%addr, "Failed to track TCP connection: {e}");
            return;
        }
    };
    debug!(%addr, "Accepted {:?} connection", ctx.service);

    let shared = &ctx.shared;
    let mut session = TcpSession::new();
    let mut reader = BufReader::new(&stream);
    // Longest accepted message, its newline, and one byte to detect overflow
    let limit = shared.max_message_len as u64 + 2;

    loop {
        let mut line = Vec::new();
        let read = reader.by_ref().take(limit).read_until(b'\n', &mut line);
        let received = Utc::now();
        match read {
            Ok(0) => {
                debug!(%addr, "TCP connection closed by peer");
                break;
            }
            Ok(_) => {}
            Err(source) => {
                debug!("{}", TransportError::Read { addr, source });
                break;
            }
        }

        // Anything arriving means the previous reply got through
        if let Some(previous) = session.confirm_previous() {
            info!(%addr, trace_id = %previous.trace_id, "TCP reply confirmed");
            shared.sink.submit(previous);
        }

        let decoded = shared
            .check_len(&line)
            .and_then(|()| ctx.service.decode(&shared.codec, &line));
        let (payload, interval) = match decoded {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(%addr, "Rejected TCP message: {e}. Connection terminated");
                if let Err(e) = (&stream).write_all(ERROR_REPLY) {
                    debug!(%addr, "Failed to send TCP error reply: {e}");
                }
                break;
            }
        };
        info!(%addr, "{:?} packet received", ctx.service);

        let mut entry = LogEntry::new(Protocol::Tcp, addr, received, payload, &shared.version);
        let trace_id = entry.trace_id;
        let reply = compose_reply(interval, received, trace_id, &shared.version);

        if let Err(source) = (&stream).write_all(reply.as_bytes()) {
            warn!(%trace_id, "{}. Connection terminated", TransportError::Write { addr, source });
            entry.mark_timed_out();
            shared.sink.submit(entry);
            break;
        }
        debug!(%addr, %trace_id, "TCP packet sent");

        match ctx.service {
            TcpService::DeviceStatus => {
                if let Some(previous) = session.await_confirmation(entry) {
                    shared.sink.submit(previous);
                }
            }
            // AT-command transcripts need no round trip; the written reply settles them
            TcpService::AtCommand => shared.sink.submit(entry),
        }
    }

    if let Some(unconfirmed) = session.abandon() {
        info!(%addr, trace_id = %unconfirmed.trace_id, "TCP connection to {addr} timed out");
        shared.sink.submit(unconfirmed);
    }
    let _ = stream.shutdown(Shutdown::Both);
}

/// Open connections, so that shutdown can unblock their readers.
#[derive(Default)]
pub(crate) struct ConnectionSet {
    inner: Mutex<Connections>,
}

#[derive(Default)]
struct Connections {
    next_id: u64,
    open: HashMap<u64, TcpStream>,
    closed: bool,
}

impl ConnectionSet {
    fn lock(&self) -> MutexGuard<'_, Connections> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track `stream` until the returned guard drops.
    /// Once the set is closed, the stream is shut down straight away.
    fn track(self: &Arc<Self>, stream: &TcpStream) -> io::Result<TrackedConnection> {
        let clone = stream.try_clone()?;
        let mut connections = self.lock();
        if connections.closed {
            let _ = clone.shutdown(Shutdown::Both);
            return Ok(TrackedConnection {
                set: Arc::clone(self),
                id: None,
            });
        }

        let id = connections.next_id;
        connections.next_id += 1;
        connections.open.insert(id, clone);
        Ok(TrackedConnection {
            set: Arc::clone(self),
            id: Some(id),
        })
    }

    /// Shut down every open connection and refuse new ones.
    pub fn close_all(&self) {
        let mut connections = self.lock();
        connections.closed = true;
        for stream in connections.open.values() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

struct TrackedConnection {
    set: Arc<ConnectionSet>,
    id: Option<u64>,
}

impl Drop for TrackedConnection {
    fn drop(&mut self) {
        if let Some(id) = self.id {
            self.set.lock().open.remove(&id);
        }
    }
}
