//! Listeners and the handler threads they spawn.
//!
//! Each listener runs on its own acceptor thread. Every datagram and every
//! accepted connection gets a dedicated handler thread, so one slow or
//! sleeping device never holds up another.

mod tcp;
mod udp;

use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{Builder, JoinHandle};
use std::time::Duration;

use crossbeam::sync::WaitGroup;
use tracing::{error, info};

use nat_probe_shared::{MessageCodec, ValidationError};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::sink::{LogSink, LogSinkHandle, ObjectStore};
use crate::tracker::TimeoutTracker;
use tcp::{ConnectionSet, TcpContext, TcpService};
use udp::UdpContext;

/// How often idle acceptors check for shutdown
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// State shared by every handler, regardless of transport.
pub(crate) struct Context {
    pub codec: MessageCodec,
    pub sink: LogSinkHandle,
    pub version: String,
    pub max_message_len: usize,
}

impl Context {
    /// Reject messages over the configured length before parsing them.
    pub fn check_len(&self, buffer: &[u8]) -> Result<(), ValidationError> {
        if buffer.trim_ascii_end().len() > self.max_message_len {
            return Err(ValidationError::TooLong {
                limit: self.max_message_len,
            });
        }
        Ok(())
    }
}

/// Run `work` on its own named thread, counted in `handlers`.
pub(crate) fn spawn_handler<F>(name: String, handlers: &WaitGroup, work: F)
where
    F: FnOnce() + Send + 'static,
{
    let handlers = handlers.clone();
    let spawned = Builder::new().name(name).spawn(move || {
        work();
        drop(handlers);
    });
    if let Err(e) = spawned {
        error!("Failed to spawn handler thread: {e}");
    }
}

/// A configured but not yet listening server.
pub struct Server {
    config: ServerConfig,
    codec: MessageCodec,
    store: Arc<dyn ObjectStore>,
}

impl Server {
    /// Set up a server that validates against the embedded schemas.
    pub fn new(config: ServerConfig, store: Box<dyn ObjectStore>) -> Result<Self, ServerError> {
        Ok(Self::with_codec(config, store, MessageCodec::new()?))
    }

    pub fn with_codec(
        config: ServerConfig,
        store: Box<dyn ObjectStore>,
        codec: MessageCodec,
    ) -> Self {
        Self {
            config,
            codec,
            store: Arc::from(store),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind every listener and start serving.
    ///
    /// Failing to bind is the only error after which nothing runs.
    pub fn run(self) -> Result<ServerHandle, ServerError> {
        let config = self.config;

        // Bind everything before starting any threads
        let udp_socket = UdpSocket::bind(config.udp_addr).map_err(|source| ServerError::Bind {
            listener: "UDP",
            addr: config.udp_addr,
            source,
        })?;
        let tcp_listener = bind_tcp("TCP", config.tcp_addr)?;
        let at_listener = config
            .at_command_addr
            .map(|addr| bind_tcp("AT command", addr))
            .transpose()?;

        // Acceptors block for at most one poll interval so they notice shutdown
        udp_socket
            .set_read_timeout(Some(POLL_INTERVAL))
            .map_err(|source| ServerError::Socket {
                listener: "UDP",
                source,
            })?;

        let udp_addr = local_addr("UDP", udp_socket.local_addr())?;
        let tcp_addr = local_addr("TCP", tcp_listener.local_addr())?;
        let at_command_addr = at_listener
            .as_ref()
            .map(|l| local_addr("AT command", l.local_addr()))
            .transpose()?;

        let sink = LogSink::spawn(self.store, config.sink_settings()).map_err(|source| {
            ServerError::Spawn {
                what: "log sink",
                source,
            }
        })?;
        let shared = Arc::new(Context {
            codec: self.codec,
            sink: sink.handle(),
            version: config.version.clone(),
            max_message_len: config.max_message_len,
        });

        let mut handle = ServerHandle {
            udp_addr,
            tcp_addr,
            at_command_addr,
            stop: Arc::new(AtomicBool::new(false)),
            acceptors: Vec::new(),
            handlers: WaitGroup::new(),
            tracker: Arc::new(TimeoutTracker::new(config.udp_timeout)),
            connections: Arc::new(ConnectionSet::default()),
            sink_handle: sink.handle(),
            sink,
        };

        let udp = Arc::new(UdpContext {
            socket: udp_socket,
            tracker: Arc::clone(&handle.tracker),
            shared: Arc::clone(&shared),
        });
        handle.spawn_acceptor("udp-acceptor", move |stop, handlers| {
            udp::accept_loop(udp, &stop, &handlers)
        })?;

        let listeners = [
            (TcpService::DeviceStatus, Some(tcp_listener)),
            (TcpService::AtCommand, at_listener),
        ];
        for (service, listener) in listeners {
            let Some(listener) = listener else { continue };
            let ctx = Arc::new(TcpContext {
                service,
                shared: Arc::clone(&shared),
                read_timeout: config.tcp_read_timeout,
                connections: Arc::clone(&handle.connections),
            });
            handle.spawn_acceptor(service.acceptor_name(), move |stop, handlers| {
                tcp::accept_loop(listener, ctx, &stop, &handlers)
            })?;
        }

        info!("NAT probe server {} started", config.version);
        info!("UDP port:       {}", handle.udp_addr);
        info!("TCP port:       {}", handle.tcp_addr);
        if let Some(addr) = handle.at_command_addr {
            info!("AT command port: {addr}");
        }
        if let Some(prefix) = &config.key_prefix {
            info!("Log prefix:     {prefix}");
        }

        Ok(handle)
    }
}

fn bind_tcp(listener: &'static str, addr: SocketAddr) -> Result<TcpListener, ServerError> {
    let tcp = TcpListener::bind(addr).map_err(|source| ServerError::Bind {
        listener,
        addr,
        source,
    })?;
    tcp.set_nonblocking(true)
        .map_err(|source| ServerError::Socket { listener, source })?;
    Ok(tcp)
}

fn local_addr(
    listener: &'static str,
    addr: std::io::Result<SocketAddr>,
) -> Result<SocketAddr, ServerError> {
    addr.map_err(|source| ServerError::Socket { listener, source })
}

/// A running server.
pub struct ServerHandle {
    udp_addr: SocketAddr,
    tcp_addr: SocketAddr,
    at_command_addr: Option<SocketAddr>,

    stop: Arc<AtomicBool>,
    acceptors: Vec<JoinHandle<()>>,
    handlers: WaitGroup,

    tracker: Arc<TimeoutTracker>,
    connections: Arc<ConnectionSet>,
    sink_handle: LogSinkHandle,
    sink: LogSink,
}

impl ServerHandle {
    /// Bound address of the UDP device status listener
    pub fn udp_addr(&self) -> SocketAddr {
        self.udp_addr
    }

    /// Bound address of the TCP device status listener
    pub fn tcp_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    /// Bound address of the AT-command listener, if enabled
    pub fn at_command_addr(&self) -> Option<SocketAddr> {
        self.at_command_addr
    }

    /// UDP replies currently waiting for the device's next datagram
    pub fn pending_udp_confirmations(&self) -> usize {
        self.tracker.len()
    }

    fn spawn_acceptor<F>(&mut self, name: &str, run: F) -> Result<(), ServerError>
    where
        F: FnOnce(Arc<AtomicBool>, WaitGroup) + Send + 'static,
    {
        let stop = Arc::clone(&self.stop);
        let handlers = self.handlers.clone();
        let spawned = Builder::new()
            .name(name.to_owned())
            .spawn(move || run(stop, handlers));
        match spawned {
            Ok(thread) => {
                self.acceptors.push(thread);
                Ok(())
            }
            Err(source) => {
                // Let any acceptors that did start wind down
                self.stop.store(true, Ordering::Release);
                Err(ServerError::Spawn {
                    what: "acceptor",
                    source,
                })
            }
        }
    }

    /// Serve until the acceptors exit, then shut down.
    pub fn wait(mut self) -> Result<(), ServerError> {
        let acceptors = std::mem::take(&mut self.acceptors);
        for acceptor in acceptors {
            acceptor
                .join()
                .map_err(|_| ServerError::Shutdown("Acceptor thread panicked".into()))?;
        }
        self.shutdown()
    }

    /// Stop listening and settle every outstanding record.
    ///
    /// Replies still awaiting confirmation are logged as timed out, open
    /// connections are closed, in-flight handlers are waited on (including
    /// any reply delay they are serving), and the log sink is drained.
    ///
    /// Intervals are not capped, so a handler still sleeping out a long
    /// requested interval holds up shutdown until its reply goes out.
    pub fn shutdown(self) -> Result<(), ServerError> {
        info!("Shutting down NAT probe server");
        self.stop.store(true, Ordering::Release);
        for acceptor in self.acceptors {
            acceptor
                .join()
                .map_err(|_| ServerError::Shutdown("Acceptor thread panicked".into()))?;
        }

        for entry in self.tracker.drain() {
            info!(addr = %entry.remote_addr, trace_id = %entry.trace_id, "UDP reply unconfirmed at shutdown");
            self.sink_handle.submit(entry);
        }
        self.connections.close_all();

        self.handlers.wait();
        drop(self.sink_handle);
        self.sink.shutdown().map_err(ServerError::Shutdown)
    }
}
