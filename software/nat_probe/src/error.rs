use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

use nat_probe_shared::SchemaError;

/// Failures that stop the server from starting or shutting down cleanly.
///
/// Nothing that happens on a single connection or datagram ends up here.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {listener} listener on {addr}: {source}")]
    Bind {
        listener: &'static str,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to configure {listener} listener: {source}")]
    Socket {
        listener: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn {what} thread: {source}")]
    Spawn {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("failed to read config {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid config {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0}")]
    Shutdown(String),
}

/// A read or write on a device conversation failed.
///
/// Treated as the device having gone away: any reply still awaiting
/// confirmation is logged as timed out. Never retried.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("read from {addr} failed: {source}")]
    Read {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("write to {addr} failed: {source}")]
    Write {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}
