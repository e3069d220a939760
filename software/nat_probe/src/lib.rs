//! Server that measures how long cellular NAT mappings survive.
//!
//! Devices report their status over UDP or TCP and ask for a reply after some
//! interval. The server holds the reply for that long, sends it, and records
//! whether the device confirmed receipt by sending again.

pub mod composer;
pub mod config;
pub mod error;
pub mod log_entry;
pub mod logging;
pub mod server;
pub mod session;
pub mod sink;
pub mod tracker;

pub use config::{ServerConfig, ServiceFile};
pub use error::{ServerError, TransportError};
pub use log_entry::{LogEntry, Payload, Protocol};
pub use server::{Server, ServerHandle};
pub use sink::{DirectoryStore, LogSink, LogSinkHandle, MemoryStore, ObjectStore};

pub use nat_probe_shared;
