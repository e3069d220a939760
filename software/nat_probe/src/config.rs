//! Server configuration.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use nat_probe_shared::{DEVICE_TCP_PORT, DEVICE_UDP_PORT, MessageCodec};

use crate::error::ServerError;
use crate::sink::{DirectoryStore, ObjectStore, SinkSettings};

/// Listening addresses, timing, and record naming for one server instance.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ServerConfig {
    /// Device status datagrams
    pub udp_addr: SocketAddr,

    /// Device status connections
    pub tcp_addr: SocketAddr,

    /// AT-command connections; the sub-protocol is off when unset
    pub at_command_addr: Option<SocketAddr>,

    /// Time a UDP device has to send its next datagram
    /// before its previous reply counts as lost
    pub udp_timeout: Duration,

    /// Idle time after which a TCP connection counts as gone.
    /// Unset waits for the peer or the OS to close it.
    pub tcp_read_timeout: Option<Duration>,

    /// Deadline for each individual record upload
    pub upload_deadline: Duration,

    /// Records the log sink queue holds before handlers block
    pub queue_capacity: usize,

    /// Longest accepted message, in bytes, excluding the newline
    pub max_message_len: usize,

    /// Leading key segment for every stored record
    pub key_prefix: Option<String>,

    /// Server version reported to devices and stored with each record
    pub version: String,

    /// Directory for the server's own log file
    pub log_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            udp_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEVICE_UDP_PORT)),
            tcp_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEVICE_TCP_PORT)),
            at_command_addr: None,
            udp_timeout: Duration::from_secs(60),
            tcp_read_timeout: None,
            upload_deadline: Duration::from_secs(60),
            queue_capacity: 1024,
            max_message_len: 1024,
            key_prefix: None,
            version: env!("CARGO_PKG_VERSION").to_owned(),
            log_dir: None,
        }
    }
}

impl ServerConfig {
    /// Every listener on an ephemeral loopback port
    pub fn loopback() -> Self {
        let any_port = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
        Self {
            udp_addr: any_port,
            tcp_addr: any_port,
            at_command_addr: Some(any_port),
            ..Default::default()
        }
    }

    pub(crate) fn sink_settings(&self) -> SinkSettings {
        SinkSettings {
            key_prefix: self.key_prefix.clone(),
            upload_deadline: self.upload_deadline,
            queue_capacity: self.queue_capacity,
        }
    }
}

/// Alternative schema documents to validate against
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SchemaFiles {
    pub device_status: PathBuf,
    pub at_command: PathBuf,
}

/// Everything needed to run the server binary, as stored on disk.
///
/// ```json
/// {
///   "server": { "key_prefix": "lab", "at_command_addr": "0.0.0.0:3052" },
///   "store": { "type": "DirectoryStore", "root": "/var/lib/nat_probe" }
/// }
/// ```
#[derive(Serialize, Deserialize)]
pub struct ServiceFile {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default = "default_store")]
    pub store: Box<dyn ObjectStore>,

    #[serde(default)]
    pub schemas: Option<SchemaFiles>,
}

fn default_store() -> Box<dyn ObjectStore> {
    Box::new(DirectoryStore::new("nat_probe_logs"))
}

impl Default for ServiceFile {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            store: default_store(),
            schemas: None,
        }
    }
}

impl ServiceFile {
    /// Read a service file from JSON.
    pub fn load(path: &Path) -> Result<Self, ServerError> {
        let text = std::fs::read_to_string(path).map_err(|source| ServerError::ConfigIo {
            path: path.to_owned(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ServerError::ConfigParse {
            path: path.to_owned(),
            source,
        })
    }

    /// Compile the configured schemas, or the embedded ones if none are configured.
    pub fn codec(&self) -> Result<MessageCodec, ServerError> {
        let codec = match &self.schemas {
            Some(files) => MessageCodec::from_files(&files.device_status, &files.at_command)?,
            None => MessageCodec::new()?,
        };
        Ok(codec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployed_ports() {
        let config = ServerConfig::default();
        assert_eq!(config.udp_addr.port(), 3050);
        assert_eq!(config.tcp_addr.port(), 3051);
        assert_eq!(config.udp_timeout, Duration::from_secs(60));
        assert!(config.at_command_addr.is_none());
    }

    #[test]
    fn partial_service_file() {
        let text = r#"{
            "server": { "key_prefix": "lab", "at_command_addr": "0.0.0.0:3052" },
            "store": { "type": "DirectoryStore", "root": "/var/lib/nat_probe" }
        }"#;
        let file: ServiceFile = serde_json::from_str(text).unwrap();

        assert_eq!(file.server.key_prefix.as_deref(), Some("lab"));
        assert_eq!(file.server.at_command_addr.unwrap().port(), 3052);
        // Unset fields keep their defaults
        assert_eq!(file.server.tcp_addr.port(), 3051);
        assert_eq!(file.server.queue_capacity, 1024);
        assert!(file.schemas.is_none());
        assert!(file.codec().is_ok());

        // Round trip through the tagged store
        let serialized = serde_json::to_string_pretty(&file).unwrap();
        assert!(serialized.contains("\"type\": \"DirectoryStore\""));
        let _: ServiceFile = serde_json::from_str(&serialized).unwrap();
    }

    #[test]
    fn missing_service_file() {
        let err = ServiceFile::load(Path::new("/nonexistent/nat_probe.json"))
            .err()
            .unwrap();
        assert!(matches!(err, ServerError::ConfigIo { .. }));
    }
}
