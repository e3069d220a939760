//! Persisted record of one message's lifecycle.

use std::fmt;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use nat_probe_shared::{AtCommandMessage, DeviceMessage};

/// Transport a message arrived on
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    #[serde(rename = "UDP")]
    Udp,
    #[serde(rename = "TCP")]
    Tcp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Udp => f.write_str("UDP"),
            Protocol::Tcp => f.write_str("TCP"),
        }
    }
}

/// The decoded message carried by a log entry.
///
/// Each kind is stored under its own key tag.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "type", content = "message", rename_all = "snake_case")]
pub enum Payload {
    Nat(DeviceMessage),
    AtCommand(AtCommandMessage),
}

impl Payload {
    /// Top-level key segment for records of this kind
    pub fn key_tag(&self) -> &'static str {
        match self {
            Payload::Nat(_) => "raw",
            Payload::AtCommand(_) => "at",
        }
    }
}

/// Record of one received message and whether the device confirmed the reply.
///
/// Created when the message is received. `timed_out` starts false and can only
/// be flipped once, when the device is found not to have confirmed receipt.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    pub protocol: Protocol,
    pub remote_addr: SocketAddr,
    pub received: DateTime<Utc>,
    timed_out: bool,
    pub version: String,
    pub trace_id: Uuid,
    #[serde(flatten)]
    pub payload: Payload,
}

impl LogEntry {
    /// Start a record for a freshly received message, assigning it a new trace id.
    pub fn new(
        protocol: Protocol,
        remote_addr: SocketAddr,
        received: DateTime<Utc>,
        payload: Payload,
        version: &str,
    ) -> Self {
        Self {
            protocol,
            remote_addr,
            received,
            timed_out: false,
            version: version.to_owned(),
            trace_id: Uuid::new_v4(),
            payload,
        }
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    /// Record that the device never confirmed the reply.
    pub fn mark_timed_out(&mut self) {
        self.timed_out = true;
    }

    /// Consuming form of [`LogEntry::mark_timed_out`]
    pub fn into_timed_out(mut self) -> Self {
        self.mark_timed_out();
        self
    }

    /// Storage key for this record:
    /// `{prefix}/{tag}/{YYYY/MM/DD/HH}/{address}-{HHMMSS}-{trace id}.json`.
    ///
    /// Empty prefixes and surrounding slashes are ignored.
    pub fn object_key(&self, prefix: Option<&str>) -> String {
        let name = format!(
            "{}/{}/{}-{}-{}.json",
            self.payload.key_tag(),
            self.received.format("%Y/%m/%d/%H"),
            self.remote_addr,
            self.received.format("%H%M%S"),
            self.trace_id,
        );

        match prefix.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
            Some(prefix) => format!("{prefix}/{name}"),
            None => name,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use chrono::TimeZone;

    use super::*;

    pub(crate) fn device_message(interval: u64) -> DeviceMessage {
        DeviceMessage {
            operator: "24201".into(),
            ip: vec![IpAddr::V4(Ipv4Addr::new(10, 160, 73, 64))],
            cell_id: 21229824,
            ue_mode: 2,
            lte_mode: 1,
            nbiot_mode: 1,
            gps_mode: 1,
            iccid: "8931089318104314834F".into(),
            imei: None,
            interval,
        }
    }

    pub(crate) fn nat_entry(addr: &str) -> LogEntry {
        LogEntry::new(
            Protocol::Udp,
            addr.parse().unwrap(),
            Utc::now(),
            Payload::Nat(device_message(0)),
            "test",
        )
    }

    fn fixed_entry() -> LogEntry {
        let mut entry = nat_entry("10.0.0.1:5000");
        entry.received = Utc.with_ymd_and_hms(2020, 3, 7, 9, 4, 5).unwrap();
        entry.trace_id = Uuid::parse_str("67e55044-10b1-426f-9247-bb680e5fe0c8").unwrap();
        entry
    }

    #[test]
    fn object_key_layout() {
        let entry = fixed_entry();
        let expected = "raw/2020/03/07/09/10.0.0.1:5000-090405-67e55044-10b1-426f-9247-bb680e5fe0c8.json";
        assert_eq!(entry.object_key(None), expected);
        assert_eq!(entry.object_key(Some("")), expected);
        assert_eq!(entry.object_key(Some("run-1")), format!("run-1/{expected}"));
        assert_eq!(entry.object_key(Some("/run-1/")), format!("run-1/{expected}"));

        // Same fields, same key
        assert_eq!(entry.object_key(Some("p")), entry.clone().object_key(Some("p")));
    }

    #[test]
    fn object_key_tag_follows_kind() {
        let mut entry = fixed_entry();
        entry.payload = Payload::AtCommand(AtCommandMessage {
            command: "AT+CGSN".into(),
            response: "352656100367872".into(),
            iccid: "8931089318104314834F".into(),
            imei: None,
        });
        assert!(entry.object_key(None).starts_with("at/2020/03/07/09/"));
    }

    #[test]
    fn trace_ids_are_unique() {
        let a = nat_entry("10.0.0.1:5000");
        let b = nat_entry("10.0.0.1:5000");
        assert_ne!(a.trace_id, b.trace_id);
    }

    #[test]
    fn serialized_record_fields() {
        let entry = fixed_entry().into_timed_out();
        let value = serde_json::to_value(&entry).unwrap();

        assert_eq!(value["protocol"], "UDP");
        assert_eq!(value["remote_addr"], "10.0.0.1:5000");
        assert_eq!(value["timed_out"], true);
        assert_eq!(value["version"], "test");
        assert_eq!(value["trace_id"], "67e55044-10b1-426f-9247-bb680e5fe0c8");
        assert_eq!(value["type"], "nat");
        assert_eq!(value["message"]["op"], "24201");
        assert_eq!(value["message"]["ip"][0], "10.160.73.64");
        assert!(value["message"].get("imei").is_none());

        let parsed: LogEntry = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, entry);
    }
}
