//! Typed device messages.
//!
//! Field names follow the wire format. Both message types reject unknown
//! fields even when decoded without the schema.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// The kinds of message a device can send
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Network status report requesting a delayed reply
    DeviceStatus,
    /// Modem AT command transcript
    AtCommand,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::DeviceStatus => f.write_str("device status"),
            MessageKind::AtCommand => f.write_str("AT command"),
        }
    }
}

/// Network status reported by a device.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DeviceMessage {
    /// Numeric operator code, 5 or 6 digits
    #[serde(rename = "op")]
    pub operator: String,

    /// Addresses the device sees on its own interfaces
    pub ip: Vec<IpAddr>,

    pub cell_id: i64,

    pub ue_mode: u8,
    pub lte_mode: u8,
    pub nbiot_mode: u8,
    pub gps_mode: u8,

    pub iccid: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imei: Option<String>,

    /// Seconds to wait before replying
    pub interval: u64,
}

/// An AT command issued by a device's application and the modem's response.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AtCommandMessage {
    #[serde(rename = "cmd")]
    pub command: String,

    pub response: String,

    pub iccid: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imei: Option<String>,
}
