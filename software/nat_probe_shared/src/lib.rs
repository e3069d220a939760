//! Wire formats shared between the NAT probe server and the devices that talk to it.
//!
//! Devices send newline-terminated JSON messages. Each message kind has a
//! published JSON schema, embedded here so that the server and any device
//! tooling validate against the same document.

pub mod codec;
pub mod messages;

pub use codec::{MessageCodec, SchemaError, ValidationError};
pub use messages::{AtCommandMessage, DeviceMessage, MessageKind};

/// The UDP port on which the server expects device status datagrams
pub const DEVICE_UDP_PORT: u16 = 3050;

/// The TCP port on which the server expects device status connections
pub const DEVICE_TCP_PORT: u16 = 3051;

/// The TCP port conventionally used for the AT-command sub-protocol
pub const AT_COMMAND_TCP_PORT: u16 = 3052;

/// Published schema for device status messages
pub const DEVICE_STATUS_SCHEMA: &str = include_str!("../schemas/device_status.json");

/// Published schema for AT-command messages
pub const AT_COMMAND_SCHEMA: &str = include_str!("../schemas/at_command.json");

/// Generic reply sent to a device whose message was rejected.
/// The server terminates the conversation after sending it.
pub const ERROR_REPLY: &[u8] = b"Error occurred.\nConnection closed.\n";
