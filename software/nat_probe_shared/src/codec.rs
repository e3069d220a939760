//! Schema validation and decoding of inbound device messages.

use std::path::Path;

use jsonschema::Validator;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::messages::{AtCommandMessage, DeviceMessage, MessageKind};
use crate::{AT_COMMAND_SCHEMA, DEVICE_STATUS_SCHEMA};

/// Reasons an inbound message is rejected.
///
/// None of these are ever logged as a record; the device gets the generic
/// error reply instead.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("message is not valid JSON: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("message does not match the {kind} schema: {details}")]
    Schema { kind: MessageKind, details: String },

    #[error("message could not be decoded as {kind}: {source}")]
    Decode {
        kind: MessageKind,
        #[source]
        source: serde_json::Error,
    },

    #[error("message exceeds the {limit} byte limit")]
    TooLong { limit: usize },
}

/// A schema document that could not be loaded or compiled.
#[derive(Debug, Error)]
#[error("invalid {kind} schema: {details}")]
pub struct SchemaError {
    pub kind: MessageKind,
    pub details: String,
}

/// Compiled validators for each message kind.
///
/// Decoding takes `&self` and touches no shared mutable state,
/// so a single codec can be shared between any number of handler threads.
pub struct MessageCodec {
    device_status: Validator,
    at_command: Validator,
}

impl MessageCodec {
    /// Compile the schemas embedded in this crate.
    pub fn new() -> Result<Self, SchemaError> {
        Self::from_schema_strs(DEVICE_STATUS_SCHEMA, AT_COMMAND_SCHEMA)
    }

    /// Compile schemas from their JSON text.
    pub fn from_schema_strs(device_status: &str, at_command: &str) -> Result<Self, SchemaError> {
        Ok(Self {
            device_status: compile(MessageKind::DeviceStatus, device_status)?,
            at_command: compile(MessageKind::AtCommand, at_command)?,
        })
    }

    /// Load and compile schemas from files on disk.
    pub fn from_files(device_status: &Path, at_command: &Path) -> Result<Self, SchemaError> {
        let read = |kind: MessageKind, path: &Path| {
            std::fs::read_to_string(path).map_err(|e| SchemaError {
                kind,
                details: format!("failed to read {}: {e}", path.display()),
            })
        };
        let device_status = read(MessageKind::DeviceStatus, device_status)?;
        let at_command = read(MessageKind::AtCommand, at_command)?;
        Self::from_schema_strs(&device_status, &at_command)
    }

    /// Validate and decode a device status message.
    pub fn decode_device_status(&self, buffer: &[u8]) -> Result<DeviceMessage, ValidationError> {
        self.decode(MessageKind::DeviceStatus, buffer)
    }

    /// Validate and decode an AT-command message.
    pub fn decode_at_command(&self, buffer: &[u8]) -> Result<AtCommandMessage, ValidationError> {
        self.decode(MessageKind::AtCommand, buffer)
    }

    fn validator(&self, kind: MessageKind) -> &Validator {
        match kind {
            MessageKind::DeviceStatus => &self.device_status,
            MessageKind::AtCommand => &self.at_command,
        }
    }

    fn decode<T: DeserializeOwned>(
        &self,
        kind: MessageKind,
        buffer: &[u8],
    ) -> Result<T, ValidationError> {
        // Devices terminate each message with a newline
        let value: Value =
            serde_json::from_slice(buffer.trim_ascii_end()).map_err(ValidationError::Malformed)?;

        let errors: Vec<String> = self
            .validator(kind)
            .iter_errors(&value)
            .map(|e| format!("{} at {}", e, e.instance_path))
            .collect();
        if !errors.is_empty() {
            return Err(ValidationError::Schema {
                kind,
                details: errors.join("; "),
            });
        }

        // The schema checks formats, but the typed decode is authoritative
        // for anything the schema leaves loose
        serde_json::from_value(value).map_err(|source| ValidationError::Decode { kind, source })
    }
}

fn compile(kind: MessageKind, schema: &str) -> Result<Validator, SchemaError> {
    let schema: Value = serde_json::from_str(schema).map_err(|e| SchemaError {
        kind,
        details: format!("not valid JSON: {e}"),
    })?;
    jsonschema::options()
        .should_validate_formats(true)
        .build(&schema)
        .map_err(|e| SchemaError {
            kind,
            details: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;

    fn codec() -> MessageCodec {
        MessageCodec::new().expect("embedded schemas compile")
    }

    fn status(fields: &str) -> String {
        format!("{{{fields}}}\n")
    }

    const VALID: &str = r#""op":"24201","ip":["10.160.73.64"],"cell_id":21229824,"ue_mode":2,"lte_mode":1,"nbiot_mode":1,"gps_mode":1,"iccid":"8931089318104314834F","interval":5"#;

    #[test]
    fn accepts_reference_messages() {
        let codec = codec();
        let cases = [
            VALID.to_owned(),
            VALID.replace("8931089318104314834F", "8931089318104314834"),
            VALID.replace("8931089318104314834F", "89310893181043148340"),
            VALID.replace("10.160.73.64", "0000:0000:0000:0000:0000:0000:0000:0000"),
            VALID
                .replace("\"24201\"", "\"242011\"")
                .replace(r#"["10.160.73.64"]"#, r#"["0.0.0.0","::1"]"#),
            format!(r#"{VALID},"imei":"352656100367872""#),
        ];

        for case in cases {
            let msg = status(&case);
            assert!(
                codec.decode_device_status(msg.as_bytes()).is_ok(),
                "rejected valid message {msg}"
            );
        }
    }

    #[test]
    fn decodes_fields() {
        let msg = codec()
            .decode_device_status(status(VALID).as_bytes())
            .unwrap();
        assert_eq!(msg.operator, "24201");
        assert_eq!(msg.ip, vec![IpAddr::V4(Ipv4Addr::new(10, 160, 73, 64))]);
        assert_eq!(msg.cell_id, 21229824);
        assert_eq!(msg.ue_mode, 2);
        assert_eq!(msg.iccid, "8931089318104314834F");
        assert_eq!(msg.imei, None);
        assert_eq!(msg.interval, 5);
    }

    #[test]
    fn rejects_nonconforming_messages() {
        let codec = codec();
        let cases = [
            // Missing field
            VALID.replace(r#","interval":5"#, ""),
            // Unknown extra field
            format!(r#"{VALID},"temp":0"#),
            // Negative interval
            VALID.replace(r#""interval":5"#, r#""interval":-1"#),
            // ICCID empty, wrong issuer prefix, too short, too long
            VALID.replace("8931089318104314834F", ""),
            VALID.replace("8931089318104314834F", "2331089318104314834F"),
            VALID.replace("8931089318104314834F", "893108931810431"),
            VALID.replace("8931089318104314834F", "893108931810431483401"),
            // Operator code too long and too short
            VALID.replace("\"24201\"", "\"1000000\""),
            VALID.replace("\"24201\"", "\"1000\""),
            // Out-of-range enums
            VALID.replace(r#""ue_mode":2"#, r#""ue_mode":3"#),
            VALID.replace(r#""lte_mode":1"#, r#""lte_mode":-1"#),
            VALID.replace(r#""nbiot_mode":1"#, r#""nbiot_mode":2"#),
            VALID.replace(r#""gps_mode":1"#, r#""gps_mode":"d""#),
            // Bad IP literals
            VALID.replace("10.160.73.64", "O:0db8:85a3:08d3:1319:8a2e:0370:7344"),
            VALID.replace(r#"["10.160.73.64"]"#, "[]"),
            VALID.replace(r#"["10.160.73.64"]"#, r#""10.160.73.64""#),
            // Malformed IMEI
            format!(r#"{VALID},"imei":"35265610036787""#),
        ];

        for case in cases {
            let msg = status(&case);
            assert!(
                matches!(
                    codec.decode_device_status(msg.as_bytes()),
                    Err(ValidationError::Schema { .. } | ValidationError::Decode { .. })
                ),
                "accepted invalid message {msg}"
            );
        }
    }

    #[test]
    fn rejects_malformed_json() {
        let codec = codec();
        let msg = VALID.replace(r#""24201""#, "");
        let result = codec.decode_device_status(status(&msg).as_bytes());
        assert!(matches!(result, Err(ValidationError::Malformed(_))));
        assert!(codec.decode_device_status(b"").is_err());
        assert!(codec.decode_device_status(b"\xff\xfe").is_err());
    }

    #[test]
    fn at_command_messages() {
        let codec = codec();
        let valid = br#"{"cmd":"AT+CEREG?","response":"+CEREG: 5,1","iccid":"8931089318104314834F"}"#;
        let msg = codec.decode_at_command(valid).unwrap();
        assert_eq!(msg.command, "AT+CEREG?");
        assert_eq!(msg.response, "+CEREG: 5,1");

        let not_at = br#"{"cmd":"CEREG?","response":"","iccid":"8931089318104314834F"}"#;
        assert!(codec.decode_at_command(not_at).is_err());

        // A device status message is not an AT command
        assert!(codec.decode_at_command(status(VALID).as_bytes()).is_err());
    }

    #[test]
    fn rejects_broken_schema() {
        let err = MessageCodec::from_schema_strs("{", AT_COMMAND_SCHEMA)
            .err()
            .expect("schema should not compile");
        assert_eq!(err.kind, MessageKind::DeviceStatus);

        let err = MessageCodec::from_schema_strs(DEVICE_STATUS_SCHEMA, r#"{"type": 12}"#)
            .err()
            .expect("schema should not compile");
        assert_eq!(err.kind, MessageKind::AtCommand);
    }
}
