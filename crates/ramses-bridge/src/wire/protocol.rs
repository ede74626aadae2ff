//! Wire protocol types for the gateway's MQTT topics.
//!
//! Four topics per gateway, all under `{root}/{device_id}`:
//! - **rx**: radio frames heard by the gateway, `{"msg": "<frame>"}`
//! - **tx**: radio frames to transmit, same envelope
//! - **cmd/cmd**: bare control tokens for the firmware (`!V`, `!C`, ...)
//! - **cmd/result**: firmware answers to control tokens, `{"return": "<text>"}`
//!
//! Frames on the wire never carry the CRLF line terminator. It is stripped on the
//! way out and added on the way in, because the protocol engine reads a serial
//! byte stream.

use std::io;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Line terminator expected by the protocol engine after every frame.
pub const TERMINATOR: &str = "\r\n";

/// Leading character that marks a firmware control token instead of a frame.
pub const CONTROL_SIGIL: char = '!';

/// Control token asking the firmware for its name and version.
pub const VERSION_QUERY: &str = "!V";

/// Firmware name reported by the Ethernet build of ramses_esp.
const ESP_ETH_FIRMWARE: &str = "ramses_esp_eth";

/// Firmware name the protocol engine recognises during its handshake.
const ENGINE_FIRMWARE: &str = "evofw3";

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("payload is not valid UTF-8: {0}")]
    NotUtf8(#[from] std::str::Utf8Error),
    #[error("malformed envelope: {0}")]
    Envelope(#[from] serde_json::Error),
    #[error("envelope carries an empty frame")]
    MissingFrame,
}

/// Which path an inbound message takes through the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundRoute {
    /// Radio frame for the protocol engine's data path.
    Frame,
    /// Firmware answer to a control token.
    CommandResult,
}

/// The fixed topic set for one gateway.
///
/// Derived once from the topic root and device id, never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    rx: String,
    tx: String,
    command: String,
    command_result: String,
}

impl Topics {
    /// Trailing `/` characters on the root are ignored.
    pub fn new(topic_root: &str, device_id: &str) -> Self {
        let base = format!("{}/{}", topic_root.trim_end_matches('/'), device_id);
        Self {
            rx: format!("{base}/rx"),
            tx: format!("{base}/tx"),
            command: format!("{base}/cmd/cmd"),
            command_result: format!("{base}/cmd/result"),
        }
    }

    pub fn rx(&self) -> &str {
        &self.rx
    }

    pub fn tx(&self) -> &str {
        &self.tx
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn command_result(&self) -> &str {
        &self.command_result
    }

    /// Topics the bridge subscribes to, in subscription order.
    pub fn inbound(&self) -> [(&str, InboundRoute); 2] {
        [
            (self.rx.as_str(), InboundRoute::Frame),
            (self.command_result.as_str(), InboundRoute::CommandResult),
        ]
    }

    pub fn route(&self, topic: &str) -> Option<InboundRoute> {
        if topic == self.rx {
            Some(InboundRoute::Frame)
        } else if topic == self.command_result {
            Some(InboundRoute::CommandResult)
        } else {
            None
        }
    }
}

/// Frame envelope used on both the rx and tx topics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameEnvelope {
    pub msg: String,
}

/// Outbound payload, classified by its leading character.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Control token, published verbatim to `cmd/cmd`.
    Command(String),
    /// Radio frame without its line terminator, published to `tx`.
    Frame(String),
}

impl Outbound {
    /// Anything starting with [`CONTROL_SIGIL`] is a control token; everything
    /// else is a frame. Frames never start with the sigil, so this cannot collide.
    pub fn classify(payload: &str) -> Self {
        if payload.starts_with(CONTROL_SIGIL) {
            Self::Command(payload.to_owned())
        } else {
            Self::Frame(payload.trim_end_matches(['\r', '\n']).to_owned())
        }
    }

    /// Classify one line of a write.
    ///
    /// Returns `None` for blank lines and for lines that still hold a line
    /// break, so an envelope never carries more or less than one frame.
    pub fn from_line(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() || line.contains(['\r', '\n']) {
            return None;
        }
        Some(Self::classify(line))
    }

    pub fn is_command(&self) -> bool {
        matches!(self, Self::Command(_))
    }

    pub fn topic<'a>(&self, topics: &'a Topics) -> &'a str {
        match self {
            Self::Command(_) => topics.command(),
            Self::Frame(_) => topics.tx(),
        }
    }

    pub fn encode(&self) -> Result<Bytes, WireError> {
        match self {
            Self::Command(token) => Ok(Bytes::copy_from_slice(token.as_bytes())),
            Self::Frame(frame) => encode_frame_envelope(frame),
        }
    }
}

/// Key separators as the firmware's own tooling writes them (`{"msg": "..."}`).
struct FirmwareFormatter;

impl serde_json::ser::Formatter for FirmwareFormatter {
    fn begin_object_key<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> io::Result<()> {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        writer.write_all(b": ")
    }
}

pub fn encode_frame_envelope(frame: &str) -> Result<Bytes, WireError> {
    let envelope = FrameEnvelope {
        msg: frame.to_owned(),
    };
    let mut buf = Vec::with_capacity(frame.len() + 12);
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, FirmwareFormatter);
    envelope.serialize(&mut ser)?;
    Ok(Bytes::from(buf))
}

/// Decode an rx payload into the CRLF-terminated line the engine expects.
///
/// Stray CR/LF/NUL characters around the frame are dropped. Interior and
/// leading spaces are kept: the verb field is fixed-width (`" I"`, `" W"`).
pub fn decode_frame(payload: &[u8]) -> Result<String, WireError> {
    let text = std::str::from_utf8(payload)?;
    let envelope: FrameEnvelope = serde_json::from_str(text)?;
    let frame = envelope.msg.trim_matches(['\r', '\n', '\0']);
    if frame.is_empty() {
        return Err(WireError::MissingFrame);
    }
    Ok(format!("{frame}{TERMINATOR}"))
}

/// Decode a cmd/result payload.
///
/// Returns `Ok(None)` for well-formed JSON that carries no `return` text.
pub fn decode_command_result(payload: &[u8]) -> Result<Option<String>, WireError> {
    let text = std::str::from_utf8(payload)?;
    let value: serde_json::Value = serde_json::from_str(text)?;
    Ok(value
        .get("return")
        .and_then(serde_json::Value::as_str)
        .map(normalize_command_result))
}

/// Make a firmware answer look like a serial evofw3 gateway's reply line.
pub fn normalize_command_result(result: &str) -> String {
    let result = result.replace(ESP_ETH_FIRMWARE, ENGINE_FIRMWARE);
    let result = result.trim();
    if result.starts_with('#') {
        format!("{result}{TERMINATOR}")
    } else {
        format!("# {result}{TERMINATOR}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: &str = "RP --- 01:000000 18:123456 --:------ 0005 002 0000";

    #[test]
    fn topics_follow_fixed_layout() {
        let topics = Topics::new("RAMSES/GATEWAY", "18:123456");
        assert_eq!(topics.rx(), "RAMSES/GATEWAY/18:123456/rx");
        assert_eq!(topics.tx(), "RAMSES/GATEWAY/18:123456/tx");
        assert_eq!(topics.command(), "RAMSES/GATEWAY/18:123456/cmd/cmd");
        assert_eq!(
            topics.command_result(),
            "RAMSES/GATEWAY/18:123456/cmd/result"
        );
    }

    #[test]
    fn topics_ignore_trailing_slash_on_root() {
        assert_eq!(
            Topics::new("RAMSES/GATEWAY//", "18:123456"),
            Topics::new("RAMSES/GATEWAY", "18:123456")
        );
    }

    #[test]
    fn route_distinguishes_inbound_topics() {
        let topics = Topics::new("RAMSES/GATEWAY", "18:123456");
        assert_eq!(
            topics.route("RAMSES/GATEWAY/18:123456/rx"),
            Some(InboundRoute::Frame)
        );
        assert_eq!(
            topics.route("RAMSES/GATEWAY/18:123456/cmd/result"),
            Some(InboundRoute::CommandResult)
        );
        assert_eq!(topics.route("RAMSES/GATEWAY/18:123456/tx"), None);
        assert_eq!(topics.route("RAMSES/GATEWAY/18:999999/rx"), None);
    }

    #[test]
    fn frame_envelope_uses_firmware_spacing() {
        let bytes = encode_frame_envelope(FRAME).unwrap();
        insta::assert_snapshot!(
            std::str::from_utf8(&bytes).unwrap(),
            @r#"{"msg": "RP --- 01:000000 18:123456 --:------ 0005 002 0000"}"#
        );
    }

    #[test]
    fn frame_envelope_escapes_quotes() {
        let bytes = encode_frame_envelope(r#"a "quoted" frame"#).unwrap();
        assert_eq!(&bytes[..], br#"{"msg": "a \"quoted\" frame"}"#);
    }

    #[test]
    fn classify_routes_sigil_to_command_verbatim() {
        for token in ["!V", "!C", "!V\r\n", "! anything at all"] {
            let outbound = Outbound::classify(token);
            assert_eq!(outbound, Outbound::Command(token.to_string()));
            assert_eq!(outbound.encode().unwrap(), Bytes::from(token.to_string()));
        }
    }

    #[test]
    fn classify_routes_everything_else_to_frame() {
        for payload in [FRAME, " I --- 01:145038 --:------ 01:145038 1F09 003 FF04B5", " !V"] {
            assert!(!Outbound::classify(payload).is_command(), "{payload:?}");
        }
    }

    #[test]
    fn classify_strips_line_terminator_from_frames() {
        let outbound = Outbound::classify(&format!("{FRAME}\r\n"));
        assert_eq!(outbound, Outbound::Frame(FRAME.to_string()));
    }

    #[test]
    fn from_line_refuses_blank_and_multi_line_payloads() {
        for line in ["", "   ", "\r\n", " \t\r\n", "RQ a\r\nRQ b", "RQ a\rRQ b"] {
            assert_eq!(Outbound::from_line(line), None, "{line:?}");
        }
    }

    #[test]
    fn from_line_keeps_fixed_width_verbs() {
        let frame = " I --- 01:145038 --:------ 01:145038 1F09 003 FF04B5";
        assert_eq!(
            Outbound::from_line(&format!("{frame}\r\n")),
            Some(Outbound::Frame(frame.to_string()))
        );
        assert_eq!(
            Outbound::from_line("!V\r\n"),
            Some(Outbound::Command("!V".to_string()))
        );
    }

    #[test]
    fn outbound_topic_matches_class() {
        let topics = Topics::new("RAMSES/GATEWAY", "18:123456");
        assert_eq!(
            Outbound::classify("!V").topic(&topics),
            "RAMSES/GATEWAY/18:123456/cmd/cmd"
        );
        assert_eq!(
            Outbound::classify(FRAME).topic(&topics),
            "RAMSES/GATEWAY/18:123456/tx"
        );
    }

    #[test]
    fn decode_frame_appends_terminator() {
        let payload = br#"{"msg": "RQ --- 18:123456 01:000000 --:------ 0005 002 0000"}"#;
        assert_eq!(
            decode_frame(payload).unwrap(),
            "RQ --- 18:123456 01:000000 --:------ 0005 002 0000\r\n"
        );
    }

    #[test]
    fn decode_frame_strips_stray_line_noise_but_keeps_verb_alignment() {
        let payload = br#"{"msg": " I --- 01:145038 --:------ 01:145038 1F09 003 FF04B5\r\n\u0000"}"#;
        assert_eq!(
            decode_frame(payload).unwrap(),
            " I --- 01:145038 --:------ 01:145038 1F09 003 FF04B5\r\n"
        );
    }

    #[test]
    fn decode_frame_roundtrips_encoded_envelope() {
        let encoded = Outbound::classify(FRAME).encode().unwrap();
        assert_eq!(decode_frame(&encoded).unwrap(), format!("{FRAME}\r\n"));
    }

    #[test]
    fn decode_frame_rejects_bad_payloads() {
        assert!(matches!(
            decode_frame(&[0xff, 0xfe, 0xfd]),
            Err(WireError::NotUtf8(_))
        ));
        assert!(matches!(
            decode_frame(b"not json"),
            Err(WireError::Envelope(_))
        ));
        assert!(matches!(
            decode_frame(br#"{"other": "x"}"#),
            Err(WireError::Envelope(_))
        ));
        assert!(matches!(
            decode_frame(br#"{"msg": "\r\n"}"#),
            Err(WireError::MissingFrame)
        ));
    }

    #[test]
    fn command_result_rewrites_esp_firmware_name() {
        let decoded = decode_command_result(br#"{"return": "ramses_esp_eth 0.5.0"}"#).unwrap();
        assert_eq!(decoded.as_deref(), Some("# evofw3 0.5.0\r\n"));
    }

    #[test]
    fn command_result_keeps_existing_hash() {
        let decoded = decode_command_result(br##"{"return": "# evofw3 0.7.1\n"}"##).unwrap();
        assert_eq!(decoded.as_deref(), Some("# evofw3 0.7.1\r\n"));
    }

    #[test]
    fn command_result_without_return_is_ignored() {
        assert_eq!(decode_command_result(br#"{"cmd": "!V"}"#).unwrap(), None);
        assert_eq!(decode_command_result(br#""just text""#).unwrap(), None);
        assert!(decode_command_result(b"!V ok").is_err());
    }
}
