//! Version information for the bridge and the gateway firmware behind it.

/// Bridge version from Cargo.toml
pub const BRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct VersionInfo {
    /// Version of this crate.
    pub bridge: &'static str,
    /// Firmware name and version from the last `!V` answer, e.g. `evofw3 0.7.1`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            bridge: BRIDGE_VERSION,
            firmware: None,
        }
    }
}

impl VersionInfo {
    /// Bridge version only; the firmware is filled in once the gateway answers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the firmware string, as parsed by [`parse_firmware`].
    pub fn with_firmware(mut self, firmware: String) -> Self {
        self.firmware = Some(firmware);
        self
    }
}

/// Extract the firmware description from a normalised command result line.
///
/// `"# evofw3 0.7.1\r\n"` becomes `"evofw3 0.7.1"`. Returns `None` for lines
/// that carry no text.
pub fn parse_firmware(line: &str) -> Option<String> {
    let text = line.trim().trim_start_matches('#').trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_info_has_bridge_version() {
        let info = VersionInfo::new();
        assert_eq!(info.bridge, BRIDGE_VERSION);
        assert!(info.firmware.is_none());
    }

    #[test]
    fn parses_normalised_result_line() {
        assert_eq!(
            parse_firmware("# evofw3 0.7.1\r\n").as_deref(),
            Some("evofw3 0.7.1")
        );
        assert_eq!(parse_firmware("#\r\n"), None);
        assert_eq!(parse_firmware(""), None);
    }

    #[test]
    fn version_info_serializes_minimal() {
        let info = VersionInfo {
            bridge: "0.1.0",
            firmware: None,
        };
        insta::assert_json_snapshot!(info, @r#"
        {
          "bridge": "0.1.0"
        }
        "#);
    }

    #[test]
    fn version_info_serializes_full() {
        let info = VersionInfo {
            bridge: "0.1.0",
            firmware: None,
        }
        .with_firmware("evofw3 0.7.1".to_string());
        insta::assert_json_snapshot!(info, @r#"
        {
          "bridge": "0.1.0",
          "firmware": "evofw3 0.7.1"
        }
        "#);
    }
}
