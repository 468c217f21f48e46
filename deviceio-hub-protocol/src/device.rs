//! Device identity
//!
//! The identity a device presents when it connects to the gateway. The hub
//! fetches this once per connection (`GET /info` over the freshly opened
//! tunnel) and treats it as immutable for the lifetime of the connection.

use serde::{Deserialize, Serialize};
use uuid::{Uuid, Version};

use crate::{HubError, Result};

/// Identity and environment information supplied by a device during its
/// initial connection to the gateway server.
///
/// The connection layer does not ascertain the validity of this data beyond
/// its inherent structure: the id must be a canonical v4 UUID and the
/// hostname must be non-empty. Field names match the JSON the device agent
/// emits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceInfo {
    /// Device id as a V4 UUID in hyphenated string form
    #[serde(rename = "ID")]
    pub id: String,

    /// Hostname of the device
    pub hostname: String,

    /// Architecture indicated by the device: amd64, arm64, i386 etc.
    #[serde(default)]
    pub architecture: String,

    /// Platform indicated by the device: windows, linux, macosx etc.
    #[serde(default)]
    pub platform: String,

    /// Free-form tags assigned to the device
    #[serde(default)]
    pub tags: Vec<String>,
}

impl DeviceInfo {
    /// Validate the structural requirements on a freshly received identity.
    ///
    /// # Errors
    ///
    /// Returns `HubError::ConnectHandshakeFailed` if the id is not a
    /// canonical hyphenated v4 UUID or the hostname is empty.
    pub fn validate(&self) -> Result<()> {
        let parsed = Uuid::parse_str(&self.id).map_err(|e| {
            HubError::ConnectHandshakeFailed(format!("device id is not a valid UUID: {e}"))
        })?;

        // uuid accepts simple/braced/urn forms; the registry keys on the
        // canonical hyphenated representation.
        if !parsed
            .as_hyphenated()
            .to_string()
            .eq_ignore_ascii_case(&self.id)
        {
            return Err(HubError::ConnectHandshakeFailed(format!(
                "device id '{}' is not in canonical hyphenated form",
                self.id
            )));
        }

        if parsed.get_version() != Some(Version::Random) {
            return Err(HubError::ConnectHandshakeFailed(format!(
                "device id '{}' is not a version-4 UUID",
                self.id
            )));
        }

        if self.hostname.trim().is_empty() {
            return Err(HubError::ConnectHandshakeFailed(
                "device hostname is empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Registry key for the id map
    pub fn id_key(&self) -> String {
        self.id.to_lowercase()
    }

    /// Registry key for the hostname map
    pub fn hostname_key(&self) -> String {
        self.hostname.to_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_info() -> DeviceInfo {
        DeviceInfo {
            id: Uuid::new_v4().to_string(),
            hostname: "Office-Laptop".to_string(),
            architecture: "amd64".to_string(),
            platform: "linux".to_string(),
            tags: vec!["lab".to_string()],
        }
    }

    #[test]
    fn test_valid_info_passes() {
        assert!(valid_info().validate().is_ok());
    }

    #[test]
    fn test_uppercase_uuid_is_canonical() {
        let mut info = valid_info();
        info.id = info.id.to_uppercase();
        assert!(info.validate().is_ok());
    }

    #[test]
    fn test_rejects_non_uuid_id() {
        let mut info = valid_info();
        info.id = "not-a-uuid".to_string();
        assert!(matches!(
            info.validate(),
            Err(HubError::ConnectHandshakeFailed(_))
        ));
    }

    #[test]
    fn test_rejects_simple_form_uuid() {
        let mut info = valid_info();
        info.id = Uuid::new_v4().as_simple().to_string();
        assert!(matches!(
            info.validate(),
            Err(HubError::ConnectHandshakeFailed(_))
        ));
    }

    #[test]
    fn test_rejects_non_v4_uuid() {
        let mut info = valid_info();
        // NAMESPACE_DNS is a version-1 UUID
        info.id = Uuid::NAMESPACE_DNS.to_string();
        assert!(matches!(
            info.validate(),
            Err(HubError::ConnectHandshakeFailed(_))
        ));
    }

    #[test]
    fn test_rejects_empty_hostname() {
        let mut info = valid_info();
        info.hostname = "   ".to_string();
        assert!(matches!(
            info.validate(),
            Err(HubError::ConnectHandshakeFailed(_))
        ));
    }

    #[test]
    fn test_lookup_keys_are_lowercased() {
        let info = valid_info();
        assert_eq!(info.hostname_key(), "office-laptop");
        assert_eq!(info.id_key(), info.id.to_lowercase());
    }

    #[test]
    fn test_wire_field_names() {
        let info = valid_info();
        let json = serde_json::to_value(&info).unwrap();
        assert!(json.get("ID").is_some());
        assert!(json.get("Hostname").is_some());
        assert!(json.get("Architecture").is_some());
        assert!(json.get("Platform").is_some());
        assert!(json.get("Tags").is_some());
    }

    #[test]
    fn test_decodes_minimal_identity() {
        let json = format!(
            r#"{{"ID":"{}","Hostname":"build-box"}}"#,
            Uuid::new_v4()
        );
        let info: DeviceInfo = serde_json::from_str(&json).unwrap();
        assert!(info.validate().is_ok());
        assert!(info.tags.is_empty());
    }
}
