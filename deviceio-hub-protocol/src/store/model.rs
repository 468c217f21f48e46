//! Stored records consumed by the hub
//!
//! These types are read-only to the core; the external store owns them.
//! Binary fields travel as standard base64 in JSON.

use serde::{Deserialize, Serialize};

use super::Record;

/// An operator account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,

    #[serde(default)]
    pub admin: bool,

    pub login: String,

    pub email: String,

    /// Raw RFC 6238 HMAC key bytes
    #[serde(with = "base64_bytes")]
    pub totp_secret: Vec<u8>,

    /// 32-byte Ed25519 public key
    #[serde(with = "base64_bytes")]
    pub ed25519_public_key: Vec<u8>,
}

/// Another hub instance participating in the cluster. Carried as a
/// collaborator only; this hub does not route between instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: String,

    #[serde(default)]
    pub bind_addr: Vec<String>,

    #[serde(default)]
    pub bind_port: String,
}

/// The persisted record of a device known to the cluster, as opposed to
/// `DeviceInfo`, which describes a live gateway connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: String,

    #[serde(default)]
    pub hostname: String,

    #[serde(default)]
    pub connected: bool,
}

impl Record for User {
    fn id(&self) -> &str {
        &self.id
    }
}

impl Record for Member {
    fn id(&self) -> &str {
        &self.id
    }
}

impl Record for DeviceRecord {
    fn id(&self) -> &str {
        &self.id
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
