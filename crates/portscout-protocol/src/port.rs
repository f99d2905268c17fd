use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Descriptor for a communication port reported by a discovery.
///
/// Two ports are considered equal when they share the same `address` and
/// `protocol`; the remaining fields are presentation metadata. Optional
/// fields are omitted from the serialized form when absent, and
/// `properties` keeps its insertion order through serialization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Port {
    pub address: String,

    #[serde(rename = "label", default, skip_serializing_if = "Option::is_none")]
    pub address_label: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_label: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<IndexMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_id: Option<String>,
}

impl Port {
    /// Create a port with just an address set.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    /// Identity key used to track a port across add/remove events.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}|{}", self.address, self.protocol.as_deref().unwrap_or(""))
    }
}

impl PartialEq for Port {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.protocol == other.protocol
    }
}

impl Eq for Port {}

impl std::fmt::Display for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.address)
    }
}
