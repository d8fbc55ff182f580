//! Directory resume state carried inside the composite cursor.
//!
//! `PageInfo` is serialized as base64 JSON and stored in the composite
//! cursor's `cursor` field.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use dirsync_connector::error::{ConnectorError, ConnectorResult};

/// Where the next page of a directory entity starts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    /// Collection item being enumerated (member entities only).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub collection: Map<String, Value>,

    /// Server paging cookie. For member entities this is the cookie of the
    /// collection batch holding `next_group_processed`.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "cookie")]
    pub next_page_cursor: Option<Vec<u8>>,

    /// Collection item to resume in; empty means "start of batch".
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub next_group_processed: String,

    /// Member offset within `next_group_processed`.
    #[serde(default)]
    pub next_member_processed: i64,

    /// Whether the previous member read came back as a range chunk.
    #[serde(default)]
    pub range_attribute: bool,
}

mod cookie {
    use super::BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_str(&BASE64.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| BASE64.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

impl PageInfo {
    /// Resume state for a plain entity.
    pub fn for_cookie(cookie: Vec<u8>) -> Self {
        Self {
            next_page_cursor: Some(cookie),
            ..Self::default()
        }
    }

    /// Paging cookie, empty when absent.
    pub fn cookie(&self) -> &[u8] {
        self.next_page_cursor.as_deref().unwrap_or_default()
    }

    pub fn encode(&self) -> ConnectorResult<String> {
        Ok(BASE64.encode(serde_json::to_vec(self)?))
    }

    pub fn decode(token: &str) -> ConnectorResult<Self> {
        let bytes = BASE64.decode(token).map_err(|e| {
            ConnectorError::invalid_cursor(format!("page cursor is not valid base64: {e}"))
        })?;
        let info: Self = serde_json::from_slice(&bytes).map_err(|e| {
            ConnectorError::invalid_cursor(format!("page cursor has invalid structure: {e}"))
        })?;
        if info.next_member_processed < 0 {
            return Err(ConnectorError::invalid_cursor("member offset is negative"));
        }
        Ok(info)
    }
}
