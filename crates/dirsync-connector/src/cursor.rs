//! Composite cursor pagination.
//!
//! Every paginated connector hands the caller an opaque token: base64 of a
//! JSON [`CompositeCursor`]. For plain entities only `cursor` is used. For
//! member-of-collection entities the token also records which collection item
//! is being enumerated (`collectionId`) and where the collection itself
//! resumes (`collectionCursor`).
//!
//! An absent token means "first page" on input and "sync complete" on output.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;

use crate::error::{ConnectorError, ConnectorResult};
use crate::operation::{AttributeSet, AttributeValue};

/// Resumption state for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeCursor<T> {
    /// Position within the entity (or within the current collection item).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<T>,

    /// Collection item whose members are being enumerated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection_id: Option<String>,

    /// Position of the next collection page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection_cursor: Option<T>,
}

impl<T> Default for CompositeCursor<T> {
    fn default() -> Self {
        Self {
            cursor: None,
            collection_id: None,
            collection_cursor: None,
        }
    }
}

impl<T> CompositeCursor<T> {
    /// Cursor for a plain entity.
    pub fn new(cursor: T) -> Self {
        Self {
            cursor: Some(cursor),
            ..Self::default()
        }
    }

    /// Whether a caller needs another call to finish the sync.
    pub fn has_more(&self) -> bool {
        self.cursor.is_some() || self.collection_cursor.is_some()
    }
}

/// Decode an opaque token. An absent or empty token decodes to `None`.
pub fn decode<T: DeserializeOwned>(token: Option<&str>) -> ConnectorResult<Option<CompositeCursor<T>>> {
    let token = match token {
        Some(t) if !t.is_empty() => t,
        _ => return Ok(None),
    };

    let bytes = BASE64
        .decode(token)
        .map_err(|e| ConnectorError::invalid_cursor(format!("cursor is not valid base64: {e}")))?;

    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| ConnectorError::invalid_cursor(format!("cursor has invalid structure: {e}")))
}

/// Encode a cursor into an opaque token. `None` encodes to no token.
pub fn encode<T: Serialize>(cursor: Option<&CompositeCursor<T>>) -> ConnectorResult<Option<String>> {
    match cursor {
        None => Ok(None),
        Some(c) => {
            let json = serde_json::to_vec(c)?;
            Ok(Some(BASE64.encode(json)))
        }
    }
}

/// Check that the cursor's shape matches the kind of entity it is used with.
pub fn validate_cursor<T>(
    cursor: Option<&CompositeCursor<T>>,
    entity_id: &str,
    is_member_entity: bool,
) -> ConnectorResult<()> {
    let Some(cursor) = cursor else {
        return Ok(());
    };

    if is_member_entity && cursor.collection_id.is_none() {
        return Err(ConnectorError::invalid_cursor(format!(
            "cursor for member entity '{entity_id}' is missing its collection id"
        )));
    }

    if !is_member_entity && (cursor.collection_id.is_some() || cursor.collection_cursor.is_some())
    {
        return Err(ConnectorError::invalid_cursor(format!(
            "cursor for entity '{entity_id}' must not carry collection state"
        )));
    }

    Ok(())
}

/// Read an offset from a cursor payload: an integer or a numeric string.
pub fn parse_offset(cursor: Option<&Value>) -> ConnectorResult<i64> {
    let offset = match cursor {
        None | Some(Value::Null) => return Ok(0),
        Some(Value::Number(n)) => n
            .as_i64()
            .ok_or_else(|| ConnectorError::invalid_cursor(format!("offset {n} is not an integer")))?,
        Some(Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| ConnectorError::invalid_cursor(format!("offset '{s}' is not numeric")))?,
        Some(other) => {
            return Err(ConnectorError::invalid_cursor(format!(
                "unsupported offset cursor: {other}"
            )))
        }
    };

    if offset < 0 {
        return Err(ConnectorError::invalid_cursor(format!(
            "offset {offset} is negative"
        )));
    }
    Ok(offset)
}

/// Offset-window pagination over an in-memory list.
///
/// `page_size <= 0` returns the remainder of the list. The returned cursor is
/// the next offset, absent once the window reaches the end.
pub fn paginate<T: Clone>(
    items: &[T],
    page_size: i64,
    cursor: Option<&Value>,
) -> ConnectorResult<(Vec<T>, Option<Value>)> {
    let start = parse_offset(cursor)?;
    let len = items.len() as i64;

    if start != 0 && start >= len {
        return Err(ConnectorError::invalid_cursor(format!(
            "offset {start} is out of range for {len} items"
        )));
    }

    let end = if page_size <= 0 {
        len
    } else {
        start.saturating_add(page_size).min(len)
    };

    let page = items[start as usize..end as usize].to_vec();
    let next = (end < len).then(|| Value::from(end));
    Ok((page, next))
}

/// Advance the collection half of a composite cursor.
///
/// When the member half is already set the caller is mid-way through one
/// collection item and nothing happens. Otherwise one collection item is
/// fetched through `fetch_one_page` (called with the stored collection
/// cursor), its `id_attribute` becomes `collection_id` and the returned page
/// token becomes `collection_cursor`.
///
/// Returns `true` when there is neither a current item nor a next page, i.e.
/// the sync is complete.
pub async fn update_from_collection_api<T, F, Fut>(
    cursor: &mut CompositeCursor<T>,
    fetch_one_page: F,
    id_attribute: &str,
) -> ConnectorResult<bool>
where
    F: FnOnce(Option<T>) -> Fut,
    Fut: Future<Output = ConnectorResult<(Vec<AttributeSet>, Option<T>)>>,
{
    if cursor.cursor.is_some() {
        return Ok(false);
    }

    let (objects, next) = fetch_one_page(cursor.collection_cursor.take()).await?;

    let Some(object) = objects.first() else {
        if next.is_some() {
            return Err(ConnectorError::internal(
                "collection page returned no object but a next page cursor",
            ));
        }
        cursor.collection_id = None;
        return Ok(true);
    };

    let id = match object.get(id_attribute) {
        Some(AttributeValue::String(s)) if !s.is_empty() => s.clone(),
        Some(AttributeValue::Integer(i)) => i.to_string(),
        _ => {
            return Err(ConnectorError::internal(format!(
                "collection object is missing its '{id_attribute}' attribute"
            )))
        }
    };

    cursor.collection_id = Some(id);
    cursor.collection_cursor = next;
    Ok(false)
}
