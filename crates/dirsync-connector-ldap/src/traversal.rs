//! Member-of-collection enumeration.
//!
//! A member entity has no objects of its own: every member of every item of
//! the parent collection (typically `member` values of groups) becomes one
//! row. One page walks the collection in batches and drains each item's
//! membership attribute until the page budget is spent, then records where it
//! stopped in a [`PageInfo`].
//!
//! Large membership attributes are returned by Active Directory in chunks
//! keyed `member;range=START-END`, the last chunk ending in `*`. Once a chunk
//! marker has been seen the remaining values are requested with
//! `member;range=OFFSET-*`; otherwise the full attribute is re-read and the
//! stored offset applied locally.

use ldap3::SearchEntry;
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{debug, instrument, warn};

use dirsync_connector::cursor::CompositeCursor;
use dirsync_connector::error::{ConnectorError, ConnectorResult};
use dirsync_connector::operation::AttributeSet;

use crate::coerce::{decode_binary, values_ignore_case, BinarySyntax};
use crate::config::{
    EntityConfig, LdapRequest, COLLECTION_ATTRIBUTE_PLACEHOLDER, COLLECTION_ID_PLACEHOLDER,
};
use crate::connection::DirectoryQuery;
use crate::page_info::PageInfo;
use crate::search::{escape_filter_value, DirectoryClient, ReleasePolicy};
use crate::target::DialTarget;

/// Rows of one member page and where the next page starts.
#[derive(Debug, Clone)]
pub struct MemberPage {
    pub objects: Vec<AttributeSet>,
    pub next: Option<CompositeCursor<String>>,
}

/// One collection item.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CollectionItem {
    id: String,
    /// Value of the entity's `collection_attribute`, empty when unset.
    attribute: String,
}

/// `;range=START-END` option of a returned attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RangeChunk {
    start: i64,
    /// `None` for `*`, the final chunk.
    end: Option<i64>,
}

enum Drained {
    /// Budget ran out with members left at `offset`.
    Partial { offset: i64, ranged: bool },
    /// No members left.
    Exhausted,
}

/// Walks one page of a member entity.
pub struct MemberTraversal<'a> {
    client: &'a DirectoryClient,
    target: &'a DialTarget,
    request: &'a LdapRequest,
    entity: &'a EntityConfig,
    parent: &'a EntityConfig,
    timeout: Duration,
    member_id_attribute: &'a str,
    collection_id_attribute: &'a str,
    budget: i64,
    objects: Vec<AttributeSet>,
}

impl<'a> MemberTraversal<'a> {
    pub fn new(
        client: &'a DirectoryClient,
        target: &'a DialTarget,
        request: &'a LdapRequest,
        entity: &'a EntityConfig,
        parent: &'a EntityConfig,
        timeout: Duration,
    ) -> ConnectorResult<Self> {
        let member_id_attribute = entity.member_unique_id_attribute.as_deref().ok_or_else(|| {
            ConnectorError::invalid_configuration("member_unique_id_attribute is required")
        })?;
        let collection_id_attribute =
            entity.member_of_unique_id_attribute.as_deref().ok_or_else(|| {
                ConnectorError::invalid_configuration("member_of_unique_id_attribute is required")
            })?;

        Ok(Self {
            client,
            target,
            request,
            entity,
            parent,
            timeout,
            member_id_attribute,
            collection_id_attribute,
            budget: request.page_size,
            objects: Vec::new(),
        })
    }

    /// Produce one page, resuming from `resume` when given.
    #[instrument(skip_all, fields(entity = %self.request.entity_external_id, page_size = self.budget))]
    pub async fn run(mut self, resume: Option<PageInfo>) -> ConnectorResult<MemberPage> {
        let resume = resume.unwrap_or_default();
        let mut batch_cookie = resume.cookie().to_vec();
        let mut skip_through: Option<String> = None;
        let mut last_item: Option<String> = None;

        if !resume.next_group_processed.is_empty() {
            let item = self.resumed_item(&resume);
            debug!(
                collection_id = %item.id,
                offset = resume.next_member_processed,
                "Resuming collection item"
            );
            match self
                .drain(&item, resume.next_member_processed, resume.range_attribute)
                .await?
            {
                Drained::Partial { offset, ranged } => {
                    return self.finish(&batch_cookie, Some(&item), offset, ranged, None);
                }
                Drained::Exhausted => {
                    last_item = Some(item.id.clone());
                    skip_through = Some(item.id);
                }
            }
        }

        loop {
            let (items, next_cookie) = self.fetch_batch(&batch_cookie).await?;

            let start = match skip_through.take() {
                Some(id) => match items.iter().position(|item| item.id == id) {
                    Some(index) => index + 1,
                    None => {
                        warn!(
                            collection_id = %id,
                            "Resumed collection item is no longer in its batch, restarting batch"
                        );
                        0
                    }
                },
                None => 0,
            };

            for item in items.iter().skip(start) {
                if self.budget == 0 {
                    return self.finish(&batch_cookie, Some(item), 0, false, None);
                }
                match self.drain(item, 0, false).await? {
                    Drained::Partial { offset, ranged } => {
                        return self.finish(&batch_cookie, Some(item), offset, ranged, None);
                    }
                    Drained::Exhausted => last_item = Some(item.id.clone()),
                }
            }

            let Some(next_cookie) = next_cookie else {
                self.client.release(self.target, &batch_cookie).await;
                debug!(rows = self.objects.len(), "Collection traversal complete");
                return Ok(MemberPage {
                    objects: self.objects,
                    next: None,
                });
            };

            batch_cookie = next_cookie;
            if self.budget == 0 {
                return self.finish(&batch_cookie, None, 0, false, last_item);
            }
        }
    }

    fn resumed_item(&self, resume: &PageInfo) -> CollectionItem {
        let attribute = self
            .entity
            .collection_attribute
            .as_deref()
            .and_then(|name| resume.collection.get(name))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        CollectionItem {
            id: resume.next_group_processed.clone(),
            attribute,
        }
    }

    /// Build the page result with a cursor that resumes at `item` (or at the
    /// start of the batch fetched with `batch_cookie` when `item` is `None`).
    fn finish(
        self,
        batch_cookie: &[u8],
        item: Option<&CollectionItem>,
        offset: i64,
        ranged: bool,
        last_item: Option<String>,
    ) -> ConnectorResult<MemberPage> {
        let mut collection = Map::new();
        if let Some(item) = item {
            collection.insert(self.collection_id_attribute.to_string(), Value::from(item.id.as_str()));
            if let Some(name) = &self.entity.collection_attribute {
                collection.insert(name.clone(), Value::from(item.attribute.as_str()));
            }
        }

        let info = PageInfo {
            collection,
            next_page_cursor: (!batch_cookie.is_empty()).then(|| batch_cookie.to_vec()),
            next_group_processed: item.map(|i| i.id.clone()).unwrap_or_default(),
            next_member_processed: offset,
            range_attribute: ranged,
        };

        let collection_id = item.map(|i| i.id.clone()).or(last_item).unwrap_or_default();
        debug!(
            rows = self.objects.len(),
            collection_id = %collection_id,
            offset,
            ranged,
            "Member page budget spent"
        );

        Ok(MemberPage {
            objects: self.objects,
            next: Some(CompositeCursor {
                cursor: Some(info.encode()?),
                collection_id: Some(collection_id),
                collection_cursor: None,
            }),
        })
    }

    /// Fetch one batch of collection items.
    async fn fetch_batch(
        &self,
        cookie: &[u8],
    ) -> ConnectorResult<(Vec<CollectionItem>, Option<Vec<u8>>)> {
        let mut attributes = Vec::new();
        if !self.collection_id_attribute.eq_ignore_ascii_case("dn") {
            attributes.push(self.collection_id_attribute.to_string());
        }
        if let Some(name) = &self.entity.collection_attribute {
            attributes.push(name.clone());
        }
        if attributes.is_empty() {
            attributes.push("1.1".to_string());
        }

        let query = DirectoryQuery {
            base_dn: self.request.connection_params.base_dn.clone(),
            filter: self.parent.query.clone(),
            attributes,
            page_size: Some(i32::try_from(self.entity.member_of_group_batch_size).unwrap_or(i32::MAX)),
            cookie: cookie.to_vec(),
        };

        let page = self
            .client
            .search(self.target, query, self.timeout, ReleasePolicy::Retain)
            .await?;

        let items = page
            .entries
            .iter()
            .map(|entry| self.collection_item(entry))
            .collect::<ConnectorResult<Vec<_>>>()?;

        debug!(items = items.len(), more = page.next_cookie.is_some(), "Fetched collection batch");
        Ok((items, page.next_cookie))
    }

    fn collection_item(&self, entry: &SearchEntry) -> ConnectorResult<CollectionItem> {
        let id = attribute_string(entry, self.collection_id_attribute)?.ok_or_else(|| {
            ConnectorError::internal(format!(
                "collection item {} has no '{}' value",
                entry.dn, self.collection_id_attribute
            ))
        })?;
        let attribute = match &self.entity.collection_attribute {
            Some(name) => attribute_string(entry, name)?.unwrap_or_default(),
            None => String::new(),
        };
        Ok(CollectionItem { id, attribute })
    }

    /// Emit members of `item` from `offset` until the budget is spent or the
    /// membership attribute is exhausted.
    async fn drain(
        &mut self,
        item: &CollectionItem,
        mut offset: i64,
        mut ranged: bool,
    ) -> ConnectorResult<Drained> {
        let entity = self.entity;
        let member_attribute = entity.member_attribute.as_str();

        loop {
            if self.budget == 0 {
                return Ok(Drained::Partial { offset, ranged });
            }

            let requested = if ranged {
                format!("{member_attribute};range={offset}-*")
            } else {
                member_attribute.to_string()
            };
            let query = DirectoryQuery {
                base_dn: self.request.connection_params.base_dn.clone(),
                filter: substitute(&entity.query, item),
                attributes: vec![requested],
                page_size: None,
                cookie: Vec::new(),
            };

            let page = self
                .client
                .search(self.target, query, self.timeout, ReleasePolicy::OnCompletion)
                .await?;

            let Some(entry) = page.entries.first() else {
                warn!(collection_id = %item.id, "Member read returned no entry, skipping collection item");
                return Ok(Drained::Exhausted);
            };
            if page.entries.len() > 1 {
                warn!(
                    collection_id = %item.id,
                    entries = page.entries.len(),
                    "Member read matched several entries, using the first"
                );
            }

            let Some((values, chunk)) = member_values(entry, member_attribute) else {
                return Ok(Drained::Exhausted);
            };

            let skip = match chunk {
                Some(chunk) if offset < chunk.start => {
                    return Err(ConnectorError::internal(format!(
                        "range chunk starts at {} but offset {offset} was requested",
                        chunk.start
                    )));
                }
                Some(chunk) => offset - chunk.start,
                None => offset,
            };
            let available = values.get(skip as usize..).unwrap_or_default();
            let take = available.len().min(self.budget as usize);
            for value in &available[..take] {
                let row = self.member_row(value, item);
                self.objects.push(row);
            }
            let requested_offset = offset;
            offset += take as i64;
            self.budget -= take as i64;

            if take < available.len() {
                return Ok(Drained::Partial {
                    offset,
                    ranged: chunk.is_some(),
                });
            }

            match chunk {
                None | Some(RangeChunk { end: None, .. }) => return Ok(Drained::Exhausted),
                Some(RangeChunk { end: Some(end), .. }) => {
                    let next = end + 1;
                    if next <= requested_offset {
                        return Err(ConnectorError::internal(format!(
                            "range retrieval for {} did not advance past {requested_offset}",
                            item.id
                        )));
                    }
                    offset = next;
                    ranged = true;
                }
            }
        }
    }

    fn member_row(&self, value: &str, item: &CollectionItem) -> AttributeSet {
        AttributeSet::new()
            .with(self.member_id_attribute, value)
            .with(self.collection_id_attribute, item.id.as_str())
            .with("id", format!("{value}-{}", item.id))
    }
}

/// Fill the collection placeholders of a member query.
fn substitute(query: &str, item: &CollectionItem) -> String {
    query
        .replace(COLLECTION_ID_PLACEHOLDER, &escape_filter_value(&item.id))
        .replace(COLLECTION_ATTRIBUTE_PLACEHOLDER, &escape_filter_value(&item.attribute))
}

/// First value of `name` as a string; `dn` reads the entry's DN.
fn attribute_string(entry: &SearchEntry, name: &str) -> ConnectorResult<Option<String>> {
    if name.eq_ignore_ascii_case("dn") {
        return Ok(Some(entry.dn.clone()));
    }
    if let Some(syntax) = BinarySyntax::for_attribute(name) {
        let bytes = match values_ignore_case(&entry.bin_attrs, name) {
            Some(values) => values.first().cloned(),
            None => values_ignore_case(&entry.attrs, name)
                .and_then(|values| values.first())
                .map(|v| v.as_bytes().to_vec()),
        };
        return bytes.map(|b| decode_binary(name, syntax, &b)).transpose();
    }
    Ok(values_ignore_case(&entry.attrs, name).and_then(|values| values.first().cloned()))
}

/// Values of the membership attribute and its range chunk, if any.
///
/// A ranged key wins over a plain one.
fn member_values<'e>(
    entry: &'e SearchEntry,
    member_attribute: &str,
) -> Option<(&'e [String], Option<RangeChunk>)> {
    let mut plain = None;
    for (key, values) in &entry.attrs {
        let mut parts = key.split(';');
        let Some(base) = parts.next() else { continue };
        if !base.eq_ignore_ascii_case(member_attribute) {
            continue;
        }
        match parts.find_map(parse_range_option) {
            Some(chunk) => return Some((values.as_slice(), Some(chunk))),
            None => plain = Some((values.as_slice(), None)),
        }
    }
    plain
}

fn parse_range_option(option: &str) -> Option<RangeChunk> {
    let (name, range) = option.split_once('=')?;
    if !name.eq_ignore_ascii_case("range") {
        return None;
    }
    let (start, end) = range.split_once('-')?;
    let start = start.parse().ok()?;
    let end = match end {
        "*" => None,
        end => Some(end.parse().ok()?),
    };
    Some(RangeChunk { start, end })
}
