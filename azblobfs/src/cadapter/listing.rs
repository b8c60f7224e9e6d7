//! List-response parsing and marker-based pagination.
//!
//! Fields of a `<Container>` or `<Blob>` record are picked up at any depth
//! below the record element, so the flat layout of older service versions and
//! the `<Properties>`-nested layout parse the same way. Only the first
//! occurrence of a field inside a record counts.

use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, TryStreamExt};
use xmlparser::{ElementEnd, Token, Tokenizer};

use super::client::{BlobBackend, BlobEntry, BlobPage, ContainerEntry, StorageError, StorageResult};

#[derive(Debug, Default)]
struct Fields {
    name: Option<String>,
    etag: Option<String>,
    last_modified: Option<String>,
    content_length: Option<String>,
}

impl Fields {
    fn set(&mut self, element: &str, value: String) {
        let slot = match element {
            "Name" => &mut self.name,
            "Etag" => &mut self.etag,
            "Last-Modified" => &mut self.last_modified,
            "Content-Length" => &mut self.content_length,
            _ => return,
        };
        if slot.is_none() {
            *slot = Some(value);
        }
    }

    fn name(&mut self) -> StorageResult<String> {
        self.name.take().ok_or_else(|| malformed("record without Name"))
    }

    fn last_modified(&self) -> StorageResult<SystemTime> {
        let raw = self
            .last_modified
            .as_deref()
            .ok_or_else(|| malformed("record without Last-Modified"))?;
        parse_http_date(raw).ok_or_else(|| malformed(format!("bad Last-Modified {raw:?}")))
    }
}

struct Listing {
    records: Vec<Fields>,
    next_marker: Option<String>,
}

fn malformed(msg: impl std::fmt::Display) -> StorageError {
    StorageError::transient(format!("malformed listing: {msg}"))
}

/// Parse an RFC 1123 date such as `Sun, 11 Oct 2009 21:49:13 GMT`.
pub fn parse_http_date(raw: &str) -> Option<SystemTime> {
    DateTime::parse_from_rfc2822(raw.trim())
        .ok()
        .map(|dt| SystemTime::from(dt.with_timezone(&Utc)))
}

fn walk(xml: &str, record: &str) -> StorageResult<Listing> {
    let xml = xml.strip_prefix('\u{feff}').unwrap_or(xml);
    let mut stack: Vec<String> = Vec::new();
    let mut text = String::new();
    let mut current: Option<(usize, Fields)> = None;
    let mut listing = Listing {
        records: Vec::new(),
        next_marker: None,
    };

    for token in Tokenizer::from(xml) {
        match token.map_err(malformed)? {
            Token::ElementStart { local, .. } => {
                stack.push(local.as_str().to_string());
                text.clear();
                if current.is_none() && local.as_str() == record {
                    current = Some((stack.len(), Fields::default()));
                }
            }
            Token::Text { text: t } => text.push_str(&unescape(t.as_str())),
            Token::Cdata { text: t, .. } => text.push_str(t.as_str()),
            Token::ElementEnd { end, .. } => {
                let closing = match end {
                    ElementEnd::Open => continue,
                    ElementEnd::Empty => None,
                    ElementEnd::Close(_, local) => Some(local.as_str()),
                };
                let depth = stack.len();
                let element = stack.pop().ok_or_else(|| malformed("unbalanced end tag"))?;
                if closing.is_some_and(|name| name != element) {
                    return Err(malformed(format!("</{}> closes <{element}>", closing.unwrap_or_default())));
                }
                let value = std::mem::take(&mut text);

                match current.as_ref().map(|(d, _)| *d) {
                    Some(record_depth) if depth > record_depth => {
                        if let Some((_, fields)) = current.as_mut() {
                            fields.set(&element, value);
                        }
                    }
                    Some(record_depth) if depth == record_depth => {
                        if let Some((_, fields)) = current.take() {
                            listing.records.push(fields);
                        }
                    }
                    _ => {
                        if depth == 2 && element == "NextMarker" && !value.trim().is_empty() {
                            listing.next_marker = Some(value);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(malformed(format!("unclosed <{}>", stack.join("><"))));
    }
    Ok(listing)
}

pub fn parse_container_list(xml: &str) -> StorageResult<Vec<ContainerEntry>> {
    walk(xml, "Container")?
        .records
        .into_iter()
        .map(|mut fields| {
            Ok(ContainerEntry {
                name: fields.name()?,
                last_modified: fields.last_modified()?,
                etag: fields.etag.take(),
            })
        })
        .collect()
}

pub fn parse_blob_list(xml: &str) -> StorageResult<BlobPage> {
    let listing = walk(xml, "Blob")?;
    let blobs = listing
        .records
        .into_iter()
        .map(|mut fields| {
            let name = fields.name()?;
            let raw_size = fields
                .content_length
                .as_deref()
                .ok_or_else(|| malformed(format!("blob {name:?} without Content-Length")))?;
            let size = raw_size
                .trim()
                .parse::<u64>()
                .map_err(|_| malformed(format!("bad Content-Length {raw_size:?}")))?;
            Ok(BlobEntry {
                last_modified: fields.last_modified()?,
                etag: fields.etag.take(),
                name,
                size,
            })
        })
        .collect::<StorageResult<Vec<_>>>()?;
    Ok(BlobPage {
        blobs,
        next_marker: listing.next_marker,
    })
}

/// Decode the five predefined XML entities and numeric character references.
/// Unknown references are kept verbatim.
fn unescape(raw: &str) -> String {
    if !raw.contains('&') {
        return raw.to_string();
    }
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let after = &rest[amp..];
        let decoded = after.find(';').and_then(|semi| {
            let entity = &after[1..semi];
            let ch = match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                _ => entity
                    .strip_prefix("#x")
                    .or_else(|| entity.strip_prefix("#X"))
                    .map(|hex| u32::from_str_radix(hex, 16))
                    .or_else(|| entity.strip_prefix('#').map(str::parse::<u32>))
                    .and_then(Result::ok)
                    .and_then(char::from_u32),
            };
            ch.map(|c| (c, semi))
        });
        match decoded {
            Some((c, semi)) => {
                out.push(c);
                rest = &after[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &after[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Finite, non-restartable producer over a container's blob listing.
///
/// Each `next_page` issues one listing call; the pager stops once the service
/// returns no (or an empty) `NextMarker`, or after the first error.
pub struct BlobPager<B: ?Sized> {
    backend: Arc<B>,
    container: String,
    prefix: Option<String>,
    marker: Option<String>,
    done: bool,
}

impl<B: BlobBackend + ?Sized> BlobPager<B> {
    pub fn new(backend: Arc<B>, container: impl Into<String>, prefix: Option<String>) -> Self {
        Self {
            backend,
            container: container.into(),
            prefix,
            marker: None,
            done: false,
        }
    }

    pub async fn next_page(&mut self) -> StorageResult<Option<Vec<BlobEntry>>> {
        if self.done {
            return Ok(None);
        }
        self.done = true;
        let page = self
            .backend
            .list_blobs_page(
                &self.container,
                self.prefix.as_deref(),
                self.marker.as_deref(),
            )
            .await?;
        if let Some(marker) = page.next_marker.filter(|m| !m.is_empty()) {
            self.marker = Some(marker);
            self.done = false;
        }
        Ok(Some(page.blobs))
    }

    /// Lazily yield every blob; pages are fetched on demand.
    pub fn into_stream(self) -> impl Stream<Item = StorageResult<BlobEntry>> {
        stream::try_unfold(self, |mut pager| async move {
            let page = pager.next_page().await?;
            Ok::<_, StorageError>(page.map(|blobs| {
                let items = stream::iter(blobs.into_iter().map(Ok::<_, StorageError>));
                (items, pager)
            }))
        })
        .try_flatten()
    }

    pub async fn collect_all(mut self) -> StorageResult<Vec<BlobEntry>> {
        let mut all = Vec::new();
        while let Some(page) = self.next_page().await? {
            all.extend(page);
        }
        Ok(all)
    }
}
