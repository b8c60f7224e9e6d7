//! Blob service client over reqwest with SharedKey signing.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use bytes::Bytes;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Client, Method, Request, Response, StatusCode, Url};
use tracing::{debug, warn};

use super::client::{
    BlobBackend, BlobPage, BlobWithMetadata, ContainerAccess, ContainerEntry, PutBlobOptions,
    StorageError, StorageResult, check_block_size, check_upload_size,
};
use super::listing::{BlobPager, parse_blob_list, parse_container_list};
use super::signer::Signer;

/// Characters left as-is in a blob URL path segment.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

const META_PREFIX: &str = "x-ms-meta-";

/// Where the account's blob service lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    host: String,
    https: bool,
    path_style: bool,
}

impl Endpoint {
    /// Path-style addressing is used when forced, or when `host` is a bare
    /// address (`localhost` or IPv4, with an optional port).
    pub fn new(host: impl Into<String>, https: bool, force_path_style: bool) -> Self {
        let host = host.into();
        let path_style = force_path_style || is_bare_address(&host);
        Self {
            host,
            https,
            path_style,
        }
    }

    pub fn is_path_style(&self) -> bool {
        self.path_style
    }

    /// `scheme://<account>.<host>` or `scheme://<host>/<account>`.
    pub fn base_url(&self, account: &str) -> String {
        let scheme = if self.https { "https" } else { "http" };
        if self.path_style {
            format!("{scheme}://{}/{account}", self.host)
        } else {
            format!("{scheme}://{account}.{}", self.host)
        }
    }
}

pub fn is_bare_address(host: &str) -> bool {
    let name = match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            name
        }
        _ => host,
    };
    name == "localhost" || name.parse::<Ipv4Addr>().is_ok()
}

fn md5_base64(data: &[u8]) -> String {
    let sum = md5::compute(data);
    B64.encode(sum.0)
}

pub struct AzureBlobBackend {
    client: Client,
    signer: Signer,
    base_url: String,
}

impl AzureBlobBackend {
    pub fn new(signer: Signer, endpoint: &Endpoint, timeout: Duration) -> reqwest::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        let base_url = endpoint.base_url(signer.account());
        Ok(Self {
            client,
            signer,
            base_url,
        })
    }

    /// Pager over every blob of `container`, optionally filtered by prefix.
    pub fn list_blobs(
        backend: Arc<Self>,
        container: &str,
        prefix: Option<String>,
    ) -> BlobPager<Self> {
        BlobPager::new(backend, container, prefix)
    }

    fn url(&self, container: Option<&str>, blob: Option<&str>, query: &[(&str, &str)]) -> StorageResult<Url> {
        let mut raw = self.base_url.clone();
        raw.push('/');
        if let Some(container) = container {
            raw.extend(utf8_percent_encode(container, PATH_SEGMENT));
        }
        if let Some(blob) = blob {
            raw.push('/');
            raw.extend(utf8_percent_encode(blob, PATH_SEGMENT));
        }
        let mut url = Url::parse(&raw)
            .map_err(|e| StorageError::transient(format!("invalid url {raw}: {e}")))?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        self.client.request(method, url)
    }

    /// Sign and dispatch. Non-2xx statuses become errors; 409 maps to
    /// `AlreadyExists` only when `conflict_is_exists` is set.
    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
        conflict_is_exists: bool,
    ) -> StorageResult<Response> {
        let mut req: Request = builder
            .build()
            .map_err(|e| StorageError::transient(format!("cannot build request: {e}")))?;
        self.signer
            .sign(&mut req)
            .map_err(|e| StorageError::transient(format!("cannot sign request: {e}")))?;

        let method = req.method().clone();
        let url = req.url().clone();
        debug!(%method, %url, "dispatching storage request");

        let resp = self.client.execute(req).await.map_err(|e| {
            warn!(%method, %url, error = %e, "storage request failed");
            StorageError::transient(e.to_string())
        })?;
        let status = resp.status();
        debug!(%method, %url, %status, "storage response");
        if status.is_success() {
            return Ok(resp);
        }

        let err = match status {
            StatusCode::NOT_FOUND => StorageError::NotFound,
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StorageError::Denied,
            StatusCode::CONFLICT if conflict_is_exists => StorageError::AlreadyExists,
            _ => {
                let body = resp.text().await.unwrap_or_default();
                StorageError::transient(format!("{method} {url} returned {status}: {body}"))
            }
        };
        Err(err)
    }

    async fn body_text(resp: Response) -> StorageResult<String> {
        resp.text()
            .await
            .map_err(|e| StorageError::transient(format!("reading response body: {e}")))
    }
}

#[async_trait]
impl BlobBackend for AzureBlobBackend {
    async fn list_containers(&self) -> StorageResult<Vec<ContainerEntry>> {
        let url = self.url(None, None, &[("comp", "list")])?;
        let resp = self.send(self.request(Method::GET, url), false).await?;
        parse_container_list(&Self::body_text(resp).await?)
    }

    async fn list_blobs_page(
        &self,
        container: &str,
        prefix: Option<&str>,
        marker: Option<&str>,
    ) -> StorageResult<BlobPage> {
        let mut query = vec![("restype", "container"), ("comp", "list")];
        if let Some(prefix) = prefix {
            query.push(("prefix", prefix));
        }
        if let Some(marker) = marker {
            query.push(("marker", marker));
        }
        let url = self.url(Some(container), None, &query)?;
        let resp = self.send(self.request(Method::GET, url), false).await?;
        let page = parse_blob_list(&Self::body_text(resp).await?)?;
        debug!(
            container,
            blobs = page.blobs.len(),
            more = page.next_marker.is_some(),
            "listed blob page"
        );
        Ok(page)
    }

    async fn create_container(&self, name: &str, access: ContainerAccess) -> StorageResult<()> {
        let url = self.url(Some(name), None, &[("restype", "container")])?;
        let mut builder = self
            .request(Method::PUT, url)
            .header(CONTENT_LENGTH, "0");
        if access == ContainerAccess::Public {
            builder = builder.header("x-ms-prop-publicaccess", "true");
        }
        self.send(builder, true).await.map(|_| ())
    }

    async fn delete_container(&self, name: &str) -> StorageResult<()> {
        let url = self.url(Some(name), None, &[("restype", "container")])?;
        self.send(self.request(Method::DELETE, url), false)
            .await
            .map(|_| ())
    }

    async fn get_blob(&self, container: &str, name: &str) -> StorageResult<Bytes> {
        let url = self.url(Some(container), Some(name), &[])?;
        let resp = self.send(self.request(Method::GET, url), false).await?;
        resp.bytes()
            .await
            .map_err(|e| StorageError::transient(format!("reading blob body: {e}")))
    }

    async fn get_blob_with_metadata(
        &self,
        container: &str,
        name: &str,
    ) -> StorageResult<BlobWithMetadata> {
        let url = self.url(Some(container), Some(name), &[])?;
        let resp = self.send(self.request(Method::GET, url), false).await?;
        let metadata = resp
            .headers()
            .iter()
            .filter_map(|(key, value)| {
                let key = key.as_str().strip_prefix(META_PREFIX)?;
                let value = value.to_str().ok()?;
                Some((key.to_string(), value.to_string()))
            })
            .collect();
        let data = resp
            .bytes()
            .await
            .map_err(|e| StorageError::transient(format!("reading blob body: {e}")))?;
        Ok(BlobWithMetadata { data, metadata })
    }

    async fn put_blob(
        &self,
        container: &str,
        name: &str,
        data: Bytes,
        options: &PutBlobOptions,
    ) -> StorageResult<()> {
        check_upload_size(data.len())?;
        let url = self.url(Some(container), Some(name), &[])?;
        let mut builder = self
            .request(Method::PUT, url)
            .header("x-ms-blob-type", "BlockBlob")
            .header(CONTENT_LENGTH, data.len().to_string())
            .header(CONTENT_TYPE, options.content_type.as_str())
            .header("content-md5", md5_base64(&data));
        for (key, value) in &options.metadata {
            builder = builder.header(format!("{META_PREFIX}{key}"), value.as_str());
        }
        self.send(builder.body(data), false).await.map(|_| ())
    }

    async fn put_block(
        &self,
        container: &str,
        name: &str,
        block_id: &str,
        data: Bytes,
    ) -> StorageResult<()> {
        check_block_size(data.len())?;
        let url = self.url(
            Some(container),
            Some(name),
            &[("comp", "block"), ("blockid", block_id)],
        )?;
        let builder = self
            .request(Method::PUT, url)
            .header(CONTENT_LENGTH, data.len().to_string())
            .header("content-md5", md5_base64(&data));
        self.send(builder.body(data), false).await.map(|_| ())
    }

    async fn delete_blob(&self, container: &str, name: &str) -> StorageResult<()> {
        let url = self.url(Some(container), Some(name), &[])?;
        self.send(self.request(Method::DELETE, url), false)
            .await
            .map(|_| ())
    }

    async fn blob_exists(&self, container: &str, name: &str) -> StorageResult<bool> {
        let url = self.url(Some(container), Some(name), &[])?;
        match self.send(self.request(Method::HEAD, url), false).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
