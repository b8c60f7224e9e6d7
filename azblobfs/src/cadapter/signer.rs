//! SharedKey request signing.
//!
//! The string-to-sign for the blob scheme is, newline separated:
//!
//! ```text
//! VERB
//! Content-Encoding
//! Content-Language
//! Content-Length
//! Content-MD5
//! Content-Type
//! Date
//! If-Modified-Since
//! If-Match
//! If-None-Match
//! If-Unmodified-Since
//! Range
//! CanonicalizedHeaders
//! CanonicalizedResource
//! ```
//!
//! The reduced table scheme keeps only VERB, Content-MD5, Content-Type, Date
//! and the canonicalized resource. Absent headers leave an empty line behind.

use std::collections::BTreeMap;
use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::{AUTHORIZATION, DATE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, Request, Url};
use sha2::Sha256;
use thiserror::Error;

pub const SERVICE_VERSION: &str = "2011-08-18";
pub const STORAGE_HEADER_PREFIX: &str = "x-ms-";

const X_MS_DATE: HeaderName = HeaderName::from_static("x-ms-date");
const X_MS_VERSION: HeaderName = HeaderName::from_static("x-ms-version");

type HmacSha256 = Hmac<Sha256>;

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("storage account name is empty")]
    EmptyAccount,

    #[error("account key is not valid base64: {0}")]
    InvalidKey(#[from] base64::DecodeError),
}

#[derive(Error, Debug)]
pub enum SignError {
    #[error("cannot encode header value: {0}")]
    HeaderValue(#[from] reqwest::header::InvalidHeaderValue),

    #[error("account key rejected by HMAC")]
    Key,
}

/// Account name plus the decoded shared key.
#[derive(Clone)]
pub struct Credential {
    account: String,
    key: Vec<u8>,
}

impl Credential {
    pub fn new(account: impl Into<String>, key_base64: &str) -> Result<Self, CredentialError> {
        let account = account.into();
        if account.is_empty() {
            return Err(CredentialError::EmptyAccount);
        }
        let key = B64.decode(key_base64.trim())?;
        Ok(Self { account, key })
    }

    pub fn account(&self) -> &str {
        &self.account
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("account", &self.account)
            .field("key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SigningScheme {
    #[default]
    Blob,
    Table,
}

#[derive(Debug, Clone)]
pub struct Signer {
    credential: Credential,
    scheme: SigningScheme,
}

impl Signer {
    pub fn new(credential: Credential) -> Self {
        Self {
            credential,
            scheme: SigningScheme::Blob,
        }
    }

    pub fn for_tables(credential: Credential) -> Self {
        Self {
            credential,
            scheme: SigningScheme::Table,
        }
    }

    pub fn account(&self) -> &str {
        self.credential.account()
    }

    /// Stamp the request with the current date and authorize it.
    pub fn sign(&self, req: &mut Request) -> Result<(), SignError> {
        let date = rfc1123(Utc::now());
        self.sign_at(req, &date)
    }

    /// Same as [`Signer::sign`] with a caller-provided RFC 1123 date.
    pub fn sign_at(&self, req: &mut Request, date: &str) -> Result<(), SignError> {
        let date_value = HeaderValue::from_str(date)?;
        let headers = req.headers_mut();
        headers.insert(X_MS_VERSION, HeaderValue::from_static(SERVICE_VERSION));
        headers.insert(X_MS_DATE, date_value.clone());
        if self.scheme == SigningScheme::Table {
            headers.insert(DATE, date_value);
        }

        let string_to_sign = self.string_to_sign(req.method(), req.url(), req.headers());
        let signature = self.signature(&string_to_sign)?;
        let auth = format!("SharedKey {}:{}", self.credential.account, signature);
        req.headers_mut()
            .insert(AUTHORIZATION, HeaderValue::from_str(&auth)?);
        Ok(())
    }

    pub fn string_to_sign(&self, method: &Method, url: &Url, headers: &HeaderMap) -> String {
        let header = |name: &str| header_str(headers, name);
        let mut lines: Vec<String> = vec![method.as_str().to_ascii_uppercase()];
        match self.scheme {
            SigningScheme::Blob => {
                for name in [
                    "content-encoding",
                    "content-language",
                    "content-length",
                    "content-md5",
                    "content-type",
                    "date",
                    "if-modified-since",
                    "if-match",
                    "if-none-match",
                    "if-unmodified-since",
                    "range",
                ] {
                    lines.push(header(name));
                }
                lines.push(canonicalized_headers(headers));
            }
            SigningScheme::Table => {
                for name in ["content-md5", "content-type", "date"] {
                    lines.push(header(name));
                }
            }
        }
        lines.push(canonicalized_resource(&self.credential.account, url));
        lines.join("\n")
    }

    /// base64(HMAC-SHA256(key, string_to_sign))
    pub fn signature(&self, string_to_sign: &str) -> Result<String, SignError> {
        let mut mac =
            HmacSha256::new_from_slice(&self.credential.key).map_err(|_| SignError::Key)?;
        mac.update(string_to_sign.as_bytes());
        Ok(B64.encode(mac.finalize().into_bytes()))
    }
}

/// `/<account><path>` followed by `\nname:v1,v2` per query parameter, sorted by
/// name with each value list sorted.
pub fn canonicalized_resource(account: &str, url: &Url) -> String {
    let mut resource = format!("/{}{}", account, url.path());
    let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in url.query_pairs() {
        params
            .entry(name.into_owned())
            .or_default()
            .push(value.into_owned());
    }
    for (name, mut values) in params {
        values.sort();
        resource.push('\n');
        resource.push_str(&name);
        resource.push(':');
        resource.push_str(&values.join(","));
    }
    resource
}

/// All `x-ms-*` headers as `name:trimmed-value`, sorted by lower-cased name.
pub fn canonicalized_headers(headers: &HeaderMap) -> String {
    let mut entries: Vec<(String, String)> = headers
        .keys()
        .filter_map(|name| {
            let lower = name.as_str().to_ascii_lowercase();
            if !lower.starts_with(STORAGE_HEADER_PREFIX) {
                return None;
            }
            let value = header_str(headers, name.as_str());
            Some((lower, value.trim().to_string()))
        })
        .collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries
        .iter()
        .map(|(name, value)| format!("{name}:{value}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// RFC 1123 date as required by `x-ms-date`.
pub fn rfc1123(time: DateTime<Utc>) -> String {
    time.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn header_str(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .unwrap_or_default()
}
