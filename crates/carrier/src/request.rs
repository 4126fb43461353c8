//! Request data model.
//!
//! Requests come in two flavors sharing [`RequestMetadata`]: a
//! [`DownloadRequest`] optionally carrying a small in-memory payload, and an
//! [`UploadRequest`] whose (potentially large) payload travels separately as
//! an [`UploadPayload`]. Both are plain values; cloning is cheap.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::headers::{self, Headers};
use crate::stream::BodyStream;

/// HTTP request method.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
    Other(String),
}

impl HttpMethod {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Patch => "PATCH",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
            Self::Other(method) => method,
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for HttpMethod {
    fn from(value: &str) -> Self {
        match value.to_ascii_uppercase().as_str() {
            "GET" => Self::Get,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "DELETE" => Self::Delete,
            "PATCH" => Self::Patch,
            "HEAD" => Self::Head,
            "OPTIONS" => Self::Options,
            other => Self::Other(other.to_string()),
        }
    }
}

/// The set of response status codes a request considers successful.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseCodes(BTreeSet<u16>);

impl Default for ResponseCodes {
    /// Just `200`.
    fn default() -> Self {
        Self(BTreeSet::from([200]))
    }
}

impl ResponseCodes {
    pub fn contains(&self, status: u16) -> bool {
        self.0.contains(&status)
    }

    pub fn insert(&mut self, status: u16) {
        self.0.insert(status);
    }

    /// Every code in `range`, e.g. `200..=299`.
    pub fn range(range: std::ops::RangeInclusive<u16>) -> Self {
        Self(range.collect())
    }
}

impl From<u16> for ResponseCodes {
    fn from(status: u16) -> Self {
        Self(BTreeSet::from([status]))
    }
}

impl<const LEN: usize> From<[u16; LEN]> for ResponseCodes {
    fn from(codes: [u16; LEN]) -> Self {
        Self(codes.into_iter().collect())
    }
}

impl FromIterator<u16> for ResponseCodes {
    fn from_iter<I: IntoIterator<Item = u16>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A typed extension value attached to a request for backend-specific fields.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtensionValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Bytes),
}

/// Metadata common to download and upload requests.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestMetadata {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Headers,
    pub expected_statuses: ResponseCodes,
    /// Per-request timeout, applied to awaiting the response header and to
    /// inactivity between body chunks.
    pub timeout: Duration,
    extensions: BTreeMap<String, ExtensionValue>,
}

impl RequestMetadata {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Headers::new(),
            expected_statuses: ResponseCodes::default(),
            timeout: Self::DEFAULT_TIMEOUT,
            extensions: BTreeMap::new(),
        }
    }

    /// Append a header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn expected_statuses(mut self, codes: impl Into<ResponseCodes>) -> Self {
        self.expected_statuses = codes.into();
        self
    }

    /// The `X-Request-ID` header, conventionally kept stable across retries of
    /// the same logical request so servers can correlate attempts.
    pub fn request_id(&self) -> Option<&str> {
        self.headers.get(headers::name::X_REQUEST_ID)
    }

    pub fn set_request_id(&mut self, id: Option<&str>) {
        match id {
            Some(id) => self.headers.set(headers::name::X_REQUEST_ID, id),
            None => self.headers.remove(headers::name::X_REQUEST_ID),
        }
    }

    /// Attach a backend-specific extension value.
    pub fn extension_store(&mut self, key: impl Into<String>, value: ExtensionValue) {
        self.extensions.insert(key.into(), value);
    }

    pub fn extension(&self, key: &str) -> Option<&ExtensionValue> {
        self.extensions.get(key)
    }
}

/// A request whose payload, if any, is a small in-memory blob.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadRequest {
    pub metadata: RequestMetadata,
    pub payload: Option<Bytes>,
}

impl DownloadRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            metadata: RequestMetadata::new(method, url),
            payload: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    pub fn post(url: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            metadata: RequestMetadata::new(HttpMethod::Post, url),
            payload: Some(payload.into()),
        }
    }

    #[must_use]
    pub fn payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = Some(payload.into());
        self
    }
}

impl From<DownloadRequest> for Request {
    fn from(request: DownloadRequest) -> Self {
        Self::Download(request)
    }
}

/// A request intended for sending larger amounts of data; its payload travels
/// separately as an [`UploadPayload`].
#[derive(Debug, Clone, PartialEq)]
pub struct UploadRequest {
    pub metadata: RequestMetadata,
}

impl UploadRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            metadata: RequestMetadata::new(method, url),
        }
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Put, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, url)
    }
}

/// A producer of upload body streams, callable once per attempt so retries
/// can restart the payload from the beginning.
pub type StreamProvider = Arc<dyn Fn() -> BodyStream + Send + Sync>;

/// The payload source for an upload.
#[derive(Clone)]
pub enum UploadPayload {
    /// An in-memory payload.
    Bytes(Bytes),
    /// A local file, streamed from disk.
    File(PathBuf),
    /// A caller-supplied stream factory.
    Provider(StreamProvider),
}

impl UploadPayload {
    /// The payload length, when knowable without I/O.
    pub fn len_hint(&self) -> Option<u64> {
        match self {
            Self::Bytes(bytes) => Some(bytes.len() as u64),
            Self::File(_) | Self::Provider(_) => None,
        }
    }
}

impl fmt::Debug for UploadPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
            Self::Provider(_) => f.write_str("Provider(..)"),
        }
    }
}

impl PartialEq for UploadPayload {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::File(a), Self::File(b)) => a == b,
            (Self::Provider(a), Self::Provider(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<Bytes> for UploadPayload {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<PathBuf> for UploadPayload {
    fn from(path: PathBuf) -> Self {
        Self::File(path)
    }
}

/// Either flavor of request, as handled by the orchestrator and mutated by
/// the retry loop.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Download(DownloadRequest),
    Upload(UploadRequest, UploadPayload),
}

impl Request {
    pub fn metadata(&self) -> &RequestMetadata {
        match self {
            Self::Download(request) => &request.metadata,
            Self::Upload(request, _) => &request.metadata,
        }
    }

    pub fn metadata_mut(&mut self) -> &mut RequestMetadata {
        match self {
            Self::Download(request) => &mut request.metadata,
            Self::Upload(request, _) => &mut request.metadata,
        }
    }

    pub fn url(&self) -> &str {
        &self.metadata().url
    }
}
