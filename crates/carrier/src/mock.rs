//! In-process mock transport.
//!
//! A [`MockEngine`] serves scripted responses from a route table instead of
//! touching the network, while still exercising the orchestrator's full
//! pipeline: bodies arrive as chunked streams, uploads report progress, and
//! call counts are recorded per route for assertions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{Bytes, BytesMut};
use tokio::sync::oneshot;

use crate::engine::{Engine, UploadTransfer};
use crate::error::{Error, Result};
use crate::headers::Headers;
use crate::request::{
    DownloadRequest, HttpMethod, RequestMetadata, UploadPayload, UploadRequest,
};
use crate::response::ResponseHeader;
use crate::stream::{BodyStream, ProgressStream, StreamProducer};

/// A scripted response.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Bytes,
}

impl MockResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }
}

type RouteKey = (HttpMethod, String);
type Responder = Box<dyn Fn(&RequestMetadata, Option<Bytes>) -> MockResponse + Send + Sync>;

struct MockState {
    routes: Mutex<HashMap<RouteKey, Responder>>,
    calls: Mutex<HashMap<RouteKey, usize>>,
    total: AtomicUsize,
}

impl MockState {
    fn respond(&self, metadata: &RequestMetadata, payload: Option<Bytes>) -> MockResponse {
        let key = (metadata.method.clone(), metadata.url.clone());
        *lock(&self.calls).entry(key.clone()).or_insert(0) += 1;
        self.total.fetch_add(1, Ordering::SeqCst);

        match lock(&self.routes).get(&key) {
            Some(responder) => responder(metadata, payload),
            None => MockResponse::new(404),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A network-free [`Engine`] serving a route table. Cloning yields another
/// handle onto the same routes and counters, so tests can keep one while the
/// client owns the other.
#[derive(Clone)]
pub struct MockEngine {
    state: Arc<MockState>,
    chunk_size: usize,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            state: Arc::new(MockState {
                routes: Mutex::new(HashMap::new()),
                calls: Mutex::new(HashMap::new()),
                total: AtomicUsize::new(0),
            }),
            chunk_size: 1024,
        }
    }

    /// Serve bodies in chunks of this many bytes. Small sizes exercise the
    /// streaming path harder.
    #[must_use]
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Serve `response` for every request matching `method` and `url`.
    pub fn route(&self, method: HttpMethod, url: impl Into<String>, response: MockResponse) {
        self.route_fn(method, url, move |_, _| response.clone());
    }

    /// Serve computed responses: the responder sees the request metadata and
    /// the request payload, if one was sent.
    pub fn route_fn(
        &self,
        method: HttpMethod,
        url: impl Into<String>,
        responder: impl Fn(&RequestMetadata, Option<Bytes>) -> MockResponse + Send + Sync + 'static,
    ) {
        lock(&self.state.routes).insert((method, url.into()), Box::new(responder));
    }

    /// How many requests matched this route so far.
    pub fn calls(&self, method: HttpMethod, url: &str) -> usize {
        lock(&self.state.calls)
            .get(&(method, url.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.state.total.load(Ordering::SeqCst)
    }

    fn stream_body(&self, body: Bytes) -> BodyStream {
        let (producer, stream) = BodyStream::channel(Error::RequestCancelled);
        let chunk_size = self.chunk_size;
        tokio::spawn(async move {
            for chunk in split_chunks(body, chunk_size) {
                if producer.send(chunk).await.is_err() {
                    return;
                }
                tokio::task::yield_now().await;
            }
            let _ = producer.finish();
        });
        stream
    }
}

impl Engine for MockEngine {
    const NAME: &'static str = "mock";

    type Error = Error;

    async fn fetch(
        &self,
        request: &DownloadRequest,
    ) -> Result<(ResponseHeader, BodyStream), Self::Error> {
        let response = self
            .state
            .respond(&request.metadata, request.payload.clone());
        let header = ResponseHeader::new(
            response.status,
            Some(request.metadata.url.clone()),
            response.headers,
        );
        Ok((header, self.stream_body(response.body)))
    }

    async fn upload(
        &self,
        request: &UploadRequest,
        payload: UploadPayload,
    ) -> Result<UploadTransfer, Self::Error> {
        let (progress_tx, progress) = ProgressStream::channel(Error::RequestCancelled);
        let (response_tx, response) = oneshot::channel();
        let (body_tx, body) = BodyStream::channel(Error::RequestCancelled);

        let state = Arc::clone(&self.state);
        let metadata = request.metadata.clone();
        let chunk_size = self.chunk_size;
        tokio::spawn(async move {
            let sent = match drain_payload(payload, chunk_size, &progress_tx).await {
                Ok(sent) => sent,
                Err(error) => {
                    let _ = progress_tx.finish_err(error.clone());
                    let _ = response_tx.send(Err(error));
                    let _ = body_tx.finish();
                    return;
                }
            };
            let _ = progress_tx.finish();

            let mock = state.respond(&metadata, Some(sent));
            let header =
                ResponseHeader::new(mock.status, Some(metadata.url.clone()), mock.headers);
            let _ = response_tx.send(Ok(header));

            for chunk in split_chunks(mock.body, chunk_size) {
                if body_tx.send(chunk).await.is_err() {
                    return;
                }
                tokio::task::yield_now().await;
            }
            let _ = body_tx.finish();
        });

        Ok(UploadTransfer {
            progress,
            response,
            body,
        })
    }

    fn is_cancellation_error(error: &Self::Error) -> bool {
        matches!(error, Error::RequestCancelled)
    }

    fn is_timeout_error(error: &Self::Error) -> bool {
        matches!(error, Error::RequestTimedOut)
    }

    async fn shutdown(&self) {}
}

/// Consume an upload payload, reporting cumulative progress per chunk, and
/// return what was sent so responders can inspect it.
async fn drain_payload(
    payload: UploadPayload,
    chunk_size: usize,
    progress: &StreamProducer<u64>,
) -> Result<Bytes> {
    let bytes = match payload {
        UploadPayload::Bytes(bytes) => bytes,
        UploadPayload::File(path) => Bytes::from(tokio::fs::read(path).await?),
        UploadPayload::Provider(provider) => {
            let mut stream = provider();
            let mut collected = BytesMut::new();
            while let Some(chunk) = stream.next().await {
                collected.extend_from_slice(&chunk?);
                let _ = progress.push(collected.len() as u64);
            }
            return Ok(collected.freeze());
        }
    };
    let mut sent: u64 = 0;
    for chunk in split_chunks(bytes.clone(), chunk_size) {
        sent += chunk.len() as u64;
        let _ = progress.push(sent);
        tokio::task::yield_now().await;
    }
    Ok(bytes)
}

fn split_chunks(body: Bytes, size: usize) -> impl Iterator<Item = Bytes> {
    let mut remaining = body;
    let size = size.max(1);
    std::iter::from_fn(move || {
        if remaining.is_empty() {
            return None;
        }
        let take = remaining.len().min(size);
        Some(remaining.split_to(take))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn routed_responses_stream_back() {
        let engine = MockEngine::new().chunk_size(2);
        engine.route(
            HttpMethod::Get,
            "https://unit.test/data",
            MockResponse::new(200).body("abcdef"),
        );

        let request = DownloadRequest::get("https://unit.test/data");
        let (header, mut body) = engine.fetch(&request).await.unwrap();
        assert_eq!(header.status, 200);

        let mut collected = BytesMut::new();
        while let Some(chunk) = body.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected.freeze(), Bytes::from_static(b"abcdef"));
        assert_eq!(engine.calls(HttpMethod::Get, "https://unit.test/data"), 1);
    }

    #[tokio::test]
    async fn unrouted_requests_get_404() {
        let engine = MockEngine::new();
        let request = DownloadRequest::get("https://unit.test/missing");
        let (header, _body) = engine.fetch(&request).await.unwrap();
        assert_eq!(header.status, 404);
        assert_eq!(engine.total_calls(), 1);
    }

    #[tokio::test]
    async fn uploads_report_progress_and_expose_the_payload() {
        let engine = MockEngine::new().chunk_size(4);
        engine.route_fn(
            HttpMethod::Put,
            "https://unit.test/up",
            |_, payload| MockResponse::new(200).body(payload.unwrap_or_default()),
        );

        let request = UploadRequest::put("https://unit.test/up");
        let payload = UploadPayload::Bytes(Bytes::from_static(b"0123456789"));
        let transfer = engine.upload(&request, payload).await.unwrap();

        let mut progress = transfer.progress;
        let mut reports = Vec::new();
        while let Some(sent) = progress.next().await {
            reports.push(sent.unwrap());
        }
        assert_eq!(reports, vec![4, 8, 10]);

        let header = transfer.response.await.unwrap().unwrap();
        assert_eq!(header.status, 200);

        let mut body = transfer.body;
        let mut echoed = BytesMut::new();
        while let Some(chunk) = body.next().await {
            echoed.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(echoed.freeze(), Bytes::from_static(b"0123456789"));
    }
}
