//! Transfer orchestration.
//!
//! A [`TransferClient`] drives an [`Engine`] through the full lifecycle of a
//! transfer: cache lookup, the engine call with its timeout, cancellation
//! wiring, status validation, progress reporting, the retry loop, and cache
//! population. The client holds no per-transfer state, so one instance serves
//! any number of concurrent transfers.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::cache::{CacheConfig, CacheEntry, CachePolicy, ResponseCache};
use crate::delegate::TransferDelegate;
use crate::engine::{Engine, UploadTransfer, classifier_for};
use crate::error::{Classifier, ClassifierRegistry, ERROR_BODY_CAP, Error, Result};
use crate::request::{Request, UploadPayload, UploadRequest};
use crate::response::ResponseHeader;
use crate::retry::{DefaultResponse, RetryDecision, RetryHandler};
use crate::stream::{BodyStream, ProgressStream, Termination};
use crate::token::CancellationToken;

/// Downloaded files at or below this size are also written into the response
/// cache; larger files are left on disk only.
pub const FILE_CACHE_LIMIT: u64 = 100 * 1024 * 1024;

/// Per-transfer options: caching, observation, cancellation, and retry.
#[derive(Clone, Default)]
pub struct TransferOptions {
    pub cache: CachePolicy,
    pub delegate: Option<Arc<dyn TransferDelegate>>,
    pub token: Option<Arc<CancellationToken>>,
    pub on_error: Option<Arc<RetryHandler>>,
}

impl TransferOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn cache(mut self, policy: CachePolicy) -> Self {
        self.cache = policy;
        self
    }

    #[must_use]
    pub fn delegate(mut self, delegate: Arc<dyn TransferDelegate>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    #[must_use]
    pub fn token(mut self, token: Arc<CancellationToken>) -> Self {
        self.token = Some(token);
        self
    }

    /// Install a retry handler consulted after every failed attempt.
    #[must_use]
    pub fn on_error(
        mut self,
        handler: impl Fn(&Request, u32, &Error) -> RetryDecision + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(handler));
        self
    }
}

/// Steers [`TransferClient::poll`] after each completed transfer.
pub enum PollContinuation<T> {
    /// Issue another transfer, optionally different, after `delay`.
    Continue { request: Request, delay: Duration },
    /// Stop polling and resolve with this result.
    Finish(Result<T>),
}

/// What the retry loop resolved to: the operation's own output, or a default
/// value a retry handler substituted for a failure.
enum AttemptOutcome<T> {
    Completed(T),
    Substituted { header: ResponseHeader, body: Bytes },
}

/// The transfer orchestrator over a transport engine.
pub struct TransferClient<E: Engine> {
    engine: Arc<E>,
    cache: Arc<ResponseCache>,
    classifiers: ClassifierRegistry,
}

/// Builder for a [`TransferClient`].
pub struct TransferClientBuilder<E: Engine> {
    engine: E,
    cache: Option<Arc<ResponseCache>>,
    cache_config: CacheConfig,
    extra_classifiers: Vec<Classifier>,
}

impl<E: Engine> TransferClientBuilder<E> {
    /// Configure the cache this client will create and own.
    #[must_use]
    pub fn cache_config(mut self, config: CacheConfig) -> Self {
        self.cache_config = config;
        self
    }

    /// Share an existing cache instead of creating one.
    #[must_use]
    pub fn shared_cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Register an additional backend classifier, for errors surfaced by
    /// delegates or stream providers backed by another transport.
    #[must_use]
    pub fn classifier(mut self, classifier: Classifier) -> Self {
        self.extra_classifiers.push(classifier);
        self
    }

    pub fn build(self) -> TransferClient<E> {
        let mut classifiers = ClassifierRegistry::new();
        classifiers.register(classifier_for::<E>());
        for classifier in self.extra_classifiers {
            classifiers.register(classifier);
        }
        TransferClient {
            engine: Arc::new(self.engine),
            cache: self
                .cache
                .unwrap_or_else(|| Arc::new(ResponseCache::new(self.cache_config))),
            classifiers,
        }
    }
}

impl<E: Engine> TransferClient<E> {
    pub fn new(engine: E) -> Self {
        Self::builder(engine).build()
    }

    pub fn builder(engine: E) -> TransferClientBuilder<E> {
        TransferClientBuilder {
            engine,
            cache: None,
            cache_config: CacheConfig::default(),
            extra_classifiers: Vec::new(),
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    /// Release engine-held resources. Idempotent.
    pub async fn shutdown(&self) {
        self.engine.shutdown().await;
    }

    /// Perform a single attempt, returning the validated response header and
    /// a cancellable body stream. No caching and no retries; this is the
    /// primitive the other operations are built on.
    pub async fn stream(
        &self,
        request: impl Into<Request>,
        options: &TransferOptions,
    ) -> Result<(ResponseHeader, BodyStream)> {
        self.attempt_stream(request.into(), options).await
    }

    /// Perform a transfer and aggregate the body into memory, honoring the
    /// cache policy and the retry handler.
    pub async fn transfer(
        &self,
        request: impl Into<Request>,
        options: &TransferOptions,
    ) -> Result<(ResponseHeader, Bytes)> {
        let request = request.into();
        let cache_key = options.cache.key_for(request.url());
        if let Some(key) = &cache_key {
            if let Some(entry) = self.cache.get(key).await {
                debug!(key, "response cache hit");
                return Ok((entry.header, entry.body));
            }
        }

        let outcome = self
            .with_retries(request, options, move |attempt_request| {
                Box::pin(async move {
                    let (header, mut body) =
                        self.attempt_stream(attempt_request, options).await?;
                    let bytes = collect_body(&mut body).await?;
                    Ok((header, bytes))
                })
            })
            .await?;

        let (header, body) = match outcome {
            AttemptOutcome::Completed(value) => value,
            AttemptOutcome::Substituted { header, body } => return Ok((header, body)),
        };

        if let Some(key) = cache_key {
            self.cache
                .put(CacheEntry {
                    key,
                    header: header.clone(),
                    body: body.clone(),
                })
                .await;
        }
        Ok((header, body))
    }

    /// [`transfer`](Self::transfer), then decode the body as JSON.
    ///
    /// # Errors
    ///
    /// An empty or `null` body yields [`Error::NoData`]; a body that fails to
    /// parse yields [`Error::Decode`] carrying the offending bytes.
    pub async fn transfer_decoded<T: DeserializeOwned>(
        &self,
        request: impl Into<Request>,
        options: &TransferOptions,
    ) -> Result<(ResponseHeader, T)> {
        let (header, body) = self.transfer(request, options).await?;
        let value = decode_json(&body)?;
        Ok((header, value))
    }

    /// Convenience for an upload-flavor transfer.
    pub async fn upload(
        &self,
        request: UploadRequest,
        payload: impl Into<UploadPayload>,
        options: &TransferOptions,
    ) -> Result<(ResponseHeader, Bytes)> {
        self.transfer(Request::Upload(request, payload.into()), options)
            .await
    }

    /// Stream a transfer's body to a file next to `destination`, never
    /// overwriting: an occupied destination gets a numeric suffix. Returns
    /// the path actually written.
    ///
    /// Files at or below [`FILE_CACHE_LIMIT`] are also written to the
    /// response cache, in the background, when the policy caches at all.
    pub async fn download_to_file(
        &self,
        request: impl Into<Request>,
        destination: impl Into<PathBuf>,
        options: &TransferOptions,
    ) -> Result<(ResponseHeader, PathBuf)> {
        let request = request.into();
        let destination = destination.into();

        let cache_key = options.cache.key_for(request.url());
        if let Some(key) = &cache_key {
            if let Some(entry) = self.cache.get(key).await {
                debug!(key, "response cache hit");
                let path = write_file(&destination, &entry.body).await?;
                return Ok((entry.header, path));
            }
        }

        let target = destination.clone();
        let outcome = self
            .with_retries(request, options, move |attempt_request| {
                let destination = target.clone();
                Box::pin(async move {
                    let (header, mut body) =
                        self.attempt_stream(attempt_request, options).await?;
                    let (path, written) = stream_to_file(&destination, &mut body).await?;
                    Ok((header, path, written))
                })
            })
            .await?;

        let (header, path, written) = match outcome {
            AttemptOutcome::Completed(value) => value,
            AttemptOutcome::Substituted { header, body } => {
                let path = write_file(&destination, &body).await?;
                return Ok((header, path));
            }
        };

        if let Some(key) = cache_key {
            if written <= FILE_CACHE_LIMIT {
                let cache = Arc::clone(&self.cache);
                let cached_header = header.clone();
                let cached_path = path.clone();
                tokio::spawn(async move {
                    match tokio::fs::read(&cached_path).await {
                        Ok(bytes) => {
                            cache
                                .put(CacheEntry {
                                    key,
                                    header: cached_header,
                                    body: Bytes::from(bytes),
                                })
                                .await;
                        }
                        Err(error) => warn!(%error, "error caching downloaded file"),
                    }
                });
            }
        }
        Ok((header, path))
    }

    /// Repeatedly transfer until `until` resolves the poll.
    ///
    /// `until` sees the attempt number (starting at 1), the request that was
    /// just performed, and its result; it either schedules another request or
    /// finishes with a value or error. Failed attempts still consult the
    /// transfer's retry handler first, so the two loops compose.
    pub async fn poll<T>(
        &self,
        request: impl Into<Request>,
        options: &TransferOptions,
        until: impl Fn(u32, &Request, &Result<(ResponseHeader, Bytes)>) -> PollContinuation<T>,
    ) -> Result<T> {
        let mut request = request.into();
        let mut attempt: u32 = 1;
        loop {
            let result = self.transfer(request.clone(), options).await;
            match until(attempt, &request, &result) {
                PollContinuation::Continue {
                    request: next,
                    delay,
                } => {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    request = next;
                    attempt += 1;
                }
                PollContinuation::Finish(resolution) => return resolution,
            }
        }
    }

    /// Drive `run` through the retry loop, consulting the options' retry
    /// handler after each failure. Without a handler the first error is final.
    async fn with_retries<'a, T>(
        &'a self,
        mut request: Request,
        options: &'a TransferOptions,
        run: impl Fn(Request) -> BoxFuture<'a, Result<T>>,
    ) -> Result<AttemptOutcome<T>> {
        let mut attempt: u32 = 1;
        loop {
            let error = match run(request.clone()).await {
                Ok(value) => return Ok(AttemptOutcome::Completed(value)),
                Err(error) => error,
            };
            let Some(handler) = &options.on_error else {
                return Err(error);
            };
            match (**handler)(&request, attempt, &error) {
                RetryDecision::Retry {
                    delay,
                    updated_request,
                } => {
                    debug!(attempt, error = %error, url = request.url(), "retrying transfer");
                    if let Some(mut updated) = updated_request {
                        // Keep the correlation id stable across attempts of
                        // the same logical request.
                        if updated.metadata().request_id().is_none() {
                            let id = request.metadata().request_id().map(str::to_string);
                            if let Some(id) = id {
                                updated.metadata_mut().set_request_id(Some(&id));
                            }
                        }
                        request = updated;
                    }
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
                RetryDecision::Throw { replacement } => {
                    return Err(replacement.unwrap_or(error));
                }
                RetryDecision::DefaultValue { body, response } => {
                    let header = match response {
                        DefaultResponse::Full(header) => header,
                        DefaultResponse::Code(status) => {
                            ResponseHeader::synthesized(status, Some(request.url().to_string()))
                        }
                    };
                    return Ok(AttemptOutcome::Substituted { header, body });
                }
            }
        }
    }

    async fn attempt_stream(
        &self,
        request: Request,
        options: &TransferOptions,
    ) -> Result<(ResponseHeader, BodyStream)> {
        if let Some(token) = &options.token {
            token.check()?;
        }
        if let Some(delegate) = &options.delegate {
            delegate.transfer_started(&request);
        }

        match self.attempt_inner(&request, options).await {
            Ok(success) => Ok(success),
            Err(error) => {
                // Successful attempts report through the wrapped stream's
                // termination hook instead.
                if let Some(delegate) = &options.delegate {
                    delegate.transfer_finished(Some(&error));
                }
                Err(error)
            }
        }
    }

    async fn attempt_inner(
        &self,
        request: &Request,
        options: &TransferOptions,
    ) -> Result<(ResponseHeader, BodyStream)> {
        let metadata = request.metadata();
        let timeout = metadata.timeout;

        let (header, raw_body) = match request {
            Request::Download(download) => {
                let (header, body) =
                    tokio::time::timeout(timeout, self.engine.fetch(download))
                        .await
                        .map_err(|_| Error::RequestTimedOut)?
                        .map_err(|error| self.classifiers.convert(Box::new(error)))?;
                // Wire the token to the raw body right away, so a cancel
                // landing before validation (or during the diagnostic drain
                // below) still stops the transport.
                if let Some(token) = &options.token {
                    let canceller = body.canceller();
                    token.attach(move || canceller.cancel());
                }
                (header, body)
            }
            Request::Upload(upload, payload) => {
                let transfer = tokio::time::timeout(
                    timeout,
                    self.engine.upload(upload, payload.clone()),
                )
                .await
                .map_err(|_| Error::RequestTimedOut)?
                .map_err(|error| self.classifiers.convert(Box::new(error)))?;
                let UploadTransfer {
                    progress,
                    response,
                    body,
                } = transfer;
                // Cancellation must reach the engine while the payload is
                // still in flight, not only once the header has arrived.
                let cancel_signal = match &options.token {
                    Some(token) => {
                        let progress_canceller = progress.canceller();
                        let body_canceller = body.canceller();
                        let (cancel_tx, cancel_rx) = tokio::sync::oneshot::channel::<()>();
                        token.attach(move || {
                            progress_canceller.cancel();
                            body_canceller.cancel();
                            let _ = cancel_tx.send(());
                        });
                        Some(cancel_rx)
                    }
                    None => None,
                };
                spawn_progress_reporter(progress, payload.len_hint(), options.delegate.clone());
                let response = tokio::time::timeout(timeout, response);
                let received = match cancel_signal {
                    Some(mut cancelled) => {
                        let mut response = std::pin::pin!(response);
                        let raced = tokio::select! {
                            signal = &mut cancelled => Err(signal),
                            outcome = response.as_mut() => Ok(outcome),
                        };
                        match raced {
                            Ok(outcome) => outcome,
                            Err(Ok(())) => return Err(Error::RequestCancelled),
                            // Token callback dropped unfired; the response is
                            // still coming.
                            Err(Err(_)) => response.await,
                        }
                    }
                    None => response.await,
                };
                let header = received
                    .map_err(|_| Error::RequestTimedOut)?
                    .map_err(|_| {
                        if options
                            .token
                            .as_ref()
                            .is_some_and(|token| token.is_cancelled())
                        {
                            Error::RequestCancelled
                        } else {
                            Error::unspecified("engine dropped the upload response channel")
                        }
                    })??;
                (header, body)
            }
        };

        if let Some(delegate) = &options.delegate {
            delegate.header_received(&header);
        }

        if !metadata.expected_statuses.contains(header.status) {
            let body = drain_capped(raw_body, timeout).await;
            return Err(Error::UnexpectedStatus {
                status: header.status,
                request: Box::new(request.clone()),
                body,
            });
        }

        let wrapped = wrap_body(raw_body, &header, timeout, options.delegate.clone());

        // Re-point the token at the wrapped stream; its termination hook
        // closes the raw one.
        if let Some(token) = &options.token {
            let canceller = wrapped.canceller();
            token.attach(move || canceller.cancel());
        }

        Ok((header, wrapped))
    }
}

/// Interpose the orchestrator's stream between the engine's and the caller's:
/// per-chunk inactivity timeout, delegate progress, and a termination hook
/// reporting the transfer's final state exactly once.
fn wrap_body(
    mut raw: BodyStream,
    header: &ResponseHeader,
    timeout: Duration,
    delegate: Option<Arc<dyn TransferDelegate>>,
) -> BodyStream {
    let (producer, wrapped) = BodyStream::channel(Error::RequestCancelled);
    let total = header.expected_content_length();

    // Whatever terminates the outer stream first also closes the engine's.
    let inner_canceller = raw.canceller();
    wrapped.on_finish(move |_| inner_canceller.cancel());

    if let Some(delegate) = delegate.clone() {
        wrapped.on_finish(move |termination| {
            let error = match termination {
                Termination::Finished(error) => error.as_ref(),
                Termination::Cancelled(error) => Some(error),
            };
            delegate.transfer_finished(error);
        });
    }

    tokio::spawn(async move {
        let mut received: u64 = 0;
        loop {
            match tokio::time::timeout(timeout, raw.next()).await {
                Err(_) => {
                    raw.cancel_with(Error::RequestTimedOut);
                    let _ = producer.finish_err(Error::RequestTimedOut);
                    return;
                }
                Ok(None) => {
                    let _ = producer.finish();
                    return;
                }
                Ok(Some(Err(error))) => {
                    let _ = producer.finish_err(error);
                    return;
                }
                Ok(Some(Ok(chunk))) => {
                    received += chunk.len() as u64;
                    if let Some(delegate) = &delegate {
                        delegate.chunk_received(&chunk);
                        delegate.bytes_received(received, total);
                    }
                    if producer.send(chunk).await.is_err() {
                        raw.cancel();
                        return;
                    }
                }
            }
        }
    });

    wrapped
}

fn spawn_progress_reporter(
    mut progress: ProgressStream,
    total: Option<u64>,
    delegate: Option<Arc<dyn TransferDelegate>>,
) {
    // Without an observer, dropping the stream cancels it and the engine
    // stops reporting.
    let Some(delegate) = delegate else {
        return;
    };
    tokio::spawn(async move {
        while let Some(item) = progress.next().await {
            match item {
                Ok(sent) => delegate.bytes_sent(sent, total),
                Err(_) => return,
            }
        }
        delegate.sending_finished();
    });
}

async fn collect_body(body: &mut BodyStream) -> Result<Bytes> {
    let mut collected = BytesMut::new();
    while let Some(chunk) = body.next().await {
        collected.extend_from_slice(&chunk?);
    }
    Ok(collected.freeze())
}

/// Capture up to [`ERROR_BODY_CAP`] bytes of an unaccepted response's body
/// for the error, bounded by the request timeout.
async fn drain_capped(mut body: BodyStream, timeout: Duration) -> Option<Bytes> {
    let mut collected = BytesMut::new();
    let drain = async {
        while collected.len() < ERROR_BODY_CAP {
            match body.next().await {
                Some(Ok(chunk)) => {
                    let room = ERROR_BODY_CAP - collected.len();
                    collected.extend_from_slice(&chunk[..chunk.len().min(room)]);
                }
                Some(Err(_)) | None => break,
            }
        }
    };
    let _ = tokio::time::timeout(timeout, drain).await;
    if collected.is_empty() {
        None
    } else {
        Some(collected.freeze())
    }
}

fn decode_json<T: DeserializeOwned>(body: &Bytes) -> Result<T> {
    if body.is_empty() || body.as_ref() == b"null" {
        return Err(Error::NoData);
    }
    serde_json::from_slice(body).map_err(|error| Error::Decode {
        source: Arc::new(error),
        bytes: Some(body.clone()),
    })
}

async fn stream_to_file(destination: &Path, body: &mut BodyStream) -> Result<(PathBuf, u64)> {
    let parent = destination
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    tokio::fs::create_dir_all(parent).await?;

    let temp = tempfile::NamedTempFile::new_in(parent)?;
    let mut file = tokio::fs::File::create(temp.path()).await?;
    let mut written: u64 = 0;
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        written += chunk.len() as u64;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    drop(file);

    let path = available_path(destination);
    temp.persist(&path).map_err(|error| Error::other(error.error))?;
    Ok((path, written))
}

async fn write_file(destination: &Path, body: &Bytes) -> Result<PathBuf> {
    if let Some(parent) = destination
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
    {
        tokio::fs::create_dir_all(parent).await?;
    }
    let path = available_path(destination);
    tokio::fs::write(&path, body).await?;
    Ok(path)
}

/// `destination` if free, otherwise the first `name-N.ext` next to it that is.
fn available_path(destination: &Path) -> PathBuf {
    if !destination.exists() {
        return destination.to_path_buf();
    }
    let stem = destination
        .file_stem()
        .and_then(OsStr::to_str)
        .unwrap_or("download");
    let extension = destination.extension().and_then(OsStr::to_str);
    let parent = destination.parent().unwrap_or(Path::new("."));
    for n in 1u32.. {
        let name = match extension {
            Some(extension) => format!("{stem}-{n}.{extension}"),
            None => format!("{stem}-{n}"),
        };
        let candidate = parent.join(name);
        if !candidate.exists() {
            return candidate;
        }
    }
    destination.to_path_buf()
}
