//! reqwest-backed transport.
//!
//! The default [`Engine`] for real network I/O. Bodies are forwarded between
//! reqwest's streams and the orchestrator's cancellable streams by spawned
//! tasks; cancelling a body stream aborts the forwarding task, which drops
//! the underlying connection.

use std::path::PathBuf;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use thiserror::Error as ThisError;
use tokio::io::AsyncReadExt;
use tokio::sync::oneshot;

use crate::engine::{Engine, UploadTransfer};
use crate::error::Error;
use crate::headers::Headers;
use crate::request::{DownloadRequest, RequestMetadata, UploadPayload, UploadRequest};
use crate::response::ResponseHeader;
use crate::stream::{BodyStream, ProgressStream, StreamProducer, Termination};

/// Failures from the reqwest transport.
#[derive(Debug, ThisError)]
pub enum ReqwestEngineError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// An [`Engine`] over a shared [`reqwest::Client`].
#[derive(Clone, Default)]
pub struct ReqwestEngine {
    client: reqwest::Client,
}

impl ReqwestEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a preconfigured client, e.g. one with proxy or TLS settings.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn build_request(
        &self,
        metadata: &RequestMetadata,
    ) -> Result<reqwest::RequestBuilder, ReqwestEngineError> {
        let method =
            reqwest::Method::from_bytes(metadata.method.as_str().as_bytes()).map_err(|_| {
                ReqwestEngineError::InvalidRequest(format!(
                    "invalid method {:?}",
                    metadata.method.as_str(),
                ))
            })?;
        let mut builder = self
            .client
            .request(method, &metadata.url)
            .timeout(metadata.timeout);
        for (name, value) in metadata.headers.iter() {
            builder = builder.header(name, value);
        }
        Ok(builder)
    }
}

impl Engine for ReqwestEngine {
    const NAME: &'static str = "reqwest";

    type Error = ReqwestEngineError;

    async fn fetch(
        &self,
        request: &DownloadRequest,
    ) -> Result<(ResponseHeader, BodyStream), Self::Error> {
        let mut builder = self.build_request(&request.metadata)?;
        if let Some(payload) = &request.payload {
            builder = builder.body(payload.clone());
        }

        let response = builder.send().await?;
        let header = response_header(&response);

        let (producer, body) = BodyStream::channel(Error::RequestCancelled);
        let mut chunks = response.bytes_stream();
        let forwarder = tokio::spawn(async move {
            while let Some(chunk) = chunks.next().await {
                match chunk {
                    Ok(chunk) => {
                        if producer.send(chunk).await.is_err() {
                            return;
                        }
                    }
                    Err(error) => {
                        let _ = producer.finish_err(map_stream_error(error));
                        return;
                    }
                }
            }
            let _ = producer.finish();
        });
        abort_on_cancel(&body, forwarder);

        Ok((header, body))
    }

    async fn upload(
        &self,
        request: &UploadRequest,
        payload: UploadPayload,
    ) -> Result<UploadTransfer, Self::Error> {
        let builder = self.build_request(&request.metadata)?;
        let (progress_tx, progress) = ProgressStream::channel(Error::RequestCancelled);
        let (response_tx, response) = oneshot::channel();
        let (body_tx, body) = BodyStream::channel(Error::RequestCancelled);

        let outgoing = reqwest::Body::wrap_stream(counting_stream(payload_stream(payload), progress_tx));
        let builder = builder.body(outgoing);

        let forwarder = tokio::spawn(async move {
            let http_response = match builder.send().await {
                Ok(http_response) => http_response,
                Err(error) => {
                    let _ = response_tx.send(Err(map_stream_error(error)));
                    let _ = body_tx.finish();
                    return;
                }
            };
            let _ = response_tx.send(Ok(response_header(&http_response)));

            let mut chunks = http_response.bytes_stream();
            while let Some(chunk) = chunks.next().await {
                match chunk {
                    Ok(chunk) => {
                        if body_tx.send(chunk).await.is_err() {
                            return;
                        }
                    }
                    Err(error) => {
                        let _ = body_tx.finish_err(map_stream_error(error));
                        return;
                    }
                }
            }
            let _ = body_tx.finish();
        });
        abort_on_cancel(&body, forwarder);

        Ok(UploadTransfer {
            progress,
            response,
            body,
        })
    }

    // reqwest has no cancellation of its own; cancellation happens by
    // aborting the forwarding task.
    fn is_cancellation_error(_error: &Self::Error) -> bool {
        false
    }

    fn is_timeout_error(error: &Self::Error) -> bool {
        matches!(error, ReqwestEngineError::Http(http) if http.is_timeout())
    }

    async fn shutdown(&self) {}
}

fn response_header(response: &reqwest::Response) -> ResponseHeader {
    let mut headers = Headers::new();
    for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            headers.append(name.as_str(), value);
        }
    }
    ResponseHeader::new(
        response.status().as_u16(),
        Some(response.url().to_string()),
        headers,
    )
}

fn map_stream_error(error: reqwest::Error) -> Error {
    if error.is_timeout() {
        Error::RequestTimedOut
    } else {
        Error::other(error)
    }
}

/// Drop the connection when the consumer cancels; a finished stream has
/// nothing left to abort.
fn abort_on_cancel(body: &BodyStream, forwarder: tokio::task::JoinHandle<()>) {
    let abort = forwarder.abort_handle();
    body.on_finish(move |termination| {
        if matches!(termination, Termination::Cancelled(_)) {
            abort.abort();
        }
    });
}

fn payload_stream(payload: UploadPayload) -> BodyStream {
    match payload {
        UploadPayload::Bytes(bytes) => {
            let (producer, stream) = BodyStream::channel(Error::RequestCancelled);
            let _ = producer.push(bytes);
            let _ = producer.finish();
            stream
        }
        UploadPayload::File(path) => file_stream(path),
        UploadPayload::Provider(provider) => provider(),
    }
}

fn file_stream(path: PathBuf) -> BodyStream {
    let (producer, stream) = BodyStream::channel(Error::RequestCancelled);
    tokio::spawn(async move {
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(error) => {
                let _ = producer.finish_err(Error::other(error));
                return;
            }
        };
        let mut buffer = vec![0u8; 64 * 1024];
        loop {
            if producer.is_terminated() {
                return;
            }
            match file.read(&mut buffer).await {
                Ok(0) => {
                    let _ = producer.finish();
                    return;
                }
                Ok(read) => {
                    if producer
                        .send(Bytes::copy_from_slice(&buffer[..read]))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Err(error) => {
                    let _ = producer.finish_err(Error::other(error));
                    return;
                }
            }
        }
    });
    stream
}

/// Forward the payload stream while reporting cumulative sent bytes, closing
/// the progress stream when the payload is exhausted.
fn counting_stream(
    stream: BodyStream,
    progress: StreamProducer<u64>,
) -> impl Stream<Item = Result<Bytes, Error>> + Send + 'static {
    futures_util::stream::unfold(
        (stream, progress, 0u64),
        |(mut stream, progress, mut sent)| async move {
            match stream.next().await {
                Some(Ok(chunk)) => {
                    sent += chunk.len() as u64;
                    let _ = progress.push(sent);
                    Some((Ok(chunk), (stream, progress, sent)))
                }
                Some(Err(error)) => {
                    let _ = progress.finish_err(error.clone());
                    Some((Err(error), (stream, progress, sent)))
                }
                None => {
                    let _ = progress.finish();
                    None
                }
            }
        },
    )
}
