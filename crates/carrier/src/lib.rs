//! Transport-agnostic HTTP transfer orchestration.
//!
//! # Architecture
//!
//! The crate splits transfers into two layers:
//! - [`Engine`] - pluggable transports performing the actual network I/O
//! - [`TransferClient`] - the orchestrator layered on any engine: caching,
//!   retries, status validation, progress, timeouts, and cancellation
//!
//! # Key Features
//!
//! - **Cancellable Streams**: bodies arrive as [`CancellableStream`]s with
//!   exactly-once termination hooks, cancellable from either side
//! - **Two-Tier Cache**: completed responses persist in memory and on disk,
//!   both capacity-bound, keyed by URL or by explicit key
//! - **Caller-Owned Retry Policy**: a [`RetryDecision`] handler steers the
//!   retry loop, replaces requests, or substitutes default values
//! - **Closed Error Taxonomy**: every backend failure normalizes into
//!   [`Error`] through per-engine classifiers

mod cache;
mod client;
mod delegate;
mod engine;
mod error;
pub mod headers;
mod mock;
mod request;
mod response;
mod retry;
mod stream;
mod token;

#[cfg(feature = "reqwest")]
mod reqwest_engine;

pub use cache::{CacheConfig, CacheEntry, CachePolicy, DiskCache, MemoryCache, ResponseCache};
pub use client::{
    FILE_CACHE_LIMIT, PollContinuation, TransferClient, TransferClientBuilder, TransferOptions,
};
pub use delegate::TransferDelegate;
pub use engine::{Engine, UploadTransfer, classifier_for};
pub use error::{BoxedError, Classifier, ClassifierRegistry, ERROR_BODY_CAP, Error, Result};
pub use headers::Headers;
pub use mock::{MockEngine, MockResponse};
pub use request::{
    DownloadRequest, ExtensionValue, HttpMethod, Request, RequestMetadata, ResponseCodes,
    StreamProvider, UploadPayload, UploadRequest,
};
pub use response::ResponseHeader;
pub use retry::{DefaultResponse, RetryDecision, RetryHandler};
pub use stream::{
    BodyStream, CancellableStream, ProgressStream, StreamCanceller, StreamClosed, StreamProducer,
    Termination, concat,
};
pub use token::CancellationToken;

#[cfg(feature = "reqwest")]
pub use reqwest_engine::{ReqwestEngine, ReqwestEngineError};
