//! Transport contract.
//!
//! An [`Engine`] is the pluggable capability performing actual network I/O.
//! The orchestrator drives any engine the same way: download via
//! [`fetch`](Engine::fetch), upload via [`upload`](Engine::upload), and
//! recognize the engine's own cancellation and timeout failures through its
//! static predicates.

use std::error::Error as StdError;
use std::future::Future;

use tokio::sync::oneshot;

use crate::error::{Classifier, Error};
use crate::request::{DownloadRequest, UploadPayload, UploadRequest};
use crate::response::ResponseHeader;
use crate::stream::{BodyStream, ProgressStream};

/// The three concurrently available faces of an in-flight upload.
///
/// They are separated because the response header can arrive before the
/// response body and before the upload itself finishes.
pub struct UploadTransfer {
    /// Cumulative bytes sent, reported as the payload streams out.
    pub progress: ProgressStream,
    /// Resolves once the response header is available. Engines send taxonomy
    /// errors here; a dropped sender is treated as an engine failure.
    pub response: oneshot::Receiver<Result<ResponseHeader, Error>>,
    /// The response body.
    pub body: BodyStream,
}

/// Asynchronous transport abstraction.
///
/// Implementations handle their own connection management and error mapping;
/// the orchestrator handles caching, retries, status validation, progress
/// reporting, and cancellation wiring.
pub trait Engine: Send + Sync + 'static {
    /// Name under which this engine's error classifier registers.
    const NAME: &'static str;

    /// Error type for transport operations.
    type Error: StdError + Send + Sync + 'static;

    /// Perform a download-flavor request, returning the response header and
    /// a cancellable body stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the request could not be performed (DNS failure,
    /// connection error, invalid request). Failures mid-body are delivered
    /// through the stream instead.
    fn fetch(
        &self,
        request: &DownloadRequest,
    ) -> impl Future<Output = Result<(ResponseHeader, BodyStream), Self::Error>> + Send;

    /// Perform an upload-flavor request.
    fn upload(
        &self,
        request: &UploadRequest,
        payload: UploadPayload,
    ) -> impl Future<Output = Result<UploadTransfer, Self::Error>> + Send;

    /// Whether `error` is this backend's way of signalling cancellation.
    fn is_cancellation_error(error: &Self::Error) -> bool;

    /// Whether `error` is this backend's way of signalling a timeout.
    fn is_timeout_error(error: &Self::Error) -> bool;

    /// Release backend-held resources. Must be idempotent.
    fn shutdown(&self) -> impl Future<Output = ()> + Send;
}

fn cancellation_predicate<E: Engine>(error: &(dyn StdError + 'static)) -> bool {
    error
        .downcast_ref::<E::Error>()
        .is_some_and(E::is_cancellation_error)
}

fn timeout_predicate<E: Engine>(error: &(dyn StdError + 'static)) -> bool {
    error
        .downcast_ref::<E::Error>()
        .is_some_and(E::is_timeout_error)
}

/// The [`Classifier`] registering `E`'s predicates, for a
/// [`ClassifierRegistry`](crate::error::ClassifierRegistry).
pub fn classifier_for<E: Engine>() -> Classifier {
    Classifier {
        name: E::NAME,
        is_cancellation: cancellation_predicate::<E>,
        is_timeout: timeout_predicate::<E>,
    }
}
