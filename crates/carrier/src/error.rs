//! Error taxonomy and backend error classification.
//!
//! Every failure a transfer can surface is one of the closed set of [`Error`]
//! kinds. Foreign errors from transport backends are normalized exactly once,
//! at the orchestrator's boundary with the engine, through a
//! [`ClassifierRegistry`] owned by the client.

use std::error::Error as StdError;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error as ThisError;

use crate::request::Request;

/// A boxed, thread-safe foreign error.
pub type BoxedError = Box<dyn StdError + Send + Sync + 'static>;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Cap on body bytes captured for diagnostics when a response arrives with an
/// unaccepted status code.
pub const ERROR_BODY_CAP: usize = 10 * 1024 * 1024;

/// Failures a transfer can resolve to.
#[derive(Debug, Clone, ThisError)]
pub enum Error {
    /// A foreign error that doesn't fall under any other kind.
    #[error("wrapped error: {0}")]
    Other(Arc<dyn StdError + Send + Sync + 'static>),

    /// The response body could not be decoded into the requested type. Carries
    /// the offending bytes, when available, for diagnostics.
    #[error("response body failed to decode: {source}")]
    Decode {
        #[source]
        source: Arc<dyn StdError + Send + Sync + 'static>,
        bytes: Option<Bytes>,
    },

    /// A response body was expected but absent.
    #[error("expected response body was absent")]
    NoData,

    /// The response status code was not in the request's accepted set. Carries
    /// the originating request and up to [`ERROR_BODY_CAP`] bytes of body.
    #[error("unexpected response status {status} for {}", .request.metadata().url)]
    UnexpectedStatus {
        status: u16,
        request: Box<Request>,
        body: Option<Bytes>,
    },

    /// The transfer was cancelled, by token or by cancelling its stream.
    #[error("request cancelled")]
    RequestCancelled,

    /// The transfer exceeded its timeout.
    #[error("request timed out")]
    RequestTimedOut,

    /// Escape hatch for failure states none of the other kinds describe.
    #[error("unspecified error: {reason}")]
    Unspecified { reason: String },
}

impl Error {
    /// Wrap a foreign error as [`Error::Other`].
    pub fn other(error: impl Into<BoxedError>) -> Self {
        Self::Other(Arc::from(error.into()))
    }

    pub fn unspecified(reason: impl Into<String>) -> Self {
        Self::Unspecified {
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Self::other(error)
    }
}

/// Equality is pragmatic rather than strict: wrapped foreign errors are
/// compared by their rendered messages, since arbitrary error values from
/// different backends are not otherwise comparable.
impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Other(a), Self::Other(b)) => a.to_string() == b.to_string(),
            (
                Self::Decode {
                    source: a,
                    bytes: ab,
                },
                Self::Decode {
                    source: b,
                    bytes: bb,
                },
            ) => a.to_string() == b.to_string() && ab == bb,
            (Self::NoData, Self::NoData) => true,
            (
                Self::UnexpectedStatus {
                    status: a,
                    body: ab,
                    ..
                },
                Self::UnexpectedStatus {
                    status: b,
                    body: bb,
                    ..
                },
            ) => a == b && ab == bb,
            (Self::RequestCancelled, Self::RequestCancelled) => true,
            (Self::RequestTimedOut, Self::RequestTimedOut) => true,
            (Self::Unspecified { reason: a }, Self::Unspecified { reason: b }) => a == b,
            _ => false,
        }
    }
}

type Predicate = fn(&(dyn StdError + 'static)) -> bool;

/// How one backend recognizes its own cancellation and timeout errors.
#[derive(Clone, Copy)]
pub struct Classifier {
    pub name: &'static str,
    pub is_cancellation: Predicate,
    pub is_timeout: Predicate,
}

/// Per-client table of backend classifiers.
///
/// Each client owns its own registry, so independently configured clients
/// cannot interfere with one another. The client registers its engine's
/// classifier at construction; additional backends can be registered when a
/// stream provider or delegate is expected to surface their errors.
#[derive(Default)]
pub struct ClassifierRegistry {
    entries: Vec<Classifier>,
}

impl ClassifierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a classifier, replacing any previous entry with the same name.
    pub fn register(&mut self, classifier: Classifier) {
        self.entries.retain(|c| c.name != classifier.name);
        self.entries.push(classifier);
    }

    /// Normalize a foreign error into the taxonomy.
    ///
    /// Errors already belonging to the taxonomy pass through unchanged.
    /// Otherwise cancellation predicates are consulted first, then timeout
    /// predicates, and anything unrecognized is wrapped as [`Error::Other`].
    pub fn convert(&self, error: BoxedError) -> Error {
        let error = match error.downcast::<Error>() {
            Ok(own) => return *own,
            Err(foreign) => foreign,
        };
        let as_dyn: &(dyn StdError + 'static) = error.as_ref();
        if self.entries.iter().any(|c| (c.is_cancellation)(as_dyn)) {
            return Error::RequestCancelled;
        }
        if self.entries.iter().any(|c| (c.is_timeout)(as_dyn)) {
            return Error::RequestTimedOut;
        }
        Error::Other(Arc::from(error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, ThisError)]
    #[error("backend says: {0}")]
    struct BackendError(&'static str);

    fn backend_classifier() -> Classifier {
        fn is_cancel(error: &(dyn StdError + 'static)) -> bool {
            error
                .downcast_ref::<BackendError>()
                .is_some_and(|e| e.0 == "cancelled")
        }
        fn is_timeout(error: &(dyn StdError + 'static)) -> bool {
            error
                .downcast_ref::<BackendError>()
                .is_some_and(|e| e.0 == "deadline")
        }
        Classifier {
            name: "backend",
            is_cancellation: is_cancel,
            is_timeout: is_timeout,
        }
    }

    #[test]
    fn wrapped_errors_compare_by_message() {
        let a = Error::other(BackendError("boom"));
        let b = Error::other(BackendError("boom"));
        let c = Error::other(BackendError("bang"));

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn taxonomy_errors_pass_through_conversion() {
        let registry = ClassifierRegistry::new();
        let converted = registry.convert(Box::new(Error::NoData));
        assert_eq!(converted, Error::NoData);
    }

    #[test]
    fn registry_recognizes_backend_cancellation_and_timeout() {
        let mut registry = ClassifierRegistry::new();
        registry.register(backend_classifier());

        assert_eq!(
            registry.convert(Box::new(BackendError("cancelled"))),
            Error::RequestCancelled,
        );
        assert_eq!(
            registry.convert(Box::new(BackendError("deadline"))),
            Error::RequestTimedOut,
        );
        assert!(matches!(
            registry.convert(Box::new(BackendError("other"))),
            Error::Other(_),
        ));
    }

    #[test]
    fn register_replaces_same_name() {
        fn never(_: &(dyn StdError + 'static)) -> bool {
            false
        }
        let mut registry = ClassifierRegistry::new();
        registry.register(backend_classifier());
        registry.register(Classifier {
            name: "backend",
            is_cancellation: never,
            is_timeout: never,
        });

        assert!(matches!(
            registry.convert(Box::new(BackendError("cancelled"))),
            Error::Other(_),
        ));
    }
}
