//! Retry decision model.
//!
//! After every failed attempt the orchestrator's retry loop consults a
//! caller-supplied [`RetryHandler`] and applies whatever [`RetryDecision`] it
//! returns. The loop imposes no attempt cap and no backoff of its own;
//! retry policy belongs entirely to the handler.

use std::time::Duration;

use bytes::Bytes;

use crate::error::Error;
use crate::request::Request;
use crate::response::ResponseHeader;

/// Steers the retry loop after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Try again, optionally after a delay and optionally with a replacement
    /// request.
    Retry {
        delay: Duration,
        updated_request: Option<Request>,
    },
    /// Stop and propagate the error, optionally replacing it.
    Throw { replacement: Option<Error> },
    /// Stop and resolve the transfer with a caller-chosen body and a real or
    /// synthesized response header.
    DefaultValue {
        body: Bytes,
        response: DefaultResponse,
    },
}

/// The header accompanying a substituted default value.
#[derive(Debug, Clone, PartialEq)]
pub enum DefaultResponse {
    /// A complete header supplied by the caller.
    Full(ResponseHeader),
    /// Synthesize a header with this status and no headers.
    Code(u16),
}

impl RetryDecision {
    /// Retry immediately with the same request.
    pub fn retry() -> Self {
        Self::Retry {
            delay: Duration::ZERO,
            updated_request: None,
        }
    }

    /// Retry with the same request after `delay`.
    pub fn retry_after(delay: Duration) -> Self {
        Self::Retry {
            delay,
            updated_request: None,
        }
    }

    /// Retry immediately with a replacement request.
    pub fn retry_with(request: impl Into<Request>) -> Self {
        Self::Retry {
            delay: Duration::ZERO,
            updated_request: Some(request.into()),
        }
    }

    /// Propagate the error as-is.
    pub fn throw() -> Self {
        Self::Throw { replacement: None }
    }

    /// Propagate `error` instead of the one that occurred.
    pub fn throw_instead(error: Error) -> Self {
        Self::Throw {
            replacement: Some(error),
        }
    }

    /// Resolve with `body` and a synthesized header carrying `status`.
    pub fn default_value(body: impl Into<Bytes>, status: u16) -> Self {
        Self::DefaultValue {
            body: body.into(),
            response: DefaultResponse::Code(status),
        }
    }

    /// Resolve with `body` and a complete caller-supplied header.
    pub fn default_value_with(body: impl Into<Bytes>, header: ResponseHeader) -> Self {
        Self::DefaultValue {
            body: body.into(),
            response: DefaultResponse::Full(header),
        }
    }
}

/// Invoked with the request of the failed attempt, the attempt number
/// (starting at 1), and the normalized error.
pub type RetryHandler = dyn Fn(&Request, u32, &Error) -> RetryDecision + Send + Sync;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_produce_expected_variants() {
        assert_eq!(
            RetryDecision::retry(),
            RetryDecision::Retry {
                delay: Duration::ZERO,
                updated_request: None,
            },
        );
        assert_eq!(RetryDecision::throw(), RetryDecision::Throw { replacement: None });
        assert_eq!(
            RetryDecision::default_value("fallback", 200),
            RetryDecision::DefaultValue {
                body: Bytes::from_static(b"fallback"),
                response: DefaultResponse::Code(200),
            },
        );
    }
}
