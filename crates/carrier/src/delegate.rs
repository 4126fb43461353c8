//! Transfer observability interface.

use bytes::Bytes;

use crate::error::Error;
use crate::request::Request;
use crate::response::ResponseHeader;

/// Implemented by callers who want visibility into a transfer's lifecycle.
///
/// All methods default to no-ops, so implementations override only what they
/// observe. Methods are called from the orchestrator's tasks; implementations
/// must be cheap or hand off to their own machinery.
pub trait TransferDelegate: Send + Sync {
    /// The transfer is about to start.
    fn transfer_started(&self, _request: &Request) {}

    /// Cumulative payload bytes sent so far, with the total when known.
    fn bytes_sent(&self, _sent: u64, _total: Option<u64>) {}

    /// The upload payload has been fully sent.
    fn sending_finished(&self) {}

    /// The response header arrived.
    fn header_received(&self, _header: &ResponseHeader) {}

    /// A raw body chunk passed through.
    fn chunk_received(&self, _chunk: &Bytes) {}

    /// Cumulative body bytes received, with the expected total when known.
    fn bytes_received(&self, _count: u64, _total: Option<u64>) {}

    /// The transfer reached its terminal state.
    fn transfer_finished(&self, _error: Option<&Error>) {}
}
