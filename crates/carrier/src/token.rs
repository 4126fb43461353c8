//! Cooperative cancellation token.

use std::sync::Mutex;

use crate::error::{Error, Result};

type CancelCallback = Box<dyn FnOnce() + Send>;

struct Inner {
    cancelled: bool,
    on_cancel: Option<CancelCallback>,
}

/// A shared handle letting a caller cancel an in-flight transfer from outside
/// its call stack.
///
/// Create one before starting a transfer, hand it to the client, and call
/// [`cancel`](Self::cancel) when the transfer should stop. The client attaches
/// a callback that cancels the underlying stream. A token is not reusable
/// across transfers; each attachment overwrites the previous callback.
pub struct CancellationToken {
    inner: Mutex<Inner>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                cancelled: false,
                on_cancel: None,
            }),
        }
    }

    /// Cancel the transfer this token is attached to.
    ///
    /// Idempotent: the attached callback runs at most once, outside the
    /// token's lock so it may freely touch streams or re-check the token.
    pub fn cancel(&self) {
        let callback = {
            let mut inner = self.lock();
            if inner.cancelled {
                return;
            }
            inner.cancelled = true;
            inner.on_cancel.take()
        };
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Attach the cancellation callback, overwriting any previous one.
    ///
    /// Attaching after [`cancel`](Self::cancel) has already fired invokes the
    /// callback synchronously, so a cancellation arriving in the window
    /// between transfer start and attachment is never lost.
    pub fn attach(&self, callback: impl FnOnce() + Send + 'static) {
        {
            let mut inner = self.lock();
            if !inner.cancelled {
                inner.on_cancel = Some(Box::new(callback));
                return;
            }
        }
        callback();
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    /// Errors with [`Error::RequestCancelled`] once the token is cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::RequestCancelled)
        } else {
            Ok(())
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn cancel_is_idempotent() {
        let fired = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();
        let counter = Arc::clone(&fired);
        token.attach(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        token.cancel();
        token.cancel();
        token.cancel();

        assert!(token.is_cancelled());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn attach_after_cancel_fires_immediately() {
        let fired = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();
        token.cancel();

        let counter = Arc::clone(&fired);
        token.attach(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn check_reports_cancellation() {
        let token = CancellationToken::new();
        assert!(token.check().is_ok());

        token.cancel();
        assert_eq!(token.check().unwrap_err(), Error::RequestCancelled);
    }

    #[test]
    fn attach_overwrites_previous_callback() {
        let fired = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();

        let first = Arc::clone(&fired);
        token.attach(move || {
            first.fetch_add(10, Ordering::SeqCst);
        });
        let second = Arc::clone(&fired);
        token.attach(move || {
            second.fetch_add(1, Ordering::SeqCst);
        });

        token.cancel();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
