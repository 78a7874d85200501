//! Completion tokens for client-initiated operations
//!
//! Every connect, disconnect, publish, subscribe and unsubscribe call is
//! represented by a [`CompletionToken`]. The transport resolves the token from
//! its own threads; the caller either blocks on [`CompletionToken::wait`] or
//! receives the outcome through a callback.
//!
//! A token resolves at most once. Whatever arrives after the first
//! resolution (a late acknowledgement after a timeout, a duplicate failure) is
//! ignored.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{ClientError, Result};

/// Callback invoked exactly once with the outcome of an asynchronous operation.
pub type CompletionCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// Operation a token stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Connect,
    Disconnect,
    Publish,
    Subscribe,
    Unsubscribe,
}

/// Resolution state of a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenState {
    Pending,
    Succeeded,
    Failed(ClientError),
    TimedOut,
}

/// Normalise a caller supplied timeout: zero means "no deadline", never "expire now".
pub fn effective_timeout(timeout: Option<Duration>) -> Option<Duration> {
    timeout.filter(|t| !t.is_zero())
}

struct Slot {
    state: TokenState,
    // Set once the resolution callback has finished running
    settled: bool,
}

struct TokenInner {
    kind: TokenKind,
    deadline: Option<Duration>,
    is_async: bool,
    state: Mutex<Slot>,
    resolved: Condvar,
    callback: Mutex<Option<CompletionCallback>>,
}

/// Pending-result handle for one client operation.
///
/// Cloning yields another handle to the same token.
#[derive(Clone)]
pub struct CompletionToken {
    inner: Arc<TokenInner>,
}

impl CompletionToken {
    fn build(
        kind: TokenKind,
        timeout: Option<Duration>,
        is_async: bool,
        callback: Option<CompletionCallback>,
    ) -> Self {
        Self {
            inner: Arc::new(TokenInner {
                kind,
                deadline: effective_timeout(timeout),
                is_async,
                state: Mutex::new(Slot {
                    state: TokenState::Pending,
                    settled: false,
                }),
                resolved: Condvar::new(),
                callback: Mutex::new(callback),
            }),
        }
    }

    /// Token for a caller that blocks on [`wait`](Self::wait).
    pub fn blocking(kind: TokenKind, timeout: Option<Duration>) -> Self {
        Self::build(kind, timeout, false, None)
    }

    /// Token whose outcome is delivered to `callback`.
    pub fn with_callback<F>(kind: TokenKind, timeout: Option<Duration>, callback: F) -> Self
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        Self::build(kind, timeout, true, Some(Box::new(callback)))
    }

    /// Asynchronous token nobody listens to.
    pub fn detached(kind: TokenKind) -> Self {
        Self::build(kind, None, true, None)
    }

    /// Blocking token that also runs `hook` on resolution, before waiters wake.
    pub(crate) fn blocking_with_hook<F>(kind: TokenKind, timeout: Option<Duration>, hook: F) -> Self
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        Self::build(kind, timeout, false, Some(Box::new(hook)))
    }

    pub fn kind(&self) -> TokenKind {
        self.inner.kind
    }

    /// Deadline after normalisation; `None` means the operation never times out.
    pub fn deadline(&self) -> Option<Duration> {
        self.inner.deadline
    }

    pub fn is_async(&self) -> bool {
        self.inner.is_async
    }

    pub fn state(&self) -> TokenState {
        self.inner.state.lock().state.clone()
    }

    pub fn is_resolved(&self) -> bool {
        self.inner.state.lock().state != TokenState::Pending
    }

    /// Resolve successfully. Returns false if the token was already resolved.
    pub fn succeed(&self) -> bool {
        self.resolve(TokenState::Succeeded)
    }

    /// Resolve with a failure. Returns false if the token was already resolved.
    pub fn fail(&self, error: ClientError) -> bool {
        self.resolve(TokenState::Failed(error))
    }

    /// Resolve as timed out. Returns false if the token was already resolved.
    pub fn time_out(&self) -> bool {
        self.resolve(TokenState::TimedOut)
    }

    fn resolve(&self, outcome: TokenState) -> bool {
        {
            let mut slot = self.inner.state.lock();
            if slot.state != TokenState::Pending {
                tracing::trace!(kind = ?self.inner.kind, "ignoring late resolution");
                return false;
            }
            slot.state = outcome.clone();
        }

        if let Some(callback) = self.inner.callback.lock().take() {
            callback(self.outcome_of(outcome));
        }

        self.inner.state.lock().settled = true;
        self.inner.resolved.notify_all();
        true
    }

    fn outcome_of(&self, state: TokenState) -> Result<()> {
        match state {
            TokenState::Succeeded => Ok(()),
            TokenState::Failed(error) => Err(error),
            TokenState::TimedOut => Err(ClientError::Timeout(
                self.inner.deadline.unwrap_or_default(),
            )),
            TokenState::Pending => Err(ClientError::Connection(
                "operation is still pending".to_string(),
            )),
        }
    }

    /// Block until the token resolves or its deadline passes.
    ///
    /// Without a deadline this waits indefinitely and can only return success
    /// or a failure reported by the transport.
    pub fn wait(&self) -> Result<()> {
        let started = Instant::now();
        let mut slot = self.inner.state.lock();

        while !slot.settled {
            match self.inner.deadline {
                Some(deadline) if slot.state == TokenState::Pending => {
                    let Some(remaining) = deadline.checked_sub(started.elapsed()) else {
                        drop(slot);
                        self.time_out();
                        slot = self.inner.state.lock();
                        continue;
                    };
                    self.inner.resolved.wait_for(&mut slot, remaining);
                }
                _ => self.inner.resolved.wait(&mut slot),
            }
        }

        let outcome = slot.state.clone();
        drop(slot);
        self.outcome_of(outcome)
    }
}

impl fmt::Debug for CompletionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionToken")
            .field("kind", &self.inner.kind)
            .field("deadline", &self.inner.deadline)
            .field("is_async", &self.inner.is_async)
            .field("state", &self.inner.state.lock().state)
            .finish()
    }
}
