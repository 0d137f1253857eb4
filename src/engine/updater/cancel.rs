//! Installation cancellation.

use std::sync::Arc;

use tokio::sync::watch;

use super::error::CancelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelState {
    Active,
    CancelRequested,
    /// The swap has started; cancellation is no longer accepted.
    Committed,
}

/// Shared handle for requesting cancellation of one installation attempt.
///
/// Clones observe the same state. Cancellation is accepted until the
/// coordinator commits to swapping and refused afterwards.
#[derive(Debug, Clone)]
pub struct CancellationHandle {
    state: Arc<watch::Sender<CancelState>>,
}

impl CancellationHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(CancelState::Active);
        Self { state: Arc::new(tx) }
    }

    /// Request cancellation.
    pub fn cancel(&self) -> Result<(), CancelError> {
        let mut result = Ok(());
        self.state.send_if_modified(|state| match state {
            CancelState::Active => {
                *state = CancelState::CancelRequested;
                true
            }
            CancelState::CancelRequested => false,
            CancelState::Committed => {
                result = Err(CancelError::SwapInProgress);
                false
            }
        });
        result
    }

    pub fn state(&self) -> CancelState {
        *self.state.borrow()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == CancelState::CancelRequested
    }

    /// Move to `Committed` unless cancellation was already requested.
    /// Returns whether the commit happened.
    pub fn commit(&self) -> bool {
        let mut committed = false;
        self.state.send_if_modified(|state| match state {
            CancelState::Active => {
                *state = CancelState::Committed;
                committed = true;
                true
            }
            CancelState::Committed => {
                committed = true;
                false
            }
            CancelState::CancelRequested => false,
        });
        committed
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|state| *state == CancelState::CancelRequested).await;
    }
}

impl Default for CancellationHandle {
    fn default() -> Self {
        Self::new()
    }
}
