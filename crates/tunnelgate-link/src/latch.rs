//! First-error-wins latch shared by the reader and writer of a link

use crate::error::LinkError;
use std::sync::Arc;
use tokio::sync::watch;

/// A cell that is set at most once.
///
/// Both pump tasks and the teardown path may raise it; only the first value
/// sticks. Any number of tasks can wait for it, before or after it fires.
#[derive(Clone)]
pub struct ErrorLatch {
    tx: Arc<watch::Sender<Option<LinkError>>>,
}

impl ErrorLatch {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Record `err` unless an error is already latched.
    ///
    /// Returns true if this call set the latch.
    pub fn raise(&self, err: LinkError) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(err);
                true
            } else {
                false
            }
        })
    }

    /// The latched error, if any.
    pub fn get(&self) -> Option<LinkError> {
        self.tx.borrow().clone()
    }

    pub fn is_raised(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Wait until an error is latched and return it.
    pub async fn wait(&self) -> LinkError {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so the wait cannot fail
        let latched = rx
            .wait_for(|slot| slot.is_some())
            .await
            .ok()
            .and_then(|slot| (*slot).clone());
        latched.unwrap_or(LinkError::Closed)
    }
}

impl Default for ErrorLatch {
    fn default() -> Self {
        Self::new()
    }
}
