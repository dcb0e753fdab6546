//! Cancellation primitive.
//!
//! A watch-backed handle/token pair: the handle flips the flag once, every
//! token clone observes it. Dropping the handle without aborting leaves
//! tokens pending forever, so an un-aborted request proceeds normally.

use tokio::sync::watch;

/// Owner side; aborting is idempotent.
#[derive(Debug)]
pub struct AbortHandle {
    tx: watch::Sender<bool>,
}

/// Observer side; cheap to clone and pass down the call chain.
#[derive(Debug, Clone)]
pub struct AbortToken {
    rx: watch::Receiver<bool>,
}

/// Create a connected handle/token pair.
pub fn abort_pair() -> (AbortHandle, AbortToken) {
    let (tx, rx) = watch::channel(false);
    (AbortHandle { tx }, AbortToken { rx })
}

impl AbortHandle {
    /// Signal every token. Subsequent calls are no-ops.
    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    pub fn token(&self) -> AbortToken {
        AbortToken {
            rx: self.tx.subscribe(),
        }
    }
}

impl AbortToken {
    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when the handle aborts; never resolves if the handle is
    /// dropped without aborting.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
        // Handle dropped without aborting: park forever.
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn abort_wakes_all_tokens() {
        let (handle, token) = abort_pair();
        let second = token.clone();
        assert!(!token.is_aborted());

        handle.abort();
        token.cancelled().await;
        second.cancelled().await;
        assert!(second.is_aborted());
    }

    #[tokio::test]
    async fn dropped_handle_never_cancels() {
        let (handle, token) = abort_pair();
        drop(handle);
        let waited =
            tokio::time::timeout(Duration::from_millis(20), token.cancelled()).await;
        assert!(waited.is_err(), "token must stay pending");
    }
}
