//! Work signal shared between the push channel and the loop.

use std::sync::atomic::{AtomicBool, Ordering};

use futures::FutureExt;
use tokio::sync::Notify;

/// "There may be work" flag.
///
/// Any number of sources may raise it; only the loop reads and clears it.
/// Raising also wakes a loop that is sleeping out a tick.
#[derive(Debug, Default)]
pub struct WorkSignal {
    raised: AtomicBool,
    notify: Notify,
}

impl WorkSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Read and clear. Clearing also consumes the wake-up stored by the raise,
    /// so an idle wait started afterwards is not cut short.
    pub fn take(&self) -> bool {
        let raised = self.raised.swap(false, Ordering::SeqCst);
        if raised {
            let _ = self.notify.notified().now_or_never();
        }
        raised
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    /// Resolves once [`WorkSignal::raise`] has been called. A raise that
    /// happened while nobody was waiting resolves the next call immediately.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}
