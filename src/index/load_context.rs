//! Suspend/resume rendezvous between the control thread and a replay.
//!
//! The host creates a [`LoadContext`], hands it to
//! [`crate::index::make_index`] on a loader thread, and can then suspend,
//! resume, or abort an in-flight replay from its own thread. The replay loop
//! polls [`LoadContext::check_for_suspend`] once per chapter; there is no
//! hidden control flow.

use parking_lot::{Condvar, Mutex};

/// State of the index as seen through its load context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexStatus {
    /// Construction or replay is in progress.
    Opening,
    /// The index finished loading and is serving requests.
    Ready,
    /// Construction failed; the index was freed.
    Failed,
    /// A suspend has been requested and not yet acknowledged.
    Suspending,
    /// The replay thread has parked itself.
    Suspended,
    /// The index is being torn down; a suspended replay must abort.
    Freeing,
}

/// Mutex/condvar rendezvous shared by the control and replay threads.
pub struct LoadContext {
    status: Mutex<IndexStatus>,
    cond: Condvar,
}

impl LoadContext {
    /// Create a context in the [`IndexStatus::Opening`] state.
    pub fn new() -> Self {
        Self {
            status: Mutex::new(IndexStatus::Opening),
            cond: Condvar::new(),
        }
    }

    /// The current status.
    pub fn status(&self) -> IndexStatus {
        *self.status.lock()
    }

    /// Publish a terminal construction status and wake anyone waiting.
    ///
    /// Called for [`IndexStatus::Ready`] and [`IndexStatus::Failed`] so a
    /// suspender blocked on the context never hangs.
    pub(crate) fn publish(&self, status: IndexStatus) {
        let mut current = self.status.lock();
        *current = status;
        self.cond.notify_all();
    }

    /// Called by the replay loop once per chapter. Parks the replay while a
    /// suspend is in force; returns true when the replay must abort because
    /// the index is being freed.
    pub(crate) fn check_for_suspend(&self) -> bool {
        let mut status = self.status.lock();
        if *status != IndexStatus::Suspending {
            return false;
        }

        // Acknowledge the suspend and wait for a verdict.
        *status = IndexStatus::Suspended;
        self.cond.notify_all();
        while *status != IndexStatus::Opening && *status != IndexStatus::Freeing {
            self.cond.wait(&mut status);
        }
        *status == IndexStatus::Freeing
    }

    /// Ask an in-flight replay to park. Blocks until the replay acknowledges
    /// or construction finishes first; returns true only in the former case.
    pub fn request_suspend(&self) -> bool {
        let mut status = self.status.lock();
        if *status != IndexStatus::Opening {
            return false;
        }
        *status = IndexStatus::Suspending;
        self.cond.notify_all();
        while *status == IndexStatus::Suspending {
            self.cond.wait(&mut status);
        }
        *status == IndexStatus::Suspended
    }

    /// Resume a suspended replay.
    pub fn resume(&self) {
        let mut status = self.status.lock();
        if *status == IndexStatus::Suspended || *status == IndexStatus::Suspending {
            *status = IndexStatus::Opening;
            self.cond.notify_all();
        }
    }

    /// Tell a suspended replay to abort so the index can be freed.
    pub fn begin_free(&self) {
        let mut status = self.status.lock();
        *status = IndexStatus::Freeing;
        self.cond.notify_all();
    }
}

impl Default for LoadContext {
    fn default() -> Self {
        Self::new()
    }
}
