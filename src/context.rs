//! The host-side seam: what the scheduler needs to know about the affinity
//! thread and how it gets work onto it.

use crate::error::Result;
use futures::future::LocalBoxFuture;

/// Work handed to the host to run once control reaches the affinity thread.
pub type Continuation = Box<dyn FnOnce() + Send + 'static>;

/// Access to the designated affinity thread of a host application.
///
/// Implementations own the thread's run loop; the scheduler never touches it
/// directly.
pub trait AffinityContext: Send + Sync + 'static {
    /// Whether the affinity thread has been established yet.
    fn has_affinity_thread(&self) -> bool;

    /// Whether the calling thread is the affinity thread.
    fn is_on_affinity_thread(&self) -> bool;

    /// Suspend `continuation` until control transfers to the affinity thread.
    ///
    /// Always yields: the continuation never runs inside this call, even when
    /// the caller is already on the affinity thread. The host lets its run
    /// loop turn over at least once before running it.
    fn switch_to_affinity_thread(&self, continuation: Continuation) -> Result<()>;

    /// Drive a suspended future to completion on the affinity thread.
    ///
    /// Only called from the affinity thread, with futures that have already
    /// been polled once there.
    fn drive(&self, future: LocalBoxFuture<'static, ()>);
}
