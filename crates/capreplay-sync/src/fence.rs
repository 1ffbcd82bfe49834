use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures_intrusive::channel::shared::{oneshot_channel, OneshotReceiver};

/// Identifier of a rendezvous point inserted into the replayed stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FenceId(pub u32);

impl FenceId {
    /// Reserved identifier for the end-of-stream stop fence.
    ///
    /// Never produced from a command ordinal; callers deriving fence ids from ordinals must
    /// reject this value.
    pub const STOP: Self = Self(0x00de_aaad);

    pub fn is_stop(self) -> bool {
        self == Self::STOP
    }
}

impl fmt::Display for FenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_stop() {
            write!(f, "0x{:x} (stop)", self.0)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Notification from the replay device that it reached a fence wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FenceReady {
    pub fence: FenceId,
}

/// One-shot completion invoked when a fence is reported ready.
pub type FenceHandler = Box<dyn FnOnce(FenceReady) + Send>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FenceError {
    /// A ready notification arrived for a fence with no outstanding registration. This
    /// indicates a lost or duplicated registration on one side of the channel.
    #[error("fence {0} ready, but no completion is registered for it")]
    UnknownFence(FenceId),
    #[error("fence {0} already has an outstanding registration")]
    AlreadyRegistered(FenceId),
    #[error("fence {0} completion was dropped before the fence was signaled")]
    ChannelClosed(FenceId),
}

/// Maps outstanding fence ids to their one-shot completions.
///
/// Registration happens on the stream-processing thread; delivery happens on the notification
/// thread. Both paths take the same lock, and completions are invoked only after their entry
/// has been removed and the lock released, so a completion may freely register new fences.
#[derive(Default)]
pub struct FenceRegistry {
    pending: Mutex<HashMap<FenceId, FenceHandler>>,
}

impl fmt::Debug for FenceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut fences: Vec<_> = self.lock().keys().copied().collect();
        fences.sort_unstable();
        f.debug_struct("FenceRegistry")
            .field("pending", &fences)
            .finish()
    }
}

impl FenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` to run once when `fence` is reported ready.
    pub fn register(
        &self,
        fence: FenceId,
        handler: impl FnOnce(FenceReady) + Send + 'static,
    ) -> Result<(), FenceError> {
        let mut pending = self.lock();
        if pending.contains_key(&fence) {
            return Err(FenceError::AlreadyRegistered(fence));
        }
        pending.insert(fence, Box::new(handler));
        tracing::debug!(%fence, "registered fence completion");
        Ok(())
    }

    /// Register a channel-backed completion for `fence` and return its receiving end.
    pub fn register_waiter(&self, fence: FenceId) -> Result<FenceWaiter, FenceError> {
        let (sender, receiver) = oneshot_channel();
        self.register(fence, move |ready| {
            // The waiter may have been dropped; the fence is consumed either way.
            sender.send(ready).ok();
        })?;
        Ok(FenceWaiter { fence, receiver })
    }

    /// Deliver a ready notification, consuming the registration and running its completion.
    pub fn deliver(&self, ready: FenceReady) -> Result<(), FenceError> {
        let handler = self.lock().remove(&ready.fence);
        let Some(handler) = handler else {
            tracing::error!(fence = %ready.fence, "ready notification for unregistered fence");
            return Err(FenceError::UnknownFence(ready.fence));
        };
        tracing::debug!(fence = %ready.fence, "fence ready");
        handler(ready);
        Ok(())
    }

    /// Drop the registration for `fence` without running it. Returns `false` if nothing was
    /// registered.
    pub fn cancel(&self, fence: FenceId) -> bool {
        let removed = self.lock().remove(&fence).is_some();
        if removed {
            tracing::debug!(%fence, "cancelled fence completion");
        }
        removed
    }

    pub fn is_registered(&self, fence: FenceId) -> bool {
        self.lock().contains_key(&fence)
    }

    /// Number of registrations that have not been delivered yet.
    pub fn outstanding(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<FenceId, FenceHandler>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Receiving end of a channel-backed fence registration.
pub struct FenceWaiter {
    fence: FenceId,
    receiver: OneshotReceiver<FenceReady>,
}

impl fmt::Debug for FenceWaiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FenceWaiter")
            .field("fence", &self.fence)
            .finish_non_exhaustive()
    }
}

impl FenceWaiter {
    pub fn fence(&self) -> FenceId {
        self.fence
    }

    /// Await the ready notification.
    pub async fn receive(self) -> Result<FenceReady, FenceError> {
        self.receiver
            .receive()
            .await
            .ok_or(FenceError::ChannelClosed(self.fence))
    }

    /// Block the calling thread until the ready notification arrives.
    pub fn wait(self) -> Result<FenceReady, FenceError> {
        pollster::block_on(self.receive())
    }
}
