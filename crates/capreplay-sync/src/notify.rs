use std::io;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::fence::{FenceError, FenceReady, FenceRegistry};

/// Spawn the thread that delivers replay-device notifications to `registry`.
///
/// The loop runs until every sender of `events` has been dropped. A notification for an
/// unregistered fence is a protocol error and ends the loop with
/// [`FenceError::UnknownFence`].
///
/// Completions run on this thread and may block it (e.g. waiting for a tracing backend to
/// become ready), which holds back delivery of later notifications.
pub fn spawn_notification_loop(
    registry: Arc<FenceRegistry>,
    events: Receiver<FenceReady>,
) -> io::Result<JoinHandle<Result<(), FenceError>>> {
    thread::Builder::new()
        .name("capreplay-fence-notify".into())
        .spawn(move || {
            for ready in events {
                registry.deliver(ready)?;
            }
            tracing::debug!("notification channel closed");
            Ok(())
        })
}
