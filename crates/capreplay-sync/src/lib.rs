//! Coordination primitives shared by the replay orchestrator and the replay-device
//! notification channel.
//!
//! This crate has no knowledge of commands or replay state. It provides:
//! - [`Signal`]: a one-shot, monotonic boolean event with a blocking wait.
//! - [`FenceRegistry`]: a map from [`FenceId`] to a one-shot completion, consumed when the
//!   replay device reports the fence as ready.
//! - [`spawn_notification_loop`]: a named thread that drains `FenceReady` events and delivers
//!   them to a registry.

#![deny(unsafe_code)]

mod fence;
mod notify;
mod signal;

pub use fence::{FenceError, FenceHandler, FenceId, FenceReady, FenceRegistry, FenceWaiter};
pub use notify::spawn_notification_loop;
pub use signal::Signal;
