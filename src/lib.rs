//! Replay-side stream rewriting and fence-synchronized tracing.
//!
//! See [`transform`] for the command model and transforms, and [`sync`] for the signals and
//! fence registry that connect the replayed stream to the orchestrator.

pub use capreplay_sync as sync;
pub use capreplay_transform as transform;
