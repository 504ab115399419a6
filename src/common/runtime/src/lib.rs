//! Runtime utilities for Weft.
//!
//! Provides the coordination substrate partition tasks share:
//!
//! - [`CancellationHandle`] / [`CancellationToken`] / [`CancellationState`]:
//!   external and internal cancellation merged into one observed token
//! - [`Monitor`], [`CountdownEvent`], [`IntValueEvent`], [`Rendezvous`]:
//!   blocking waits that wake promptly on cancellation
//! - [`QueryTaskGroupState`]: worker lifecycle, fault capture and the
//!   exactly-once query end

mod cancellation;
mod sync;
mod task_group;

pub use cancellation::{
    CancellationHandle, CancellationRegistration, CancellationState, CancellationToken,
};
pub use sync::{CountdownEvent, IntValueEvent, Monitor, Rendezvous};
pub use task_group::{QueryTaskGroupState, next_query_id, panic_message, run_guarded};
