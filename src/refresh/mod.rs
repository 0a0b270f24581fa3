//! Credential refresh coordination and request replay.

pub mod coordinator;
pub mod queue;

#[cfg(test)]
pub(crate) mod testing;

pub use coordinator::{Phase, RefreshCoordinator};
pub use queue::{PendingReplay, PendingRequest, ReplayQueue};
