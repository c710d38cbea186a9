//! Sync coordination
//!
//! [`SyncCoordinator`] ties a document to the local store and an optional
//! remote channel: it captures local changes durably, pushes them on a
//! throttle, applies peer deltas, and compacts the op log into snapshots.

mod coordinator;
mod status;
mod throttle;

pub use coordinator::{SyncCoordinator, SyncCoordinatorBuilder, PUSH_THROTTLE};
pub use status::{LifecycleEvent, SyncEvent, SyncStatus};
pub use throttle::Throttle;
