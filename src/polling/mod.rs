pub mod coordinator;
pub mod lease;
pub mod lock;

pub use coordinator::{CoordinatorError, CoordinatorState, PollingCoordinator, StopReason};
pub use lease::{Lease, LeaseError, LeaseStore, RedisLeaseStore, RenewOutcome};
pub use lock::{FileLock, LockError, LockHandle, PollLock};
