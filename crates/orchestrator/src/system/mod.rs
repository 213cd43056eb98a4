//! Actor System Core
//!
//! This module provides supervision (restart strategies, backoff, restart
//! budgets) and the ActorSystem registry.

pub mod actor_system;
pub mod supervisor;

pub use actor_system::ActorSystem;
pub use supervisor::{
    BackoffPolicy, ChildStatus, DuplicateChildPolicy, FailureCallback, FailureFuture,
    RestartStrategy, SupervisionStats, Supervised, Supervisor, SupervisorBuilder,
    SupervisorConfig, SupervisorError,
};
