//! Supervised Actor Runtime
//!
//! This crate provides fault-tolerant, supervised concurrent processes that
//! exchange messages through private mailboxes, in the style of OTP
//! supervision trees.
//!
//! # Architecture
//!
//! - **Actor**: private FIFO mailbox drained by one processing loop
//! - **GenServer**: call/cast/info dispatch over an actor, with lifecycle hooks
//! - **Supervisor**: restart strategies, exponential backoff and a lifetime
//!   restart budget per child
//! - **ActorSystem**: registry of supervisors and agents with broadcast and
//!   shutdown
//!
//! # Usage
//!
//! ```no_run
//! use orchestrator::{GenServer, HandlerError, RestartStrategy, Supervisor, SupervisorConfig};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let supervisor = Supervisor::new(
//!         "workers",
//!         SupervisorConfig::new(RestartStrategy::OneForOne, 3, Duration::from_millis(500)),
//!     )?;
//!
//!     let echo = GenServer::builder("echo")
//!         .supervisor(&supervisor)
//!         .handle("echo", |payload, _state| Box::pin(async move { Ok(payload) }))
//!         .handle("boom", |_payload, _state| {
//!             Box::pin(async move { Err(HandlerError::failed("boom")) })
//!         })
//!         .build()?;
//!
//!     supervisor.start_all().await?;
//!
//!     let reply = echo.call("echo", json!("hello")).await?;
//!     assert_eq!(reply, json!("hello"));
//!
//!     // Crashes the actor; the supervisor restarts it after the backoff
//!     echo.cast("boom", json!(null))?;
//!
//!     supervisor.stop_all().await;
//!     Ok(())
//! }
//! ```

pub mod actors;
pub mod system;

pub use actors::{
    Actor, ActorContext, ActorError, ActorState, Envelope, GenServer, GenServerBuilder,
    GenServerError, HandlerError, HandlerFuture, HookFuture, LifecycleHooks, MessageHandler,
    MessageKind, MethodHandler, SharedState, StateMap,
};
pub use system::{
    ActorSystem, BackoffPolicy, ChildStatus, DuplicateChildPolicy, FailureCallback,
    RestartStrategy, SupervisionStats, Supervised, Supervisor, SupervisorBuilder,
    SupervisorConfig, SupervisorError,
};
