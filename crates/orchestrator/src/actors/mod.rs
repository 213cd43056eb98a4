//! Actor Core Components
//!
//! This module provides the building blocks supervised processes are made of:
//! - `Actor`: a private FIFO mailbox drained by a single processing loop
//! - `GenServer`: call/cast/info dispatch over an actor, with lifecycle hooks
//! - `Envelope`: the tagged union of message kinds a GenServer routes
//! - Error types shared by both layers

pub mod base_actor;
pub mod gen_server;

pub use base_actor::{Actor, ActorContext, MessageHandler};
pub use gen_server::{
    GenServer, GenServerBuilder, HandlerFuture, HookFuture, LifecycleHooks, MethodHandler,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Keyed state owned by a GenServer and handed to its handlers and hooks
pub type StateMap = HashMap<String, Value>;

/// Shared handle to a GenServer's state map.
///
/// The same allocation lives for the whole lifetime of the server, across
/// supervisor restarts.
pub type SharedState = Arc<tokio::sync::Mutex<StateMap>>;

/// Completion slot resolved exactly once by the dispatching actor
pub type ReplySlot = oneshot::Sender<Result<Value, HandlerError>>;

/// Kinds of messages a GenServer understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Call,
    Cast,
    Info,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Call => write!(f, "call"),
            MessageKind::Cast => write!(f, "cast"),
            MessageKind::Info => write!(f, "info"),
        }
    }
}

/// A single message in a GenServer mailbox.
///
/// Created per send and consumed exactly once by the owning actor's loop.
#[derive(Debug)]
pub enum Envelope {
    /// Request expecting a reply through `reply`
    Call {
        method: String,
        payload: Value,
        reply: ReplySlot,
    },

    /// Fire-and-forget request
    Cast { method: String, payload: Value },

    /// Out-of-band notification, only delivered when an `on_info` hook exists
    Info { payload: Value },
}

impl Envelope {
    pub fn kind(&self) -> MessageKind {
        match self {
            Envelope::Call { .. } => MessageKind::Call,
            Envelope::Cast { .. } => MessageKind::Cast,
            Envelope::Info { .. } => MessageKind::Info,
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Envelope::Call { method, .. } | Envelope::Cast { method, .. } => Some(method),
            Envelope::Info { .. } => None,
        }
    }
}

/// Lifecycle state of an actor's processing loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorState {
    /// Constructed, never started
    Idle,

    /// Loop is active and draining the mailbox
    Running,

    /// Loop terminated abnormally; the mailbox no longer advances
    Crashed,

    /// Loop was cancelled by `stop()`
    Stopped,
}

impl fmt::Display for ActorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActorState::Idle => write!(f, "idle"),
            ActorState::Running => write!(f, "running"),
            ActorState::Crashed => write!(f, "crashed"),
            ActorState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Failure raised inside a user handler or hook.
///
/// Cloneable because the same failure is delivered both to the waiting caller
/// and to the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    #[error("unknown method '{method}'")]
    UnknownMethod { method: String },

    #[error("{0}")]
    Failed(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl HandlerError {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }

    pub fn unknown_method(method: impl Into<String>) -> Self {
        Self::UnknownMethod {
            method: method.into(),
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(error: serde_json::Error) -> Self {
        HandlerError::InvalidPayload(error.to_string())
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(error: anyhow::Error) -> Self {
        HandlerError::Failed(format!("{error:#}"))
    }
}

/// Actor-level errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ActorError {
    #[error("Actor {0} already running")]
    AlreadyRunning(String),

    /// Unreachable while the actor keeps its own receiver; kept so `send`
    /// never has to discard a channel error
    #[error("Mailbox of actor {0} is closed")]
    MailboxClosed(String),

    #[error("Actor {name} crashed: {reason}")]
    Crashed { name: String, reason: HandlerError },

    #[error("Actor {0} outlived the server it dispatches for")]
    Detached(String),
}

/// Errors observed by GenServer callers
#[derive(Debug, Clone, thiserror::Error)]
pub enum GenServerError {
    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error("Call to {0} was abandoned before a reply was sent")]
    Abandoned(String),

    #[error("Call to {name} timed out after {after:?}")]
    Timeout { name: String, after: Duration },

    #[error("GenServer {name} failed to initialize: {reason}")]
    InitFailed { name: String, reason: HandlerError },

    #[error(transparent)]
    Actor(#[from] ActorError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_kind_and_method() {
        let (reply, _rx) = oneshot::channel();
        let call = Envelope::Call {
            method: "get".into(),
            payload: Value::Null,
            reply,
        };
        assert_eq!(call.kind(), MessageKind::Call);
        assert_eq!(call.method(), Some("get"));

        let info = Envelope::Info {
            payload: Value::Bool(true),
        };
        assert_eq!(info.kind(), MessageKind::Info);
        assert_eq!(info.method(), None);
    }

    #[test]
    fn test_handler_error_from_json_error() {
        let err = serde_json::from_str::<u32>("not a number").unwrap_err();
        let handler_err: HandlerError = err.into();
        assert!(matches!(handler_err, HandlerError::InvalidPayload(_)));
    }

    #[test]
    fn test_error_messages_name_the_actor() {
        let err = ActorError::Crashed {
            name: "worker".into(),
            reason: HandlerError::unknown_method("frobnicate"),
        };
        let text = err.to_string();
        assert!(text.contains("worker"));
        assert!(text.contains("frobnicate"));

        let err = GenServerError::Timeout {
            name: "worker".into(),
            after: Duration::from_millis(250),
        };
        assert!(err.to_string().contains("250ms"));
    }

    #[test]
    fn test_message_kind_serialization() {
        let json = serde_json::to_string(&MessageKind::Cast).unwrap();
        assert_eq!(json, "\"cast\"");
        assert_eq!(ActorState::Crashed.to_string(), "crashed");
    }
}
