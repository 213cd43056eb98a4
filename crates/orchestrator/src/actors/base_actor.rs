//! Base Actor and Context
//!
//! An `Actor` owns a private unbounded FIFO mailbox and drives exactly one
//! processing loop over it. Handlers run to completion one at a time; an error
//! escaping a handler terminates the loop and leaves the actor `Crashed` until
//! it is started again. The mailbox survives restarts, so messages queued while
//! the loop is down are processed once it is back.

use super::{ActorError, ActorState};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, warn, Instrument, Span};

/// Processes the messages of one actor
#[async_trait]
pub trait MessageHandler<M: Send + 'static>: Send + Sync + 'static {
    /// Handle a single message. Returning an error terminates the loop.
    async fn handle(&self, context: &ActorContext, message: M) -> Result<(), ActorError>;
}

/// Runtime information handed to the message handler
#[derive(Debug, Clone)]
pub struct ActorContext {
    pub name: String,
}

struct RunHandle {
    token: CancellationToken,
    join: JoinHandle<Result<(), ActorError>>,
}

/// Sequential message-processing unit
pub struct Actor<M: Send + 'static> {
    name: String,
    sender: mpsc::UnboundedSender<M>,
    mailbox: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<M>>>,
    handler: Arc<dyn MessageHandler<M>>,
    run: parking_lot::Mutex<Option<RunHandle>>,
    state: Arc<parking_lot::Mutex<ActorState>>,
    span: Span,
}

impl<M: Send + 'static> Actor<M> {
    pub fn new(name: impl Into<String>, handler: Arc<dyn MessageHandler<M>>) -> Self {
        let name = name.into();
        let span = info_span!("actor", name = %name);
        Self::with_span(name, handler, span)
    }

    /// Create an actor whose loop is instrumented with the given span
    pub fn with_span(
        name: impl Into<String>,
        handler: Arc<dyn MessageHandler<M>>,
        span: Span,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();

        Self {
            name: name.into(),
            sender,
            mailbox: Arc::new(tokio::sync::Mutex::new(receiver)),
            handler,
            run: parking_lot::Mutex::new(None),
            state: Arc::new(parking_lot::Mutex::new(ActorState::Idle)),
            span,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the processing loop.
    ///
    /// Must be called from within a tokio runtime. Fails if a loop spawned
    /// earlier is still active.
    pub fn start(&self) -> Result<(), ActorError> {
        let mut run = self.run.lock();

        if let Some(handle) = run.as_ref() {
            if !handle.join.is_finished() {
                return Err(ActorError::AlreadyRunning(self.name.clone()));
            }
        }

        let token = CancellationToken::new();
        *self.state.lock() = ActorState::Running;

        let join = tokio::spawn(
            run_loop(
                ActorContext {
                    name: self.name.clone(),
                },
                Arc::clone(&self.mailbox),
                Arc::clone(&self.handler),
                token.clone(),
                Arc::clone(&self.state),
            )
            .instrument(self.span.clone()),
        );

        *run = Some(RunHandle { token, join });
        debug!(parent: &self.span, "Actor loop spawned");
        Ok(())
    }

    /// Enqueue a message. Never blocks.
    pub fn send(&self, message: M) -> Result<(), ActorError> {
        self.sender
            .send(message)
            .map_err(|_| ActorError::MailboxClosed(self.name.clone()))
    }

    /// Cancel the active loop and wait for it to unwind.
    ///
    /// Cancelling an in-flight handler is expected and not reported. A loop
    /// that already crashed or panicked is logged, never returned.
    pub async fn stop(&self) {
        let handle = self.run.lock().take();

        if let Some(RunHandle { token, join }) = handle {
            token.cancel();

            match join.await {
                Ok(Ok(())) => {
                    debug!(parent: &self.span, "Actor loop stopped");
                }
                Ok(Err(e)) => {
                    warn!(
                        parent: &self.span,
                        error = %e,
                        "Actor loop had already terminated with an error"
                    );
                }
                Err(e) if e.is_cancelled() => {
                    debug!(parent: &self.span, "Actor loop cancelled during shutdown");
                }
                Err(e) => {
                    error!(parent: &self.span, error = %e, "Actor loop panicked");
                }
            }
        }

        *self.state.lock() = ActorState::Stopped;
    }

    pub fn state(&self) -> ActorState {
        let state = *self.state.lock();

        // A panicking handler never reaches the loop's own bookkeeping
        if state == ActorState::Running {
            let finished = self
                .run
                .lock()
                .as_ref()
                .map_or(true, |handle| handle.join.is_finished());
            if finished {
                return ActorState::Crashed;
            }
        }

        state
    }

    pub fn is_running(&self) -> bool {
        self.state() == ActorState::Running
    }

    /// Number of messages waiting in the mailbox while no loop holds it
    pub fn pending(&self) -> usize {
        self.mailbox
            .try_lock()
            .map(|receiver| receiver.len())
            .unwrap_or(0)
    }
}

impl<M: Send + 'static> Drop for Actor<M> {
    fn drop(&mut self) {
        if let Some(handle) = self.run.get_mut().as_ref() {
            handle.token.cancel();
        }
    }
}

async fn run_loop<M: Send + 'static>(
    context: ActorContext,
    mailbox: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<M>>>,
    handler: Arc<dyn MessageHandler<M>>,
    token: CancellationToken,
    state: Arc<parking_lot::Mutex<ActorState>>,
) -> Result<(), ActorError> {
    let mut receiver = tokio::select! {
        biased;
        _ = token.cancelled() => return Ok(()),
        guard = mailbox.lock_owned() => guard,
    };

    debug!("Actor loop started");

    let result = loop {
        let message = tokio::select! {
            biased;
            _ = token.cancelled() => break Ok(()),
            message = receiver.recv() => message,
        };

        let Some(message) = message else {
            debug!("Mailbox closed");
            break Ok(());
        };

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => break Ok(()),
            outcome = handler.handle(&context, message) => outcome,
        };

        if let Err(e) = outcome {
            break Err(e);
        }
    };
    drop(receiver);

    match &result {
        Ok(()) => *state.lock() = ActorState::Stopped,
        Err(e) => {
            *state.lock() = ActorState::Crashed;
            error!(error = %e, "Actor loop terminated abnormally");
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::HandlerError;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    #[derive(Debug)]
    enum TestMessage {
        Record(u32),
        Fail,
        Hang,
    }

    struct Recorder {
        seen: mpsc::UnboundedSender<u32>,
        hanging: mpsc::UnboundedSender<()>,
    }

    #[async_trait]
    impl MessageHandler<TestMessage> for Recorder {
        async fn handle(
            &self,
            context: &ActorContext,
            message: TestMessage,
        ) -> Result<(), ActorError> {
            match message {
                TestMessage::Record(value) => {
                    tokio::task::yield_now().await;
                    let _ = self.seen.send(value);
                    Ok(())
                }
                TestMessage::Fail => Err(ActorError::Crashed {
                    name: context.name.clone(),
                    reason: HandlerError::failed("requested failure"),
                }),
                TestMessage::Hang => {
                    let _ = self.hanging.send(());
                    std::future::pending::<()>().await;
                    Ok(())
                }
            }
        }
    }

    fn recorder_actor() -> (
        Actor<TestMessage>,
        mpsc::UnboundedReceiver<u32>,
        mpsc::UnboundedReceiver<()>,
    ) {
        let (seen, seen_rx) = mpsc::unbounded_channel();
        let (hanging, hanging_rx) = mpsc::unbounded_channel();
        let actor = Actor::new("recorder", Arc::new(Recorder { seen, hanging }));
        (actor, seen_rx, hanging_rx)
    }

    async fn wait_for_state(actor: &Actor<TestMessage>, expected: ActorState) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while actor.state() != expected {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("actor never reached expected state");
    }

    #[tokio::test]
    async fn test_messages_are_handled_in_send_order() {
        let (actor, mut seen, _hanging) = recorder_actor();
        assert_eq!(actor.state(), ActorState::Idle);

        actor.start().unwrap();
        for value in 0..20 {
            actor.send(TestMessage::Record(value)).unwrap();
        }

        let mut received = Vec::new();
        for _ in 0..20 {
            received.push(seen.recv().await.unwrap());
        }
        assert_eq!(received, (0..20).collect::<Vec<_>>());

        actor.stop().await;
        assert_eq!(actor.state(), ActorState::Stopped);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let (actor, _seen, _hanging) = recorder_actor();
        assert_ok!(actor.start());

        let err = assert_err!(actor.start());
        assert!(matches!(err, ActorError::AlreadyRunning(name) if name == "recorder"));

        actor.stop().await;
        assert_ok!(actor.start());
        assert!(actor.is_running());
        actor.stop().await;
    }

    #[tokio::test]
    async fn test_handler_error_crashes_loop_and_keeps_mailbox() {
        let (actor, mut seen, _hanging) = recorder_actor();
        actor.start().unwrap();

        actor.send(TestMessage::Fail).unwrap();
        actor.send(TestMessage::Record(7)).unwrap();
        wait_for_state(&actor, ActorState::Crashed).await;

        assert!(seen.try_recv().is_err());
        assert_eq!(actor.pending(), 1);

        // Restarting resumes the same mailbox
        actor.start().unwrap();
        assert_eq!(seen.recv().await, Some(7));
        actor.stop().await;
    }

    #[tokio::test]
    async fn test_stop_cancels_in_flight_handler() {
        let (actor, mut seen, mut hanging) = recorder_actor();
        actor.start().unwrap();

        actor.send(TestMessage::Hang).unwrap();
        actor.send(TestMessage::Record(1)).unwrap();
        hanging.recv().await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), actor.stop())
            .await
            .expect("stop must not wait for a hanging handler");

        assert_eq!(actor.state(), ActorState::Stopped);
        assert!(seen.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let (actor, _seen, _hanging) = recorder_actor();
        actor.stop().await;
        assert_eq!(actor.state(), ActorState::Stopped);
        assert!(actor.send(TestMessage::Record(1)).is_ok());
    }
}
