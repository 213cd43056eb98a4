//! GenServer: request/reply dispatch over an Actor
//!
//! A `GenServer` routes three message kinds through one actor mailbox:
//! - `call`: the caller waits on a completion slot and observes handler errors
//! - `cast`: fire-and-forget; a handler error crashes the actor loop
//! - `info`: delivered to the `on_info` hook if one is installed, dropped otherwise
//!
//! Every handler failure is reported to the owning supervisor exactly once.
//! The state map is shared by identity across restarts.

use super::base_actor::{Actor, ActorContext, MessageHandler};
use super::{
    ActorError, ActorState, Envelope, GenServerError, HandlerError, SharedState, StateMap,
};
use crate::system::supervisor::{Supervised, Supervisor, SupervisorError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

/// Boxed future returned by method handlers
pub type HandlerFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Value, HandlerError>> + Send + 'a>>;

/// Boxed future returned by lifecycle hooks
pub type HookFuture<'a> = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>>;

type StateHook = Arc<dyn for<'a> Fn(&'a mut StateMap) -> HookFuture<'a> + Send + Sync>;
type InfoHook = Arc<dyn for<'a> Fn(Value, &'a mut StateMap) -> HookFuture<'a> + Send + Sync>;

/// Handler bound to one method name
#[async_trait]
pub trait MethodHandler: Send + Sync + 'static {
    async fn handle(&self, payload: Value, state: &mut StateMap) -> Result<Value, HandlerError>;
}

#[async_trait]
impl<F> MethodHandler for F
where
    F: for<'a> Fn(Value, &'a mut StateMap) -> HandlerFuture<'a> + Send + Sync + 'static,
{
    async fn handle(&self, payload: Value, state: &mut StateMap) -> Result<Value, HandlerError> {
        (self)(payload, state).await
    }
}

/// Optional lifecycle hooks of a GenServer
#[derive(Clone, Default)]
pub struct LifecycleHooks {
    /// Runs before the loop starts; failure aborts `start()`
    pub on_init: Option<StateHook>,
    /// Runs during `stop()` before the loop is cancelled
    pub on_terminate: Option<StateHook>,
    /// Invoked by the supervisor between stop and start of a restart
    pub on_restart: Option<StateHook>,
    pub on_info: Option<InfoHook>,
}

struct GenServerInner {
    name: String,
    state: SharedState,
    methods: HashMap<String, Arc<dyn MethodHandler>>,
    hooks: LifecycleHooks,
    actor: Actor<Envelope>,
    supervisor: Option<Weak<Supervisor>>,
    span: Span,
}

/// Cloneable handle to a GenServer
#[derive(Clone)]
pub struct GenServer {
    inner: Arc<GenServerInner>,
}

impl std::fmt::Debug for GenServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenServer")
            .field("name", &self.inner.name)
            .field("actor_state", &self.inner.actor.state())
            .field("methods", &self.inner.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Builder for [`GenServer`]
pub struct GenServerBuilder {
    name: String,
    supervisor: Option<Arc<Supervisor>>,
    initial_state: StateMap,
    methods: HashMap<String, Arc<dyn MethodHandler>>,
    hooks: LifecycleHooks,
    span: Option<Span>,
}

impl GenServerBuilder {
    /// Supervisor notified of failures; the server registers with it on `build()`
    pub fn supervisor(mut self, supervisor: &Arc<Supervisor>) -> Self {
        self.supervisor = Some(Arc::clone(supervisor));
        self
    }

    pub fn initial_state(mut self, state: StateMap) -> Self {
        self.initial_state = state;
        self
    }

    /// Register a handler closure for `method`
    pub fn handle<F>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        F: for<'a> Fn(Value, &'a mut StateMap) -> HandlerFuture<'a> + Send + Sync + 'static,
    {
        self.methods.insert(method.into(), Arc::new(handler));
        self
    }

    pub fn handle_with(mut self, method: impl Into<String>, handler: impl MethodHandler) -> Self {
        self.methods.insert(method.into(), Arc::new(handler));
        self
    }

    pub fn on_init<F>(mut self, hook: F) -> Self
    where
        F: for<'a> Fn(&'a mut StateMap) -> HookFuture<'a> + Send + Sync + 'static,
    {
        self.hooks.on_init = Some(Arc::new(hook));
        self
    }

    pub fn on_terminate<F>(mut self, hook: F) -> Self
    where
        F: for<'a> Fn(&'a mut StateMap) -> HookFuture<'a> + Send + Sync + 'static,
    {
        self.hooks.on_terminate = Some(Arc::new(hook));
        self
    }

    pub fn on_restart<F>(mut self, hook: F) -> Self
    where
        F: for<'a> Fn(&'a mut StateMap) -> HookFuture<'a> + Send + Sync + 'static,
    {
        self.hooks.on_restart = Some(Arc::new(hook));
        self
    }

    pub fn on_info<F>(mut self, hook: F) -> Self
    where
        F: for<'a> Fn(Value, &'a mut StateMap) -> HookFuture<'a> + Send + Sync + 'static,
    {
        self.hooks.on_info = Some(Arc::new(hook));
        self
    }

    /// Replace the default `gen_server` span
    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Construct the server and register it with its supervisor, if any
    pub fn build(self) -> Result<GenServer, SupervisorError> {
        let GenServerBuilder {
            name,
            supervisor,
            initial_state,
            methods,
            hooks,
            span,
        } = self;

        let span = span.unwrap_or_else(|| info_span!("gen_server", name = %name));

        let inner = Arc::new_cyclic(|weak: &Weak<GenServerInner>| {
            let dispatcher = Arc::new(Dispatcher {
                server: weak.clone(),
            });

            GenServerInner {
                actor: Actor::with_span(name.clone(), dispatcher, span.clone()),
                name,
                state: Arc::new(tokio::sync::Mutex::new(initial_state)),
                methods,
                hooks,
                supervisor: supervisor.as_ref().map(Arc::downgrade),
                span,
            }
        });

        let server = GenServer { inner };

        if let Some(supervisor) = supervisor {
            supervisor.register(Arc::new(server.clone()))?;
        }

        Ok(server)
    }
}

impl GenServer {
    pub fn builder(name: impl Into<String>) -> GenServerBuilder {
        GenServerBuilder {
            name: name.into(),
            supervisor: None,
            initial_state: StateMap::new(),
            methods: HashMap::new(),
            hooks: LifecycleHooks::default(),
            span: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Run `on_init` and spawn the processing loop
    pub async fn start(&self) -> Result<(), GenServerError> {
        if self.inner.actor.is_running() {
            return Err(ActorError::AlreadyRunning(self.inner.name.clone()).into());
        }

        if let Some(hook) = &self.inner.hooks.on_init {
            let mut state = self.inner.state.lock().await;
            hook(&mut *state)
                .await
                .map_err(|reason| GenServerError::InitFailed {
                    name: self.inner.name.clone(),
                    reason,
                })?;
        }

        self.inner.actor.start()?;
        info!(parent: &self.inner.span, "GenServer started");
        Ok(())
    }

    /// Run `on_terminate` and cancel the processing loop
    pub async fn stop(&self) {
        let acquired = self.inner.state.try_lock();

        match acquired {
            Ok(mut state) => {
                self.terminate(&mut state).await;
                drop(state);
                self.inner.actor.stop().await;
            }
            Err(_) => {
                // A handler holds the state; cancel it before terminating
                self.inner.actor.stop().await;
                let mut state = self.inner.state.lock().await;
                self.terminate(&mut state).await;
            }
        }

        info!(parent: &self.inner.span, "GenServer stopped");
    }

    async fn terminate(&self, state: &mut StateMap) {
        if let Some(hook) = &self.inner.hooks.on_terminate {
            if let Err(e) = hook(state).await {
                error!(parent: &self.inner.span, error = %e, "on_terminate hook failed");
            }
        }
    }

    /// Send a request and wait for its reply
    pub async fn call(&self, method: &str, payload: Value) -> Result<Value, GenServerError> {
        let (reply, response) = oneshot::channel();

        self.inner.actor.send(Envelope::Call {
            method: method.to_string(),
            payload,
            reply,
        })?;

        match response.await {
            Ok(result) => result.map_err(GenServerError::from),
            Err(_) => Err(GenServerError::Abandoned(self.inner.name.clone())),
        }
    }

    /// `call` bounded by a timeout. The request stays queued if it expires.
    pub async fn call_timeout(
        &self,
        method: &str,
        payload: Value,
        after: Duration,
    ) -> Result<Value, GenServerError> {
        tokio::time::timeout(after, self.call(method, payload))
            .await
            .map_err(|_| GenServerError::Timeout {
                name: self.inner.name.clone(),
                after,
            })?
    }

    pub fn cast(&self, method: &str, payload: Value) -> Result<(), GenServerError> {
        self.inner.actor.send(Envelope::Cast {
            method: method.to_string(),
            payload,
        })?;
        Ok(())
    }

    pub fn info(&self, payload: Value) -> Result<(), GenServerError> {
        self.inner.actor.send(Envelope::Info { payload })?;
        Ok(())
    }

    /// Report a self-detected fault to the supervisor, bypassing the mailbox
    pub fn fail(&self, reason: impl Into<String>) {
        report_failure(&self.inner, HandlerError::Failed(reason.into()));
    }

    /// Shared state handle; identity is stable across restarts
    pub fn state(&self) -> SharedState {
        Arc::clone(&self.inner.state)
    }

    pub async fn snapshot(&self) -> StateMap {
        self.inner.state.lock().await.clone()
    }

    pub fn actor_state(&self) -> ActorState {
        self.inner.actor.state()
    }

    pub fn is_running(&self) -> bool {
        self.inner.actor.is_running()
    }

    pub fn supervisor(&self) -> Option<Arc<Supervisor>> {
        self.inner.supervisor.as_ref().and_then(Weak::upgrade)
    }
}

#[async_trait]
impl Supervised for GenServer {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn start(&self) -> anyhow::Result<()> {
        GenServer::start(self).await?;
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        GenServer::stop(self).await;
        Ok(())
    }

    async fn on_restart(&self) -> anyhow::Result<()> {
        if let Some(hook) = &self.inner.hooks.on_restart {
            let mut state = self.inner.state.lock().await;
            hook(&mut *state).await?;
        }
        Ok(())
    }

    fn state(&self) -> Option<SharedState> {
        Some(Arc::clone(&self.inner.state))
    }
}

fn report_failure(server: &Arc<GenServerInner>, error: HandlerError) {
    let Some(supervisor) = server.supervisor.as_ref().and_then(Weak::upgrade) else {
        warn!(parent: &server.span, error = %error, "Failure not reported: no supervisor");
        return;
    };

    let child: Arc<dyn Supervised> = Arc::new(GenServer {
        inner: Arc::clone(server),
    });

    tokio::spawn(
        async move {
            supervisor.child_failed(child, error).await;
        }
        .instrument(server.span.clone()),
    );
}

/// Actor handler that routes envelopes to the server's method table
struct Dispatcher {
    server: Weak<GenServerInner>,
}

impl Dispatcher {
    async fn invoke(
        server: &GenServerInner,
        method: &str,
        payload: Value,
    ) -> Result<Value, HandlerError> {
        let handler = server
            .methods
            .get(method)
            .ok_or_else(|| HandlerError::unknown_method(method))?;

        let mut state = server.state.lock().await;
        handler.handle(payload, &mut state).await
    }

    fn crash(server: &Arc<GenServerInner>, error: HandlerError) -> ActorError {
        report_failure(server, error.clone());
        ActorError::Crashed {
            name: server.name.clone(),
            reason: error,
        }
    }
}

#[async_trait]
impl MessageHandler<Envelope> for Dispatcher {
    async fn handle(&self, context: &ActorContext, message: Envelope) -> Result<(), ActorError> {
        let server = self
            .server
            .upgrade()
            .ok_or_else(|| ActorError::Detached(context.name.clone()))?;

        match message {
            Envelope::Call {
                method,
                payload,
                reply,
            } => {
                let result = Self::invoke(&server, &method, payload).await;
                let failure = result.as_ref().err().cloned();

                if reply.send(result).is_err() {
                    debug!(method = %method, "Caller went away before the reply");
                }

                if let Some(error) = failure {
                    warn!(method = %method, error = %error, "Call handler failed");
                    report_failure(&server, error);
                }

                Ok(())
            }

            Envelope::Cast { method, payload } => {
                match Self::invoke(&server, &method, payload).await {
                    Ok(_) => Ok(()),
                    Err(error) => {
                        error!(method = %method, error = %error, "Cast handler failed");
                        Err(Self::crash(&server, error))
                    }
                }
            }

            Envelope::Info { payload } => {
                let Some(hook) = &server.hooks.on_info else {
                    debug!("Info message dropped: no on_info hook");
                    return Ok(());
                };

                let result = {
                    let mut state = server.state.lock().await;
                    hook(payload, &mut *state).await
                };

                result.map_err(|error| {
                    error!(error = %error, "on_info hook failed");
                    Self::crash(&server, error)
                })
            }
        }
    }
}
