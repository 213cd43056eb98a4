//! Supervisor Implementation for Fault Tolerance
//!
//! This module implements the Supervisor pattern: a named registry of
//! children, a lifetime restart ledger, restart strategies and backoff
//! policies. A restart cycle is `stop -> on_restart -> start` applied to the
//! same child objects, so child state keeps its identity.

use crate::actors::{HandlerError, SharedState};
use async_trait::async_trait;
use common::OperationTimer;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

/// Capability set a collaborator must provide to be supervised
#[async_trait]
pub trait Supervised: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn start(&self) -> anyhow::Result<()>;

    async fn stop(&self) -> anyhow::Result<()>;

    /// Called between stop and start of a restart cycle
    async fn on_restart(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// State retained across restarts, if the child has one.
    ///
    /// A restart that hands back a different state object fails.
    fn state(&self) -> Option<SharedState> {
        None
    }
}

/// Which children are restarted when one fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartStrategy {
    /// Only the failed child
    #[default]
    OneForOne,

    /// Every registered child, in registration order
    OneForAll,

    /// The failed child and every child registered after it
    RestForOne,
}

impl fmt::Display for RestartStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartStrategy::OneForOne => write!(f, "one_for_one"),
            RestartStrategy::OneForAll => write!(f, "one_for_all"),
            RestartStrategy::RestForOne => write!(f, "rest_for_one"),
        }
    }
}

/// Backoff policies for restart delays
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// No delay between restarts
    None,

    /// Fixed delay between restarts
    Fixed(Duration),

    /// `initial_delay * multiplier^count`, optionally capped
    Exponential {
        initial_delay: Duration,
        multiplier: f64,
        #[serde(default)]
        max_delay: Option<Duration>,
    },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::exponential(Duration::from_millis(500))
    }
}

impl BackoffPolicy {
    /// Doubling backoff starting at `base`, uncapped
    pub fn exponential(base: Duration) -> Self {
        BackoffPolicy::Exponential {
            initial_delay: base,
            multiplier: 2.0,
            max_delay: None,
        }
    }

    /// Delay before a restart, given the restart count before this failure
    pub fn delay_for(&self, count: u32) -> Duration {
        match self {
            BackoffPolicy::None => Duration::ZERO,
            BackoffPolicy::Fixed(delay) => *delay,
            BackoffPolicy::Exponential {
                initial_delay,
                multiplier,
                max_delay,
            } => {
                let exponent = count.min(i32::MAX as u32) as i32;
                let secs = initial_delay.as_secs_f64() * multiplier.powi(exponent);
                let delay = Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);

                match max_delay {
                    Some(cap) => delay.min(*cap),
                    None => delay,
                }
            }
        }
    }

    /// Reject policies whose delays would not grow monotonically
    pub fn validate(&self) -> Result<(), SupervisorError> {
        let BackoffPolicy::Exponential {
            initial_delay,
            multiplier,
            max_delay,
        } = self
        else {
            return Ok(());
        };

        if !multiplier.is_finite() || *multiplier < 1.0 {
            return Err(SupervisorError::InvalidConfig(format!(
                "backoff multiplier must be a finite number >= 1.0, got {multiplier}"
            )));
        }

        if let Some(cap) = max_delay {
            if cap < initial_delay {
                return Err(SupervisorError::InvalidConfig(format!(
                    "backoff max_delay {cap:?} is below initial_delay {initial_delay:?}"
                )));
            }
        }

        Ok(())
    }
}

/// What happens when a second child registers under an existing name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateChildPolicy {
    /// Replace the earlier child in place, keeping its restart count
    #[default]
    Replace,

    /// Refuse the registration
    Reject,
}

/// Configuration for a supervisor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub strategy: RestartStrategy,
    /// Lifetime restart budget per child; never reset
    pub max_restarts: u32,
    pub backoff: BackoffPolicy,
    pub duplicate_children: DuplicateChildPolicy,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            strategy: RestartStrategy::OneForOne,
            max_restarts: 3,
            backoff: BackoffPolicy::default(),
            duplicate_children: DuplicateChildPolicy::Replace,
        }
    }
}

impl SupervisorConfig {
    pub fn new(strategy: RestartStrategy, max_restarts: u32, backoff_base: Duration) -> Self {
        Self {
            strategy,
            max_restarts,
            backoff: BackoffPolicy::exponential(backoff_base),
            ..Self::default()
        }
    }

    /// Parse and validate a JSON config; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self, SupervisorError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| SupervisorError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SupervisorError> {
        self.backoff.validate()
    }
}

/// Supervisor errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum SupervisorError {
    #[error("Invalid supervisor config: {0}")]
    InvalidConfig(String),

    #[error("Invalid child: {0}")]
    InvalidChild(String),

    #[error("Child {0} is already registered")]
    DuplicateChild(String),

    #[error("Child {name} failed to start: {reason}")]
    StartFailed { name: String, reason: String },
}

/// A child's lifecycle as seen by its supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildStatus {
    Registered,
    Running,
    Restarting,
    /// Restart budget exhausted; terminal
    PermanentlyFailed,
    /// Stopped by `stop_all` or a restart that could not start it again
    Stopped,
}

/// Supervision statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisionStats {
    pub supervised_children: usize,
    pub total_restarts: u32,
    pub permanently_failed: usize,
}

pub type FailureFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Invoked with the child name and error once a child's restart budget is spent
pub type FailureCallback = Arc<dyn Fn(String, HandlerError) -> FailureFuture + Send + Sync>;

struct SupervisedChild {
    child: Arc<dyn Supervised>,
    status: ChildStatus,
}

#[derive(Default)]
struct Registry {
    children: Vec<SupervisedChild>,
    restart_counts: HashMap<String, u32>,
    restarting: HashSet<String>,
}

impl Registry {
    fn position(&self, name: &str) -> Option<usize> {
        self.children.iter().position(|c| c.child.name() == name)
    }

    fn set_status(&mut self, name: &str, status: ChildStatus) {
        if let Some(index) = self.position(name) {
            self.children[index].status = status;
        }
    }
}

enum FailureDecision {
    AlreadyRestarting,
    BudgetExhausted,
    Restart { count: u32 },
}

/// Owner of a restart policy for a set of named children
pub struct Supervisor {
    name: String,
    config: SupervisorConfig,
    notify_failure: Option<FailureCallback>,
    registry: parking_lot::Mutex<Registry>,
    span: Span,
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("children", &self.children())
            .finish()
    }
}

/// Builder for [`Supervisor`]
pub struct SupervisorBuilder {
    name: String,
    config: SupervisorConfig,
    notify_failure: Option<FailureCallback>,
    span: Option<Span>,
}

impl SupervisorBuilder {
    pub fn config(mut self, config: SupervisorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn strategy(mut self, strategy: RestartStrategy) -> Self {
        self.config.strategy = strategy;
        self
    }

    pub fn max_restarts(mut self, max_restarts: u32) -> Self {
        self.config.max_restarts = max_restarts;
        self
    }

    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.config.backoff = backoff;
        self
    }

    pub fn notify_failure<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(String, HandlerError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.notify_failure = Some(Arc::new(
            move |name: String, error: HandlerError| -> FailureFuture {
                Box::pin(callback(name, error))
            },
        ));
        self
    }

    /// Replace the default `supervisor` span
    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn build(self) -> Result<Arc<Supervisor>, SupervisorError> {
        self.config.validate()?;

        let span = self
            .span
            .unwrap_or_else(|| info_span!("supervisor", name = %self.name));

        Ok(Arc::new(Supervisor {
            name: self.name,
            config: self.config,
            notify_failure: self.notify_failure,
            registry: parking_lot::Mutex::new(Registry::default()),
            span,
        }))
    }
}

/// Removes a child from the restarting set when a restart cycle ends
struct RestartingGuard<'a> {
    supervisor: &'a Supervisor,
    name: String,
}

impl Drop for RestartingGuard<'_> {
    fn drop(&mut self) {
        self.supervisor.registry.lock().restarting.remove(&self.name);
    }
}

impl Supervisor {
    pub fn new(
        name: impl Into<String>,
        config: SupervisorConfig,
    ) -> Result<Arc<Self>, SupervisorError> {
        Self::builder(name).config(config).build()
    }

    pub fn builder(name: impl Into<String>) -> SupervisorBuilder {
        SupervisorBuilder {
            name: name.into(),
            config: SupervisorConfig::default(),
            notify_failure: None,
            span: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Attach a child under its name
    pub fn register(&self, child: Arc<dyn Supervised>) -> Result<(), SupervisorError> {
        let name = child.name().to_string();
        if name.trim().is_empty() {
            return Err(SupervisorError::InvalidChild(
                "child name must not be empty".to_string(),
            ));
        }

        let mut registry = self.registry.lock();

        match registry.position(&name) {
            Some(index) => match self.config.duplicate_children {
                DuplicateChildPolicy::Reject => {
                    return Err(SupervisorError::DuplicateChild(name));
                }
                DuplicateChildPolicy::Replace => {
                    warn!(parent: &self.span, child = %name, "Replacing already registered child");
                    registry.children[index] = SupervisedChild {
                        child,
                        status: ChildStatus::Registered,
                    };
                }
            },
            None => {
                debug!(parent: &self.span, child = %name, "Registering child");
                registry.children.push(SupervisedChild {
                    child,
                    status: ChildStatus::Registered,
                });
            }
        }

        Ok(())
    }

    /// Handle a failure report for `child`
    pub async fn child_failed(&self, child: Arc<dyn Supervised>, error: HandlerError) {
        let name = child.name().to_string();

        let decision = {
            let mut registry = self.registry.lock();
            let count = registry.restart_counts.get(&name).copied().unwrap_or(0);

            if registry.restarting.contains(&name) {
                FailureDecision::AlreadyRestarting
            } else if count >= self.config.max_restarts {
                registry.set_status(&name, ChildStatus::PermanentlyFailed);
                FailureDecision::BudgetExhausted
            } else {
                registry.restart_counts.insert(name.clone(), count + 1);
                registry.restarting.insert(name.clone());
                registry.set_status(&name, ChildStatus::Restarting);
                FailureDecision::Restart { count }
            }
        };

        let count = match decision {
            FailureDecision::AlreadyRestarting => {
                debug!(
                    parent: &self.span,
                    child = %name,
                    error = %error,
                    "Child already restarting; failure ignored"
                );
                return;
            }
            FailureDecision::BudgetExhausted => {
                error!(
                    parent: &self.span,
                    child = %name,
                    error = %error,
                    max_restarts = self.config.max_restarts,
                    "Restart budget exhausted; child permanently failed"
                );
                if let Some(notify) = &self.notify_failure {
                    notify(name, error).await;
                }
                return;
            }
            FailureDecision::Restart { count } => count,
        };

        let _guard = RestartingGuard {
            supervisor: self,
            name: name.clone(),
        };

        let delay = self.config.backoff.delay_for(count);
        warn!(
            parent: &self.span,
            child = %name,
            error = %error,
            attempt = count + 1,
            delay = ?delay,
            "Child failed; scheduling restart"
        );

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut timer = OperationTimer::new("supervisor_restart");
        timer.add_field("supervisor", &self.name);
        timer.add_field("child", &name);
        timer.add_field("strategy", self.config.strategy);
        timer.add_field("attempt", count + 1);

        let result = self
            .restart_targets(child)
            .instrument(self.span.clone())
            .await;
        timer.finish_with_result(&result);
    }

    /// Children to restart for a failure of `child`, in restart order.
    ///
    /// Permanently failed siblings are left alone.
    fn targets_for(&self, child: Arc<dyn Supervised>) -> Vec<Arc<dyn Supervised>> {
        let registry = self.registry.lock();
        let Some(index) = registry.position(child.name()) else {
            warn!(
                parent: &self.span,
                child = %child.name(),
                "Failed child is not registered; restarting it alone"
            );
            return vec![child];
        };

        let group = match self.config.strategy {
            RestartStrategy::OneForOne => return vec![child],
            RestartStrategy::OneForAll => &registry.children[..],
            RestartStrategy::RestForOne => &registry.children[index..],
        };

        group
            .iter()
            .filter(|c| {
                c.child.name() == child.name() || c.status != ChildStatus::PermanentlyFailed
            })
            .map(|c| Arc::clone(&c.child))
            .collect()
    }

    async fn restart_targets(&self, child: Arc<dyn Supervised>) -> anyhow::Result<()> {
        for target in self.targets_for(child) {
            self.restart(target.as_ref()).await?;
        }
        Ok(())
    }

    /// Stop the child, run its `on_restart` hook, then start it again
    pub async fn restart(&self, child: &dyn Supervised) -> anyhow::Result<()> {
        let name = child.name().to_string();
        self.registry
            .lock()
            .set_status(&name, ChildStatus::Restarting);

        info!(child = %name, "Restarting child");

        let state_before = child.state();

        let result = async {
            child.stop().await?;
            child.on_restart().await?;
            child.start().await?;

            if let (Some(before), Some(after)) = (&state_before, child.state()) {
                if !Arc::ptr_eq(before, &after) {
                    anyhow::bail!("{name} replaced its state during restart");
                }
            }
            Ok(())
        }
        .await;

        let status = match &result {
            Ok(()) => ChildStatus::Running,
            Err(e) => {
                error!(child = %name, error = %e, "Child restart failed");
                ChildStatus::Stopped
            }
        };
        self.registry.lock().set_status(&name, status);

        result
    }

    /// Start every child in registration order
    pub async fn start_all(&self) -> Result<(), SupervisorError> {
        info!(parent: &self.span, "Starting all children");

        for child in self.snapshot() {
            let name = child.name().to_string();
            child
                .start()
                .await
                .map_err(|e| SupervisorError::StartFailed {
                    name: name.clone(),
                    reason: format!("{e:#}"),
                })?;
            self.registry.lock().set_status(&name, ChildStatus::Running);
        }

        Ok(())
    }

    /// Stop every child in registration order; errors are logged
    pub async fn stop_all(&self) {
        info!(parent: &self.span, "Stopping all children");

        for child in self.snapshot() {
            let name = child.name().to_string();
            if let Err(e) = child.stop().await {
                error!(parent: &self.span, child = %name, error = %e, "Child failed to stop");
            }
            self.registry.lock().set_status(&name, ChildStatus::Stopped);
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn Supervised>> {
        self.registry
            .lock()
            .children
            .iter()
            .map(|c| Arc::clone(&c.child))
            .collect()
    }

    pub fn restart_count(&self, name: &str) -> u32 {
        self.registry
            .lock()
            .restart_counts
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    pub fn child_status(&self, name: &str) -> Option<ChildStatus> {
        let registry = self.registry.lock();
        registry
            .position(name)
            .map(|index| registry.children[index].status)
    }

    /// Registered child names in registration order
    pub fn children(&self) -> Vec<String> {
        self.registry
            .lock()
            .children
            .iter()
            .map(|c| c.child.name().to_string())
            .collect()
    }

    pub fn child(&self, name: &str) -> Option<Arc<dyn Supervised>> {
        let registry = self.registry.lock();
        registry
            .position(name)
            .map(|index| Arc::clone(&registry.children[index].child))
    }

    pub fn is_restarting(&self, name: &str) -> bool {
        self.registry.lock().restarting.contains(name)
    }

    pub fn stats(&self) -> SupervisionStats {
        let registry = self.registry.lock();

        SupervisionStats {
            supervised_children: registry.children.len(),
            total_restarts: registry.restart_counts.values().sum(),
            permanently_failed: registry
                .children
                .iter()
                .filter(|c| c.status == ChildStatus::PermanentlyFailed)
                .count(),
        }
    }
}
