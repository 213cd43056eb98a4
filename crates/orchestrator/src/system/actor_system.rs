//! Main Actor System Implementation
//!
//! This module provides the ActorSystem, a central in-process registry of
//! supervisors and agents with system-wide broadcast and shutdown.

use crate::actors::GenServer;
use crate::system::Supervisor;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Span};

/// Central coordinator for supervisors and agents
pub struct ActorSystem {
    supervisors: DashMap<String, Arc<Supervisor>>,
    agents: DashMap<String, GenServer>,
    span: Span,
}

impl Default for ActorSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl ActorSystem {
    pub fn new() -> Self {
        Self::with_span(info_span!("actor_system"))
    }

    pub fn with_span(span: Span) -> Self {
        Self {
            supervisors: DashMap::new(),
            agents: DashMap::new(),
            span,
        }
    }

    /// Add a supervision tree; returns the supervisor it replaced, if any
    pub fn add_supervisor(&self, supervisor: Arc<Supervisor>) -> Option<Arc<Supervisor>> {
        let name = supervisor.name().to_string();
        debug!(parent: &self.span, supervisor = %name, "Adding supervisor");

        let replaced = self.supervisors.insert(name.clone(), supervisor);
        if replaced.is_some() {
            warn!(parent: &self.span, supervisor = %name, "Replaced supervisor with the same name");
        }
        replaced
    }

    pub fn supervisor(&self, name: &str) -> Option<Arc<Supervisor>> {
        self.supervisors
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn list_supervisors(&self) -> Vec<String> {
        let mut names: Vec<String> = self.supervisors.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Register an agent; returns the agent it replaced, if any
    pub fn register_agent(&self, agent: GenServer) -> Option<GenServer> {
        let name = agent.name().to_string();
        debug!(parent: &self.span, agent = %name, "Registering agent");

        let replaced = self.agents.insert(name.clone(), agent);
        if replaced.is_some() {
            warn!(parent: &self.span, agent = %name, "Replaced agent with the same name");
        }
        replaced
    }

    pub fn get_agent(&self, name: &str) -> Option<GenServer> {
        self.agents.get(name).map(|entry| entry.value().clone())
    }

    pub fn list_agents(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    fn agents_sorted(&self) -> Vec<GenServer> {
        let mut agents: Vec<GenServer> = self.agents.iter().map(|e| e.value().clone()).collect();
        agents.sort_by(|a, b| a.name().cmp(b.name()));
        agents
    }

    /// Cast `method` to every registered agent.
    ///
    /// Returns the number of agents the cast was enqueued to.
    pub fn broadcast(&self, method: &str, payload: Value) -> usize {
        let agents = self.agents_sorted();
        let mut delivered = 0;

        for agent in &agents {
            match agent.cast(method, payload.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(
                        parent: &self.span,
                        agent = %agent.name(),
                        error = %e,
                        "Broadcast cast failed"
                    );
                }
            }
        }

        debug!(
            parent: &self.span,
            method = %method,
            delivered,
            total = agents.len(),
            "Broadcast sent"
        );
        delivered
    }

    /// Stop every registered agent
    pub async fn shutdown(&self) {
        info!(parent: &self.span, agents = self.agents.len(), "Shutting down actor system");

        for agent in self.agents_sorted() {
            agent.stop().await;
        }

        info!(parent: &self.span, "Actor system shutdown complete");
    }
}
