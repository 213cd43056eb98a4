//! Supervised Agents Example
//!
//! Two agents under a REST_FOR_ONE supervisor. The planner crashes on a bad
//! request; the supervisor restarts it and the executor registered after it,
//! keeping both state maps. A third crash exhausts the restart budget.

use common::{init_structured_logging, LoggingConfig};
use orchestrator::{
    ActorSystem, GenServer, HandlerError, RestartStrategy, Supervisor, SupervisorConfig,
};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

fn planner(supervisor: &std::sync::Arc<Supervisor>) -> anyhow::Result<GenServer> {
    let agent = GenServer::builder("planner")
        .supervisor(supervisor)
        .handle("plan", |payload, state| {
            Box::pin(async move {
                let Some(goal) = payload.get("goal").and_then(Value::as_str) else {
                    return Err(HandlerError::InvalidPayload("missing goal".to_string()));
                };

                let plans = state.entry("plans".to_string()).or_insert_with(|| json!(0));
                *plans = json!(plans.as_u64().unwrap_or(0) + 1);

                Ok(json!({ "goal": goal, "steps": ["analyze", "execute", "review"] }))
            })
        })
        .handle("replan", |payload, _state| {
            Box::pin(async move {
                Err(HandlerError::failed(format!("cannot replan {payload}")))
            })
        })
        .on_restart(|state| {
            Box::pin(async move {
                let restarts = state.get("restarts").and_then(Value::as_u64).unwrap_or(0);
                state.insert("restarts".to_string(), json!(restarts + 1));
                Ok(())
            })
        })
        .build()?;
    Ok(agent)
}

fn executor(supervisor: &std::sync::Arc<Supervisor>) -> anyhow::Result<GenServer> {
    let agent = GenServer::builder("executor")
        .supervisor(supervisor)
        .handle("execute", |payload, state| {
            Box::pin(async move {
                let executed = state.entry("executed".to_string()).or_insert_with(|| json!([]));
                if let Some(list) = executed.as_array_mut() {
                    list.push(payload);
                }
                Ok(json!("done"))
            })
        })
        .on_info(|payload, _state| {
            Box::pin(async move {
                tracing::info!(event = %payload, "executor received info");
                Ok(())
            })
        })
        .build()?;
    Ok(agent)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_structured_logging(LoggingConfig::default())?;

    let config = SupervisorConfig::new(RestartStrategy::RestForOne, 2, Duration::from_millis(200));
    let supervisor = Supervisor::builder("agents")
        .config(config)
        .notify_failure(|name, error| async move {
            warn!(child = %name, error = %error, "Giving up on child");
        })
        .build()?;

    let system = ActorSystem::new();
    system.add_supervisor(supervisor.clone());
    let planner = planner(&supervisor)?;
    let executor = executor(&supervisor)?;
    system.register_agent(planner.clone());
    system.register_agent(executor.clone());

    supervisor.start_all().await?;

    let plan = planner.call("plan", json!({ "goal": "ship release" })).await?;
    info!(plan = %plan, "Planner answered");
    executor.call("execute", plan).await?;
    executor.info(json!({ "event": "tick" }))?;

    // A failing call is returned to the caller and reported to the supervisor
    if let Err(e) = planner.call("plan", json!({})).await {
        warn!(error = %e, "Planner rejected the request");
    }
    sleep(Duration::from_millis(500)).await;

    // A failing cast crashes the planner
    planner.cast("replan", json!("release"))?;
    sleep(Duration::from_millis(1000)).await;

    let planner_state = planner.snapshot().await;
    let executor_state = executor.snapshot().await;
    info!(
        planner = ?planner_state,
        executor = ?executor_state,
        stats = ?supervisor.stats(),
        "State after restarts"
    );

    // Budget of two is spent: this crash is final
    planner.cast("replan", json!("again"))?;
    sleep(Duration::from_millis(100)).await;
    let delivered = system.broadcast("execute", json!("broadcast"));
    info!(
        planner_status = ?supervisor.child_status("planner"),
        delivered,
        "After budget exhaustion"
    );

    system.shutdown().await;
    Ok(())
}
