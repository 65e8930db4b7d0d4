//! Bounded skill executor.
//!
//! Holds a registry of [`SkillDefinition`]s and runs them against a timeout.
//! Every outcome (completion, error, panic, timeout, unknown id, caller
//! cancellation) comes back as an [`ExecutionResult`]; nothing is raised to
//! the caller.
//!
//! What happens to a unit that outlives its timeout is governed by the
//! executor-wide [`TimeoutPolicy`], and every timed-out result names the
//! policy that was applied:
//!
//! - [`TimeoutPolicy::Cancel`] drops the unit's future and fires its
//!   cancellation token. The unit performs no further work, so it cannot
//!   mutate shared state after the caller moves on. Work the unit itself
//!   spawned is only stopped if it honours the token.
//! - [`TimeoutPolicy::Detach`] leaves the unit running on the runtime. Its
//!   eventual result is logged and discarded. Side effects it performs
//!   (including debits) still happen after the caller has been told it
//!   timed out.

mod skill;

pub use skill::{FnSkill, Skill, SkillCategory, SkillContext, SkillDefinition, SkillOutput, skill_fn};

use crate::config::ExecutorConfig;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// What to do with a unit of work that exceeds its timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// Drop the unit and fire its cancellation token.
    #[default]
    Cancel,
    /// Let the unit finish in the background and discard its result.
    Detach,
}

/// Terminal state of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// The unit returned an output within its timeout.
    Completed,
    /// The unit returned an error or panicked.
    Failed,
    /// The unit exceeded its timeout.
    TimedOut { policy: TimeoutPolicy },
    /// The caller cancelled the invocation.
    Cancelled,
    /// No skill is registered under the id.
    NotFound,
}

/// Uniform outcome of [`BoundedExecutor::execute`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub skill_id: String,
    /// Mirrors the skill's own `ok` flag on completion; false otherwise.
    pub success: bool,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub elapsed: Duration,
    pub status: ExecutionStatus,
}

impl ExecutionResult {
    fn completed(skill_id: &str, output: SkillOutput, elapsed: Duration) -> Self {
        Self {
            skill_id: skill_id.to_string(),
            success: output.ok,
            output: Some(output.data),
            error: None,
            elapsed,
            status: ExecutionStatus::Completed,
        }
    }

    fn failed(skill_id: &str, status: ExecutionStatus, error: String, elapsed: Duration) -> Self {
        Self {
            skill_id: skill_id.to_string(),
            success: false,
            output: None,
            error: Some(error),
            elapsed,
            status,
        }
    }

    fn not_found(skill_id: &str) -> Self {
        Self::failed(
            skill_id,
            ExecutionStatus::NotFound,
            format!("skill not found: {skill_id}"),
            Duration::ZERO,
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.status, ExecutionStatus::TimedOut { .. })
    }
}

type UnitResult = Result<anyhow::Result<SkillOutput>, Box<dyn Any + Send>>;

enum Outcome {
    Finished(UnitResult),
    TimedOut,
    Cancelled,
}

/// Registry of skills plus the timeout-bounded runner.
pub struct BoundedExecutor {
    skills: RwLock<HashMap<String, SkillDefinition>>,
    default_timeout: Duration,
    policy: TimeoutPolicy,
}

impl BoundedExecutor {
    /// Create an executor with the given fallback timeout and the
    /// [`TimeoutPolicy::Cancel`] policy.
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            skills: RwLock::new(HashMap::new()),
            default_timeout,
            policy: TimeoutPolicy::Cancel,
        }
    }

    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self::new(config.default_timeout()).with_timeout_policy(config.timeout_policy)
    }

    pub fn with_timeout_policy(mut self, policy: TimeoutPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn timeout_policy(&self) -> TimeoutPolicy {
        self.policy
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Insert or replace a definition. Returns the replaced one, if any.
    pub fn register(&self, definition: SkillDefinition) -> Option<SkillDefinition> {
        let id = definition.id.clone();
        let previous = self.write().insert(id.clone(), definition);
        if previous.is_some() {
            warn!(skill_id = %id, "Skill re-registered, previous definition replaced");
        } else {
            debug!(skill_id = %id, "Skill registered");
        }
        previous
    }

    /// Remove a definition. Returns whether anything was removed.
    pub fn unregister(&self, id: &str) -> bool {
        let removed = self.write().remove(id).is_some();
        if removed {
            debug!(skill_id = id, "Skill unregistered");
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<SkillDefinition> {
        self.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().contains_key(id)
    }

    /// Snapshot of the registry, ordered by id.
    pub fn list(&self) -> Vec<SkillDefinition> {
        let mut skills: Vec<_> = self.read().values().cloned().collect();
        skills.sort_by(|a, b| a.id.cmp(&b.id));
        skills
    }

    /// Run a registered skill under its timeout.
    ///
    /// If `ctx.cancellation` fires first the invocation ends as
    /// [`ExecutionStatus::Cancelled`].
    pub async fn execute(&self, id: &str, ctx: SkillContext) -> ExecutionResult {
        let Some(definition) = self.get(id) else {
            warn!(skill_id = id, "Execution requested for unknown skill");
            return ExecutionResult::not_found(id);
        };

        let timeout = definition.timeout.unwrap_or(self.default_timeout);
        let caller = ctx.cancellation.clone();
        let token = caller.child_token();
        let agent_id = ctx.agent_id.clone();
        let ctx = SkillContext {
            cancellation: token.clone(),
            ..ctx
        };

        debug!(
            skill_id = id,
            agent_id = %agent_id,
            timeout_ms = timeout.as_millis() as u64,
            "Skill execution starting"
        );

        let skill = Arc::clone(&definition.skill);
        let unit = AssertUnwindSafe(async move { skill.run(ctx).await }).catch_unwind();
        let started = Instant::now();

        let outcome = match self.policy {
            TimeoutPolicy::Cancel => {
                tokio::select! {
                    result = unit => Outcome::Finished(result),
                    _ = tokio::time::sleep(timeout) => {
                        token.cancel();
                        Outcome::TimedOut
                    }
                    _ = caller.cancelled() => Outcome::Cancelled,
                }
            }
            TimeoutPolicy::Detach => {
                let mut handle = tokio::spawn(unit);
                tokio::select! {
                    joined = &mut handle => Outcome::Finished(joined.unwrap_or_else(|err| {
                        Err(Box::new(format!("skill task failed: {err}")) as Box<dyn Any + Send>)
                    })),
                    _ = tokio::time::sleep(timeout) => {
                        discard_late_result(id.to_string(), handle);
                        Outcome::TimedOut
                    }
                    _ = caller.cancelled() => {
                        discard_late_result(id.to_string(), handle);
                        Outcome::Cancelled
                    }
                }
            }
        };
        let elapsed = started.elapsed();

        let result = match outcome {
            Outcome::Finished(Ok(Ok(output))) => ExecutionResult::completed(id, output, elapsed),
            Outcome::Finished(Ok(Err(err))) => {
                ExecutionResult::failed(id, ExecutionStatus::Failed, format!("{err:#}"), elapsed)
            }
            Outcome::Finished(Err(panic)) => {
                let message = panic_message(panic.as_ref());
                error!(skill_id = id, agent_id = %agent_id, panic = %message, "Skill panicked");
                ExecutionResult::failed(
                    id,
                    ExecutionStatus::Failed,
                    format!("skill panicked: {message}"),
                    elapsed,
                )
            }
            Outcome::TimedOut => {
                warn!(
                    skill_id = id,
                    agent_id = %agent_id,
                    timeout_ms = timeout.as_millis() as u64,
                    policy = ?self.policy,
                    "Skill timed out"
                );
                ExecutionResult::failed(
                    id,
                    ExecutionStatus::TimedOut {
                        policy: self.policy,
                    },
                    format!("skill {id} timed out after {}ms", timeout.as_millis()),
                    elapsed,
                )
            }
            Outcome::Cancelled => {
                token.cancel();
                ExecutionResult::failed(
                    id,
                    ExecutionStatus::Cancelled,
                    format!("skill {id} cancelled by caller"),
                    elapsed,
                )
            }
        };

        debug!(
            skill_id = id,
            agent_id = %agent_id,
            success = result.success,
            status = ?result.status,
            elapsed_ms = elapsed.as_millis() as u64,
            "Skill execution finished"
        );
        result
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, SkillDefinition>> {
        self.skills.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, SkillDefinition>> {
        self.skills.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Await a detached unit in the background and drop whatever it returns.
fn discard_late_result(skill_id: String, handle: JoinHandle<UnitResult>) {
    tokio::spawn(async move {
        match handle.await {
            Ok(Ok(Ok(output))) => {
                info!(skill_id = %skill_id, ok = output.ok, "Discarded late skill result")
            }
            Ok(Ok(Err(err))) => {
                info!(skill_id = %skill_id, error = %err, "Discarded late skill error")
            }
            Ok(Err(panic)) => warn!(
                skill_id = %skill_id,
                panic = %panic_message(panic.as_ref()),
                "Detached skill panicked"
            ),
            Err(err) => debug!(skill_id = %skill_id, error = %err, "Detached skill task ended"),
        }
    });
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
