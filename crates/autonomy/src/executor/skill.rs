//! Skill definitions and the context they run with.

use crate::types::AgentId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Kind of work a skill performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkillCategory {
    /// Produces posts, images, or other content.
    ContentGeneration,
    /// Collects or summarizes metrics.
    Analytics,
    /// Interacts with an audience.
    Engagement,
    /// Searches for leads or opportunities.
    Prospecting,
}

impl fmt::Display for SkillCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SkillCategory::ContentGeneration => "content-generation",
            SkillCategory::Analytics => "analytics",
            SkillCategory::Engagement => "engagement",
            SkillCategory::Prospecting => "prospecting",
        };
        f.write_str(name)
    }
}

/// Inputs handed to a skill invocation.
#[derive(Debug, Clone)]
pub struct SkillContext {
    /// Agent on whose behalf the skill runs.
    pub agent_id: AgentId,
    /// Operation parameters.
    pub params: Value,
    /// Fires when the invocation is abandoned (timeout or caller cancel).
    pub cancellation: CancellationToken,
}

impl SkillContext {
    /// Create a context with a fresh cancellation token.
    pub fn new(agent_id: impl Into<AgentId>, params: Value) -> Self {
        Self {
            agent_id: agent_id.into(),
            params,
            cancellation: CancellationToken::new(),
        }
    }

    /// Tie the invocation to a caller-owned token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// What a skill produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillOutput {
    /// Whether the skill considers its work done.
    pub ok: bool,
    /// Skill-specific payload.
    pub data: Value,
}

impl SkillOutput {
    pub fn success(data: Value) -> Self {
        Self { ok: true, data }
    }

    pub fn failure(data: Value) -> Self {
        Self { ok: false, data }
    }
}

/// An executable capability.
#[async_trait]
pub trait Skill: Send + Sync {
    /// Perform the work. Long-running skills should watch
    /// `ctx.cancellation` and stop early when it fires.
    async fn run(&self, ctx: SkillContext) -> anyhow::Result<SkillOutput>;
}

/// Skill backed by an async closure.
pub struct FnSkill<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Skill for FnSkill<F>
where
    F: Fn(SkillContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<SkillOutput>> + Send + 'static,
{
    async fn run(&self, ctx: SkillContext) -> anyhow::Result<SkillOutput> {
        (self.f)(ctx).await
    }
}

/// Wrap an async closure as a shareable skill.
pub fn skill_fn<F, Fut>(f: F) -> Arc<dyn Skill>
where
    F: Fn(SkillContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<SkillOutput>> + Send + 'static,
{
    Arc::new(FnSkill { f })
}

/// A registered capability.
#[derive(Clone)]
pub struct SkillDefinition {
    /// Unique registry key.
    pub id: String,
    /// Human-readable name.
    pub display_name: String,
    /// Kind of work.
    pub category: SkillCategory,
    /// Own timeout; the executor default applies when `None`.
    pub timeout: Option<Duration>,
    /// Bound executable.
    pub skill: Arc<dyn Skill>,
}

impl SkillDefinition {
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        category: SkillCategory,
        skill: Arc<dyn Skill>,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            category,
            timeout: None,
            skill,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl fmt::Debug for SkillDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SkillDefinition")
            .field("id", &self.id)
            .field("display_name", &self.display_name)
            .field("category", &self.category)
            .field("timeout", &self.timeout)
            .finish()
    }
}
