//! Named stages with before/after/error extension points over a shared context.

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, warn};

#[async_trait]
pub trait Stage<C: Send>: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: &mut C) -> Result<()>;
}

/// Ordered stage list. `error` hooks run whenever a before/main/after stage fails;
/// their own failures are logged and never replace the original error.
pub struct Pipeline<C: Send> {
    before: Vec<Box<dyn Stage<C>>>,
    stages: Vec<Box<dyn Stage<C>>>,
    after: Vec<Box<dyn Stage<C>>>,
    error: Vec<Box<dyn Stage<C>>>,
}

impl<C: Send> Default for Pipeline<C> {
    fn default() -> Self {
        Self {
            before: Vec::new(),
            stages: Vec::new(),
            after: Vec::new(),
            error: Vec::new(),
        }
    }
}

impl<C: Send> Pipeline<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn before(mut self, stage: impl Stage<C> + 'static) -> Self {
        self.before.push(Box::new(stage));
        self
    }

    pub fn stage(mut self, stage: impl Stage<C> + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn after(mut self, stage: impl Stage<C> + 'static) -> Self {
        self.after.push(Box::new(stage));
        self
    }

    pub fn on_error(mut self, stage: impl Stage<C> + 'static) -> Self {
        self.error.push(Box::new(stage));
        self
    }

    /// Stage names in execution order, excluding error hooks.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.before
            .iter()
            .chain(&self.stages)
            .chain(&self.after)
            .map(|stage| stage.name())
            .collect()
    }

    pub async fn run(&self, ctx: &mut C) -> Result<()> {
        let result = self.run_main(ctx).await;
        if let Err(err) = &result {
            for hook in &self.error {
                debug!(hook = hook.name(), error = %err, "running error hook");
                if let Err(hook_err) = hook.run(ctx).await {
                    warn!(hook = hook.name(), error = %hook_err, "error hook failed");
                }
            }
        }
        result
    }

    async fn run_main(&self, ctx: &mut C) -> Result<()> {
        for stage in self.before.iter().chain(&self.stages).chain(&self.after) {
            debug!(stage = stage.name(), "running stage");
            stage
                .run(ctx)
                .await
                .with_context(|| format!("stage `{}`", stage.name()))?;
        }
        Ok(())
    }
}

/// What to do after one unit of work fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Abort the job on the first per-task failure.
    Strict,
    /// Log the failure and continue with the remaining tasks.
    Tolerant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Continue,
    Abort,
}

impl FailurePolicy {
    pub fn from_fault_tolerant(fault_tolerant: bool) -> Self {
        if fault_tolerant {
            FailurePolicy::Tolerant
        } else {
            FailurePolicy::Strict
        }
    }

    pub fn decide(self) -> Decision {
        match self {
            FailurePolicy::Strict => Decision::Abort,
            FailurePolicy::Tolerant => Decision::Continue,
        }
    }
}
