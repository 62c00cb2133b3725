//! Compensation stack for saga-style orchestrations.
//!
//! ```rust,no_run
//! use duroflow::OrchestrationContext;
//! use duroflow::saga::Compensations;
//!
//! async fn checkout(ctx: OrchestrationContext, order: String) -> Result<String, String> {
//!     let mut undo = Compensations::new();
//!     ctx.call_activity("reserve_inventory", order.clone()).into_activity().await?;
//!     undo.push("release_inventory", order.clone());
//!     if let Err(e) = ctx.call_activity("charge_payment", order).into_activity().await {
//!         undo.compensate(&ctx).await;
//!         return Err(e);
//!     }
//!     Ok("done".into())
//! }
//! ```

use crate::{OrchestrationContext, RetryPolicy};

/// One registered undo step.
#[derive(Debug, Clone, PartialEq)]
pub struct CompensationStep {
    pub activity: String,
    pub input: String,
}

/// Outcome of [`Compensations::compensate`], in execution order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompensationReport {
    pub succeeded: Vec<CompensationStep>,
    /// Failed steps with their error message.
    pub failed: Vec<(CompensationStep, String)>,
}

impl CompensationReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Stack of compensating activities, run last-in first-out.
#[derive(Debug, Clone, Default)]
pub struct Compensations {
    steps: Vec<CompensationStep>,
    retry_policy: Option<RetryPolicy>,
}

impl Compensations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run every compensation under `policy`.
    pub fn with_retry_policy(policy: RetryPolicy) -> Self {
        Self {
            steps: Vec::new(),
            retry_policy: Some(policy),
        }
    }

    /// Register the undo for a forward step that just succeeded.
    pub fn push(&mut self, activity: impl Into<String>, input: impl Into<String>) {
        self.steps.push(CompensationStep {
            activity: activity.into(),
            input: input.into(),
        });
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run the registered steps in reverse order, one at a time. A failed
    /// step is recorded and the walk continues. The stack is empty afterwards.
    pub async fn compensate(&mut self, ctx: &OrchestrationContext) -> CompensationReport {
        let mut report = CompensationReport::default();
        while let Some(step) = self.steps.pop() {
            let call = match &self.retry_policy {
                Some(policy) => ctx.call_activity_with_retry(step.activity.clone(), step.input.clone(), policy.clone()),
                None => ctx.call_activity(step.activity.clone(), step.input.clone()),
            };
            match call.into_activity().await {
                Ok(_) => report.succeeded.push(step),
                Err(e) => {
                    ctx.trace_warn(format!("compensation {} failed: {e}", step.activity));
                    report.failed.push((step, e));
                }
            }
        }
        report
    }
}
