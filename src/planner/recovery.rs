//! Replanning after a failed step.

use tracing::info;

use crate::providers::FailoverChain;
use crate::utils::truncate_str;

use super::generation::{generate_plan, PlanGenerationError};
use super::{Plan, PlanStep};

/// Generate a brand-new plan after `failed_step` ended in failure.
///
/// Returns `Ok(None)` once the replan budget is spent — the caller must
/// treat that as a terminal stop (`max_replans_reached`), never a silent
/// no-op. The old plan is discarded, not patched.
#[allow(clippy::too_many_arguments)]
pub async fn replan(
    chain: &FailoverChain,
    goal: &str,
    old_plan: &Plan,
    failed_step: &PlanStep,
    failure_context: &str,
    replans_used: usize,
    max_replans: usize,
    retry_budget: usize,
    max_steps: usize,
) -> Result<Option<Plan>, PlanGenerationError> {
    if replans_used >= max_replans {
        info!(replans_used, max_replans, "replan budget spent");
        return Ok(None);
    }

    let amended_goal = format!(
        "{goal}\n\nA previous plan failed. Plan state was:\n{}\n\nStep {} ({}) failed: {}\n\
         Produce a fresh plan that routes around the failure. Completed work does not need to \
         be repeated.",
        old_plan.format_for_prompt(),
        failed_step.id,
        truncate_str(&failed_step.description, 120),
        truncate_str(failure_context, 400),
    );

    let plan = generate_plan(chain, &amended_goal, retry_budget, max_steps).await?;
    Ok(Some(plan))
}
