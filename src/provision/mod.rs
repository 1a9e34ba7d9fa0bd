//! Provisioning phase: cloud resources through the provisioning engine
//!
//! Apply is always plan-then-confirm-then-apply against the saved plan file:
//!
//! 1. Preflight (engine binary, working directory, cloud credentials)
//! 2. Plan to a file and render its summary
//! 3. Single confirmation listing every resource change
//! 4. Apply exactly the confirmed plan (digest checked)
//!
//! Destroy is only reachable with a [`TeardownClearance`], which the teardown
//! phase hands out after its double confirmation.

mod terraform;

pub use terraform::{digest, parse_changes, Terraform};

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::info;

use crate::confirm::{Confirmation, ConfirmationGate, ConfirmationRequest, Decision};
use crate::preflight::{PreflightChecker, Requirement};
use crate::teardown::TeardownClearance;
use crate::Result;

/// A saved plan, as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    /// Plan file on disk
    pub path: PathBuf,
    /// Hex SHA-256 of the plan file when the summary was rendered
    pub digest: String,
    /// Human-readable plan output
    pub summary: String,
    /// `address (action)` per changed resource
    pub changes: Vec<String>,
}

impl Plan {
    /// Whether applying this plan would change anything
    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }
}

/// Result of [`ProvisioningPhase::apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Plan applied; empty when there was nothing to change
    Applied {
        /// Resource changes that were applied
        changes: Vec<String>,
    },
    /// User declined the plan
    Aborted,
}

/// Provisioning engine operations the phase relies on.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProvisioningEngine: Send + Sync {
    /// Prepare the working directory (providers, backend)
    async fn init(&self) -> Result<()>;

    /// Check the resource definitions are well-formed
    async fn validate(&self) -> Result<()>;

    /// Produce a saved plan
    async fn plan(&self) -> Result<Plan>;

    /// Apply a previously produced plan, refusing if the file changed
    async fn apply(&self, plan: &Plan) -> Result<()>;

    /// Addresses of every resource currently in state
    async fn inventory(&self) -> Result<Vec<String>>;

    /// Destroy every resource in state
    async fn destroy(&self) -> Result<()>;
}

/// Wraps the provisioning engine behind preflight checks and confirmation.
pub struct ProvisioningPhase {
    engine: Arc<dyn ProvisioningEngine>,
    preflight: PreflightChecker,
    requirements: Vec<Requirement>,
}

impl ProvisioningPhase {
    /// Create the phase; `requirements` are checked before every engine call
    pub fn new(
        engine: Arc<dyn ProvisioningEngine>,
        preflight: PreflightChecker,
        requirements: Vec<Requirement>,
    ) -> Self {
        Self {
            engine,
            preflight,
            requirements,
        }
    }

    /// Engine handle, for callers that need read-only queries
    pub fn engine(&self) -> &Arc<dyn ProvisioningEngine> {
        &self.engine
    }

    /// Check prerequisites without touching the engine
    pub async fn preflight(&self) -> Result<()> {
        self.preflight.check(&self.requirements).await
    }

    /// Initialize the engine's working directory
    pub async fn init(&self) -> Result<()> {
        self.preflight().await?;
        self.engine.init().await?;
        info!("Provisioning engine initialized");
        Ok(())
    }

    /// Validate the resource definitions
    pub async fn validate(&self) -> Result<()> {
        self.preflight().await?;
        self.engine.validate().await?;
        info!("Resource definitions are valid");
        Ok(())
    }

    /// Produce a plan without applying it
    pub async fn plan(&self) -> Result<Plan> {
        self.preflight().await?;
        let plan = self.engine.plan().await?;
        info!(changes = plan.changes.len(), digest = %plan.digest, "Plan ready");
        Ok(plan)
    }

    /// Plan, confirm, then apply exactly the confirmed plan.
    pub async fn apply(&self, gate: &mut ConfirmationGate) -> Result<ApplyOutcome> {
        let plan = self.plan().await?;

        if !plan.has_changes() {
            info!("No changes. Infrastructure matches the configuration");
            return Ok(ApplyOutcome::Applied { changes: vec![] });
        }

        let description = format!(
            "Apply the following plan ({} change(s)):\n\n{}",
            plan.changes.len(),
            plan.summary.trim_end()
        );
        let request = ConfirmationRequest::new(description, plan.changes.clone());

        if gate.confirm(&Confirmation::single(request)).await? == Decision::Declined {
            info!("Apply declined, nothing changed");
            return Ok(ApplyOutcome::Aborted);
        }

        self.engine.apply(&plan).await?;
        info!(changes = plan.changes.len(), "Apply complete");
        Ok(ApplyOutcome::Applied {
            changes: plan.changes,
        })
    }

    /// Addresses of every resource in state
    pub async fn inventory(&self) -> Result<Vec<String>> {
        self.engine.inventory().await
    }

    /// Destroy everything in state. Requires teardown's clearance.
    pub async fn destroy(&self, clearance: TeardownClearance) -> Result<()> {
        info!(
            resources = clearance.resources().len(),
            "Destroying provisioned resources"
        );
        self.engine.destroy().await?;
        info!("Destroy complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confirm::ScriptedInput;
    use crate::runner::{CommandOutput, MockCommandRunner};

    fn plan(changes: &[&str]) -> Plan {
        Plan {
            path: PathBuf::from("terraform/keel.tfplan"),
            digest: "abc123".into(),
            summary: "Plan: 1 to add, 0 to change, 0 to destroy.".into(),
            changes: changes.iter().map(|c| c.to_string()).collect(),
        }
    }

    fn phase(engine: MockProvisioningEngine) -> ProvisioningPhase {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_execute()
            .returning(|_, _, _| Ok(CommandOutput::ok("ok")));
        ProvisioningPhase::new(
            Arc::new(engine),
            PreflightChecker::new(Arc::new(runner)),
            vec![Requirement::tool("terraform")],
        )
    }

    #[tokio::test]
    async fn approved_apply_uses_the_confirmed_plan() {
        let mut engine = MockProvisioningEngine::new();
        engine
            .expect_plan()
            .times(1)
            .returning(|| Ok(plan(&["aws_vpc.main (create)"])));
        engine
            .expect_apply()
            .withf(|p| p.digest == "abc123")
            .times(1)
            .returning(|_| Ok(()));

        let mut gate = ConfirmationGate::new(Box::new(ScriptedInput::new(["yes"])));
        let outcome = phase(engine).apply(&mut gate).await.unwrap();
        assert_eq!(
            outcome,
            ApplyOutcome::Applied {
                changes: vec!["aws_vpc.main (create)".into()]
            }
        );
    }

    #[tokio::test]
    async fn declined_apply_never_reaches_engine() {
        let mut engine = MockProvisioningEngine::new();
        engine
            .expect_plan()
            .returning(|| Ok(plan(&["aws_vpc.main (create)"])));
        engine.expect_apply().never();

        let mut gate = ConfirmationGate::new(Box::new(ScriptedInput::new(["no"])));
        let outcome = phase(engine).apply(&mut gate).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Aborted);
    }

    #[tokio::test]
    async fn empty_plan_skips_prompt() {
        let mut engine = MockProvisioningEngine::new();
        engine.expect_plan().returning(|| Ok(plan(&[])));
        engine.expect_apply().never();

        let input = ScriptedInput::new(Vec::<String>::new());
        let transcript = input.transcript();
        let mut gate = ConfirmationGate::new(Box::new(input));
        let outcome = phase(engine).apply(&mut gate).await.unwrap();

        assert_eq!(outcome, ApplyOutcome::Applied { changes: vec![] });
        assert!(transcript.prompts().is_empty());
    }

    #[tokio::test]
    async fn prompt_shows_plan_summary() {
        let mut engine = MockProvisioningEngine::new();
        engine
            .expect_plan()
            .returning(|| Ok(plan(&["aws_vpc.main (create)"])));
        engine.expect_apply().returning(|_| Ok(()));

        let input = ScriptedInput::new(["yes"]);
        let transcript = input.transcript();
        let mut gate = ConfirmationGate::new(Box::new(input));
        phase(engine).apply(&mut gate).await.unwrap();

        let prompt = &transcript.prompts()[0];
        assert!(prompt.contains("Plan: 1 to add"));
        assert!(prompt.contains("aws_vpc.main (create)"));
    }

    #[tokio::test]
    async fn missing_tool_stops_before_planning() {
        let mut engine = MockProvisioningEngine::new();
        engine.expect_plan().never();

        let mut runner = MockCommandRunner::new();
        runner
            .expect_execute()
            .returning(|_, _, _| Ok(CommandOutput::failed(127, "not found")));
        let phase = ProvisioningPhase::new(
            Arc::new(engine),
            PreflightChecker::new(Arc::new(runner)),
            vec![Requirement::tool("terraform")],
        );

        let mut gate = ConfirmationGate::new(Box::new(ScriptedInput::new(["yes"])));
        let err = phase.apply(&mut gate).await.unwrap_err();
        assert!(matches!(err, crate::Error::Precondition { .. }));
    }
}
