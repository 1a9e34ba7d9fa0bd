//! Terraform as the provisioning engine
//!
//! All calls run with `-chdir=<dir>` and `-input=false`. State-touching calls
//! pass `-lock-timeout=0s` so a held lock fails immediately instead of
//! blocking the run.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::{Plan, ProvisioningEngine};
use crate::config::TerraformSettings;
use crate::error::PhaseName;
use crate::retry::RetryPolicy;
use crate::runner::{CommandOutput, CommandRunner, CommandRunnerExt, CommandSpec};
use crate::{Error, Result};

/// Marker terraform prints when another run holds the state lock
const LOCK_ERROR_MARKER: &str = "Error acquiring the state lock";

/// `plan -detailed-exitcode`: succeeded with changes present
const PLAN_EXIT_CHANGES: i32 = 2;

/// Provisioning engine backed by the terraform CLI.
pub struct Terraform {
    runner: Arc<dyn CommandRunner>,
    settings: TerraformSettings,
}

impl Terraform {
    /// Create an engine running terraform through `runner`
    pub fn new(runner: Arc<dyn CommandRunner>, settings: TerraformSettings) -> Self {
        Self { runner, settings }
    }

    fn command<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::new(self.settings.binary.clone())
            .arg(format!("-chdir={}", self.settings.dir.display()))
            .args(args)
            .env("TF_IN_AUTOMATION", "1")
    }

    /// Run and turn failures into step errors, detecting lock contention
    async fn run(
        &self,
        step: &str,
        command: CommandSpec,
        policy: Option<&RetryPolicy>,
    ) -> Result<CommandOutput> {
        let output = self.runner.run(&command, None, policy).await?;
        check(step, output)
    }

    fn read_plan_digest(&self) -> Result<String> {
        let path = self.settings.plan_path();
        let bytes = std::fs::read(&path).map_err(|e| {
            Error::step(
                PhaseName::Provision,
                "plan",
                format!("failed to read plan file {}: {}", path.display(), e),
            )
        })?;
        Ok(digest(&bytes))
    }
}

fn check(step: &str, output: CommandOutput) -> Result<CommandOutput> {
    if output.success() {
        return Ok(output);
    }
    if output.stderr.contains(LOCK_ERROR_MARKER) || output.stdout.contains(LOCK_ERROR_MARKER) {
        return Err(Error::LockContention {
            phase: PhaseName::Provision,
            message: output.error_text(),
        });
    }
    Err(Error::step(PhaseName::Provision, step, output.error_text()))
}

/// Hex SHA-256 of plan file bytes
pub fn digest(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[derive(Debug, Deserialize)]
struct ShowPlan {
    #[serde(default)]
    resource_changes: Vec<ResourceChange>,
    #[serde(default)]
    output_changes: BTreeMap<String, ChangeDetail>,
}

#[derive(Debug, Deserialize)]
struct ResourceChange {
    address: String,
    change: ChangeDetail,
}

#[derive(Debug, Deserialize)]
struct ChangeDetail {
    actions: Vec<String>,
}

fn render_action(actions: &[String]) -> Option<String> {
    match actions {
        [] => None,
        [a] if a == "no-op" || a == "read" => None,
        [a] => Some(a.clone()),
        [_, _] => Some("replace".to_string()),
        other => Some(other.join("+")),
    }
}

/// Resource addresses with their actions, skipping no-ops and reads.
///
/// `["delete","create"]` is rendered as `replace`. Root output changes follow
/// the resources as `output.<name> (action)`.
pub fn parse_changes(show_json: &str) -> Result<Vec<String>> {
    let plan: ShowPlan = serde_json::from_str(show_json)
        .map_err(|e| Error::serialization(format!("failed to parse plan JSON: {}", e)))?;

    let resources = plan.resource_changes.into_iter().filter_map(|rc| {
        render_action(&rc.change.actions).map(|action| format!("{} ({})", rc.address, action))
    });
    let outputs = plan.output_changes.into_iter().filter_map(|(name, change)| {
        render_action(&change.actions).map(|action| format!("output.{} ({})", name, action))
    });
    Ok(resources.chain(outputs).collect())
}

#[async_trait]
impl ProvisioningEngine for Terraform {
    async fn init(&self) -> Result<()> {
        let policy = RetryPolicy::exponential(
            self.settings.init_attempts,
            std::time::Duration::from_secs(2),
            std::time::Duration::from_secs(30),
        );
        self.run(
            "init",
            self.command(["init", "-input=false", "-no-color"]),
            Some(&policy),
        )
        .await?;
        Ok(())
    }

    async fn validate(&self) -> Result<()> {
        self.run("validate", self.command(["validate", "-no-color"]), None)
            .await?;
        Ok(())
    }

    async fn plan(&self) -> Result<Plan> {
        let plan_arg = format!("-out={}", self.settings.plan_file);
        let output = self
            .runner
            .run(
                &self.command([
                    "plan",
                    "-input=false",
                    "-no-color",
                    "-lock-timeout=0s",
                    "-detailed-exitcode",
                    plan_arg.as_str(),
                ]),
                None,
                None,
            )
            .await?;

        // detailed-exitcode: 0 = no changes, 2 = changes, anything else = error
        let output = if output.exit_code == PLAN_EXIT_CHANGES && !output.timed_out {
            output
        } else {
            check("plan", output)?
        };

        let digest = self.read_plan_digest()?;

        let summary = self
            .run(
                "show",
                self.command(["show", "-no-color", self.settings.plan_file.as_str()]),
                None,
            )
            .await?
            .stdout;
        let show_json = self
            .run(
                "show",
                self.command(["show", "-json", self.settings.plan_file.as_str()]),
                None,
            )
            .await?
            .stdout;
        let mut changes = parse_changes(&show_json)?;
        if changes.is_empty() && output.exit_code == PLAN_EXIT_CHANGES {
            // terraform saw a change the JSON did not itemize; never report it as a no-op
            changes.push(format!("{} (update)", self.settings.plan_file));
        }
        debug!(changes = changes.len(), exit_code = output.exit_code, "Plan produced");

        Ok(Plan {
            path: self.settings.plan_path(),
            digest,
            summary,
            changes,
        })
    }

    async fn apply(&self, plan: &Plan) -> Result<()> {
        let current = self.read_plan_digest()?;
        if current != plan.digest {
            return Err(Error::step(
                PhaseName::Provision,
                "apply",
                format!(
                    "plan file {} changed after it was confirmed (expected {}, found {})",
                    plan.path.display(),
                    plan.digest,
                    current
                ),
            ));
        }

        info!(plan = %plan.path.display(), "Applying saved plan");
        self.run(
            "apply",
            self.command([
                "apply",
                "-input=false",
                "-no-color",
                "-lock-timeout=0s",
                self.settings.plan_file.as_str(),
            ]),
            None,
        )
        .await?;
        Ok(())
    }

    async fn inventory(&self) -> Result<Vec<String>> {
        let output = self
            .run("state-list", self.command(["state", "list"]), None)
            .await?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    async fn destroy(&self) -> Result<()> {
        self.run(
            "destroy",
            self.command([
                "destroy",
                "-auto-approve",
                "-input=false",
                "-no-color",
                "-lock-timeout=0s",
            ]),
            None,
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::MockCommandRunner;
    use std::path::Path;

    const SHOW_JSON: &str = r#"{
  "format_version": "1.2",
  "resource_changes": [
    {"address": "aws_vpc.main", "change": {"actions": ["create"]}},
    {"address": "aws_instance.cp[0]", "change": {"actions": ["delete", "create"]}},
    {"address": "aws_security_group.nodes", "change": {"actions": ["no-op"]}},
    {"address": "data.aws_ami.ubuntu", "change": {"actions": ["read"]}},
    {"address": "aws_eip.old", "change": {"actions": ["delete"]}}
  ]
}"#;

    fn settings(dir: &Path) -> TerraformSettings {
        TerraformSettings {
            dir: dir.to_path_buf(),
            ..Default::default()
        }
    }

    fn has_arg(cmd: &CommandSpec, arg: &str) -> bool {
        cmd.args.iter().any(|a| a == arg)
    }

    #[test]
    fn parse_changes_skips_noops_and_reads() {
        let changes = parse_changes(SHOW_JSON).unwrap();
        assert_eq!(
            changes,
            vec![
                "aws_vpc.main (create)",
                "aws_instance.cp[0] (replace)",
                "aws_eip.old (delete)",
            ]
        );
    }

    #[test]
    fn parse_changes_handles_empty_plan() {
        assert!(parse_changes(r#"{"format_version":"1.2"}"#)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn lock_error_is_contention() {
        let output = CommandOutput::failed(
            1,
            "Error: Error acquiring the state lock\n\nLock Info:\n  ID: 1234",
        );
        let err = check("apply", output).unwrap_err();
        assert!(matches!(err, Error::LockContention { .. }));
    }

    #[tokio::test]
    async fn plan_captures_digest_summary_and_changes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("keel.tfplan"), b"plan-bytes-v1").unwrap();

        let mut runner = MockCommandRunner::new();
        runner.expect_execute().returning(|cmd, _, _| {
            assert_eq!(cmd.program, "terraform");
            match cmd.args.get(1).map(String::as_str) {
                Some("plan") => {
                    assert!(has_arg(cmd, "-lock-timeout=0s"));
                    assert!(has_arg(cmd, "-out=keel.tfplan"));
                    Ok(CommandOutput {
                        exit_code: 2,
                        ..CommandOutput::ok("Plan: 2 to add")
                    })
                }
                Some("show") if has_arg(cmd, "-json") => Ok(CommandOutput::ok(SHOW_JSON)),
                Some("show") => Ok(CommandOutput::ok("Terraform will perform the following actions")),
                other => panic!("unexpected terraform call {:?}", other),
            }
        });

        let tf = Terraform::new(Arc::new(runner), settings(dir.path()));
        let plan = tf.plan().await.unwrap();
        assert_eq!(plan.digest, digest(b"plan-bytes-v1"));
        assert!(plan.summary.contains("following actions"));
        assert_eq!(plan.changes.len(), 3);
        assert!(plan.has_changes());
    }

    fn plan_runner(show_json: &'static str) -> MockCommandRunner {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_execute()
            .returning(move |cmd, _, _| match cmd.args.get(1).map(String::as_str) {
                Some("plan") => Ok(CommandOutput {
                    exit_code: PLAN_EXIT_CHANGES,
                    ..CommandOutput::ok("Changes to Outputs:")
                }),
                Some("show") if has_arg(cmd, "-json") => Ok(CommandOutput::ok(show_json)),
                Some("show") => Ok(CommandOutput::ok("Changes to Outputs:\n  + api_endpoint")),
                other => panic!("unexpected terraform call {:?}", other),
            });
        runner
    }

    #[tokio::test]
    async fn outputs_only_plan_has_changes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("keel.tfplan"), b"plan-bytes-v1").unwrap();

        let runner = plan_runner(
            r#"{
  "resource_changes": [
    {"address": "aws_vpc.main", "change": {"actions": ["no-op"]}}
  ],
  "output_changes": {
    "api_endpoint": {"actions": ["create"]},
    "cluster_name": {"actions": ["no-op"]}
  }
}"#,
        );
        let tf = Terraform::new(Arc::new(runner), settings(dir.path()));
        let plan = tf.plan().await.unwrap();
        assert_eq!(plan.changes, vec!["output.api_endpoint (create)"]);
        assert!(plan.has_changes());
    }

    #[tokio::test]
    async fn changes_exit_code_never_yields_empty_plan() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("keel.tfplan"), b"plan-bytes-v1").unwrap();

        let tf = Terraform::new(
            Arc::new(plan_runner(r#"{"format_version":"1.2"}"#)),
            settings(dir.path()),
        );
        let plan = tf.plan().await.unwrap();
        assert_eq!(plan.changes, vec!["keel.tfplan (update)"]);
        assert!(plan.has_changes());
    }

    #[tokio::test]
    async fn plan_error_carries_raw_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = MockCommandRunner::new();
        runner.expect_execute().returning(|_, _, _| {
            Ok(CommandOutput::failed(
                1,
                "Error: Unsupported argument on main.tf line 12",
            ))
        });

        let tf = Terraform::new(Arc::new(runner), settings(dir.path()));
        let err = tf.plan().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "provision failed at step 'plan': Error: Unsupported argument on main.tf line 12"
        );
    }

    #[tokio::test]
    async fn apply_refuses_changed_plan_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("keel.tfplan"), b"plan-bytes-v2").unwrap();

        let mut runner = MockCommandRunner::new();
        runner.expect_execute().never();

        let tf = Terraform::new(Arc::new(runner), settings(dir.path()));
        let plan = Plan {
            path: dir.path().join("keel.tfplan"),
            digest: digest(b"plan-bytes-v1"),
            summary: String::new(),
            changes: vec!["aws_vpc.main (create)".into()],
        };
        let err = tf.apply(&plan).await.unwrap_err();
        assert!(err.to_string().contains("changed after it was confirmed"));
    }

    #[tokio::test]
    async fn apply_passes_saved_plan_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("keel.tfplan"), b"plan-bytes-v1").unwrap();

        let mut runner = MockCommandRunner::new();
        runner
            .expect_execute()
            .withf(|cmd, _, _| {
                cmd.args.get(1).map(String::as_str) == Some("apply")
                    && cmd.args.last().map(String::as_str) == Some("keel.tfplan")
                    && !cmd.args.iter().any(|a| a == "-auto-approve")
            })
            .times(1)
            .returning(|_, _, _| Ok(CommandOutput::ok("Apply complete!")));

        let tf = Terraform::new(Arc::new(runner), settings(dir.path()));
        let plan = Plan {
            path: dir.path().join("keel.tfplan"),
            digest: digest(b"plan-bytes-v1"),
            summary: String::new(),
            changes: vec!["aws_vpc.main (create)".into()],
        };
        tf.apply(&plan).await.unwrap();
    }

    #[tokio::test]
    async fn inventory_lists_state_addresses() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = MockCommandRunner::new();
        runner.expect_execute().returning(|_, _, _| {
            Ok(CommandOutput::ok("aws_vpc.main\naws_instance.cp[0]\n\n"))
        });

        let tf = Terraform::new(Arc::new(runner), settings(dir.path()));
        assert_eq!(
            tf.inventory().await.unwrap(),
            vec!["aws_vpc.main", "aws_instance.cp[0]"]
        );
    }
}
