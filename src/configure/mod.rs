//! Configuration phase: bootstrap the cluster on provisioned hosts
//!
//! Runs after provisioning. Every host must answer over ssh before the first
//! role runs; then the roles run strictly in order and the first failure
//! stops the sequence.

mod ansible;

pub use ansible::{Ansible, InventorySource};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::{info, warn};

use crate::error::PhaseName;
use crate::poll::{ssh_check, ReadinessPoller, ReadinessSettings};
use crate::preflight::{PreflightChecker, Requirement};
use crate::target::RemoteTarget;
use crate::{Error, Result};

/// Bootstrap roles, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Base packages and kernel settings, every host
    Common,
    /// Control plane init, exactly one host
    ControlPlane,
    /// Join the remaining hosts as workers
    Workers,
    /// Platform add-ons, applied through the control plane
    Addons,
}

impl Role {
    /// Every role in execution order
    pub const ORDER: [Role; 4] = [Role::Common, Role::ControlPlane, Role::Workers, Role::Addons];

    /// Step name used in logs and errors
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Common => "common",
            Role::ControlPlane => "control-plane",
            Role::Workers => "workers",
            Role::Addons => "addons",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration engine operations the phase relies on.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConfigurationEngine: Send + Sync {
    /// Apply `role` to `hosts`. In `check` mode nothing may be mutated.
    async fn run_role(&self, role: Role, hosts: &[RemoteTarget], check: bool) -> Result<()>;
}

/// Record of a completed bootstrap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bootstrapped {
    /// Roles that ran, with the hosts each ran against
    pub steps: Vec<(Role, Vec<String>)>,
    /// Whether this was a check-mode run
    pub check: bool,
}

/// Waits for every host, then runs the roles in order.
pub struct ConfigurationPhase {
    engine: Arc<dyn ConfigurationEngine>,
    poller: ReadinessPoller,
    readiness: ReadinessSettings,
    preflight: PreflightChecker,
    requirements: Vec<Requirement>,
}

impl ConfigurationPhase {
    /// Create the phase
    pub fn new(
        engine: Arc<dyn ConfigurationEngine>,
        poller: ReadinessPoller,
        readiness: ReadinessSettings,
        preflight: PreflightChecker,
        requirements: Vec<Requirement>,
    ) -> Self {
        Self {
            engine,
            poller,
            readiness,
            preflight,
            requirements,
        }
    }

    /// Bootstrap `targets`. The first control-plane target is the designated one.
    ///
    /// `check` follows the exact same path, readiness polling included, with
    /// the engine in check mode.
    pub async fn bootstrap(&self, targets: &mut [RemoteTarget], check: bool) -> Result<Bootstrapped> {
        self.preflight.check(&self.requirements).await?;
        self.run(targets, check).await
    }

    /// Like [`bootstrap`](Self::bootstrap), but targets are loaded by `load`
    /// only after preflight passed, so a missing inventory is reported
    /// together with every other unmet requirement.
    pub async fn bootstrap_with<F>(&self, load: F, check: bool) -> Result<Bootstrapped>
    where
        F: FnOnce() -> Result<Vec<RemoteTarget>> + Send,
    {
        self.preflight.check(&self.requirements).await?;
        let mut targets = load()?;
        self.run(&mut targets, check).await
    }

    async fn run(&self, targets: &mut [RemoteTarget], check: bool) -> Result<Bootstrapped> {
        let cp_index = targets
            .iter()
            .position(RemoteTarget::is_control_plane)
            .ok_or_else(|| Error::validation("no control-plane target configured"))?;

        info!(targets = targets.len(), check = check, "Waiting for targets to accept ssh");
        self.poller
            .wait_all_ready(targets, &ssh_check(), &self.readiness)
            .await?;

        let control_plane = vec![targets[cp_index].clone()];
        let workers: Vec<RemoteTarget> = targets
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != cp_index)
            .map(|(_, t)| t.clone())
            .collect();

        let mut steps = Vec::new();
        for role in Role::ORDER {
            let hosts: &[RemoteTarget] = match role {
                Role::Common => targets,
                Role::ControlPlane | Role::Addons => &control_plane,
                Role::Workers => &workers,
            };
            if hosts.is_empty() {
                warn!(step = %role, "No hosts for step, skipping");
                continue;
            }

            info!(step = %role, hosts = hosts.len(), check = check, "Running bootstrap step");
            self.engine
                .run_role(role, hosts, check)
                .await
                .map_err(|e| name_step(e, role, hosts))?;

            steps.push((role, hosts.iter().map(|t| t.name.clone()).collect()));
        }

        info!(check = check, "Bootstrap complete");
        Ok(Bootstrapped { steps, check })
    }
}

/// Make sure a failure names the configure step and its hosts.
fn name_step(err: Error, role: Role, hosts: &[RemoteTarget]) -> Error {
    match err {
        Error::StepFailed {
            phase: PhaseName::Configure,
            ..
        } => err,
        other => Error::step_on(
            PhaseName::Configure,
            role.as_str(),
            host_list(hosts),
            other.to_string(),
        ),
    }
}

pub(crate) fn host_list(hosts: &[RemoteTarget]) -> String {
    hosts
        .iter()
        .map(|t| t.name.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{CommandOutput, CommandRunner, MockCommandRunner};
    use crate::target::{NodeRole, Reachability};
    use mockall::Sequence;

    fn targets() -> Vec<RemoteTarget> {
        vec![
            RemoteTarget::new("cp-1", "10.0.0.10", "ubuntu", NodeRole::ControlPlane),
            RemoteTarget::new("w-1", "10.0.0.11", "ubuntu", NodeRole::Worker),
            RemoteTarget::new("w-2", "10.0.0.12", "ubuntu", NodeRole::Worker),
        ]
    }

    fn reachable_runner() -> Arc<dyn CommandRunner> {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_execute()
            .returning(|_, _, _| Ok(CommandOutput::ok("")));
        Arc::new(runner)
    }

    fn phase(engine: MockConfigurationEngine, runner: Arc<dyn CommandRunner>) -> ConfigurationPhase {
        ConfigurationPhase::new(
            Arc::new(engine),
            ReadinessPoller::new(runner.clone()),
            ReadinessSettings::default(),
            PreflightChecker::new(runner),
            vec![],
        )
    }

    fn names(hosts: &[RemoteTarget]) -> Vec<&str> {
        hosts.iter().map(|t| t.name.as_str()).collect()
    }

    #[tokio::test]
    async fn roles_run_in_order_against_the_right_hosts() {
        let mut engine = MockConfigurationEngine::new();
        let mut seq = Sequence::new();
        engine
            .expect_run_role()
            .withf(|role, hosts, _| *role == Role::Common && names(hosts) == ["cp-1", "w-1", "w-2"])
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        engine
            .expect_run_role()
            .withf(|role, hosts, _| *role == Role::ControlPlane && names(hosts) == ["cp-1"])
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        engine
            .expect_run_role()
            .withf(|role, hosts, _| *role == Role::Workers && names(hosts) == ["w-1", "w-2"])
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        engine
            .expect_run_role()
            .withf(|role, hosts, _| *role == Role::Addons && names(hosts) == ["cp-1"])
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));

        let mut targets = targets();
        let result = phase(engine, reachable_runner())
            .bootstrap(&mut targets, false)
            .await
            .unwrap();
        assert_eq!(result.steps.len(), 4);
        assert!(targets
            .iter()
            .all(|t| t.reachability == Reachability::Reachable));
    }

    #[tokio::test]
    async fn failure_stops_sequence_and_names_step() {
        let mut engine = MockConfigurationEngine::new();
        engine
            .expect_run_role()
            .withf(|role, _, _| *role == Role::Common)
            .returning(|_, _, _| Ok(()));
        engine
            .expect_run_role()
            .withf(|role, _, _| *role == Role::ControlPlane)
            .returning(|_, _, _| {
                Err(Error::step_on(
                    PhaseName::Configure,
                    "control-plane",
                    "cp-1",
                    "kubeadm init failed",
                ))
            });
        engine
            .expect_run_role()
            .withf(|role, _, _| *role == Role::Workers || *role == Role::Addons)
            .never();

        let mut targets = targets();
        let err = phase(engine, reachable_runner())
            .bootstrap(&mut targets, false)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "configure failed at step 'control-plane' on 'cp-1': kubeadm init failed"
        );
    }

    #[tokio::test]
    async fn foreign_errors_get_step_and_hosts() {
        let mut engine = MockConfigurationEngine::new();
        engine.expect_run_role().returning(|_, _, _| {
            Err(Error::Spawn {
                program: "ansible-playbook".into(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            })
        });

        let mut targets = targets();
        let err = phase(engine, reachable_runner())
            .bootstrap(&mut targets, false)
            .await
            .unwrap_err();
        match err {
            Error::StepFailed { step, target, .. } => {
                assert_eq!(step, "common");
                assert_eq!(target.as_deref(), Some("cp-1,w-1,w-2"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn check_mode_passes_through() {
        let mut engine = MockConfigurationEngine::new();
        engine
            .expect_run_role()
            .withf(|_, _, check| *check)
            .times(4)
            .returning(|_, _, _| Ok(()));

        let mut targets = targets();
        let result = phase(engine, reachable_runner())
            .bootstrap(&mut targets, true)
            .await
            .unwrap();
        assert!(result.check);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_target_fails_before_any_role() {
        let mut engine = MockConfigurationEngine::new();
        engine.expect_run_role().never();

        let mut runner = MockCommandRunner::new();
        runner.expect_execute().returning(|_, target, _| {
            if target.map(|t| t.name.as_str()) == Some("w-2") {
                Ok(CommandOutput::failed(255, "ssh: connect to host 10.0.0.12 port 22: Connection refused"))
            } else {
                Ok(CommandOutput::ok(""))
            }
        });

        let mut targets = targets();
        let err = phase(engine, Arc::new(runner))
            .bootstrap(&mut targets, true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unreachable { ref target, .. } if target == "w-2"));
        assert_eq!(targets[2].reachability, Reachability::Unreachable);
    }

    #[tokio::test]
    async fn no_control_plane_is_a_validation_error() {
        let engine = MockConfigurationEngine::new();
        let mut targets = vec![RemoteTarget::new("w-1", "10.0.0.11", "ubuntu", NodeRole::Worker)];
        let err = phase(engine, reachable_runner())
            .bootstrap(&mut targets, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn single_node_skips_workers() {
        let mut engine = MockConfigurationEngine::new();
        engine
            .expect_run_role()
            .withf(|role, _, _| *role == Role::Workers)
            .never();
        engine.expect_run_role().times(3).returning(|_, _, _| Ok(()));

        let mut targets = vec![RemoteTarget::new("cp-1", "10.0.0.10", "ubuntu", NodeRole::ControlPlane)];
        let result = phase(engine, reachable_runner())
            .bootstrap(&mut targets, false)
            .await
            .unwrap();
        assert_eq!(
            result.steps.iter().map(|(r, _)| *r).collect::<Vec<_>>(),
            vec![Role::Common, Role::ControlPlane, Role::Addons]
        );
    }

    #[tokio::test]
    async fn missing_inventory_reported_with_other_requirements() {
        let mut engine = MockConfigurationEngine::new();
        engine.expect_run_role().never();

        let mut runner = MockCommandRunner::new();
        runner.expect_execute().returning(|cmd, _, _| {
            Err(Error::Spawn {
                program: cmd.program.clone(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            })
        });
        let runner: Arc<dyn CommandRunner> = Arc::new(runner);
        let phase = ConfigurationPhase::new(
            Arc::new(engine),
            ReadinessPoller::new(runner.clone()),
            ReadinessSettings::default(),
            PreflightChecker::new(runner),
            vec![
                Requirement::tool("keel-no-such-ansible"),
                Requirement::path("inventory /nonexistent/inventory.ini", "/nonexistent/inventory.ini"),
            ],
        );

        let err = phase
            .bootstrap_with(
                || Err(Error::validation("inventory must not be read before preflight")),
                true,
            )
            .await
            .unwrap_err();
        match err {
            Error::Precondition { missing } => assert_eq!(
                missing,
                vec!["keel-no-such-ansible", "inventory /nonexistent/inventory.ini"]
            ),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn targets_loaded_after_preflight() {
        let mut engine = MockConfigurationEngine::new();
        engine.expect_run_role().times(4).returning(|_, _, _| Ok(()));

        let result = phase(engine, reachable_runner())
            .bootstrap_with(|| Ok(targets()), false)
            .await
            .unwrap();
        assert_eq!(result.steps[0].1, vec!["cp-1", "w-1", "w-2"]);
    }
}
