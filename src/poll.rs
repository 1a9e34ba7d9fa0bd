//! Readiness polling for freshly provisioned hosts
//!
//! Hosts come up some time after the provisioning engine reports success.
//! The poller checks each one over ssh at a fixed interval until the check
//! succeeds or the deadline passes.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::runner::{CommandRunner, CommandSpec};
use crate::target::{Reachability, RemoteTarget};
use crate::{Error, Result};

/// Outcome of a polling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The check succeeded
    Ready,
    /// The deadline passed without a successful check
    TimedOut,
}

/// Polling window applied to every target before configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessSettings {
    /// Length of one polling window
    pub timeout_secs: u64,
    /// Time between check starts
    pub interval_secs: u64,
    /// Polling windows per target before giving up
    pub attempts: u32,
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            interval_secs: 5,
            attempts: 3,
        }
    }
}

impl ReadinessSettings {
    /// Window length
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Check interval
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Trivial remote command used to prove a host accepts ssh sessions
pub fn ssh_check() -> CommandSpec {
    CommandSpec::new("true")
}

/// Checks remote targets until they respond.
pub struct ReadinessPoller {
    runner: Arc<dyn CommandRunner>,
}

impl ReadinessPoller {
    /// Create a poller executing checks through `runner`
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Check `target` every `interval` until `check` succeeds or `timeout` elapses.
    ///
    /// Check starts are never closer together than `interval`, and no check
    /// outlives the deadline. Returns [`Readiness::TimedOut`] instead of an
    /// error when the deadline passes; `Err` only if the check cannot run.
    pub async fn wait_until_ready(
        &self,
        target: &mut RemoteTarget,
        check: &CommandSpec,
        timeout: Duration,
        interval: Duration,
    ) -> Result<Readiness> {
        let deadline = Instant::now() + timeout;
        let mut checks = 0u32;

        loop {
            let started = Instant::now();
            let remaining = deadline.saturating_duration_since(started);
            if remaining.is_zero() {
                break;
            }

            checks += 1;
            let output = self
                .runner
                .execute(check, Some(&*target), Some(remaining))
                .await?;

            if output.success() {
                target.reachability = Reachability::Reachable;
                debug!(target = %target.name, checks = checks, "Target reachable");
                return Ok(Readiness::Ready);
            }

            debug!(
                target = %target.name,
                checks = checks,
                error = %output.error_text(),
                "Target not reachable yet"
            );

            let next = (started + interval).min(deadline);
            tokio::time::sleep_until(next).await;
        }

        target.reachability = Reachability::Unreachable;
        Ok(Readiness::TimedOut)
    }

    /// Wait for every target, allowing `settings.attempts` polling windows each.
    ///
    /// Fails naming the first target that never became reachable.
    pub async fn wait_all_ready(
        &self,
        targets: &mut [RemoteTarget],
        check: &CommandSpec,
        settings: &ReadinessSettings,
    ) -> Result<()> {
        let attempts = settings.attempts.max(1);

        for target in targets.iter_mut() {
            let mut ready = false;
            for attempt in 1..=attempts {
                info!(target = %target, attempt = attempt, "Waiting for target");
                match self
                    .wait_until_ready(target, check, settings.timeout(), settings.interval())
                    .await?
                {
                    Readiness::Ready => {
                        ready = true;
                        break;
                    }
                    Readiness::TimedOut => {
                        warn!(
                            target = %target.name,
                            attempt = attempt,
                            "Target did not become reachable in time"
                        );
                    }
                }
            }
            if !ready {
                return Err(Error::Unreachable {
                    target: target.name.clone(),
                    attempts,
                });
            }
        }

        Ok(())
    }
}
