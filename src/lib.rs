//! Keel - lifecycle orchestrator for a self-hosted cluster
//!
//! Keel sequences the external tools that build and tear down a cluster:
//! the provisioning engine for cloud resources, the configuration engine for
//! host bootstrap, the cloud CLI for the remote state backend, and the
//! secrets engine's API for cluster trust. It owns no durable state; every
//! phase checks its prerequisites first and can be re-run safely.
//!
//! # Phases
//!
//! - [`provision`] - plan, confirm, apply; destroy only with teardown clearance
//! - [`configure`] - readiness polling, then roles in fixed order
//! - [`teardown`] - double confirmation before destroy, so nothing is orphaned
//! - [`backend`] - idempotent remote state backend creation and state backup
//! - [`auth`] - six-step secrets engine trust reconciliation
//!
//! # Building blocks
//!
//! - [`runner`] - local and remote command execution with retry
//! - [`retry`] - retry policies and backoff
//! - [`poll`] - remote readiness polling
//! - [`preflight`] - tool and credential checks
//! - [`confirm`] - confirmation gates
//! - [`config`] - configuration file, environment overrides, inventory
//! - [`error`] - error types and exit codes

#![deny(missing_docs)]

pub mod auth;
pub mod backend;
pub mod config;
pub mod configure;
pub mod confirm;
pub mod error;
pub mod inventory;
pub mod kube_utils;
pub mod poll;
pub mod preflight;
pub mod provision;
pub mod retry;
pub mod runner;
pub mod target;
pub mod teardown;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::{Error, PhaseName};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
