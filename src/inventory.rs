//! Reading remote targets out of an Ansible INI inventory
//!
//! Only the parts the orchestrator needs are understood: host lines in the
//! control-plane and worker groups, their connection variables, and
//! `[all:vars]` defaults. Everything else in the file belongs to the
//! configuration engine and is skipped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::target::{NodeRole, RemoteTarget};
use crate::{Error, Result};

const CONTROL_PLANE_GROUPS: &[&str] = &["control_plane", "control-plane", "controlplane", "masters"];
const WORKER_GROUPS: &[&str] = &["workers", "worker", "nodes"];

/// Load targets from an inventory file
pub fn load(path: &Path, default_user: &str) -> Result<Vec<RemoteTarget>> {
    let content = std::fs::read_to_string(path).map_err(|e| Error::Config {
        path: path.to_path_buf(),
        message: format!("failed to read inventory: {}", e),
    })?;
    parse(&content, default_user).map_err(|message| Error::Config {
        path: path.to_path_buf(),
        message,
    })
}

/// Parse inventory text into targets, control plane hosts first.
pub fn parse(content: &str, default_user: &str) -> std::result::Result<Vec<RemoteTarget>, String> {
    let mut section = String::new();
    let mut globals: HashMap<String, String> = HashMap::new();
    let mut hosts: Vec<(NodeRole, String, HashMap<String, String>)> = Vec::new();

    for (lineno, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            section = name.trim().to_string();
            continue;
        }

        if section == "all:vars" {
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| format!("line {}: expected key=value", lineno + 1))?;
            globals.insert(key.trim().to_string(), unquote(value.trim()));
            continue;
        }

        let role = if CONTROL_PLANE_GROUPS.contains(&section.as_str()) {
            NodeRole::ControlPlane
        } else if WORKER_GROUPS.contains(&section.as_str()) {
            NodeRole::Worker
        } else {
            continue;
        };

        let mut parts = line.split_whitespace();
        let name = parts
            .next()
            .ok_or_else(|| format!("line {}: empty host line", lineno + 1))?
            .to_string();
        let mut vars = HashMap::new();
        for part in parts {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| format!("line {}: expected key=value, got '{}'", lineno + 1, part))?;
            vars.insert(key.to_string(), unquote(value));
        }
        hosts.push((role, name, vars));
    }

    let mut targets: Vec<RemoteTarget> = hosts
        .into_iter()
        .map(|(role, name, vars)| -> std::result::Result<RemoteTarget, String> {
            let lookup = |key: &str| vars.get(key).or_else(|| globals.get(key)).cloned();
            let address = lookup("ansible_host").unwrap_or_else(|| name.clone());
            let user = lookup("ansible_user").unwrap_or_else(|| default_user.to_string());
            let mut target = RemoteTarget::new(name.clone(), address, user, role);
            if let Some(port) = lookup("ansible_port") {
                target.port = port
                    .parse()
                    .map_err(|_| format!("host {}: invalid ansible_port '{}'", name, port))?;
            }
            if let Some(key) = lookup("ansible_ssh_private_key_file") {
                target.identity_file = Some(expand_home(&key));
            }
            Ok(target)
        })
        .collect::<std::result::Result<_, _>>()?;

    // stable: control plane first, inventory order otherwise
    targets.sort_by_key(|t| !t.is_control_plane());
    Ok(targets)
}

fn unquote(value: &str) -> String {
    value.trim_matches(|c| c == '"' || c == '\'').to_string()
}

/// Expand a leading `~/` to the home directory
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}
