//! Vault HTTP API client for the reconciliation steps

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{AuthMethodConfig, AuthStep, PolicyDocument, RoleBinding, SecretsEngine};
use crate::backend::Ensured;
use crate::error::PhaseName;
use crate::{Error, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Vault error text when a mount path is taken
const PATH_IN_USE: &str = "path is already in use";

#[derive(Debug, Deserialize)]
struct MountEntry {
    #[serde(rename = "type")]
    type_: String,
}

/// Talks to Vault with a caller-supplied token.
pub struct VaultClient {
    http: reqwest::Client,
    addr: String,
    token: SecretString,
}

impl VaultClient {
    /// Client for the Vault at `addr`, authenticating with `token`
    pub fn new(addr: impl Into<String>, token: SecretString) -> Result<Self> {
        let addr = addr.into().trim_end_matches('/').to_string();
        if addr.is_empty() {
            return Err(Error::validation("secrets engine address is empty"));
        }
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { http, addr, token })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.addr, path.trim_start_matches('/'))
    }

    /// Send a request and return the body; non-2xx becomes a step failure with Vault's errors
    async fn request(
        &self,
        step: AuthStep,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<(StatusCode, String)> {
        debug!(method = %method, path = %path, "Secrets engine request");
        let mut req = self
            .http
            .request(method, self.url(path))
            .header("X-Vault-Token", self.token.expose_secret());
        if let Some(body) = body {
            req = req.json(&body);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| Error::step(PhaseName::FixAuth, step.as_str(), e.to_string()))?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| {
            Error::step(
                PhaseName::FixAuth,
                step.as_str(),
                format!("{}: failed to read response body: {}", status.as_u16(), e),
            )
        })?;
        Ok((status, text))
    }

    async fn write(&self, step: AuthStep, method: Method, path: &str, body: Value) -> Result<()> {
        let (status, text) = self.request(step, method, path, Some(body)).await?;
        if status.is_success() {
            Ok(())
        } else {
            Err(api_error(step, status, &text))
        }
    }
}

/// Vault error bodies are `{"errors": [...]}`; fall back to the raw body
fn api_error(step: AuthStep, status: StatusCode, body: &str) -> Error {
    let errors = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("errors").cloned())
        .and_then(|v| serde_json::from_value::<Vec<String>>(v).ok())
        .filter(|e| !e.is_empty())
        .map(|e| e.join("; "))
        .unwrap_or_else(|| body.trim().to_string());
    Error::step(
        PhaseName::FixAuth,
        step.as_str(),
        format!("{}: {}", status.as_u16(), errors),
    )
}

/// Whether `sys/auth` output has a mount at `path` of the given type
fn has_mount(mounts_json: &str, path: &str, method_type: &str) -> Result<bool> {
    let value: Value = serde_json::from_str(mounts_json)
        .map_err(|e| Error::serialization(format!("invalid sys/auth response: {}", e)))?;
    // newer servers nest mounts under "data", older ones return them at the top level
    let mounts = value.get("data").cloned().unwrap_or(value);
    let mounts: HashMap<String, Value> = serde_json::from_value(mounts)
        .map_err(|e| Error::serialization(format!("invalid sys/auth response: {}", e)))?;

    let key = format!("{}/", path);
    match mounts.get(&key) {
        None => Ok(false),
        Some(entry) => {
            let entry: MountEntry = serde_json::from_value(entry.clone())
                .map_err(|e| Error::serialization(format!("invalid mount entry: {}", e)))?;
            if entry.type_ == method_type {
                Ok(true)
            } else {
                Err(Error::step(
                    PhaseName::FixAuth,
                    AuthStep::EnableAuthMethod.as_str(),
                    format!(
                        "path {} is mounted with auth type '{}', expected '{}'",
                        key, entry.type_, method_type
                    ),
                ))
            }
        }
    }
}

fn role_body(role: &RoleBinding) -> Result<Value> {
    serde_json::to_value(role).map_err(|e| Error::serialization(e.to_string()))
}

#[async_trait]
impl SecretsEngine for VaultClient {
    async fn enable_auth(&self, path: &str, method_type: &str) -> Result<Ensured> {
        let step = AuthStep::EnableAuthMethod;

        let (status, text) = self.request(step, Method::GET, "sys/auth", None).await?;
        if !status.is_success() {
            return Err(api_error(step, status, &text));
        }
        if has_mount(&text, path, method_type)? {
            return Ok(Ensured::AlreadyExists);
        }

        let (status, text) = self
            .request(
                step,
                Method::POST,
                &format!("sys/auth/{}", path),
                Some(json!({ "type": method_type })),
            )
            .await?;
        if status.is_success() {
            Ok(Ensured::Created)
        } else if text.contains(PATH_IN_USE) {
            Ok(Ensured::AlreadyExists)
        } else {
            Err(api_error(step, status, &text))
        }
    }

    async fn write_auth_config(&self, path: &str, config: &AuthMethodConfig) -> Result<()> {
        self.write(
            AuthStep::WriteAuthConfig,
            Method::POST,
            &format!("auth/{}/config", path),
            json!({
                "kubernetes_host": config.kubernetes_host,
                "kubernetes_ca_cert": config.kubernetes_ca_cert,
                "token_reviewer_jwt": config.token_reviewer_jwt.expose_secret(),
                "disable_local_ca_jwt": false,
            }),
        )
        .await
    }

    async fn write_policy(&self, policy: &PolicyDocument) -> Result<()> {
        self.write(
            AuthStep::WritePolicy,
            Method::PUT,
            &format!("sys/policies/acl/{}", policy.name),
            json!({ "policy": policy.body }),
        )
        .await
    }

    async fn write_role(&self, path: &str, role: &RoleBinding) -> Result<()> {
        self.write(
            AuthStep::WriteRole,
            Method::POST,
            &format!("auth/{}/role/{}", path, role.name),
            role_body(role)?,
        )
        .await
    }
}
