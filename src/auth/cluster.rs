//! Cluster side of reconciliation through the Kubernetes API

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleRef, Subject};
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use secrecy::SecretString;
use tracing::{debug, info};

use super::{AuthStep, ClusterAccess, ServiceIdentity};
use crate::error::PhaseName;
use crate::kube_utils::{self, ClusterInfo};
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::{Error, Result};

/// Secret type the token controller populates
const SA_TOKEN_SECRET_TYPE: &str = "kubernetes.io/service-account-token";
/// Annotation binding a token Secret to its ServiceAccount
const SA_NAME_ANNOTATION: &str = "kubernetes.io/service-account.name";
/// ClusterRole that allows TokenReview
const AUTH_DELEGATOR_ROLE: &str = "system:auth-delegator";

const TOKEN_POLL_ATTEMPTS: u32 = 30;
const TOKEN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// [`ClusterAccess`] backed by a kubeconfig.
pub struct KubeClusterAccess {
    kubeconfig: Option<PathBuf>,
    endpoint_override: Option<String>,
}

impl KubeClusterAccess {
    /// Reach the cluster through `kubeconfig` (kube defaults when `None`).
    ///
    /// `endpoint_override` replaces the kubeconfig server, for when the
    /// secrets engine sees the API server at a different address.
    pub fn new(kubeconfig: Option<PathBuf>, endpoint_override: Option<String>) -> Self {
        Self {
            kubeconfig,
            endpoint_override,
        }
    }

    async fn client(&self) -> Result<Client> {
        kube_utils::create_client(self.kubeconfig.as_deref()).await
    }
}

fn step_error(step: AuthStep, message: impl Into<String>) -> Error {
    Error::step(PhaseName::FixAuth, step.as_str(), message)
}

/// Create `obj`, treating 409 Conflict as already present
async fn create_if_missing<K>(api: &Api<K>, obj: &K, what: &str) -> Result<()>
where
    K: kube::Resource + Clone + serde::Serialize + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api.create(&PostParams::default(), obj).await {
        Ok(_) => {
            info!(resource = %what, "Created");
            Ok(())
        }
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            debug!(resource = %what, "Already exists");
            Ok(())
        }
        Err(e) => Err(step_error(
            AuthStep::MintReviewerToken,
            format!("failed to create {}: {}", what, e),
        )),
    }
}

fn token_secret(identity: &ServiceIdentity) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(identity.token_secret.clone()),
            namespace: Some(identity.namespace.clone()),
            annotations: Some(BTreeMap::from([(
                SA_NAME_ANNOTATION.to_string(),
                identity.service_account.clone(),
            )])),
            ..Default::default()
        },
        type_: Some(SA_TOKEN_SECRET_TYPE.to_string()),
        ..Default::default()
    }
}

fn reviewer_binding(identity: &ServiceIdentity) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(format!("{}-tokenreview", identity.service_account)),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: AUTH_DELEGATOR_ROLE.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: identity.service_account.clone(),
            namespace: Some(identity.namespace.clone()),
            ..Default::default()
        }]),
    }
}

/// Token from a populated token Secret
fn token_of(secret: &Secret) -> Option<SecretString> {
    let bytes = secret.data.as_ref()?.get("token")?;
    let token = String::from_utf8(bytes.0.clone()).ok()?;
    if token.is_empty() {
        None
    } else {
        Some(SecretString::from(token))
    }
}

/// Re-read the token Secret under `policy` until the token controller has
/// filled in `data.token`.
async fn wait_for_token<F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut fetch: F,
) -> Result<SecretString>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<Secret, kube::Error>>,
{
    let step = AuthStep::MintReviewerToken;
    let attempts = policy.max_attempts();
    retry_with_backoff(policy, "read_reviewer_token", || {
        let pending = fetch();
        async move {
            let secret = pending.await.map_err(|e| {
                step_error(step, format!("failed to read token secret {}: {}", what, e))
            })?;
            token_of(&secret).ok_or_else(|| {
                step_error(
                    step,
                    format!("token secret {} not populated after {} reads", what, attempts),
                )
            })
        }
    })
    .await
}

#[async_trait]
impl ClusterAccess for KubeClusterAccess {
    async fn cluster_info(&self) -> Result<ClusterInfo> {
        let mut info = kube_utils::cluster_info(self.kubeconfig.as_deref())
            .map_err(|e| step_error(AuthStep::FetchClusterEndpoint, e.to_string()))?;
        if let Some(endpoint) = &self.endpoint_override {
            info.endpoint = endpoint.clone();
        }
        Ok(info)
    }

    async fn reviewer_token(&self, identity: &ServiceIdentity) -> Result<SecretString> {
        let step = AuthStep::MintReviewerToken;
        let client = self
            .client()
            .await
            .map_err(|e| step_error(step, e.to_string()))?;

        let accounts: Api<ServiceAccount> = Api::namespaced(client.clone(), &identity.namespace);
        let account = ServiceAccount {
            metadata: ObjectMeta {
                name: Some(identity.service_account.clone()),
                namespace: Some(identity.namespace.clone()),
                ..Default::default()
            },
            ..Default::default()
        };
        create_if_missing(
            &accounts,
            &account,
            &format!("ServiceAccount {}/{}", identity.namespace, identity.service_account),
        )
        .await?;

        let bindings: Api<ClusterRoleBinding> = Api::all(client.clone());
        create_if_missing(
            &bindings,
            &reviewer_binding(identity),
            &format!("ClusterRoleBinding {}-tokenreview", identity.service_account),
        )
        .await?;

        let secrets: Api<Secret> = Api::namespaced(client, &identity.namespace);
        create_if_missing(
            &secrets,
            &token_secret(identity),
            &format!("Secret {}/{}", identity.namespace, identity.token_secret),
        )
        .await?;

        let what = format!("{}/{}", identity.namespace, identity.token_secret);
        let policy = RetryPolicy::fixed(TOKEN_POLL_ATTEMPTS, TOKEN_POLL_INTERVAL);
        let secrets = &secrets;
        wait_for_token(&policy, &what, || secrets.get(&identity.token_secret)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use secrecy::ExposeSecret;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn identity() -> ServiceIdentity {
        ServiceIdentity {
            namespace: "vault".into(),
            service_account: "vault-auth".into(),
            token_secret: "vault-auth-token".into(),
        }
    }

    #[test]
    fn token_secret_is_bound_to_service_account() {
        let secret = token_secret(&identity());
        assert_eq!(secret.type_.as_deref(), Some(SA_TOKEN_SECRET_TYPE));
        assert_eq!(
            secret
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(SA_NAME_ANNOTATION))
                .map(String::as_str),
            Some("vault-auth")
        );
    }

    #[test]
    fn binding_grants_auth_delegator() {
        let binding = reviewer_binding(&identity());
        assert_eq!(binding.role_ref.name, AUTH_DELEGATOR_ROLE);
        let subject = &binding.subjects.unwrap()[0];
        assert_eq!(subject.name, "vault-auth");
        assert_eq!(subject.namespace.as_deref(), Some("vault"));
    }

    #[test]
    fn unpopulated_secret_has_no_token() {
        assert!(token_of(&token_secret(&identity())).is_none());

        let mut secret = token_secret(&identity());
        secret.data = Some(BTreeMap::from([(
            "token".to_string(),
            ByteString(b"eyJhbGciOi".to_vec()),
        )]));
        assert_eq!(token_of(&secret).unwrap().expose_secret(), "eyJhbGciOi");
    }

    fn populated(token: &str) -> Secret {
        let mut secret = token_secret(&identity());
        secret.data = Some(BTreeMap::from([(
            "token".to_string(),
            ByteString(token.as_bytes().to_vec()),
        )]));
        secret
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_token_controller() {
        let reads = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(TOKEN_POLL_ATTEMPTS, TOKEN_POLL_INTERVAL);

        let token = wait_for_token(&policy, "vault/vault-auth-token", || {
            let n = reads.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 3 {
                    Ok(token_secret(&identity()))
                } else {
                    Ok(populated("eyJhbGciOi"))
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(token.expose_secret(), "eyJhbGciOi");
        assert_eq!(reads.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_bounded_reads() {
        let reads = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(5, TOKEN_POLL_INTERVAL);
        let started = tokio::time::Instant::now();

        let err = wait_for_token(&policy, "vault/vault-auth-token", || {
            reads.fetch_add(1, Ordering::SeqCst);
            async { Ok(token_secret(&identity())) }
        })
        .await
        .unwrap_err();

        assert_eq!(reads.load(Ordering::SeqCst), 5);
        assert_eq!(started.elapsed(), Duration::from_secs(4));
        assert_eq!(
            err.to_string(),
            "fix-auth failed at step 'mint-reviewer-token': token secret vault/vault-auth-token not populated after 5 reads"
        );
    }
}
