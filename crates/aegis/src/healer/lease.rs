//! Per-node leader election over `coordination.k8s.io/v1` Leases.
//!
//! Only the holder of the Lease named after the node runs the healing body,
//! so concurrent healer replicas never act on the same node. The Lease is
//! released by clearing its holder when the body returns or the invocation
//! is cancelled.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, PostParams};
use kube::core::ObjectMeta;
use kube::{Client, Error as KubeError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::LeaseIdentity;

#[derive(Error, Debug)]
pub enum LeaseError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] KubeError),

    #[error("lost lease {name}")]
    Lost { name: String },
}

#[derive(Debug, Clone)]
pub struct LeaseConfig {
    pub namespace: String,
    pub identity: String,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

impl LeaseConfig {
    pub fn new(namespace: &str, identity: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            lease_duration: Duration::from_secs(30),
            renew_deadline: Duration::from_secs(15),
            retry_period: Duration::from_millis(7500),
        }
    }
}

impl From<&LeaseIdentity> for LeaseConfig {
    fn from(identity: &LeaseIdentity) -> Self {
        Self::new(&identity.namespace, &identity.holder)
    }
}

/// Whether a lease nobody renewed within its duration can be taken over.
fn is_expired(spec: &LeaseSpec, now: DateTime<Utc>) -> bool {
    if spec.holder_identity.as_deref().is_none_or(str::is_empty) {
        return true;
    }
    let Some(renew_time) = &spec.renew_time else {
        return true;
    };
    let Some(duration_seconds) = spec.lease_duration_seconds else {
        return true;
    };

    renew_time.0 + chrono::Duration::seconds(i64::from(duration_seconds)) < now
}

fn holder(lease: &Lease) -> Option<&str> {
    lease.spec.as_ref()?.holder_identity.as_deref()
}

/// Lease guarding one node.
pub struct NodeLease {
    api: Api<Lease>,
    name: String,
    config: LeaseConfig,
}

impl NodeLease {
    pub fn new(client: Client, node: &str, config: LeaseConfig) -> Self {
        Self {
            api: Api::namespaced(client, &config.namespace),
            name: node.to_string(),
            config,
        }
    }

    fn spec(&self, previous: Option<&LeaseSpec>) -> LeaseSpec {
        let now = MicroTime(Utc::now());
        let same_holder = previous
            .and_then(|p| p.holder_identity.as_deref())
            .is_some_and(|h| h == self.config.identity);
        let transitions = previous.and_then(|p| p.lease_transitions).unwrap_or(0);

        LeaseSpec {
            holder_identity: Some(self.config.identity.clone()),
            lease_duration_seconds: Some(self.config.lease_duration.as_secs() as i32),
            acquire_time: if same_holder {
                previous.and_then(|p| p.acquire_time.clone())
            } else {
                Some(now.clone())
            },
            renew_time: Some(now),
            lease_transitions: Some(if same_holder || previous.is_none() {
                transitions
            } else {
                transitions + 1
            }),
            ..LeaseSpec::default()
        }
    }

    /// Create, take over or renew the lease. `false` means someone else holds it.
    pub async fn try_acquire_or_renew(&self) -> Result<bool, LeaseError> {
        let Some(mut existing) = self.api.get_opt(&self.name).await? else {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(self.name.clone()),
                    namespace: Some(self.config.namespace.clone()),
                    ..ObjectMeta::default()
                },
                spec: Some(self.spec(None)),
            };
            return match self.api.create(&PostParams::default(), &lease).await {
                Ok(_) => Ok(true),
                Err(KubeError::Api(err)) if err.code == 409 => Ok(false),
                Err(e) => Err(e.into()),
            };
        };

        let mine = holder(&existing) == Some(self.config.identity.as_str());
        let expired = existing
            .spec
            .as_ref()
            .is_none_or(|spec| is_expired(spec, Utc::now()));
        if !mine && !expired {
            debug!(lease = %self.name, holder = ?holder(&existing), "Lease held by another healer");
            return Ok(false);
        }

        existing.spec = Some(self.spec(existing.spec.as_ref()));
        match self
            .api
            .replace(&self.name, &PostParams::default(), &existing)
            .await
        {
            Ok(_) => Ok(true),
            Err(KubeError::Api(err)) if err.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Clear the holder if it is still us.
    pub async fn release(&self) -> Result<(), LeaseError> {
        let Some(mut existing) = self.api.get_opt(&self.name).await? else {
            return Ok(());
        };
        if holder(&existing) != Some(self.config.identity.as_str()) {
            return Ok(());
        }

        if let Some(spec) = existing.spec.as_mut() {
            spec.holder_identity = None;
            spec.acquire_time = None;
            spec.renew_time = None;
            spec.lease_duration_seconds = Some(1);
        }
        self.api
            .replace(&self.name, &PostParams::default(), &existing)
            .await?;
        info!(lease = %self.name, "Lease released");
        Ok(())
    }
}

/// Run `body` while holding the node's lease.
///
/// Waits for leadership until `token` is cancelled, in which case `body`
/// never runs and `Ok(None)` is returned. Cancelling while `body` runs drops
/// it. The lease is released on every exit path.
pub async fn with_node_lease<F, Fut, T>(
    client: Client,
    node: &str,
    config: LeaseConfig,
    token: CancellationToken,
    body: F,
) -> Result<Option<T>, LeaseError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    let retry_period = config.retry_period;
    let renew_deadline = config.renew_deadline;
    let lease = NodeLease::new(client, node, config);

    loop {
        match lease.try_acquire_or_renew().await {
            Ok(true) => break,
            Ok(false) => {}
            Err(e) => warn!(lease = %node, error = %e, "Failed to acquire lease"),
        }
        tokio::select! {
            () = token.cancelled() => {
                info!(lease = %node, "Cancelled while waiting for leadership");
                return Ok(None);
            }
            () = tokio::time::sleep(retry_period) => {}
        }
    }
    info!(lease = %node, "Acquired node lease");

    let body = body();
    tokio::pin!(body);
    let mut renew = tokio::time::interval(retry_period);
    renew.tick().await;
    let mut last_renew = tokio::time::Instant::now();

    let outcome = loop {
        tokio::select! {
            out = &mut body => break Ok(Some(out)),
            () = token.cancelled() => {
                info!(lease = %node, "Cancelled while holding the lease");
                break Ok(None);
            }
            _ = renew.tick() => match lease.try_acquire_or_renew().await {
                Ok(true) => last_renew = tokio::time::Instant::now(),
                Ok(false) => {
                    error!(lease = %node, "Lease taken over by another healer");
                    break Err(LeaseError::Lost { name: node.to_string() });
                }
                Err(e) if last_renew.elapsed() > renew_deadline => {
                    error!(lease = %node, error = %e, "Failed to renew lease before the deadline");
                    break Err(LeaseError::Lost { name: node.to_string() });
                }
                Err(e) => warn!(lease = %node, error = %e, "Failed to renew lease"),
            },
        }
    };

    if let Err(e) = lease.release().await {
        warn!(lease = %node, error = %e, "Failed to release lease");
    }
    outcome
}
