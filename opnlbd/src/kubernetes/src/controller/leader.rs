use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::error::Error;

const LEASE_DURATION: Duration = Duration::from_secs(15);
const RENEW_DEADLINE: Duration = Duration::from_secs(10);
const RETRY_PERIOD: Duration = Duration::from_secs(2);
const FIELD_MANAGER: &str = "opnsense-lb-controller";

/// Single-leader gate backed by a coordination.k8s.io Lease so that
/// concurrent replicas do not write to the appliance at the same time.
/// Non-leaders block in `acquire`; the holder renews every retry period
/// and treats a renew-deadline worth of failed renews as leadership loss.
pub struct LeaderElector {
    client: Client,
    lease_name: String,
    namespace: String,
    identity: String,
}

impl LeaderElector {
    pub fn new(client: Client, lease_name: &str, namespace: &str, identity: &str) -> LeaderElector {
        LeaderElector {
            client,
            lease_name: lease_name.to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
        }
    }

    /// Blocks until leadership is acquired, then returns a guard whose
    /// renewal task keeps the lease. `LeaderGuard::lost` resolves when
    /// leadership is gone.
    pub async fn acquire(self: Arc<Self>) -> LeaderGuard {
        tracing::info!(
            identity = self.identity,
            lease = self.lease_name,
            namespace = self.namespace,
            "Waiting for leadership"
        );
        loop {
            match self.try_acquire_lease().await {
                Ok(true) => {
                    tracing::info!(identity = self.identity, "Leadership acquired");
                    break;
                }
                Ok(false) => {
                    tracing::debug!(identity = self.identity, "Lease held by another replica");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to check leadership");
                }
            }
            tokio::time::sleep(RETRY_PERIOD).await;
        }

        let (lost_tx, lost_rx) = oneshot::channel();
        let elector = self.clone();
        let renewal_task = tokio::spawn(async move {
            elector.renewal_loop(lost_tx).await;
        });
        LeaderGuard {
            renewal_task,
            lost_rx: Some(lost_rx),
        }
    }

    /// Clears the holder so another replica can take over without waiting
    /// for the lease to expire. Called on clean shutdown.
    pub async fn release(&self) {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let patch = serde_json::json!({
            "apiVersion": "coordination.k8s.io/v1",
            "kind": "Lease",
            "metadata": {
                "name": self.lease_name,
                "namespace": self.namespace,
            },
            "spec": {
                "holderIdentity": "",
            }
        });
        match api
            .patch(
                &self.lease_name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&patch),
            )
            .await
        {
            Ok(_) => tracing::info!(identity = self.identity, "Released lease"),
            Err(e) => tracing::warn!(error = %e, "Failed to release lease"),
        }
    }

    async fn try_acquire_lease(&self) -> Result<bool, Error> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let now = Utc::now();

        match api.get(&self.lease_name).await {
            Ok(lease) => {
                let spec = lease.spec.as_ref();
                let holder = spec.and_then(|s| s.holder_identity.as_deref());

                if holder == Some(self.identity.as_str()) {
                    return self.renew_lease(&api, now).await;
                }

                let renew_time = spec.and_then(|s| s.renew_time.as_ref());
                let duration_secs = spec.and_then(|s| s.lease_duration_seconds);
                let expired = match (holder, renew_time, duration_secs) {
                    (Some(""), _, _) | (None, _, _) => true,
                    (_, Some(rt), Some(duration)) => {
                        now > rt.0 + chrono::Duration::seconds(duration as i64)
                    }
                    _ => true,
                };
                if !expired {
                    return Ok(false);
                }
                let transitions = spec.and_then(|s| s.lease_transitions).unwrap_or(0);
                self.take_over_lease(&api, now, transitions).await
            }
            Err(kube::Error::Api(e)) if e.code == 404 => self.create_lease(&api, now).await,
            Err(e) => Err(Error::Kube(e)),
        }
    }

    async fn create_lease(
        &self,
        api: &Api<Lease>,
        now: chrono::DateTime<Utc>,
    ) -> Result<bool, Error> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(LEASE_DURATION.as_secs() as i32),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(0),
                ..Default::default()
            }),
        };
        match api.create(&PostParams::default(), &lease).await {
            Ok(_) => Ok(true),
            // Lost the race to another replica.
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(Error::Kube(e)),
        }
    }

    async fn renew_lease(
        &self,
        api: &Api<Lease>,
        now: chrono::DateTime<Utc>,
    ) -> Result<bool, Error> {
        let patch = serde_json::json!({
            "apiVersion": "coordination.k8s.io/v1",
            "kind": "Lease",
            "metadata": {
                "name": self.lease_name,
                "namespace": self.namespace,
            },
            "spec": {
                "renewTime": MicroTime(now),
            }
        });
        api.patch(
            &self.lease_name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&patch),
        )
        .await
        .map_err(Error::Kube)?;
        Ok(true)
    }

    async fn take_over_lease(
        &self,
        api: &Api<Lease>,
        now: chrono::DateTime<Utc>,
        transitions: i32,
    ) -> Result<bool, Error> {
        let patch = serde_json::json!({
            "apiVersion": "coordination.k8s.io/v1",
            "kind": "Lease",
            "metadata": {
                "name": self.lease_name,
                "namespace": self.namespace,
            },
            "spec": {
                "holderIdentity": self.identity,
                "acquireTime": MicroTime(now),
                "renewTime": MicroTime(now),
                "leaseDurationSeconds": LEASE_DURATION.as_secs() as i32,
                "leaseTransitions": transitions + 1,
            }
        });
        match api
            .patch(
                &self.lease_name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&patch),
            )
            .await
        {
            Ok(_) => {
                tracing::info!(
                    identity = self.identity,
                    transitions = transitions + 1,
                    "Took over expired lease"
                );
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(Error::Kube(e)),
        }
    }

    async fn renewal_loop(&self, lost_tx: oneshot::Sender<()>) {
        let mut last_renewed = tokio::time::Instant::now();
        loop {
            tokio::time::sleep(RETRY_PERIOD).await;
            match self.try_acquire_lease().await {
                Ok(true) => {
                    last_renewed = tokio::time::Instant::now();
                }
                Ok(false) => {
                    tracing::warn!(identity = self.identity, "Lease taken by another replica");
                    let _ = lost_tx.send(());
                    return;
                }
                Err(e) => {
                    // Transient API failures are tolerated until the renew
                    // deadline passes without a successful renew.
                    tracing::warn!(error = %e, "Failed to renew lease");
                    if last_renewed.elapsed() > RENEW_DEADLINE {
                        let _ = lost_tx.send(());
                        return;
                    }
                }
            }
        }
    }
}

pub struct LeaderGuard {
    renewal_task: JoinHandle<()>,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl LeaderGuard {
    /// Waits until leadership is lost.
    pub async fn lost(&mut self) {
        match self.lost_rx.take() {
            Some(rx) => {
                let _ = rx.await;
            }
            None => futures::future::pending().await,
        }
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.renewal_task.abort();
    }
}
