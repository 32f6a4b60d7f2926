// Kubernetes backend - coordination.k8s.io/v1 Lease objects
//
// `resourceVersion` is carried as the descriptor version, so every
// replace is a compare-and-swap enforced by the API server.

use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;

use super::{BackendError, LeaseBackend, LeaseDescriptor, LeaseKey};

#[derive(Clone)]
pub struct KubernetesLeaseBackend {
    client: Client,
}

impl fmt::Debug for KubernetesLeaseBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubernetesLeaseBackend").finish_non_exhaustive()
    }
}

impl KubernetesLeaseBackend {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using in-cluster configuration or the local kubeconfig
    pub async fn try_default() -> Result<Self, BackendError> {
        Ok(Self::new(Client::try_default().await?))
    }

    fn api(&self, key: &LeaseKey) -> Api<Lease> {
        Api::namespaced(self.client.clone(), &key.namespace)
    }
}

#[async_trait]
impl LeaseBackend for KubernetesLeaseBackend {
    async fn get(&self, key: &LeaseKey) -> Result<Option<LeaseDescriptor>, BackendError> {
        let lease = self.api(key).get_opt(&key.name).await?;
        Ok(lease.map(|lease| to_descriptor(key, lease)))
    }

    async fn create(&self, lease: &LeaseDescriptor) -> Result<LeaseDescriptor, BackendError> {
        let mut object = to_lease(lease);
        object.metadata.resource_version = None;

        match self.api(&lease.key).create(&PostParams::default(), &object).await {
            Ok(created) => Ok(to_descriptor(&lease.key, created)),
            Err(kube::Error::Api(response)) if response.code == 409 => {
                Err(BackendError::AlreadyExists(lease.key.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, lease: &LeaseDescriptor) -> Result<LeaseDescriptor, BackendError> {
        let object = to_lease(lease);

        match self
            .api(&lease.key)
            .replace(&lease.key.name, &PostParams::default(), &object)
            .await
        {
            Ok(replaced) => Ok(to_descriptor(&lease.key, replaced)),
            Err(kube::Error::Api(response)) if response.code == 409 => {
                Err(BackendError::Conflict(lease.key.clone()))
            }
            Err(kube::Error::Api(response)) if response.code == 404 => {
                Err(BackendError::NotFound(lease.key.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn to_descriptor(key: &LeaseKey, lease: Lease) -> LeaseDescriptor {
    let spec = lease.spec.unwrap_or_default();
    LeaseDescriptor {
        key: key.clone(),
        holder_identity: spec.holder_identity,
        lease_duration_seconds: spec.lease_duration_seconds,
        acquire_time: spec.acquire_time.map(|time| time.0),
        renew_time: spec.renew_time.map(|time| time.0),
        lease_transitions: spec
            .lease_transitions
            .and_then(|count| u32::try_from(count).ok())
            .unwrap_or(0),
        version: lease.metadata.resource_version,
    }
}

fn to_lease(descriptor: &LeaseDescriptor) -> Lease {
    Lease {
        metadata: ObjectMeta {
            name: Some(descriptor.key.name.clone()),
            namespace: Some(descriptor.key.namespace.clone()),
            resource_version: descriptor.version.clone(),
            ..ObjectMeta::default()
        },
        spec: Some(LeaseSpec {
            holder_identity: descriptor.holder_identity.clone(),
            lease_duration_seconds: descriptor.lease_duration_seconds,
            acquire_time: descriptor.acquire_time.map(MicroTime),
            renew_time: descriptor.renew_time.map(MicroTime),
            lease_transitions: Some(i32::try_from(descriptor.lease_transitions).unwrap_or(i32::MAX)),
            ..LeaseSpec::default()
        }),
    }
}
