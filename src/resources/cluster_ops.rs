//! Access to the Kubernetes objects the replica controller reads and mutates
//!
//! Every API call made by the controller and the scale/failover operations goes
//! through [`ClusterOps`]. [`KubeClusterOps`] is the production implementation;
//! tests substitute an in-memory one.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Service};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde_json::{Value, json};

use crate::controller::error::{Error, Result};
use crate::crd::{Pgcluster, Pgreplica, PgreplicaStatus, Pgtask, PgtaskStatus};
use crate::resources::exec::{ExecOutput, exec_in_pod};
use crate::resources::labels::FIELD_MANAGER;

/// Operations against the Kubernetes API used by the operator
#[async_trait]
pub trait ClusterOps: Send + Sync {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Pgcluster>;

    async fn get_replica(&self, namespace: &str, name: &str) -> Result<Pgreplica>;

    /// Full update of a replica (metadata and spec)
    async fn replace_replica(&self, replica: &Pgreplica) -> Result<Pgreplica>;

    /// JSON merge patch against the replica object
    async fn patch_replica(&self, namespace: &str, name: &str, patch: &Value) -> Result<()>;

    async fn patch_replica_status(
        &self,
        namespace: &str,
        name: &str,
        status: &PgreplicaStatus,
    ) -> Result<()>;

    async fn patch_task_status(
        &self,
        namespace: &str,
        name: &str,
        status: &PgtaskStatus,
    ) -> Result<()>;

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>>;

    async fn list_deployments(&self, namespace: &str, label_selector: &str)
    -> Result<Vec<Deployment>>;

    async fn create_deployment(&self, namespace: &str, deployment: &Deployment) -> Result<()>;

    async fn replace_deployment(&self, namespace: &str, deployment: &Deployment) -> Result<()>;

    async fn patch_deployment(&self, namespace: &str, name: &str, patch: &Value) -> Result<()>;

    /// Delete with foreground propagation so pods go before the Deployment
    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()>;

    async fn get_pvc(&self, namespace: &str, name: &str)
    -> Result<Option<PersistentVolumeClaim>>;

    async fn create_pvc(&self, namespace: &str, pvc: &PersistentVolumeClaim) -> Result<()>;

    async fn replace_pvc(&self, namespace: &str, pvc: &PersistentVolumeClaim) -> Result<()>;

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>>;

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<()>;

    async fn patch_service(&self, namespace: &str, name: &str, patch: &Value) -> Result<()>;

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
        field_selector: Option<&str>,
    ) -> Result<Vec<Pod>>;

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>>;

    async fn replace_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<()>;

    /// Run a command in a pod container and capture its output
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
        command: Vec<String>,
    ) -> Result<ExecOutput>;
}

/// [`ClusterOps`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeClusterOps {
    client: Client,
}

impl KubeClusterOps {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn patch_params() -> PatchParams {
    PatchParams::apply(FIELD_MANAGER)
}

#[async_trait]
impl ClusterOps for KubeClusterOps {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Pgcluster> {
        let api: Api<Pgcluster> = self.api(namespace);
        api.get_opt(name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("pgcluster {}/{}", namespace, name)))
    }

    async fn get_replica(&self, namespace: &str, name: &str) -> Result<Pgreplica> {
        let api: Api<Pgreplica> = self.api(namespace);
        api.get_opt(name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("pgreplica {}/{}", namespace, name)))
    }

    async fn replace_replica(&self, replica: &Pgreplica) -> Result<Pgreplica> {
        let namespace = replica
            .namespace()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        let api: Api<Pgreplica> = self.api(&namespace);
        Ok(api
            .replace(&replica.name_any(), &PostParams::default(), replica)
            .await?)
    }

    async fn patch_replica(&self, namespace: &str, name: &str, patch: &Value) -> Result<()> {
        let api: Api<Pgreplica> = self.api(namespace);
        api.patch(name, &patch_params(), &Patch::Merge(patch)).await?;
        Ok(())
    }

    async fn patch_replica_status(
        &self,
        namespace: &str,
        name: &str,
        status: &PgreplicaStatus,
    ) -> Result<()> {
        let api: Api<Pgreplica> = self.api(namespace);
        let patch = json!({ "status": status });
        api.patch_status(name, &patch_params(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_task_status(
        &self,
        namespace: &str,
        name: &str,
        status: &PgtaskStatus,
    ) -> Result<()> {
        let api: Api<Pgtask> = self.api(namespace);
        let patch = json!({ "status": status });
        api.patch_status(name, &patch_params(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        let api: Api<Deployment> = self.api(namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_deployments(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Deployment>> {
        let api: Api<Deployment> = self.api(namespace);
        let params = ListParams::default().labels(label_selector);
        Ok(api.list(&params).await?.items)
    }

    async fn create_deployment(&self, namespace: &str, deployment: &Deployment) -> Result<()> {
        let api: Api<Deployment> = self.api(namespace);
        api.create(&PostParams::default(), deployment).await?;
        Ok(())
    }

    async fn replace_deployment(&self, namespace: &str, deployment: &Deployment) -> Result<()> {
        let api: Api<Deployment> = self.api(namespace);
        api.replace(&deployment.name_any(), &PostParams::default(), deployment)
            .await?;
        Ok(())
    }

    async fn patch_deployment(&self, namespace: &str, name: &str, patch: &Value) -> Result<()> {
        let api: Api<Deployment> = self.api(namespace);
        api.patch(name, &patch_params(), &Patch::Merge(patch)).await?;
        Ok(())
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Deployment> = self.api(namespace);
        api.delete(name, &DeleteParams::foreground()).await?;
        Ok(())
    }

    async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>> {
        let api: Api<PersistentVolumeClaim> = self.api(namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_pvc(&self, namespace: &str, pvc: &PersistentVolumeClaim) -> Result<()> {
        let api: Api<PersistentVolumeClaim> = self.api(namespace);
        api.create(&PostParams::default(), pvc).await?;
        Ok(())
    }

    async fn replace_pvc(&self, namespace: &str, pvc: &PersistentVolumeClaim) -> Result<()> {
        let api: Api<PersistentVolumeClaim> = self.api(namespace);
        api.replace(&pvc.name_any(), &PostParams::default(), pvc)
            .await?;
        Ok(())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        let api: Api<Service> = self.api(namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<()> {
        let api: Api<Service> = self.api(namespace);
        api.create(&PostParams::default(), service).await?;
        Ok(())
    }

    async fn patch_service(&self, namespace: &str, name: &str, patch: &Value) -> Result<()> {
        let api: Api<Service> = self.api(namespace);
        api.patch(name, &patch_params(), &Patch::Merge(patch)).await?;
        Ok(())
    }

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
        field_selector: Option<&str>,
    ) -> Result<Vec<Pod>> {
        let api: Api<Pod> = self.api(namespace);
        let mut params = ListParams::default().labels(label_selector);
        if let Some(fields) = field_selector {
            params = params.fields(fields);
        }
        Ok(api.list(&params).await?.items)
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        let api: Api<ConfigMap> = self.api(namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn replace_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<()> {
        let api: Api<ConfigMap> = self.api(namespace);
        api.replace(&config_map.name_any(), &PostParams::default(), config_map)
            .await?;
        Ok(())
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
        command: Vec<String>,
    ) -> Result<ExecOutput> {
        let api: Api<Pod> = self.api(namespace);
        exec_in_pod(&api, pod, container, command).await
    }
}
