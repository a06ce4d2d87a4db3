use crate::{NodescopeError, Result};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{
    ApiResource, AttachParams, DeleteParams, DynamicObject, GroupVersionKind, ListParams,
    PostParams,
};
use kube::{Api, Client};
use serde_json::json;
use std::collections::BTreeMap;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

pub const GADGET_NAMESPACE: &str = "gadget";
pub const GADGET_OPERATION_ANNOTATION: &str = "gadget.kinvolk.io/operation";
pub const GADGET_TRACE_CRD: &str = "traces.gadget.kinvolk.io";

/// Captured output of a command run in a pod
#[derive(Debug, Default, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Clone)]
pub struct K8sClient {
    client: Client,
}

impl K8sClient {
    pub async fn try_default() -> Result<Self> {
        debug!("Initializing Kubernetes client");

        let client = Client::try_default().await?;

        info!("Successfully connected to Kubernetes cluster");

        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    pub fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub fn pods_all(&self) -> Api<Pod> {
        Api::all(self.client.clone())
    }

    /// Pods scheduled on `node_name`, in any namespace
    pub async fn list_node_pods(&self, node_name: &str) -> Result<Vec<Pod>> {
        let params = ListParams::default().fields(&node_field_selector(node_name));
        let pods = self.pods_all().list(&params).await?;
        Ok(pods.items)
    }

    pub async fn node_metrics(&self) -> Result<Vec<DynamicObject>> {
        self.list_metrics("NodeMetrics", "nodes").await
    }

    pub async fn pod_metrics(&self) -> Result<Vec<DynamicObject>> {
        self.list_metrics("PodMetrics", "pods").await
    }

    async fn list_metrics(&self, kind: &str, plural: &str) -> Result<Vec<DynamicObject>> {
        let gvk = GroupVersionKind::gvk("metrics.k8s.io", "v1beta1", kind);
        let resource = ApiResource::from_gvk_with_plural(&gvk, plural);
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    pub async fn crd_exists(&self, name: &str) -> Result<bool> {
        let crds: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        Ok(crds.get_opt(name).await?.is_some())
    }

    /// The gadget DaemonSet pod running on `node_name`
    pub async fn gadget_pod_name(&self, node_name: &str) -> Result<String> {
        let params = ListParams::default().fields(&node_field_selector(node_name));
        let pods = self.pods(GADGET_NAMESPACE).list(&params).await?;

        pods.items
            .into_iter()
            .find_map(|pod| pod.metadata.name)
            .ok_or_else(|| {
                NodescopeError::Config(format!("no gadget pod found on node {:?}", node_name))
            })
    }

    /// Run `command` in a pod and wait for it to exit, capturing its output
    pub async fn exec(&self, namespace: &str, pod: &str, command: Vec<String>) -> Result<ExecOutput> {
        let params = AttachParams::default()
            .stdin(false)
            .stdout(true)
            .stderr(true);

        debug!("Exec in {}/{}: {:?}", namespace, pod, command);
        let mut process = self.pods(namespace).exec(pod, command, &params).await?;

        let stdout = read_all(process.stdout());
        let stderr = read_all(process.stderr());
        let (stdout, stderr) = tokio::join!(stdout, stderr);

        process
            .join()
            .await
            .map_err(|e| NodescopeError::collect(format!("exec in pod {}", pod), e))?;

        Ok(ExecOutput {
            stdout: stdout?,
            stderr: stderr?,
        })
    }

    fn traces(&self) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), GADGET_NAMESPACE, &trace_resource())
    }

    pub async fn create_trace(&self, trace: &DynamicObject) -> Result<()> {
        self.traces().create(&PostParams::default(), trace).await?;
        Ok(())
    }

    pub async fn delete_trace(&self, name: &str) -> Result<()> {
        self.traces().delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}

async fn read_all<R>(reader: Option<R>) -> Result<String>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        reader.read_to_end(&mut buf).await?;
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

pub fn node_field_selector(node_name: &str) -> String {
    format!("spec.nodeName={}", node_name)
}

fn trace_resource() -> ApiResource {
    let gvk = GroupVersionKind::gvk("gadget.kinvolk.io", "v1alpha1", "Trace");
    ApiResource::from_gvk_with_plural(&gvk, "traces")
}

/// Trace that starts `gadget` on `node_name` and streams its output
pub fn trace_object(name: &str, gadget: &str, node_name: &str) -> DynamicObject {
    let mut trace = DynamicObject::new(name, &trace_resource())
        .within(GADGET_NAMESPACE)
        .data(json!({
            "spec": {
                "node": node_name,
                "gadget": gadget,
                "runMode": "Manual",
                "outputMode": "Stream",
            }
        }));
    trace.metadata.annotations = Some(BTreeMap::from([(
        GADGET_OPERATION_ANNOTATION.to_string(),
        "start".to_string(),
    )]));
    trace
}
