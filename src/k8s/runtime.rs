//! Container runtime backed by the Kubernetes API
//!
//! Watches the pods scheduled on this node and turns their running containers
//! into registry records, resolving each container's init PID from procfs.

use crate::k8s::client::{node_field_selector, K8sClient};
use crate::k8s::pid::{clean_container_id, PidResolver};
use crate::trace::{ContainerCallback, ContainerRuntime};
use crate::{NodescopeError, Result};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher::{self, Event};
use nodescope_common::{ContainerEvent, ContainerRecord};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// A running container as the API server reports it, before PID resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodContainer {
    pub namespace: String,
    pub pod: String,
    pub name: String,
    pub container_id: String,
    pub host_network: bool,
}

/// Running containers of `pod` that the runtime has assigned an ID
pub fn running_containers(pod: &Pod) -> Vec<PodContainer> {
    let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
    let name = pod.metadata.name.as_deref().unwrap_or("unknown");
    let host_network = pod
        .spec
        .as_ref()
        .and_then(|s| s.host_network)
        .unwrap_or(false);

    let statuses = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .map(|v| v.as_slice())
        .unwrap_or(&[]);

    statuses
        .iter()
        .filter(|cs| {
            cs.state
                .as_ref()
                .map(|state| state.running.is_some())
                .unwrap_or(false)
        })
        .filter_map(|cs| {
            let container_id = cs.container_id.as_ref()?;
            Some(PodContainer {
                namespace: namespace.to_string(),
                pod: name.to_string(),
                name: cs.name.clone(),
                container_id: clean_container_id(container_id).to_string(),
                host_network,
            })
        })
        .collect()
}

fn pod_uid(pod: &Pod) -> Option<&str> {
    pod.metadata.uid.as_deref().filter(|uid| !uid.is_empty())
}

/// Per-watch bookkeeping of the records announced for each pod
#[derive(Default)]
struct PodTracker {
    pods: HashMap<String, Vec<ContainerRecord>>,
    /// Pods seen since the watcher began a relist
    relisted: Option<HashSet<String>>,
}

impl PodTracker {
    fn apply(&mut self, uid: &str, records: Vec<ContainerRecord>, notify: &ContainerCallback) {
        if let Some(seen) = self.relisted.as_mut() {
            seen.insert(uid.to_string());
        }

        let previous = self.pods.remove(uid).unwrap_or_default();
        for old in &previous {
            if !records.contains(old) {
                notify(ContainerEvent::Removed(old.clone()));
            }
        }
        for new in &records {
            if !previous.contains(new) {
                notify(ContainerEvent::Added(new.clone()));
            }
        }

        if !records.is_empty() {
            self.pods.insert(uid.to_string(), records);
        }
    }

    fn remove(&mut self, uid: &str, notify: &ContainerCallback) {
        for old in self.pods.remove(uid).unwrap_or_default() {
            notify(ContainerEvent::Removed(old));
        }
    }

    fn begin_relist(&mut self) {
        self.relisted = Some(HashSet::new());
    }

    /// Drop pods that vanished while the watch was disconnected
    fn finish_relist(&mut self, notify: &ContainerCallback) {
        let Some(seen) = self.relisted.take() else {
            return;
        };
        let stale: Vec<String> = self
            .pods
            .keys()
            .filter(|uid| !seen.contains(*uid))
            .cloned()
            .collect();
        for uid in stale {
            self.remove(&uid, notify);
        }
    }
}

/// Resolve PIDs for the running containers of `pods`. Scans procfs.
fn resolve_records(
    resolver: &PidResolver,
    pods: &[&Pod],
) -> Vec<(String, Vec<ContainerRecord>)> {
    let per_pod: Vec<(String, Vec<PodContainer>)> = pods
        .iter()
        .filter_map(|pod| Some((pod_uid(pod)?.to_string(), running_containers(pod))))
        .collect();

    let ids: Vec<String> = per_pod
        .iter()
        .flat_map(|(_, containers)| containers.iter().map(|c| c.container_id.clone()))
        .collect();
    let pids = resolver.resolve_all(&ids);

    per_pod
        .into_iter()
        .map(|(uid, containers)| {
            let records = containers
                .into_iter()
                .filter_map(|c| {
                    let Some(&pid) = pids.get(&c.container_id) else {
                        debug!(
                            "No process found for container {}/{}/{}",
                            c.namespace, c.pod, c.name
                        );
                        return None;
                    };
                    Some(ContainerRecord {
                        id: c.container_id,
                        namespace: c.namespace,
                        pod: c.pod,
                        name: c.name,
                        pid,
                        host_network: c.host_network,
                    })
                })
                .collect();
            (uid, records)
        })
        .collect()
}

/// Apply one watcher event to the tracker, notifying subscribers of the diff.
///
/// Runs on a blocking thread: PID resolution walks procfs and subscribers
/// attach probes synchronously.
fn handle_event(
    tracker: &mut PodTracker,
    resolver: &PidResolver,
    notify: &ContainerCallback,
    event: Event<Pod>,
) -> bool {
    match event {
        Event::Apply(pod) | Event::InitApply(pod) => {
            for (uid, records) in resolve_records(resolver, &[&pod]) {
                tracker.apply(&uid, records, notify);
            }
        }
        Event::Delete(pod) => {
            if let Some(uid) = pod_uid(&pod) {
                tracker.remove(uid, notify);
            }
        }
        Event::Init => {
            debug!("Pod watcher relisting");
            tracker.begin_relist();
        }
        Event::InitDone => {
            tracker.finish_relist(notify);
            return true;
        }
    }
    false
}

pub struct KubeContainerRuntime {
    client: K8sClient,
    node_name: String,
    resolver: Arc<PidResolver>,
}

impl KubeContainerRuntime {
    pub fn new(client: K8sClient, node_name: impl Into<String>, resolver: PidResolver) -> Self {
        Self {
            client,
            node_name: node_name.into(),
            resolver: Arc::new(resolver),
        }
    }

    async fn watch_pods(
        &self,
        tracker: &mut PodTracker,
        notify: &ContainerCallback,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let config = watcher::Config::default().fields(&node_field_selector(&self.node_name));
        let mut stream = watcher::watcher(self.client.pods_all(), config).boxed();

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                event = stream.try_next() => event,
            };

            let event = match event {
                Ok(Some(event)) => event,
                Ok(None) => return Ok(()),
                Err(e) => {
                    return Err(NodescopeError::collect("pod watch failed", e));
                }
            };

            let mut owned = std::mem::take(tracker);
            let resolver = self.resolver.clone();
            let notify = notify.clone();
            let (owned, synced) = tokio::task::spawn_blocking(move || {
                let synced = handle_event(&mut owned, &resolver, &notify, event);
                (owned, synced)
            })
            .await
            .map_err(|e| NodescopeError::collect("pod event handler", e))?;
            *tracker = owned;

            if synced {
                info!(
                    "Pod watcher initial sync complete. Tracking {} pods on {}",
                    tracker.pods.len(),
                    self.node_name
                );
            }
        }
    }
}

#[async_trait]
impl ContainerRuntime for KubeContainerRuntime {
    async fn list_containers(&self) -> Result<Vec<ContainerRecord>> {
        let pods = self.client.list_node_pods(&self.node_name).await?;
        let resolver = self.resolver.clone();

        tokio::task::spawn_blocking(move || {
            let refs: Vec<&Pod> = pods.iter().collect();
            resolve_records(&resolver, &refs)
                .into_iter()
                .flat_map(|(_, records)| records)
                .collect::<Vec<ContainerRecord>>()
        })
        .await
        .map_err(|e| NodescopeError::collect("container listing", e))
    }

    async fn watch(&self, notify: ContainerCallback, shutdown: CancellationToken) -> Result<()> {
        info!("Starting pod watcher for node {}", self.node_name);

        let mut tracker = PodTracker::default();
        let mut backoff = Duration::from_secs(1);

        loop {
            match self.watch_pods(&mut tracker, &notify, &shutdown).await {
                Ok(()) if shutdown.is_cancelled() => return Ok(()),
                Ok(()) => {
                    warn!("Pod watch stream ended, reconnecting...");
                    backoff = Duration::from_secs(1);
                }
                Err(e) => {
                    error!("Pod watch failed: {}, reconnecting in {:?}", e, backoff);
                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = std::cmp::min(backoff * 2, MAX_BACKOFF);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateRunning, ContainerStateWaiting, ContainerStatus, PodSpec,
        PodStatus,
    };
    use kube::api::ObjectMeta;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn status(name: &str, id: Option<&str>, running: bool) -> ContainerStatus {
        let state = if running {
            ContainerState {
                running: Some(ContainerStateRunning::default()),
                ..Default::default()
            }
        } else {
            ContainerState {
                waiting: Some(ContainerStateWaiting::default()),
                ..Default::default()
            }
        };
        ContainerStatus {
            name: name.to_string(),
            container_id: id.map(str::to_string),
            state: Some(state),
            ..Default::default()
        }
    }

    fn pod(host_network: bool, statuses: Vec<ContainerStatus>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("web-0".to_string()),
                namespace: Some("shop".to_string()),
                uid: Some("uid-1".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                host_network: Some(host_network),
                ..Default::default()
            }),
            status: Some(PodStatus {
                container_statuses: Some(statuses),
                ..Default::default()
            }),
        }
    }

    fn record(name: &str, pid: u32) -> ContainerRecord {
        ContainerRecord {
            id: format!("id-{}", name),
            namespace: "shop".to_string(),
            pod: "web-0".to_string(),
            name: name.to_string(),
            pid,
            host_network: false,
        }
    }

    fn recording_callback() -> (ContainerCallback, Arc<Mutex<Vec<ContainerEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let callback: ContainerCallback = {
            let events = events.clone();
            Arc::new(move |event: ContainerEvent| events.lock().push(event))
        };
        (callback, events)
    }

    #[test]
    fn test_running_containers_only() {
        let pod = pod(
            false,
            vec![
                status("app", Some("containerd://aaa"), true),
                status("init", Some("containerd://bbb"), false),
                status("pending", None, true),
            ],
        );

        let containers = running_containers(&pod);
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].name, "app");
        assert_eq!(containers[0].container_id, "aaa");
        assert_eq!(containers[0].namespace, "shop");
        assert!(!containers[0].host_network);
    }

    #[test]
    fn test_host_network_flag() {
        let pod = pod(true, vec![status("agent", Some("docker://ccc"), true)]);
        assert!(running_containers(&pod)[0].host_network);
    }

    #[test]
    fn test_tracker_announces_changes_only() {
        let (notify, events) = recording_callback();
        let mut tracker = PodTracker::default();

        tracker.apply("uid-1", vec![record("app", 10)], &notify);
        tracker.apply("uid-1", vec![record("app", 10)], &notify);
        tracker.apply("uid-1", vec![record("app", 10), record("sidecar", 11)], &notify);
        // Restarted container: new pid
        tracker.apply("uid-1", vec![record("app", 20), record("sidecar", 11)], &notify);
        tracker.remove("uid-1", &notify);

        let events = events.lock();
        assert_eq!(
            *events,
            vec![
                ContainerEvent::Added(record("app", 10)),
                ContainerEvent::Added(record("sidecar", 11)),
                ContainerEvent::Removed(record("app", 10)),
                ContainerEvent::Added(record("app", 20)),
                ContainerEvent::Removed(record("app", 20)),
                ContainerEvent::Removed(record("sidecar", 11)),
            ]
        );
    }

    #[test]
    fn test_relist_drops_vanished_pods() {
        let (notify, events) = recording_callback();
        let mut tracker = PodTracker::default();
        tracker.apply("uid-1", vec![record("app", 10)], &notify);
        tracker.apply("uid-2", vec![record("db", 30)], &notify);

        tracker.begin_relist();
        tracker.apply("uid-1", vec![record("app", 10)], &notify);
        tracker.finish_relist(&notify);

        assert_eq!(
            events.lock().last(),
            Some(&ContainerEvent::Removed(record("db", 30)))
        );
        assert_eq!(tracker.pods.len(), 1);
    }

    #[test]
    fn test_pod_events_resolve_pids_from_procfs() {
        let proc_root = tempfile::TempDir::new().unwrap();
        let id = "4f2d9c1b7a3e5f6d8c0b1a2e3f4d5c6b";
        let proc_dir = proc_root.path().join("4242");
        std::fs::create_dir(&proc_dir).unwrap();
        std::fs::write(
            proc_dir.join("cgroup"),
            format!("0::/kubepods.slice/cri-containerd-{}.scope\n", id),
        )
        .unwrap();

        let resolver = PidResolver::with_root(proc_root.path());
        let (notify, events) = recording_callback();
        let mut tracker = PodTracker::default();
        let web = pod(
            false,
            vec![
                status("app", Some(format!("containerd://{}", id).as_str()), true),
                status("gone", Some("containerd://0000000000000000ffff"), true),
            ],
        );

        assert!(!handle_event(&mut tracker, &resolver, &notify, Event::Init));
        assert!(!handle_event(&mut tracker, &resolver, &notify, Event::InitApply(web.clone())));
        assert!(handle_event(&mut tracker, &resolver, &notify, Event::InitDone));
        assert!(!handle_event(&mut tracker, &resolver, &notify, Event::Delete(web)));

        let expected = ContainerRecord {
            id: id.to_string(),
            namespace: "shop".to_string(),
            pod: "web-0".to_string(),
            name: "app".to_string(),
            pid: 4242,
            host_network: false,
        };
        assert_eq!(
            *events.lock(),
            vec![
                ContainerEvent::Added(expected.clone()),
                ContainerEvent::Removed(expected),
            ]
        );
    }
}
