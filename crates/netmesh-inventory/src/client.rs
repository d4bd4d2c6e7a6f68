use std::net::Ipv4Addr;
use std::path::Path;
use std::pin::Pin;

use anyhow::{anyhow, Context, Result};
use futures::{Stream, StreamExt};
use ipnetwork::Ipv4Network;
use netmesh_types::NodeRecord;
use serde::Deserialize;
use thiserror::Error;

/// The subset of a cluster node object the agent reads off the wire,
/// before it is folded down into a [`netmesh_types::NodeRecord`].
/// Carries the status identifiers used only for self-identification.
#[derive(Debug, Clone, PartialEq)]
pub struct RawNode {
    pub name: String,
    pub internal_address: Option<Ipv4Addr>,
    pub pod_cidr: Option<String>,
    pub network_unavailable: Option<bool>,
    pub machine_id: Option<String>,
    pub system_uuid: Option<String>,
    pub boot_id: Option<String>,
}

#[derive(Debug, Clone)]
pub enum NodeEvent {
    Added(RawNode),
    Modified(RawNode),
    Deleted(String),
}

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("another writer already updated the node status")]
    Conflict,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[async_trait::async_trait]
pub trait NodeSource: Send + Sync {
    /// Full list plus the resource-version token to resume a watch from.
    async fn list(&self) -> Result<(Vec<RawNode>, String)>;

    /// Opens a long-lived watch starting after `resource_version`.
    async fn watch(
        &self,
        resource_version: &str,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<NodeEvent>> + Send>>>;

    /// Patches the `NetworkUnavailable` condition on the named node.
    async fn patch_network_unavailable(&self, name: &str, unavailable: bool) -> Result<(), PatchError>;
}

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

pub struct K8sNodeSource {
    client: reqwest::Client,
    api_server: String,
    token: String,
}

impl K8sNodeSource {
    /// Builds a client from the standard in-cluster service-account
    /// mount: token, namespace and CA at fixed, well-known paths.
    pub fn in_cluster() -> Result<Self> {
        Self::from_mount(SERVICE_ACCOUNT_DIR)
    }

    fn from_mount(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let token = std::fs::read_to_string(dir.join("token"))
            .context("reading service account token")?
            .trim()
            .to_string();
        let ca_path = dir.join("ca.crt");
        let ca_pem = std::fs::read(&ca_path).context("reading service account CA bundle")?;
        let ca_cert = reqwest::Certificate::from_pem(&ca_pem).context("parsing CA bundle")?;

        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .context("KUBERNETES_SERVICE_HOST not set")?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".into());

        let client = reqwest::Client::builder()
            .add_root_certificate(ca_cert)
            .build()
            .context("building Kubernetes API client")?;

        Ok(Self {
            client,
            api_server: format!("https://{host}:{port}"),
            token,
        })
    }

    fn nodes_url(&self) -> String {
        format!("{}/api/v1/nodes", self.api_server)
    }
}

#[async_trait::async_trait]
impl NodeSource for K8sNodeSource {
    async fn list(&self) -> Result<(Vec<RawNode>, String)> {
        let resp: NodeList = self
            .client
            .get(self.nodes_url())
            .bearer_auth(&self.token)
            .send()
            .await
            .context("listing nodes")?
            .error_for_status()
            .context("listing nodes")?
            .json()
            .await
            .context("decoding node list")?;

        let resource_version = resp.metadata.resource_version;
        let nodes = resp.items.into_iter().map(RawNode::from).collect();
        Ok((nodes, resource_version))
    }

    async fn watch(
        &self,
        resource_version: &str,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<NodeEvent>> + Send>>> {
        let resp = self
            .client
            .get(self.nodes_url())
            .bearer_auth(&self.token)
            .query(&[("watch", "true"), ("resourceVersion", resource_version)])
            .send()
            .await
            .context("opening node watch")?
            .error_for_status()
            .context("opening node watch")?;

        let byte_stream = resp.bytes_stream();
        let lines = LineSplitter::new(byte_stream);

        let events = lines.map(|line| {
            let line = line?;
            let wrapped: WatchEvent = serde_json::from_slice(&line).context("decoding watch event")?;
            match wrapped.event_type.as_str() {
                "ADDED" => Ok(NodeEvent::Added(wrapped.object.into())),
                "MODIFIED" => Ok(NodeEvent::Modified(wrapped.object.into())),
                "DELETED" => Ok(NodeEvent::Deleted(wrapped.object.metadata.name)),
                other => Err(anyhow!("unexpected watch event type {other:?}")),
            }
        });

        Ok(Box::pin(events))
    }

    async fn patch_network_unavailable(&self, name: &str, unavailable: bool) -> Result<(), PatchError> {
        let status = if unavailable { "True" } else { "False" };
        let body = serde_json::json!({
            "status": {
                "conditions": [{
                    "type": "NetworkUnavailable",
                    "status": status,
                    "reason": "RouteCreated",
                    "message": "netmesh-agent has configured routing on this node",
                }]
            }
        });

        let url = format!("{}/{}/status", self.nodes_url(), name);
        let resp = self
            .client
            .patch(url)
            .bearer_auth(&self.token)
            .header("Content-Type", "application/strategic-merge-patch+json")
            .json(&body)
            .send()
            .await
            .map_err(|e| PatchError::Other(anyhow::Error::new(e).context("patching node status")))?;

        if resp.status() == reqwest::StatusCode::CONFLICT {
            return Err(PatchError::Conflict);
        }
        resp.error_for_status()
            .map_err(|e| PatchError::Other(anyhow::Error::new(e).context("patching node status")))?;
        Ok(())
    }
}

/// Reassembles a newline-delimited JSON byte stream into whole lines.
struct LineSplitter<S> {
    inner: S,
    buf: Vec<u8>,
}

impl<S> LineSplitter<S> {
    fn new(inner: S) -> Self {
        Self {
            inner,
            buf: Vec::new(),
        }
    }
}

impl<S> Stream for LineSplitter<S>
where
    S: Stream<Item = reqwest::Result<bytes::Bytes>> + Unpin,
{
    type Item = Result<Vec<u8>>;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        use std::task::Poll;
        let this = self.get_mut();
        loop {
            if let Some(pos) = this.buf.iter().position(|b| *b == b'\n') {
                let line = this.buf.drain(..=pos).collect::<Vec<u8>>();
                let line = line[..line.len() - 1].to_vec();
                if line.is_empty() {
                    continue;
                }
                return Poll::Ready(Some(Ok(line)));
            }
            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => this.buf.extend_from_slice(&chunk),
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Some(Err(anyhow::Error::new(e).context("reading watch stream"))))
                }
                Poll::Ready(None) => {
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct NodeList {
    metadata: ListMeta,
    items: Vec<ApiNode>,
}

#[derive(Debug, Deserialize)]
struct ListMeta {
    #[serde(rename = "resourceVersion")]
    resource_version: String,
}

#[derive(Debug, Deserialize)]
struct WatchEvent {
    #[serde(rename = "type")]
    event_type: String,
    object: ApiNode,
}

#[derive(Debug, Deserialize)]
struct ApiNode {
    metadata: ApiNodeMetadata,
    #[serde(default)]
    spec: ApiNodeSpec,
    #[serde(default)]
    status: ApiNodeStatus,
}

#[derive(Debug, Deserialize)]
struct ApiNodeMetadata {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct ApiNodeSpec {
    #[serde(rename = "podCIDR", default)]
    pod_cidr: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiNodeStatus {
    #[serde(default)]
    addresses: Vec<ApiNodeAddress>,
    #[serde(rename = "nodeInfo", default)]
    node_info: ApiNodeInfo,
    #[serde(default)]
    conditions: Vec<ApiNodeCondition>,
}

#[derive(Debug, Deserialize)]
struct ApiNodeAddress {
    #[serde(rename = "type")]
    address_type: String,
    address: String,
}

#[derive(Debug, Default, Deserialize)]
struct ApiNodeInfo {
    #[serde(rename = "machineID", default)]
    machine_id: Option<String>,
    #[serde(rename = "systemUUID", default)]
    system_uuid: Option<String>,
    #[serde(rename = "bootID", default)]
    boot_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiNodeCondition {
    #[serde(rename = "type")]
    condition_type: String,
    status: String,
}

impl RawNode {
    /// Folds this wire-format node down into the subset the inventory
    /// tracks. An empty or unparseable pod CIDR, or a node lacking an
    /// internal address, becomes `None` rather than a default value.
    pub fn to_record(&self) -> NodeRecord {
        let pod_cidr = self
            .pod_cidr
            .as_deref()
            .filter(|s| !s.is_empty())
            .and_then(|s| s.parse::<Ipv4Network>().ok());

        NodeRecord {
            name: self.name.clone(),
            underlay_address: self.internal_address,
            pod_cidr,
            network_available: !self.network_unavailable.unwrap_or(false),
            machine_id: self.machine_id.clone(),
            system_uuid: self.system_uuid.clone(),
            boot_id: self.boot_id.clone(),
        }
    }
}

impl From<ApiNode> for RawNode {
    fn from(api: ApiNode) -> Self {
        let internal_address = api
            .status
            .addresses
            .iter()
            .find(|a| a.address_type == "InternalIP")
            .and_then(|a| a.address.parse::<Ipv4Addr>().ok());

        let network_unavailable = api
            .status
            .conditions
            .iter()
            .find(|c| c.condition_type == "NetworkUnavailable")
            .map(|c| c.status == "True");

        RawNode {
            name: api.metadata.name,
            internal_address,
            pod_cidr: api.spec.pod_cidr,
            network_unavailable,
            machine_id: api.status.node_info.machine_id,
            system_uuid: api.status.node_info.system_uuid,
            boot_id: api.status.node_info.boot_id,
        }
    }
}
