//! Read access to live workload state.

use std::time::Duration;

use async_trait::async_trait;
use finops_core::ResourceSet;
use finops_core::config::SyncConfig;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{ClusterError, ClusterResult};

/// What the cluster currently runs for one workload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkloadState {
    pub replicas: Option<u32>,
    /// Requests of the first container.
    pub requests: ResourceSet,
}

#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// `Ok(None)` when the workload does not exist.
    async fn workload_state(
        &self,
        namespace: &str,
        kind: &str,
        name: &str,
    ) -> ClusterResult<Option<WorkloadState>>;
}

/// Kubernetes API over plain HTTP, typically a `kubectl proxy` address.
pub struct KubeApiClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl KubeApiClient {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> ClusterResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    pub fn from_config(config: &SyncConfig) -> ClusterResult<Self> {
        let token = config
            .token_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|t| !t.is_empty());
        if config.token_env.is_some() && token.is_none() {
            warn!(env = ?config.token_env, "cluster token variable is unset");
        }
        Self::new(
            &config.cluster_api_url,
            token,
            Duration::from_secs(config.query_timeout_secs.max(1)),
        )
    }

    fn workload_url(&self, namespace: &str, kind: &str, name: &str) -> ClusterResult<String> {
        let plural = match kind.to_ascii_lowercase().as_str() {
            "deployment" => "deployments",
            "statefulset" => "statefulsets",
            _ => return Err(ClusterError::UnsupportedKind(kind.to_string())),
        };
        Ok(format!(
            "{}/apis/apps/v1/namespaces/{namespace}/{plural}/{name}",
            self.base_url
        ))
    }
}

#[async_trait]
impl ClusterClient for KubeApiClient {
    async fn workload_state(
        &self,
        namespace: &str,
        kind: &str,
        name: &str,
    ) -> ClusterResult<Option<WorkloadState>> {
        let url = self.workload_url(namespace, kind, name)?;
        let mut request = self.client.get(&url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            debug!(%url, "workload not found");
            return Ok(None);
        }
        if !status.is_success() {
            return Err(ClusterError::Status {
                status: status.as_u16(),
                url,
            });
        }

        let workload: Workload = response.json().await?;
        Ok(Some(workload.into_state()))
    }
}

// Only the fields the reconciler compares.

#[derive(Debug, Deserialize)]
struct Workload {
    #[serde(default)]
    spec: WorkloadSpec,
}

#[derive(Debug, Default, Deserialize)]
struct WorkloadSpec {
    replicas: Option<u32>,
    #[serde(default)]
    template: PodTemplate,
}

#[derive(Debug, Default, Deserialize)]
struct PodTemplate {
    #[serde(default)]
    spec: PodSpec,
}

#[derive(Debug, Default, Deserialize)]
struct PodSpec {
    #[serde(default)]
    containers: Vec<Container>,
}

#[derive(Debug, Default, Deserialize)]
struct Container {
    #[serde(default)]
    resources: Resources,
}

#[derive(Debug, Default, Deserialize)]
struct Resources {
    #[serde(default)]
    requests: ResourceSet,
}

impl Workload {
    fn into_state(self) -> WorkloadState {
        let requests = self
            .spec
            .template
            .spec
            .containers
            .into_iter()
            .next()
            .map(|c| c.resources.requests)
            .unwrap_or_default();
        WorkloadState {
            replicas: self.spec.replicas,
            requests,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const DEPLOYMENT: &str = r#"{
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {"name": "nginx", "namespace": "dev"},
        "spec": {
            "replicas": 2,
            "template": {"spec": {"containers": [
                {"name": "nginx", "resources": {"requests": {"cpu": "200m", "memory": "256Mi"}}},
                {"name": "sidecar", "resources": {"requests": {"cpu": "10m"}}}
            ]}}
        }
    }"#;

    /// Serve one canned HTTP response on a local port.
    async fn serve_once(status: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let mut read = 0;
            while !buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf[read..]).await.unwrap();
                if n == 0 {
                    break;
                }
                read += n;
            }
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn first_container_requests_are_read() {
        let workload: Workload = serde_json::from_str(DEPLOYMENT).unwrap();
        let state = workload.into_state();
        assert_eq!(state.replicas, Some(2));
        assert_eq!(state.requests.get("cpu").map(String::as_str), Some("200m"));
        assert_eq!(state.requests.get("memory").map(String::as_str), Some("256Mi"));
    }

    #[test]
    fn empty_spec_yields_empty_state() {
        let workload: Workload = serde_json::from_str(r#"{"spec": {}}"#).unwrap();
        assert_eq!(workload.into_state(), WorkloadState::default());
    }

    #[test]
    fn unsupported_kind_is_rejected() {
        let client = KubeApiClient::new("http://x/", None, Duration::from_secs(1)).unwrap();
        assert_eq!(
            client.workload_url("dev", "Deployment", "nginx").unwrap(),
            "http://x/apis/apps/v1/namespaces/dev/deployments/nginx"
        );
        assert!(matches!(
            client.workload_url("dev", "cronjob", "nightly"),
            Err(ClusterError::UnsupportedKind(_))
        ));
    }

    #[tokio::test]
    async fn reads_deployment_over_http() {
        let base = serve_once("200 OK", DEPLOYMENT).await;
        let client = KubeApiClient::new(&base, Some("token".into()), Duration::from_secs(5)).unwrap();
        let state = client
            .workload_state("dev", "deployment", "nginx")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.replicas, Some(2));
    }

    #[tokio::test]
    async fn missing_workload_is_none() {
        let base = serve_once("404 Not Found", "{}").await;
        let client = KubeApiClient::new(&base, None, Duration::from_secs(5)).unwrap();
        let state = client
            .workload_state("dev", "deployment", "ghost")
            .await
            .unwrap();
        assert!(state.is_none());
    }

    #[tokio::test]
    async fn server_error_is_status_error() {
        let base = serve_once("500 Internal Server Error", "{}").await;
        let client = KubeApiClient::new(&base, None, Duration::from_secs(5)).unwrap();
        let err = client
            .workload_state("dev", "deployment", "nginx")
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Status { status: 500, .. }));
    }

    #[tokio::test]
    async fn closed_port_is_http_error() {
        let client = KubeApiClient::new("http://127.0.0.1:1", None, Duration::from_secs(1)).unwrap();
        let err = client
            .workload_state("dev", "deployment", "nginx")
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Http(_)));
    }
}
