//! Kubernetes REST client for pods.
//!
//! Talks to the API server directly over `reqwest`:
//! - `GET /api/v1/pods?labelSelector=..` (paginated)
//! - `GET /api/v1/pods?watch=true&..` (newline-delimited JSON)
//! - `DELETE /api/v1/namespaces/{ns}/pods/{name}`

use std::time::Duration;

use async_trait::async_trait;
use brig_id::NamespacedPodName;
use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use futures_util::stream::{self, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};

use super::pod::PodList;
use super::{Pod, PodSource, SubstrateError, WatchEvent, WatchStream};
use crate::config::KubeConfig;

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Page size for list requests.
const LIST_PAGE_SIZE: u32 = 500;

/// Server-side watch timeout; the synchronizer relists when it expires.
const WATCH_TIMEOUT_SECS: u64 = 300;

/// Kubernetes pod client.
#[derive(Clone)]
pub struct KubeClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl KubeClient {
    /// Create a client from configuration, falling back to the in-cluster
    /// service account when no URL is configured.
    pub fn new(config: &KubeConfig) -> Result<Self, SubstrateError> {
        match &config.api_url {
            Some(url) => Self::with_base_url(url, config.token.clone()),
            None => Self::in_cluster(),
        }
    }

    /// Create a client for an explicit API server URL.
    pub fn with_base_url(
        base_url: impl Into<String>,
        token: Option<String>,
    ) -> Result<Self, SubstrateError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Create a client from the pod's service account.
    pub fn in_cluster() -> Result<Self, SubstrateError> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| SubstrateError::Config("KUBERNETES_SERVICE_HOST is not set".into()))?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".into());

        let token = std::fs::read_to_string(format!("{SERVICE_ACCOUNT_DIR}/token"))
            .map_err(|e| SubstrateError::Config(format!("reading service account token: {e}")))?;
        let ca = std::fs::read(format!("{SERVICE_ACCOUNT_DIR}/ca.crt"))
            .map_err(|e| SubstrateError::Config(format!("reading cluster CA: {e}")))?;
        let ca = reqwest::Certificate::from_pem(&ca)?;

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .add_root_certificate(ca)
            .build()?;

        let host = if host.contains(':') {
            format!("[{host}]")
        } else {
            host
        };

        Ok(Self {
            client,
            base_url: format!("https://{host}:{port}"),
            token: Some(token.trim().to_string()),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, SubstrateError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(SubstrateError::Status { status, body })
    }
}

#[async_trait]
impl PodSource for KubeClient {
    async fn list(&self, label_selector: &str) -> Result<PodList, SubstrateError> {
        let mut all = PodList::default();
        let mut continue_token: Option<String> = None;

        loop {
            let limit = LIST_PAGE_SIZE.to_string();
            let mut query = vec![("labelSelector", label_selector), ("limit", limit.as_str())];
            if let Some(token) = continue_token.as_deref() {
                query.push(("continue", token));
            }

            let response = self
                .request(reqwest::Method::GET, "/api/v1/pods")
                .query(&query)
                .send()
                .await?;
            let page: PodList = Self::check(response)
                .await?
                .json()
                .await
                .map_err(|e| SubstrateError::Decode(e.to_string()))?;

            all.items.extend(page.items);
            all.metadata.resource_version = page.metadata.resource_version;

            match page.metadata.continue_token.filter(|t| !t.is_empty()) {
                Some(token) => continue_token = Some(token),
                None => break,
            }
        }

        debug!(
            label_selector,
            count = all.items.len(),
            resource_version = ?all.metadata.resource_version,
            "Listed pods"
        );
        Ok(all)
    }

    async fn watch(
        &self,
        label_selector: &str,
        resource_version: &str,
    ) -> Result<WatchStream, SubstrateError> {
        let timeout = WATCH_TIMEOUT_SECS.to_string();
        let response = self
            .request(reqwest::Method::GET, "/api/v1/pods")
            .query(&[
                ("labelSelector", label_selector),
                ("watch", "true"),
                ("allowWatchBookmarks", "true"),
                ("resourceVersion", resource_version),
                ("timeoutSeconds", timeout.as_str()),
            ])
            .send()
            .await?;
        let response = Self::check(response).await?;

        debug!(label_selector, resource_version, "Watching pods");
        Ok(watch_events(response.bytes_stream()))
    }

    async fn delete(&self, pod: &NamespacedPodName) -> Result<(), SubstrateError> {
        let path = format!(
            "/api/v1/namespaces/{}/pods/{}",
            pod.namespace(),
            pod.name()
        );
        let response = self
            .request(reqwest::Method::DELETE, &path)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            debug!(pod = %pod, "Pod already gone");
            return Ok(());
        }
        Self::check(response).await?;
        Ok(())
    }
}

#[derive(Deserialize)]
struct RawWatchEvent {
    #[serde(rename = "type")]
    kind: String,
    object: serde_json::Value,
}

#[derive(Deserialize, Default)]
struct WatchStatus {
    #[serde(default)]
    code: u16,
    #[serde(default)]
    message: String,
}

fn decode_watch_line(line: &[u8]) -> Result<WatchEvent, SubstrateError> {
    let raw: RawWatchEvent =
        serde_json::from_slice(line).map_err(|e| SubstrateError::Decode(e.to_string()))?;

    let pod = |object: serde_json::Value| {
        serde_json::from_value::<Pod>(object).map_err(|e| SubstrateError::Decode(e.to_string()))
    };

    match raw.kind.as_str() {
        "ADDED" => Ok(WatchEvent::Added(pod(raw.object)?)),
        "MODIFIED" => Ok(WatchEvent::Modified(pod(raw.object)?)),
        "DELETED" => Ok(WatchEvent::Deleted(pod(raw.object)?)),
        "BOOKMARK" => {
            let pod = pod(raw.object)?;
            Ok(WatchEvent::Bookmark(
                pod.metadata.resource_version.unwrap_or_default(),
            ))
        }
        "ERROR" => {
            let status: WatchStatus = serde_json::from_value(raw.object).unwrap_or_default();
            Err(SubstrateError::Watch {
                code: status.code,
                message: status.message,
            })
        }
        other => Err(SubstrateError::Decode(format!(
            "unexpected watch event type {other:?}"
        ))),
    }
}

struct LineState<S> {
    body: std::pin::Pin<Box<S>>,
    buf: BytesMut,
    done: bool,
}

/// Split a chunked body into newline-delimited watch events.
fn watch_events<S>(body: S) -> WatchStream
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
{
    let state = LineState {
        body: Box::pin(body),
        buf: BytesMut::new(),
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(pos) = state.buf.iter().position(|b| *b == b'\n') {
                let line = state.buf.split_to(pos + 1);
                let line = &line[..pos];
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                return Some((decode_watch_line(line), state));
            }

            if state.done {
                if state.buf.iter().all(u8::is_ascii_whitespace) {
                    return None;
                }
                let rest = state.buf.split();
                return Some((decode_watch_line(&rest), state));
            }

            match state.body.next().await {
                Some(Ok(chunk)) => state.buf.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    warn!(error = %e, "Watch stream interrupted");
                    state.buf.clear();
                    state.done = true;
                    return Some((Err(SubstrateError::Http(e)), state));
                }
                None => state.done = true,
            }
        }
    })
    .boxed()
}
