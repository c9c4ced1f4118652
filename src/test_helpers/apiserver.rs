// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Stand-ins for the API server and the kubelet behind it.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http::header::{AUTHORIZATION, CONNECTION, CONTENT_TYPE, UPGRADE};
use http::{Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::copy::{self, ConnectionStats};
use crate::kube::client::{PORTFORWARD_PROTOCOL, SPDY_UPGRADE, STREAM_PROTOCOL_HEADER};
use crate::kube::{self, BoxedIo, Cluster, ConnectionResolver, PodIdentity};
use crate::spdy::{self, RstStatus, Stream};
use crate::tunnel::portforward::{
    HEADER_PORT, HEADER_REQUEST_ID, HEADER_STREAM_TYPE, STREAM_TYPE_DATA, STREAM_TYPE_ERROR,
};

/// What the fake kubelet does with the streams for one pod port.
#[derive(Clone, Debug)]
pub enum Backend {
    /// Writes back whatever it reads.
    Echo,
    /// Dials the address and forwards to it, like a real pod port.
    Tcp(SocketAddr),
    /// Reports the message on the error stream and closes the data stream.
    Refuse(String),
    /// Refuses to create the streams at all.
    Reset,
}

/// Kubelet serves the port-forward protocol on upgraded connections. Ports
/// without a configured backend echo.
#[derive(Clone, Debug, Default)]
pub struct Kubelet {
    backends: Arc<HashMap<u16, Backend>>,
    stop: CancellationToken,
}

impl Kubelet {
    pub fn with_backend(mut self, port: u16, backend: Backend) -> Self {
        Arc::make_mut(&mut self.backends).insert(port, backend);
        self
    }

    /// Drops every connection, now and in the future.
    pub fn drop_connections(&self) {
        self.stop.cancel();
    }

    // A kubelet for one connection; it can be dropped on its own and still goes
    // away with the parent.
    fn for_connection(&self) -> Kubelet {
        Kubelet {
            backends: self.backends.clone(),
            stop: self.stop.child_token(),
        }
    }

    pub async fn serve<IO>(&self, io: IO)
    where
        IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (conn, mut incoming) = spdy::Connection::new(io, spdy::Role::Server);
        // Error streams waiting for their data stream, by request id.
        let mut pending: HashMap<String, Stream> = HashMap::new();
        loop {
            let stream = tokio::select! {
                _ = self.stop.cancelled() => break,
                s = incoming.accept() => match s {
                    Some(s) => s,
                    None => break,
                },
            };
            let header = |name: &str| stream.headers().get(name).unwrap_or_default().to_string();
            let kind = header(HEADER_STREAM_TYPE);
            let request = header(HEADER_REQUEST_ID);
            let port: u16 = header(HEADER_PORT).parse().unwrap_or_default();
            let backend = self.backends.get(&port).cloned().unwrap_or(Backend::Echo);
            if matches!(backend, Backend::Reset) {
                stream.refuse().await;
                continue;
            }
            let Ok(stream) = stream.accept().await else {
                break;
            };
            match kind.as_str() {
                STREAM_TYPE_ERROR => {
                    pending.insert(request, stream);
                }
                STREAM_TYPE_DATA => match pending.remove(&request) {
                    Some(error) => {
                        tokio::spawn(forward(backend, stream, error));
                    }
                    None => stream.reset(RstStatus::ProtocolError).await,
                },
                _ => stream.reset(RstStatus::ProtocolError).await,
            }
        }
        conn.close();
    }
}

async fn forward(backend: Backend, mut data: Stream, mut error: Stream) {
    match backend {
        Backend::Echo => {
            let (mut r, mut w) = data.into_split();
            let _ = tokio::io::copy(&mut r, &mut w).await;
            let _ = w.shutdown().await;
        }
        Backend::Tcp(addr) => match TcpStream::connect(addr).await {
            Ok(upstream) => {
                let stats = ConnectionStats::default();
                if let Err(e) = copy::copy_bidirectional(upstream, data, &stats).await {
                    debug!("kubelet forward failed: {e}");
                }
            }
            Err(e) => {
                let msg = format!("error forwarding port {} to pod: {e}", addr.port());
                let _ = error.write_all(msg.as_bytes()).await;
            }
        },
        Backend::Refuse(msg) => {
            let _ = error.write_all(msg.as_bytes()).await;
            let _ = error.shutdown().await;
            let _ = data.shutdown().await;
        }
        Backend::Reset => {}
    }
    let _ = error.shutdown().await;
}

/// StaticCluster is an in-memory cluster. Upgrades are served over in-process
/// pipes by a [`Kubelet`].
#[derive(Debug, Default)]
pub struct StaticCluster {
    pods: Vec<PodIdentity>,
    fail: bool,
    hang: bool,
    kubelet: Kubelet,
    queries: Mutex<Vec<(String, String)>>,
    upgrades: Arc<AtomicUsize>,
}

impl StaticCluster {
    pub fn with_pods(namespace: &str, names: &[&str]) -> Self {
        StaticCluster {
            pods: names
                .iter()
                .map(|n| PodIdentity {
                    namespace: namespace.to_string(),
                    name: n.to_string(),
                    phase: "Running".to_string(),
                })
                .collect(),
            ..Default::default()
        }
    }

    /// A cluster whose pod queries always fail.
    pub fn failing() -> Self {
        StaticCluster {
            fail: true,
            ..Default::default()
        }
    }

    pub fn with_backend(mut self, port: u16, backend: Backend) -> Self {
        self.kubelet = self.kubelet.with_backend(port, backend);
        self
    }

    /// Upgrades never complete.
    pub fn hang_upgrades(mut self) -> Self {
        self.hang = true;
        self
    }

    pub fn queries(&self) -> Vec<(String, String)> {
        self.queries.lock().unwrap().clone()
    }

    pub fn upgrades(&self) -> usize {
        self.upgrades.load(Ordering::SeqCst)
    }

    pub fn upgrade_counter(&self) -> Arc<AtomicUsize> {
        self.upgrades.clone()
    }

    pub fn drop_connections(&self) {
        self.kubelet.drop_connections()
    }

    /// A handle on the kubelet serving this cluster's upgrades.
    pub fn kubelet(&self) -> Kubelet {
        self.kubelet.clone()
    }
}

#[async_trait::async_trait]
impl Cluster for StaticCluster {
    async fn list_pods(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<PodIdentity>, kube::Error> {
        self.queries
            .lock()
            .unwrap()
            .push((namespace.to_string(), selector.to_string()));
        if self.fail {
            return Err(kube::Error::Status(
                StatusCode::INTERNAL_SERVER_ERROR,
                "etcdserver: request timed out".to_string(),
            ));
        }
        Ok(self
            .pods
            .iter()
            .filter(|p| p.namespace == namespace)
            .cloned()
            .collect())
    }

    async fn portforward(&self, namespace: &str, pod: &str) -> Result<BoxedIo, kube::Error> {
        if self.hang {
            std::future::pending::<()>().await;
        }
        if !self
            .pods
            .iter()
            .any(|p| p.namespace == namespace && p.name == pod)
        {
            return Err(kube::Error::Status(
                StatusCode::NOT_FOUND,
                format!("pods \"{pod}\" not found"),
            ));
        }
        self.upgrades.fetch_add(1, Ordering::SeqCst);
        let (client, server) = tokio::io::duplex(64 * 1024);
        let kubelet = self.kubelet.clone();
        tokio::spawn(async move { kubelet.serve(server).await });
        Ok(Box::new(client))
    }
}

/// StaticResolver maps context names to static clusters; unknown contexts fail.
#[derive(Default)]
pub struct StaticResolver {
    contexts: HashMap<String, Arc<StaticCluster>>,
}

impl StaticResolver {
    pub fn with_context(mut self, name: &str, cluster: StaticCluster) -> Self {
        self.contexts.insert(name.to_string(), Arc::new(cluster));
        self
    }
}

#[async_trait::async_trait]
impl ConnectionResolver for StaticResolver {
    async fn resolve(&self, context: &str) -> Result<Arc<dyn Cluster>, kube::Error> {
        match self.contexts.get(context) {
            Some(c) => Ok(c.clone()),
            None => Err(kube::Error::ContextNotFound(context.to_string())),
        }
    }
}

/// A pod served by [`FakeApiServer`].
#[derive(Clone, Debug)]
pub struct FakePod {
    pub namespace: String,
    pub name: String,
    pub labels: HashMap<String, String>,
    pub phase: String,
}

impl FakePod {
    pub fn new(namespace: &str, name: &str, labels: &[(&str, &str)]) -> Self {
        FakePod {
            namespace: namespace.to_string(),
            name: name.to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            phase: "Running".to_string(),
        }
    }

    // Equality based selectors only: `k=v`, `k==v` and `k!=v`, comma separated.
    fn matches(&self, selector: &str) -> bool {
        selector
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .all(|req| {
                if let Some((k, v)) = req.split_once("!=") {
                    self.labels.get(k.trim()).map(String::as_str) != Some(v.trim())
                } else if let Some((k, v)) = req.split_once('=') {
                    let v = v.trim_start_matches('=');
                    self.labels.get(k.trim()).map(String::as_str) == Some(v.trim())
                } else {
                    self.labels.contains_key(req)
                }
            })
    }
}

#[derive(Debug, Default)]
pub struct ApiServerConfig {
    pub pods: Vec<FakePod>,
    pub kubelet: Kubelet,
    /// When set, requests must carry this bearer token.
    pub token: Option<String>,
}

#[derive(Debug)]
struct ApiState {
    cfg: ApiServerConfig,
    upgrades: AtomicUsize,
    // One kubelet per upgraded connection, in upgrade order.
    channels: Mutex<Vec<Kubelet>>,
}

/// FakeApiServer is an HTTP/1 API server serving pod lists and port-forward
/// upgrades on a loopback port.
#[derive(Debug)]
pub struct FakeApiServer {
    address: SocketAddr,
    state: Arc<ApiState>,
}

impl FakeApiServer {
    pub async fn spawn(cfg: ApiServerConfig) -> FakeApiServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let state = Arc::new(ApiState {
            cfg,
            upgrades: AtomicUsize::new(0),
            channels: Mutex::new(Vec::new()),
        });
        let s = state.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let state = s.clone();
                tokio::spawn(async move {
                    let svc = service_fn(move |req| handle(state.clone(), req));
                    if let Err(e) = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), svc)
                        .with_upgrades()
                        .await
                    {
                        debug!("fake api server connection ended: {e}");
                    }
                });
            }
        });
        FakeApiServer { address, state }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.address)
    }

    pub fn upgrades(&self) -> usize {
        self.state.upgrades.load(Ordering::SeqCst)
    }

    pub fn drop_connections(&self) {
        self.state.cfg.kubelet.drop_connections()
    }

    /// Drops the `n`th upgraded connection, counting from 0.
    pub fn drop_upgrade(&self, n: usize) {
        self.state.channels.lock().unwrap()[n].drop_connections()
    }

    /// Writes a kubeconfig with one context per name, all pointing at this server.
    pub fn write_kubeconfig(&self, dir: &Path, contexts: &[&str]) -> PathBuf {
        let user = match &self.state.cfg.token {
            Some(t) => json!({ "token": t }),
            None => json!({}),
        };
        let kubeconfig = json!({
            "apiVersion": "v1",
            "kind": "Config",
            "clusters": [{ "name": "fake", "cluster": { "server": self.url() } }],
            "users": [{ "name": "fake", "user": user }],
            "contexts": contexts
                .iter()
                .map(|c| json!({ "name": c, "context": { "cluster": "fake", "user": "fake" } }))
                .collect::<Vec<_>>(),
        });
        let path = dir.join("kubeconfig");
        std::fs::write(&path, serde_yaml::to_string(&kubeconfig).unwrap()).unwrap();
        path
    }
}

fn json_response(code: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(code)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

fn status(code: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json_response(
        code,
        json!({ "kind": "Status", "status": "Failure", "message": message, "code": code.as_u16() }),
    )
}

async fn handle(
    state: Arc<ApiState>,
    mut req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    if let Some(token) = &state.cfg.token {
        let want = format!("Bearer {token}");
        let authorized = req
            .headers()
            .get(AUTHORIZATION)
            .is_some_and(|v| v.as_bytes() == want.as_bytes());
        if !authorized {
            return Ok(status(StatusCode::UNAUTHORIZED, "Unauthorized"));
        }
    }
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    match (&method, segments.as_slice()) {
        (&Method::GET, ["api", "v1", "namespaces", ns, "pods"]) => {
            let selector = req
                .uri()
                .query()
                .and_then(|q| {
                    url::form_urlencoded::parse(q.as_bytes())
                        .find(|(k, _)| k == "labelSelector")
                        .map(|(_, v)| v.into_owned())
                })
                .unwrap_or_default();
            let items: Vec<serde_json::Value> = state
                .cfg
                .pods
                .iter()
                .filter(|p| p.namespace == *ns && p.matches(&selector))
                .map(|p| {
                    json!({
                        "metadata": { "name": p.name, "namespace": p.namespace, "labels": p.labels },
                        "status": { "phase": p.phase },
                    })
                })
                .collect();
            Ok(json_response(
                StatusCode::OK,
                json!({ "kind": "PodList", "apiVersion": "v1", "items": items }),
            ))
        }
        (&Method::POST, ["api", "v1", "namespaces", ns, "pods", name, "portforward"]) => {
            if !state
                .cfg
                .pods
                .iter()
                .any(|p| p.namespace == *ns && p.name == *name)
            {
                return Ok(status(
                    StatusCode::NOT_FOUND,
                    &format!("pods \"{name}\" not found"),
                ));
            }
            let spdy = req
                .headers()
                .get(UPGRADE)
                .is_some_and(|v| v.as_bytes().eq_ignore_ascii_case(SPDY_UPGRADE.as_bytes()));
            if !spdy {
                return Ok(status(StatusCode::BAD_REQUEST, "Upgrade request required"));
            }
            state.upgrades.fetch_add(1, Ordering::SeqCst);
            let on_upgrade = hyper::upgrade::on(&mut req);
            let kubelet = state.cfg.kubelet.for_connection();
            state.channels.lock().unwrap().push(kubelet.clone());
            tokio::spawn(async move {
                match on_upgrade.await {
                    Ok(upgraded) => kubelet.serve(TokioIo::new(upgraded)).await,
                    Err(e) => warn!("fake api server upgrade failed: {e}"),
                }
            });
            Ok(Response::builder()
                .status(StatusCode::SWITCHING_PROTOCOLS)
                .header(CONNECTION, "Upgrade")
                .header(UPGRADE, SPDY_UPGRADE)
                .header(STREAM_PROTOCOL_HEADER, PORTFORWARD_PROTOCOL)
                .body(Full::default())
                .unwrap())
        }
        _ => Ok(status(StatusCode::NOT_FOUND, "the server could not find the requested resource")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selectors() {
        let pod = FakePod::new("ns", "x", &[("app", "x"), ("tier", "web")]);
        assert!(pod.matches("app=x"));
        assert!(pod.matches("app==x,tier=web"));
        assert!(pod.matches("app=x,tier!=db"));
        assert!(pod.matches("tier"));
        assert!(!pod.matches("app=y"));
        assert!(!pod.matches("app=x,missing"));
    }
}
