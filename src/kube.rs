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

//! Access to the Kubernetes API server: resolving a kubeconfig context into a
//! connection, listing pods and upgrading port-forward requests.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use hyper::StatusCode;
use tokio::io::{AsyncRead, AsyncWrite};

pub mod client;
mod exec;
pub mod kubeconfig;

pub use client::Client;
pub use kubeconfig::{ConnectionConfig, KubeconfigResolver};

/// An upgraded, bidirectional byte stream to the API server.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedIo = Box<dyn Io>;

/// A pod as returned by the cluster, reduced to what a tunnel needs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodIdentity {
    pub namespace: String,
    pub name: String,
    pub phase: String,
}

/// Cluster is the query and upgrade surface of one API server, bound to the
/// credentials of one context.
#[async_trait::async_trait]
pub trait Cluster: Send + Sync {
    /// Pods in `namespace` matching the label `selector`, in server order. Pods that
    /// can never serve a forward (finished or terminating) are left out.
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<PodIdentity>, Error>;

    /// Upgrades a port-forward request for the pod to a SPDY/3.1 connection.
    async fn portforward(&self, namespace: &str, pod: &str) -> Result<BoxedIo, Error>;
}

/// ConnectionResolver turns a context name into a cluster handle.
#[async_trait::async_trait]
pub trait ConnectionResolver: Send + Sync {
    async fn resolve(&self, context: &str) -> Result<Arc<dyn Cluster>, Error>;
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to read {0}: {1}")]
    Read(PathBuf, #[source] io::Error),
    #[error("invalid kubeconfig {0}: {1}")]
    InvalidKubeconfig(PathBuf, #[source] serde_yaml::Error),
    #[error("no kubeconfig files found")]
    NoKubeconfig,
    #[error("context {0:?} not found")]
    ContextNotFound(String),
    #[error("cluster {0:?} not found")]
    ClusterNotFound(String),
    #[error("user {0:?} not found")]
    UserNotFound(String),
    #[error("invalid connection config: {0}")]
    InvalidConfig(String),
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),
    #[error("{0}")]
    Tls(#[from] crate::tls::Error),
    #[error("exec credential plugin {0:?} failed: {1}")]
    Exec(String, String),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("invalid request: {0}")]
    Http(#[from] http::Error),
    #[error("request failed: {0}")]
    Request(#[from] hyper_util::client::legacy::Error),
    #[error("connection error: {0}")]
    Hyper(#[from] hyper::Error),
    #[error("api server returned {0}: {1}")]
    Status(StatusCode, String),
    #[error("invalid response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("upgrade rejected: {0}")]
    UpgradeRejected(String),
}
