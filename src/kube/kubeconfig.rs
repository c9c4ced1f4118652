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

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine;
use bytes::Bytes;
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use super::exec::{self, ExecConfig};
use super::{Client, Cluster, ConnectionResolver, Error};
use crate::tls::{ClientIdentity, RootCert};

/// Credentials presented on every request.
#[derive(Clone, Default, PartialEq, Eq)]
pub enum Auth {
    #[default]
    None,
    Bearer(String),
    Basic {
        username: String,
        password: String,
    },
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Auth::None => write!(f, "None"),
            Auth::Bearer(_) => write!(f, "Bearer(<redacted>)"),
            Auth::Basic { username, .. } => write!(f, "Basic({username})"),
        }
    }
}

/// Everything needed to talk to the API server of one context.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    pub server: Url,
    pub root_cert: RootCert,
    pub identity: Option<ClientIdentity>,
    pub auth: Auth,
    pub tls_server_name: Option<String>,
}

impl ConnectionConfig {
    /// A config for a plain HTTP server without credentials.
    pub fn insecure(server: Url) -> ConnectionConfig {
        ConnectionConfig {
            server,
            root_cert: RootCert::Default,
            identity: None,
            auth: Auth::None,
            tls_server_name: None,
        }
    }
}

#[derive(Deserialize, Default, Debug)]
#[serde(rename_all = "kebab-case")]
struct Kubeconfig {
    #[serde(default)]
    clusters: Vec<NamedCluster>,
    #[serde(default)]
    users: Vec<NamedUser>,
    #[serde(default)]
    contexts: Vec<NamedContext>,
    current_context: Option<String>,
}

#[derive(Deserialize, Debug)]
struct NamedCluster {
    name: String,
    cluster: ClusterEntry,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "kebab-case")]
struct ClusterEntry {
    server: String,
    certificate_authority: Option<PathBuf>,
    certificate_authority_data: Option<String>,
    #[serde(default)]
    insecure_skip_tls_verify: bool,
    tls_server_name: Option<String>,
}

#[derive(Deserialize, Debug)]
struct NamedUser {
    name: String,
    #[serde(default)]
    user: UserEntry,
}

#[derive(Deserialize, Default, Debug)]
#[serde(rename_all = "kebab-case")]
struct UserEntry {
    token: Option<String>,
    #[serde(rename = "tokenFile")]
    token_file: Option<PathBuf>,
    client_certificate: Option<PathBuf>,
    client_certificate_data: Option<String>,
    client_key: Option<PathBuf>,
    client_key_data: Option<String>,
    username: Option<String>,
    password: Option<String>,
    exec: Option<ExecConfig>,
}

#[derive(Deserialize, Debug)]
struct NamedContext {
    name: String,
    context: ContextEntry,
}

#[derive(Deserialize, Debug)]
struct ContextEntry {
    cluster: String,
    #[serde(default)]
    user: String,
}

fn relative_to(dir: &Path, path: &mut Option<PathBuf>) {
    if let Some(p) = path {
        if p.is_relative() {
            *p = dir.join(&*p);
        }
    }
}

impl Kubeconfig {
    // File references in a kubeconfig are relative to the file itself.
    fn resolve_paths(&mut self, dir: &Path) {
        for c in &mut self.clusters {
            relative_to(dir, &mut c.cluster.certificate_authority);
        }
        for u in &mut self.users {
            relative_to(dir, &mut u.user.token_file);
            relative_to(dir, &mut u.user.client_certificate);
            relative_to(dir, &mut u.user.client_key);
            if let Some(exec) = &mut u.user.exec {
                // Bare commands are looked up on PATH.
                if exec.command.components().count() > 1 && exec.command.is_relative() {
                    exec.command = dir.join(&exec.command);
                }
            }
        }
    }

    // The first file to define a name wins.
    fn merge(&mut self, other: Kubeconfig) {
        for c in other.clusters {
            if !self.clusters.iter().any(|e| e.name == c.name) {
                self.clusters.push(c);
            }
        }
        for u in other.users {
            if !self.users.iter().any(|e| e.name == u.name) {
                self.users.push(u);
            }
        }
        for c in other.contexts {
            if !self.contexts.iter().any(|e| e.name == c.name) {
                self.contexts.push(c);
            }
        }
        if self.current_context.is_none() {
            self.current_context = other.current_context;
        }
    }
}

async fn read_file(path: &Path) -> Result<Bytes, Error> {
    tokio::fs::read(path)
        .await
        .map(Bytes::from)
        .map_err(|e| Error::Read(path.to_path_buf(), e))
}

fn decode_data(field: &str, data: &str) -> Result<Bytes, Error> {
    base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .map(Bytes::from)
        .map_err(|e| Error::InvalidCertificate(format!("{field}: {e}")))
}

async fn data_or_file(
    field: &str,
    data: Option<&String>,
    file: Option<&PathBuf>,
) -> Result<Option<Bytes>, Error> {
    match (data, file) {
        (Some(data), _) => decode_data(field, data).map(Some),
        (None, Some(file)) => read_file(file).await.map(Some),
        (None, None) => Ok(None),
    }
}

/// KubeconfigResolver resolves contexts from kubeconfig files, merged in order.
#[derive(Clone, Debug)]
pub struct KubeconfigResolver {
    paths: Vec<PathBuf>,
}

impl KubeconfigResolver {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        KubeconfigResolver { paths }
    }

    async fn load(&self) -> Result<Kubeconfig, Error> {
        let mut merged: Option<Kubeconfig> = None;
        for path in &self.paths {
            let contents = match tokio::fs::read(path).await {
                Ok(c) => c,
                // Missing entries in the search path are skipped, like kubectl does.
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!("kubeconfig {} does not exist, skipping", path.display());
                    continue;
                }
                Err(e) => return Err(Error::Read(path.clone(), e)),
            };
            let mut cfg: Kubeconfig = serde_yaml::from_slice(&contents)
                .map_err(|e| Error::InvalidKubeconfig(path.clone(), e))?;
            if let Some(dir) = path.parent() {
                cfg.resolve_paths(dir);
            }
            match &mut merged {
                Some(m) => m.merge(cfg),
                None => merged = Some(cfg),
            }
        }
        merged.ok_or(Error::NoKubeconfig)
    }

    /// Builds the connection config for `context`, running credential plugins if the
    /// user has one.
    pub async fn connection_config(&self, context: &str) -> Result<ConnectionConfig, Error> {
        let kc = self.load().await?;
        let ctx = kc
            .contexts
            .iter()
            .find(|c| c.name == context)
            .ok_or_else(|| Error::ContextNotFound(context.to_string()))?;
        let cluster = &kc
            .clusters
            .iter()
            .find(|c| c.name == ctx.context.cluster)
            .ok_or_else(|| Error::ClusterNotFound(ctx.context.cluster.clone()))?
            .cluster;
        let empty = UserEntry::default();
        let user = if ctx.context.user.is_empty() {
            &empty
        } else {
            &kc.users
                .iter()
                .find(|u| u.name == ctx.context.user)
                .ok_or_else(|| Error::UserNotFound(ctx.context.user.clone()))?
                .user
        };

        if cluster.insecure_skip_tls_verify {
            return Err(Error::InvalidConfig(
                "insecure-skip-tls-verify is not supported".to_string(),
            ));
        }
        let server = Url::parse(&cluster.server)?;
        let root_cert = match (&cluster.certificate_authority_data, &cluster.certificate_authority)
        {
            (Some(data), _) => RootCert::Static(decode_data("certificate-authority-data", data)?),
            (None, Some(path)) => RootCert::File(path.clone()),
            (None, None) => RootCert::Default,
        };

        let cert = data_or_file(
            "client-certificate-data",
            user.client_certificate_data.as_ref(),
            user.client_certificate.as_ref(),
        )
        .await?;
        let key = data_or_file(
            "client-key-data",
            user.client_key_data.as_ref(),
            user.client_key.as_ref(),
        )
        .await?;
        let mut identity = match (cert, key) {
            (Some(cert_chain), Some(key)) => Some(ClientIdentity { cert_chain, key }),
            (None, None) => None,
            _ => {
                return Err(Error::InvalidConfig(
                    "client certificate and key must be set together".to_string(),
                ));
            }
        };

        let mut auth = if let Some(token) = &user.token {
            Auth::Bearer(token.clone())
        } else if let Some(file) = &user.token_file {
            let token = read_file(file).await?;
            Auth::Bearer(String::from_utf8_lossy(&token).trim().to_string())
        } else if let (Some(username), Some(password)) = (&user.username, &user.password) {
            Auth::Basic {
                username: username.clone(),
                password: password.clone(),
            }
        } else {
            Auth::None
        };

        if let Some(plugin) = &user.exec {
            let status = exec::run(plugin).await?;
            if let Some(token) = status.token {
                auth = Auth::Bearer(token);
            }
            if let (Some(cert), Some(key)) = (status.client_certificate_data, status.client_key_data)
            {
                identity = Some(ClientIdentity {
                    cert_chain: Bytes::from(cert),
                    key: Bytes::from(key),
                });
            }
        }

        Ok(ConnectionConfig {
            server,
            root_cert,
            identity,
            auth,
            tls_server_name: cluster.tls_server_name.clone(),
        })
    }
}

#[async_trait::async_trait]
impl ConnectionResolver for KubeconfigResolver {
    async fn resolve(&self, context: &str) -> Result<Arc<dyn Cluster>, Error> {
        let cfg = self.connection_config(context).await?;
        info!(context, server = %cfg.server, "resolved connection");
        Ok(Arc::new(Client::new(cfg).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matches::assert_matches;
    use std::io::Write;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
current-context: dev
clusters:
- name: dev-cluster
  cluster:
    server: https://dev.example.com:6443
    certificate-authority: ca.crt
- name: local
  cluster:
    server: http://127.0.0.1:8080
- name: insecure
  cluster:
    server: https://insecure.example.com
    insecure-skip-tls-verify: true
users:
- name: dev-user
  user:
    token: abc123
- name: file-user
  user:
    tokenFile: token
- name: basic-user
  user:
    username: admin
    password: secret
- name: half-cert
  user:
    client-certificate-data: Y2VydA==
contexts:
- name: dev
  context:
    cluster: dev-cluster
    user: dev-user
- name: local
  context:
    cluster: local
- name: from-file
  context:
    cluster: local
    user: file-user
- name: basic
  context:
    cluster: local
    user: basic-user
- name: insecure
  context:
    cluster: insecure
    user: dev-user
- name: half-cert
  context:
    cluster: local
    user: half-cert
- name: dangling
  context:
    cluster: missing
"#;

    fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    fn resolver(dir: &Path) -> KubeconfigResolver {
        let path = write(dir, "config", KUBECONFIG);
        write(dir, "token", "from-file\n");
        KubeconfigResolver::new(vec![path])
    }

    #[tokio::test]
    async fn token_and_relative_ca() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = resolver(dir.path()).connection_config("dev").await.unwrap();
        assert_eq!(cfg.server.as_str(), "https://dev.example.com:6443/");
        assert_eq!(cfg.root_cert, RootCert::File(dir.path().join("ca.crt")));
        assert_eq!(cfg.auth, Auth::Bearer("abc123".to_string()));
        assert!(cfg.identity.is_none());
    }

    #[tokio::test]
    async fn context_without_user() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = resolver(dir.path()).connection_config("local").await.unwrap();
        assert_eq!(cfg.root_cert, RootCert::Default);
        assert_eq!(cfg.auth, Auth::None);
    }

    #[tokio::test]
    async fn token_file_and_basic_auth() {
        let dir = tempfile::tempdir().unwrap();
        let r = resolver(dir.path());
        let cfg = r.connection_config("from-file").await.unwrap();
        assert_eq!(cfg.auth, Auth::Bearer("from-file".to_string()));
        let cfg = r.connection_config("basic").await.unwrap();
        assert_matches!(cfg.auth, Auth::Basic { username, .. } if username == "admin");
    }

    #[tokio::test]
    async fn rejected_contexts() {
        let dir = tempfile::tempdir().unwrap();
        let r = resolver(dir.path());
        assert_matches!(
            r.connection_config("nope").await,
            Err(Error::ContextNotFound(_))
        );
        assert_matches!(
            r.connection_config("dangling").await,
            Err(Error::ClusterNotFound(_))
        );
        assert_matches!(
            r.connection_config("insecure").await,
            Err(Error::InvalidConfig(_))
        );
        assert_matches!(
            r.connection_config("half-cert").await,
            Err(Error::InvalidConfig(_))
        );
    }

    #[tokio::test]
    async fn first_file_wins() {
        let dir = tempfile::tempdir().unwrap();
        let first = write(
            dir.path(),
            "first",
            r#"
clusters:
- name: local
  cluster:
    server: http://first:80
contexts:
- name: local
  context:
    cluster: local
"#,
        );
        let second = resolver(dir.path()).paths.remove(0);
        let missing = dir.path().join("missing");
        let r = KubeconfigResolver::new(vec![missing, first, second]);
        let cfg = r.connection_config("local").await.unwrap();
        assert_eq!(cfg.server.host_str(), Some("first"));
        // Contexts only defined in the later file are still found.
        assert!(r.connection_config("dev").await.is_ok());
    }

    #[tokio::test]
    async fn no_files() {
        let r = KubeconfigResolver::new(vec![PathBuf::from("/nonexistent/kubeconfig")]);
        assert_matches!(r.connection_config("dev").await, Err(Error::NoKubeconfig));
    }
}
