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

use std::time::Duration;

use base64::Engine;
use bytes::Bytes;
use http::header::{AUTHORIZATION, CONNECTION, UPGRADE};
use http::{HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo};
use serde::Deserialize;
use tracing::{debug, trace};
use url::Url;

use super::kubeconfig::Auth;
use super::{BoxedIo, Cluster, ConnectionConfig, Error, PodIdentity};
use crate::tls;

pub const STREAM_PROTOCOL_HEADER: &str = "x-stream-protocol-version";
pub const PORTFORWARD_PROTOCOL: &str = "portforward.k8s.io";
pub const SPDY_UPGRADE: &str = "SPDY/3.1";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type HttpsConnector = hyper_rustls::HttpsConnector<HttpConnector>;
type LegacyClient = hyper_util::client::legacy::Client<HttpsConnector, Full<Bytes>>;

/// Client talks to one API server with the credentials of one context.
#[derive(Clone)]
pub struct Client {
    server: Url,
    auth: Option<HeaderValue>,
    client: LegacyClient,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("server", &self.server.as_str())
            .finish_non_exhaustive()
    }
}

fn auth_header(auth: &Auth) -> Result<Option<HeaderValue>, Error> {
    let raw = match auth {
        Auth::None => return Ok(None),
        Auth::Bearer(token) => format!("Bearer {token}"),
        Auth::Basic { username, password } => {
            let encoded =
                base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
            format!("Basic {encoded}")
        }
    };
    let mut value = HeaderValue::from_str(&raw)
        .map_err(|_| Error::InvalidConfig("credentials are not a valid header".to_string()))?;
    value.set_sensitive(true);
    Ok(Some(value))
}

impl Client {
    pub async fn new(cfg: ConnectionConfig) -> Result<Client, Error> {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_connect_timeout(Some(CONNECT_TIMEOUT));
        http.set_nodelay(true);

        let builder = hyper_rustls::HttpsConnectorBuilder::new();
        let builder = if cfg.server.scheme() == "https" {
            builder.with_tls_config(tls::client_config(&cfg.root_cert, cfg.identity.as_ref()).await?)
        } else {
            // Plain http servers never use the TLS config; skip loading roots.
            builder.with_tls_config(
                rustls::ClientConfig::builder_with_provider(tls::provider())
                    .with_safe_default_protocol_versions()
                    .map_err(tls::Error::from)?
                    .with_root_certificates(rustls::RootCertStore::empty())
                    .with_no_client_auth(),
            )
        };
        let builder = builder.https_or_http();
        #[allow(deprecated)]
        let builder = match &cfg.tls_server_name {
            Some(name) => builder.with_server_name(name.clone()),
            None => builder,
        };
        let connector = builder.enable_http1().wrap_connector(http);
        let client = hyper_util::client::legacy::Client::builder(TokioExecutor::new())
            .build::<_, Full<Bytes>>(connector);
        Ok(Client {
            server: cfg.server,
            auth: auth_header(&cfg.auth)?,
            client,
        })
    }

    fn url(&self, path: &str, query: &[(&str, &str)]) -> Result<Url, Error> {
        let mut url = self.server.clone();
        // Servers may be hosted under a path prefix.
        let prefix = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{prefix}{path}"));
        if query.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(query);
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: &Url) -> http::request::Builder {
        let mut builder = Request::builder().method(method).uri(url.as_str());
        if let Some(auth) = &self.auth {
            builder = builder.header(AUTHORIZATION, auth.clone());
        }
        builder
    }

    async fn send(&self, req: Request<Full<Bytes>>) -> Result<Response<Incoming>, Error> {
        trace!(method = %req.method(), uri = %req.uri(), "sending request");
        Ok(self.client.request(req).await?)
    }
}

#[derive(Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Deserialize)]
struct Pod {
    metadata: ObjectMeta,
    #[serde(default)]
    status: PodStatus,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectMeta {
    name: String,
    #[serde(default)]
    namespace: String,
    deletion_timestamp: Option<String>,
}

#[derive(Deserialize, Default)]
struct PodStatus {
    #[serde(default)]
    phase: String,
}

#[derive(Deserialize)]
struct Status {
    #[serde(default)]
    message: String,
}

impl Pod {
    fn can_forward(&self) -> bool {
        self.metadata.deletion_timestamp.is_none()
            && !matches!(self.status.phase.as_str(), "Succeeded" | "Failed")
    }
}

// The API server reports failures as a Status object; fall back to the raw body.
async fn status_error(resp: Response<Incoming>) -> Error {
    let code = resp.status();
    let body = match resp.into_body().collect().await {
        Ok(b) => b.to_bytes(),
        Err(e) => return Error::Hyper(e),
    };
    let message = match serde_json::from_slice::<Status>(&body) {
        Ok(s) if !s.message.is_empty() => s.message,
        _ => String::from_utf8_lossy(&body).trim().to_string(),
    };
    Error::Status(code, message)
}

#[async_trait::async_trait]
impl Cluster for Client {
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<PodIdentity>, Error> {
        let url = self.url(
            &format!("/api/v1/namespaces/{namespace}/pods"),
            &[("labelSelector", selector)],
        )?;
        let req = self
            .request(Method::GET, &url)
            .header(http::header::ACCEPT, "application/json")
            .body(Full::default())?;
        let resp = self.send(req).await?;
        if resp.status() != StatusCode::OK {
            return Err(status_error(resp).await);
        }
        let body = resp.into_body().collect().await?.to_bytes();
        let list: PodList = serde_json::from_slice(&body)?;
        let total = list.items.len();
        let pods: Vec<PodIdentity> = list
            .items
            .into_iter()
            .filter(Pod::can_forward)
            .map(|p| PodIdentity {
                namespace: if p.metadata.namespace.is_empty() {
                    namespace.to_string()
                } else {
                    p.metadata.namespace
                },
                name: p.metadata.name,
                phase: p.status.phase,
            })
            .collect();
        debug!(namespace, selector, total, usable = pods.len(), "listed pods");
        Ok(pods)
    }

    async fn portforward(&self, namespace: &str, pod: &str) -> Result<BoxedIo, Error> {
        let url = self.url(
            &format!("/api/v1/namespaces/{namespace}/pods/{pod}/portforward"),
            &[],
        )?;
        let req = self
            .request(Method::POST, &url)
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, SPDY_UPGRADE)
            .header(STREAM_PROTOCOL_HEADER, PORTFORWARD_PROTOCOL)
            .body(Full::default())?;
        let resp = self.send(req).await?;
        if resp.status() != StatusCode::SWITCHING_PROTOCOLS {
            return Err(status_error(resp).await);
        }
        if let Some(proto) = resp.headers().get(STREAM_PROTOCOL_HEADER) {
            if proto.as_bytes() != PORTFORWARD_PROTOCOL.as_bytes() {
                return Err(Error::UpgradeRejected(format!(
                    "unexpected stream protocol {}",
                    String::from_utf8_lossy(proto.as_bytes())
                )));
            }
        }
        let upgraded = hyper::upgrade::on(resp).await?;
        Ok(Box::new(TokioIo::new(upgraded)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matches::assert_matches;
    use test_case::test_case;

    async fn client(server: &str, auth: Auth) -> Client {
        let mut cfg = ConnectionConfig::insecure(Url::parse(server).unwrap());
        cfg.auth = auth;
        Client::new(cfg).await.unwrap()
    }

    #[test_case("http://h:80", "/api/v1/x", &[], "http://h/api/v1/x"; "root")]
    #[test_case("http://h:80/prefix/", "/api/v1/x", &[], "http://h/prefix/api/v1/x"; "prefix")]
    #[test_case("http://h:8080", "/p", &[("labelSelector", "app=x,tier in (a,b)")],
        "http://h:8080/p?labelSelector=app%3Dx%2Ctier+in+%28a%2Cb%29"; "encoded query")]
    #[tokio::test]
    async fn urls(server: &str, path: &str, query: &[(&str, &str)], want: &str) {
        let c = client(server, Auth::None).await;
        assert_eq!(c.url(path, query).unwrap().as_str(), want);
    }

    #[test]
    fn authorization() {
        assert!(auth_header(&Auth::None).unwrap().is_none());
        let bearer = auth_header(&Auth::Bearer("t".to_string())).unwrap().unwrap();
        assert_eq!(bearer, "Bearer t");
        assert!(bearer.is_sensitive());
        let basic = auth_header(&Auth::Basic {
            username: "a".to_string(),
            password: "b".to_string(),
        })
        .unwrap()
        .unwrap();
        assert_eq!(basic, "Basic YTpi");
        assert_matches!(
            auth_header(&Auth::Bearer("bad\ntoken".to_string())),
            Err(Error::InvalidConfig(_))
        );
    }

    #[test]
    fn skips_pods_that_cannot_forward() {
        let list: PodList = serde_json::from_str(
            r#"{"items":[
                {"metadata":{"name":"a","namespace":"ns"},"status":{"phase":"Running"}},
                {"metadata":{"name":"b","namespace":"ns"},"status":{"phase":"Succeeded"}},
                {"metadata":{"name":"c","namespace":"ns","deletionTimestamp":"2024-01-01T00:00:00Z"},"status":{"phase":"Running"}},
                {"metadata":{"name":"d"}}
            ]}"#,
        )
        .unwrap();
        let names: Vec<_> = list
            .items
            .iter()
            .filter(|p| p.can_forward())
            .map(|p| p.metadata.name.as_str())
            .collect();
        assert_eq!(names, vec!["a", "d"]);
    }
}
