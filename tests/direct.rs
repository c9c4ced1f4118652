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

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use kube_tunnel_proxy::app::{self, Bound};
use kube_tunnel_proxy::config;
use kube_tunnel_proxy::test_helpers::apiserver::{
    ApiServerConfig, Backend, FakeApiServer, FakePod, Kubelet,
};
use kube_tunnel_proxy::test_helpers::helpers::initialize_telemetry;
use kube_tunnel_proxy::test_helpers::tcp::{self, TestServer};
use kube_tunnel_proxy::test_helpers::telemetry::LogCapture;
use kube_tunnel_proxy::test_helpers::{assert_eventually, test_config};
use kube_tunnel_proxy::tunnel::{SessionState, Summary};

const WAIT: Duration = Duration::from_secs(10);

struct TestEnv {
    api: FakeApiServer,
    dir: tempfile::TempDir,
}

impl TestEnv {
    async fn new(kubelet: Kubelet) -> TestEnv {
        initialize_telemetry();
        let api = FakeApiServer::spawn(ApiServerConfig {
            pods: vec![
                FakePod::new("ns", "echo-7d9f", &[("app", "echo")]),
                FakePod::new("other", "db-0", &[("app", "db")]),
            ],
            kubelet,
            token: Some("s3cr3t".to_string()),
        })
        .await;
        TestEnv {
            api,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    async fn build(&self, tunnels: &str) -> Bound {
        let kubeconfig = self.api.write_kubeconfig(self.dir.path(), &["c1", "c2"]);
        let tunnel_config = self.dir.path().join("tunnels.toml");
        std::fs::write(&tunnel_config, tunnels).unwrap();
        app::build(config::Config {
            tunnel_config,
            kubeconfig: vec![kubeconfig],
            ..test_config()
        })
        .await
        .unwrap()
    }
}

async fn ready(bound: &Bound) -> Vec<SocketAddr> {
    let mut addrs = Vec::new();
    for watch in bound.sessions() {
        let got = timeout(WAIT, watch.clone().ready())
            .await
            .unwrap()
            .expect("session should forward");
        addrs.extend(got);
    }
    addrs
}

async fn shutdown(bound: Bound) -> Summary {
    let trigger = bound.shutdown.trigger();
    let wait = tokio::spawn(bound.wait_termination());
    trigger.shutdown_now().await;
    timeout(WAIT, wait).await.unwrap().unwrap().unwrap()
}

const ECHO_TUNNEL: &str = r#"
[[context]]
name = "c1"
  [[context.tunnel]]
  namespace = "ns"
  selector = "app=echo"
  pod_port = 9090
  local_port = 0
"#;

#[tokio::test]
async fn round_trip_through_pod() {
    let echo = TestServer::echo().await;
    let env = TestEnv::new(Kubelet::default().with_backend(9090, Backend::Tcp(echo.address()))).await;
    let bound = env.build(ECHO_TUNNEL).await;
    let addrs = ready(&bound).await;
    assert_eq!(addrs.len(), 1);
    assert!(bound.ready().is_ready());

    let mut stream = TcpStream::connect(addrs[0]).await.unwrap();
    stream.write_all(b"PING").await.unwrap();
    let mut buf = [0u8; 4];
    timeout(WAIT, stream.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"PING");

    let got = tcp::run_latency(&mut stream, 100).await.unwrap();
    assert_eq!(got.len(), 100);
    tcp::run_throughput(&mut stream, 4 * 1024 * 1024).await.unwrap();

    assert_eq!(env.api.upgrades(), 1);
    let summary = shutdown(bound).await;
    assert_eq!(summary.stopped, 1);
}

#[tokio::test]
async fn no_pods_exits_cleanly() {
    let env = TestEnv::new(Kubelet::default()).await;
    let capture = LogCapture::default();
    let _guard = tracing::dispatcher::set_default(&capture.dispatch());
    let bound = env
        .build(
            r#"
[[context]]
name = "c1"
  [[context.tunnel]]
  namespace = "ns"
  selector = "app=missing"
  pod_port = 9090
"#,
        )
        .await;
    let summary = timeout(WAIT, bound.wait_termination()).await.unwrap().unwrap();
    assert_eq!(
        summary,
        Summary {
            started: 1,
            no_match: 1,
            ..Default::default()
        }
    );
    assert!(capture.contains("Setting up 1 tunnels."));
    assert!(capture.contains("No pods found: app=missing"));
    assert_eq!(env.api.upgrades(), 0);
}

#[tokio::test]
async fn shutdown_closes_listeners() {
    let env = TestEnv::new(Kubelet::default()).await;
    let bound = env.build(ECHO_TUNNEL).await;
    let addrs = ready(&bound).await;
    let watch = bound.sessions()[0].clone();

    let mut open = TcpStream::connect(addrs[0]).await.unwrap();
    open.write_all(b"hi").await.unwrap();
    let mut buf = [0u8; 2];
    open.read_exact(&mut buf).await.unwrap();

    let summary = shutdown(bound).await;
    assert_eq!(summary.stopped, 1);
    assert_eq!(watch.state(), SessionState::Terminal);
    // The open connection is torn down with its session.
    let mut rest = Vec::new();
    let read = timeout(WAIT, open.read_to_end(&mut rest)).await.unwrap();
    assert!(read.is_err() || rest.is_empty());
    assert!(TcpStream::connect(addrs[0]).await.is_err());
}

#[tokio::test]
async fn bind_conflict_fails_only_that_tunnel() {
    let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = taken.local_addr().unwrap().port();
    let env = TestEnv::new(Kubelet::default()).await;
    let bound = env
        .build(&format!(
            r#"
[[context]]
name = "c1"
  [[context.tunnel]]
  namespace = "ns"
  selector = "app=echo"
  pod_port = 9090
  local_port = {port}

  [[context.tunnel]]
  namespace = "other"
  selector = "app=db"
  pod_port = 5432
  local_port = 0
"#
        ))
        .await;
    let mut first = bound.sessions()[0].clone();
    let mut second = bound.sessions()[1].clone();
    assert_eq!(timeout(WAIT, first.ready()).await.unwrap(), None);
    let addrs = timeout(WAIT, second.ready()).await.unwrap().unwrap();

    let mut stream = TcpStream::connect(addrs[0]).await.unwrap();
    assert_eq!(tcp::run_latency(&mut stream, 10).await.unwrap().len(), 10);

    let summary = shutdown(bound).await;
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.stopped, 1);
}

#[tokio::test]
async fn tunnels_to_same_pod_are_independent() {
    let env = TestEnv::new(Kubelet::default()).await;
    let bound = env
        .build(
            r#"
[[context]]
name = "c1"
  [[context.tunnel]]
  namespace = "ns"
  selector = "app=echo"
  pod_port = 9090
  local_port = 0

[[context]]
name = "c2"
  [[context.tunnel]]
  namespace = "ns"
  selector = "app=echo"
  pod_port = 9090
  local_port = 0
"#,
        )
        .await;
    let addrs = ready(&bound).await;
    assert_eq!(addrs.len(), 2);
    assert_ne!(addrs[0], addrs[1]);
    assert_eq!(env.api.upgrades(), 2);

    for addr in &addrs {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        assert_eq!(tcp::run_latency(&mut stream, 64).await.unwrap().len(), 64);
    }

    // End the first channel; whichever tunnel owned it stops, the other keeps going.
    let [mut a, mut b]: [_; 2] = bound.sessions().to_vec().try_into().unwrap();
    env.api.drop_upgrade(0);
    let (ended, alive) = timeout(WAIT, async {
        tokio::select! {
            _ = a.terminated() => (0, 1),
            _ = b.terminated() => (1, 0),
        }
    })
    .await
    .unwrap();
    assert!(matches!(
        bound.sessions()[alive].state(),
        SessionState::Forwarding(_)
    ));
    let mut stream = TcpStream::connect(addrs[alive]).await.unwrap();
    assert_eq!(tcp::run_latency(&mut stream, 64).await.unwrap().len(), 64);
    assert_eventually(
        Duration::from_secs(2),
        || async { TcpStream::connect(addrs[ended]).await.is_err() },
        true,
    )
    .await;

    let summary = shutdown(bound).await;
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.stopped, 1);
}

#[tokio::test]
async fn closing_one_connection_keeps_others() {
    let echo = TestServer::echo().await;
    let env = TestEnv::new(Kubelet::default().with_backend(9090, Backend::Tcp(echo.address()))).await;
    let bound = env.build(ECHO_TUNNEL).await;
    let addrs = ready(&bound).await;

    let mut a = TcpStream::connect(addrs[0]).await.unwrap();
    let mut b = TcpStream::connect(addrs[0]).await.unwrap();
    tcp::run_latency(&mut a, 10).await.unwrap();
    tcp::run_latency(&mut b, 10).await.unwrap();
    drop(a);

    tcp::run_latency(&mut b, 10).await.unwrap();
    let mut c = TcpStream::connect(addrs[0]).await.unwrap();
    tcp::run_latency(&mut c, 10).await.unwrap();

    let summary = shutdown(bound).await;
    assert_eq!(summary.stopped, 1);
}

#[tokio::test]
async fn remote_error_closes_connection_only() {
    let env = TestEnv::new(
        Kubelet::default().with_backend(
            9090,
            Backend::Refuse("error forwarding port 9090 to pod: connection refused".to_string()),
        ),
    )
    .await;
    let bound = env.build(ECHO_TUNNEL).await;
    let addrs = ready(&bound).await;

    for _ in 0..2 {
        let mut stream = TcpStream::connect(addrs[0]).await.unwrap();
        let mut rest = Vec::new();
        let _ = timeout(WAIT, stream.read_to_end(&mut rest)).await.unwrap();
        assert!(rest.is_empty());
    }
    assert!(matches!(
        bound.sessions()[0].state(),
        SessionState::Forwarding(_)
    ));
    let summary = shutdown(bound).await;
    assert_eq!(summary.stopped, 1);
}

#[tokio::test]
async fn lost_connection_fails_session() {
    let env = TestEnv::new(Kubelet::default()).await;
    let bound = env.build(ECHO_TUNNEL).await;
    let addrs = ready(&bound).await;
    env.api.drop_connections();

    let summary = timeout(WAIT, bound.wait_termination()).await.unwrap().unwrap();
    assert_eq!(summary.failed, 1);
    assert_eventually(
        Duration::from_secs(2),
        || async { TcpStream::connect(addrs[0]).await.is_err() },
        true,
    )
    .await;
}

#[tokio::test]
async fn unknown_context_is_an_auth_failure() {
    let env = TestEnv::new(Kubelet::default()).await;
    let bound = env
        .build(
            r#"
[[context]]
name = "missing"
  [[context.tunnel]]
  namespace = "ns"
  selector = "app=echo"
  pod_port = 9090
  local_port = 0

[[context]]
name = "c1"
  [[context.tunnel]]
  namespace = "ns"
  selector = "app=echo"
  pod_port = 9090
  local_port = 0
"#,
        )
        .await;
    assert_eq!(bound.sessions().len(), 1);
    assert_eq!(bound.sessions()[0].context(), "c1");
    ready(&bound).await;
    let summary = shutdown(bound).await;
    assert_eq!(
        summary,
        Summary {
            started: 1,
            stopped: 1,
            auth_failures: 1,
            ..Default::default()
        }
    );
}

#[tokio::test]
async fn several_ports_share_one_upgrade() {
    let echo = TestServer::echo().await;
    let env = TestEnv::new(Kubelet::default().with_backend(9091, Backend::Tcp(echo.address()))).await;
    let bound = env
        .build(
            r#"
[[context]]
name = "c1"
  [[context.tunnel]]
  namespace = "ns"
  selector = "app=echo"
  ports = ["0:9090", "0:9091"]
"#,
        )
        .await;
    let addrs = ready(&bound).await;
    assert_eq!(addrs.len(), 2);
    assert_eq!(env.api.upgrades(), 1);
    for addr in &addrs {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        tcp::run_latency(&mut stream, 32).await.unwrap();
    }
    shutdown(bound).await;
}
