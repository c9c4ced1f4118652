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

use tracing::debug;

use super::portforward::Channel;
use super::{Error, TargetIdentity};
use crate::kube::Cluster;
use crate::spdy;

#[derive(Clone, Copy, Debug)]
pub struct UpgradeConfig {
    pub stream_creation_timeout: Duration,
    pub ping_interval: Option<Duration>,
}

/// Upgrades a port-forward request for `target` and starts multiplexing over it.
pub async fn upgrade(
    cluster: &dyn Cluster,
    target: &TargetIdentity,
    cfg: UpgradeConfig,
) -> Result<Channel, Error> {
    let io = cluster
        .portforward(&target.namespace, &target.name)
        .await
        .map_err(Error::Upgrade)?;
    let (conn, incoming) = spdy::Connection::new(io, spdy::Role::Client);
    // Port-forwarding never has the server open streams; dropping this refuses them.
    drop(incoming);
    if let Some(interval) = cfg.ping_interval {
        conn.spawn_keepalive(interval);
    }
    debug!(%target, "upgraded port-forward connection");
    Ok(Channel::new(conn, target.clone(), cfg.stream_creation_timeout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::apiserver::StaticCluster;
    use matches::assert_matches;

    fn cfg() -> UpgradeConfig {
        UpgradeConfig {
            stream_creation_timeout: Duration::from_secs(5),
            ping_interval: Some(Duration::from_secs(30)),
        }
    }

    fn target(name: &str) -> TargetIdentity {
        TargetIdentity {
            namespace: "ns".to_string(),
            name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn upgrade_and_ping() {
        let cluster = StaticCluster::with_pods("ns", &["x-abc123"]);
        let channel = upgrade(&cluster, &target("x-abc123"), cfg()).await.unwrap();
        assert_eq!(channel.target(), &target("x-abc123"));
        channel.ping().await.unwrap();
        assert_eq!(cluster.upgrades(), 1);
    }

    #[tokio::test]
    async fn unknown_pod_rejected() {
        let cluster = StaticCluster::with_pods("ns", &["x-abc123"]);
        let res = upgrade(&cluster, &target("gone"), cfg()).await;
        assert_matches!(
            res,
            Err(Error::Upgrade(crate::kube::Error::Status(code, _))) if code == hyper::StatusCode::NOT_FOUND
        );
    }
}
