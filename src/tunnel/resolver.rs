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

use tracing::debug;

use super::{Error, TargetIdentity};
use crate::kube::Cluster;

/// Picks the pod a tunnel forwards to. `None` means nothing matched the selector,
/// which ends the session without an error. When several pods match the first one
/// the API server returned wins.
pub async fn resolve(
    cluster: &dyn Cluster,
    namespace: &str,
    selector: &str,
) -> Result<Option<TargetIdentity>, Error> {
    let pods = cluster
        .list_pods(namespace, selector)
        .await
        .map_err(Error::Resolve)?;
    let candidates = pods.len();
    let target = pods.into_iter().next().map(|p| TargetIdentity {
        namespace: p.namespace,
        name: p.name,
    });
    if let Some(t) = &target {
        debug!(target = %t, candidates, "resolved pod");
    }
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::apiserver::StaticCluster;
    use matches::assert_matches;

    #[tokio::test]
    async fn first_pod_wins() {
        let cluster = StaticCluster::with_pods("ns", &["x-abc123", "x-def456"]);
        let target = resolve(&cluster, "ns", "app=x").await.unwrap();
        assert_eq!(
            target,
            Some(TargetIdentity {
                namespace: "ns".to_string(),
                name: "x-abc123".to_string(),
            })
        );
        assert_eq!(cluster.queries(), vec![("ns".to_string(), "app=x".to_string())]);
    }

    #[tokio::test]
    async fn no_match() {
        let cluster = StaticCluster::with_pods("ns", &[]);
        assert_eq!(resolve(&cluster, "ns", "app=x").await.unwrap(), None);
    }

    #[tokio::test]
    async fn query_failure() {
        let cluster = StaticCluster::failing();
        assert_matches!(
            resolve(&cluster, "ns", "app=x").await,
            Err(Error::Resolve(_))
        );
    }
}
