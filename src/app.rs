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

use std::sync::Arc;

use anyhow::Context;
use tokio::time;
use tracing::{error, info, warn};

use crate::drain::{DrainMode, DrainTrigger};
use crate::kube::{ConnectionResolver, KubeconfigResolver};
use crate::tunnel::{Orchestrator, Running, SessionConfig, SessionWatch, Summary};
use crate::{config, drain, readiness, signal};

/// Loads the tunnel file and starts every declared tunnel against the
/// kubeconfig contexts they name.
pub async fn build(config: config::Config) -> anyhow::Result<Bound> {
    let resolver = Arc::new(KubeconfigResolver::new(config.kubeconfig.clone()));
    build_with_resolver(config, resolver).await
}

pub async fn build_with_resolver(
    config: config::Config,
    resolver: Arc<dyn ConnectionResolver>,
) -> anyhow::Result<Bound> {
    let groups = config::load_tunnels(&config.tunnel_config)
        .await
        .with_context(|| format!("loading tunnels from {}", config.tunnel_config.display()))?;

    let shutdown = signal::Shutdown::new();
    // Setup a drain channel. drain_tx is used to trigger a drain, which will complete
    // once every session dropped its watcher.
    let (drain_tx, drain_rx) = drain::new();

    let ready = readiness::Ready::new();
    let orchestrator = Orchestrator::new(resolver, SessionConfig::from(&config), ready.clone());
    let running = orchestrator.start(groups, drain_rx).await;

    Ok(Bound {
        shutdown,
        ready,
        config,
        drain_tx,
        running,
    })
}

/// The started tunnels. Dropping it aborts every session.
pub struct Bound {
    pub shutdown: signal::Shutdown,
    ready: readiness::Ready,

    config: config::Config,
    drain_tx: DrainTrigger,
    running: Running,
}

impl Bound {
    /// Watches over every started session, in declaration order.
    pub fn sessions(&self) -> &[SessionWatch] {
        self.running.sessions()
    }

    pub fn ready(&self) -> &readiness::Ready {
        &self.ready
    }

    /// Runs until every session ended on its own or a shutdown was requested,
    /// then drains the remaining sessions.
    pub async fn wait_termination(self) -> anyhow::Result<Summary> {
        let Bound {
            shutdown,
            config,
            drain_tx,
            mut running,
            ..
        } = self;
        tokio::select! {
            summary = running.wait() => {
                info!("all tunnels have stopped");
                return Ok(summary);
            }
            _ = shutdown.wait() => {}
        }

        // Start a drain; this will wait for every session to release its watcher.
        // If they take too long, terminate anyways.
        let deadline = time::Instant::now() + config.termination_grace_period;
        match time::timeout_at(deadline, drain_tx.start_drain_and_wait(DrainMode::Graceful)).await
        {
            Ok(()) => info!("Shutdown completed gracefully"),
            Err(_) => warn!(
                "Graceful shutdown did not complete in {:?}, terminating now",
                config.termination_grace_period
            ),
        }
        match time::timeout_at(deadline, running.wait()).await {
            Ok(summary) => Ok(summary),
            Err(_) => {
                error!("sessions were abandoned during shutdown");
                Ok(running.abandon())
            }
        }
    }
}
