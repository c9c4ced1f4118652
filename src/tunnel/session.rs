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

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{Instrument, Span, debug, error, field, info, info_span, warn};

use super::bridge::LocalBridge;
use super::portforward::Channel;
use super::upgrade::{self, UpgradeConfig};
use super::{Error, TargetIdentity, resolver};
use crate::config::{self, TunnelSpec};
use crate::drain::{self, DrainMode, DrainWatcher};
use crate::kube::Cluster;
use crate::readiness::BlockReady;

// How long the kubelet gets to report a failure on the port check.
const PORT_CHECK_GRACE: Duration = Duration::from_millis(250);

/// The per-session subset of the process configuration.
#[derive(Clone, Copy, Debug)]
pub struct SessionConfig {
    pub local_address: IpAddr,
    pub upgrade_timeout: Duration,
    pub stream_creation_timeout: Duration,
    pub ping_interval: Option<Duration>,
}

impl From<&config::Config> for SessionConfig {
    fn from(cfg: &config::Config) -> Self {
        SessionConfig {
            local_address: cfg.local_address,
            upgrade_timeout: cfg.upgrade_timeout,
            stream_creation_timeout: cfg.stream_creation_timeout,
            ping_interval: cfg.ping_interval,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Resolving,
    Upgrading,
    Multiplexing,
    /// Every stream pair is open; the listeners are bound to these addresses.
    Forwarding(Vec<SocketAddr>),
    Stopping,
    Terminal,
}

/// How a session ended.
#[derive(Debug)]
pub enum Outcome {
    /// Nothing matched the selector; no channel was opened.
    NoMatch,
    /// Stopped by the operator.
    Stopped,
    Failed(Error),
}

/// SessionWatch observes a session's progress from outside.
#[derive(Clone, Debug)]
pub struct SessionWatch {
    context: String,
    spec: TunnelSpec,
    rx: watch::Receiver<SessionState>,
}

impl SessionWatch {
    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn spec(&self) -> &TunnelSpec {
        &self.spec
    }

    pub fn state(&self) -> SessionState {
        self.rx.borrow().clone()
    }

    /// Waits until the session forwards, returning its listener addresses, or
    /// `None` if it ended without ever forwarding.
    pub async fn ready(&mut self) -> Option<Vec<SocketAddr>> {
        let state = self
            .rx
            .wait_for(|s| matches!(s, SessionState::Forwarding(_) | SessionState::Terminal))
            .await
            .map(|s| s.clone())
            .unwrap_or(SessionState::Terminal);
        match state {
            SessionState::Forwarding(addrs) => Some(addrs),
            _ => None,
        }
    }

    pub async fn terminated(&mut self) {
        let _ = self.rx.wait_for(|s| *s == SessionState::Terminal).await;
    }
}

/// Session is one tunnel from resolution to teardown. It exclusively owns its
/// channel and listeners.
pub struct Session {
    context: String,
    spec: TunnelSpec,
    cluster: Arc<dyn Cluster>,
    cfg: SessionConfig,
    state: watch::Sender<SessionState>,
}

// Why a running session left the Forwarding state.
enum StopReason {
    Signal(drain::DrainBlocker),
    ChannelClosed,
}

impl Session {
    pub fn new(
        context: &str,
        spec: TunnelSpec,
        cluster: Arc<dyn Cluster>,
        cfg: SessionConfig,
    ) -> Session {
        let (state, _) = watch::channel(SessionState::Starting);
        Session {
            context: context.to_string(),
            spec,
            cluster,
            cfg,
            state,
        }
    }

    pub fn watch(&self) -> SessionWatch {
        SessionWatch {
            context: self.context.clone(),
            spec: self.spec.clone(),
            rx: self.state.subscribe(),
        }
    }

    fn set_state(&self, state: SessionState) {
        debug!(?state, "session state");
        self.state.send_replace(state);
    }

    /// Runs the session to completion. `stop` is observed at every blocking point;
    /// `ready` is released once forwarding starts or the session ends.
    pub async fn run(self, stop: DrainWatcher, ready: BlockReady) -> Outcome {
        let outcome = self.run_inner(stop, ready).await;
        self.set_state(SessionState::Terminal);
        outcome
    }

    async fn run_inner(&self, stop: DrainWatcher, ready: BlockReady) -> Outcome {
        let selector = self.spec.selector.as_str();
        let span = info_span!("tunnel", context = %self.context, tag = %selector);

        self.set_state(SessionState::Resolving);
        let setup = async {
            let Some(target) =
                resolver::resolve(self.cluster.as_ref(), &self.spec.namespace, selector).await?
            else {
                return Ok(None);
            };
            self.set_state(SessionState::Upgrading);
            let channel = upgrade::upgrade(
                self.cluster.as_ref(),
                &target,
                UpgradeConfig {
                    stream_creation_timeout: self.cfg.stream_creation_timeout,
                    ping_interval: self.cfg.ping_interval,
                },
            )
            .await?;
            Ok::<_, Error>(Some(channel))
        };
        let setup = async {
            tokio::select! {
                res = tokio::time::timeout(self.cfg.upgrade_timeout, setup) => {
                    res.unwrap_or(Err(Error::UpgradeTimeout(self.cfg.upgrade_timeout))).map(Some)
                }
                _ = stop.clone().wait_for_drain() => Ok(None),
            }
        }
        .instrument(span.clone());
        let channel = match setup.await {
            Ok(Some(Some(channel))) => channel,
            Ok(Some(None)) => {
                span.in_scope(|| info!("No pods found: {selector}"));
                return Outcome::NoMatch;
            }
            Ok(None) => return Outcome::Stopped,
            Err(e) => {
                span.in_scope(|| error!("failed to start tunnel: {e}"));
                return Outcome::Failed(e);
            }
        };

        // The tag is filled in once the listeners are bound.
        let span = info_span!("tunnel", context = %self.context, tag = field::Empty);
        self.forward(Arc::new(channel), stop, ready)
            .instrument(span)
            .await
    }

    async fn forward(&self, channel: Arc<Channel>, stop: DrainWatcher, ready: BlockReady) -> Outcome {
        let target = channel.target().clone();
        self.set_state(SessionState::Multiplexing);
        let opened = tokio::select! {
            res = self.open_bridges(&channel) => res,
            _ = stop.clone().wait_for_drain() => return Outcome::Stopped,
            _ = channel.closed() => Err(Error::ChannelClosed),
        };
        let bridges = match opened {
            Ok(b) => b,
            Err(e) => {
                error!("failed to start tunnel to {target}: {e}");
                return Outcome::Failed(e);
            }
        };
        if let Some(first) = bridges.first() {
            let tag = format!("{}:{}", target.name, first.address().port());
            Span::current().record("tag", field::display(tag));
        }

        let (bridge_trigger, bridge_stop) = drain::new();
        let mut tasks = JoinSet::new();
        let mut addresses = Vec::with_capacity(bridges.len());
        for bridge in bridges {
            info!(
                "Forwarding {} to pod {}:{}",
                bridge.address(),
                target.name,
                bridge.remote_port()
            );
            addresses.push(bridge.address());
            tasks.spawn(
                bridge
                    .serve(channel.clone(), bridge_stop.clone())
                    .in_current_span(),
            );
        }
        drop(bridge_stop);
        drop(ready);
        self.set_state(SessionState::Forwarding(addresses));

        let reason = tokio::select! {
            release = stop.clone().wait_for_drain() => StopReason::Signal(release),
            _ = channel.closed() => StopReason::ChannelClosed,
        };
        self.set_state(SessionState::Stopping);
        let mode = match &reason {
            StopReason::Signal(release) => release.mode(),
            StopReason::ChannelClosed => DrainMode::Immediate,
        };
        bridge_trigger.start_drain_and_wait(mode).await;
        while tasks.join_next().await.is_some() {}
        channel.close();
        for p in &self.spec.ports {
            info!("Stopped forwarding {}:{}", target.name, p.remote);
        }
        drop(stop);
        match reason {
            StopReason::Signal(_) => Outcome::Stopped,
            StopReason::ChannelClosed => {
                warn!("connection to {target} lost");
                Outcome::Failed(Error::ChannelClosed)
            }
        }
    }

    // Binds every listener, then checks each remote port with a stream pair that
    // is closed right away. Failing to bind or to open a pair fails the whole
    // session; a refusal from the pod only fails the connections that follow.
    async fn open_bridges(&self, channel: &Channel) -> Result<Vec<LocalBridge>, Error> {
        let mut bridges = Vec::with_capacity(self.spec.ports.len());
        for ports in &self.spec.ports {
            bridges.push(LocalBridge::bind(self.cfg.local_address, *ports).await?);
        }
        for bridge in &bridges {
            let port = bridge.remote_port();
            if let Some(msg) = channel.check_port(port, PORT_CHECK_GRACE).await? {
                warn!("pod port {port} refused the check: {msg}");
            }
        }
        Ok(bridges)
    }
}
