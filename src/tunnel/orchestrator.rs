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

use tokio::task::JoinSet;
use tracing::{Instrument, error, info, info_span, warn};

use super::session::{Outcome, Session, SessionConfig, SessionWatch};
use super::Error;
use crate::config::ContextGroup;
use crate::drain::DrainWatcher;
use crate::kube::{Cluster, ConnectionResolver};
use crate::readiness::Ready;

/// Counts of how every declared tunnel ended.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    /// Sessions that were spawned.
    pub started: usize,
    pub no_match: usize,
    pub failed: usize,
    pub stopped: usize,
    /// Contexts whose connection could not be resolved. None of their tunnels started.
    pub auth_failures: usize,
}

impl Summary {
    fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::NoMatch => self.no_match += 1,
            Outcome::Stopped => self.stopped += 1,
            Outcome::Failed(_) => self.failed += 1,
        }
    }
}

/// Orchestrator starts one session per declared tunnel.
pub struct Orchestrator {
    resolver: Arc<dyn ConnectionResolver>,
    cfg: SessionConfig,
    ready: Ready,
}

/// The sessions started by [`Orchestrator::start`].
pub struct Running {
    sessions: JoinSet<Outcome>,
    watches: Vec<SessionWatch>,
    summary: Summary,
}

impl Orchestrator {
    pub fn new(resolver: Arc<dyn ConnectionResolver>, cfg: SessionConfig, ready: Ready) -> Self {
        Orchestrator {
            resolver,
            cfg,
            ready,
        }
    }

    /// Resolves every context, then spawns a session for every tunnel of the
    /// contexts that resolved. Each session observes `stop`.
    pub async fn start(&self, groups: Vec<ContextGroup>, stop: DrainWatcher) -> Running {
        let mut summary = Summary::default();
        let mut resolved: Vec<(ContextGroup, Arc<dyn Cluster>)> = Vec::with_capacity(groups.len());
        for group in groups {
            let span = info_span!("context", context = %group.name);
            match self.resolver.resolve(&group.name).instrument(span.clone()).await {
                Ok(cluster) => resolved.push((group, cluster)),
                Err(e) => {
                    summary.auth_failures += 1;
                    let e = Error::Auth(group.name.clone(), e);
                    span.in_scope(|| {
                        error!("{e}");
                        for t in &group.tunnels {
                            warn!("Skipping tunnel {}/{}: context unavailable", t.namespace, t.selector);
                        }
                    });
                }
            }
        }

        let mut sessions = JoinSet::new();
        let mut watches = Vec::new();
        for (group, cluster) in resolved {
            info!(context = %group.name, "Setting up {} tunnels.", group.tunnels.len());
            for spec in group.tunnels {
                // Numbered across all groups, context names alone need not be unique.
                let block = self.ready.register_task(&format!(
                    "{}/{}:{}",
                    group.name, summary.started, spec.selector
                ));
                let session = Session::new(&group.name, spec, cluster.clone(), self.cfg);
                watches.push(session.watch());
                summary.started += 1;
                sessions.spawn(session.run(stop.clone(), block).in_current_span());
            }
        }
        Running {
            sessions,
            watches,
            summary,
        }
    }
}

impl Running {
    pub fn sessions(&self) -> &[SessionWatch] {
        &self.watches
    }

    /// Waits for every session to reach its terminal state. Cancel safe: outcomes
    /// collected so far are kept.
    pub async fn wait(&mut self) -> Summary {
        while let Some(res) = self.sessions.join_next().await {
            match res {
                Ok(outcome) => self.summary.record(&outcome),
                Err(e) => {
                    error!("session task failed: {e}");
                    self.summary.failed += 1;
                }
            }
        }
        self.summary
    }

    /// Aborts the sessions that are still running and counts them as failed.
    pub fn abandon(mut self) -> Summary {
        let left = self.sessions.len();
        self.sessions.abort_all();
        self.summary.failed += left;
        self.summary
    }
}
