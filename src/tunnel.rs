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

//! The tunnel engine: resolving a pod for each declared tunnel, upgrading a
//! port-forward channel to it and bridging local connections onto that channel.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use crate::{kube, spdy};

pub mod bridge;
pub mod orchestrator;
pub mod portforward;
pub mod resolver;
pub mod session;
pub mod upgrade;

pub use bridge::LocalBridge;
pub use orchestrator::{Orchestrator, Running, Summary};
pub use portforward::{Channel, StreamPair};
pub use session::{Outcome, Session, SessionConfig, SessionState, SessionWatch};

/// The pod backing a tunnel, resolved once when its session starts.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TargetIdentity {
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for TargetIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to resolve context {0:?}: {1}")]
    Auth(String, #[source] kube::Error),
    #[error("failed to list pods: {0}")]
    Resolve(#[source] kube::Error),
    #[error("upgrade failed: {0}")]
    Upgrade(#[source] kube::Error),
    #[error("upgrade did not complete within {0:?}")]
    UpgradeTimeout(Duration),
    #[error("failed to open streams for port {port}: {source}")]
    Multiplex {
        port: u16,
        #[source]
        source: spdy::Error,
    },
    #[error("failed to bind {0}: {1}")]
    Bind(SocketAddr, #[source] io::Error),
    #[error("channel closed")]
    ChannelClosed,
    #[error("remote error on port {0}: {1}")]
    Remote(u16, String),
    #[error("forwarding failed: {0}")]
    Forward(#[from] io::Error),
}
