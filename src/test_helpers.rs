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

use std::fmt::Debug;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::ops::Add;
use std::time::{Duration, SystemTime};

use tracing::trace;

use crate::config::{self, ContextGroup, TunnelSpec};
use crate::tunnel::SessionConfig;

pub mod apiserver;
pub mod helpers;
pub mod tcp;
pub mod telemetry;

/// A configuration suitable for tests: loopback listeners and short timeouts.
pub fn test_config() -> config::Config {
    config::Config {
        local_address: Ipv4Addr::LOCALHOST.into(),
        upgrade_timeout: Duration::from_secs(5),
        stream_creation_timeout: Duration::from_secs(5),
        ping_interval: None,
        termination_grace_period: Duration::from_secs(2),
        ..config::parse_config().unwrap()
    }
}

pub fn test_session_config() -> SessionConfig {
    SessionConfig::from(&test_config())
}

pub fn context_group(name: &str, tunnels: Vec<TunnelSpec>) -> ContextGroup {
    ContextGroup {
        name: name.to_string(),
        tunnels,
    }
}

pub fn localhost(port: u16) -> SocketAddr {
    SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port)
}

pub async fn assert_eventually<F, T, Fut>(dur: Duration, f: F, expected: T)
where
    F: Fn() -> Fut,
    Fut: Future<Output = T>,
    T: Eq + Debug,
{
    let mut delay = Duration::from_millis(10);
    let end = SystemTime::now().add(dur);
    let mut last: T;
    let mut attempts = 0;
    loop {
        attempts += 1;
        last = f().await;
        if last == expected {
            return;
        }
        trace!("attempt {attempts} with delay {delay:?}");
        if SystemTime::now().add(delay) > end {
            panic!("assert_eventually failed after {attempts}: last response: {last:?}")
        }
        tokio::time::sleep(delay).await;
        delay *= 2;
    }
}
