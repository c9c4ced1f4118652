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

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

const TUNNEL_CONFIG: &str = "TUNNEL_CONFIG";
const KUBECONFIG: &str = "KUBECONFIG";
const LOCAL_ADDRESS: &str = "LOCAL_ADDRESS";
const UPGRADE_TIMEOUT: &str = "UPGRADE_TIMEOUT";
const STREAM_CREATION_TIMEOUT: &str = "STREAM_CREATION_TIMEOUT";
const PING_INTERVAL: &str = "PING_INTERVAL";
const TERMINATION_GRACE_PERIOD: &str = "TERMINATION_GRACE_PERIOD";
const WORKER_THREADS: &str = "WORKER_THREADS";

const DEFAULT_TUNNEL_CONFIG: &str = "kube-tunnel-proxy.toml";
const DEFAULT_WORKER_THREADS: usize = 2;
const DEFAULT_UPGRADE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_STREAM_CREATION_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_DRAIN_DURATION: Duration = Duration::from_secs(5);

#[derive(serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Path of the declarative tunnel file.
    pub tunnel_config: PathBuf,
    /// Kubeconfig files, searched in order.
    pub kubeconfig: Vec<PathBuf>,
    /// Address local listeners bind to.
    pub local_address: IpAddr,

    /// Upper bound on resolving a target and upgrading the connection to it.
    pub upgrade_timeout: Duration,
    /// Upper bound on the peer replying to a newly opened stream.
    pub stream_creation_timeout: Duration,
    /// Keepalive ping period for upgraded connections. None disables keepalives.
    pub ping_interval: Option<Duration>,
    pub termination_grace_period: Duration,

    /// Specify the number of worker threads the Tokio Runtime will use.
    pub num_worker_threads: usize,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid env var {0}={1}")]
    EnvVar(String, String),
    #[error("failed to read tunnel config {0}: {1}")]
    Read(PathBuf, #[source] io::Error),
    #[error("invalid tunnel config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("context name must not be empty")]
    EmptyContext,
    #[error("context {0} is declared more than once")]
    DuplicateContext(String),
    #[error("invalid tunnel in context {context}: {reason}")]
    InvalidTunnel { context: String, reason: String },
    #[error("invalid port pair {0:?}, expected \"local:remote\" or \"port\"")]
    InvalidPortPair(String),
}

/// HumanDuration wraps a Duration to parse values like "10s" or "1m30s".
struct HumanDuration(Duration);

impl FromStr for HumanDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        duration_str::parse(s)
            .map(HumanDuration)
            .map_err(|e| e.to_string())
    }
}

fn parse<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, Error> {
    match env(key) {
        Some(val) => val
            .parse()
            .map(Some)
            .map_err(|_| Error::EnvVar(key.to_string(), val)),
        None => Ok(None),
    }
}

fn parse_default<T: FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, Error> {
    parse(env, key).map(|v| v.unwrap_or(default))
}

fn parse_duration(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration, Error> {
    parse::<HumanDuration>(env, key).map(|v| v.map(|d| d.0).unwrap_or(default))
}

pub fn parse_config() -> Result<Config, Error> {
    construct_config(|key| std::env::var(key).ok())
}

/// Builds the configuration from a variable lookup. `parse_config` uses the process
/// environment.
pub fn construct_config(env: impl Fn(&str) -> Option<String>) -> Result<Config, Error> {
    let kubeconfig = match empty_to_none(env(KUBECONFIG)) {
        Some(paths) => std::env::split_paths(&paths)
            .filter(|p| !p.as_os_str().is_empty())
            .collect(),
        None => dirs::home_dir()
            .map(|home| vec![home.join(".kube").join("config")])
            .unwrap_or_default(),
    };
    let ping_interval = parse_duration(&env, PING_INTERVAL, DEFAULT_PING_INTERVAL)?;
    Ok(Config {
        tunnel_config: parse_default(&env, TUNNEL_CONFIG, PathBuf::from(DEFAULT_TUNNEL_CONFIG))?,
        kubeconfig,
        local_address: parse_default(&env, LOCAL_ADDRESS, IpAddr::V4(Ipv4Addr::LOCALHOST))?,
        upgrade_timeout: parse_duration(&env, UPGRADE_TIMEOUT, DEFAULT_UPGRADE_TIMEOUT)?,
        stream_creation_timeout: parse_duration(
            &env,
            STREAM_CREATION_TIMEOUT,
            DEFAULT_STREAM_CREATION_TIMEOUT,
        )?,
        ping_interval: (!ping_interval.is_zero()).then_some(ping_interval),
        termination_grace_period: parse_duration(
            &env,
            TERMINATION_GRACE_PERIOD,
            DEFAULT_DRAIN_DURATION,
        )?,
        num_worker_threads: parse_default(&env, WORKER_THREADS, DEFAULT_WORKER_THREADS)?,
    })
}

pub fn empty_to_none<A: AsRef<str>>(inp: Option<A>) -> Option<A> {
    if let Some(inner) = &inp {
        if inner.as_ref().is_empty() {
            return None;
        }
    }
    inp
}

/// A local port forwarded to a port on the target.
#[derive(serde::Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PortPair {
    pub local: u16,
    pub remote: u16,
}

impl FromStr for PortPair {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidPortPair(s.to_string());
        let (local, remote) = match s.split_once(':') {
            Some((local, remote)) => (local, remote),
            None => (s, s),
        };
        Ok(PortPair {
            local: local.trim().parse().map_err(|_| invalid())?,
            remote: remote.trim().parse().map_err(|_| invalid())?,
        })
    }
}

impl fmt::Display for PortPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.local, self.remote)
    }
}

/// One declared tunnel: pods matching `selector` in `namespace`, and the port
/// pairs forwarded over a single connection to the chosen pod.
#[derive(serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct TunnelSpec {
    pub namespace: String,
    pub selector: String,
    pub ports: Vec<PortPair>,
}

impl TunnelSpec {
    pub fn new(namespace: &str, selector: &str, remote: u16, local: u16) -> Self {
        TunnelSpec {
            namespace: namespace.to_string(),
            selector: selector.to_string(),
            ports: vec![PortPair { local, remote }],
        }
    }
}

/// Tunnels sharing the credentials of one kubeconfig context.
#[derive(serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ContextGroup {
    pub name: String,
    pub tunnels: Vec<TunnelSpec>,
}

#[derive(Deserialize)]
struct RawFile {
    #[serde(default, rename = "context")]
    contexts: Vec<RawContext>,
}

#[derive(Deserialize)]
struct RawContext {
    name: String,
    #[serde(default, rename = "tunnel")]
    tunnels: Vec<RawTunnel>,
}

#[derive(Deserialize)]
struct RawTunnel {
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    selector: String,
    pod_port: Option<u16>,
    local_port: Option<u16>,
    #[serde(default)]
    ports: Vec<String>,
}

impl RawTunnel {
    fn validate(self, context: &str) -> Result<TunnelSpec, Error> {
        let invalid = |reason: &str| Error::InvalidTunnel {
            context: context.to_string(),
            reason: reason.to_string(),
        };
        if self.selector.trim().is_empty() {
            return Err(invalid("selector must not be empty"));
        }
        let mut ports = Vec::with_capacity(1 + self.ports.len());
        match (self.pod_port, self.local_port) {
            (Some(remote), local) => ports.push(PortPair {
                local: local.unwrap_or(remote),
                remote,
            }),
            (None, Some(_)) => return Err(invalid("local_port requires pod_port")),
            (None, None) => {}
        }
        for pair in &self.ports {
            ports.push(pair.parse()?);
        }
        if ports.is_empty() {
            return Err(invalid("no ports to forward"));
        }
        if ports.iter().any(|p| p.remote == 0) {
            return Err(invalid("remote port must not be 0"));
        }
        Ok(TunnelSpec {
            namespace: if self.namespace.is_empty() {
                "default".to_string()
            } else {
                self.namespace
            },
            selector: self.selector,
            ports,
        })
    }
}

/// Parses the tunnel file, preserving the declared order of contexts and tunnels.
pub fn parse_tunnels(contents: &str) -> Result<Vec<ContextGroup>, Error> {
    let raw: RawFile = toml::from_str(contents)?;
    let mut seen = HashSet::new();
    raw.contexts
        .into_iter()
        .map(|ctx| {
            if ctx.name.trim().is_empty() {
                return Err(Error::EmptyContext);
            }
            if !seen.insert(ctx.name.clone()) {
                return Err(Error::DuplicateContext(ctx.name));
            }
            let tunnels = ctx
                .tunnels
                .into_iter()
                .map(|t| t.validate(&ctx.name))
                .collect::<Result<_, _>>()?;
            Ok(ContextGroup {
                name: ctx.name,
                tunnels,
            })
        })
        .collect()
}

pub async fn load_tunnels(path: &Path) -> Result<Vec<ContextGroup>, Error> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::Read(path.to_path_buf(), e))?;
    parse_tunnels(&contents)
}
