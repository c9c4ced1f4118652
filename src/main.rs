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

use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};

use kube_tunnel_proxy::*;
use tracing::{error, info};

fn main() -> anyhow::Result<ExitCode> {
    let _log_guard = telemetry::setup_logging();

    // For now we don't need a complex CLI, so rather than pull in dependencies just use basic argv[1]
    match std::env::args().nth(1).as_deref() {
        None | Some("run") => (),
        Some("version") => return version(),
        Some("help") => return help(),
        Some(unknown) => {
            eprintln!("unknown command: {unknown}");
            help()?;
            return Ok(ExitCode::FAILURE);
        }
    };

    let config = config::parse_config()?;
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.num_worker_threads)
        .thread_name_fn(|| {
            static ATOMIC_ID: AtomicUsize = AtomicUsize::new(0);
            let id = ATOMIC_ID.fetch_add(1, Ordering::SeqCst);
            format!("kube-tunnel-proxy-{id}")
        })
        .enable_all()
        .build()?
        .block_on(async move { run(config).await })
}

fn help() -> anyhow::Result<ExitCode> {
    let version = version::BuildInfo::new();
    println!(
        "
Kubernetes Tunnel Proxy ({version})

Commands:
run (default) - Start forwarding the tunnels declared in $TUNNEL_CONFIG
version       - Print the version of kube-tunnel-proxy
help          - Print commands and version of kube-tunnel-proxy"
    );
    Ok(ExitCode::SUCCESS)
}

fn version() -> anyhow::Result<ExitCode> {
    println!("{}", version::BuildInfo::new());
    Ok(ExitCode::SUCCESS)
}

async fn run(cfg: config::Config) -> anyhow::Result<ExitCode> {
    info!("version: {}", version::BuildInfo::new());
    info!("running with config: {}", serde_yaml::to_string(&cfg)?);
    let summary = app::build(cfg).await?.wait_termination().await?;
    info!(
        started = summary.started,
        no_match = summary.no_match,
        failed = summary.failed,
        stopped = summary.stopped,
        "exiting"
    );
    if summary.auth_failures > 0 {
        error!(
            "{} context(s) could not be authenticated",
            summary.auth_failures
        );
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}
