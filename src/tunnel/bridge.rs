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
use std::pin::pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream};
use tracing::{Instrument, debug, info_span, trace, warn};

use super::portforward::{self, Channel, StreamPair};
use super::Error;
use crate::config::PortPair;
use crate::copy::{self, ConnectionStats};
use crate::drain::{self, DrainWatcher};

// How long the error stream may take to explain why a copy ended.
const REMOTE_ERROR_GRACE: Duration = Duration::from_millis(500);
// Bound on waiting for open connections to close once the session stops.
const CONNECTION_DRAIN_DEADLINE: Duration = Duration::from_secs(1);

/// LocalBridge owns the listener of one port pair and forwards every accepted
/// connection over the session's channel, each on its own stream pair.
#[derive(Debug)]
pub struct LocalBridge {
    listener: TcpListener,
    address: SocketAddr,
    ports: PortPair,
}

impl LocalBridge {
    /// Binds the local side of `ports`. A local port of 0 binds an ephemeral port;
    /// the result is available from [`LocalBridge::address`].
    pub async fn bind(ip: IpAddr, ports: PortPair) -> Result<LocalBridge, Error> {
        let addr = SocketAddr::new(ip, ports.local);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Bind(addr, e))?;
        let address = listener.local_addr().map_err(|e| Error::Bind(addr, e))?;
        Ok(LocalBridge {
            listener,
            address,
            ports,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn remote_port(&self) -> u16 {
        self.ports.remote
    }

    /// Accepts connections until `stop` fires. Every connection opens its own
    /// stream pair once accepted.
    pub async fn serve(self, channel: Arc<Channel>, stop: DrainWatcher) {
        let component = format!("bridge {}", self.address);
        drain::run_with_drain(component, stop, CONNECTION_DRAIN_DEADLINE, move |conns| {
            self.accept_loop(channel, conns)
        })
        .await
    }

    async fn accept_loop(self, channel: Arc<Channel>, conns: DrainWatcher) {
        let port = self.ports.remote;
        loop {
            let (stream, source) = match self.listener.accept().await {
                Ok(s) => s,
                Err(e) => {
                    warn!("failed to accept connection: {e}");
                    continue;
                }
            };
            let channel = channel.clone();
            let stop = conns.clone();
            let span = info_span!("connection", %source);
            tokio::spawn(
                async move {
                    let start = Instant::now();
                    tokio::select! {
                        res = forward(&channel, stream, port) => match res {
                            Ok(()) => debug!(dur=?start.elapsed(), "connection complete"),
                            Err(e) => warn!(dur=?start.elapsed(), "connection failed: {e}"),
                        },
                        release = stop.wait_for_drain() => {
                            debug!(mode=?release.mode(), "closing connection");
                        }
                    }
                }
                .instrument(span),
            );
        }
    }
}

/// Forwards one local connection until either side is done. The error stream is
/// watched the whole time; a report on it fails the connection.
async fn forward(channel: &Channel, local: TcpStream, port: u16) -> Result<(), Error> {
    let StreamPair {
        request_id,
        data,
        error,
        ..
    } = channel.open_stream_pair(port).await?;
    trace!(request_id, "forwarding");
    let _ = local.set_nodelay(true);

    let stats = ConnectionStats::default();
    let mut copy = pin!(copy::copy_bidirectional(local, data, &stats));
    let mut remote = pin!(portforward::read_remote_error(error));
    let res = tokio::select! {
        res = &mut copy => {
            // The kubelet reports failures after closing the data stream; give it a moment.
            match tokio::time::timeout(REMOTE_ERROR_GRACE, &mut remote).await {
                Ok(Some(msg)) => Err(Error::Remote(port, msg)),
                _ => res.map_err(Error::Forward),
            }
        }
        msg = &mut remote => match msg {
            Some(msg) => Err(Error::Remote(port, msg)),
            None => (&mut copy).await.map_err(Error::Forward),
        }
    };
    debug!(
        request_id,
        sent = stats.sent(),
        received = stats.received(),
        "stream pair done"
    );
    res
}
