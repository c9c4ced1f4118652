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

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace};

use super::{Error, TargetIdentity};
use crate::spdy::{self, Headers, Stream};

pub const HEADER_STREAM_TYPE: &str = "streamtype";
pub const HEADER_PORT: &str = "port";
pub const HEADER_REQUEST_ID: &str = "requestid";
pub const STREAM_TYPE_DATA: &str = "data";
pub const STREAM_TYPE_ERROR: &str = "error";

// Error messages are short; anything longer is cut off.
const MAX_ERROR_MESSAGE: u64 = 64 * 1024;

/// Channel is an upgraded port-forward connection to one pod. It is owned by a
/// single session and closed when dropped.
#[derive(Debug)]
pub struct Channel {
    conn: spdy::Connection,
    target: TargetIdentity,
    next_request_id: AtomicU64,
    stream_timeout: Duration,
}

/// The data and error streams of one forwarded connection, tied together by
/// their request id.
#[derive(Debug)]
pub struct StreamPair {
    pub request_id: u64,
    pub port: u16,
    pub data: Stream,
    pub error: Stream,
}

impl Channel {
    pub fn new(conn: spdy::Connection, target: TargetIdentity, stream_timeout: Duration) -> Self {
        Channel {
            conn,
            target,
            next_request_id: AtomicU64::new(0),
            stream_timeout,
        }
    }

    pub fn target(&self) -> &TargetIdentity {
        &self.target
    }

    /// Opens the error stream, then the data stream, for a new request to `port`.
    /// The error stream is read-only from our side, so its write half is closed
    /// right away.
    pub async fn open_stream_pair(&self, port: u16) -> Result<StreamPair, Error> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let headers = |kind: &str| -> Headers {
            Headers::from_iter([
                (HEADER_STREAM_TYPE, kind.to_string()),
                (HEADER_PORT, port.to_string()),
                (HEADER_REQUEST_ID, request_id.to_string()),
            ])
        };
        let multiplex = |source: spdy::Error| Error::Multiplex { port, source };

        let mut error = self
            .conn
            .open_stream(headers(STREAM_TYPE_ERROR), self.stream_timeout)
            .await
            .map_err(multiplex)?;
        error
            .shutdown()
            .await
            .map_err(|e| multiplex(spdy::Error::Io(e)))?;
        let data = self
            .conn
            .open_stream(headers(STREAM_TYPE_DATA), self.stream_timeout)
            .await
            .map_err(multiplex)?;
        trace!(port, request_id, data = data.id(), error = error.id(), "opened stream pair");
        Ok(StreamPair {
            request_id,
            port,
            data,
            error,
        })
    }

    /// Opens a stream pair for `port` and closes it again without sending data,
    /// returning a failure the kubelet reports within `grace`.
    pub async fn check_port(&self, port: u16, grace: Duration) -> Result<Option<String>, Error> {
        let StreamPair {
            request_id,
            mut data,
            error,
            ..
        } = self.open_stream_pair(port).await?;
        data.shutdown().await.map_err(|e| Error::Multiplex {
            port,
            source: spdy::Error::Io(e),
        })?;
        let report = tokio::time::timeout(grace, read_remote_error(error))
            .await
            .ok()
            .flatten();
        trace!(port, request_id, ?report, "checked port");
        Ok(report)
    }

    pub async fn ping(&self) -> Result<Duration, Error> {
        self.conn.ping().await.map_err(|_| Error::ChannelClosed)
    }

    pub fn close(&self) {
        self.conn.close()
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }

    /// Completes once the underlying connection is gone, for whatever reason.
    pub async fn closed(&self) {
        self.conn.closed().await
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.conn.close();
    }
}

/// Reads the error stream until the peer closes it. Any payload is a failure
/// report for the paired data stream.
pub async fn read_remote_error(error: Stream) -> Option<String> {
    let (read, _write) = error.into_split();
    let mut msg = Vec::new();
    if let Err(e) = read.take(MAX_ERROR_MESSAGE).read_to_end(&mut msg).await {
        debug!("error stream failed: {e}");
    }
    if msg.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(&msg).trim().to_string())
    }
}
