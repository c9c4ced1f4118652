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

use std::net::SocketAddr;
use std::{cmp, io};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tracing::{info, trace};

/// TestServer is a loopback TCP server standing in for a pod's port.
pub struct TestServer {
    address: SocketAddr,
}

impl TestServer {
    /// A server that writes back everything it reads.
    pub async fn echo() -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, peer)) = listener.accept().await else {
                    return;
                };
                trace!(%peer, "echo accepted");
                tokio::spawn(async move {
                    let (mut r, mut w) = socket.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                    let _ = w.shutdown().await;
                });
            }
        });
        TestServer { address }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }
}

/// run_throughput reads and writes as much data as possible until `target`
/// bytes are read and written.
pub async fn run_throughput(stream: &mut TcpStream, target: usize) -> Result<(), io::Error> {
    let start = Instant::now();
    let (mut r, mut w) = stream.split();
    let writer = async move {
        let mut wrote = 0;
        let buffer = vec![0; 1024 * 1024];
        while wrote < target {
            let length = cmp::min(buffer.len(), target - wrote);
            wrote += w.write(&buffer[..length]).await?;
        }
        Ok::<usize, io::Error>(wrote)
    };
    let reader = async move {
        let mut read = 0;
        let mut buffer = vec![0; 1024 * 1024];
        while read < target {
            let length = cmp::min(buffer.len(), target - read);
            let n = r.read(&mut buffer[..length]).await?;
            if n == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            read += n;
        }
        Ok::<usize, io::Error>(read)
    };
    let (wrote, _read) = tokio::try_join!(writer, reader)?;
    info!("throughput: wrote {wrote} in {:?}", start.elapsed());
    Ok(())
}

/// run_latency writes `amt` bytes and reads them back, returning what was read.
pub async fn run_latency(stream: &mut TcpStream, amt: usize) -> Result<Vec<u8>, io::Error> {
    let start = Instant::now();
    let (mut r, mut w) = stream.split();
    let sent: Vec<u8> = (0..amt).map(|i| (i % 251) as u8).collect();
    let mut buffer = vec![0; amt];
    tokio::try_join!(w.write_all(&sent), r.read_exact(&mut buffer))?;
    info!("latency: wrote {amt} in {:?}", start.elapsed());
    if buffer != sent {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "echo mismatch"));
    }
    Ok(buffer)
}
