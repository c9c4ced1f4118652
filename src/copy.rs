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

use pin_project_lite::pin_project;
use std::cmp;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, ready};
use tokio::io;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::trace;

// BufferedSplitter is a trait to expose splitting an IO object into a buffered reader and a writer
pub trait BufferedSplitter: Unpin {
    type R: ResizeBufRead + Unpin;
    type W: AsyncWrite + Unpin;
    fn split_into_buffered_reader(self) -> (Self::R, Self::W);
}

impl BufferedSplitter for TcpStream {
    type R = BufReader<OwnedReadHalf>;
    type W = OwnedWriteHalf;
    fn split_into_buffered_reader(self) -> (Self::R, Self::W) {
        let (rh, wh) = self.into_split();
        (BufReader::new(rh), wh)
    }
}

// ResizeBufRead is like AsyncBufRead, but allows triggering a resize.
pub trait ResizeBufRead {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<&[u8]>>;
    fn consume(self: Pin<&mut Self>, amt: usize);
    fn resize(self: Pin<&mut Self>);
}

// Initially we create a 1k buffer for each local connection.
const INITIAL_BUFFER_SIZE: usize = 1024;
// We increase up to 16k for high traffic connections, leaving room for the frame header.
const LARGE_BUFFER_SIZE: usize = 16_384 - 64;
// After 128k of data we will trigger a resize from INITIAL to LARGE
const RESIZE_THRESHOLD: u64 = 128 * 1024;

/// Byte counters for one forwarded connection. `sent` counts local to remote.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    sent: AtomicU64,
    received: AtomicU64,
}

impl ConnectionStats {
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    fn increment(&self, send: bool, amt: u64) {
        if send {
            self.sent.fetch_add(amt, Ordering::Relaxed);
        } else {
            self.received.fetch_add(amt, Ordering::Relaxed);
        }
    }
}

/// Copies bytes in both directions until either side finishes. Half-close is not
/// propagated: the first EOF or error shuts both writers down.
pub async fn copy_bidirectional<A, B>(
    downstream: A,
    upstream: B,
    stats: &ConnectionStats,
) -> io::Result<()>
where
    A: BufferedSplitter,
    B: BufferedSplitter,
{
    let (mut rd, mut wd) = downstream.split_into_buffered_reader();
    let (mut ru, mut wu) = upstream.split_into_buffered_reader();

    let res = tokio::select! {
        res = copy_buf(&mut rd, &mut wu, stats, true) => {
            trace!(?res, "send finished");
            res
        }
        res = copy_buf(&mut ru, &mut wd, stats, false) => {
            trace!(?res, "receive finished");
            res
        }
    };
    ignore_shutdown_errors(wu.shutdown().await)?;
    ignore_shutdown_errors(wd.shutdown().await)?;
    trace!(sent = stats.sent(), received = stats.received(), "copy complete");
    res.map(|_| ())
}

// During shutdown, the other end may have already disconnected. That is fine, they shutdown for us.
// Ignore it.
fn ignore_shutdown_errors(res: Result<(), io::Error>) -> Result<(), io::Error> {
    match &res {
        Err(e)
            if matches!(
                e.kind(),
                io::ErrorKind::NotConnected
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
            ) =>
        {
            Ok(())
        }
        _ => res,
    }
}

// CopyBuf is a fork of Tokio's same struct, with additional support for resizing and metrics reporting.
#[must_use = "futures do nothing unless you `.await` or poll them"]
struct CopyBuf<'a, R: ?Sized, W: ?Sized> {
    send: bool,
    reader: &'a mut R,
    writer: &'a mut W,
    stats: &'a ConnectionStats,
    amt: u64,
}

async fn copy_buf<'a, R, W>(
    reader: &'a mut R,
    writer: &'a mut W,
    stats: &ConnectionStats,
    is_send: bool,
) -> std::io::Result<u64>
where
    R: ResizeBufRead + Unpin + ?Sized,
    W: tokio::io::AsyncWrite + Unpin + ?Sized,
{
    CopyBuf {
        send: is_send,
        reader,
        writer,
        stats,
        amt: 0,
    }
    .await
}

impl<R, W> Future for CopyBuf<'_, R, W>
where
    R: ResizeBufRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    type Output = std::io::Result<u64>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        loop {
            let me = &mut *self;
            let buffer = ready!(Pin::new(&mut *me.reader).poll_fill_buf(cx))?;
            if buffer.is_empty() {
                ready!(Pin::new(&mut self.writer).poll_flush(cx))?;
                return Poll::Ready(Ok(self.amt));
            }

            let i = ready!(Pin::new(&mut *me.writer).poll_write(cx, buffer))?;
            if i == 0 {
                return Poll::Ready(Err(std::io::ErrorKind::WriteZero.into()));
            }
            me.stats.increment(me.send, i as u64);
            let old = self.amt;
            self.amt += i as u64;

            // If we were below the resize threshold before but are now above it, trigger the buffer to resize
            if old < RESIZE_THRESHOLD && RESIZE_THRESHOLD <= self.amt {
                Pin::new(&mut *self.reader).resize();
            }
            Pin::new(&mut *self.reader).consume(i);
        }
    }
}

// BufReader is a fork of Tokio's type with resize support
pin_project! {
    pub struct BufReader<R> {
        #[pin]
        inner: R,
        buf: Box<[u8]>,
        pos: usize,
        cap: usize,
    }
}

impl<R: AsyncRead> BufReader<R> {
    /// Creates a new `BufReader` with a default buffer capacity. The default is currently INITIAL_BUFFER_SIZE
    pub fn new(inner: R) -> Self {
        let buffer = vec![0; INITIAL_BUFFER_SIZE];
        Self {
            inner,
            buf: buffer.into_boxed_slice(),
            pos: 0,
            cap: 0,
        }
    }
}

impl<R: AsyncRead> ResizeBufRead for BufReader<R> {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
        let me = self.project();

        // If we've reached the end of our internal buffer then we need to fetch
        // some more data from the underlying reader.
        // Branch using `>=` instead of the more correct `==`
        // to tell the compiler that the pos..cap slice is always valid.
        if *me.pos >= *me.cap {
            debug_assert!(*me.pos == *me.cap);
            let mut buf = tokio::io::ReadBuf::new(me.buf);
            ready!(me.inner.poll_read(cx, &mut buf))?;
            *me.cap = buf.filled().len();
            *me.pos = 0;
        }
        Poll::Ready(Ok(&me.buf[*me.pos..*me.cap]))
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        let me = self.project();
        *me.pos = cmp::min(*me.pos + amt, *me.cap);
    }

    fn resize(self: Pin<&mut Self>) {
        let me = self.project();
        // If we don't hit this, we somehow called resize twice unexpectedly
        debug_assert_eq!(me.buf.len(), INITIAL_BUFFER_SIZE);
        // Make a new buffer of the large size, and swap it into place
        let mut now = vec![0u8; LARGE_BUFFER_SIZE].into_boxed_slice();
        std::mem::swap(me.buf, &mut now);
        // Now copy over any data from the old buffer.
        me.buf[0..now.len()].copy_from_slice(&now);
        trace!("resized buffer to {}", LARGE_BUFFER_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::tcp::TestServer;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    // Returns both ends of a loopback TCP connection.
    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), server.unwrap().0)
    }

    #[tokio::test]
    async fn copies_until_first_eof() {
        let echo = TestServer::echo().await;
        let upstream = TcpStream::connect(echo.address()).await.unwrap();
        let (mut local, proxied) = tcp_pair().await;
        let stats = std::sync::Arc::new(ConnectionStats::default());

        let s = stats.clone();
        let copy = tokio::spawn(async move { copy_bidirectional(proxied, upstream, &s).await });
        let payload = vec![7u8; 300 * 1024];
        let (mut r, mut w) = local.split();
        let mut got = vec![0u8; payload.len()];
        let (wrote, read) = tokio::join!(w.write_all(&payload), r.read_exact(&mut got));
        wrote.unwrap();
        read.unwrap();
        assert_eq!(got, payload);

        // Closing our write side ends the copy and closes the other direction too.
        local.shutdown().await.unwrap();
        copy.await.unwrap().unwrap();
        let mut rest = Vec::new();
        local.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert_eq!(stats.sent(), payload.len() as u64);
        assert_eq!(stats.received(), payload.len() as u64);
    }
}
