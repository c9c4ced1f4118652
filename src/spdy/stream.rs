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

use std::cmp;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::{Context, Poll, ready};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;
use tracing::trace;

use super::connection::Shared;
use super::frame::{FLAG_FIN, Frame};
use super::{RstStatus, StreamId};
use crate::copy;

// Writes larger than this are split across several data frames.
const MAX_DATA_CHUNK: usize = 32 * 1024;

/// Stream is one open SPDY stream. Consumers can only Read/Write; it is released
/// once both halves are dropped, resetting it if it was not fully closed.
pub struct Stream {
    read: StreamReadHalf,
    write: StreamWriteHalf,
}

pub struct StreamReadHalf {
    inbound: mpsc::UnboundedReceiver<io::Result<Bytes>>,
    buf: Bytes,
    state: Arc<StreamState>,
    _guard: Arc<StreamGuard>,
}

pub struct StreamWriteHalf {
    frames: PollSender<Frame>,
    state: Arc<StreamState>,
    fin_sent: bool,
    guard: Arc<StreamGuard>,
}

/// StreamState is shared by a stream's halves and the connection reader.
#[derive(Debug, Default)]
pub(super) struct StreamState {
    reset: AtomicBool,
    // Bytes received from the peer that the reader has not taken yet.
    buffered: AtomicUsize,
}

impl StreamState {
    pub(super) fn set_reset(&self) {
        self.reset.store(true, Ordering::Release);
    }

    fn is_reset(&self) -> bool {
        self.reset.load(Ordering::Acquire)
    }

    /// Accounts for `len` more buffered bytes, unless that would go past `limit`.
    pub(super) fn try_buffer(&self, len: usize, limit: usize) -> bool {
        self.buffered
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                n.checked_add(len).filter(|total| *total <= limit)
            })
            .is_ok()
    }

    fn unbuffer(&self, len: usize) {
        self.buffered.fetch_sub(len, Ordering::AcqRel);
    }
}

// Shared between the two halves; the stream slot is released when the last one goes.
struct StreamGuard {
    id: StreamId,
    shared: Arc<Shared>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        trace!(stream = self.id, "dropping stream");
        self.shared.release(self.id);
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id())
            .field("fin_sent", &self.write.fin_sent)
            .finish()
    }
}

impl Stream {
    pub(super) fn new(
        shared: Arc<Shared>,
        id: StreamId,
        inbound: mpsc::UnboundedReceiver<io::Result<Bytes>>,
        state: Arc<StreamState>,
    ) -> Stream {
        let frames = PollSender::new(shared.frame_sender());
        let guard = Arc::new(StreamGuard { id, shared });
        Stream {
            read: StreamReadHalf {
                inbound,
                buf: Bytes::new(),
                state: state.clone(),
                _guard: guard.clone(),
            },
            write: StreamWriteHalf {
                frames,
                state,
                fin_sent: false,
                guard,
            },
        }
    }

    pub fn id(&self) -> StreamId {
        self.write.guard.id
    }

    pub(super) fn shared(&self) -> &Arc<Shared> {
        &self.write.guard.shared
    }

    pub fn into_split(self) -> (StreamReadHalf, StreamWriteHalf) {
        (self.read, self.write)
    }

    /// Abort the stream in both directions.
    pub async fn reset(self, status: RstStatus) {
        let id = self.id();
        self.shared().reset_stream(id, status).await;
    }
}

impl copy::BufferedSplitter for Stream {
    type R = StreamReadHalf;
    type W = StreamWriteHalf;
    fn split_into_buffered_reader(self) -> (StreamReadHalf, StreamWriteHalf) {
        self.into_split()
    }
}

impl copy::ResizeBufRead for StreamReadHalf {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
        let this = self.get_mut();
        while this.buf.is_empty() {
            match ready!(this.inbound.poll_recv(cx)) {
                // Resets and connection loss are queued as errors before the
                // sender goes away, so a closed queue is a clean end of stream.
                None => return Poll::Ready(Ok(&[])),
                Some(Ok(data)) => {
                    this.state.unbuffer(data.len());
                    this.buf = data;
                }
                Some(Err(e)) => return Poll::Ready(Err(e)),
            }
        }
        Poll::Ready(Ok(&this.buf[..]))
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        let this = self.get_mut();
        this.buf.advance(cmp::min(amt, this.buf.len()));
    }

    // Frames arrive already sized by the peer, there is no buffer to grow.
    fn resize(self: Pin<&mut Self>) {}
}

impl AsyncRead for StreamReadHalf {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let available = ready!(copy::ResizeBufRead::poll_fill_buf(self.as_mut(), cx))?;
        let n = cmp::min(available.len(), buf.remaining());
        buf.put_slice(&available[..n]);
        copy::ResizeBufRead::consume(self, n);
        Poll::Ready(Ok(()))
    }
}

impl StreamWriteHalf {
    fn check_writable(&self) -> io::Result<()> {
        if self.state.is_reset() {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                format!("stream {} was reset", self.guard.id),
            ));
        }
        if self.fin_sent {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        Ok(())
    }
}

fn closed_error<T>(_: T) -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "connection closed")
}

impl AsyncWrite for StreamWriteHalf {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.check_writable()?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        ready!(this.frames.poll_reserve(cx)).map_err(closed_error)?;
        let n = cmp::min(buf.len(), MAX_DATA_CHUNK);
        this.frames
            .send_item(Frame::Data {
                stream_id: this.guard.id,
                flags: 0,
                data: Bytes::copy_from_slice(&buf[..n]),
            })
            .map_err(closed_error)?;
        Poll::Ready(Ok(n))
    }

    // Frames are flushed by the connection's writer as soon as they are queued.
    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.fin_sent || this.state.is_reset() {
            return Poll::Ready(Ok(()));
        }
        ready!(this.frames.poll_reserve(cx)).map_err(closed_error)?;
        this.frames
            .send_item(Frame::Data {
                stream_id: this.guard.id,
                flags: FLAG_FIN,
                data: Bytes::new(),
            })
            .map_err(closed_error)?;
        this.fin_sent = true;
        this.guard.shared.finish_outbound(this.guard.id);
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.read).poll_read(cx, buf)
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.write).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.write).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.write).poll_shutdown(cx)
    }
}
