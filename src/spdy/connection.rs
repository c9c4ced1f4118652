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

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn, Instrument};

use super::frame::{Codec, FLAG_FIN, Frame, Headers};
use super::stream::{Stream, StreamState};
use super::{Error, RstStatus, StreamId};

// Outbound frames waiting for the writer. Writers block once it is full.
const FRAME_QUEUE: usize = 64;
// Inbound bytes buffered for a stream whose reader falls behind. Past this the
// stream is reset; the peer does not honor flow-control windows.
pub(super) const STREAM_BUFFER_LIMIT: usize = 4 * 1024 * 1024;
const ACCEPT_QUEUE: usize = 16;
// How long a closing connection gets to flush its GOAWAY before it is torn down.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Which end of the upgraded connection we are; this decides stream id parity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    fn first_id(self) -> u32 {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }

    // Whether ids with this parity are allocated by us.
    fn owns(self, id: u32) -> bool {
        (id % 2 == 1) == (self == Role::Client)
    }
}

struct Slot {
    inbound: Option<mpsc::UnboundedSender<io::Result<Bytes>>>,
    reply: Option<oneshot::Sender<Result<(), Error>>>,
    state: Arc<StreamState>,
    local_closed: bool,
}

pub(super) struct Shared {
    role: Role,
    frames: mpsc::Sender<Frame>,
    streams: Mutex<HashMap<StreamId, Slot>>,
    // Held across the SYN_STREAM send so ids hit the wire in increasing order.
    next_stream_id: tokio::sync::Mutex<StreamId>,
    pings: Mutex<HashMap<u32, oneshot::Sender<()>>>,
    next_ping_id: AtomicU32,
    last_peer_stream: AtomicU32,
    closing: CancellationToken,
    closed: CancellationToken,
}

impl Shared {
    fn streams(&self) -> MutexGuard<'_, HashMap<StreamId, Slot>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pings(&self) -> MutexGuard<'_, HashMap<u32, oneshot::Sender<()>>> {
        self.pings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn frame_sender(&self) -> mpsc::Sender<Frame> {
        self.frames.clone()
    }

    async fn send(&self, frame: Frame) -> Result<(), Error> {
        self.frames
            .send(frame)
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    // Never waits on the stream's reader, other streams share this loop.
    async fn deliver(&self, id: StreamId, data: Bytes, fin: bool) {
        let target = self
            .streams()
            .get(&id)
            .and_then(|s| Some((s.inbound.clone()?, s.state.clone())));
        let Some((inbound, state)) = target else {
            trace!(stream = id, "data for unknown or closed stream");
            return;
        };
        if !data.is_empty() {
            if !state.try_buffer(data.len(), STREAM_BUFFER_LIMIT) {
                self.overflow(id).await;
                return;
            }
            // A dropped reader is fine; the peer will be reset once the writer goes too.
            let _ = inbound.send(Ok(data));
        }
        if fin {
            self.finish_inbound(id);
        }
    }

    async fn overflow(&self, id: StreamId) {
        let Some(slot) = self.streams().remove(&id) else {
            return;
        };
        warn!(
            stream = id,
            limit = STREAM_BUFFER_LIMIT,
            "stream reader fell behind, resetting stream"
        );
        slot.state.set_reset();
        if let Some(inbound) = slot.inbound {
            let _ = inbound.send(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                format!("stream {id} reset, more than {STREAM_BUFFER_LIMIT} bytes unread"),
            )));
        }
        let _ = self
            .send(Frame::RstStream {
                stream_id: id,
                status: RstStatus::FlowControlError,
            })
            .await;
    }

    fn on_reply(&self, id: StreamId, fin: bool) {
        let reply = self.streams().get_mut(&id).and_then(|s| s.reply.take());
        match reply {
            Some(reply) => {
                let _ = reply.send(Ok(()));
            }
            None => trace!(stream = id, "unexpected reply"),
        }
        if fin {
            self.finish_inbound(id);
        }
    }

    fn on_reset(&self, id: StreamId, status: RstStatus) {
        let Some(slot) = self.streams().remove(&id) else {
            return;
        };
        debug!(stream = id, ?status, "stream reset by peer");
        slot.state.set_reset();
        if let Some(reply) = slot.reply {
            let _ = reply.send(Err(Error::StreamReset(id, status)));
        }
        if let Some(inbound) = slot.inbound {
            let _ = inbound.send(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                Error::StreamReset(id, status),
            )));
        }
    }

    fn finish_inbound(&self, id: StreamId) {
        let mut streams = self.streams();
        if let Some(slot) = streams.get_mut(&id) {
            slot.inbound = None;
            if slot.local_closed {
                streams.remove(&id);
            }
        }
    }

    pub(super) fn finish_outbound(&self, id: StreamId) {
        let mut streams = self.streams();
        if let Some(slot) = streams.get_mut(&id) {
            slot.local_closed = true;
            if slot.inbound.is_none() {
                streams.remove(&id);
            }
        }
    }

    /// Called once every handle to a stream is gone. A stream that was not closed
    /// in both directions is cancelled.
    pub(super) fn release(&self, id: StreamId) {
        let open = self.streams().remove(&id).is_some();
        if open && !self.closed.is_cancelled() {
            let _ = self.frames.try_send(Frame::RstStream {
                stream_id: id,
                status: RstStatus::Cancel,
            });
        }
    }

    pub(super) async fn reset_stream(&self, id: StreamId, status: RstStatus) {
        if let Some(slot) = self.streams().remove(&id) {
            slot.state.set_reset();
        }
        let _ = self
            .send(Frame::RstStream {
                stream_id: id,
                status,
            })
            .await;
    }

    fn shutdown(&self) {
        self.closing.cancel();
        self.closed.cancel();
        let streams = std::mem::take(&mut *self.streams());
        for (_, slot) in streams {
            slot.state.set_reset();
            if let Some(reply) = slot.reply {
                let _ = reply.send(Err(Error::ConnectionClosed));
            }
            if let Some(inbound) = slot.inbound {
                let _ = inbound.send(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    Error::ConnectionClosed,
                )));
            }
        }
        self.pings().clear();
    }
}

/// Connection is a handle to one multiplexed SPDY connection. The connection is
/// driven by a background task; all clones share it.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.shared.role)
            .field("closed", &self.shared.closed.is_cancelled())
            .finish()
    }
}

/// Incoming yields streams opened by the peer.
pub struct Incoming {
    rx: mpsc::Receiver<IncomingStream>,
}

impl Incoming {
    pub async fn accept(&mut self) -> Option<IncomingStream> {
        self.rx.recv().await
    }
}

/// IncomingStream is a stream the peer opened that has not been answered yet.
/// Dropping it cancels the stream.
pub struct IncomingStream {
    headers: Headers,
    stream: Stream,
}

impl IncomingStream {
    pub fn id(&self) -> StreamId {
        self.stream.id()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub async fn accept(self) -> Result<Stream, Error> {
        self.stream
            .shared()
            .send(Frame::SynReply {
                stream_id: self.stream.id(),
                flags: 0,
                headers: Headers::new(),
            })
            .await?;
        Ok(self.stream)
    }

    pub async fn refuse(self) {
        self.stream.reset(RstStatus::RefusedStream).await
    }
}

impl Connection {
    /// Starts driving a SPDY connection over `io`.
    pub fn new<IO>(io: IO, role: Role) -> (Connection, Incoming)
    where
        IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_QUEUE);
        let (incoming_tx, incoming_rx) = mpsc::channel(ACCEPT_QUEUE);
        let shared = Arc::new(Shared {
            role,
            frames: frames_tx,
            streams: Mutex::new(HashMap::new()),
            next_stream_id: tokio::sync::Mutex::new(role.first_id()),
            pings: Mutex::new(HashMap::new()),
            next_ping_id: AtomicU32::new(role.first_id()),
            last_peer_stream: AtomicU32::new(0),
            closing: CancellationToken::new(),
            closed: CancellationToken::new(),
        });
        tokio::spawn(
            drive_connection(io, shared.clone(), frames_rx, incoming_tx).in_current_span(),
        );
        (Connection { shared }, Incoming { rx: incoming_rx })
    }

    /// Opens a stream and waits up to `timeout` for the peer to reply.
    pub async fn open_stream(&self, headers: Headers, timeout: Duration) -> Result<Stream, Error> {
        if self.shared.closing.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let state = Arc::new(StreamState::default());

        let mut next = self.shared.next_stream_id.lock().await;
        let id = *next;
        if id > 0x7fff_ffff {
            return Err(Error::StreamIdsExhausted);
        }
        *next += 2;
        self.shared.streams().insert(
            id,
            Slot {
                inbound: Some(inbound_tx),
                reply: Some(reply_tx),
                state: state.clone(),
                local_closed: false,
            },
        );
        // From here on dropping the stream cleans up the slot.
        let stream = Stream::new(self.shared.clone(), id, inbound_rx, state);
        self.shared
            .send(Frame::SynStream {
                stream_id: id,
                associated_id: 0,
                priority: 0,
                flags: 0,
                headers,
            })
            .await?;
        drop(next);

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(Ok(()))) => Ok(stream),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => Err(Error::StreamTimeout(id)),
        }
    }

    /// Sends a PING and waits for the echo, returning the round trip time.
    pub async fn ping(&self) -> Result<Duration, Error> {
        let id = self.shared.next_ping_id.fetch_add(2, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pings().insert(id, tx);
        let start = Instant::now();
        if let Err(e) = self.shared.send(Frame::Ping { id }).await {
            self.shared.pings().remove(&id);
            return Err(e);
        }
        rx.await.map_err(|_| Error::ConnectionClosed)?;
        Ok(start.elapsed())
    }

    /// Pings the peer every `interval`, closing the connection if a pong does not
    /// come back in time.
    pub fn spawn_keepalive(&self, interval: Duration) {
        let conn = self.clone();
        tokio::spawn(async move { conn.keepalive(interval).await }.in_current_span());
    }

    async fn keepalive(self, interval: Duration) {
        loop {
            tokio::select! {
                _ = self.shared.closing.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            match tokio::time::timeout(interval * 2, self.ping()).await {
                Err(_) => {
                    warn!("ping timeout, closing connection");
                    self.close();
                    return;
                }
                // The connection is already gone, the driver reports why.
                Ok(Err(_)) => return,
                Ok(Ok(rtt)) => trace!(?rtt, "pong received"),
            }
        }
    }

    /// Starts closing the connection: a GOAWAY is sent and no new streams can be
    /// opened. Open streams fail once the connection is torn down.
    pub fn close(&self) {
        if self.shared.closing.is_cancelled() {
            return;
        }
        self.shared.closing.cancel();
        let _ = self.shared.frames.try_send(Frame::GoAway {
            last_good_stream_id: self.shared.last_peer_stream.load(Ordering::Relaxed),
            status: 0,
        });
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Completes once the connection is torn down.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await
    }
}

async fn drive_connection<IO>(
    io: IO,
    shared: Arc<Shared>,
    frames: mpsc::Receiver<Frame>,
    incoming: mpsc::Sender<IncomingStream>,
) where
    IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (r, w) = tokio::io::split(io);
    let reader = FramedRead::new(r, Codec::new());
    let writer = FramedWrite::new(w, Codec::new());
    let res = tokio::select! {
        res = read_frames(&shared, reader, incoming) => res,
        res = write_frames(writer, frames) => res,
        _ = async {
            shared.closing.cancelled().await;
            tokio::time::sleep(CLOSE_GRACE).await;
        } => Ok(()),
    };
    match res {
        Ok(()) => debug!("spdy connection closed"),
        Err(e) => warn!("spdy connection terminated: {e}"),
    }
    shared.shutdown();
}

async fn read_frames<R>(
    shared: &Arc<Shared>,
    mut reader: FramedRead<R, Codec>,
    incoming: mpsc::Sender<IncomingStream>,
) -> Result<(), Error>
where
    R: AsyncRead + Unpin,
{
    while let Some(frame) = reader.next().await {
        let frame = frame?;
        trace!(?frame, "recv");
        match frame {
            Frame::Data {
                stream_id,
                flags,
                data,
            } => shared.deliver(stream_id, data, flags & FLAG_FIN != 0).await,
            Frame::SynReply {
                stream_id, flags, ..
            } => shared.on_reply(stream_id, flags & FLAG_FIN != 0),
            Frame::RstStream { stream_id, status } => shared.on_reset(stream_id, status),
            Frame::SynStream {
                stream_id,
                flags,
                headers,
                ..
            } => {
                if shared.role.owns(stream_id) || shared.streams().contains_key(&stream_id) {
                    warn!(stream = stream_id, "peer opened a stream with an invalid id");
                    shared
                        .send(Frame::RstStream {
                            stream_id,
                            status: RstStatus::ProtocolError,
                        })
                        .await?;
                    continue;
                }
                shared.last_peer_stream.fetch_max(stream_id, Ordering::Relaxed);
                let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
                let state = Arc::new(StreamState::default());
                shared.streams().insert(
                    stream_id,
                    Slot {
                        inbound: (flags & FLAG_FIN == 0).then_some(inbound_tx),
                        reply: None,
                        state: state.clone(),
                        local_closed: false,
                    },
                );
                let stream = Stream::new(shared.clone(), stream_id, inbound_rx, state);
                if let Err(mpsc::error::SendError(rejected)) =
                    incoming.send(IncomingStream { headers, stream }).await
                {
                    rejected.refuse().await;
                }
            }
            Frame::Ping { id } => {
                if shared.role.owns(id) {
                    if let Some(tx) = shared.pings().remove(&id) {
                        let _ = tx.send(());
                    }
                } else {
                    shared.send(Frame::Ping { id }).await?;
                }
            }
            Frame::GoAway {
                last_good_stream_id,
                status,
            } => {
                debug!(last_good_stream_id, status, "peer sent GOAWAY");
                return Ok(());
            }
            Frame::Headers {
                stream_id, flags, ..
            } => {
                if flags & FLAG_FIN != 0 {
                    shared.finish_inbound(stream_id);
                }
            }
            // Windows are not enforced in either direction; see STREAM_BUFFER_LIMIT.
            Frame::Settings { .. } | Frame::WindowUpdate { .. } => {}
        }
    }
    Ok(())
}

async fn write_frames<W>(
    mut writer: FramedWrite<W, Codec>,
    mut frames: mpsc::Receiver<Frame>,
) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = frames.recv().await {
        trace!(?frame, "send");
        let go_away = matches!(frame, Frame::GoAway { .. });
        writer.feed(frame).await?;
        if go_away {
            writer.close().await?;
            return Ok(());
        }
        if frames.is_empty() {
            writer.flush().await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spdy::frame::Codec as FrameCodec;
    use matches::assert_matches;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn pair() -> ((Connection, Incoming), (Connection, Incoming)) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            Connection::new(a, Role::Client),
            Connection::new(b, Role::Server),
        )
    }

    fn headers(kind: &str) -> Headers {
        [("streamtype", kind), ("port", "80"), ("requestid", "0")]
            .into_iter()
            .collect()
    }

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn open_and_echo() {
        let ((client, _), (_server, mut incoming)) = pair();
        tokio::spawn(async move {
            while let Some(inc) = incoming.accept().await {
                assert_eq!(inc.headers().get("streamtype"), Some("data"));
                let mut stream = inc.accept().await.unwrap();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    stream.read_to_end(&mut buf).await.unwrap();
                    stream.write_all(&buf).await.unwrap();
                    stream.shutdown().await.unwrap();
                });
            }
        });

        let mut stream = client.open_stream(headers("data"), TIMEOUT).await.unwrap();
        assert_eq!(stream.id(), 1);
        stream.write_all(b"PING").await.unwrap();
        stream.shutdown().await.unwrap();
        let mut got = Vec::new();
        stream.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"PING");
    }

    #[tokio::test]
    async fn streams_do_not_interleave() {
        let ((client, _), (_server, mut incoming)) = pair();
        tokio::spawn(async move {
            while let Some(inc) = incoming.accept().await {
                let stream = inc.accept().await.unwrap();
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.into_split();
                    tokio::io::copy(&mut r, &mut w).await.unwrap();
                    w.shutdown().await.unwrap();
                });
            }
        });

        let mut tasks = Vec::new();
        for i in 0..4u8 {
            let client = client.clone();
            tasks.push(tokio::spawn(async move {
                let stream = client.open_stream(headers("data"), TIMEOUT).await.unwrap();
                let (mut r, mut w) = stream.into_split();
                let payload: Vec<u8> = (0..200_000).map(|n| (n % 251) as u8 ^ i).collect();
                let expected = payload.clone();
                let writer = tokio::spawn(async move {
                    w.write_all(&payload).await.unwrap();
                    w.shutdown().await.unwrap();
                });
                let mut got = Vec::new();
                r.read_to_end(&mut got).await.unwrap();
                writer.await.unwrap();
                assert_eq!(got, expected);
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
    }

    #[tokio::test]
    async fn refused_stream() {
        let ((client, _), (_server, mut incoming)) = pair();
        tokio::spawn(async move {
            while let Some(inc) = incoming.accept().await {
                inc.refuse().await;
            }
        });
        let res = client.open_stream(headers("data"), TIMEOUT).await;
        assert_matches!(res, Err(Error::StreamReset(1, RstStatus::RefusedStream)));
        // Only the stream failed.
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn unanswered_stream_times_out() {
        let ((client, _), (_server, _incoming)) = pair();
        let res = client
            .open_stream(headers("data"), Duration::from_millis(50))
            .await;
        assert_matches!(res, Err(Error::StreamTimeout(1)));
    }

    #[tokio::test]
    async fn ping_round_trip() {
        let ((client, _), (server, _incoming)) = pair();
        client.ping().await.unwrap();
        server.ping().await.unwrap();
    }

    #[tokio::test]
    async fn close_fails_open_streams() {
        let ((client, _), (server, mut incoming)) = pair();
        let accepted = tokio::spawn(async move {
            let inc = incoming.accept().await.unwrap();
            inc.accept().await.unwrap()
        });
        let mut stream = client.open_stream(headers("data"), TIMEOUT).await.unwrap();
        let _remote = accepted.await.unwrap();

        server.close();
        tokio::time::timeout(TIMEOUT, client.closed()).await.unwrap();
        assert!(stream.write_all(b"late").await.is_err());
        assert_matches!(
            client.open_stream(headers("data"), TIMEOUT).await,
            Err(Error::ConnectionClosed)
        );
    }

    #[tokio::test]
    async fn peer_pings_are_echoed() {
        let (raw, remote) = tokio::io::duplex(4096);
        let (_conn, _incoming) = Connection::new(remote, Role::Client);
        let mut peer = tokio_util::codec::Framed::<DuplexStream, FrameCodec>::new(raw, FrameCodec::new());
        // Server originated pings are even.
        peer.send(Frame::Ping { id: 2 }).await.unwrap();
        let echoed = tokio::time::timeout(TIMEOUT, peer.next()).await.unwrap();
        assert_matches!(echoed, Some(Ok(Frame::Ping { id: 2 })));
    }

    #[tokio::test]
    async fn dropped_stream_is_cancelled() {
        let (raw, remote) = tokio::io::duplex(4096);
        let (conn, _incoming) = Connection::new(remote, Role::Client);
        let mut peer = tokio_util::codec::Framed::<DuplexStream, FrameCodec>::new(raw, FrameCodec::new());

        let open = tokio::spawn(async move { conn.open_stream(headers("data"), TIMEOUT).await });
        assert_matches!(peer.next().await, Some(Ok(Frame::SynStream { stream_id: 1, .. })));
        peer.send(Frame::SynReply {
            stream_id: 1,
            flags: 0,
            headers: Headers::new(),
        })
        .await
        .unwrap();
        let stream = open.await.unwrap().unwrap();
        drop(stream);
        assert_matches!(
            peer.next().await,
            Some(Ok(Frame::RstStream {
                stream_id: 1,
                status: RstStatus::Cancel
            }))
        );
    }

    // Opens a client stream against a raw peer that answers the SYN_STREAM.
    async fn open_against_raw(
        conn: &Connection,
        peer: &mut tokio_util::codec::Framed<DuplexStream, FrameCodec>,
    ) -> Stream {
        let open = tokio::spawn({
            let conn = conn.clone();
            async move { conn.open_stream(headers("data"), TIMEOUT).await }
        });
        let Some(Ok(Frame::SynStream { stream_id, .. })) = peer.next().await else {
            panic!("expected SYN_STREAM");
        };
        peer.send(Frame::SynReply {
            stream_id,
            flags: 0,
            headers: Headers::new(),
        })
        .await
        .unwrap();
        open.await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn stalled_reader_does_not_block_other_streams() {
        let (raw, remote) = tokio::io::duplex(64 * 1024);
        let (conn, _incoming) = Connection::new(remote, Role::Client);
        let mut peer = tokio_util::codec::Framed::<DuplexStream, FrameCodec>::new(raw, FrameCodec::new());
        let mut stalled = open_against_raw(&conn, &mut peer).await;
        let mut live = open_against_raw(&conn, &mut peer).await;

        // Nobody reads the first stream while the peer floods it past the limit.
        let chunk = Bytes::from(vec![7u8; 32 * 1024]);
        for _ in 0..=STREAM_BUFFER_LIMIT / chunk.len() {
            peer.send(Frame::Data {
                stream_id: stalled.id(),
                flags: 0,
                data: chunk.clone(),
            })
            .await
            .unwrap();
        }
        peer.send(Frame::Data {
            stream_id: live.id(),
            flags: FLAG_FIN,
            data: Bytes::from_static(b"PONG"),
        })
        .await
        .unwrap();
        peer.send(Frame::Ping { id: 2 }).await.unwrap();

        let mut got = Vec::new();
        tokio::time::timeout(TIMEOUT, live.read_to_end(&mut got))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, b"PONG");
        assert_matches!(
            tokio::time::timeout(TIMEOUT, peer.next()).await.unwrap(),
            Some(Ok(Frame::RstStream { status: RstStatus::FlowControlError, stream_id })) if stream_id == stalled.id()
        );
        assert_matches!(
            tokio::time::timeout(TIMEOUT, peer.next()).await.unwrap(),
            Some(Ok(Frame::Ping { id: 2 }))
        );

        // What was buffered is still readable, then the reset surfaces.
        let mut buffered = Vec::new();
        let err = stalled.read_to_end(&mut buffered).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(buffered.len(), STREAM_BUFFER_LIMIT);
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn reset_after_queued_data_is_an_error() {
        let (raw, remote) = tokio::io::duplex(64 * 1024);
        let (conn, _incoming) = Connection::new(remote, Role::Client);
        let mut peer = tokio_util::codec::Framed::<DuplexStream, FrameCodec>::new(raw, FrameCodec::new());
        let mut stream = open_against_raw(&conn, &mut peer).await;

        for _ in 0..16 {
            peer.send(Frame::Data {
                stream_id: stream.id(),
                flags: 0,
                data: Bytes::from_static(b"x"),
            })
            .await
            .unwrap();
        }
        peer.send(Frame::RstStream {
            stream_id: stream.id(),
            status: RstStatus::InternalError,
        })
        .await
        .unwrap();

        let mut got = Vec::new();
        let err = tokio::time::timeout(TIMEOUT, stream.read_to_end(&mut got))
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(got, vec![b'x'; 16]);
    }

    #[tokio::test]
    async fn connection_loss_mid_stream_is_an_error() {
        let (raw, remote) = tokio::io::duplex(64 * 1024);
        let (conn, _incoming) = Connection::new(remote, Role::Client);
        let mut peer = tokio_util::codec::Framed::<DuplexStream, FrameCodec>::new(raw, FrameCodec::new());
        let mut stream = open_against_raw(&conn, &mut peer).await;
        peer.send(Frame::Data {
            stream_id: stream.id(),
            flags: 0,
            data: Bytes::from_static(b"partial"),
        })
        .await
        .unwrap();
        drop(peer);

        let mut got = Vec::new();
        let err = tokio::time::timeout(TIMEOUT, stream.read_to_end(&mut got))
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(got, b"partial");
    }
}
