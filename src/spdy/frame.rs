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

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use super::compress::{HeaderCompressor, HeaderDecompressor};
use super::{Error, StreamId};

pub const VERSION: u16 = 3;

pub const FLAG_FIN: u8 = 0x01;

const CONTROL_BIT: u8 = 0x80;
const FRAME_HEADER_LEN: usize = 8;
const STREAM_ID_MASK: u32 = 0x7fff_ffff;

/// Largest payload a single frame can describe (24 bit length).
pub const MAX_FRAME_LEN: usize = 0x00ff_ffff;

const TYPE_SYN_STREAM: u16 = 1;
const TYPE_SYN_REPLY: u16 = 2;
const TYPE_RST_STREAM: u16 = 3;
const TYPE_SETTINGS: u16 = 4;
const TYPE_PING: u16 = 6;
const TYPE_GOAWAY: u16 = 7;
const TYPE_HEADERS: u16 = 8;
const TYPE_WINDOW_UPDATE: u16 = 9;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RstStatus {
    ProtocolError,
    InvalidStream,
    RefusedStream,
    UnsupportedVersion,
    Cancel,
    InternalError,
    FlowControlError,
    StreamInUse,
    StreamAlreadyClosed,
    FrameTooLarge,
    Unknown(u32),
}

impl From<u32> for RstStatus {
    fn from(code: u32) -> Self {
        match code {
            1 => RstStatus::ProtocolError,
            2 => RstStatus::InvalidStream,
            3 => RstStatus::RefusedStream,
            4 => RstStatus::UnsupportedVersion,
            5 => RstStatus::Cancel,
            6 => RstStatus::InternalError,
            7 => RstStatus::FlowControlError,
            8 => RstStatus::StreamInUse,
            9 => RstStatus::StreamAlreadyClosed,
            11 => RstStatus::FrameTooLarge,
            other => RstStatus::Unknown(other),
        }
    }
}

impl From<RstStatus> for u32 {
    fn from(status: RstStatus) -> Self {
        match status {
            RstStatus::ProtocolError => 1,
            RstStatus::InvalidStream => 2,
            RstStatus::RefusedStream => 3,
            RstStatus::UnsupportedVersion => 4,
            RstStatus::Cancel => 5,
            RstStatus::InternalError => 6,
            RstStatus::FlowControlError => 7,
            RstStatus::StreamInUse => 8,
            RstStatus::StreamAlreadyClosed => 9,
            RstStatus::FrameTooLarge => 11,
            RstStatus::Unknown(other) => other,
        }
    }
}

/// An ordered header block. Names are always stored lowercase.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.0.push((name.as_ref().to_ascii_lowercase(), value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.0.len() * 32);
        buf.put_u32(self.0.len() as u32);
        for (k, v) in &self.0 {
            buf.put_u32(k.len() as u32);
            buf.put_slice(k.as_bytes());
            buf.put_u32(v.len() as u32);
            buf.put_slice(v.as_bytes());
        }
        buf
    }

    fn decode(mut buf: &[u8]) -> Result<Headers, Error> {
        let count = read_u32(&mut buf)?;
        let mut headers = Headers(Vec::with_capacity(count.min(64) as usize));
        for _ in 0..count {
            let name = read_string(&mut buf)?;
            let value = read_string(&mut buf)?;
            if name.is_empty() {
                return Err(Error::Protocol("empty header name".to_string()));
            }
            headers.0.push((name.to_ascii_lowercase(), value));
        }
        Ok(headers)
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

fn read_u32(buf: &mut &[u8]) -> Result<u32, Error> {
    if buf.remaining() < 4 {
        return Err(Error::Protocol("short header block".to_string()));
    }
    Ok(buf.get_u32())
}

fn read_string(buf: &mut &[u8]) -> Result<String, Error> {
    let len = read_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(Error::Protocol("short header block".to_string()));
    }
    let s = String::from_utf8(buf[..len].to_vec())
        .map_err(|_| Error::Protocol("header is not valid utf-8".to_string()))?;
    buf.advance(len);
    Ok(s)
}

#[derive(Clone, PartialEq, Eq)]
pub enum Frame {
    SynStream {
        stream_id: StreamId,
        associated_id: StreamId,
        priority: u8,
        flags: u8,
        headers: Headers,
    },
    SynReply {
        stream_id: StreamId,
        flags: u8,
        headers: Headers,
    },
    RstStream {
        stream_id: StreamId,
        status: RstStatus,
    },
    Settings {
        flags: u8,
        entries: Vec<(u8, u32, u32)>,
    },
    Ping {
        id: u32,
    },
    GoAway {
        last_good_stream_id: StreamId,
        status: u32,
    },
    Headers {
        stream_id: StreamId,
        flags: u8,
        headers: Headers,
    },
    WindowUpdate {
        stream_id: StreamId,
        delta: u32,
    },
    Data {
        stream_id: StreamId,
        flags: u8,
        data: Bytes,
    },
}

// Data payloads can be large; only print their size.
impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::SynStream {
                stream_id,
                flags,
                headers,
                ..
            } => f
                .debug_struct("SynStream")
                .field("stream_id", stream_id)
                .field("flags", flags)
                .field("headers", headers)
                .finish(),
            Frame::SynReply {
                stream_id,
                flags,
                headers,
            } => f
                .debug_struct("SynReply")
                .field("stream_id", stream_id)
                .field("flags", flags)
                .field("headers", headers)
                .finish(),
            Frame::RstStream { stream_id, status } => f
                .debug_struct("RstStream")
                .field("stream_id", stream_id)
                .field("status", status)
                .finish(),
            Frame::Settings { entries, .. } => f
                .debug_struct("Settings")
                .field("entries", &entries.len())
                .finish(),
            Frame::Ping { id } => f.debug_struct("Ping").field("id", id).finish(),
            Frame::GoAway {
                last_good_stream_id,
                status,
            } => f
                .debug_struct("GoAway")
                .field("last_good_stream_id", last_good_stream_id)
                .field("status", status)
                .finish(),
            Frame::Headers { stream_id, .. } => f
                .debug_struct("Headers")
                .field("stream_id", stream_id)
                .finish(),
            Frame::WindowUpdate { stream_id, delta } => f
                .debug_struct("WindowUpdate")
                .field("stream_id", stream_id)
                .field("delta", delta)
                .finish(),
            Frame::Data {
                stream_id,
                flags,
                data,
            } => f
                .debug_struct("Data")
                .field("stream_id", stream_id)
                .field("flags", flags)
                .field("len", &data.len())
                .finish(),
        }
    }
}

/// Codec is a `tokio_util` codec for SPDY/3.1 frames. Each direction of a
/// connection needs its own instance since it carries the header compression state.
#[derive(Default)]
pub struct Codec {
    compressor: HeaderCompressor,
    decompressor: HeaderDecompressor,
}

impl Codec {
    pub fn new() -> Self {
        Self::default()
    }

    fn decode_control(
        &mut self,
        kind: u16,
        flags: u8,
        mut payload: Bytes,
    ) -> Result<Option<Frame>, Error> {
        let frame = match kind {
            TYPE_SYN_STREAM => {
                ensure_len(&payload, 10)?;
                let stream_id = payload.get_u32() & STREAM_ID_MASK;
                let associated_id = payload.get_u32() & STREAM_ID_MASK;
                let priority = payload.get_u8() >> 5;
                let _slot = payload.get_u8();
                let headers = self.decode_headers(&payload)?;
                Frame::SynStream {
                    stream_id,
                    associated_id,
                    priority,
                    flags,
                    headers,
                }
            }
            TYPE_SYN_REPLY => {
                ensure_len(&payload, 4)?;
                let stream_id = payload.get_u32() & STREAM_ID_MASK;
                let headers = self.decode_headers(&payload)?;
                Frame::SynReply {
                    stream_id,
                    flags,
                    headers,
                }
            }
            TYPE_HEADERS => {
                ensure_len(&payload, 4)?;
                let stream_id = payload.get_u32() & STREAM_ID_MASK;
                let headers = self.decode_headers(&payload)?;
                Frame::Headers {
                    stream_id,
                    flags,
                    headers,
                }
            }
            TYPE_RST_STREAM => {
                ensure_len(&payload, 8)?;
                Frame::RstStream {
                    stream_id: payload.get_u32() & STREAM_ID_MASK,
                    status: payload.get_u32().into(),
                }
            }
            TYPE_SETTINGS => {
                ensure_len(&payload, 4)?;
                let count = payload.get_u32() as usize;
                ensure_len(&payload, count.saturating_mul(8))?;
                let entries = (0..count)
                    .map(|_| {
                        let head = payload.get_u32();
                        ((head >> 24) as u8, head & 0x00ff_ffff, payload.get_u32())
                    })
                    .collect();
                Frame::Settings { flags, entries }
            }
            TYPE_PING => {
                ensure_len(&payload, 4)?;
                Frame::Ping {
                    id: payload.get_u32(),
                }
            }
            TYPE_GOAWAY => {
                ensure_len(&payload, 4)?;
                let last_good_stream_id = payload.get_u32() & STREAM_ID_MASK;
                // The status code is optional in some older peers.
                let status = if payload.remaining() >= 4 {
                    payload.get_u32()
                } else {
                    0
                };
                Frame::GoAway {
                    last_good_stream_id,
                    status,
                }
            }
            TYPE_WINDOW_UPDATE => {
                ensure_len(&payload, 8)?;
                Frame::WindowUpdate {
                    stream_id: payload.get_u32() & STREAM_ID_MASK,
                    delta: payload.get_u32() & STREAM_ID_MASK,
                }
            }
            unknown => {
                trace!(kind = unknown, "skipping unknown control frame");
                return Ok(None);
            }
        };
        Ok(Some(frame))
    }

    fn decode_headers(&mut self, block: &[u8]) -> Result<Headers, Error> {
        let raw = self.decompressor.decompress(block)?;
        Headers::decode(&raw)
    }

    fn encode_headers(&mut self, headers: &Headers) -> Result<Vec<u8>, Error> {
        self.compressor.compress(&headers.encode())
    }
}

fn ensure_len(payload: &Bytes, want: usize) -> Result<(), Error> {
    if payload.len() < want {
        return Err(Error::Protocol(format!(
            "control frame too short: {} < {want}",
            payload.len()
        )));
    }
    Ok(())
}

fn put_control_header(dst: &mut BytesMut, kind: u16, flags: u8, len: usize) -> Result<(), Error> {
    if len > MAX_FRAME_LEN {
        return Err(Error::FrameTooLarge(len));
    }
    dst.reserve(FRAME_HEADER_LEN + len);
    dst.put_u16(VERSION | ((CONTROL_BIT as u16) << 8));
    dst.put_u16(kind);
    dst.put_u32(((flags as u32) << 24) | len as u32);
    Ok(())
}

impl Decoder for Codec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Error> {
        loop {
            if src.len() < FRAME_HEADER_LEN {
                return Ok(None);
            }
            let len = u32::from_be_bytes([0, src[5], src[6], src[7]]) as usize;
            if src.len() < FRAME_HEADER_LEN + len {
                src.reserve(FRAME_HEADER_LEN + len - src.len());
                return Ok(None);
            }
            let mut head = src.split_to(FRAME_HEADER_LEN);
            let payload = src.split_to(len).freeze();
            let first = head.get_u32();
            let flags = head.get_u8();

            if first & ((CONTROL_BIT as u32) << 24) == 0 {
                return Ok(Some(Frame::Data {
                    stream_id: first & STREAM_ID_MASK,
                    flags,
                    data: payload,
                }));
            }
            let version = ((first >> 16) & 0x7fff) as u16;
            if version != VERSION {
                return Err(Error::UnsupportedVersion(version));
            }
            if let Some(frame) = self.decode_control(first as u16, flags, payload)? {
                return Ok(Some(frame));
            }
        }
    }
}

impl Encoder<Frame> for Codec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Error> {
        match frame {
            Frame::SynStream {
                stream_id,
                associated_id,
                priority,
                flags,
                headers,
            } => {
                let block = self.encode_headers(&headers)?;
                put_control_header(dst, TYPE_SYN_STREAM, flags, 10 + block.len())?;
                dst.put_u32(stream_id & STREAM_ID_MASK);
                dst.put_u32(associated_id & STREAM_ID_MASK);
                dst.put_u8((priority & 0x07) << 5);
                dst.put_u8(0);
                dst.put_slice(&block);
            }
            Frame::SynReply {
                stream_id,
                flags,
                headers,
            } => {
                let block = self.encode_headers(&headers)?;
                put_control_header(dst, TYPE_SYN_REPLY, flags, 4 + block.len())?;
                dst.put_u32(stream_id & STREAM_ID_MASK);
                dst.put_slice(&block);
            }
            Frame::Headers {
                stream_id,
                flags,
                headers,
            } => {
                let block = self.encode_headers(&headers)?;
                put_control_header(dst, TYPE_HEADERS, flags, 4 + block.len())?;
                dst.put_u32(stream_id & STREAM_ID_MASK);
                dst.put_slice(&block);
            }
            Frame::RstStream { stream_id, status } => {
                put_control_header(dst, TYPE_RST_STREAM, 0, 8)?;
                dst.put_u32(stream_id & STREAM_ID_MASK);
                dst.put_u32(status.into());
            }
            Frame::Settings { flags, entries } => {
                put_control_header(dst, TYPE_SETTINGS, flags, 4 + entries.len() * 8)?;
                dst.put_u32(entries.len() as u32);
                for (entry_flags, id, value) in entries {
                    dst.put_u32(((entry_flags as u32) << 24) | (id & 0x00ff_ffff));
                    dst.put_u32(value);
                }
            }
            Frame::Ping { id } => {
                put_control_header(dst, TYPE_PING, 0, 4)?;
                dst.put_u32(id);
            }
            Frame::GoAway {
                last_good_stream_id,
                status,
            } => {
                put_control_header(dst, TYPE_GOAWAY, 0, 8)?;
                dst.put_u32(last_good_stream_id & STREAM_ID_MASK);
                dst.put_u32(status);
            }
            Frame::WindowUpdate { stream_id, delta } => {
                put_control_header(dst, TYPE_WINDOW_UPDATE, 0, 8)?;
                dst.put_u32(stream_id & STREAM_ID_MASK);
                dst.put_u32(delta & STREAM_ID_MASK);
            }
            Frame::Data {
                stream_id,
                flags,
                data,
            } => {
                if data.len() > MAX_FRAME_LEN {
                    return Err(Error::FrameTooLarge(data.len()));
                }
                dst.reserve(FRAME_HEADER_LEN + data.len());
                dst.put_u32(stream_id & STREAM_ID_MASK);
                dst.put_u32(((flags as u32) << 24) | data.len() as u32);
                dst.put_slice(&data);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port_forward_headers(kind: &str) -> Headers {
        [("streamType", kind), ("port", "9090"), ("requestID", "0")]
            .into_iter()
            .collect()
    }

    #[test]
    fn header_names_are_lowercased() {
        let headers = port_forward_headers("data");
        assert_eq!(headers.get("streamtype"), Some("data"));
        assert_eq!(headers.get("RequestId"), Some("0"));
        assert!(headers.iter().all(|(k, _)| k == k.to_ascii_lowercase()));
    }

    #[test]
    fn data_frame_layout() {
        let mut codec = Codec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(
                Frame::Data {
                    stream_id: 3,
                    flags: FLAG_FIN,
                    data: Bytes::from_static(b"PING"),
                },
                &mut buf,
            )
            .unwrap();
        assert_eq!(&buf[..], b"\x00\x00\x00\x03\x01\x00\x00\x04PING");
    }

    #[test]
    fn ping_frame_layout() {
        let mut codec = Codec::new();
        let mut buf = BytesMut::new();
        codec.encode(Frame::Ping { id: 7 }, &mut buf).unwrap();
        assert_eq!(&buf[..], b"\x80\x03\x00\x06\x00\x00\x00\x04\x00\x00\x00\x07");
    }

    #[test]
    fn header_frames_share_compression_state() {
        let mut tx = Codec::new();
        let mut rx = Codec::new();
        let mut buf = BytesMut::new();
        let frames = vec![
            Frame::SynStream {
                stream_id: 1,
                associated_id: 0,
                priority: 0,
                flags: 0,
                headers: port_forward_headers("error"),
            },
            Frame::SynStream {
                stream_id: 3,
                associated_id: 0,
                priority: 0,
                flags: 0,
                headers: port_forward_headers("data"),
            },
            Frame::SynReply {
                stream_id: 3,
                flags: FLAG_FIN,
                headers: Headers::new(),
            },
        ];
        for f in frames.clone() {
            tx.encode(f, &mut buf).unwrap();
        }
        let mut decoded = Vec::new();
        while let Some(f) = rx.decode(&mut buf).unwrap() {
            decoded.push(f);
        }
        assert_eq!(decoded, frames);
    }

    #[test]
    fn partial_frames_wait_for_more_input() {
        let mut codec = Codec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(
                Frame::RstStream {
                    stream_id: 5,
                    status: RstStatus::Cancel,
                },
                &mut buf,
            )
            .unwrap();
        let mut partial = buf.split_to(10);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(buf);
        assert_eq!(
            codec.decode(&mut partial).unwrap(),
            Some(Frame::RstStream {
                stream_id: 5,
                status: RstStatus::Cancel
            })
        );
    }

    #[test]
    fn unknown_control_frames_are_skipped() {
        let mut codec = Codec::new();
        let mut buf = BytesMut::new();
        // A NOOP (type 5) frame, which SPDY/3 removed.
        buf.put_slice(b"\x80\x03\x00\x05\x00\x00\x00\x00");
        codec.encode(Frame::Ping { id: 2 }, &mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::Ping { id: 2 }));
    }

    #[test]
    fn wrong_version_is_rejected() {
        let mut codec = Codec::new();
        let mut buf = BytesMut::from(&b"\x80\x02\x00\x06\x00\x00\x00\x04\x00\x00\x00\x01"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn rst_status_codes() {
        for code in [1u32, 2, 3, 4, 5, 6, 7, 8, 9, 11, 42] {
            assert_eq!(u32::from(RstStatus::from(code)), code);
        }
        assert_eq!(RstStatus::from(5), RstStatus::Cancel);
    }
}
