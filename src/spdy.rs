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

//! A SPDY/3.1 stream multiplexer, as spoken by the Kubernetes API server for
//! port-forward and exec upgrades.

mod compress;
mod connection;
pub mod frame;
mod stream;

use std::io;

pub use compress::DICTIONARY;
pub use connection::{Connection, Incoming, IncomingStream, Role};
pub use frame::{Frame, Headers, RstStatus};
pub use stream::{Stream, StreamReadHalf, StreamWriteHalf};

pub type StreamId = u32;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("header compression: {0}")]
    Compression(String),
    #[error("unsupported spdy version {0}")]
    UnsupportedVersion(u16),
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
    #[error("stream {0} reset by peer: {1:?}")]
    StreamReset(StreamId, RstStatus),
    #[error("timed out waiting for a reply on stream {0}")]
    StreamTimeout(StreamId),
    #[error("stream ids exhausted")]
    StreamIdsExhausted,
    #[error("connection closed")]
    ConnectionClosed,
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(e) => e,
            Error::ConnectionClosed => io::Error::new(io::ErrorKind::BrokenPipe, e),
            Error::StreamReset(..) => io::Error::new(io::ErrorKind::ConnectionReset, e),
            Error::StreamTimeout(_) => io::Error::new(io::ErrorKind::TimedOut, e),
            e => io::Error::other(e),
        }
    }
}
