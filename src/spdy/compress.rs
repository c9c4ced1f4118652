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

//! Header block compression. SPDY/3 runs one zlib stream per direction for the
//! lifetime of a connection, primed with a fixed dictionary and sync-flushed after
//! every header block, so the state here must outlive individual frames.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use once_cell::sync::Lazy;

use super::Error;

// Words are stored length-prefixed in the dictionary, the tail is raw bytes.
const DICTIONARY_WORDS: &[&str] = &[
    "options",
    "head",
    "post",
    "put",
    "delete",
    "trace",
    "accept",
    "accept-charset",
    "accept-encoding",
    "accept-language",
    "accept-ranges",
    "age",
    "allow",
    "authorization",
    "cache-control",
    "connection",
    "content-base",
    "content-encoding",
    "content-language",
    "content-length",
    "content-location",
    "content-md5",
    "content-range",
    "content-type",
    "date",
    "etag",
    "expect",
    "expires",
    "from",
    "host",
    "if-match",
    "if-modified-since",
    "if-none-match",
    "if-range",
    "if-unmodified-since",
    "last-modified",
    "location",
    "max-forwards",
    "pragma",
    "proxy-authenticate",
    "proxy-authorization",
    "range",
    "referer",
    "retry-after",
    "server",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "user-agent",
    "vary",
    "via",
    "warning",
    "www-authenticate",
    "method",
    "get",
    "status",
    "200 OK",
    "version",
    "HTTP/1.1",
    "url",
    "public",
    "set-cookie",
    "keep-alive",
    "origin",
];

const DICTIONARY_TAIL: &str = concat!(
    "100101201202205206300302303304305306307402405406407408409410411412413414415416417502504505",
    "203 Non-Authoritative Information",
    "204 No Content",
    "301 Moved Permanently",
    "400 Bad Request",
    "401 Unauthorized",
    "403 Forbidden",
    "404 Not Found",
    "500 Internal Server Error",
    "501 Not Implemented",
    "503 Service Unavailable",
    "Jan Feb Mar Apr May Jun Jul Aug Sept Oct Nov Dec",
    " 00:00:00",
    " Mon, Tue, Wed, Thu, Fri, Sat, Sun, GMT",
    "chunked,text/html,image/png,image/jpg,image/gif,application/xml,application/xhtml+xml,",
    "text/plain,text/javascript,public",
    "privatemax-age=gzip,deflate,sdchcharset=utf-8charset=iso-8859-1,utf-,*,enq=0.",
);

/// The SPDY/3 header compression dictionary.
pub static DICTIONARY: Lazy<Vec<u8>> = Lazy::new(|| {
    let mut dict = Vec::with_capacity(1423);
    for word in DICTIONARY_WORDS {
        dict.extend_from_slice(&(word.len() as u32).to_be_bytes());
        dict.extend_from_slice(word.as_bytes());
    }
    dict.extend_from_slice(DICTIONARY_TAIL.as_bytes());
    dict
});

pub struct HeaderCompressor {
    deflate: Compress,
    primed: bool,
}

impl HeaderCompressor {
    pub fn new() -> Self {
        HeaderCompressor {
            deflate: Compress::new(Compression::default(), true),
            primed: false,
        }
    }

    /// Compresses one header block, ending it on a byte boundary so the peer can
    /// decode it without waiting for more input.
    pub fn compress(&mut self, block: &[u8]) -> Result<Vec<u8>, Error> {
        if !self.primed {
            self.deflate
                .set_dictionary(&DICTIONARY)
                .map_err(|e| Error::Compression(e.to_string()))?;
            self.primed = true;
        }
        let mut out = Vec::with_capacity(block.len() + 64);
        let mut input = block;
        loop {
            let before = self.deflate.total_in();
            self.deflate
                .compress_vec(input, &mut out, FlushCompress::Sync)
                .map_err(|e| Error::Compression(e.to_string()))?;
            let consumed = (self.deflate.total_in() - before) as usize;
            input = &input[consumed..];
            // Spare output capacity means the flush completed.
            if input.is_empty() && out.len() < out.capacity() {
                return Ok(out);
            }
            out.reserve(out.capacity().max(64));
        }
    }
}

impl Default for HeaderCompressor {
    fn default() -> Self {
        Self::new()
    }
}

pub struct HeaderDecompressor {
    inflate: Decompress,
}

impl HeaderDecompressor {
    pub fn new() -> Self {
        HeaderDecompressor {
            inflate: Decompress::new(true),
        }
    }

    /// Decompresses one header block. The block must be complete: SPDY peers
    /// sync-flush every block so all of its input is consumable at once.
    pub fn decompress(&mut self, block: &[u8]) -> Result<Vec<u8>, Error> {
        let mut out = Vec::with_capacity(block.len() * 4 + 64);
        let mut input = block;
        loop {
            let before = self.inflate.total_in();
            let produced_before = out.len();
            let status = match self
                .inflate
                .decompress_vec(input, &mut out, FlushDecompress::Sync)
            {
                Ok(status) => status,
                Err(e) if e.needs_dictionary().is_some() => {
                    let consumed = (self.inflate.total_in() - before) as usize;
                    input = &input[consumed..];
                    self.inflate
                        .set_dictionary(&DICTIONARY)
                        .map_err(|e| Error::Compression(e.to_string()))?;
                    continue;
                }
                Err(e) => return Err(Error::Compression(e.to_string())),
            };
            let consumed = (self.inflate.total_in() - before) as usize;
            input = &input[consumed..];
            if status == Status::StreamEnd {
                return Err(Error::Compression(
                    "peer ended the header compression stream".to_string(),
                ));
            }
            let spare = out.len() < out.capacity();
            if input.is_empty() && spare {
                return Ok(out);
            }
            if consumed == 0 && out.len() == produced_before && spare {
                return Err(Error::Compression("truncated header block".to_string()));
            }
            out.reserve(out.capacity().max(64));
        }
    }
}

impl Default for HeaderDecompressor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adler32(data: &[u8]) -> u32 {
        let (mut a, mut b) = (1u32, 0u32);
        for byte in data {
            a = (a + *byte as u32) % 65521;
            b = (b + a) % 65521;
        }
        (b << 16) | a
    }

    #[test]
    fn dictionary_matches_spdy3() {
        assert_eq!(DICTIONARY.len(), 1423);
        assert_eq!(adler32(&DICTIONARY), 0xe3c6a7c2);
    }

    #[test]
    fn blocks_share_one_stream() {
        let mut tx = HeaderCompressor::new();
        let mut rx = HeaderDecompressor::new();
        let blocks: [&[u8]; 3] = [
            b"streamtype error port 8080",
            b"streamtype data port 8080",
            b"",
        ];
        for block in blocks {
            let wire = tx.compress(block).unwrap();
            assert_eq!(rx.decompress(&wire).unwrap(), block);
        }
    }

    #[test]
    fn large_block() {
        let mut tx = HeaderCompressor::new();
        let mut rx = HeaderDecompressor::new();
        let block: Vec<u8> = (0..64 * 1024).map(|i| (i * 7 % 251) as u8).collect();
        let wire = tx.compress(&block).unwrap();
        assert_eq!(rx.decompress(&wire).unwrap(), block);
    }

    #[test]
    fn garbage_is_rejected() {
        let mut rx = HeaderDecompressor::new();
        assert!(rx.decompress(b"\xff\xff\xff\xff\xff\xff").is_err());
    }
}
