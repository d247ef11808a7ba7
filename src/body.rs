// Copyright (c) 2025 The Estaminet developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The request body stream handed to handlers.
//!
//! A body is either length-delimited (`Content-Length`), chunked
//! (`Transfer-Encoding: chunked`), or absent. The stream decodes the
//! framing on the fly and exposes plain content bytes through `read` and
//! `peek`; `read` returning 0 always means a clean end of the body.
//!
//! The underlying socket reader is shared with the connection worker, which
//! needs it back to parse the next request of a keep-alive connection.

use std::fmt;
use std::io;
use std::io::Cursor;
use std::io::Read;
use std::sync::Arc;
use std::sync::Mutex;

use crate::stream::reader::LineError;
use crate::stream::reader::StreamReader;

/// Error while decoding the request body framing.
#[derive(Debug)]
pub enum BodyError {
    /// A chunk-size line did not parse as a base-16 number.
    ChunkInvalidSize,
    /// A chunk was not terminated by CRLF.
    ChunkInvalidEnd,
    /// The connection closed before the declared end of the body.
    UnexpectedEof,
    /// The underlying socket failed.
    Io(io::Error),
}

impl From<io::Error> for BodyError {
    fn from(err: io::Error) -> BodyError {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            BodyError::UnexpectedEof
        } else {
            BodyError::Io(err)
        }
    }
}

impl From<LineError> for BodyError {
    fn from(err: LineError) -> BodyError {
        match err {
            LineError::UnexpectedEof => BodyError::UnexpectedEof,
            LineError::BadLineEnding | LineError::NotUtf8 => BodyError::ChunkInvalidSize,
            LineError::Io(err) => BodyError::Io(err),
        }
    }
}

impl fmt::Display for BodyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BodyError::ChunkInvalidSize => write!(f, "invalid chunk size line"),
            BodyError::ChunkInvalidEnd => write!(f, "chunk not terminated by CRLF"),
            BodyError::UnexpectedEof => write!(f, "connection closed before the end of the body"),
            BodyError::Io(err) => write!(f, "I/O error while reading the body: {}", err),
        }
    }
}

impl std::error::Error for BodyError {}

enum Framing {
    Length(u64),
    Chunked,
    None,
}

/// Streaming view of one request's body.
pub struct RequestBody {
    reader: Arc<Mutex<StreamReader>>,
    framing: Framing,
    // Size of the most recently read chunk header; `Some(0)` marks the
    // terminating chunk. Meaningless in length mode.
    last_chunk_size: Option<u64>,
    // Bytes left in the chunk currently being read.
    chunk_remaining: u64,
    // Content bytes pulled off the wire, including peeked ones.
    decoded: u64,
    // Content bytes handed to callers.
    returned: u64,
    // Socket bytes consumed on behalf of this body, framing included.
    raw_consumed: u64,
    // Decoded bytes waiting because of `peek`.
    peeked: Vec<u8>,
}

impl RequestBody {
    pub(crate) fn new(
        reader: Arc<Mutex<StreamReader>>,
        content_length: Option<u64>,
        chunked: bool,
    ) -> RequestBody {
        let framing = if chunked {
            Framing::Chunked
        } else {
            match content_length {
                Some(len) => Framing::Length(len),
                None => Framing::None,
            }
        };

        RequestBody {
            reader,
            framing,
            last_chunk_size: None,
            chunk_remaining: 0,
            decoded: 0,
            returned: 0,
            raw_consumed: 0,
            peeked: Vec::new(),
        }
    }

    /// A body with no bytes in it, detached from any socket. Handed to
    /// streaming callbacks whose request had no body left.
    pub fn empty() -> RequestBody {
        let reader = StreamReader::new(Cursor::new(Vec::new()), false);
        RequestBody::new(Arc::new(Mutex::new(reader)), None, false)
    }

    /// True once the body has been fully consumed.
    pub fn end_of_stream(&self) -> bool {
        if !self.peeked.is_empty() {
            return false;
        }
        match self.framing {
            Framing::Length(total) => self.decoded == total,
            Framing::Chunked => self.last_chunk_size == Some(0),
            Framing::None => true,
        }
    }

    /// Declared `Content-Length`, if the body is length-delimited.
    pub fn reported_length(&self) -> Option<u64> {
        match self.framing {
            Framing::Length(total) => Some(total),
            _ => None,
        }
    }

    #[inline]
    pub fn is_chunked(&self) -> bool {
        matches!(self.framing, Framing::Chunked)
    }

    /// Content bytes handed out so far.
    #[inline]
    pub fn content_bytes_returned(&self) -> u64 {
        self.returned
    }

    /// Socket bytes consumed so far, chunk framing included.
    #[inline]
    pub fn raw_bytes_consumed(&self) -> u64 {
        self.raw_consumed
    }

    // Decodes up to `buf.len()` content bytes straight from the socket,
    // bypassing the peek buffer. Returns 0 at the end of the body.
    fn read_from_wire(&mut self, buf: &mut [u8]) -> Result<usize, BodyError> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.framing {
            Framing::None => Ok(0),
            Framing::Length(total) => {
                let remaining = total - self.decoded;
                if remaining == 0 {
                    return Ok(0);
                }
                let want = (remaining as usize).min(buf.len());
                let mut reader = self.reader.lock().unwrap();
                let before = reader.consumed();
                let got = reader.read(&mut buf[..want])?;
                self.raw_consumed += reader.consumed() - before;
                drop(reader);
                if got == 0 {
                    return Err(BodyError::UnexpectedEof);
                }
                self.decoded += got as u64;
                Ok(got)
            }
            Framing::Chunked => {
                if self.chunk_remaining == 0 {
                    if self.last_chunk_size == Some(0) {
                        return Ok(0);
                    }
                    if !self.read_chunk_header()? {
                        return Ok(0);
                    }
                }
                let want = (self.chunk_remaining as usize).min(buf.len());
                let mut reader = self.reader.lock().unwrap();
                let before = reader.consumed();
                let got = reader.read(&mut buf[..want])?;
                self.raw_consumed += reader.consumed() - before;
                if got == 0 {
                    return Err(BodyError::UnexpectedEof);
                }
                self.chunk_remaining -= got as u64;
                self.decoded += got as u64;
                if self.chunk_remaining == 0 {
                    let mut end = [0u8; 2];
                    let before = reader.consumed();
                    reader.read_exact(&mut end)?;
                    self.raw_consumed += reader.consumed() - before;
                    if &end != b"\r\n" {
                        return Err(BodyError::ChunkInvalidEnd);
                    }
                }
                Ok(got)
            }
        }
    }

    // Reads the next chunk-size line. Returns false when the terminating
    // zero chunk (and its trailer section) has been consumed.
    fn read_chunk_header(&mut self) -> Result<bool, BodyError> {
        let mut reader = self.reader.lock().unwrap();
        let before = reader.consumed();
        let line = match reader.read_line()? {
            Some(line) => line,
            None => return Err(BodyError::UnexpectedEof),
        };
        // Chunk extensions after `;` are tolerated and ignored.
        let size_token = line.split(';').next().unwrap_or("").trim();
        let size = match u64::from_str_radix(size_token, 16) {
            Ok(size) => size,
            Err(_) => return Err(BodyError::ChunkInvalidSize),
        };
        self.last_chunk_size = Some(size);
        if size == 0 {
            // Discard the trailer section up to its blank line.
            loop {
                match reader.read_line()? {
                    Some(line) if line.is_empty() => break,
                    Some(_) => continue,
                    None => return Err(BodyError::UnexpectedEof),
                }
            }
            self.raw_consumed += reader.consumed() - before;
            return Ok(false);
        }
        self.chunk_remaining = size;
        self.raw_consumed += reader.consumed() - before;
        Ok(true)
    }

    /// Reads up to `buf.len()` content bytes. Returns 0 at the clean end of
    /// the body.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, BodyError> {
        if !self.peeked.is_empty() {
            let n = self.peeked.len().min(buf.len());
            buf[..n].copy_from_slice(&self.peeked[..n]);
            self.peeked.drain(..n);
            self.returned += n as u64;
            return Ok(n);
        }
        let got = self.read_from_wire(buf)?;
        self.returned += got as u64;
        Ok(got)
    }

    /// Returns up to `n` content bytes without consuming them. A shorter
    /// slice is only returned at the end of the body.
    pub fn peek(&mut self, n: usize) -> Result<&[u8], BodyError> {
        let mut scratch = [0u8; 1024];
        while self.peeked.len() < n {
            let want = (n - self.peeked.len()).min(scratch.len());
            let got = self.read_from_wire(&mut scratch[..want])?;
            if got == 0 {
                break;
            }
            self.peeked.extend_from_slice(&scratch[..got]);
        }
        Ok(&self.peeked[..self.peeked.len().min(n)])
    }

    /// Reads the whole remaining body into a `Vec`.
    pub fn read_to_vec(&mut self) -> Result<Vec<u8>, BodyError> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let got = self.read(&mut buf)?;
            if got == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..got]);
        }
    }

    /// Reads and discards whatever is left of the body, so that the next
    /// request of the connection starts at the right byte.
    pub fn drain(&mut self) -> Result<(), BodyError> {
        self.peeked.clear();
        let mut buf = [0u8; 4096];
        loop {
            if self.read_from_wire(&mut buf)? == 0 {
                return Ok(());
            }
        }
    }
}

impl Read for RequestBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        RequestBody::read(self, buf).map_err(|err| match err {
            BodyError::Io(err) => err,
            other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::BodyError;
    use super::RequestBody;
    use crate::stream::reader::StreamReader;
    use std::io::Cursor;
    use std::sync::Arc;
    use std::sync::Mutex;

    fn shared(bytes: &[u8]) -> Arc<Mutex<StreamReader>> {
        Arc::new(Mutex::new(StreamReader::new(
            Cursor::new(bytes.to_vec()),
            false,
        )))
    }

    #[test]
    fn length_mode_clamps_and_ends() {
        let reader = shared(b"hello worldNEXT");
        let mut body = RequestBody::new(reader.clone(), Some(11), false);
        assert_eq!(body.read_to_vec().unwrap(), b"hello world");
        assert!(body.end_of_stream());
        let mut buf = [0u8; 8];
        assert_eq!(body.read(&mut buf).unwrap(), 0);

        // The bytes of the next request are untouched.
        let mut rest = [0u8; 4];
        reader.lock().unwrap().read_exact(&mut rest).unwrap();
        assert_eq!(&rest, b"NEXT");
    }

    #[test]
    fn chunked_decode() {
        let reader = shared(b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\nNEXT");
        let mut body = RequestBody::new(reader.clone(), None, true);
        assert_eq!(body.read_to_vec().unwrap(), b"hello world");
        assert!(body.end_of_stream());

        let mut rest = [0u8; 4];
        reader.lock().unwrap().read_exact(&mut rest).unwrap();
        assert_eq!(&rest, b"NEXT");
    }

    #[test]
    fn chunked_empty_body() {
        let reader = shared(b"0\r\n\r\n");
        let mut body = RequestBody::new(reader, None, true);
        assert_eq!(body.read_to_vec().unwrap(), b"");
        assert!(body.end_of_stream());
        assert_eq!(body.content_bytes_returned(), 0);
    }

    #[test]
    fn chunked_invalid_size() {
        let reader = shared(b"zz\r\nhello\r\n");
        let mut body = RequestBody::new(reader, None, true);
        let mut buf = [0u8; 8];
        assert!(matches!(
            body.read(&mut buf),
            Err(BodyError::ChunkInvalidSize)
        ));
    }

    #[test]
    fn chunked_missing_crlf_after_data() {
        let reader = shared(b"5\r\nhelloXX0\r\n\r\n");
        let mut body = RequestBody::new(reader, None, true);
        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        let err = loop {
            match body.read(&mut buf) {
                Ok(0) => panic!("expected ChunkInvalidEnd"),
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(err) => break err,
            }
        };
        assert!(matches!(err, BodyError::ChunkInvalidEnd));
    }

    #[test]
    fn peek_then_read() {
        let reader = shared(b"5\r\nhello\r\n0\r\n\r\n");
        let mut body = RequestBody::new(reader, None, true);
        assert_eq!(body.peek(3).unwrap(), b"hel");
        assert_eq!(body.content_bytes_returned(), 0);
        assert_eq!(body.read_to_vec().unwrap(), b"hello");
        assert_eq!(body.content_bytes_returned(), 5);
    }

    #[test]
    fn drain_skips_to_next_request() {
        let reader = shared(b"3\r\nabc\r\n0\r\n\r\nGET / HTTP/1.1\r\n");
        let mut body = RequestBody::new(reader.clone(), None, true);
        body.drain().unwrap();
        assert!(body.end_of_stream());
        let line = reader.lock().unwrap().read_line().unwrap().unwrap();
        assert_eq!(line, "GET / HTTP/1.1");
    }

    #[test]
    fn raw_bytes_include_framing() {
        let reader = shared(b"5\r\nhello\r\n0\r\n\r\n");
        let mut body = RequestBody::new(reader, None, true);
        body.drain().unwrap();
        assert_eq!(body.raw_bytes_consumed(), 15);
    }

    #[test]
    fn premature_eof_in_length_mode() {
        let reader = shared(b"abc");
        let mut body = RequestBody::new(reader, Some(10), false);
        let mut buf = [0u8; 16];
        assert_eq!(body.read(&mut buf).unwrap(), 3);
        assert!(matches!(body.read(&mut buf), Err(BodyError::UnexpectedEof)));
    }
}
