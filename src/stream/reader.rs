// Copyright (c) 2025 The Estaminet developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Buffered reads from a client socket.
//!
//! The reader supports three access patterns on top of a raw socket:
//! bounded byte reads, peeking ahead without consuming, and UTF-8 line
//! reads terminated by CRLF. The peek cursor never falls behind the read
//! cursor; peeked bytes stay buffered until a `read` consumes them.
//!
//! Line endings are strict by default: a header or chunk-size line must end
//! with `\r\n`. In lenient mode a bare `\n` also ends the line; once a
//! bare-LF line has been seen, a stray `\r` left over at the end of a later
//! line is tolerated as well.

use std::fmt;
use std::io;
use std::io::Read;

const FILL_CHUNK: usize = 4096;

/// Error produced while reading a protocol line.
#[derive(Debug)]
pub enum LineError {
    /// The connection closed before the line terminator.
    UnexpectedEof,
    /// A bare `\n` (or stray `\r`) in strict mode.
    BadLineEnding,
    /// The line is not valid UTF-8.
    NotUtf8,
    /// The underlying socket failed.
    Io(io::Error),
}

impl From<io::Error> for LineError {
    #[inline]
    fn from(err: io::Error) -> LineError {
        LineError::Io(err)
    }
}

impl fmt::Display for LineError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LineError::UnexpectedEof => write!(f, "connection closed in the middle of a line"),
            LineError::BadLineEnding => write!(f, "line not terminated by CRLF"),
            LineError::NotUtf8 => write!(f, "line is not valid UTF-8"),
            LineError::Io(err) => write!(f, "I/O error while reading a line: {}", err),
        }
    }
}

impl std::error::Error for LineError {}

/// Buffered reader over a client socket.
pub struct StreamReader {
    inner: Box<dyn Read + Send>,
    buffer: Vec<u8>,
    // Read cursor within `buffer`. Bytes before it are already consumed.
    pos: usize,
    // Total bytes handed out or discarded, framing included.
    consumed: u64,
    lenient: bool,
    saw_bare_lf: bool,
    eof: bool,
}

impl StreamReader {
    pub fn new<R>(inner: R, lenient: bool) -> StreamReader
    where
        R: Read + Send + 'static,
    {
        StreamReader {
            inner: Box::new(inner),
            buffer: Vec::with_capacity(FILL_CHUNK),
            pos: 0,
            consumed: 0,
            lenient,
            saw_bare_lf: false,
            eof: false,
        }
    }

    /// Total number of bytes consumed from the socket so far.
    #[inline]
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    #[inline]
    fn buffered(&self) -> usize {
        self.buffer.len() - self.pos
    }

    // Reads once from the socket into the buffer. Returns the number of new
    // bytes; 0 means end-of-stream.
    fn fill_once(&mut self) -> io::Result<usize> {
        if self.eof {
            return Ok(0);
        }
        // Compact once the consumed prefix dominates the buffer.
        if self.pos > FILL_CHUNK {
            self.buffer.drain(..self.pos);
            self.pos = 0;
        }
        let old_len = self.buffer.len();
        self.buffer.resize(old_len + FILL_CHUNK, 0);
        match self.inner.read(&mut self.buffer[old_len..]) {
            Ok(n) => {
                self.buffer.truncate(old_len + n);
                if n == 0 {
                    self.eof = true;
                }
                Ok(n)
            }
            Err(err) => {
                self.buffer.truncate(old_len);
                Err(err)
            }
        }
    }

    /// Returns up to `n` bytes without advancing the read cursor. Shorter
    /// slices are only returned at end-of-stream.
    pub fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        while self.buffered() < n {
            if self.fill_once()? == 0 {
                break;
            }
        }
        let avail = self.buffered().min(n);
        Ok(&self.buffer[self.pos..self.pos + avail])
    }

    /// Reads up to `buf.len()` bytes. Returns 0 only at end-of-stream.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.buffered() == 0 && self.fill_once()? == 0 {
            return Ok(0);
        }
        let n = self.buffered().min(buf.len());
        buf[..n].copy_from_slice(&self.buffer[self.pos..self.pos + n]);
        self.pos += n;
        self.consumed += n as u64;
        Ok(n)
    }

    /// Reads exactly `buf.len()` bytes or fails with `UnexpectedEof`.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let n = self.read(&mut buf[done..])?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid-read",
                ));
            }
            done += n;
        }
        Ok(())
    }

    /// Reads one protocol line, without its terminator.
    ///
    /// Returns `Ok(None)` if the stream is already at end-of-stream, and
    /// `UnexpectedEof` if it ends in the middle of a line.
    pub fn read_line(&mut self) -> Result<Option<String>, LineError> {
        // Find the `\n`, pulling more bytes as needed.
        let nl = loop {
            if let Some(off) = memchr::memchr(b'\n', &self.buffer[self.pos..]) {
                break off;
            }
            if self.fill_once()? == 0 {
                if self.buffered() == 0 {
                    return Ok(None);
                }
                return Err(LineError::UnexpectedEof);
            }
        };

        let raw_len = nl + 1;
        let line = &self.buffer[self.pos..self.pos + nl];
        let line = if line.last() == Some(&b'\r') {
            &line[..line.len() - 1]
        } else {
            if !self.lenient {
                return Err(LineError::BadLineEnding);
            }
            self.saw_bare_lf = true;
            line
        };

        // A stray CR at the end of a CRLF-stripped line can only come from
        // a `\r\r\n` sequence; accept it only once a bare LF set lenient
        // behaviour in motion.
        let line = if line.last() == Some(&b'\r') {
            if !(self.lenient && self.saw_bare_lf) {
                return Err(LineError::BadLineEnding);
            }
            &line[..line.len() - 1]
        } else {
            line
        };

        let text = match std::str::from_utf8(line) {
            Ok(s) => s.to_owned(),
            Err(_) => return Err(LineError::NotUtf8),
        };
        self.pos += raw_len;
        self.consumed += raw_len as u64;
        Ok(Some(text))
    }

    /// Reads and discards exactly `n` bytes.
    pub fn skip(&mut self, mut n: u64) -> io::Result<()> {
        let mut scratch = [0u8; 1024];
        while n > 0 {
            let want = (n as usize).min(scratch.len());
            let got = self.read(&mut scratch[..want])?;
            if got == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid-skip",
                ));
            }
            n -= got as u64;
        }
        Ok(())
    }
}
