// Copyright (c) 2025 The Estaminet developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Writes to a client socket, with optional chunked transfer framing.
//!
//! The writer starts in plain mode. Once the response headers have been
//! written, the worker switches it to chunked mode when the body length is
//! unknown; every `write` then emits `HEX-SIZE\r\n<bytes>\r\n` frames, and
//! `finish` emits the `0\r\n\r\n` terminator. Large writes are split when a
//! maximum chunk size is configured.

use std::io;
use std::io::Write;

/// Socket writer used for one response.
pub struct StreamWriter {
    inner: Box<dyn Write + Send>,
    chunked: bool,
    max_chunk_size: Option<usize>,
    finished: bool,
}

impl StreamWriter {
    pub fn new<W>(inner: W) -> StreamWriter
    where
        W: Write + Send + 'static,
    {
        StreamWriter {
            inner: Box::new(inner),
            chunked: false,
            max_chunk_size: None,
            finished: false,
        }
    }

    /// Switches the writer to chunked framing for the rest of the body.
    pub fn set_chunked(&mut self, max_chunk_size: Option<usize>) {
        self.chunked = true;
        self.max_chunk_size = max_chunk_size;
        self.finished = false;
    }

    #[inline]
    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    /// Writes bytes without any framing, regardless of mode. Used for the
    /// status line and the headers block.
    pub fn write_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.inner.write_all(bytes)
    }

    /// Writes body bytes, applying chunked framing when enabled. An empty
    /// slice is a no-op in chunked mode since a zero-sized chunk would
    /// terminate the body.
    pub fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        if !self.chunked {
            return self.inner.write_all(bytes);
        }
        if bytes.is_empty() {
            return Ok(());
        }
        let max = self.max_chunk_size.unwrap_or(usize::MAX).max(1);
        for piece in bytes.chunks(max) {
            let head = format!("{:x}\r\n", piece.len());
            self.inner.write_all(head.as_bytes())?;
            self.inner.write_all(piece)?;
            self.inner.write_all(b"\r\n")?;
        }
        Ok(())
    }

    /// Terminates a chunked body with `0\r\n\r\n`. Idempotent; a no-op in
    /// plain mode.
    pub fn finish(&mut self) -> io::Result<()> {
        if self.chunked && !self.finished {
            self.inner.write_all(b"0\r\n\r\n")?;
            self.finished = true;
        }
        self.inner.flush()
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::StreamWriter;
    use std::sync::Arc;
    use std::sync::Mutex;

    #[derive(Clone)]
    struct Sink(Arc<Mutex<Vec<u8>>>);

    impl Sink {
        fn new() -> Sink {
            Sink(Arc::new(Mutex::new(Vec::new())))
        }

        fn contents(&self) -> Vec<u8> {
            self.0.lock().unwrap().clone()
        }
    }

    impl std::io::Write for Sink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn plain_mode_passes_through() {
        let sink = Sink::new();
        let mut w = StreamWriter::new(sink.clone());
        w.write(b"hello").unwrap();
        w.finish().unwrap();
        assert_eq!(sink.contents(), b"hello");
    }

    #[test]
    fn chunked_framing_and_terminator() {
        let sink = Sink::new();
        let mut w = StreamWriter::new(sink.clone());
        w.set_chunked(None);
        w.write(b"hello").unwrap();
        w.finish().unwrap();
        assert_eq!(sink.contents(), b"5\r\nhello\r\n0\r\n\r\n");
    }

    #[test]
    fn chunked_split_by_max_size() {
        let sink = Sink::new();
        let mut w = StreamWriter::new(sink.clone());
        w.set_chunked(Some(4));
        w.write(b"abcdefghij").unwrap();
        w.finish().unwrap();
        assert_eq!(
            sink.contents(),
            b"4\r\nabcd\r\n4\r\nefgh\r\n2\r\nij\r\n0\r\n\r\n"
        );
    }

    #[test]
    fn empty_chunked_write_is_not_a_terminator() {
        let sink = Sink::new();
        let mut w = StreamWriter::new(sink.clone());
        w.set_chunked(None);
        w.write(b"").unwrap();
        w.write(b"x").unwrap();
        w.finish().unwrap();
        assert_eq!(sink.contents(), b"1\r\nx\r\n0\r\n\r\n");
    }

    #[test]
    fn finish_is_idempotent() {
        let sink = Sink::new();
        let mut w = StreamWriter::new(sink.clone());
        w.set_chunked(None);
        w.write(b"x").unwrap();
        w.finish().unwrap();
        w.finish().unwrap();
        assert_eq!(sink.contents(), b"1\r\nx\r\n0\r\n\r\n");
    }
}
