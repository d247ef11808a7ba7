// Copyright (c) 2025 The Estaminet developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Parsing of `multipart/form-data` request bodies.
//!
//! Parts are read in a streaming fashion: file parts (those with a
//! `filename`) go straight to a temp file under the server's upload
//! directory without ever holding the whole file in memory, other parts
//! become plain form fields. The temp files are owned by the request and
//! vanish with it unless a handler persists them.

use std::fmt;
use std::io;
use std::io::Write;
use std::path::Path;

use memchr::memmem;

use crate::body::BodyError;
use crate::body::RequestBody;
use crate::request::UploadedFile;

const FILL_CHUNK: usize = 8192;

/// Error while decoding a multipart body.
#[derive(Debug)]
pub enum MultipartError {
    /// The body ended before the closing boundary, or a part was not
    /// shaped like a part.
    Malformed(&'static str),
    /// The body framing itself failed underneath.
    Body(BodyError),
    /// Writing a part to its temp file failed.
    Io(io::Error),
}

impl From<BodyError> for MultipartError {
    fn from(err: BodyError) -> MultipartError {
        MultipartError::Body(err)
    }
}

impl From<io::Error> for MultipartError {
    fn from(err: io::Error) -> MultipartError {
        MultipartError::Io(err)
    }
}

impl fmt::Display for MultipartError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MultipartError::Malformed(what) => write!(f, "malformed multipart body: {}", what),
            MultipartError::Body(err) => write!(f, "multipart body framing error: {}", err),
            MultipartError::Io(err) => write!(f, "I/O error while storing a part: {}", err),
        }
    }
}

impl std::error::Error for MultipartError {}

/// Everything extracted from one multipart body.
pub(crate) struct MultipartIntake {
    pub files: Vec<UploadedFile>,
    pub fields: Vec<(String, String)>,
}

// Incremental scanner state: the body is pulled into `buf` chunk by chunk
// and consumed from the front.
struct Scanner<'a> {
    body: &'a mut RequestBody,
    buf: Vec<u8>,
    eof: bool,
}

impl<'a> Scanner<'a> {
    fn fill(&mut self) -> Result<usize, MultipartError> {
        if self.eof {
            return Ok(0);
        }
        let mut chunk = [0u8; FILL_CHUNK];
        let got = self.body.read(&mut chunk)?;
        if got == 0 {
            self.eof = true;
        }
        self.buf.extend_from_slice(&chunk[..got]);
        Ok(got)
    }

    fn ensure(&mut self, n: usize) -> Result<(), MultipartError> {
        while self.buf.len() < n {
            if self.fill()? == 0 {
                return Err(MultipartError::Malformed("truncated part"));
            }
        }
        Ok(())
    }

    // Reads one CRLF line off the front of the buffer.
    fn read_line(&mut self) -> Result<String, MultipartError> {
        loop {
            if let Some(pos) = memmem::find(&self.buf, b"\r\n") {
                let line = String::from_utf8_lossy(&self.buf[..pos]).into_owned();
                self.buf.drain(..pos + 2);
                return Ok(line);
            }
            if self.fill()? == 0 {
                return Err(MultipartError::Malformed("truncated part headers"));
            }
        }
    }
}

/// Reads every part of the body. `tmp_dir` must already exist.
pub(crate) fn read_parts(
    body: &mut RequestBody,
    boundary: &str,
    tmp_dir: &Path,
) -> Result<MultipartIntake, MultipartError> {
    // The delimiter is the boundary preceded by CRLF; seeding the buffer
    // with a synthetic CRLF lets a body that opens directly with
    // `--boundary` match it too.
    let delimiter = format!("\r\n--{}", boundary).into_bytes();
    let mut scanner = Scanner { body, buf: b"\r\n".to_vec(), eof: false };

    // Skip the preamble up to the first boundary.
    loop {
        if let Some(pos) = memmem::find(&scanner.buf, &delimiter) {
            scanner.buf.drain(..pos + delimiter.len());
            break;
        }
        let discard = scanner.buf.len().saturating_sub(delimiter.len() - 1);
        scanner.buf.drain(..discard);
        if scanner.fill()? == 0 {
            return Err(MultipartError::Malformed("no boundary found"));
        }
    }

    let mut files = Vec::new();
    let mut fields = Vec::new();

    loop {
        scanner.ensure(2)?;
        if scanner.buf.starts_with(b"--") {
            // Closing boundary; whatever epilogue follows is discarded so
            // the connection stays aligned on the next request.
            scanner.body.drain()?;
            return Ok(MultipartIntake { files, fields });
        }
        if !scanner.buf.starts_with(b"\r\n") {
            return Err(MultipartError::Malformed("garbage after boundary"));
        }
        scanner.buf.drain(..2);

        // Part headers.
        let mut name = None;
        let mut filename = None;
        let mut content_type = None;
        loop {
            let line = scanner.read_line()?;
            if line.is_empty() {
                break;
            }
            let lower = line.to_ascii_lowercase();
            if lower.starts_with("content-disposition:") {
                let (n, f) = parse_disposition(&line);
                name = n;
                filename = f;
            } else if lower.starts_with("content-type:") {
                content_type = Some(line["content-type:".len()..].trim().to_owned());
            }
        }

        let field_name = name.unwrap_or_default();
        if let Some(filename) = filename {
            let mut file = tempfile::Builder::new()
                .prefix("part-")
                .tempfile_in(tmp_dir)?;
            let size = stream_part_data(&mut scanner, &delimiter, &mut |bytes| {
                file.write_all(bytes)
            })?;
            file.flush()?;
            files.push(UploadedFile {
                field_name,
                original_name: if filename.is_empty() { None } else { Some(filename) },
                content_type,
                file,
                size,
            });
        } else {
            let mut value = Vec::new();
            stream_part_data(&mut scanner, &delimiter, &mut |bytes| {
                value.extend_from_slice(bytes);
                Ok(())
            })?;
            fields.push((field_name, String::from_utf8_lossy(&value).into_owned()));
        }
    }
}

// Feeds the data of the current part to `sink` until the next delimiter,
// which is consumed. Returns the part size.
fn stream_part_data(
    scanner: &mut Scanner,
    delimiter: &[u8],
    sink: &mut dyn FnMut(&[u8]) -> io::Result<()>,
) -> Result<u64, MultipartError> {
    let mut written = 0u64;
    loop {
        if let Some(pos) = memmem::find(&scanner.buf, delimiter) {
            sink(&scanner.buf[..pos])?;
            written += pos as u64;
            scanner.buf.drain(..pos + delimiter.len());
            return Ok(written);
        }
        // Everything but a potential delimiter prefix at the tail is
        // final part data.
        let safe = scanner.buf.len().saturating_sub(delimiter.len() - 1);
        if safe > 0 {
            sink(&scanner.buf[..safe])?;
            written += safe as u64;
            scanner.buf.drain(..safe);
        }
        if scanner.fill()? == 0 {
            return Err(MultipartError::Malformed("part not terminated by a boundary"));
        }
    }
}

// Pulls `name` and `filename` out of a Content-Disposition line.
fn parse_disposition(line: &str) -> (Option<String>, Option<String>) {
    let mut name = None;
    let mut filename = None;
    for fragment in line.split(';').skip(1) {
        let fragment = fragment.trim();
        if let Some((key, value)) = fragment.split_once('=') {
            let value = value.trim().trim_matches('"').to_owned();
            match key.trim().to_ascii_lowercase().as_str() {
                "name" => name = Some(value),
                "filename" => filename = Some(value),
                _ => {}
            }
        }
    }
    (name, filename)
}

#[cfg(test)]
mod tests {
    use super::read_parts;
    use super::MultipartError;
    use crate::body::RequestBody;
    use crate::stream::reader::StreamReader;
    use std::io::Cursor;
    use std::sync::Arc;
    use std::sync::Mutex;

    fn body_from(bytes: &[u8]) -> RequestBody {
        let reader = Arc::new(Mutex::new(StreamReader::new(
            Cursor::new(bytes.to_vec()),
            false,
        )));
        RequestBody::new(reader, Some(bytes.len() as u64), false)
    }

    fn sample_body() -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(b"--XYZ\r\n");
        body.extend_from_slice(b"Content-Disposition: form-data; name=\"caption\"\r\n\r\n");
        body.extend_from_slice(b"a picture\r\n");
        body.extend_from_slice(b"--XYZ\r\n");
        body.extend_from_slice(
            b"Content-Disposition: form-data; name=\"photo\"; filename=\"cat.png\"\r\n",
        );
        body.extend_from_slice(b"Content-Type: image/png\r\n\r\n");
        body.extend_from_slice(b"PNGDATA\r\nMORE");
        body.extend_from_slice(b"\r\n--XYZ--\r\n");
        body
    }

    #[test]
    fn fields_and_files_are_separated() {
        let dir = tempfile::tempdir().unwrap();
        let mut body = body_from(&sample_body());
        let intake = read_parts(&mut body, "XYZ", dir.path()).unwrap();

        assert_eq!(
            intake.fields,
            vec![("caption".to_owned(), "a picture".to_owned())]
        );
        assert_eq!(intake.files.len(), 1);
        let file = &intake.files[0];
        assert_eq!(file.field_name(), "photo");
        assert_eq!(file.original_name(), Some("cat.png"));
        assert_eq!(file.content_type(), Some("image/png"));
        assert_eq!(file.size(), 13);
        assert_eq!(std::fs::read(file.path()).unwrap(), b"PNGDATA\r\nMORE");
    }

    #[test]
    fn temp_file_vanishes_with_the_upload() {
        let dir = tempfile::tempdir().unwrap();
        let mut body = body_from(&sample_body());
        let intake = read_parts(&mut body, "XYZ", dir.path()).unwrap();
        let path = intake.files[0].path().to_owned();
        assert!(path.exists());
        drop(intake);
        assert!(!path.exists());
    }

    #[test]
    fn preamble_is_skipped() {
        let mut raw = b"this is a preamble\r\n".to_vec();
        raw.extend_from_slice(&sample_body());
        let dir = tempfile::tempdir().unwrap();
        let mut body = body_from(&raw);
        let intake = read_parts(&mut body, "XYZ", dir.path()).unwrap();
        assert_eq!(intake.fields.len(), 1);
        assert_eq!(intake.files.len(), 1);
    }

    #[test]
    fn body_is_fully_consumed() {
        let mut raw = sample_body();
        raw.extend_from_slice(b"trailing epilogue");
        let dir = tempfile::tempdir().unwrap();
        let mut body = body_from(&raw);
        read_parts(&mut body, "XYZ", dir.path()).unwrap();
        assert!(body.end_of_stream());
    }

    #[test]
    fn missing_final_boundary_is_malformed() {
        let raw = b"--XYZ\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\nvalue".to_vec();
        let dir = tempfile::tempdir().unwrap();
        let mut body = body_from(&raw);
        assert!(matches!(
            read_parts(&mut body, "XYZ", dir.path()),
            Err(MultipartError::Malformed(_))
        ));
    }

    #[test]
    fn empty_filename_means_no_original_name() {
        let mut raw = Vec::new();
        raw.extend_from_slice(b"--B\r\n");
        raw.extend_from_slice(
            b"Content-Disposition: form-data; name=\"up\"; filename=\"\"\r\n\r\n",
        );
        raw.extend_from_slice(b"data\r\n--B--\r\n");
        let dir = tempfile::tempdir().unwrap();
        let mut body = body_from(&raw);
        let intake = read_parts(&mut body, "B", dir.path()).unwrap();
        assert_eq!(intake.files.len(), 1);
        assert!(intake.files[0].original_name().is_none());
    }
}
