// Copyright (c) 2025 The Estaminet developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Contains a prototype of a response.
//!
//! The response is only sent to the client when the handler returns it to
//! the engine, so handlers are free to build as many `Response` objects as
//! they want. The body is one of: inline bytes, a file on disk (optionally
//! a byte range, optionally throttled), a streaming callback that receives
//! the request input stream and the socket writer, or nothing.
//!
//! A response also selects the worker queue its write phase runs on; by
//! default that is the current connection worker, but `on_queue` hops the
//! write onto a named queue, bounded by the admission controller.

use std::borrow::Cow;
use std::fmt;
use std::io;
use std::ops::Range;
use std::path::PathBuf;
use std::time::Duration;

use crate::body::RequestBody;
use crate::queues::QueueId;
use crate::stream::writer::StreamWriter;

/// Throttle for file streaming: a pause is inserted after each buffer so
/// the transfer approximates this rate.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TransferRate {
    pub bytes_per_second: u64,
}

impl TransferRate {
    pub fn new(bytes_per_second: u64) -> TransferRate {
        TransferRate { bytes_per_second }
    }

    /// The pause owed after writing `bytes`.
    pub fn pause_for(&self, bytes: usize) -> Duration {
        if self.bytes_per_second == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(bytes as f64 / self.bytes_per_second as f64)
    }
}

/// A callback that streams the response body itself. It receives the
/// request body (empty if already consumed) and the socket writer.
pub type StreamingFn =
    Box<dyn FnOnce(&mut RequestBody, &mut StreamWriter) -> io::Result<()> + Send>;

pub(crate) enum BodyKind {
    Empty,
    Data(Vec<u8>),
    File {
        path: PathBuf,
        range: Option<Range<u64>>,
        rate: Option<TransferRate>,
    },
    Stream(StreamingFn),
}

/// An opaque type that represents the body of a response.
///
/// Build one with the provided constructors; the engine decides between
/// `Content-Length` and chunked framing from its precomputed length.
pub struct ResponseBody {
    pub(crate) kind: BodyKind,
}

impl ResponseBody {
    /// A body with no data.
    pub fn empty() -> ResponseBody {
        ResponseBody { kind: BodyKind::Empty }
    }

    /// A body made of the given bytes.
    pub fn from_data<D>(data: D) -> ResponseBody
    where
        D: Into<Vec<u8>>,
    {
        ResponseBody { kind: BodyKind::Data(data.into()) }
    }

    /// A body made of an UTF-8 string.
    pub fn from_string<S>(data: S) -> ResponseBody
    where
        S: Into<String>,
    {
        ResponseBody::from_data(data.into().into_bytes())
    }

    /// A body streamed from a file on disk. No handle is held until the
    /// write phase begins.
    pub fn from_file<P>(path: P) -> ResponseBody
    where
        P: Into<PathBuf>,
    {
        ResponseBody {
            kind: BodyKind::File { path: path.into(), range: None, rate: None },
        }
    }

    /// Like `from_file`, restricted to a byte range of the file.
    pub fn from_file_range<P>(path: P, range: Range<u64>) -> ResponseBody
    where
        P: Into<PathBuf>,
    {
        ResponseBody {
            kind: BodyKind::File { path: path.into(), range: Some(range), rate: None },
        }
    }

    /// A body produced by a streaming callback.
    pub fn stream<F>(callback: F) -> ResponseBody
    where
        F: FnOnce(&mut RequestBody, &mut StreamWriter) -> io::Result<()> + Send + 'static,
    {
        ResponseBody { kind: BodyKind::Stream(Box::new(callback)) }
    }

    /// Throttles a file body. A no-op for other body kinds.
    pub fn with_transfer_rate(mut self, new_rate: TransferRate) -> ResponseBody {
        if let BodyKind::File { ref mut rate, .. } = self.kind {
            *rate = Some(new_rate);
        }
        self
    }

    /// The body length when it is known without touching the disk. File
    /// bodies are measured by the write phase instead, when the handle is
    /// opened.
    pub(crate) fn known_length(&self) -> Option<u64> {
        match &self.kind {
            BodyKind::Empty => Some(0),
            BodyKind::Data(data) => Some(data.len() as u64),
            BodyKind::File { range: Some(range), .. } => {
                Some(range.end.saturating_sub(range.start))
            }
            BodyKind::File { range: None, .. } => None,
            BodyKind::Stream(_) => None,
        }
    }
}

/// Which worker queue the write phase of a response runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteQueue {
    /// Stay on the worker that parsed the request.
    Current,
    /// Hop onto a named worker queue, gated by its admission counter.
    Queue(QueueId),
}

/// Contains a prototype of a response.
pub struct Response {
    /// The status code to return to the client.
    pub status_code: u16,
    /// Reason phrase; the default phrase for the status code when `None`.
    pub reason: Option<Cow<'static, str>>,
    /// List of headers to be returned in the response.
    ///
    /// `Content-Length`, `Transfer-Encoding`, `Connection` and `Date` are
    /// managed by the engine and are overwritten if present here.
    pub headers: Vec<(Cow<'static, str>, Cow<'static, str>)>,
    /// The body of the response.
    pub data: ResponseBody,
    /// The worker queue the write phase runs on.
    pub write_queue: WriteQueue,
}

impl Response {
    /// Returns true if the status code of this `Response` indicates
    /// success. This is the range [200-399].
    #[inline]
    pub fn is_success(&self) -> bool {
        self.status_code >= 200 && self.status_code < 400
    }

    /// Shortcut for `!response.is_success()`.
    #[inline]
    pub fn is_error(&self) -> bool {
        !self.is_success()
    }

    /// Builds a `Response` that outputs plain text.
    ///
    /// # Example
    ///
    /// ```
    /// use estaminet::Response;
    /// let response = Response::text("hello world");
    /// ```
    pub fn text<S>(text: S) -> Response
    where
        S: Into<String>,
    {
        Response {
            status_code: 200,
            reason: None,
            headers: vec![("Content-Type".into(), "text/plain; charset=utf8".into())],
            data: ResponseBody::from_string(text),
            write_queue: WriteQueue::Current,
        }
    }

    /// Builds a `Response` that outputs HTML.
    pub fn html<D>(content: D) -> Response
    where
        D: Into<String>,
    {
        Response {
            status_code: 200,
            reason: None,
            headers: vec![("Content-Type".into(), "text/html; charset=utf8".into())],
            data: ResponseBody::from_string(content),
            write_queue: WriteQueue::Current,
        }
    }

    /// Builds a `Response` from any body, with no headers preset.
    pub fn from_body(body: ResponseBody) -> Response {
        Response {
            status_code: 200,
            reason: None,
            headers: Vec::new(),
            data: body,
            write_queue: WriteQueue::Current,
        }
    }

    /// Builds a `Response` that streams a file from disk. The content type
    /// is inferred from the extension at write time if none is set.
    pub fn from_file<P>(path: P) -> Response
    where
        P: Into<PathBuf>,
    {
        Response::from_body(ResponseBody::from_file(path))
    }

    /// Builds a `Response` whose body is produced by a streaming callback
    /// receiving `(input, output)`.
    pub fn stream<F>(callback: F) -> Response
    where
        F: FnOnce(&mut RequestBody, &mut StreamWriter) -> io::Result<()> + Send + 'static,
    {
        Response::from_body(ResponseBody::stream(callback))
    }

    /// Builds an empty `Response` with a 400 status code.
    pub fn empty_400() -> Response {
        Response::from_body(ResponseBody::empty()).with_status_code(400)
    }

    /// Builds an empty `Response` with a 404 status code.
    pub fn empty_404() -> Response {
        Response::from_body(ResponseBody::empty()).with_status_code(404)
    }

    /// Builds a `Response` that redirects with a 303 status code.
    pub fn redirect_303<S>(target: S) -> Response
    where
        S: Into<Cow<'static, str>>,
    {
        Response {
            status_code: 303,
            reason: None,
            headers: vec![("Location".into(), target.into())],
            data: ResponseBody::empty(),
            write_queue: WriteQueue::Current,
        }
    }

    /// Changes the status code of the response.
    #[inline]
    pub fn with_status_code(mut self, code: u16) -> Response {
        self.status_code = code;
        self
    }

    /// Overrides the reason phrase.
    pub fn with_reason<S>(mut self, reason: S) -> Response
    where
        S: Into<Cow<'static, str>>,
    {
        self.reason = Some(reason.into());
        self
    }

    /// Appends a header to the response.
    pub fn with_header<N, V>(mut self, name: N, value: V) -> Response
    where
        N: Into<Cow<'static, str>>,
        V: Into<Cow<'static, str>>,
    {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Replaces a header, or appends it if absent.
    pub fn with_unique_header<N, V>(mut self, name: N, value: V) -> Response
    where
        N: Into<Cow<'static, str>>,
        V: Into<Cow<'static, str>>,
    {
        let name = name.into();
        let value = value.into();
        for (n, v) in self.headers.iter_mut() {
            if n.eq_ignore_ascii_case(&name) {
                *v = value;
                return self;
            }
        }
        self.headers.push((name, value));
        self
    }

    /// Appends a `Set-Cookie` header.
    pub fn with_cookie(self, cookie: crate::headers::SetCookie) -> Response {
        self.with_header("Set-Cookie", cookie.to_string())
    }

    /// Hops the write phase of this response onto a named worker queue.
    pub fn on_queue<Q>(mut self, queue: Q) -> Response
    where
        Q: Into<QueueId>,
    {
        self.write_queue = WriteQueue::Queue(queue.into());
        self
    }

    /// The reason phrase that will be written for this response.
    pub fn reason_phrase(&self) -> &str {
        match &self.reason {
            Some(reason) => reason,
            None => default_reason_phrase(self.status_code),
        }
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Response")
            .field("status_code", &self.status_code)
            .field("headers", &self.headers)
            .finish()
    }
}

/// Returns the phrase corresponding to a status code.
pub fn default_reason_phrase(status_code: u16) -> &'static str {
    match status_code {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        203 => "Non-Authoritative Information",
        204 => "No Content",
        205 => "Reset Content",
        206 => "Partial Content",
        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        402 => "Payment Required",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        407 => "Proxy Authentication Required",
        408 => "Request Time-out",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        412 => "Precondition Failed",
        413 => "Request Entity Too Large",
        414 => "Request-URI Too Large",
        415 => "Unsupported Media Type",
        416 => "Range Not Satisfiable",
        417 => "Expectation Failed",
        426 => "Upgrade Required",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Time-out",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::Response;
    use super::ResponseBody;
    use super::TransferRate;
    use super::WriteQueue;
    use crate::queues::QueueId;
    use std::time::Duration;

    #[test]
    fn text_sets_content_type() {
        let response = Response::text("hi");
        assert_eq!(response.status_code, 200);
        assert_eq!(
            response.headers,
            vec![(
                "Content-Type".into(),
                "text/plain; charset=utf8".into()
            )]
        );
        assert_eq!(response.data.known_length(), Some(2));
    }

    #[test]
    fn empty_bodies_have_length_zero() {
        assert_eq!(ResponseBody::empty().known_length(), Some(0));
    }

    #[test]
    fn file_range_length_is_known_without_disk() {
        let body = ResponseBody::from_file_range("/does/not/exist", 10..25);
        assert_eq!(body.known_length(), Some(15));
    }

    #[test]
    fn stream_length_is_unknown() {
        let body = ResponseBody::stream(|_, _| Ok(()));
        assert_eq!(body.known_length(), None);
    }

    #[test]
    fn unique_header_replaces() {
        let response = Response::text("x")
            .with_unique_header("Content-Type", "application/json");
        assert_eq!(response.headers.len(), 1);
        assert_eq!(response.headers[0].1, "application/json");
    }

    #[test]
    fn on_queue_selects_write_queue() {
        let response = Response::text("x").on_queue("heavy");
        assert_eq!(
            response.write_queue,
            WriteQueue::Queue(QueueId::named("heavy"))
        );
    }

    #[test]
    fn transfer_rate_pause() {
        let rate = TransferRate::new(1000);
        assert_eq!(rate.pause_for(500), Duration::from_millis(500));
        assert_eq!(TransferRate::new(0).pause_for(1 << 20), Duration::ZERO);
    }

    #[test]
    fn reason_phrase_defaults_and_overrides() {
        assert_eq!(Response::text("x").reason_phrase(), "OK");
        assert_eq!(
            Response::text("x").with_status_code(404).reason_phrase(),
            "Not Found"
        );
        assert_eq!(
            Response::text("x").with_reason("Fine").reason_phrase(),
            "Fine"
        );
    }
}
