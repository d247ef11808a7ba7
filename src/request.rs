// Copyright (c) 2025 The Estaminet developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The request object handed to handlers, and the parsing of its head.
//!
//! A request line is `METHOD SP request-target SP HTTP/VER`, the target is
//! split at the first `?` into a path and a raw query string. Header lines
//! follow until an empty line; a line starting with whitespace continues
//! the previous header, duplicate names are kept in order.

use std::fmt;
use std::io;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;

use percent_encoding::percent_decode_str;
use tempfile::NamedTempFile;

use crate::body::RequestBody;
use crate::headers::Headers;
use crate::headers::HttpVersion;
use crate::session::Session;
use crate::session::SessionBinding;
use crate::stream::reader::LineError;
use crate::stream::reader::StreamReader;
use crate::stream::RemoteAddr;

/// Error while parsing a request head or its headers.
#[derive(Debug)]
pub enum RequestError {
    /// Malformed request line or header line. The payload names what was
    /// wrong, for the server-error event.
    BadRequest(&'static str),
    /// The peer closed the connection between two requests.
    Closed,
    /// The peer closed the connection in the middle of a line.
    UnexpectedEof,
    /// The read timed out; only armed for the first request of a
    /// connection.
    TimedOut,
    /// The underlying socket failed.
    Io(io::Error),
}

impl From<LineError> for RequestError {
    fn from(err: LineError) -> RequestError {
        match err {
            LineError::UnexpectedEof => RequestError::UnexpectedEof,
            LineError::BadLineEnding => RequestError::BadRequest("line not terminated by CRLF"),
            LineError::NotUtf8 => RequestError::BadRequest("line is not valid UTF-8"),
            LineError::Io(err) => match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => RequestError::TimedOut,
                _ => RequestError::Io(err),
            },
        }
    }
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RequestError::BadRequest(what) => write!(f, "malformed request: {}", what),
            RequestError::Closed => write!(f, "connection closed"),
            RequestError::UnexpectedEof => write!(f, "connection closed mid-request"),
            RequestError::TimedOut => write!(f, "timed out waiting for the request"),
            RequestError::Io(err) => write!(f, "I/O error while reading the request: {}", err),
        }
    }
}

impl std::error::Error for RequestError {}

/// The parsed request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RequestHead {
    pub method: String,
    pub path: String,
    pub raw_query: Option<String>,
    pub version: HttpVersion,
}

/// Reads and parses the request line.
///
/// `Ok(None)` means the peer closed the connection cleanly before sending
/// anything.
pub(crate) fn read_head(reader: &mut StreamReader) -> Result<Option<RequestHead>, RequestError> {
    let line = match reader.read_line() {
        Ok(Some(line)) => line,
        Ok(None) => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    let mut words = line.split(' ');
    let method = words.next().unwrap_or("");
    let target = words.next().ok_or(RequestError::BadRequest("missing request target"))?;
    let version = words.next().ok_or(RequestError::BadRequest("missing protocol version"))?;
    if words.next().is_some() {
        return Err(RequestError::BadRequest("extra token in request line"));
    }
    if method.is_empty() || target.is_empty() {
        return Err(RequestError::BadRequest("empty token in request line"));
    }

    let version = HttpVersion::parse(version)
        .ok_or(RequestError::BadRequest("unparseable protocol version"))?;

    let (path, raw_query) = match target.split_once('?') {
        Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
        None => (target.to_owned(), None),
    };

    Ok(Some(RequestHead {
        method: method.to_owned(),
        path,
        raw_query,
        version,
    }))
}

/// Reads header lines until the empty line that ends the head.
pub(crate) fn read_headers(reader: &mut StreamReader) -> Result<Headers, RequestError> {
    let mut headers = Headers::new();
    loop {
        let line = match reader.read_line() {
            Ok(Some(line)) => line,
            Ok(None) => return Err(RequestError::UnexpectedEof),
            Err(err) => return Err(err.into()),
        };
        if line.is_empty() {
            return Ok(headers);
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            if !headers.append_continuation(&line) {
                return Err(RequestError::BadRequest("continuation line before any header"));
            }
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or(RequestError::BadRequest("header line without a colon"))?;
        let name = name.trim();
        if name.is_empty() || name.contains(' ') {
            return Err(RequestError::BadRequest("invalid header name"));
        }
        headers.add(name, value.trim());
    }
}

fn decode_component(raw: &str) -> String {
    percent_decode_str(raw).decode_utf8_lossy().into_owned()
}

/// Splits a raw query string into ordered `(name, value)` pairs,
/// percent-decoded, duplicates preserved.
pub(crate) fn parse_query(raw: &str) -> Vec<(String, String)> {
    raw.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (name, value) = match pair.split_once('=') {
                Some((n, v)) => (n, v),
                None => (pair, ""),
            };
            (
                decode_component(&name.replace('+', " ")),
                decode_component(&value.replace('+', " ")),
            )
        })
        .collect()
}

/// Parses the `Cookie` header into `(name, value)` pairs. Malformed
/// fragments are skipped.
pub(crate) fn parse_cookies(headers: &Headers) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for header in headers.get_all("Cookie") {
        for cookie in header.split(';') {
            let mut splits = cookie.splitn(2, '=');
            let key = match splits.next() {
                Some(k) => k.trim(),
                None => continue,
            };
            let value = match splits.next() {
                Some(v) => v.trim().trim_matches('"'),
                None => continue,
            };
            if key.is_empty() {
                continue;
            }
            out.push((key.to_owned(), value.to_owned()));
        }
    }
    out
}

/// One file received through a `multipart/form-data` body.
///
/// The data sits in a temp file that is deleted when the request is
/// dropped, unless `persist` moved it somewhere first.
pub struct UploadedFile {
    pub(crate) field_name: String,
    pub(crate) original_name: Option<String>,
    pub(crate) content_type: Option<String>,
    pub(crate) file: NamedTempFile,
    pub(crate) size: u64,
}

impl UploadedFile {
    /// The form field this file was posted under.
    pub fn field_name(&self) -> &str {
        &self.field_name
    }

    /// The file name declared by the client, if any. Untrusted input.
    pub fn original_name(&self) -> Option<&str> {
        self.original_name.as_deref()
    }

    /// The content type declared for the part, if any.
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Where the data currently lives on disk.
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Moves the file to a permanent location, taking it out of the
    /// request's cleanup.
    pub fn persist<P>(self, dest: P) -> io::Result<()>
    where
        P: AsRef<Path>,
    {
        self.file
            .persist(dest)
            .map(|_| ())
            .map_err(|err| err.error)
    }
}

impl fmt::Debug for UploadedFile {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("UploadedFile")
            .field("field_name", &self.field_name)
            .field("original_name", &self.original_name)
            .field("content_type", &self.content_type)
            .field("path", &self.file.path())
            .field("size", &self.size)
            .finish()
    }
}

/// One HTTP request, alive for a single request/response cycle.
pub struct Request {
    method: String,
    path: String,
    raw_query: Option<String>,
    version: HttpVersion,
    headers: Headers,
    remote_addr: RemoteAddr,
    path_components: Vec<String>,
    query_params: Vec<(String, String)>,
    cookies: Vec<(String, String)>,
    body: Option<RequestBody>,
    uploaded_files: Vec<UploadedFile>,
    form_fields: Vec<(String, String)>,
    pub(crate) session: SessionBinding,
}

impl Request {
    pub(crate) fn new(
        head: RequestHead,
        headers: Headers,
        remote_addr: RemoteAddr,
        body: RequestBody,
    ) -> Request {
        let path_components = head
            .path
            .split('/')
            .skip(1)
            .map(decode_component)
            .collect();
        let query_params = head
            .raw_query
            .as_deref()
            .map(parse_query)
            .unwrap_or_default();
        let cookies = parse_cookies(&headers);

        Request {
            method: head.method,
            path: head.path,
            raw_query: head.raw_query,
            version: head.version,
            headers,
            remote_addr,
            path_components,
            query_params,
            cookies,
            body: Some(body),
            uploaded_files: Vec::new(),
            form_fields: Vec::new(),
            session: SessionBinding::default(),
        }
    }

    /// Builds a fake request for tests, without any socket behind it.
    ///
    /// # Example
    ///
    /// ```
    /// use estaminet::Request;
    /// let request = Request::fake_http("GET", "/hello?who=world", vec![], Vec::new());
    /// assert_eq!(request.path(), "/hello");
    /// assert_eq!(request.query_param("who"), Some("world"));
    /// ```
    pub fn fake_http<M, T>(
        method: M,
        target: T,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    ) -> Request
    where
        M: Into<String>,
        T: Into<String>,
    {
        let target = target.into();
        let (path, raw_query) = match target.split_once('?') {
            Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
            None => (target, None),
        };
        let head = RequestHead {
            method: method.into(),
            path,
            raw_query,
            version: HttpVersion::V1_1,
        };
        let mut header_map = Headers::new();
        for (name, value) in headers {
            header_map.add(name, value);
        }
        let len = body.len() as u64;
        let reader = Arc::new(Mutex::new(StreamReader::new(Cursor::new(body), false)));
        let body = RequestBody::new(reader, Some(len), false);
        Request::new(
            head,
            header_map,
            RemoteAddr::Tcp("127.0.0.1:0".parse().unwrap()),
            body,
        )
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// The request path, percent-encoded as received.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The path split at `/`, percent-decoded. A trailing slash yields a
    /// final empty component.
    pub fn path_components(&self) -> &[String] {
        &self.path_components
    }

    pub fn raw_query(&self) -> Option<&str> {
        self.raw_query.as_deref()
    }

    pub fn version(&self) -> HttpVersion {
        self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// The first value of a header, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn remote_addr(&self) -> &RemoteAddr {
        &self.remote_addr
    }

    /// Ordered query parameters; the same name may appear several times.
    pub fn query_params(&self) -> &[(String, String)] {
        &self.query_params
    }

    /// The first value of a query parameter.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query_params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// All values of a query parameter, in order.
    pub fn query_param_values(&self, name: &str) -> Vec<&str> {
        self.query_params
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn cookies(&self) -> &[(String, String)] {
        &self.cookies
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// The body stream, if it has not been consumed yet (multipart intake
    /// consumes it before dispatch).
    pub fn body_mut(&mut self) -> Option<&mut RequestBody> {
        self.body.as_mut()
    }

    pub(crate) fn take_body(&mut self) -> Option<RequestBody> {
        self.body.take()
    }

    pub(crate) fn put_back_body(&mut self, body: RequestBody) {
        self.body = Some(body);
    }

    /// Files received through a multipart body.
    pub fn uploaded_files(&self) -> &[UploadedFile] {
        &self.uploaded_files
    }

    /// Takes ownership of the uploaded files, e.g. to persist them.
    pub fn take_uploaded_files(&mut self) -> Vec<UploadedFile> {
        std::mem::take(&mut self.uploaded_files)
    }

    pub(crate) fn set_uploaded_files(&mut self, files: Vec<UploadedFile>) {
        self.uploaded_files = files;
    }

    /// Non-file fields of a multipart body, in arrival order.
    pub fn form_fields(&self) -> &[(String, String)] {
        &self.form_fields
    }

    pub fn form_field(&self, name: &str) -> Option<&str> {
        self.form_fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub(crate) fn set_form_fields(&mut self, fields: Vec<(String, String)>) {
        self.form_fields = fields;
    }

    /// The session attached to this request, if any.
    pub fn session(&self) -> Option<&Session> {
        self.session.session()
    }

    pub fn session_mut(&mut self) -> Option<&mut Session> {
        self.session.session_mut()
    }

    /// Returns the attached session, creating a fresh one first if needed.
    pub fn start_session(&mut self) -> &mut Session {
        if self.session.attached.is_none() {
            self.session.attach(Session::new());
        }
        self.session.session_mut().unwrap()
    }

    /// Detaches the session from the request; its cookie will be expired
    /// when the response is written.
    pub fn clear_session(&mut self) {
        self.session.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::parse_query;
    use super::read_head;
    use super::read_headers;
    use super::Request;
    use super::RequestError;
    use crate::headers::HttpVersion;
    use crate::stream::reader::StreamReader;
    use std::io::Cursor;

    fn reader(bytes: &[u8]) -> StreamReader {
        StreamReader::new(Cursor::new(bytes.to_vec()), false)
    }

    #[test]
    fn head_parses() {
        let mut r = reader(b"GET /a/b?x=1 HTTP/1.1\r\n");
        let head = read_head(&mut r).unwrap().unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.path, "/a/b");
        assert_eq!(head.raw_query.as_deref(), Some("x=1"));
        assert_eq!(head.version, HttpVersion::V1_1);
    }

    #[test]
    fn head_rejects_extra_tokens() {
        let mut r = reader(b"GET / HTTP/1.1 extra\r\n");
        assert!(matches!(
            read_head(&mut r),
            Err(RequestError::BadRequest(_))
        ));
    }

    #[test]
    fn head_on_closed_socket_is_none() {
        let mut r = reader(b"");
        assert!(read_head(&mut r).unwrap().is_none());
    }

    #[test]
    fn headers_with_continuation_and_duplicates() {
        let mut r = reader(
            b"Host: example.com\r\nX-Long: first\r\n  second\r\nX-Tag: a\r\nX-Tag: b\r\n\r\n",
        );
        let headers = read_headers(&mut r).unwrap();
        assert_eq!(headers.get("host"), Some("example.com"));
        assert_eq!(headers.get("X-Long"), Some("first second"));
        let tags: Vec<&str> = headers.get_all("X-Tag").collect();
        assert_eq!(tags, ["a", "b"]);
    }

    #[test]
    fn headers_reject_missing_colon() {
        let mut r = reader(b"NoColonHere\r\n\r\n");
        assert!(matches!(
            read_headers(&mut r),
            Err(RequestError::BadRequest(_))
        ));
    }

    #[test]
    fn query_multimap_decoding() {
        let params = parse_query("a=1&b=hello+world&a=2&c=%2Fslash&flag");
        assert_eq!(
            params,
            vec![
                ("a".to_owned(), "1".to_owned()),
                ("b".to_owned(), "hello world".to_owned()),
                ("a".to_owned(), "2".to_owned()),
                ("c".to_owned(), "/slash".to_owned()),
                ("flag".to_owned(), "".to_owned()),
            ]
        );
    }

    #[test]
    fn fake_request_exposes_everything() {
        let request = Request::fake_http(
            "POST",
            "/users/42?sort=asc&sort=desc",
            vec![("Cookie".to_owned(), "a=b; SID=\"xyz\"".to_owned())],
            b"payload".to_vec(),
        );
        assert_eq!(request.method(), "POST");
        assert_eq!(request.path_components(), ["users", "42"]);
        assert_eq!(request.query_param_values("sort"), ["asc", "desc"]);
        assert_eq!(request.cookie("SID"), Some("xyz"));
    }

    #[test]
    fn fake_request_body_reads() {
        let mut request =
            Request::fake_http("POST", "/", vec![], b"hello".to_vec());
        let body = request.body_mut().unwrap();
        assert_eq!(body.read_to_vec().unwrap(), b"hello");
        assert!(body.end_of_stream());
    }

    #[test]
    fn trailing_slash_keeps_empty_component() {
        let request = Request::fake_http("GET", "/a/", vec![], Vec::new());
        assert_eq!(request.path_components(), ["a", ""]);

        let root = Request::fake_http("GET", "/", vec![], Vec::new());
        assert_eq!(root.path_components(), [""]);
    }
}
