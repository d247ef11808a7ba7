// Copyright (c) 2025 The Estaminet developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The request header map and its typed accessors.
//!
//! Header names are case-insensitive; duplicate names are preserved in the
//! order they arrived. On top of the raw map sit accessors for the headers
//! the engine cares about: `Content-Length`, `Transfer-Encoding`,
//! `Connection`, `Content-Type`, `Host` and `Upgrade`.

use std::fmt;
use std::str::FromStr;

use chrono::DateTime;
use chrono::Utc;

/// Error produced by the typed header accessors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderError {
    /// `Content-Length` is present but not a non-negative integer.
    InvalidContentLength,
    /// `Content-Length` and `Transfer-Encoding: chunked` on the same
    /// message.
    ConflictingFraming,
}

impl fmt::Display for HeaderError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HeaderError::InvalidContentLength => write!(f, "invalid Content-Length header"),
            HeaderError::ConflictingFraming => {
                write!(f, "both Content-Length and Transfer-Encoding: chunked present")
            }
        }
    }
}

impl std::error::Error for HeaderError {}

/// Protocol version parsed from the request line.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HttpVersion {
    V1_0,
    V1_1,
    V2_0,
    Other,
}

impl HttpVersion {
    /// Parses an `HTTP/x.y` token.
    pub fn parse(token: &str) -> Option<HttpVersion> {
        let vers = token.strip_prefix("HTTP/")?;
        Some(match vers {
            "1.0" => HttpVersion::V1_0,
            "1.1" => HttpVersion::V1_1,
            "2.0" | "2" => HttpVersion::V2_0,
            _ => HttpVersion::Other,
        })
    }
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HttpVersion::V1_0 => write!(f, "HTTP/1.0"),
            HttpVersion::V1_1 => write!(f, "HTTP/1.1"),
            HttpVersion::V2_0 => write!(f, "HTTP/2.0"),
            HttpVersion::Other => write!(f, "HTTP/?"),
        }
    }
}

/// Classified value of the `Connection` header.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionDirective {
    Close,
    KeepAlive,
    Upgrade,
    Other,
}

/// Case-insensitive multi-valued header map.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Headers {
        Headers { entries: Vec::new() }
    }

    /// Appends a header, keeping arrival order.
    pub fn add<N, V>(&mut self, name: N, value: V)
    where
        N: Into<String>,
        V: Into<String>,
    {
        self.entries.push((name.into(), value.into()));
    }

    /// Appends a continuation-line fragment to the most recent header,
    /// separated by a single space.
    pub(crate) fn append_continuation(&mut self, fragment: &str) -> bool {
        match self.entries.last_mut() {
            Some((_, value)) => {
                value.push(' ');
                value.push_str(fragment.trim());
                true
            }
            None => false,
        }
    }

    /// The first value of `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values of `name`, in arrival order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Iterates over all `(name, value)` pairs in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parsed `Content-Length`. `Ok(None)` when absent.
    pub fn content_length(&self) -> Result<Option<u64>, HeaderError> {
        match self.get("Content-Length") {
            None => Ok(None),
            Some(value) => match atoi::atoi::<u64>(value.trim().as_bytes()) {
                Some(len) => Ok(Some(len)),
                None => Err(HeaderError::InvalidContentLength),
            },
        }
    }

    /// The ordered transfer codings, lowercased.
    pub fn transfer_encoding(&self) -> Vec<String> {
        self.get_all("Transfer-Encoding")
            .flat_map(|v| v.split(','))
            .map(|t| t.trim().to_ascii_lowercase())
            .filter(|t| !t.is_empty())
            .collect()
    }

    /// True if `Transfer-Encoding` contains `chunked`.
    pub fn is_chunked(&self) -> bool {
        self.transfer_encoding().iter().any(|t| t == "chunked")
    }

    /// Checks the framing invariant: a message must not carry both a
    /// `Content-Length` and `Transfer-Encoding: chunked`.
    pub fn validate_framing(&self) -> Result<(), HeaderError> {
        if self.is_chunked() && self.content_length()?.is_some() {
            return Err(HeaderError::ConflictingFraming);
        }
        Ok(())
    }

    /// Classified `Connection` header, if present. `close` wins over
    /// `upgrade`, which wins over `keep-alive`, when several tokens are
    /// listed.
    pub fn connection(&self) -> Option<ConnectionDirective> {
        let mut seen = None;
        for token in self.get_all("Connection").flat_map(|v| v.split(',')) {
            let token = token.trim();
            if token.eq_ignore_ascii_case("close") {
                return Some(ConnectionDirective::Close);
            } else if token.eq_ignore_ascii_case("upgrade") {
                seen = Some(ConnectionDirective::Upgrade);
            } else if token.eq_ignore_ascii_case("keep-alive") {
                if seen.is_none() {
                    seen = Some(ConnectionDirective::KeepAlive);
                }
            } else if !token.is_empty() && seen.is_none() {
                seen = Some(ConnectionDirective::Other);
            }
        }
        seen
    }

    /// Parsed `Content-Type`, if present and well-formed.
    pub fn content_type(&self) -> Option<mime::Mime> {
        self.get("Content-Type")
            .and_then(|v| mime::Mime::from_str(v).ok())
    }

    /// True for a `multipart/form-data` request.
    pub fn is_multipart_form_data(&self) -> bool {
        self.content_type()
            .map(|m| m.type_() == mime::MULTIPART && m.subtype() == "form-data")
            .unwrap_or(false)
    }

    /// The `boundary` parameter of a multipart `Content-Type`.
    pub fn multipart_boundary(&self) -> Option<String> {
        self.content_type()
            .and_then(|m| m.get_param(mime::BOUNDARY).map(|b| b.as_str().to_owned()))
    }

    pub fn host(&self) -> Option<&str> {
        self.get("Host")
    }

    pub fn upgrade(&self) -> Option<&str> {
        self.get("Upgrade")
    }
}

/// A `Set-Cookie` value under construction.
///
/// # Example
///
/// ```
/// use estaminet::SetCookie;
/// let cookie = SetCookie::new("SID", "abc").with_path("/").http_only();
/// assert_eq!(cookie.to_string(), "SID=abc; Path=/; HttpOnly");
/// ```
#[derive(Debug, Clone)]
pub struct SetCookie {
    pub name: String,
    pub value: String,
    pub path: Option<String>,
    pub domain: Option<String>,
    pub max_age: Option<i64>,
    pub expires: Option<DateTime<Utc>>,
    pub http_only: bool,
}

impl SetCookie {
    pub fn new<N, V>(name: N, value: V) -> SetCookie
    where
        N: Into<String>,
        V: Into<String>,
    {
        SetCookie {
            name: name.into(),
            value: value.into(),
            path: None,
            domain: None,
            max_age: None,
            expires: None,
            http_only: false,
        }
    }

    /// A cookie that tells the client to forget `name` immediately.
    pub fn expired<N>(name: N) -> SetCookie
    where
        N: Into<String>,
    {
        let mut cookie = SetCookie::new(name, "");
        cookie.max_age = Some(0);
        cookie.expires = Some(DateTime::<Utc>::UNIX_EPOCH);
        cookie
    }

    pub fn with_path<P>(mut self, path: P) -> SetCookie
    where
        P: Into<String>,
    {
        self.path = Some(path.into());
        self
    }

    pub fn with_domain<D>(mut self, domain: D) -> SetCookie
    where
        D: Into<String>,
    {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_max_age(mut self, seconds: i64) -> SetCookie {
        self.max_age = Some(seconds);
        self
    }

    pub fn with_expires(mut self, when: DateTime<Utc>) -> SetCookie {
        self.expires = Some(when);
        self
    }

    pub fn http_only(mut self) -> SetCookie {
        self.http_only = true;
        self
    }
}

impl fmt::Display for SetCookie {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)?;
        if let Some(expires) = &self.expires {
            write!(f, "; Expires={}", expires.format("%a, %d %b %Y %H:%M:%S GMT"))?;
        }
        if let Some(max_age) = self.max_age {
            write!(f, "; Max-Age={}", max_age)?;
        }
        if let Some(domain) = &self.domain {
            write!(f, "; Domain={}", domain)?;
        }
        if let Some(path) = &self.path {
            write!(f, "; Path={}", path)?;
        }
        if self.http_only {
            write!(f, "; HttpOnly")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectionDirective;
    use super::HeaderError;
    use super::Headers;
    use super::HttpVersion;
    use super::SetCookie;

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        let mut h = Headers::new();
        for (n, v) in pairs {
            h.add(*n, *v);
        }
        h
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let h = headers(&[("Content-Type", "text/plain")]);
        assert_eq!(h.get("content-type"), Some("text/plain"));
        assert_eq!(h.get("CONTENT-TYPE"), Some("text/plain"));
    }

    #[test]
    fn duplicates_preserved_in_order() {
        let h = headers(&[("X-Tag", "a"), ("x-tag", "b")]);
        let all: Vec<&str> = h.get_all("X-Tag").collect();
        assert_eq!(all, ["a", "b"]);
    }

    #[test]
    fn content_length_parses() {
        let h = headers(&[("Content-Length", "42")]);
        assert_eq!(h.content_length().unwrap(), Some(42));

        let h = headers(&[("Content-Length", "-1")]);
        assert_eq!(
            h.content_length(),
            Err(HeaderError::InvalidContentLength)
        );
    }

    #[test]
    fn chunked_detection() {
        let h = headers(&[("Transfer-Encoding", "gzip, Chunked")]);
        assert!(h.is_chunked());
        assert_eq!(h.transfer_encoding(), ["gzip", "chunked"]);
    }

    #[test]
    fn conflicting_framing_rejected() {
        let h = headers(&[
            ("Content-Length", "0"),
            ("Transfer-Encoding", "chunked"),
        ]);
        assert_eq!(h.validate_framing(), Err(HeaderError::ConflictingFraming));
    }

    #[test]
    fn connection_close_wins() {
        let h = headers(&[("Connection", "keep-alive, close")]);
        assert_eq!(h.connection(), Some(ConnectionDirective::Close));
    }

    #[test]
    fn multipart_boundary_extracted() {
        let h = headers(&[(
            "Content-Type",
            "multipart/form-data; boundary=----abc123",
        )]);
        assert!(h.is_multipart_form_data());
        assert_eq!(h.multipart_boundary().unwrap(), "----abc123");
    }

    #[test]
    fn version_parse() {
        assert_eq!(HttpVersion::parse("HTTP/1.1"), Some(HttpVersion::V1_1));
        assert_eq!(HttpVersion::parse("HTTP/1.0"), Some(HttpVersion::V1_0));
        assert_eq!(HttpVersion::parse("HTTP/3.7"), Some(HttpVersion::Other));
        assert_eq!(HttpVersion::parse("FTP/1.1"), None);
    }

    #[test]
    fn set_cookie_attributes() {
        let cookie = SetCookie::new("SID", "xyz")
            .with_max_age(3600)
            .with_domain("example.com")
            .with_path("/")
            .http_only();
        assert_eq!(
            cookie.to_string(),
            "SID=xyz; Max-Age=3600; Domain=example.com; Path=/; HttpOnly"
        );
    }

    #[test]
    fn expired_cookie_is_in_the_past() {
        let cookie = SetCookie::expired("SID");
        let rendered = cookie.to_string();
        assert!(rendered.starts_with("SID="));
        assert!(rendered.contains("Max-Age=0"));
        assert!(rendered.contains("Expires=Thu, 01 Jan 1970 00:00:00 GMT"));
    }
}
