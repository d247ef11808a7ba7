// Copyright (c) 2025 The Estaminet developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The per-connection worker.
//!
//! One worker thread owns one accepted socket and serves its requests
//! strictly in order: read the head (bounded by the initial-request
//! timeout on the first request), read the headers, build the request,
//! dispatch it through the route controller, write the response, drain
//! whatever body the handler did not read, then loop while keep-alive
//! holds. The socket is closed on every exit path except a queue hop,
//! which transfers the socket and the request's uploaded files to a
//! thread admitted on the chosen queue; the hopped write is the last
//! operation on that socket.

use std::fs;
use std::fs::File;
use std::io;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::panic;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;

use log::debug;

use crate::body::RequestBody;
use crate::controller::HandlerError;
use crate::controller::RouteController;
use crate::headers::ConnectionDirective;
use crate::headers::HttpVersion;
use crate::headers::SetCookie;
use crate::multipart;
use crate::queues::QueuePermit;
use crate::request;
use crate::request::Request;
use crate::request::RequestError;
use crate::response::BodyKind;
use crate::response::Response;
use crate::response::TransferRate;
use crate::response::WriteQueue;
use crate::session::SessionManager;
use crate::stream::reader::StreamReader;
use crate::stream::writer::StreamWriter;
use crate::stream::HttpStream;
use crate::stream::RemoteAddr;
use crate::ServerContext;
use crate::ServerError;

const FILE_BUFFER: usize = 64 * 1024;

/// Serves every request of one accepted connection. The request-queue
/// permit is released when this function returns or the thread panics.
pub(crate) fn handle_connection(
    stream: HttpStream,
    remote: RemoteAddr,
    context: Arc<ServerContext>,
    permit: QueuePermit,
) {
    let _permit = permit;
    debug!("connection accepted from {}", remote);

    let read_half = match stream.try_clone() {
        Ok(half) => half,
        Err(err) => {
            report_error!(context, ServerError::Write(err));
            let _ = stream.shutdown();
            return;
        }
    };
    let write_half = match stream.try_clone() {
        Ok(half) => half,
        Err(err) => {
            report_error!(context, ServerError::Write(err));
            let _ = stream.shutdown();
            return;
        }
    };

    let reader = Arc::new(Mutex::new(StreamReader::new(
        read_half,
        context.config().lenient_line_endings,
    )));
    let mut writer = StreamWriter::new(write_half);

    let mut sticky_session: Option<String> = None;
    let mut served: usize = 0;

    loop {
        let first = served == 0;
        if first
            && stream
                .set_read_timeout(Some(context.config().initial_request_timeout))
                .is_err()
        {
            break;
        }

        // ReadingHead
        let head = {
            let mut guard = reader.lock().unwrap();
            request::read_head(&mut guard)
        };
        let head = match head {
            Ok(Some(head)) => head,
            Ok(None) => break, // peer closed between requests
            Err(RequestError::TimedOut) => {
                if first {
                    report_error!(context, ServerError::ConnectionTimedOut);
                }
                break;
            }
            Err(RequestError::Closed) | Err(RequestError::UnexpectedEof) => break,
            Err(err @ RequestError::BadRequest(_)) => {
                report_error!(context, ServerError::BadRequest(err));
                write_bad_request(&context, &mut writer);
                break;
            }
            Err(RequestError::Io(err)) => {
                report_error!(context, ServerError::Write(err));
                break;
            }
        };
        if first && stream.set_read_timeout(None).is_err() {
            break;
        }

        // ReadingHeaders
        let headers = {
            let mut guard = reader.lock().unwrap();
            request::read_headers(&mut guard)
        };
        let headers = match headers {
            Ok(headers) => headers,
            Err(err @ RequestError::BadRequest(_)) => {
                report_error!(context, ServerError::BadRequest(err));
                write_bad_request(&context, &mut writer);
                break;
            }
            Err(err) => {
                report_error!(context, ServerError::BadRequest(err));
                break;
            }
        };

        // Content-Length together with chunked is unanswerable: the body
        // framing would be ambiguous, so reject before touching it.
        if headers.validate_framing().is_err() {
            report_error!(
                context,
                ServerError::BadRequest(RequestError::BadRequest(
                    "both Content-Length and chunked framing"
                ))
            );
            write_bad_request(&context, &mut writer);
            break;
        }
        let content_length = match headers.content_length() {
            Ok(len) => len,
            Err(_) => {
                report_error!(
                    context,
                    ServerError::BadRequest(RequestError::BadRequest("bad Content-Length"))
                );
                write_bad_request(&context, &mut writer);
                break;
            }
        };
        let chunked = headers.is_chunked();

        let mut keep_alive = !matches!(headers.connection(), Some(ConnectionDirective::Close));
        if head.version != HttpVersion::V1_1 {
            // 1.0 is always served close; anything newer cannot be spoken
            // on this socket either.
            keep_alive = false;
        }

        let body = RequestBody::new(reader.clone(), content_length, chunked);
        let mut request = Request::new(head, headers, remote.clone(), body);
        debug!("{} {} from {}", request.method(), request.path(), remote);

        // ReadingBody: multipart intake happens before dispatch so that
        // handlers see the uploaded files.
        if request.headers().is_multipart_form_data() {
            let boundary = match request.headers().multipart_boundary() {
                Some(boundary) => boundary,
                None => {
                    report_error!(
                        context,
                        ServerError::BadRequest(RequestError::BadRequest(
                            "multipart without boundary"
                        ))
                    );
                    write_bad_request(&context, &mut writer);
                    break;
                }
            };
            let upload_dir = context.upload_dir(request.headers().host());
            if let Err(err) = fs::create_dir_all(&upload_dir) {
                report_error!(context, ServerError::Write(err));
                break;
            }
            let mut body = match request.take_body() {
                Some(body) => body,
                None => unreachable!("body taken before multipart intake"),
            };
            match multipart::read_parts(&mut body, &boundary, &upload_dir) {
                Ok(intake) => {
                    request.set_uploaded_files(intake.files);
                    request.set_form_fields(intake.fields);
                }
                Err(err) => {
                    report_error!(context, ServerError::Multipart(err));
                    write_bad_request(&context, &mut writer);
                    break;
                }
            }
        }

        attach_session(&context, &mut request, &sticky_session);

        // Dispatching
        let response = {
            let controller = context.controller();
            let caught = panic::catch_unwind(AssertUnwindSafe(|| {
                controller.handle(&context, &mut request)
            }));
            match caught {
                Ok(response) => response,
                Err(payload) => {
                    let message = panic_message(payload);
                    report_error!(context, ServerError::HandlerPanicked(message.clone()));
                    controller.internal_error(&context, &HandlerError::Panicked(message))
                }
            }
        };

        served += 1;
        let allow_another = keep_alive
            && served < context.config().max_requests_per_connection
            && !context.is_stopping();

        // Hop decision: a response that selected another queue performs
        // its whole write phase there, and nothing more happens on this
        // socket from this worker.
        if let WriteQueue::Queue(queue) = response.write_queue.clone() {
            if let Some(write_permit) = context.queues().acquire(&queue) {
                let hop_context = context.clone();
                let hop_stream = stream;
                let mut hop_writer = writer;
                let mut hop_request = request;
                thread::spawn(move || {
                    let _permit = write_permit;
                    let outcome =
                        write_response(&hop_context, &mut hop_writer, &mut hop_request, response, false);
                    if let Err(err) = outcome {
                        report_error!(hop_context, ServerError::Write(err));
                    }
                    let _ = hop_stream.shutdown();
                });
                return;
            }
            // The server is stopping; finish the write here instead of
            // dropping the response on the floor.
        }

        // Writing
        match write_response(&context, &mut writer, &mut request, response, allow_another) {
            Ok(outcome) => {
                sticky_session = outcome.saved_session;

                // Draining: residual body bytes belong to this request and
                // must not be mistaken for the next one.
                if let Some(body) = request.body_mut() {
                    if !body.end_of_stream() {
                        if let Err(err) = body.drain() {
                            match err {
                                err @ (crate::body::BodyError::ChunkInvalidSize
                                | crate::body::BodyError::ChunkInvalidEnd) => {
                                    report_error!(context, ServerError::Chunk(err));
                                }
                                err => report_error!(context, ServerError::Drain(err)),
                            }
                            break;
                        }
                    }
                }

                if !outcome.keep_alive {
                    break;
                }
            }
            Err(err) => {
                report_error!(context, ServerError::Write(err));
                break;
            }
        }

        // Uploaded temp files of this cycle are deleted here.
        drop(request);
    }

    let _ = stream.shutdown();
    debug!("connection from {} closed", remote);
}

// Looks the client's session up from its cookies, falling back to the id
// retained from an earlier request of the same connection.
fn attach_session(context: &ServerContext, request: &mut Request, sticky: &Option<String>) {
    let cookie_name = &context.config().session_cookie_name;
    let ids: Vec<String> = request
        .cookies()
        .iter()
        .filter(|(name, _)| name == cookie_name)
        .map(|(_, value)| value.clone())
        .collect();

    let mut candidates = ids.clone();
    if let Some(id) = sticky {
        if !candidates.iter().any(|c| c == id) {
            candidates.push(id.clone());
        }
    }
    request.session.cookie_ids = ids;

    for id in candidates {
        if let Some(session) = context.sessions().find(&id) {
            request.session.attach(session);
            return;
        }
    }
}

pub(crate) struct WriteOutcome {
    /// True when the connection may serve another request.
    pub keep_alive: bool,
    /// Id of the session that was saved for this request, if any; the
    /// worker retains it for the next request of the connection.
    pub saved_session: Option<String>,
}

// The opened, measured version of a response body.
enum PreparedBody {
    Empty,
    Data(Vec<u8>),
    File {
        file: File,
        remaining: u64,
        rate: Option<TransferRate>,
    },
    Stream(crate::response::StreamingFn),
}

impl PreparedBody {
    fn length(&self) -> Option<u64> {
        match self {
            PreparedBody::Empty => Some(0),
            PreparedBody::Data(data) => Some(data.len() as u64),
            PreparedBody::File { remaining, .. } => Some(*remaining),
            PreparedBody::Stream(_) => None,
        }
    }
}

// Opens file bodies and clamps their range. The file handle only exists
// from here to the end of the write phase.
fn prepare_body(body: crate::response::ResponseBody) -> io::Result<PreparedBody> {
    match body.kind {
        BodyKind::Empty => Ok(PreparedBody::Empty),
        BodyKind::Data(data) => Ok(PreparedBody::Data(data)),
        BodyKind::File { path, range, rate } => {
            let mut file = File::open(path)?;
            let len = file.metadata()?.len();
            let (start, end) = match range {
                Some(range) => (range.start.min(len), range.end.min(len)),
                None => (0, len),
            };
            if start > 0 {
                file.seek(SeekFrom::Start(start))?;
            }
            Ok(PreparedBody::File {
                file,
                remaining: end.saturating_sub(start),
                rate,
            })
        }
        BodyKind::Stream(callback) => Ok(PreparedBody::Stream(callback)),
    }
}

/// Writes one response. The same code path runs on the connection worker
/// and on a hopped queue task; `client_keep_alive` is false for hops since
/// the hopped write is the last operation on the socket.
pub(crate) fn write_response(
    context: &ServerContext,
    writer: &mut StreamWriter,
    request: &mut Request,
    mut response: Response,
    client_keep_alive: bool,
) -> io::Result<WriteOutcome> {
    // Session cookies must be coherent with the manager before anything
    // is flushed.
    let saved_session = merge_session_cookies(context, request, &mut response);

    // Infer a Content-Type for file bodies from the path extension.
    if !header_present(&response.headers, "Content-Type") {
        if let BodyKind::File { path, .. } = &response.data.kind {
            let mime = mime_guess::from_path(path).first_or_octet_stream();
            response
                .headers
                .push(("Content-Type".into(), mime.to_string().into()));
        }
    }

    let upgrade = header_present(&response.headers, "Upgrade");
    let Response {
        mut status_code,
        mut reason,
        headers,
        data,
        ..
    } = response;

    let prepared = match prepare_body(data) {
        Ok(prepared) => prepared,
        Err(err) => {
            // The file vanished between routing and writing. Headers are
            // not flushed yet, so a clean 500 is still possible.
            log::warn!("response file body unavailable: {}", err);
            status_code = 500;
            reason = None;
            PreparedBody::Empty
        }
    };

    let version = request.version();
    let mut keep_alive = client_keep_alive;

    let length = prepared.length();
    // Chunked output needs an HTTP/1.1 peer; a 1.0 client gets a raw
    // stream delimited by the connection close.
    let chunked_out = length.is_none() && !upgrade && version == HttpVersion::V1_1;
    if length.is_none() && !chunked_out {
        keep_alive = false;
    }

    // Status line and headers, written exactly once per request.
    let mut head = Vec::with_capacity(256);
    let mut int_buffer = itoa::Buffer::new();
    head.extend_from_slice(b"HTTP/1.1 ");
    head.extend_from_slice(int_buffer.format(status_code).as_bytes());
    let reason = match &reason {
        Some(reason) => reason.as_ref(),
        None => crate::response::default_reason_phrase(status_code),
    };
    if !reason.is_empty() {
        head.push(b' ');
        head.extend_from_slice(reason.as_bytes());
    }
    head.extend_from_slice(b"\r\n");

    let mut found_server = false;
    let mut found_date = false;
    for (name, value) in &headers {
        // These are decided by the engine, whatever the handler put there.
        if name.eq_ignore_ascii_case("Content-Length")
            || name.eq_ignore_ascii_case("Transfer-Encoding")
            || name.eq_ignore_ascii_case("Connection")
            || name.eq_ignore_ascii_case("Keep-Alive")
            || name.eq_ignore_ascii_case("Trailer")
        {
            continue;
        }
        if name.eq_ignore_ascii_case("Server") {
            found_server = true;
        }
        if name.eq_ignore_ascii_case("Date") {
            found_date = true;
        }
        head.extend_from_slice(name.as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }

    if !found_server {
        if let Some(server) = &context.config().server_header {
            head.extend_from_slice(b"Server: ");
            head.extend_from_slice(server.as_bytes());
            head.extend_from_slice(b"\r\n");
        }
    }
    if !found_date {
        head.extend_from_slice(b"Date: ");
        head.extend_from_slice(crate::date::http_date_now().as_bytes());
        head.extend_from_slice(b"\r\n");
    }

    if upgrade {
        head.extend_from_slice(b"Connection: upgrade\r\n");
        keep_alive = false;
    } else if version == HttpVersion::V1_0 {
        // 1.0 keep-alive requests are deliberately not honoured.
        head.extend_from_slice(b"Connection: close\r\n");
        keep_alive = false;
    } else if keep_alive {
        head.extend_from_slice(b"Connection: keep-alive\r\n");
        head.extend_from_slice(b"Keep-Alive: timeout=");
        head.extend_from_slice(
            int_buffer
                .format(context.config().keep_alive_timeout.as_secs())
                .as_bytes(),
        );
        head.extend_from_slice(b", max=");
        head.extend_from_slice(
            int_buffer
                .format(context.config().max_requests_per_connection as u64)
                .as_bytes(),
        );
        head.extend_from_slice(b"\r\n");
    } else {
        head.extend_from_slice(b"Connection: close\r\n");
    }

    if !upgrade {
        if let Some(length) = length {
            head.extend_from_slice(b"Content-Length: ");
            head.extend_from_slice(int_buffer.format(length).as_bytes());
            head.extend_from_slice(b"\r\n");
        } else if chunked_out {
            head.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
        }
    }
    head.extend_from_slice(b"\r\n");
    writer.write_raw(&head)?;

    // Body.
    match prepared {
        PreparedBody::Empty => {}
        PreparedBody::Data(data) => writer.write_raw(&data)?,
        PreparedBody::File {
            mut file,
            mut remaining,
            rate,
        } => {
            let mut buffer = [0u8; FILE_BUFFER];
            while remaining > 0 {
                let want = (remaining as usize).min(buffer.len());
                let got = file.read(&mut buffer[..want])?;
                if got == 0 {
                    // The file shrank under us; the peer notices the short
                    // body through the Content-Length mismatch.
                    break;
                }
                writer.write_raw(&buffer[..got])?;
                remaining -= got as u64;
                if let Some(rate) = rate {
                    thread::sleep(rate.pause_for(got));
                }
            }
        }
        PreparedBody::Stream(callback) => {
            if chunked_out {
                writer.set_chunked(context.config().max_chunk_size);
            }
            let mut body = request.take_body().unwrap_or_else(RequestBody::empty);
            let result = callback(&mut body, writer);
            request.put_back_body(body);
            result?;
            writer.finish()?;
        }
    }
    writer.flush()?;

    Ok(WriteOutcome {
        keep_alive,
        saved_session,
    })
}

// Brings the session manager and the response's cookies in line with the
// session state the handler left on the request. Returns the id of the
// session that was saved, if any.
fn merge_session_cookies(
    context: &ServerContext,
    request: &mut Request,
    response: &mut Response,
) -> Option<String> {
    let cookie_name = context.config().session_cookie_name.clone();
    let manager = context.sessions();

    let mut saved = None;
    let mut expire = false;

    match request.session.attached.take() {
        Some(session) if session.is_invalidated() => {
            manager.remove(session.id());
            expire = true;
        }
        Some(session) if session.is_new() && session.is_empty() => {
            // A fresh session nobody wrote to is dropped silently.
        }
        Some(session) => {
            manager.save(&session);
            saved = Some(session.id().to_owned());
            request.session.attached = Some(session);
        }
        None => {}
    }

    // A cookie naming anything else than the live session is stale.
    if request
        .session
        .cookie_ids
        .iter()
        .any(|id| Some(id.as_str()) != saved.as_deref())
    {
        expire = true;
    }

    if let Some(id) = &saved {
        let cookie = SetCookie::new(cookie_name, id.clone())
            .with_path("/")
            .http_only()
            .with_max_age(manager.timeout().as_secs() as i64);
        response
            .headers
            .push(("Set-Cookie".into(), cookie.to_string().into()));
    } else if expire {
        let cookie = SetCookie::expired(cookie_name).with_path("/");
        response
            .headers
            .push(("Set-Cookie".into(), cookie.to_string().into()));
    }

    saved
}

// Writes the controller's 400 response for a request that never became a
// `Request`. The connection is closed afterwards in every case.
fn write_bad_request(context: &ServerContext, writer: &mut StreamWriter) {
    let response = context.controller().bad_request(context);
    let mut placeholder = Request::fake_http("GET", "/", Vec::new(), Vec::new());
    if let Err(err) = write_response(context, writer, &mut placeholder, response, false) {
        debug!("failed to deliver the 400 response: {}", err);
    }
}

fn header_present(headers: &[(std::borrow::Cow<'static, str>, std::borrow::Cow<'static, str>)], name: &str) -> bool {
    headers.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}
