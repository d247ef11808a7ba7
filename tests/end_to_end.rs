// Copyright (c) 2025 The Estaminet developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! End-to-end tests driving a real server over loopback sockets with
//! hand-written HTTP bytes, so the exact wire framing is asserted.

use std::io::Read;
use std::io::Write;
use std::net::SocketAddr;
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use estaminet::Address;
use estaminet::Response;
use estaminet::Router;
use estaminet::Server;
use estaminet::ServerBuilder;
use estaminet::ServerStopper;

struct TestServer {
    addr: SocketAddr,
    stopper: ServerStopper,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stopper.stop();
    }
}

fn start(router: Router) -> TestServer {
    start_with(router, |builder| builder)
}

fn start_with<F>(router: Router, configure: F) -> TestServer
where
    F: FnOnce(ServerBuilder) -> ServerBuilder,
{
    let server = configure(Server::builder("127.0.0.1:0"))
        .start(router)
        .unwrap();
    let addr = match server.server_addr() {
        Address::Tcp(addr) => *addr,
        #[cfg(unix)]
        Address::Unix(_) => unreachable!(),
    };
    let stopper = server.stopper();
    thread::spawn(move || server.run());
    TestServer { addr, stopper }
}

fn connect(server: &TestServer) -> TcpStream {
    let stream = TcpStream::connect(server.addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

struct RawResponse {
    head: String,
    body: Vec<u8>,
}

impl RawResponse {
    fn status_line(&self) -> &str {
        self.head.lines().next().unwrap_or("")
    }

    fn header(&self, name: &str) -> Option<String> {
        let prefix = format!("{}:", name.to_ascii_lowercase());
        self.head
            .lines()
            .find(|line| line.to_ascii_lowercase().starts_with(&prefix))
            .map(|line| line[prefix.len()..].trim().to_owned())
    }
}

fn read_response(stream: &mut TcpStream) -> RawResponse {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).unwrap();
        assert!(
            n > 0,
            "connection closed before the end of the headers: {:?}",
            String::from_utf8_lossy(&head)
        );
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();

    let response = RawResponse { head, body: Vec::new() };
    let body = if let Some(length) = response.header("Content-Length") {
        let length: usize = length.parse().unwrap();
        let mut body = vec![0u8; length];
        stream.read_exact(&mut body).unwrap();
        body
    } else if response.header("Transfer-Encoding").as_deref() == Some("chunked") {
        // Kept raw so tests can assert the exact chunked framing.
        let mut body = Vec::new();
        while !body.ends_with(b"0\r\n\r\n") {
            let n = stream.read(&mut byte).unwrap();
            assert!(n > 0, "connection closed inside a chunked body");
            body.push(byte[0]);
        }
        body
    } else {
        Vec::new()
    };

    RawResponse { body, ..response }
}

fn expect_closed(stream: &mut TcpStream) {
    let mut byte = [0u8; 1];
    match stream.read(&mut byte) {
        Ok(0) => {}
        Ok(_) => panic!("expected the server to close the connection"),
        // A reset is also a close from the client's point of view.
        Err(err) if err.kind() == std::io::ErrorKind::ConnectionReset => {}
        Err(err) => panic!("expected a close, got {}", err),
    }
}

fn hello_router() -> Router {
    let mut router = Router::new();
    router
        .get("/hello", |_, _, _| Response::text("hi"))
        .unwrap();
    router
}

#[test]
fn simple_get() {
    let server = start(hello_router());
    let mut stream = connect(&server);

    stream
        .write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let response = read_response(&mut stream);

    assert_eq!(response.status_line(), "HTTP/1.1 200 OK");
    assert_eq!(response.header("Content-Length").as_deref(), Some("2"));
    assert_eq!(response.body, b"hi");

    // The socket stays open for another request.
    stream
        .write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let second = read_response(&mut stream);
    assert_eq!(second.body, b"hi");
}

#[test]
fn not_found_is_a_404() {
    let server = start(hello_router());
    let mut stream = connect(&server);
    stream
        .write_all(b"GET /nothing HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let response = read_response(&mut stream);
    assert_eq!(response.status_line(), "HTTP/1.1 404 Not Found");
}

#[test]
fn chunked_echo() {
    let mut router = Router::new();
    router
        .post("/echo", |_, request, _| {
            let data = request.body_mut().unwrap().read_to_vec().unwrap();
            Response::stream(move |_input, output| output.write(&data))
        })
        .unwrap();
    let server = start(router);
    let mut stream = connect(&server);

    stream
        .write_all(
            b"POST /echo HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
        )
        .unwrap();
    let response = read_response(&mut stream);

    assert_eq!(response.status_line(), "HTTP/1.1 200 OK");
    assert_eq!(
        response.header("Transfer-Encoding").as_deref(),
        Some("chunked")
    );
    assert_eq!(response.body, b"5\r\nhello\r\n0\r\n\r\n");
}

#[test]
fn two_requests_keep_alive_in_order() {
    let server = start(hello_router());
    let mut stream = connect(&server);

    // Pipelined back to back in a single write.
    stream
        .write_all(
            b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\nGET /hello HTTP/1.1\r\nHost: x\r\n\r\n",
        )
        .unwrap();

    for _ in 0..2 {
        let response = read_response(&mut stream);
        assert_eq!(response.status_line(), "HTTP/1.1 200 OK");
        assert_eq!(
            response.header("Connection").as_deref(),
            Some("keep-alive")
        );
        assert_eq!(response.body, b"hi");
    }
}

#[test]
fn status_line_appears_exactly_once() {
    let server = start(hello_router());
    let mut stream = connect(&server);
    stream
        .write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let response = read_response(&mut stream);
    let blob = format!("{}{}", response.head, String::from_utf8_lossy(&response.body));
    assert_eq!(blob.matches("HTTP/1.1 200").count(), 1);
}

#[test]
fn content_length_plus_chunked_is_rejected() {
    let server = start(hello_router());
    let mut stream = connect(&server);

    stream
        .write_all(
            b"POST /hello HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\nTransfer-Encoding: chunked\r\n\r\n",
        )
        .unwrap();
    let response = read_response(&mut stream);
    assert_eq!(response.status_line(), "HTTP/1.1 400 Bad Request");
    expect_closed(&mut stream);
}

#[test]
fn zero_length_chunked_body_keeps_the_connection() {
    let mut router = hello_router();
    router
        .post("/submit", |_, _, _| Response::text("ok"))
        .unwrap();
    let server = start(router);
    let mut stream = connect(&server);

    stream
        .write_all(
            b"POST /submit HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n0\r\n\r\n",
        )
        .unwrap();
    let response = read_response(&mut stream);
    assert_eq!(response.body, b"ok");

    stream
        .write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let second = read_response(&mut stream);
    assert_eq!(second.body, b"hi");
}

#[test]
fn unread_body_is_drained_before_the_next_request() {
    let mut router = hello_router();
    router
        .post("/ignore", |_, _, _| Response::text("ignored"))
        .unwrap();
    let server = start(router);
    let mut stream = connect(&server);

    // The handler never reads the 11-byte body; the next request is
    // pipelined right behind it.
    stream
        .write_all(
            b"POST /ignore HTTP/1.1\r\nHost: x\r\nContent-Length: 11\r\n\r\nhello worldGET /hello HTTP/1.1\r\nHost: x\r\n\r\n",
        )
        .unwrap();

    let first = read_response(&mut stream);
    assert_eq!(first.body, b"ignored");
    let second = read_response(&mut stream);
    assert_eq!(second.body, b"hi");
}

#[test]
fn http_1_0_gets_connection_close() {
    let server = start(hello_router());
    let mut stream = connect(&server);
    stream
        .write_all(b"GET /hello HTTP/1.0\r\nHost: x\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let response = read_response(&mut stream);
    assert_eq!(response.header("Connection").as_deref(), Some("close"));
    assert_eq!(response.body, b"hi");
    expect_closed(&mut stream);
}

#[test]
fn malformed_head_is_a_400() {
    let server = start(hello_router());
    let mut stream = connect(&server);
    stream.write_all(b"GARBAGE\r\n").unwrap();
    let response = read_response(&mut stream);
    assert_eq!(response.status_line(), "HTTP/1.1 400 Bad Request");
    expect_closed(&mut stream);
}

#[test]
fn transformer_binding_end_to_end() {
    let mut router = Router::new();
    router
        .get("/users/:id{^[0-9]+$<Int>}", |_, _, bindings| {
            Response::text(format!("user #{}", bindings.get("id").unwrap()))
        })
        .unwrap();
    let server = start(router);
    let mut stream = connect(&server);

    stream
        .write_all(b"GET /users/42 HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let response = read_response(&mut stream);
    assert_eq!(response.body, b"user #42");

    stream
        .write_all(b"GET /users/abc HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let response = read_response(&mut stream);
    assert_eq!(response.status_line(), "HTTP/1.1 404 Not Found");
}

#[test]
fn hereafter_captures_the_whole_suffix() {
    let mut router = Router::new();
    router
        .get("/files/:rest{**}", |_, _, bindings| {
            Response::text(bindings.get("rest").unwrap().to_string())
        })
        .unwrap();
    let server = start(router);
    let mut stream = connect(&server);

    stream
        .write_all(b"GET /files/a/b/c HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let response = read_response(&mut stream);
    assert_eq!(response.body, b"a/b/c");
}

#[test]
fn session_sticks_to_the_connection() {
    let mut router = Router::new();
    router
        .get("/login", |_, request, _| {
            request.start_session().set("user", "lucie");
            Response::text("ok")
        })
        .unwrap();
    router
        .get("/whoami", |_, request, _| {
            let who = request
                .session()
                .and_then(|s| s.get("user"))
                .unwrap_or("anon")
                .to_owned();
            Response::text(who)
        })
        .unwrap();
    let server = start(router);
    let mut stream = connect(&server);

    stream
        .write_all(b"GET /login HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let login = read_response(&mut stream);
    let cookie = login.header("Set-Cookie").expect("session cookie missing");
    assert!(cookie.starts_with("SID="));

    // The client does not echo the cookie, yet the same connection still
    // sees the session.
    stream
        .write_all(b"GET /whoami HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let whoami = read_response(&mut stream);
    assert_eq!(whoami.body, b"lucie");
}

#[test]
fn invalidated_session_expires_its_cookie() {
    let mut router = Router::new();
    router
        .get("/login", |_, request, _| {
            request.start_session().set("user", "lucie");
            Response::text("ok")
        })
        .unwrap();
    router
        .get("/logout", |_, request, _| {
            if let Some(session) = request.session_mut() {
                session.invalidate();
            }
            Response::text("bye")
        })
        .unwrap();
    let server = start(router);
    let mut stream = connect(&server);

    stream
        .write_all(b"GET /login HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let login = read_response(&mut stream);
    let cookie = login.header("Set-Cookie").unwrap();
    let sid = cookie.split(';').next().unwrap().to_owned();

    stream
        .write_all(
            format!("GET /logout HTTP/1.1\r\nHost: x\r\nCookie: {}\r\n\r\n", sid).as_bytes(),
        )
        .unwrap();
    let logout = read_response(&mut stream);
    let expired = logout.header("Set-Cookie").unwrap();
    assert!(expired.contains("Max-Age=0"), "got `{}`", expired);
}

#[test]
fn multipart_upload_reaches_the_handler() {
    let mut router = Router::new();
    router
        .post("/upload", |_, request, _| {
            let file = &request.uploaded_files()[0];
            let stored = std::fs::read(file.path()).unwrap();
            Response::text(format!(
                "{}:{}:{}",
                request.form_field("caption").unwrap_or("?"),
                file.original_name().unwrap_or("?"),
                String::from_utf8_lossy(&stored),
            ))
        })
        .unwrap();
    let server = start(router);
    let mut stream = connect(&server);

    let body = b"--B\r\n\
        Content-Disposition: form-data; name=\"caption\"\r\n\r\n\
        holiday\r\n\
        --B\r\n\
        Content-Disposition: form-data; name=\"photo\"; filename=\"sea.txt\"\r\n\
        Content-Type: text/plain\r\n\r\n\
        waves\r\n\
        --B--\r\n";
    let request = format!(
        "POST /upload HTTP/1.1\r\nHost: x\r\nContent-Type: multipart/form-data; boundary=B\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    stream.write_all(request.as_bytes()).unwrap();
    stream.write_all(body).unwrap();

    let response = read_response(&mut stream);
    assert_eq!(response.body, b"holiday:sea.txt:waves");
}

#[test]
fn file_body_is_streamed_with_its_length() {
    let path = std::env::temp_dir().join(format!("estaminet-e2e-{}.txt", std::process::id()));
    std::fs::write(&path, b"0123456789").unwrap();

    let mut router = Router::new();
    let served = path.clone();
    router
        .get("/file", move |_, _, _| Response::from_file(served.clone()))
        .unwrap();
    let server = start(router);
    let mut stream = connect(&server);

    stream
        .write_all(b"GET /file HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let response = read_response(&mut stream);
    assert_eq!(response.header("Content-Length").as_deref(), Some("10"));
    assert_eq!(response.body, b"0123456789");
    assert!(response.header("Content-Type").is_some());

    let _ = std::fs::remove_file(&path);
}

#[test]
fn handler_panic_becomes_a_500() {
    let mut router = hello_router();
    router
        .get("/boom", |_, _, _| -> Response { panic!("kaboom") })
        .unwrap();
    let server = start(router);
    let mut stream = connect(&server);

    stream
        .write_all(b"GET /boom HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let response = read_response(&mut stream);
    assert_eq!(
        response.status_line(),
        "HTTP/1.1 500 Internal Server Error"
    );

    // The connection survives a panicking handler.
    stream
        .write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let second = read_response(&mut stream);
    assert_eq!(second.body, b"hi");
}

#[test]
fn queue_hop_serialises_under_cap() {
    let gauge = Arc::new(Mutex::new((0u32, 0u32)));
    let mut router = Router::new();
    let handler_gauge = gauge.clone();
    router
        .get("/slow", move |_, _, _| {
            let gauge = handler_gauge.clone();
            Response::stream(move |_input, output| {
                {
                    let mut g = gauge.lock().unwrap();
                    g.0 += 1;
                    g.1 = g.1.max(g.0);
                }
                thread::sleep(Duration::from_millis(150));
                output.write(b"done")?;
                gauge.lock().unwrap().0 -= 1;
                Ok(())
            })
            .on_queue("heavy")
        })
        .unwrap();

    let server = start_with(router, |builder| builder.queue_limit("heavy", 1));

    let mut clients = Vec::new();
    for _ in 0..2 {
        let addr = server.addr;
        clients.push(thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            stream
                .write_all(b"GET /slow HTTP/1.1\r\nHost: x\r\n\r\n")
                .unwrap();
            let response = read_response(&mut stream);
            assert!(response.body.ends_with(b"0\r\n\r\n"));
        }));
    }
    for client in clients {
        client.join().unwrap();
    }

    // The cap of 1 means the two writes never overlapped.
    assert_eq!(gauge.lock().unwrap().1, 1);
}

#[cfg(unix)]
#[test]
fn unix_socket_round_trip() {
    use std::os::unix::net::UnixStream;

    let path = std::env::temp_dir().join(format!("estaminet-e2e-{}.sock", std::process::id()));
    let _ = std::fs::remove_file(&path);

    let server = Server::builder(&format!("unix://{}", path.display()))
        .start(hello_router())
        .unwrap();
    let stopper = server.stopper();
    thread::spawn(move || server.run());

    let mut stream = UnixStream::connect(&path).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
        .write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        assert!(stream.read(&mut byte).unwrap() > 0);
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();
    assert!(head.starts_with("HTTP/1.1 200 OK"));
    let mut body = [0u8; 2];
    stream.read_exact(&mut body).unwrap();
    assert_eq!(&body, b"hi");

    stopper.stop();
}
