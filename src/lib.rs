// Copyright (c) 2025 The Estaminet developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! An embeddable HTTP/1.1 server.
//!
//! Estaminet is meant to be compiled into an application (a test
//! fixture, a local tool, a small service) rather than run as a
//! general-purpose front server. It accepts TCP or Unix-domain
//! connections, serves each one on its own worker thread with keep-alive,
//! chunked transfer, file streaming and session cookies, and bounds the
//! work in flight through named worker queues.
//!
//! # Example
//!
//! ```no_run
//! use estaminet::{Response, Router, Server};
//!
//! let mut router = Router::new();
//! router
//!     .get("/hello", |_ctx, _request, _bindings| Response::text("hi"))
//!     .unwrap();
//!
//! let server = Server::new("127.0.0.1:8080", router).unwrap();
//! println!("listening on {}", server.server_addr());
//! server.run();
//! ```
//!
//! Routes are plain strings in a small pattern grammar; see the
//! [`route`] module. A handler can capture typed path segments, gate on
//! query parameters, stream its response, or hop the response's write
//! phase onto a bounded background queue with [`Response::on_queue`].

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

// Reports an engine error once: to the log and to the host's error hook,
// with the location that noticed it.
macro_rules! report_error {
    ($context:expr, $err:expr) => {
        $context.report($err, file!(), line!())
    };
}

pub mod body;
pub mod controller;
pub mod date;
pub mod headers;
pub mod multipart;
pub mod queues;
pub mod request;
pub mod response;
pub mod route;
pub mod schemes;
pub mod session;
pub mod stream;
mod worker;

pub use crate::body::BodyError;
pub use crate::body::RequestBody;
pub use crate::controller::HandlerError;
pub use crate::controller::RouteController;
pub use crate::controller::RouteHandler;
pub use crate::controller::Router;
pub use crate::headers::ConnectionDirective;
pub use crate::headers::HeaderError;
pub use crate::headers::Headers;
pub use crate::headers::HttpVersion;
pub use crate::headers::SetCookie;
pub use crate::multipart::MultipartError;
pub use crate::queues::QueueConfigError;
pub use crate::queues::QueueId;
pub use crate::queues::WorkerQueues;
pub use crate::request::Request;
pub use crate::request::RequestError;
pub use crate::request::UploadedFile;
pub use crate::response::Response;
pub use crate::response::ResponseBody;
pub use crate::response::TransferRate;
pub use crate::response::WriteQueue;
pub use crate::route::RouteMatch;
pub use crate::route::RoutePath;
pub use crate::route::RouteValue;
pub use crate::route::TransformerRegistry;
pub use crate::session::InMemorySessionManager;
pub use crate::session::Session;
pub use crate::session::SessionManager;
pub use crate::stream::writer::StreamWriter;
pub use crate::stream::Address;
pub use crate::stream::AddressParseError;
pub use crate::stream::RemoteAddr;

use crate::queues::QueuePermit;
use crate::stream::Listener;

/// Tunables of a server. The defaults suit an embedded test server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// How long the first request of a connection may take to arrive.
    /// Later requests of a keep-alive connection wait indefinitely.
    pub initial_request_timeout: Duration,
    /// Advertised in the `Keep-Alive` response header.
    pub keep_alive_timeout: Duration,
    /// A connection is closed after serving this many requests.
    pub max_requests_per_connection: usize,
    /// Value of the `Server` response header; `None` omits it.
    pub server_header: Option<String>,
    /// Name of the session cookie.
    pub session_cookie_name: String,
    /// Where multipart uploads are spooled; the OS temp directory plus
    /// the crate name when `None`.
    pub tmp_root: Option<PathBuf>,
    /// Accept bare-LF line endings in request heads.
    pub lenient_line_endings: bool,
    /// Splits chunked response writes into chunks of at most this size.
    pub max_chunk_size: Option<usize>,
    /// Lifetime of the default in-memory session store.
    pub session_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            initial_request_timeout: Duration::from_secs(10),
            keep_alive_timeout: Duration::from_secs(5),
            max_requests_per_connection: 100,
            server_header: Some("estaminet".to_owned()),
            session_cookie_name: "SID".to_owned(),
            tmp_root: None,
            lenient_line_endings: false,
            max_chunk_size: None,
            session_timeout: Duration::from_secs(3600),
        }
    }
}

/// An error the engine converted into a response or a closed connection,
/// reported once through the server-error hook.
#[derive(Debug)]
pub enum ServerError {
    /// Malformed request head or headers; answered with a 400.
    BadRequest(RequestError),
    /// The first request of a connection never arrived.
    ConnectionTimedOut,
    /// Invalid chunk framing in a request body.
    Chunk(BodyError),
    /// Discarding the residual body failed; the connection was killed.
    Drain(BodyError),
    /// An I/O failure while writing; the connection was killed.
    Write(io::Error),
    /// A handler panicked; answered with the controller's internal-error
    /// response.
    HandlerPanicked(String),
    /// A multipart body did not parse; answered with a 400.
    Multipart(MultipartError),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ServerError::BadRequest(err) => write!(f, "bad request: {}", err),
            ServerError::ConnectionTimedOut => {
                write!(f, "timed out waiting for the first request")
            }
            ServerError::Chunk(err) => write!(f, "chunk framing error: {}", err),
            ServerError::Drain(err) => write!(f, "failed to drain the request body: {}", err),
            ServerError::Write(err) => write!(f, "write failure: {}", err),
            ServerError::HandlerPanicked(msg) => write!(f, "handler panicked: {}", msg),
            ServerError::Multipart(err) => write!(f, "multipart error: {}", err),
        }
    }
}

impl std::error::Error for ServerError {}

type ErrorHook = Box<dyn Fn(&ServerError, &'static str, u32) + Send + Sync>;

/// Everything a handler can reach about the server it runs in. Passed
/// explicitly to handlers instead of living in thread-local state.
pub struct ServerContext {
    config: ServerConfig,
    controller: Arc<dyn RouteController>,
    sessions: Arc<dyn SessionManager>,
    queues: WorkerQueues,
    stopping: Arc<AtomicBool>,
    error_hook: Option<ErrorHook>,
}

impl ServerContext {
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<dyn SessionManager> {
        &self.sessions
    }

    pub fn queues(&self) -> &WorkerQueues {
        &self.queues
    }

    /// True once `stop` was called. Long-running handlers should poll
    /// this and wind down.
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Relaxed)
    }

    pub(crate) fn controller(&self) -> &Arc<dyn RouteController> {
        &self.controller
    }

    // The spool directory for one request's uploads.
    pub(crate) fn upload_dir(&self, host: Option<&str>) -> PathBuf {
        let root = match &self.config.tmp_root {
            Some(root) => root.clone(),
            None => std::env::temp_dir().join("estaminet"),
        };
        let host = match host {
            Some(host) if !host.is_empty() => host
                .chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_') {
                        c
                    } else {
                        '_'
                    }
                })
                .collect(),
            _ => "default".to_owned(),
        };
        root.join(host)
    }

    pub(crate) fn report(&self, error: ServerError, file: &'static str, line: u32) {
        log::error!("{} ({}:{})", error, file, line);
        if let Some(hook) = &self.error_hook {
            hook(&error, file, line);
        }
    }

    // A context with no listener behind it, for handler-level tests.
    #[cfg(test)]
    pub(crate) fn detached(config: ServerConfig) -> ServerContext {
        struct NoRoutes;
        impl RouteController for NoRoutes {
            fn handle(&self, context: &ServerContext, request: &mut Request) -> Response {
                self.not_found(context, request)
            }
        }

        let stopping = Arc::new(AtomicBool::new(false));
        let session_timeout = config.session_timeout;
        ServerContext {
            config,
            controller: Arc::new(NoRoutes),
            sessions: Arc::new(InMemorySessionManager::new(session_timeout)),
            queues: WorkerQueues::new(stopping.clone()),
            stopping,
            error_hook: None,
        }
    }
}

/// Error while setting a server up.
#[derive(Debug)]
pub enum ServerStartError {
    /// The address string did not parse.
    Address(AddressParseError),
    /// Binding the listener failed.
    Io(io::Error),
    /// A queue limit was invalid.
    Queue(QueueConfigError),
}

impl From<AddressParseError> for ServerStartError {
    fn from(err: AddressParseError) -> ServerStartError {
        ServerStartError::Address(err)
    }
}

impl From<io::Error> for ServerStartError {
    fn from(err: io::Error) -> ServerStartError {
        ServerStartError::Io(err)
    }
}

impl From<QueueConfigError> for ServerStartError {
    fn from(err: QueueConfigError) -> ServerStartError {
        ServerStartError::Queue(err)
    }
}

impl fmt::Display for ServerStartError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ServerStartError::Address(err) => write!(f, "invalid address: {}", err),
            ServerStartError::Io(err) => write!(f, "could not bind: {}", err),
            ServerStartError::Queue(err) => write!(f, "invalid queue configuration: {}", err),
        }
    }
}

impl std::error::Error for ServerStartError {}

/// Configures a [`Server`] before it starts listening.
///
/// # Example
///
/// ```no_run
/// use estaminet::{Response, Router, Server, ServerConfig};
///
/// let mut router = Router::new();
/// router.get("/", |_, _, _| Response::text("home")).unwrap();
///
/// let server = Server::builder("127.0.0.1:0")
///     .config(ServerConfig::default())
///     .queue_limit("heavy", 1)
///     .start(router)
///     .unwrap();
/// server.run();
/// ```
pub struct ServerBuilder {
    address: String,
    config: ServerConfig,
    sessions: Option<Arc<dyn SessionManager>>,
    error_hook: Option<ErrorHook>,
    queue_limits: Vec<(QueueId, i64)>,
    global_limit: Option<i64>,
}

impl ServerBuilder {
    fn new(address: &str) -> ServerBuilder {
        ServerBuilder {
            address: address.to_owned(),
            config: ServerConfig::default(),
            sessions: None,
            error_hook: None,
            queue_limits: Vec::new(),
            global_limit: None,
        }
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: ServerConfig) -> ServerBuilder {
        self.config = config;
        self
    }

    /// Uses a host-provided session store instead of the built-in
    /// in-memory one. The host is then responsible for expiring sessions.
    pub fn session_manager(mut self, manager: Arc<dyn SessionManager>) -> ServerBuilder {
        self.sessions = Some(manager);
        self
    }

    /// Installs the server-error event hook, called once per converted
    /// error with the source location that noticed it.
    pub fn on_error<F>(mut self, hook: F) -> ServerBuilder
    where
        F: Fn(&ServerError, &'static str, u32) + Send + Sync + 'static,
    {
        self.error_hook = Some(Box::new(hook));
        self
    }

    /// Bounds a worker queue. `-1` means unlimited.
    pub fn queue_limit<Q>(mut self, queue: Q, max: i64) -> ServerBuilder
    where
        Q: Into<QueueId>,
    {
        self.queue_limits.push((queue.into(), max));
        self
    }

    /// Bounds the request queue specifically.
    pub fn request_queue_limit(mut self, max: i64) -> ServerBuilder {
        self.queue_limits.push((QueueId::Request, max));
        self
    }

    /// Bounds the sum of all queues. `-1` means unlimited.
    pub fn global_queue_limit(mut self, max: i64) -> ServerBuilder {
        self.global_limit = Some(max);
        self
    }

    /// Binds the listener and builds the server.
    pub fn start<C>(self, controller: C) -> Result<Server, ServerStartError>
    where
        C: RouteController + 'static,
    {
        let address = Address::parse(&self.address)?;
        let listener = Listener::bind(&address)?;
        let local_addr = listener.local_addr()?;

        let stopping = Arc::new(AtomicBool::new(false));
        let queues = WorkerQueues::new(stopping.clone());
        for (queue, max) in self.queue_limits {
            queues.set_limit(queue, max)?;
        }
        if let Some(max) = self.global_limit {
            queues.set_global_limit(max)?;
        }

        let sessions: Arc<dyn SessionManager> = match self.sessions {
            Some(manager) => manager,
            None => {
                let manager =
                    Arc::new(InMemorySessionManager::new(self.config.session_timeout));
                let _ = session::spawn_sweeper(manager.clone(), stopping.clone());
                manager
            }
        };

        let context = Arc::new(ServerContext {
            config: self.config,
            controller: Arc::new(controller),
            sessions,
            queues,
            stopping,
            error_hook: self.error_hook,
        });

        Ok(Server {
            context,
            listener,
            local_addr,
        })
    }
}

/// A listening server.
///
/// `run` blocks and serves until [`Server::stop`] (or a
/// [`ServerStopper`]) is invoked from another thread.
pub struct Server {
    context: Arc<ServerContext>,
    listener: Listener,
    local_addr: Address,
}

impl Server {
    /// Builds and starts a server with the default configuration.
    pub fn new<C>(address: &str, controller: C) -> Result<Server, ServerStartError>
    where
        C: RouteController + 'static,
    {
        Server::builder(address).start(controller)
    }

    /// Starts configuring a server.
    pub fn builder(address: &str) -> ServerBuilder {
        ServerBuilder::new(address)
    }

    /// The address the listener is bound to. With port 0 this is the port
    /// the OS picked.
    pub fn server_addr(&self) -> &Address {
        &self.local_addr
    }

    /// The context handed to every handler.
    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    /// A handle that can stop the server from another thread.
    pub fn stopper(&self) -> ServerStopper {
        ServerStopper {
            stopping: self.context.stopping.clone(),
            queues: self.context.queues.clone(),
        }
    }

    /// Raises the stopping flag and wakes every admission waiter. In
    /// flight responses finish; idle keep-alive connections close at
    /// their next polling point.
    pub fn stop(&self) {
        self.context.stopping.store(true, Ordering::Relaxed);
        self.context.queues.notify_stop();
    }

    /// Accepts and serves connections until stopped.
    pub fn run(&self) {
        if let Err(err) = self.listener.set_nonblocking(true) {
            report_error!(self.context, ServerError::Write(err));
            return;
        }

        loop {
            if self.context.is_stopping() {
                break;
            }
            match self.listener.accept() {
                Ok((stream, remote)) => {
                    if stream.set_nonblocking(false).is_err() {
                        continue;
                    }
                    // Admission: the connection only gets a worker thread
                    // once the request queue has room.
                    let permit: QueuePermit =
                        match self.context.queues.acquire(&QueueId::Request) {
                            Some(permit) => permit,
                            None => break, // stopping
                        };
                    let context = self.context.clone();
                    thread::spawn(move || {
                        worker::handle_connection(stream, remote, context, permit);
                    });
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(50));
                }
                Err(err) => {
                    report_error!(self.context, ServerError::Write(err));
                    thread::sleep(Duration::from_millis(50));
                }
            }
        }
    }
}

/// Stops a running server from another thread.
#[derive(Clone)]
pub struct ServerStopper {
    stopping: Arc<AtomicBool>,
    queues: WorkerQueues,
}

impl ServerStopper {
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Relaxed);
        self.queues.notify_stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopping.load(Ordering::Relaxed)
    }
}
