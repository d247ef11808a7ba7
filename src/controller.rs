// Copyright (c) 2025 The Estaminet developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Routing of requests to handlers.
//!
//! The engine dispatches every parsed request through a
//! [`RouteController`]; the crate ships [`Router`], a route table built
//! from route-pattern strings, ordered so that exact routes win over
//! wildcard routes at the same position. Hosts with exotic needs can
//! implement the trait themselves.

use std::fmt;

use crate::request::Request;
use crate::response::Response;
use crate::route::MatchError;
use crate::route::ParseError;
use crate::route::RouteMatch;
use crate::route::RoutePath;
use crate::route::TransformerRegistry;
use crate::ServerContext;

/// A failure the engine converts into an internal-error response.
#[derive(Debug, Clone)]
pub enum HandlerError {
    /// The handler panicked; the payload is its message when it had one.
    Panicked(String),
    /// A route names a transformer nobody registered.
    MissingTransformer(String),
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HandlerError::Panicked(msg) => write!(f, "handler panicked: {}", msg),
            HandlerError::MissingTransformer(name) => {
                write!(f, "no transformer registered under the name `{}`", name)
            }
        }
    }
}

impl std::error::Error for HandlerError {}

/// Produces a `Response` for every `Request` of a connection.
pub trait RouteController: Send + Sync {
    /// Handles one request. Not matching anything is still a response,
    /// typically a 404.
    fn handle(&self, context: &ServerContext, request: &mut Request) -> Response;

    /// The response written when a request does not parse as HTTP.
    fn bad_request(&self, _context: &ServerContext) -> Response {
        Response::empty_400()
    }

    /// The response written when no route matched.
    fn not_found(&self, _context: &ServerContext, _request: &mut Request) -> Response {
        Response::empty_404()
    }

    /// The response written when a handler failed. Only used while the
    /// response headers are not flushed yet; afterwards the connection is
    /// killed instead.
    fn internal_error(&self, _context: &ServerContext, _error: &HandlerError) -> Response {
        Response::html(
            "<h1>Internal Server Error</h1>\
             <p>An internal error has occurred on the server.</p>",
        )
        .with_status_code(500)
    }
}

/// A handler attached to one route.
pub type RouteHandler =
    Box<dyn Fn(&ServerContext, &mut Request, &RouteMatch) -> Response + Send + Sync>;

struct RouteEntry {
    method: Option<String>,
    path: RoutePath,
    handler: RouteHandler,
}

/// Route table dispatching on method and route pattern.
///
/// # Example
///
/// ```
/// use estaminet::{Response, Router};
///
/// let mut router = Router::new();
/// router
///     .get("/users/:id{^[0-9]+$<Int>}", |_ctx, _request, m| {
///         Response::text(format!("user #{}", m.get("id").unwrap()))
///     })
///     .unwrap();
/// ```
pub struct Router {
    entries: Vec<RouteEntry>,
    transformers: TransformerRegistry,
}

impl Router {
    /// An empty router with the default transformers registered.
    pub fn new() -> Router {
        Router {
            entries: Vec::new(),
            transformers: TransformerRegistry::with_defaults(),
        }
    }

    /// An empty router with a custom transformer registry.
    pub fn with_transformers(transformers: TransformerRegistry) -> Router {
        Router { entries: Vec::new(), transformers }
    }

    /// The registry used at match time, for registering host transformers.
    pub fn transformers_mut(&mut self) -> &mut TransformerRegistry {
        &mut self.transformers
    }

    /// Registers a route. `method` of `None` matches every method. Routes
    /// are tried most-specific first regardless of registration order.
    pub fn add<F>(
        &mut self,
        method: Option<&str>,
        route: &str,
        handler: F,
    ) -> Result<&mut Router, ParseError>
    where
        F: Fn(&ServerContext, &mut Request, &RouteMatch) -> Response + Send + Sync + 'static,
    {
        let path = RoutePath::parse(route)?;
        self.entries.push(RouteEntry {
            method: method.map(str::to_owned),
            path,
            handler: Box::new(handler),
        });
        // Stable sort keeps registration order between routes of equal
        // precedence.
        self.entries.sort_by(|a, b| a.path.cmp_precedence(&b.path));
        Ok(self)
    }

    pub fn get<F>(&mut self, route: &str, handler: F) -> Result<&mut Router, ParseError>
    where
        F: Fn(&ServerContext, &mut Request, &RouteMatch) -> Response + Send + Sync + 'static,
    {
        self.add(Some("GET"), route, handler)
    }

    pub fn post<F>(&mut self, route: &str, handler: F) -> Result<&mut Router, ParseError>
    where
        F: Fn(&ServerContext, &mut Request, &RouteMatch) -> Response + Send + Sync + 'static,
    {
        self.add(Some("POST"), route, handler)
    }

    pub fn put<F>(&mut self, route: &str, handler: F) -> Result<&mut Router, ParseError>
    where
        F: Fn(&ServerContext, &mut Request, &RouteMatch) -> Response + Send + Sync + 'static,
    {
        self.add(Some("PUT"), route, handler)
    }

    pub fn delete<F>(&mut self, route: &str, handler: F) -> Result<&mut Router, ParseError>
    where
        F: Fn(&ServerContext, &mut Request, &RouteMatch) -> Response + Send + Sync + 'static,
    {
        self.add(Some("DELETE"), route, handler)
    }
}

impl RouteController for Router {
    fn handle(&self, context: &ServerContext, request: &mut Request) -> Response {
        for entry in &self.entries {
            if let Some(method) = &entry.method {
                if !method.eq_ignore_ascii_case(request.method()) {
                    continue;
                }
            }
            match entry.path.matches_request(request, &self.transformers) {
                Ok(Some(bindings)) => return (entry.handler)(context, request, &bindings),
                Ok(None) => continue,
                Err(MatchError::MissingTransformer(name)) => {
                    return self
                        .internal_error(context, &HandlerError::MissingTransformer(name));
                }
            }
        }
        self.not_found(context, request)
    }
}

#[cfg(test)]
mod tests {
    use super::RouteController;
    use super::Router;
    use crate::request::Request;
    use crate::response::Response;
    use crate::ServerContext;

    fn context() -> ServerContext {
        ServerContext::detached(Default::default())
    }

    fn dispatch(router: &Router, method: &str, target: &str) -> Response {
        let mut request = Request::fake_http(method, target, vec![], Vec::new());
        router.handle(&context(), &mut request)
    }

    #[test]
    fn routes_dispatch_by_method_and_path() {
        let mut router = Router::new();
        router.get("/a", |_, _, _| Response::text("get-a")).unwrap();
        router.post("/a", |_, _, _| Response::text("post-a")).unwrap();

        assert_eq!(dispatch(&router, "GET", "/a").status_code, 200);
        assert_eq!(dispatch(&router, "POST", "/a").status_code, 200);
        assert_eq!(dispatch(&router, "DELETE", "/a").status_code, 404);
        assert_eq!(dispatch(&router, "GET", "/b").status_code, 404);
    }

    #[test]
    fn exact_route_wins_over_wildcard() {
        let mut router = Router::new();
        // Registered wildcard-first on purpose.
        router
            .get("/files/**", |_, _, _| Response::text("wild"))
            .unwrap();
        router
            .get("/files/index", |_, _, _| {
                Response::text("exact").with_status_code(201)
            })
            .unwrap();

        assert_eq!(dispatch(&router, "GET", "/files/index").status_code, 201);
        assert_eq!(dispatch(&router, "GET", "/files/other").status_code, 200);
    }

    #[test]
    fn identifier_bindings_reach_the_handler() {
        let mut router = Router::new();
        router
            .get("/users/:id{^[0-9]+$<Int>}", |_, _, m| {
                Response::text(format!("#{}", m.get("id").unwrap()))
            })
            .unwrap();

        assert_eq!(dispatch(&router, "GET", "/users/42").status_code, 200);
        assert_eq!(dispatch(&router, "GET", "/users/abc").status_code, 404);
    }

    #[test]
    fn missing_transformer_is_a_500() {
        let mut router = Router::new();
        router
            .get("/x/:v{<Missing>}", |_, _, _| Response::text("never"))
            .unwrap();
        assert_eq!(dispatch(&router, "GET", "/x/1").status_code, 500);
    }

    #[test]
    fn bad_route_string_is_rejected_at_registration() {
        let mut router = Router::new();
        assert!(router.get("no-leading-slash", |_, _, _| Response::text("")).is_err());
    }
}
