//! The routing trie.
//!
//! Every [`Router`] is a node keyed by one path segment. A node owns:
//! - literal children keyed by segment, plus at most one parameter child keyed `:name`
//! - a middleware list run when a request descends through the node
//! - per-method handler lists run when a request ends at the node
//!
//! Matching advances exactly one segment per node, so lookup is O(depth) and never
//! backtracks. When a node has a parameter child, every segment at that position binds
//! the parameter.
//!
//! # Example
//!
//! ```no_run
//! use arbor_web::{Context, Router};
//!
//! let mut router = Router::new();
//! router.get("/users/:id", |ctx: Context| async move {
//!     let id = ctx.param("id");
//!     ctx.text(format!("u={id}"))
//! });
//! ```

use crate::body::{req_body, ResponseBody};
use crate::context::Context;
use crate::error::{finally, BoxError, StatusError};
use crate::handler::{BoxHandler, Handler};
use bytes::Bytes;
use futures::FutureExt;
use http::{HeaderValue, Method, Request, Response};
use http_body::Body as HttpBody;
use percent_encoding::percent_decode_str;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, trace, warn};

/// Value of the `Allow` header answered to `OPTIONS *`.
pub const ALLOW_ALL: &str = "OPTIONS, GET, HEAD, POST, PUT, PATCH, DELETE";

#[derive(Default)]
pub struct Router {
    param: Option<String>,
    children: HashMap<String, Arc<Router>>,
    middlewares: Vec<BoxHandler>,
    handlers: HashMap<Method, Vec<BoxHandler>>,
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("param", &self.param)
            .field("children", &self.children.keys().collect::<Vec<_>>())
            .field("middlewares", &self.middlewares.len())
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves the node for `pattern`, creating missing nodes on the way.
    ///
    /// # Panics
    ///
    /// Registration errors are programmer errors:
    /// - `pattern` does not start with `/`
    /// - a segment `:b` is registered under a node that already binds `:a`
    /// - the tree is already shared with a running server
    pub fn route(&mut self, pattern: &str) -> &mut Router {
        let Some(pattern) = pattern.strip_prefix('/') else {
            panic!("invalid router pattern: {pattern:?}");
        };
        let (key, rest) = match pattern.find('/') {
            Some(i) => (&pattern[..i], Some(&pattern[i..])),
            None => (pattern, None),
        };

        if self.shadows(key) {
            warn!(key, param = ?self.param, "parameter shadows literal siblings");
        }
        if is_param(key) && !self.children.contains_key(key) {
            if let Some(bound) = &self.param {
                panic!("conflict between parameters {bound} and {key}");
            }
            self.param = Some(key.to_owned());
        }

        let child = self.children.entry(key.to_owned()).or_default();
        let Some(child) = Arc::get_mut(child) else {
            panic!("routes must be registered before the router is served");
        };

        match rest {
            Some(rest) => child.route(rest),
            None => child,
        }
    }

    /// Whether adding the child `key` leaves a literal child unreachable behind a
    /// parameter, in either registration order.
    fn shadows(&self, key: &str) -> bool {
        if self.children.contains_key(key) {
            return false;
        }
        if is_param(key) {
            self.param.is_none() && !self.children.is_empty()
        } else {
            self.param.is_some()
        }
    }

    /// Appends middlewares run whenever a request descends through this node.
    pub fn middleware<H: Handler>(&mut self, handler: H) -> &mut Self {
        self.middlewares.push(Arc::new(handler));
        self
    }

    /// Appends `handler` to the `method` handlers of the node at `pattern`.
    pub fn handle<H: Handler>(&mut self, method: Method, pattern: &str, handler: H) -> &mut Self {
        self.route(pattern).handlers.entry(method).or_default().push(Arc::new(handler));
        self
    }

    /// Consumes one segment of `path`.
    ///
    /// Returns the child node, the unconsumed rest of the path and, if this node binds a
    /// parameter, the consumed segment as its value. `None` means no route.
    pub fn matches<'p>(&self, path: &'p str) -> Option<(&Arc<Router>, &'p str, Option<&'p str>)> {
        let path = path.strip_prefix('/')?;
        let (segment, rest) = match path.find('/') {
            Some(i) => (&path[..i], &path[i..]),
            None => (path, ""),
        };

        match &self.param {
            Some(key) => self.children.get(key).map(|child| (child, rest, Some(segment))),
            None => self.children.get(segment).map(|child| (child, rest, None)),
        }
    }

    /// The name of the parameter bound at this node, without the leading `:`.
    pub fn param_name(&self) -> Option<&str> {
        self.param.as_deref().map(|key| &key[1..])
    }

    pub(crate) fn middlewares(&self) -> &[BoxHandler] {
        &self.middlewares
    }

    pub(crate) fn handlers(&self, method: &Method) -> Option<&[BoxHandler]> {
        self.handlers.get(method).map(Vec::as_slice)
    }

    /// The methods with handlers at this node, as an `Allow` header value.
    pub(crate) fn allowed_methods(&self) -> HeaderValue {
        let mut methods = self.handlers.keys().map(Method::as_str).collect::<Vec<_>>();
        methods.sort_unstable();
        HeaderValue::from_str(&methods.join(", ")).unwrap_or_else(|_| HeaderValue::from_static(""))
    }

    /// Dispatches one request through the trie rooted at `self`.
    ///
    /// The path is percent-decoded before routing; one that does not decode to UTF-8 is
    /// answered with 400. Panics raised by handlers are caught and answered with 500.
    pub async fn serve<B>(self: &Arc<Self>, req: Request<B>, remote_addr: Option<SocketAddr>) -> Response<ResponseBody>
    where
        B: HttpBody<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let (parts, body) = req.into_parts();

        let (mut path, malformed) = match percent_decode_str(parts.uri.path()).decode_utf8() {
            Ok(path) => (path.into_owned(), None),
            Err(e) => (parts.uri.path().to_owned(), Some(e)),
        };
        if !path.starts_with('/') {
            path.insert(0, '/');
        }

        if parts.method == Method::OPTIONS && path == "/*" {
            return Response::builder()
                .header(http::header::ALLOW, HeaderValue::from_static(ALLOW_ALL))
                .body(ResponseBody::empty())
                .unwrap_or_else(|_| Response::new(ResponseBody::empty()));
        }

        trace!(method = %parts.method, path, "dispatch");
        let ctx = Context::new(Arc::clone(self), parts, path, req_body(body), remote_addr);
        if let Some(e) = malformed {
            finally(&ctx, Err(StatusError::bad_request(e).into()));
            return ctx.into_response();
        }
        let result = match AssertUnwindSafe(ctx.next()).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let msg = panic_message(panic.as_ref());
                error!(method = %ctx.method(), path = ctx.path(), panic = msg, "handler panicked");
                Err(StatusError::internal(msg).into())
            }
        };
        finally(&ctx, result);
        ctx.into_response()
    }
}

macro_rules! method_handle {
    ($method:ident, $upper_case_method:ident) => {
        #[doc = concat!("Registers `handler` for ", stringify!($upper_case_method), " requests at `pattern`.")]
        pub fn $method<H: Handler>(&mut self, pattern: &str, handler: H) -> &mut Self {
            self.handle(Method::$upper_case_method, pattern, handler)
        }
    };
}

impl Router {
    method_handle!(get, GET);
    method_handle!(head, HEAD);
    method_handle!(post, POST);
    method_handle!(put, PUT);
    method_handle!(patch, PATCH);
    method_handle!(delete, DELETE);
    method_handle!(options, OPTIONS);
}

fn is_param(key: &str) -> bool {
    key.len() > 1 && key.starts_with(':')
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
