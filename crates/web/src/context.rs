//! The per-request context and the dispatch state machine.
//!
//! A [`Context`] is a cursor into the routing trie plus a handle to state shared by
//! every frame of one request: the request head and body, matched parameters, the
//! scratch map and the pending response. [`Context::next`] advances the cursor by one
//! step and successor frames are cheap clones that differ only in the cursor, so a
//! middleware sees whatever its downstream wrote into shared state once `next` returns.

use crate::body::{req_body, ReqBody, ResponseBody};
use crate::error::{BoxError, Error, Result, StatusError};
use crate::form::Form;
use crate::router::Router;
use bytes::Bytes;
use futures::future::BoxFuture;
use http::header::{AsHeaderName, IntoHeaderName};
use http::request::Parts;
use http::{HeaderMap, HeaderValue, Method, Response, StatusCode, Uri, Version};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use tracing::debug;

pub(crate) const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
pub(crate) const APPLICATION_JSON: &str = "application/json; charset=utf-8";
pub(crate) const APPLICATION_XML: &str = "application/xml; charset=utf-8";

#[derive(Clone)]
pub struct Context {
    shared: Arc<Shared>,
    router: Arc<Router>,
    // byte offset of the unconsumed path suffix
    offset: usize,
    // negative while walking middlewares, then the index of the next leaf handler
    index: isize,
}

struct Shared {
    head: Parts,
    path: String,
    remote_addr: Option<SocketAddr>,
    query: OnceLock<Vec<(String, String)>>,
    body: tokio::sync::Mutex<BodyState>,
    state: Mutex<State>,
}

struct BodyState {
    raw: Option<ReqBody>,
    bytes: Option<Bytes>,
    form: Option<Arc<Form>>,
}

#[derive(Default)]
struct State {
    params: HashMap<String, String>,
    scratch: HashMap<String, Arc<dyn Any + Send + Sync>>,
    status: Option<StatusCode>,
    headers: HeaderMap,
    written: Option<(StatusCode, ResponseBody)>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("method", self.method())
            .field("path", &self.path())
            .field("remaining_path", &self.remaining_path())
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

impl Context {
    pub(crate) fn new(
        root: Arc<Router>,
        head: Parts,
        path: String,
        body: ReqBody,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        let index = -root.middlewares().len().cast_signed();
        let shared = Shared {
            head,
            path,
            remote_addr,
            query: OnceLock::new(),
            body: tokio::sync::Mutex::new(BodyState { raw: Some(body), bytes: None, form: None }),
            state: Mutex::new(State::default()),
        };
        Self { shared: Arc::new(shared), router: root, offset: 0, index }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn advanced(&self) -> Self {
        Self { index: self.index + 1, ..self.clone() }
    }

    /// Runs the next step of the pipeline and returns its result.
    ///
    /// The cursor first walks the middlewares of the current node. Once they are
    /// exhausted it either runs the leaf handlers registered for the request method, or,
    /// while path segments remain, descends into the matching child node.
    pub fn next(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.index < 0 {
                let middlewares = self.router.middlewares();
                let handler = &middlewares[middlewares.len() - self.index.unsigned_abs()];
                return handler.call(self.advanced()).await;
            }

            let rest = self.remaining_path();
            if rest.is_empty() {
                let Some(handlers) = self.router.handlers(self.method()) else {
                    self.set_header(http::header::ALLOW, self.router.allowed_methods());
                    return Err(StatusError::method_not_allowed(format!("{} {}", self.method(), self.path())).into());
                };
                return match handlers.get(self.index.unsigned_abs()) {
                    Some(handler) => handler.call(self.advanced()).await,
                    None => Ok(()),
                };
            }

            let Some((child, rest, param)) = self.router.matches(rest) else {
                debug!(path = self.path(), "no route");
                return Err(StatusError::not_found(self.path()).into());
            };
            if let (Some(name), Some(value)) = (self.router.param_name(), param) {
                self.state().params.insert(name.to_owned(), value.to_owned());
            }

            let successor = Self {
                shared: Arc::clone(&self.shared),
                router: Arc::clone(child),
                offset: self.shared.path.len() - rest.len(),
                index: -child.middlewares().len().cast_signed(),
            };
            successor.next().await
        })
    }

    #[inline]
    pub fn method(&self) -> &Method {
        &self.shared.head.method
    }

    #[inline]
    pub fn uri(&self) -> &Uri {
        &self.shared.head.uri
    }

    #[inline]
    pub fn version(&self) -> Version {
        self.shared.head.version
    }

    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.shared.head.headers
    }

    /// The full request path, always starting with `/`.
    #[inline]
    pub fn path(&self) -> &str {
        &self.shared.path
    }

    /// The part of the path not yet consumed by the trie above this frame.
    #[inline]
    pub fn remaining_path(&self) -> &str {
        &self.shared.path[self.offset..]
    }

    #[inline]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.shared.remote_addr
    }

    /// Returns the path parameter `key`, or an empty string.
    pub fn param(&self, key: &str) -> String {
        self.state().params.get(key).cloned().unwrap_or_default()
    }

    /// Returns the first query value for `key`. The query string is parsed on first use.
    pub fn query(&self, key: &str) -> Option<&str> {
        self.query_pairs().iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub(crate) fn query_pairs(&self) -> &[(String, String)] {
        self.shared.query.get_or_init(|| {
            self.uri()
                .query()
                .and_then(|raw| serde_urlencoded::from_str::<Vec<(String, String)>>(raw).ok())
                .unwrap_or_default()
        })
    }

    /// Stores `value` in the request scratch map, visible to every frame of this request.
    pub fn set<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.state().scratch.insert(key.into(), Arc::new(value));
    }

    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.state().scratch.get(key).cloned()?;
        value.downcast::<T>().ok()
    }

    /// Caps the request body at `max` bytes. Reading past the cap fails with 413.
    pub async fn limit_body(&self, max: usize) {
        let mut body = self.shared.body.lock().await;
        if let Some(raw) = body.raw.take() {
            body.raw = Some(req_body(Limited::new(raw, max)));
        }
    }

    /// Reads the whole request body. The bytes are cached for later parsers.
    pub async fn body_bytes(&self) -> Result<Bytes> {
        let mut body = self.shared.body.lock().await;
        read_body(&mut body).await
    }

    /// The parsed form: body fields first, then query fields. Parsed once per request.
    pub(crate) async fn form(&self) -> Result<Arc<Form>> {
        let mut body = self.shared.body.lock().await;
        if let Some(form) = &body.form {
            return Ok(Arc::clone(form));
        }

        let bytes = read_body(&mut body).await?;
        let form = Arc::new(Form::parse(self.headers(), self.query_pairs(), bytes).await?);
        body.form = Some(Arc::clone(&form));
        Ok(form)
    }

    /// Decodes the JSON request body into `T`.
    pub async fn parse_json<T: DeserializeOwned>(&self) -> Result<T> {
        let bytes = self.body_bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| StatusError::bad_request(e).into())
    }

    /// Decodes the XML request body into `T`.
    pub async fn parse_xml<T: DeserializeOwned>(&self) -> Result<T> {
        let bytes = self.body_bytes().await?;
        let text = std::str::from_utf8(&bytes).map_err(StatusError::bad_request)?;
        quick_xml::de::from_str(text).map_err(|e| StatusError::bad_request(e).into())
    }

    /// Overrides the status used by the response helpers.
    pub fn set_status(&self, code: StatusCode) {
        self.state().status = Some(code);
    }

    /// The status the response helpers write: the override if set, otherwise 201 for
    /// POST, 204 for DELETE and 200 for everything else.
    pub fn status_code(&self) -> StatusCode {
        self.state().status.unwrap_or_else(|| default_status(self.method()))
    }

    pub fn set_header<K: IntoHeaderName>(&self, name: K, value: HeaderValue) {
        self.state().headers.insert(name, value);
    }

    pub fn add_header<K: IntoHeaderName>(&self, name: K, value: HeaderValue) {
        self.state().headers.append(name, value);
    }

    pub fn remove_header<K: AsHeaderName>(&self, name: K) -> Option<HeaderValue> {
        self.state().headers.remove(name)
    }

    pub fn response_header<K: AsHeaderName>(&self, name: K) -> Option<HeaderValue> {
        self.state().headers.get(name).cloned()
    }

    /// Returns true once some frame has written the response.
    pub fn is_written(&self) -> bool {
        self.state().written.is_some()
    }

    /// The status of the written response, if any.
    pub fn written_status(&self) -> Option<StatusCode> {
        self.state().written.as_ref().map(|(status, _)| *status)
    }

    /// Writes the response. Only the first write of a request takes effect; later writes
    /// are dropped and reported by returning `false`.
    pub fn write(&self, status: StatusCode, content_type: &'static str, body: impl Into<ResponseBody>) -> bool {
        let mut state = self.state();
        if state.written.is_some() {
            debug!(%status, path = self.path(), "response already written");
            return false;
        }
        if !content_type.is_empty() {
            state.headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_static(content_type));
        }
        state.written = Some((status, body.into()));
        true
    }

    pub fn text(&self, s: impl Into<String>) -> Result<()> {
        self.write(self.status_code(), TEXT_PLAIN, s.into());
        Ok(())
    }

    pub fn json<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        let body = serde_json::to_vec(value)?;
        self.write(self.status_code(), APPLICATION_JSON, body);
        Ok(())
    }

    pub fn xml<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        let body = quick_xml::se::to_string(value).map_err(Error::other)?;
        self.write(self.status_code(), APPLICATION_XML, body);
        Ok(())
    }

    /// Returns the value of the request cookie `name`.
    pub fn cookie(&self, name: &str) -> Option<String> {
        self.headers()
            .get_all(http::header::COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(cookie::Cookie::split_parse)
            .filter_map(std::result::Result::ok)
            .find(|c| c.name() == name)
            .map(|c| c.value().to_owned())
    }

    /// Appends a `Set-Cookie` header.
    pub fn set_cookie(&self, cookie: &cookie::Cookie<'_>) -> Result<()> {
        let value = HeaderValue::from_str(&cookie.to_string()).map_err(Error::other)?;
        self.add_header(http::header::SET_COOKIE, value);
        Ok(())
    }

    /// The client address: the first `X-Forwarded-For` hop, else `X-Real-IP`, else the
    /// host of the peer address.
    pub fn real_ip(&self) -> String {
        let header = |name: &str| {
            self.headers().get(name).and_then(|v| v.to_str().ok()).map(str::trim).filter(|v| !v.is_empty())
        };

        if let Some(ip) = header("x-forwarded-for").and_then(|v| v.split(',').next()).map(str::trim) {
            return ip.to_owned();
        }
        if let Some(ip) = header("x-real-ip") {
            return ip.to_owned();
        }
        self.remote_addr().map(|addr| addr.ip().to_string()).unwrap_or_default()
    }

    pub(crate) fn into_response(self) -> Response<ResponseBody> {
        let mut state = self.state();
        let (status, body) = match state.written.take() {
            Some(written) => written,
            None => (state.status.unwrap_or(StatusCode::OK), ResponseBody::empty()),
        };

        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = std::mem::take(&mut state.headers);
        response
    }
}

async fn read_body(body: &mut BodyState) -> Result<Bytes> {
    if let Some(bytes) = &body.bytes {
        return Ok(bytes.clone());
    }
    let Some(raw) = body.raw.take() else {
        return Ok(Bytes::new());
    };

    let bytes = raw.collect().await.map_err(body_error)?.to_bytes();
    body.bytes = Some(bytes.clone());
    Ok(bytes)
}

fn body_error(e: BoxError) -> Error {
    if e.downcast_ref::<LengthLimitError>().is_some() {
        StatusError::payload_too_large(e).into()
    } else {
        StatusError::bad_request(e).into()
    }
}

pub(crate) fn default_status(method: &Method) -> StatusCode {
    match *method {
        Method::POST => StatusCode::CREATED,
        Method::DELETE => StatusCode::NO_CONTENT,
        _ => StatusCode::OK,
    }
}
