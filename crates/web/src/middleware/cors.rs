use crate::context::Context;
use crate::error::{Error, Result, StatusError};
use crate::handler::Handler;
use async_trait::async_trait;
use http::header::{
    ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_EXPOSE_HEADERS, ACCESS_CONTROL_MAX_AGE, ALLOW, ORIGIN,
};
use http::{HeaderValue, Method};
use std::collections::HashMap;

/// Access control granted to one origin.
#[derive(Debug, Clone, Default)]
pub struct Control {
    pub origin: String,
    pub expose_headers: Vec<String>,
    pub allow_headers: Vec<String>,
    pub allow_methods: Vec<Method>,
    pub allow_credentials: bool,
    pub max_age: u32,
}

impl Control {
    pub fn new(origin: impl Into<String>) -> Self {
        Self { origin: origin.into(), ..Self::default() }
    }
}

/// Per-origin CORS middleware.
///
/// Requests without an `Origin` header pass through untouched. Requests from origins
/// without a [`Control`] are rejected with 403, as are non-preflight requests whose
/// method the origin is not allowed to use.
#[derive(Debug, Clone)]
pub struct Cors {
    controls: HashMap<String, Control>,
}

impl Cors {
    pub fn new(controls: impl IntoIterator<Item = Control>) -> Self {
        Self { controls: controls.into_iter().map(|c| (c.origin.clone(), c)).collect() }
    }
}

#[async_trait]
impl Handler for Cors {
    async fn call(&self, ctx: Context) -> Result<()> {
        let Some(origin) = ctx.headers().get(ORIGIN).and_then(|v| v.to_str().ok()) else {
            return ctx.next().await;
        };
        let denied = || -> Error { StatusError::forbidden(format!("{} {} from {origin}", ctx.method(), ctx.path())).into() };

        let Some(control) = self.controls.get(origin) else {
            return Err(denied());
        };
        let preflight = ctx.method() == Method::OPTIONS;
        if !preflight && !control.allow_methods.contains(ctx.method()) {
            return Err(denied());
        }

        ctx.set_header(ACCESS_CONTROL_ALLOW_ORIGIN, header_value(&control.origin)?);
        if !control.expose_headers.is_empty() {
            ctx.set_header(ACCESS_CONTROL_EXPOSE_HEADERS, header_value(&control.expose_headers.join(", "))?);
        }

        let result = ctx.next().await;
        if preflight {
            write_preflight(&ctx, control)?;
        }
        result
    }
}

fn write_preflight(ctx: &Context, control: &Control) -> Result<()> {
    if control.allow_credentials {
        ctx.set_header(ACCESS_CONTROL_ALLOW_CREDENTIALS, HeaderValue::from_static("true"));
    }
    if !control.allow_headers.is_empty() {
        ctx.set_header(ACCESS_CONTROL_ALLOW_HEADERS, header_value(&control.allow_headers.join(", "))?);
    }

    let allow_methods = if control.allow_methods.is_empty() {
        ctx.response_header(ALLOW)
    } else {
        let methods = control.allow_methods.iter().map(Method::as_str).collect::<Vec<_>>();
        Some(header_value(&methods.join(", "))?)
    };
    if let Some(methods) = allow_methods {
        ctx.set_header(ACCESS_CONTROL_ALLOW_METHODS, methods);
    }

    if control.max_age > 0 {
        ctx.set_header(ACCESS_CONTROL_MAX_AGE, HeaderValue::from(control.max_age));
    }
    Ok(())
}

fn header_value(s: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(s).map_err(Error::other)
}

#[cfg(test)]
mod tests {
    use super::{Control, Cors};
    use crate::context::Context;
    use crate::router::Router;
    use bytes::Bytes;
    use http::{Method, Request, Response, StatusCode};
    use http_body_util::Empty;
    use std::sync::Arc;

    fn router() -> Arc<Router> {
        let mut control = Control::new("https://app.example");
        control.allow_methods = vec![Method::GET];
        control.expose_headers = vec!["x-total".into()];
        control.allow_credentials = true;
        control.max_age = 600;

        let mut router = Router::new();
        router.middleware(Cors::new([control, Control::new("https://open.example")]));
        router
            .get("/items", |ctx: Context| async move { ctx.text("items") })
            .post("/items", |ctx: Context| async move { ctx.text("created") });
        Arc::new(router)
    }

    async fn call(method: Method, origin: Option<&str>) -> Response<crate::ResponseBody> {
        let mut builder = Request::builder().method(method).uri("/items");
        if let Some(origin) = origin {
            builder = builder.header("origin", origin);
        }
        router().serve(builder.body(Empty::<Bytes>::new()).unwrap(), None).await
    }

    #[tokio::test]
    async fn test_no_origin_passes_through() {
        let resp = call(Method::GET, None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().get("access-control-allow-origin").is_none());
    }

    #[tokio::test]
    async fn test_unknown_origin_is_forbidden() {
        let resp = call(Method::GET, Some("https://evil.example")).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_allowed_request() {
        let resp = call(Method::GET, Some("https://app.example")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["access-control-allow-origin"], "https://app.example");
        assert_eq!(resp.headers()["access-control-expose-headers"], "x-total");
        assert!(resp.headers().get("access-control-max-age").is_none());
    }

    #[tokio::test]
    async fn test_method_not_in_allow_list() {
        let resp = call(Method::POST, Some("https://app.example")).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_preflight_headers() {
        let resp = call(Method::OPTIONS, Some("https://app.example")).await;
        assert_eq!(resp.headers()["access-control-allow-origin"], "https://app.example");
        assert_eq!(resp.headers()["access-control-allow-credentials"], "true");
        assert_eq!(resp.headers()["access-control-allow-methods"], "GET");
        assert_eq!(resp.headers()["access-control-max-age"], "600");
    }

    #[tokio::test]
    async fn test_preflight_falls_back_to_allow() {
        let resp = call(Method::OPTIONS, Some("https://open.example")).await;
        // no OPTIONS handler: the downstream 405 carries the methods of the node
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(resp.headers()["access-control-allow-methods"], "GET, POST");
    }
}
