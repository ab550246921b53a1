use crate::context::Context;
use crate::error::{Result, StatusError};
use crate::handler::Handler;
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Fails the request with 408 when the rest of the chain does not finish in time.
///
/// The downstream future is dropped on expiry, so anything it would still have done is
/// cancelled at its next suspension point.
#[derive(Debug, Clone, Copy)]
pub struct Timeout {
    duration: Duration,
}

impl Timeout {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

#[async_trait]
impl Handler for Timeout {
    async fn call(&self, ctx: Context) -> Result<()> {
        match tokio::time::timeout(self.duration, ctx.next()).await {
            Ok(result) => result,
            Err(_elapsed) => {
                debug!(path = ctx.path(), timeout = ?self.duration, "request timed out");
                Err(StatusError::request_timeout(ctx.path()).into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Timeout;
    use crate::context::Context;
    use crate::router::Router;
    use bytes::Bytes;
    use http::{Request, StatusCode};
    use http_body_util::Empty;
    use std::sync::Arc;
    use std::time::Duration;

    fn router() -> Arc<Router> {
        let mut router = Router::new();
        router.middleware(Timeout::new(Duration::from_millis(50)));
        router
            .get("/fast", |ctx: Context| async move { ctx.text("fast") })
            .get("/slow", |ctx: Context| async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                ctx.text("slow")
            });
        Arc::new(router)
    }

    async fn status(router: &Arc<Router>, path: &str) -> StatusCode {
        let req = Request::builder().uri(path).body(Empty::<Bytes>::new()).unwrap();
        router.serve(req, None).await.status()
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let router = router();
        assert_eq!(status(&router, "/fast").await, StatusCode::OK);
        assert_eq!(status(&router, "/slow").await, StatusCode::REQUEST_TIMEOUT);
    }
}
