use crate::context::Context;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// A step of the dispatch pipeline.
///
/// Middlewares and leaf handlers share this trait. A middleware calls [`Context::next`]
/// to run the rest of the chain and may inspect or replace its result; a leaf handler
/// writes the response and returns.
///
/// Any async closure `Fn(Context) -> impl Future<Output = Result<()>>` is a handler.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn call(&self, ctx: Context) -> Result<()>;
}

pub(crate) type BoxHandler = Arc<dyn Handler>;

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn call(&self, ctx: Context) -> Result<()> {
        (self)(ctx).await
    }
}
