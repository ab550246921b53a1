use crate::context::Context;
use crate::error::Result;
use crate::handler::Handler;
use async_trait::async_trait;
use std::time::Instant;
use tracing::{error, info};

/// Logs one line per request with its outcome and latency.
///
/// Failures with a 5xx status are logged at `error` level, everything else at `info`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Logger;

impl Logger {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Handler for Logger {
    async fn call(&self, ctx: Context) -> Result<()> {
        let start = Instant::now();
        let result = ctx.next().await;
        let elapsed = start.elapsed();

        let status = match &result {
            Ok(()) => ctx.written_status().unwrap_or_else(|| ctx.status_code()),
            Err(e) => e.status(),
        };
        match &result {
            Err(e) if status.is_server_error() => {
                error!(method = %ctx.method(), path = ctx.path(), status = status.as_u16(), ?elapsed, cause = %e, "request");
            }
            _ => info!(method = %ctx.method(), path = ctx.path(), status = status.as_u16(), ?elapsed, "request"),
        }
        result
    }
}
