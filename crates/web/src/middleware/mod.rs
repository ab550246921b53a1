//! Composable middlewares.
//!
//! Every middleware is a [`Handler`](crate::Handler) meant to be attached with
//! [`Router::middleware`](crate::Router::middleware). Each one decides for itself whether
//! and when to call [`Context::next`](crate::Context::next).

mod cors;
mod limiter;
mod logger;
mod static_files;
mod timeout;
mod token;

pub use cors::{Control, Cors};
pub use limiter::{KeyFn, Limiter, LimiterBuilder};
pub use logger::Logger;
pub use static_files::Static;
pub use timeout::Timeout;
pub use token::{Json, Payload, TokenChecker, TokenManager};
