//! A minimal HTTP routing and middleware framework.
//!
//! Routes form a trie with one path segment per node. Middlewares attach to interior
//! nodes and run on the way down, handlers attach to leaves per method, and a
//! [`Context`] walks the resulting onion one [`Context::next`] call at a time.

mod body;
mod clock;
mod content;
mod context;
mod error;
mod form;
mod handler;
mod server;

pub mod middleware;
pub mod router;

#[cfg(test)]
mod testing;

pub use body::ReqBody;
pub use body::ResponseBody;
pub use clock::Clock;
pub use clock::SystemClock;
pub use context::Context;
pub use error::BoxError;
pub use error::Error;
pub use error::Result;
pub use error::StatusError;
pub use form::FormFile;
pub use handler::Handler;
pub use router::Router;
pub use server::Server;
pub use server::ServerBuildError;
pub use server::ServerBuilder;
