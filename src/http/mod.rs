//! The ambient HTTP/async stack: a `hyper` 1.x server loop, a small radix
//! router, a `Middleware<State>`/`Next<State>` chain, and cookie sessions.
//! This module is the generic "web framework" layer; everything that knows
//! about feathers, objects, or the catalog lives outside of it.

pub mod app;
pub mod middleware;
pub mod request;
pub mod response;
pub mod router;
pub mod session;

pub use app::{App, MatchWhen, app};
pub use middleware::{BoxFuture, Middleware, Next};
pub use request::Request;
pub use response::{Body, Response, ResponseBuilder};
pub use router::Router;
