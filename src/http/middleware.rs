//! The `Middleware<State>` / `Next<State>` chain, taken verbatim in spirit
//! from the teacher: a middleware is anything that can take a request and a
//! `Next` cursor and produce a response, and plain `async fn`s are
//! middleware via a blanket impl so handlers never need to name the trait.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::Result;
use crate::http::{Request, Response};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait Middleware<State>: Send + Sync {
    fn call<'a>(&'a self, request: Request<State>, next: Next<State>) -> BoxFuture<'a, Result<Response>>
    where
        State: 'a;
}

impl<State, F, Fut> Middleware<State> for F
where
    F: Fn(Request<State>, Next<State>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Response>> + Send + 'static,
{
    fn call<'a>(&'a self, request: Request<State>, next: Next<State>) -> BoxFuture<'a, Result<Response>>
    where
        State: 'a,
    {
        Box::pin(self(request, next))
    }
}

/// The remaining middleware stack for a request. Calling `next.call(request)`
/// hands control to the next middleware, or produces a 404 once the stack is
/// drained with no terminal handler.
pub struct Next<State> {
    stack: VecDeque<Arc<dyn Middleware<State>>>,
}

impl<State> Next<State> {
    pub fn new(stack: VecDeque<Arc<dyn Middleware<State>>>) -> Self {
        Self { stack }
    }

    pub fn call(mut self, request: Request<State>) -> BoxFuture<'static, Result<Response>>
    where
        State: Send + Sync + 'static,
    {
        match self.stack.pop_front() {
            Some(middleware) => Box::pin(async move {
                let next = Next { stack: self.stack };
                middleware.call(request, next).await
            }),
            None => Box::pin(async move {
                crate::raise!(404, message = format!("no route matches {}", request.uri().path()))
            }),
        }
    }
}
