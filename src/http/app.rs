//! The `App<State>` server loop: bind a `TcpListener`, accept connections,
//! and drive each one with `hyper::server::conn::http1`, shutting down
//! gracefully on `ctrl_c`. Grounded in the teacher's `App::listen`.

use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{Instrument, info, warn};

use crate::error::{Error, Result};
use crate::http::middleware::{Middleware, Next};
use crate::http::request::Request;
use crate::http::response::{Body, Response};
use crate::http::router::Router;

pub enum MatchWhen<State> {
    Exact(Arc<dyn Middleware<State>>),
    Partial(Arc<dyn Middleware<State>>),
}

pub struct App<State> {
    router: Router<Vec<MatchWhen<State>>>,
    state: Arc<State>,
}

pub fn app<State>(state: State) -> App<State>
where
    State: Send + Sync + 'static,
{
    App {
        router: Router::new(),
        state: Arc::new(state),
    }
}

impl<State> App<State>
where
    State: Send + Sync + 'static,
{
    /// Registers `responder` as the terminal handler for an exact match of
    /// `pattern`.
    pub fn at(&mut self, pattern: &str, responder: impl Middleware<State> + 'static) -> &mut Self {
        self.route_mut(pattern).push(MatchWhen::Exact(Arc::new(responder)));
        self
    }

    /// Registers `middleware` to run for `pattern` and every path nested
    /// beneath it (a prefix match).
    pub fn include(&mut self, pattern: &str, middleware: impl Middleware<State> + 'static) -> &mut Self {
        self.route_mut(pattern).push(MatchWhen::Partial(Arc::new(middleware)));
        self
    }

    fn route_mut(&mut self, pattern: &str) -> &mut Vec<MatchWhen<State>> {
        self.router.entry(pattern)
    }

    pub async fn listen(self, addr: impl Into<SocketAddr>) -> Result<()> {
        let addr = addr.into();
        let listener = TcpListener::bind(addr).await.map_err(Error::from)?;
        let app = Arc::new(self);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        info!(%addr, "listening");

        tokio::spawn({
            let shutdown_tx = shutdown_tx.clone();
            async move {
                let _ = tokio::signal::ctrl_c().await;
                info!("received ctrl_c, shutting down");
                let _ = shutdown_tx.send(true);
            }
        });

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(error) => {
                            warn!(%error, "failed to accept connection");
                            continue;
                        }
                    };

                    let app = Arc::clone(&app);
                    let mut shutdown_rx = shutdown_rx.clone();

                    tokio::spawn(async move {
                        let io = TokioIo::new(stream);
                        let service = service_fn(move |request| {
                            let app = Arc::clone(&app);
                            async move { Ok::<_, std::convert::Infallible>(serve(app, request).await) }
                        });

                        let connection = hyper::server::conn::http1::Builder::new()
                            .timer(TokioTimer::new())
                            .serve_connection(io, service);

                        tokio::pin!(connection);

                        tokio::select! {
                            result = &mut connection => {
                                if let Err(error) = result {
                                    warn!(%peer, %error, "connection error");
                                }
                            }
                            _ = shutdown_rx.changed() => {
                                connection.as_mut().graceful_shutdown();
                                if let Err(error) = connection.await {
                                    warn!(%peer, %error, "error during graceful shutdown");
                                }
                            }
                        }
                    }.instrument(tracing::info_span!("connection", %peer)));
                }
                _ = shutdown_rx.changed() => {
                    break Ok(());
                }
            }
        }
    }
}

async fn serve<State>(
    app: Arc<App<State>>,
    request: http::Request<hyper::body::Incoming>,
) -> http::Response<Body>
where
    State: Send + Sync + 'static,
{
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let span = tracing::info_span!("request", %method, %path);
    let _enter = span.enter();

    let (parts, body) = request.into_parts();
    let mut req = Request::new(parts, body, Arc::clone(&app.state));

    let stack = match app.router.visit(&path) {
        Some(matched) => {
            let mut deque = VecDeque::new();
            for when in matched.route {
                match when {
                    MatchWhen::Exact(middleware) => deque.push_back(Arc::clone(middleware)),
                    MatchWhen::Partial(middleware) => deque.push_back(Arc::clone(middleware)),
                }
            }
            for binding in &matched.params {
                req.push_param(binding.name, binding.value);
            }
            deque
        }
        None => VecDeque::new(),
    };

    let result = Next::new(stack).call(req).await;

    let response = match result {
        Ok(response) => response,
        Err(error) => {
            if error.status().is_server_error() {
                tracing::error!(status = %error.status(), message = %error.message(), "request failed");
            } else {
                tracing::warn!(status = %error.status(), message = %error.message(), "request rejected");
            }
            Response::from(error)
        }
    };

    let (parts, body) = response.into_parts();
    http::Response::from_parts(parts, body)
}
