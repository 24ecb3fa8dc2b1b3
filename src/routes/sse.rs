//! `/sse`, `/sse/:sessionId`: the long-lived notification stream. Each
//! connection filters the process-wide broadcast (`EventBus::subscribe_local`)
//! down to envelopes addressed to its session, formats them with
//! `format_sse`, and pipes them through `Response::event_stream`. Grounded
//! in the teacher's `Chat::subscribe` consumer loop
//! (`examples/chat/src/chat.rs`), which does the same broadcast-to-client
//! fan-out; the session-cleanup-on-drop wrapper below is this crate's own
//! addition, since the teacher's chat rooms have no locks or subscription
//! rows to release.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_core::Stream;
use http::Method;
use hyper::body::Frame;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::error::{BoxError, Result};
use crate::events::{self, UnsubscribeScope};
use crate::http::response::format_sse;
use crate::http::{Next, Request, Response};
use crate::locks::{self, UnlockCriteria};
use crate::state::AppState;

use super::auth::current_user;

/// `GET /sse`: mints a fresh session id and opens its stream in the same
/// response, for a client that has none yet.
pub async fn bootstrap(request: Request<AppState>, next: Next<AppState>) -> Result<Response> {
    if *request.method() != Method::GET {
        return next.call(request).await;
    }
    open(request, Uuid::new_v4().to_string()).await
}

/// `GET /sse/:sessionId`: reconnects to an already-established session.
pub async fn reconnect(request: Request<AppState>, next: Next<AppState>) -> Result<Response> {
    if *request.method() != Method::GET {
        return next.call(request).await;
    }
    let session_id = request.param("sessionId")?.to_owned();
    open(request, session_id).await
}

async fn open(request: Request<AppState>, session_id: String) -> Result<Response> {
    let _user = current_user(&request)?;
    let state = request.shared_state();

    let receiver = state.events.subscribe_local();
    let session_filter = session_id.clone();
    let frames = BroadcastStream::new(receiver).filter_map(move |item| {
        let envelope = item.ok()?;
        if envelope.message.subscription.session_id != session_filter {
            return None;
        }
        let data = serde_json::to_string(&envelope.message).ok()?;
        Some(Ok(Frame::data(format_sse("change", &data))) as std::result::Result<Frame<Bytes>, BoxError>)
    });

    let stream = SessionStream {
        inner: frames,
        cleanup: Some(SessionCleanup { state, session_id }),
    };

    Response::builder().event_stream(stream)
}

/// Wraps a filtered frame stream so that, whenever it is dropped (the
/// client disconnects, or the server shuts the connection down), the
/// session's subscription rows and any locks it holds are released.
struct SessionStream<S> {
    inner: S,
    cleanup: Option<SessionCleanup>,
}

struct SessionCleanup {
    state: Arc<AppState>,
    session_id: String,
}

impl<S> Stream for SessionStream<S>
where
    S: Stream<Item = std::result::Result<Frame<Bytes>, BoxError>> + Unpin,
{
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl<S> Drop for SessionStream<S> {
    fn drop(&mut self) {
        let Some(cleanup) = self.cleanup.take() else {
            return;
        };

        tokio::spawn(async move {
            let Ok(mut conn) = cleanup.state.pool.get().await else {
                return;
            };
            let _ = events::unsubscribe(&mut conn, &cleanup.session_id, UnsubscribeScope::Session).await;
            let _ = locks::unlock(
                &mut conn,
                UnlockCriteria {
                    event_key: Some(&cleanup.session_id),
                    ..Default::default()
                },
            )
            .await;
        });
    }
}
