//! Response construction, including a `Body::Stream` variant used to drive
//! Server-Sent Events, grounded in the teacher's `Body` enum + `Pipe`
//! pattern: any fallible byte stream can become a chunked response body.

use bytes::Bytes;
use futures_core::Stream;
use http::{HeaderName, HeaderValue, StatusCode, header};
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::Frame;
use serde::Serialize;
use std::pin::Pin;

use crate::error::{BoxError, Error, Result};

pub enum Body {
    Empty(Empty<Bytes>),
    Full(Full<Bytes>),
    Stream(StreamBody<Pin<Box<dyn Stream<Item = std::result::Result<Frame<Bytes>, BoxError>> + Send>>>),
}

pub struct Response {
    inner: http::Response<Body>,
}

impl Response {
    pub fn builder() -> ResponseBuilder {
        ResponseBuilder::new()
    }

    pub fn status(&self) -> StatusCode {
        self.inner.status()
    }

    pub fn into_parts(self) -> (http::response::Parts, Body) {
        self.inner.into_parts()
    }
}

pub struct ResponseBuilder {
    status: StatusCode,
    headers: Vec<(HeaderName, HeaderValue)>,
}

impl Default for ResponseBuilder {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            headers: Vec::new(),
        }
    }
}

impl ResponseBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.push((name, value));
        self
    }

    fn assemble(self, body: Body) -> Response {
        let mut response = http::Response::new(body);
        *response.status_mut() = self.status;

        for (name, value) in self.headers {
            response.headers_mut().insert(name, value);
        }

        Response { inner: response }
    }

    pub fn finish(self) -> Result<Response> {
        Ok(self.assemble(Body::Empty(Empty::new())))
    }

    pub fn text(self, body: impl Into<String>) -> Result<Response> {
        let bytes = Bytes::from(body.into());
        Ok(self
            .header(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"))
            .assemble(Body::Full(Full::new(bytes))))
    }

    pub fn json<T: Serialize>(self, value: &T) -> Result<Response> {
        let bytes = serde_json::to_vec(value).map_err(Error::from)?;
        Ok(self
            .header(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json; charset=utf-8"),
            )
            .assemble(Body::Full(Full::new(Bytes::from(bytes)))))
    }

    /// Pipes a `Stream` of already-framed SSE chunks as a `text/event-stream`
    /// response, used by the `/sse` route.
    pub fn event_stream<S>(self, stream: S) -> Result<Response>
    where
        S: Stream<Item = std::result::Result<Frame<Bytes>, BoxError>> + Send + 'static,
    {
        let body = StreamBody::new(Box::pin(stream) as Pin<Box<dyn Stream<Item = _> + Send>>);

        Ok(self
            .header(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"))
            .header(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"))
            .header(header::CONNECTION, HeaderValue::from_static("keep-alive"))
            .assemble(Body::Stream(body)))
    }
}

impl From<Error> for Response {
    fn from(error: Error) -> Self {
        let body = error.to_body();
        let bytes = serde_json::to_vec(&body).unwrap_or_else(|_| b"{\"message\":\"internal error\"}".to_vec());

        let mut response = http::Response::new(Body::Full(Full::new(Bytes::from(bytes))));
        *response.status_mut() = error.status();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );

        Response { inner: response }
    }
}

impl hyper::body::Body for Body {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<std::result::Result<Frame<Bytes>, Self::Error>>> {
        match self.get_mut() {
            Body::Empty(body) => Pin::new(body).poll_frame(cx).map_err(|never| match never {}),
            Body::Full(body) => Pin::new(body).poll_frame(cx).map_err(|never| match never {}),
            Body::Stream(body) => Pin::new(body).poll_frame(cx),
        }
    }
}

pub(crate) fn format_sse(event: &str, data: &str) -> Bytes {
    Bytes::from(format!("event: {event}\ndata: {data}\n\n"))
}
