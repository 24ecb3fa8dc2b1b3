//! A thin wrapper around `http::Request` that carries path parameters,
//! parsed cookies, and a handle to the shared application state.

use bytes::Bytes;
use cookie::CookieJar;
use http::request::Parts;
use http::{HeaderMap, Method, Uri, Version};
use http_body_util::{BodyExt, Limited};
use hyper::body::Incoming;
use serde::de::DeserializeOwned;
use smallvec::SmallVec;
use std::sync::Arc;

use crate::error::{Error, Result};

/// One kilobyte short of 2 MiB: generous for a feather/object payload while
/// still bounding worst-case memory per in-flight request.
pub const MAX_BODY_BYTES: usize = 2 * 1024 * 1024 - 1024;

pub struct Request<State> {
    parts: Parts,
    body: Option<Incoming>,
    params: SmallVec<[(Box<str>, Box<str>); 4]>,
    cookies: CookieJar,
    state: Arc<State>,
}

impl<State> Request<State> {
    pub(crate) fn new(parts: Parts, body: Incoming, state: Arc<State>) -> Self {
        Self {
            parts,
            body: Some(body),
            params: SmallVec::new(),
            cookies: CookieJar::new(),
            state,
        }
    }

    pub(crate) fn push_param(&mut self, name: &str, value: &str) {
        self.params.push((name.into(), value.into()));
    }

    pub(crate) fn set_cookies(&mut self, cookies: CookieJar) {
        self.cookies = cookies;
    }

    pub fn method(&self) -> &Method {
        &self.parts.method
    }

    pub fn uri(&self) -> &Uri {
        &self.parts.uri
    }

    pub fn version(&self) -> Version {
        self.parts.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.parts.headers
    }

    pub fn extensions(&self) -> &http::Extensions {
        &self.parts.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut http::Extensions {
        &mut self.parts.extensions
    }

    pub fn cookies(&self) -> &CookieJar {
        &self.cookies
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn shared_state(&self) -> Arc<State> {
        Arc::clone(&self.state)
    }

    /// Returns the named path parameter, e.g. `:id` in `/data/:feather/:id`.
    pub fn param(&self, name: &str) -> Result<&str> {
        self.params
            .iter()
            .find(|(key, _)| &**key == name)
            .map(|(_, value)| &**value)
            .ok_or_else(|| Error::new(http::StatusCode::INTERNAL_SERVER_ERROR, format!("missing path param {name}")))
    }

    /// Returns the named query string parameter, percent-decoded.
    pub fn query(&self, name: &str) -> Option<String> {
        let raw = self.parts.uri.query()?;

        url_decode_query(raw).find_map(|(key, value)| (key == name).then(|| value.into_owned()))
    }

    /// Reads and JSON-decodes the entire request body, bounded by
    /// [`MAX_BODY_BYTES`].
    pub async fn json<T: DeserializeOwned>(&mut self) -> Result<T> {
        let bytes = self.bytes().await?;
        serde_json::from_slice(&bytes)
            .map_err(|error| Error::new(http::StatusCode::BAD_REQUEST, error.to_string()))
    }

    /// Reads the entire request body into memory.
    pub async fn bytes(&mut self) -> Result<Bytes> {
        let incoming = self
            .body
            .take()
            .ok_or_else(|| Error::new(http::StatusCode::INTERNAL_SERVER_ERROR, "request body already consumed"))?;

        let collected = Limited::new(incoming, MAX_BODY_BYTES)
            .collect()
            .await
            .map_err(|error| Error::new(http::StatusCode::PAYLOAD_TOO_LARGE, error.to_string()))?;

        Ok(collected.to_bytes())
    }
}

fn url_decode_query(raw: &str) -> impl Iterator<Item = (std::borrow::Cow<'_, str>, std::borrow::Cow<'_, str>)> {
    raw.split('&').filter(|pair| !pair.is_empty()).map(|pair| {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        (
            percent_encoding::percent_decode_str(key).decode_utf8_lossy(),
            percent_encoding::percent_decode_str(value).decode_utf8_lossy(),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_query_pairs() {
        let pairs: Vec<_> = url_decode_query("sessionId=S%201&eventKey=K").collect();
        assert_eq!(pairs[0].0, "sessionId");
        assert_eq!(pairs[0].1, "S 1");
        assert_eq!(pairs[1].0, "eventKey");
        assert_eq!(pairs[1].1, "K");
    }
}
