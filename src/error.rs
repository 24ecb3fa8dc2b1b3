//! A single error type shared by every layer of the server.
//!
//! Every fallible path - HTTP parsing, the catalog, the CRUD engine, the
//! trigger pipeline - produces an [`Error`] carrying the [`StatusCode`] it
//! should surface as. `raise!`/`err!` build one inline; the blanket
//! `From<E: std::error::Error>` impl defaults unexpected errors to 500 so
//! `?` works from `diesel`, `serde_json`, `fred`, and friends without a
//! conversion at every call site.

use either::Either;
use http::StatusCode;
use serde::Serialize;
use serde::ser::SerializeStruct;
use std::borrow::Cow;
use std::fmt::{self, Display, Formatter};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T = crate::http::Response> = std::result::Result<T, Error>;

#[derive(Debug)]
pub struct Error {
    status: StatusCode,
    reason: Either<BoxError, String>,
}

struct ErrorBody<'a> {
    status: u16,
    message: Cow<'a, str>,
}

impl Error {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            reason: Either::Right(message.into()),
        }
    }

    pub fn from_source(status: StatusCode, source: BoxError) -> Self {
        Self {
            status,
            reason: Either::Left(source),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> Cow<'_, str> {
        match &self.reason {
            Either::Left(source) => Cow::Owned(source.to_string()),
            Either::Right(message) => Cow::Borrowed(message),
        }
    }

    pub fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.reason {
            Either::Left(source) => Some(&**source),
            Either::Right(_) => None,
        }
    }

    pub fn to_body(&self) -> serde_json::Value {
        serde_json::json!({ "message": self.message(), "statusCode": self.status.as_u16() })
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.reason {
            Either::Left(source) => Display::fmt(&**source, f),
            Either::Right(message) => Display::fmt(message, f),
        }
    }
}

impl Serialize for Error {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let body = ErrorBody {
            status: self.status.as_u16(),
            message: self.message(),
        };
        body.serialize(serializer)
    }
}

impl Serialize for ErrorBody<'_> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Error", 2)?;
        state.serialize_field("message", &self.message)?;
        state.serialize_field("statusCode", &self.status)?;
        state.end()
    }
}

impl<E> From<E> for Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(source: E) -> Self {
        Self::from_source(StatusCode::INTERNAL_SERVER_ERROR, Box::new(source))
    }
}

/// Build an [`Error`] from a numeric status code and an optional `message =`
/// argument, mirroring the teacher's `err!` macro so call sites read the
/// same way regardless of which layer raises.
#[macro_export]
macro_rules! err {
    ($status:literal) => {
        $crate::error::Error::new(
            $crate::error::status_from_u16($status),
            $crate::error::default_reason($status),
        )
    };
    ($status:literal, message = $message:expr) => {
        $crate::error::Error::new($crate::error::status_from_u16($status), $message)
    };
    ($message:expr) => {
        $crate::error::Error::new(http::StatusCode::INTERNAL_SERVER_ERROR, $message)
    };
}

/// Build and immediately return an [`Error`] via `?`'s early-return sugar.
#[macro_export]
macro_rules! raise {
    ($($tt:tt)*) => {
        return Err($crate::err!($($tt)*))
    };
}

#[doc(hidden)]
pub fn status_from_u16(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

#[doc(hidden)]
pub fn default_reason(code: u16) -> &'static str {
    match code {
        400 => "Invalid argument",
        401 => "Not authorized",
        403 => "Forbidden",
        404 => "Not found",
        409 => "Conflict",
        422 => "Unprocessable entity",
        _ => "Internal server error",
    }
}

pub(crate) fn bad_request(message: impl Into<String>) -> Error {
    Error::new(StatusCode::BAD_REQUEST, message)
}

pub(crate) fn unauthorized(message: impl Into<String>) -> Error {
    Error::new(StatusCode::UNAUTHORIZED, message)
}

pub(crate) fn not_found(message: impl Into<String>) -> Error {
    Error::new(StatusCode::NOT_FOUND, message)
}

pub(crate) fn conflict(message: impl Into<String>) -> Error {
    Error::new(StatusCode::CONFLICT, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_internal_server_error() {
        let error = Error::from(std::io::Error::other("boom"));
        assert_eq!(error.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn carries_an_explicit_status() {
        let error = not_found("Contact not found");
        assert_eq!(error.status(), StatusCode::NOT_FOUND);
        assert_eq!(error.message(), "Contact not found");
    }

    #[test]
    fn serializes_to_the_message_statuscode_envelope() {
        let error = conflict("stale etag");
        let value = serde_json::to_value(&error).unwrap();
        assert_eq!(value["message"], "stale etag");
        assert_eq!(value["statusCode"], 409);
    }
}
