//! Error handling for the Resonate engine.
//!
//! One error type serves the whole crate: [`struct@Error`] pairs a
//! classification ([`ErrorKind`]) with the underlying error value. The
//! kinds mirror the protocol's failure taxonomy, so policy decisions
//! (drop the frame, close the endpoint, keep streaming) can be made by
//! matching on `kind` alone:
//!
//! * Codec failures (`MalformedFrame`, `UnknownMessageType`) are logged
//!   and the offending frame is dropped.
//! * Handshake violations (`WrongPhase`) terminate the endpoint without
//!   retry.
//! * `WrongRole` and `PayloadRange` are rejected without closing.
//! * `BufferOverrun` and `Transport` terminate the endpoint with retry.
//! * `ClockDivergence` and `Encoder` degrade the session but keep the
//!   connection alive.

use std::fmt;
use thiserror::Error;

/// Main error type combining a kind with the underlying error details.
#[derive(Debug)]
pub struct Error {
    /// Classification of the error.
    pub kind: ErrorKind,

    /// Details of the underlying error.
    pub error: Box<dyn std::error::Error + Send + Sync>,
}

/// Standard result type for Resonate operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories of the Resonate engine.
///
/// The first nine variants are the protocol taxonomy; the remainder are
/// ambient kinds used for argument validation and task plumbing.
#[expect(clippy::module_name_repetitions)]
#[derive(Clone, Copy, Debug, Eq, Error, Hash, Ord, PartialEq, PartialOrd)]
pub enum ErrorKind {
    /// Binary frame shorter than its header, or unparseable JSON text.
    #[error("malformed frame")]
    MalformedFrame,

    /// Unrecognized message `type` string or binary type byte.
    #[error("unknown message type")]
    UnknownMessageType,

    /// Message arrived in a handshake phase that forbids it.
    #[error("message not valid in this phase")]
    WrongPhase,

    /// Message targets a role the peer did not declare.
    #[error("message targets an undeclared role")]
    WrongRole,

    /// Payload field outside its permitted range.
    #[error("payload out of range")]
    PayloadRange,

    /// Outbound queue overflowed.
    #[error("send queue overrun")]
    BufferOverrun,

    /// Socket-level failure.
    #[error("transport error")]
    Transport,

    /// Clock filter covariance exceeded the fatal threshold.
    #[error("clock divergence")]
    ClockDivergence,

    /// Audio encoder failed mid-stream.
    #[error("encoder error")]
    Encoder,

    /// Invalid argument supplied by the application.
    #[error("invalid argument specified")]
    InvalidArgument,

    /// Attempt to create what already exists.
    #[error("already exists")]
    AlreadyExists,

    /// Referenced entity does not exist.
    #[error("not found")]
    NotFound,

    /// Operation timed out.
    #[error("operation timed out")]
    DeadlineExceeded,

    /// Operation was cancelled.
    #[error("operation was cancelled")]
    Cancelled,

    /// Internal invariant violated.
    #[error("internal error")]
    Internal,
}

macro_rules! error_constructor {
    ($name:ident, $kind:ident) => {
        #[doc = concat!("Creates an [`ErrorKind::", stringify!($kind), "`] error.")]
        pub fn $name<E>(error: E) -> Self
        where
            E: Into<Box<dyn std::error::Error + Send + Sync>>,
        {
            Self {
                kind: ErrorKind::$kind,
                error: error.into(),
            }
        }
    };
}

impl Error {
    /// Creates a new error with the specified kind and details.
    pub fn new<E>(kind: ErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind,
            error: error.into(),
        }
    }

    /// Attempts to downcast the underlying error to a concrete type.
    #[must_use]
    pub fn downcast<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        self.error.downcast_ref::<E>()
    }

    error_constructor!(malformed, MalformedFrame);
    error_constructor!(unknown_type, UnknownMessageType);
    error_constructor!(wrong_phase, WrongPhase);
    error_constructor!(wrong_role, WrongRole);
    error_constructor!(out_of_range, PayloadRange);
    error_constructor!(overrun, BufferOverrun);
    error_constructor!(transport, Transport);
    error_constructor!(clock_divergence, ClockDivergence);
    error_constructor!(encoder, Encoder);
    error_constructor!(invalid_argument, InvalidArgument);
    error_constructor!(already_exists, AlreadyExists);
    error_constructor!(not_found, NotFound);
    error_constructor!(deadline_exceeded, DeadlineExceeded);
    error_constructor!(cancelled, Cancelled);
    error_constructor!(internal, Internal);
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.error)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.error.as_ref())
    }
}

/// Converts I/O errors to `Transport`.
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::transport(err)
    }
}

/// Converts WebSocket errors into appropriate error kinds.
///
/// Closed and capacity conditions map to their own kinds; everything else
/// is a transport failure.
impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error::{
            AlreadyClosed, Capacity, ConnectionClosed, WriteBufferFull,
        };
        match err {
            ConnectionClosed | AlreadyClosed => Self::cancelled(err),
            Capacity(err) => Self::out_of_range(err),
            WriteBufferFull(err) => Self::overrun(err.to_string()),
            other => Self::transport(other),
        }
    }
}

/// Converts JSON errors to `MalformedFrame`.
impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::malformed(err)
    }
}

/// Converts URL parsing errors to `InvalidArgument`.
impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Self::invalid_argument(err)
    }
}

/// Converts timeout errors to `DeadlineExceeded`.
impl From<tokio::time::error::Elapsed> for Error {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        Self::deadline_exceeded(err)
    }
}

/// Converts Base64 decoding errors to `MalformedFrame`.
impl From<base64::DecodeError> for Error {
    fn from(err: base64::DecodeError) -> Self {
        Self::malformed(err)
    }
}

/// Converts mutex poisoning errors to `Internal`.
impl<T> From<std::sync::PoisonError<std::sync::MutexGuard<'_, T>>> for Error {
    fn from(err: std::sync::PoisonError<std::sync::MutexGuard<'_, T>>) -> Self {
        Self::internal(err.to_string())
    }
}
