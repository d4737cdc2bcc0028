// Copyright (C) 2023 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{fmt::Display, sync::Arc};

use thiserror::Error;

use crate::codec::FrameError;
use crate::msg::{Method, Response, StatusCode};
use crate::{ConnectionContext, RtspMessageContext};

/// An opaque `std::error::Error + Send + Sync + 'static` implementation.
///
/// The focus is on detailed human-readable messages; transport errors carry
/// enough context to find the offending bytes in a packet capture. A few
/// common programmatic questions are answered by accessors rather than by
/// exposing the internal enum.
#[derive(Clone)]
pub struct Error(pub(crate) Arc<ErrorInt>);

impl Error {
    /// Returns the status code, if the error was generated from a non-2xx
    /// response.
    pub fn status_code(&self) -> Option<StatusCode> {
        self.response().map(Response::status)
    }

    /// Returns the offending response, if the error was generated from a
    /// non-2xx response. A `401` carries its `WWW-Authenticate` challenge
    /// here; acting on it is the caller's responsibility.
    pub fn response(&self) -> Option<&Response> {
        match self.0.as_ref() {
            ErrorInt::ResponseError { response, .. } => Some(response),
            _ => None,
        }
    }

    /// True when this error means the connection is unusable and all other
    /// outstanding requests have failed (or will fail) too.
    pub fn is_connection_dead(&self) -> bool {
        matches!(
            self.0.as_ref(),
            ErrorInt::ConnectError(_)
                | ErrorInt::ReadError { .. }
                | ErrorInt::WriteError { .. }
                | ErrorInt::ConnectionClosed { .. }
        )
    }

    /// True when the request was rejected by the session state machine
    /// before any bytes were written.
    pub fn is_illegal_state(&self) -> bool {
        matches!(self.0.as_ref(), ErrorInt::IllegalState { .. })
    }

    /// True when the request timed out awaiting its response.
    pub fn is_timeout(&self) -> bool {
        matches!(self.0.as_ref(), ErrorInt::Timeout)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

#[derive(Debug, Error)]
pub(crate) enum ErrorInt {
    /// The method's caller provided an invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid RTSP URL: {0}")]
    InvalidUrl(#[source] crate::uri::UrlError),

    #[error("Unable to connect to RTSP server: {0}")]
    ConnectError(#[source] std::io::Error),

    #[error("Error reading from RTSP peer: {source}\n\nconn: {conn_ctx}\nmsg: {msg_ctx}")]
    ReadError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        source: std::io::Error,
    },

    #[error("Error writing to RTSP peer: {source}\n\nconn: {conn_ctx}")]
    WriteError {
        conn_ctx: ConnectionContext,
        source: std::io::Error,
    },

    /// The connection was closed, locally or by the peer; every request
    /// that was in flight fails with this.
    #[error("Connection closed\n\nconn: {conn_ctx}")]
    ConnectionClosed { conn_ctx: ConnectionContext },

    /// Unparseable RTSP data from which the read loop could not
    /// resynchronize.
    #[error("RTSP framing error: {error}\n\nconn: {conn_ctx}\nmsg: {msg_ctx}")]
    FramingError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        #[source]
        error: FrameError,
    },

    /// The session state machine rejected the method; nothing was sent.
    #[error("{method} is not legal in session state {from}")]
    IllegalState {
        from: crate::client::State,
        method: Method,
    },

    #[error("CSeq {cseq} already has a request in flight")]
    CSeqCollision { cseq: u32 },

    #[error("Response CSeq {got} doesn't match request CSeq {expected}")]
    CSeqMismatch { expected: u32, got: u32 },

    /// A non-2xx response. Session state is unchanged; retry is the
    /// caller's decision.
    #[error(
        "{} {} response to {method} CSeq={cseq}\n\nconn: {conn_ctx}\nmsg: {msg_ctx}",
        .response.status(),
        .response.reason()
    )]
    ResponseError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        method: Method,
        cseq: u32,
        response: Response,
    },

    #[error("Server changed session id from {expected:?} to {got:?}")]
    SessionIdDrift { expected: Box<str>, got: Box<str> },

    #[error("Timeout")]
    Timeout,
}

impl From<crate::uri::UrlError> for Error {
    fn from(e: crate::uri::UrlError) -> Self {
        Error(Arc::new(ErrorInt::InvalidUrl(e)))
    }
}
