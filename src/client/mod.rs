// Copyright (C) 2023 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTSP client: connection handle and session state machine.
//!
//! [`RtspConnection`] owns the transport. A background reader task drives
//! the codec and hands each parsed message to the correlator, which matches
//! responses to in-flight requests by `CSeq`; requests may be pipelined and
//! answered out of order. Server-initiated traffic (`PLAY_NOTIFY`,
//! `REDIRECT`, interleaved data) and responses nobody is waiting for are
//! surfaced on the [`Event`] channel.
//!
//! [`Session`] layers the RFC 2326 state machine on top: it validates each
//! method against the current state *before* any bytes are written, and
//! advances state only on 2xx responses.

use std::sync::{Arc, Weak};
use std::time::Duration;

use base64::Engine as _;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, trace, warn};
use tokio::sync::mpsc;

use self::correlator::Correlator;
pub use self::parse::public_methods;
use crate::msg::{Method, Range, Request, RequestBuilder, Response, Transport, Version};
use crate::uri::{Scheme, Uri};
use crate::{ConnectionContext, Error, ErrorInt, RtspMessageContext};

mod correlator;
mod parse;

/// Basic-auth credentials, explicit or taken from the URL's userinfo.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Options for [`RtspConnection::connect`], builder-style.
#[derive(Clone, Default)]
pub struct ConnectOptions {
    creds: Option<Credentials>,
    user_agent: Option<String>,
    tls: Option<Arc<rustls::ClientConfig>>,
    version: Option<Version>,
}

impl ConnectOptions {
    /// Supplies credentials explicitly, overriding any URL userinfo.
    pub fn creds(self, creds: Credentials) -> Self {
        Self {
            creds: Some(creds),
            ..self
        }
    }

    /// Sets a `User-Agent` to send on every request.
    pub fn user_agent(self, user_agent: String) -> Self {
        Self {
            user_agent: Some(user_agent),
            ..self
        }
    }

    /// Supplies the TLS configuration used for `rtsps` URLs. Trust policy
    /// is entirely the caller's; this crate never builds a root store.
    pub fn tls(self, config: Arc<rustls::ClientConfig>) -> Self {
        Self {
            tls: Some(config),
            ..self
        }
    }

    /// Selects the protocol version for requests; defaults to RTSP/1.0.
    pub fn version(self, version: Version) -> Self {
        Self {
            version: Some(version),
            ..self
        }
    }
}

/// Traffic not matched to an in-flight request.
#[derive(Debug)]
pub enum Event {
    /// A response whose `CSeq` matched no pending request (or which had no
    /// usable `CSeq` at all), e.g. one arriving after its request timed out.
    UnmatchedResponse(Response),

    /// A server-initiated request: `PLAY_NOTIFY` or `REDIRECT`. Handling
    /// policy is the caller's.
    ServerRequest(Request),

    /// A TCP-interleaved data frame. This crate doesn't interpret the
    /// payload.
    Data { channel: u8, body: Bytes },
}

/// A session's lifecycle state, per RFC 2326 appendix A.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    Init,
    Ready,
    Playing,
    Recording,
    Closed,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            State::Init => "Init",
            State::Ready => "Ready",
            State::Playing => "Playing",
            State::Recording => "Recording",
            State::Closed => "Closed",
        })
    }
}

/// Whether the state machine permits sending `method` from `state`.
fn is_legal(state: State, method: &Method) -> bool {
    use Method::*;
    match state {
        State::Closed => false,
        State::Init => matches!(
            method,
            Options | Describe | Announce | Setup | GetParameter | SetParameter | Unknown(_)
        ),
        State::Ready => matches!(
            method,
            Options
                | Describe
                | Announce
                | Setup
                | Play
                | Record
                | Teardown
                | GetParameter
                | SetParameter
                | Unknown(_)
        ),
        State::Playing => matches!(
            method,
            Options
                | Describe
                | Announce
                | Play
                | Pause
                | Teardown
                | GetParameter
                | SetParameter
                | Unknown(_)
        ),
        State::Recording => matches!(
            method,
            Options
                | Describe
                | Announce
                | Pause
                | Record
                | Teardown
                | GetParameter
                | SetParameter
                | Unknown(_)
        ),
    }
}

struct ConnectionInner {
    ctx: ConnectionContext,
    write: tokio::sync::Mutex<SplitSink<crate::tokio::Connection, Request>>,
    correlator: Arc<Correlator>,
    events: std::sync::Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    authorization: Option<Box<str>>,
    user_agent: Option<Box<str>>,
    version: Version,
    reader: tokio::task::JoinHandle<()>,
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.reader.abort();
        self.correlator.cancel_all(wrap!(ErrorInt::ConnectionClosed {
            conn_ctx: self.ctx,
        }));
    }
}

/// A handle to an RTSP connection; cheap to clone.
///
/// The connection closes when the last handle is dropped: the reader task
/// stops, pending requests fail with `ConnectionClosed`, and the socket is
/// released.
#[derive(Clone)]
pub struct RtspConnection {
    inner: Arc<ConnectionInner>,
}

impl RtspConnection {
    /// Opens a connection to the server named by `url`.
    ///
    /// For `rtsps` URLs a TLS configuration must have been supplied via
    /// [`ConnectOptions::tls`]. `rtspu` URLs can't be connected directly;
    /// use [`RtspConnection::from_stream`] with a caller-provided transport.
    pub async fn connect(url: &Uri, options: ConnectOptions) -> Result<Self, Error> {
        // `Uri` keeps IPv6 literals bracketed; the resolver wants them bare.
        let host = url.host().trim_start_matches('[').trim_end_matches(']');
        let conn = match url.scheme() {
            Scheme::Rtsp => crate::tokio::Connection::connect(host, url.port())
                .await
                .map_err(|e| wrap!(ErrorInt::ConnectError(e)))?,
            Scheme::Rtsps => {
                let config = match options.tls {
                    Some(ref c) => c.clone(),
                    None => bail!(ErrorInt::InvalidArgument(
                        "rtsps requires a TLS config via ConnectOptions::tls".to_owned()
                    )),
                };
                crate::tokio::Connection::connect_tls(host, url.port(), config)
                    .await
                    .map_err(|e| wrap!(ErrorInt::ConnectError(e)))?
            }
            Scheme::Rtspu => bail!(ErrorInt::InvalidArgument(
                "rtspu has no built-in transport; supply one via from_stream".to_owned()
            )),
        };
        let creds = options.creds.clone().or_else(|| {
            if url.username().is_empty() && url.password().is_none() {
                return None;
            }
            Some(Credentials {
                username: url.username().to_owned(),
                password: url.password().unwrap_or_default().to_owned(),
            })
        });
        Ok(Self::wrap(conn, &options, creds))
    }

    /// Wraps an established stream, e.g. one the caller reached through a
    /// proxy or an `rtspu` byte-stream equivalent.
    pub fn from_stream(
        stream: tokio::net::TcpStream,
        options: ConnectOptions,
    ) -> Result<Self, Error> {
        let conn = crate::tokio::Connection::from_stream(stream)
            .map_err(|e| wrap!(ErrorInt::ConnectError(e)))?;
        let creds = options.creds.clone();
        Ok(Self::wrap(conn, &options, creds))
    }

    fn wrap(
        conn: crate::tokio::Connection,
        options: &ConnectOptions,
        creds: Option<Credentials>,
    ) -> Self {
        let ctx = *conn.ctx();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let correlator = Arc::new(Correlator::new(event_tx));
        let (write, read) = conn.split();
        let reader = tokio::spawn(read_loop(read, Arc::downgrade(&correlator), ctx));
        let authorization = creds.map(|c| {
            let b64 = base64::engine::general_purpose::STANDARD
                .encode(format!("{}:{}", c.username, c.password));
            format!("Basic {b64}").into()
        });
        RtspConnection {
            inner: Arc::new(ConnectionInner {
                ctx,
                write: tokio::sync::Mutex::new(write),
                correlator,
                events: std::sync::Mutex::new(Some(event_rx)),
                authorization,
                user_agent: options.user_agent.as_deref().map(Into::into),
                version: options.version.unwrap_or(Version::V1_0),
                reader,
            }),
        }
    }

    pub fn ctx(&self) -> &ConnectionContext {
        &self.inner.ctx
    }

    /// Takes the event stream. Returns `None` after the first call.
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<Event>> {
        self.inner.events.lock().unwrap().take()
    }

    /// Creates a session controlling the presentation at `base`.
    ///
    /// Multiple sessions may share one connection; each keeps its own state
    /// but `CSeq` values are assigned from the connection-wide counter.
    pub fn session(&self, base: Uri) -> Session {
        Session {
            conn: self.clone(),
            base,
            state: State::Init,
            session_id: None,
            session_timeout: None,
            request_timeout: None,
        }
    }

    /// Sends a raw request and awaits its response, without session state
    /// tracking. Fills in `CSeq` (and `Authorization`/`User-Agent` when
    /// configured and absent) before writing.
    pub async fn send_request(&self, req: &mut Request) -> Result<Response, Error> {
        self.send_request_inner(req, None).await.map(|(_, _, r)| r)
    }

    /// Like [`RtspConnection::send_request`] with a deadline. On timeout the
    /// pending slot is dropped and a late response surfaces as
    /// [`Event::UnmatchedResponse`].
    pub async fn send_request_with_timeout(
        &self,
        req: &mut Request,
        timeout: Option<Duration>,
    ) -> Result<Response, Error> {
        self.send_request_inner(req, timeout)
            .await
            .map(|(_, _, r)| r)
    }

    async fn send_request_inner(
        &self,
        req: &mut Request,
        timeout: Option<Duration>,
    ) -> Result<(u32, RtspMessageContext, Response), Error> {
        let cseq = self.fill_req(req);
        let slot = self.inner.correlator.register(cseq)?;
        trace!("sending {} CSeq={}", req.method(), cseq);
        {
            let mut write = self.inner.write.lock().await;
            if let Err(e) = write.send(req.clone()).await {
                self.inner.correlator.forget(cseq);
                return Err(wrap!(e));
            }
        }
        let completed = match timeout {
            None => slot.await,
            Some(timeout) => match tokio::time::timeout(timeout, slot).await {
                Ok(completed) => completed,
                Err(_) => {
                    self.inner.correlator.forget(cseq);
                    bail!(ErrorInt::Timeout);
                }
            },
        };
        let (msg_ctx, response) = match completed {
            Ok(Ok(r)) => r,
            Ok(Err(e)) => return Err(e),
            // The correlator went away without completing the slot.
            Err(_) => bail!(ErrorInt::ConnectionClosed {
                conn_ctx: self.inner.ctx,
            }),
        };
        match response.cseq() {
            Some(got) if got == cseq => {}
            got => bail!(ErrorInt::CSeqMismatch {
                expected: cseq,
                got: got.unwrap_or(0),
            }),
        }
        Ok((cseq, msg_ctx, response))
    }

    /// Fills out `req` with `CSeq` and the standing headers.
    fn fill_req(&self, req: &mut Request) -> u32 {
        let cseq = self.inner.correlator.next_cseq();
        req.headers_mut().set("CSeq", cseq.to_string());
        if let Some(ref authorization) = self.inner.authorization {
            if !req.headers().contains("authorization") {
                req.headers_mut().set("Authorization", &**authorization);
            }
        }
        if let Some(ref user_agent) = self.inner.user_agent {
            if !req.headers().contains("user-agent") {
                req.headers_mut().set("User-Agent", &**user_agent);
            }
        }
        cseq
    }

    /// Closes the connection: stops the reader, fails pending requests with
    /// `ConnectionClosed`, and shuts the stream down. Idempotent.
    pub async fn close(&self) {
        self.inner.reader.abort();
        self.inner.correlator.cancel_all(wrap!(ErrorInt::ConnectionClosed {
            conn_ctx: self.inner.ctx,
        }));
        let mut write = self.inner.write.lock().await;
        let _ = write.close().await;
    }
}

/// Reads messages until EOF or a fatal error, dispatching each to the
/// correlator.
///
/// Holds only a `Weak` to the correlator so that dropping the last
/// [`RtspConnection`] handle tears everything down rather than the reader
/// keeping it alive.
async fn read_loop(
    mut read: SplitStream<crate::tokio::Connection>,
    correlator: Weak<Correlator>,
    conn_ctx: ConnectionContext,
) {
    loop {
        let item = read.next().await;
        let Some(correlator) = correlator.upgrade() else {
            break;
        };
        match item {
            Some(Ok(msg)) => correlator.dispatch(msg),
            Some(Err(e)) => {
                warn!("RTSP read loop terminating: {e}");
                correlator.cancel_all(e);
                break;
            }
            None => {
                debug!("RTSP connection {conn_ctx} closed by peer");
                correlator.cancel_all(wrap!(ErrorInt::ConnectionClosed { conn_ctx }));
                break;
            }
        }
    }
}

/// An RTSP session: one presentation's control state over a borrowed
/// [`RtspConnection`].
///
/// Methods are validated against the state machine before any I/O; state
/// advances only on a 2xx response, so a rejected request leaves the session
/// exactly where it was.
pub struct Session {
    conn: RtspConnection,
    base: Uri,
    state: State,
    session_id: Option<Box<str>>,
    session_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
}

impl Session {
    pub fn state(&self) -> State {
        self.state
    }

    /// The server-assigned session id, once a `SETUP` has succeeded.
    pub fn id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// The server's advertised session timeout, from `Session: id;timeout=N`.
    /// Keepalive scheduling (e.g. periodic `GET_PARAMETER`) is the caller's
    /// concern; this is the deadline to beat.
    pub fn session_timeout(&self) -> Option<Duration> {
        self.session_timeout
    }

    /// Sets a per-request response deadline for this session's requests.
    pub fn set_request_timeout(&mut self, timeout: Option<Duration>) {
        self.request_timeout = timeout;
    }

    pub fn base(&self) -> &Uri {
        &self.base
    }

    /// Starts a request on this session's URI, with the `Session` header
    /// pre-filled when an id is known.
    fn builder(&self, method: Method) -> RequestBuilder {
        let mut b = Request::builder(method, self.conn.inner.version)
            .uri(self.base.without_userinfo());
        if let Some(ref id) = self.session_id {
            b = b.header("Session", &**id);
        }
        b
    }

    pub async fn options(&mut self) -> Result<Response, Error> {
        self.send(self.builder(Method::Options).empty()).await
    }

    /// Sends `DESCRIBE`; `accept` defaults to `application/sdp`.
    pub async fn describe(&mut self, accept: Option<&str>) -> Result<Response, Error> {
        let req = self
            .builder(Method::Describe)
            .header("Accept", accept.unwrap_or("application/sdp"))
            .empty();
        self.send(req).await
    }

    /// Sends `SETUP` with the given transport offer. On success the server's
    /// session id is captured and the session becomes `Ready`.
    pub async fn setup(&mut self, transport: &Transport) -> Result<Response, Error> {
        let req = self
            .builder(Method::Setup)
            .header("Transport", transport.to_string())
            .empty();
        self.send(req).await
    }

    pub async fn play(&mut self, range: Option<&Range>) -> Result<Response, Error> {
        let mut b = self.builder(Method::Play);
        if let Some(range) = range {
            b = b.header("Range", range.to_string());
        }
        self.send(b.empty()).await
    }

    pub async fn pause(&mut self) -> Result<Response, Error> {
        self.send(self.builder(Method::Pause).empty()).await
    }

    pub async fn record(&mut self) -> Result<Response, Error> {
        self.send(self.builder(Method::Record).empty()).await
    }

    /// Tears the session down. From `Init` there's nothing on the server to
    /// tear down, so this is a no-op rather than an error.
    pub async fn teardown(&mut self) -> Result<(), Error> {
        if self.state == State::Init {
            debug!("TEARDOWN in Init: no session established, nothing to do");
            return Ok(());
        }
        self.send(self.builder(Method::Teardown).empty()).await?;
        Ok(())
    }

    /// Sends `GET_PARAMETER`, with a `text/parameters` body naming the
    /// parameters when given. An empty one doubles as a keepalive.
    pub async fn get_parameter(&mut self, body: Option<&str>) -> Result<Response, Error> {
        let b = self.builder(Method::GetParameter);
        let req = match body {
            Some(body) => b
                .header("Content-Type", "text/parameters")
                .build(Bytes::copy_from_slice(body.as_bytes())),
            None => b.empty(),
        };
        self.send(req).await
    }

    pub async fn set_parameter(
        &mut self,
        body: &str,
        content_type: &str,
    ) -> Result<Response, Error> {
        let req = self
            .builder(Method::SetParameter)
            .header("Content-Type", content_type)
            .build(Bytes::copy_from_slice(body.as_bytes()));
        self.send(req).await
    }

    /// Sends `ANNOUNCE` with a session description, as when pushing a
    /// recording to the server.
    pub async fn announce(&mut self, sdp: &str) -> Result<Response, Error> {
        let req = self
            .builder(Method::Announce)
            .header("Content-Type", "application/sdp")
            .build(Bytes::copy_from_slice(sdp.as_bytes()));
        self.send(req).await
    }

    /// Sends a prepared request through this session's state machine.
    ///
    /// Fails with `IllegalState` before any I/O when the method isn't legal
    /// in the current state, and with `ResponseError` (state unchanged) on a
    /// non-2xx response.
    pub async fn send(&mut self, mut req: Request) -> Result<Response, Error> {
        let method = req.method().clone();
        if !is_legal(self.state, &method) {
            bail!(ErrorInt::IllegalState {
                from: self.state,
                method,
            });
        }
        let (cseq, msg_ctx, response) = self
            .conn
            .send_request_inner(&mut req, self.request_timeout)
            .await?;
        if !response.status().is_success() {
            bail!(ErrorInt::ResponseError {
                conn_ctx: self.conn.inner.ctx,
                msg_ctx,
                method,
                cseq,
                response,
            });
        }
        self.apply_success(&method, &response)?;
        Ok(response)
    }

    /// Applies a 2xx response to the session: id bookkeeping, then the state
    /// transition.
    fn apply_success(&mut self, method: &Method, response: &Response) -> Result<(), Error> {
        if let Some(h) = response
            .header("session")
            .and_then(parse::parse_session_header)
        {
            if *method == Method::Setup {
                // A SETUP may legitimately renegotiate the id.
                if let Some(ref old) = self.session_id {
                    if **old != *h.id {
                        warn!("SETUP renegotiated session id {:?} -> {:?}", old, h.id);
                    }
                }
                self.session_id = Some(h.id);
                self.session_timeout = h.timeout;
            } else if let Some(ref old) = self.session_id {
                if **old != *h.id {
                    bail!(ErrorInt::SessionIdDrift {
                        expected: old.clone(),
                        got: h.id,
                    });
                }
            }
        } else if *method == Method::Setup {
            warn!("SETUP response without a Session header");
        }
        match method {
            Method::Setup => self.state = State::Ready,
            Method::Play => self.state = State::Playing,
            Method::Record => self.state = State::Recording,
            Method::Pause => self.state = State::Ready,
            Method::Teardown => {
                self.session_id = None;
                self.session_timeout = None;
                self.state = State::Closed;
            }
            _ => {}
        }
        Ok(())
    }
}
