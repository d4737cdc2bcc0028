// Copyright (C) 2023 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! tokio-based [`Connection`]: the byte stream (plain or TLS) and the
//! `tokio-util` framing glue over [`crate::codec`].
//!
//! In theory there could be a similar async-std-based implementation.

use bytes::{Buf, BytesMut};
use futures::{Sink, SinkExt, Stream, StreamExt};
use pretty_hex::PrettyHex;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;

use crate::codec::{self, FrameError, Parsed};
use crate::msg::Request;
use crate::{ConnectionContext, Error, ErrorInt, ReceivedMessage, RtspMessageContext, WallTime};

/// The underlying byte stream: plain TCP or TLS for `rtsps`.
pub(crate) enum IoStream {
    Tcp(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl IoStream {
    fn tcp(&self) -> &TcpStream {
        match self {
            IoStream::Tcp(s) => s,
            IoStream::Tls(s) => s.get_ref().0,
        }
    }
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            IoStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            IoStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            IoStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            IoStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            IoStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// An RTSP connection which implements `Stream`, `Sink`, and `Unpin`.
pub(crate) struct Connection(Framed<IoStream, Codec>);

impl Connection {
    pub(crate) async fn connect(host: &str, port: u16) -> Result<Self, std::io::Error> {
        let stream = TcpStream::connect((host, port)).await?;
        Self::from_io(IoStream::Tcp(stream))
    }

    pub(crate) async fn connect_tls(
        host: &str,
        port: u16,
        config: Arc<rustls::ClientConfig>,
    ) -> Result<Self, std::io::Error> {
        let name = rustls::pki_types::ServerName::try_from(host.to_owned()).map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid TLS server name {host:?}"),
            )
        })?;
        let stream = TcpStream::connect((host, port)).await?;
        let stream = TlsConnector::from(config).connect(name, stream).await?;
        Self::from_io(IoStream::Tls(Box::new(stream)))
    }

    /// Wraps a caller-supplied stream; this is also the `rtspu` path, where
    /// the caller must provide the byte-stream equivalent.
    pub(crate) fn from_stream(stream: TcpStream) -> Result<Self, std::io::Error> {
        Self::from_io(IoStream::Tcp(stream))
    }

    fn from_io(stream: IoStream) -> Result<Self, std::io::Error> {
        let established_wall = WallTime::now();
        let local_addr = stream.tcp().local_addr()?;
        let peer_addr = stream.tcp().peer_addr()?;
        Ok(Self(Framed::new(
            stream,
            Codec {
                ctx: ConnectionContext {
                    local_addr,
                    peer_addr,
                    established_wall,
                },
                read_pos: 0,
            },
        )))
    }

    pub(crate) fn ctx(&self) -> &ConnectionContext {
        &self.0.codec().ctx
    }

    pub(crate) fn eof_ctx(&self) -> RtspMessageContext {
        RtspMessageContext {
            pos: self.0.codec().read_pos + crate::to_u64(self.0.read_buffer().remaining()),
            received_wall: WallTime::now(),
            received: Instant::now(),
        }
    }

    fn wrap_write_err(&self, e: CodecError) -> ErrorInt {
        match e {
            CodecError::IoError(source) => ErrorInt::WriteError {
                conn_ctx: *self.ctx(),
                source,
            },
            CodecError::ParseError { .. } => unreachable!(),
        }
    }
}

impl Stream for Connection {
    type Item = Result<ReceivedMessage, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.0.poll_next_unpin(cx).map_err(|e| {
            wrap!(match e {
                CodecError::IoError(source) => ErrorInt::ReadError {
                    conn_ctx: *self.ctx(),
                    msg_ctx: self.eof_ctx(),
                    source,
                },
                CodecError::ParseError { error, pos } => ErrorInt::FramingError {
                    conn_ctx: *self.ctx(),
                    msg_ctx: RtspMessageContext {
                        pos,
                        received_wall: WallTime::now(),
                        received: Instant::now(),
                    },
                    error,
                },
            })
        })
    }
}

impl Sink<Request> for Connection {
    type Error = ErrorInt;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.0
            .poll_ready_unpin(cx)
            .map_err(|e| self.wrap_write_err(e))
    }

    fn start_send(mut self: Pin<&mut Self>, item: Request) -> Result<(), Self::Error> {
        self.0
            .start_send_unpin(item)
            .map_err(|e| self.wrap_write_err(e))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.0
            .poll_flush_unpin(cx)
            .map_err(|e| self.wrap_write_err(e))
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.0
            .poll_close_unpin(cx)
            .map_err(|e| self.wrap_write_err(e))
    }
}

/// Bridges [`crate::codec::parse`] / [`Request::write`] to `tokio_util`.
struct Codec {
    ctx: ConnectionContext,

    /// Number of bytes read and processed (drained from the input buffer).
    read_pos: u64,
}

/// An intermediate error type that exists because [`Framed`] expects the
/// codec's error type to implement `From<std::io::Error>`, and [`Error`]
/// takes additional context.
#[derive(Debug)]
enum CodecError {
    IoError(std::io::Error),
    ParseError { error: FrameError, pos: u64 },
}

impl std::convert::From<std::io::Error> for CodecError {
    fn from(e: std::io::Error) -> Self {
        CodecError::IoError(e)
    }
}

impl tokio_util::codec::Decoder for Codec {
    type Item = ReceivedMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match codec::parse(&src[..]) {
                Parsed::NeedMore => return Ok(None),
                Parsed::Complete { message, consumed } => {
                    src.advance(consumed);
                    let msg = ReceivedMessage {
                        ctx: RtspMessageContext {
                            pos: self.read_pos,
                            received_wall: WallTime::now(),
                            received: Instant::now(),
                        },
                        msg: message,
                    };
                    self.read_pos += crate::to_u64(consumed);
                    return Ok(Some(msg));
                }
                Parsed::Invalid {
                    error,
                    resync: Some(skip),
                } => {
                    // A single damaged frame doesn't kill the connection.
                    log::warn!(
                        "at byte {}: dropping damaged RTSP frame ({}); skipping {} bytes:\n{:#?}",
                        self.read_pos,
                        &error,
                        skip,
                        src[..std::cmp::min(skip, 64)].hex_dump(),
                    );
                    src.advance(skip);
                    self.read_pos += crate::to_u64(skip);
                }
                Parsed::Invalid {
                    error,
                    resync: None,
                } => {
                    return Err(CodecError::ParseError {
                        error,
                        pos: self.read_pos,
                    })
                }
            }
        }
    }
}

impl tokio_util::codec::Encoder<Request> for Codec {
    type Error = CodecError;

    fn encode(&mut self, item: Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.write(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::codec::Decoder;

    use super::*;
    use crate::msg::Message;

    fn test_codec() -> Codec {
        Codec {
            ctx: ConnectionContext::dummy(),
            read_pos: 0,
        }
    }

    #[test]
    fn crlf_then_data_frame() {
        let mut codec = test_codec();
        let mut buf = BytesMut::from(&b"\r\n$\x00\x00\x04asdfrest"[..]);
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(msg.msg, Message::Data { channel: 0, .. }));
        assert_eq!(&buf[..], b"rest");
    }

    #[test]
    fn damaged_frame_skipped_then_good_frame_decoded() {
        let mut codec = test_codec();
        let mut buf = BytesMut::from(&b"ICY 200 OK\r\n\r\nRTSP/1.0 200 OK\r\nCSeq: 1\r\n\r\n"[..]);
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        match msg.msg {
            Message::Response(r) => assert_eq!(r.cseq(), Some(1)),
            o => panic!("{o:?}"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn invalid_utf8_is_fatal() {
        let mut codec = test_codec();
        let mut buf = BytesMut::from(&b"RTSP/1.0 200 OK\r\nx: \xff\xfe\r\n\r\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::ParseError { .. })
        ));
    }
}
