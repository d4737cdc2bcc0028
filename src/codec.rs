// Copyright (C) 2023 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Wire framing: incremental parsing of RTSP messages from a byte buffer.
//!
//! [`parse`] is a pure function over the unconsumed prefix of a stream. The
//! transport layer ([`crate::tokio`]) calls it repeatedly, draining
//! `consumed` bytes after each complete message, until it reports
//! [`Parsed::NeedMore`]. This handles the three hard framing cases: one
//! message split across many reads, several messages arriving in one read,
//! and a large body following short headers.
//!
//! Serialization is the other direction and much simpler; it lives on
//! [`Request::write`](crate::msg::Request::write).

use bytes::Bytes;
use log::warn;
use thiserror::Error;

use crate::msg::{HeaderMap, Message, Method, Request, Response, StatusCode, Version};
use crate::uri::Uri;

/// Why a frame could not be parsed.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed status line {line:?}")]
    MalformedStatusLine { line: Box<str> },

    #[error("malformed headers: {description}")]
    MalformedHeaders { description: Box<str> },
}

/// Outcome of a [`parse`] call.
#[derive(Debug)]
pub enum Parsed {
    /// A full message was framed; the caller should drain `consumed` bytes.
    Complete { message: Message, consumed: usize },

    /// The buffer holds only a prefix of a message.
    NeedMore,

    /// The frame at the head of the buffer is damaged. When `resync` is
    /// `Some(n)`, discarding `n` bytes skips the damaged frame and parsing
    /// may continue; `None` means the stream cannot be trusted further.
    Invalid {
        error: FrameError,
        resync: Option<usize>,
    },
}

/// Parses one message from the front of `buf`.
pub fn parse(buf: &[u8]) -> Parsed {
    // Tolerate stray CRLF pairs between messages; some servers emit them as
    // keepalive padding.
    let mut pos = 0;
    while buf[pos..].starts_with(b"\r\n") {
        pos += 2;
    }
    let msg = &buf[pos..];
    if msg.is_empty() {
        return Parsed::NeedMore;
    }

    // Interleaved data frame: '$', channel id, 2-byte big-endian length.
    if msg[0] == b'$' {
        if msg.len() < 4 {
            return Parsed::NeedMore;
        }
        let channel = msg[1];
        let len = usize::from(u16::from_be_bytes([msg[2], msg[3]]));
        if msg.len() < 4 + len {
            return Parsed::NeedMore;
        }
        return Parsed::Complete {
            message: Message::Data {
                channel,
                body: Bytes::copy_from_slice(&msg[4..4 + len]),
            },
            consumed: pos + 4 + len,
        };
    }

    let header_end = match msg.windows(4).position(|w| w == b"\r\n\r\n") {
        Some(i) => i,
        None => return Parsed::NeedMore,
    };
    let header_block = match std::str::from_utf8(&msg[..header_end]) {
        Ok(s) => s,
        Err(_) => {
            // Without readable headers there's no body length to skip past.
            return Parsed::Invalid {
                error: FrameError::MalformedHeaders {
                    description: "header block is not valid UTF-8".into(),
                },
                resync: None,
            };
        }
    };

    let mut lines = header_block.split("\r\n");
    let start_line = lines.next().unwrap_or_default();

    // Parse headers before judging the start line: a resynchronizable skip
    // of a damaged frame still needs `Content-Length` to know its extent.
    let mut headers = HeaderMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        match line.split_once(':') {
            Some((name, value)) => {
                let (name, value) = (name.trim(), value.trim());
                if name.is_empty() {
                    warn!("skipping header line with empty name: {line:?}");
                } else if !headers.try_insert(name, value) {
                    warn!("discarding duplicate header {name:?}; first occurrence wins");
                }
            }
            None => warn!("skipping header line without colon: {line:?}"),
        }
    }

    let body_len = match headers.get("content-length") {
        None => 0,
        Some(v) => match usize::from_str_radix(v, 10) {
            Ok(n) => n,
            Err(_) => {
                return Parsed::Invalid {
                    error: FrameError::MalformedHeaders {
                        description: format!("unparseable Content-Length {v:?}").into(),
                    },
                    // Best effort: skip the header block; the body (if any)
                    // will be garbage to the next parse attempt.
                    resync: Some(pos + header_end + 4),
                };
            }
        },
    };
    let consumed = pos + header_end + 4 + body_len;
    if buf.len() < consumed {
        // Wait for the full extent even when the start line is damaged, so
        // a resync can skip the body too.
        return Parsed::NeedMore;
    }

    let message = match parse_start_line(start_line) {
        Ok(StartLine::Response {
            version,
            status,
            reason,
        }) => Message::Response(Response::new(
            version,
            status,
            reason,
            headers,
            Bytes::copy_from_slice(&buf[pos + header_end + 4..consumed]),
        )),
        Ok(StartLine::Request {
            method,
            uri,
            version,
        }) => {
            let mut b = Request::builder(method, version);
            if let Some(uri) = uri {
                b = b.uri(uri);
            }
            let mut req = b.build(Bytes::copy_from_slice(&buf[pos + header_end + 4..consumed]));
            *req.headers_mut() = headers;
            Message::Request(req)
        }
        Err(error) => {
            return Parsed::Invalid {
                error,
                resync: Some(consumed),
            }
        }
    };
    Parsed::Complete { message, consumed }
}

enum StartLine {
    Response {
        version: Version,
        status: StatusCode,
        reason: String,
    },
    Request {
        method: Method,
        uri: Option<Uri>,
        version: Version,
    },
}

fn parse_start_line(line: &str) -> Result<StartLine, FrameError> {
    let malformed = || FrameError::MalformedStatusLine { line: line.into() };
    let mut fields = line.split_whitespace();
    if line.starts_with("RTSP/") {
        let version = Version::parse(fields.next().ok_or_else(malformed)?).ok_or_else(malformed)?;
        let status = fields.next().ok_or_else(malformed)?;
        if status.len() != 3 {
            return Err(malformed());
        }
        let status = status
            .parse::<u16>()
            .ok()
            .and_then(StatusCode::new)
            .ok_or_else(malformed)?;
        let reason: Vec<&str> = fields.collect();
        if reason.is_empty() {
            return Err(malformed());
        }
        Ok(StartLine::Response {
            version,
            status,
            reason: reason.join(" "),
        })
    } else {
        // Server push: `METHOD SP URI SP RTSP/<v>` (PLAY_NOTIFY, REDIRECT).
        let method = Method::from(fields.next().ok_or_else(malformed)?);
        let uri = fields.next().ok_or_else(malformed)?;
        let version = Version::parse(fields.next().ok_or_else(malformed)?).ok_or_else(malformed)?;
        if fields.next().is_some() {
            return Err(malformed());
        }
        let uri = if uri == "*" {
            None
        } else {
            Some(Uri::parse(uri).map_err(|_| malformed())?)
        };
        Ok(StartLine::Request {
            method,
            uri,
            version,
        })
    }
}
