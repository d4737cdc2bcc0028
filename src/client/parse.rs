// Copyright (C) 2023 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Helpers for picking fields out of responses.

use std::time::Duration;

use crate::msg::{Method, Response};

/// Returns the methods advertised in a response's `Public` header, as from
/// a successful `OPTIONS`. Empty when the header is absent.
pub fn public_methods(response: &Response) -> Vec<Method> {
    response
        .header("public")
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(Method::from)
                .collect()
        })
        .unwrap_or_default()
}

/// A parsed `Session` header: `id[;timeout=<seconds>]`.
#[derive(Debug, PartialEq, Eq)]
pub(super) struct SessionHeader {
    pub(super) id: Box<str>,
    pub(super) timeout: Option<Duration>,
}

/// Parses a `Session` response header. The id is everything before the
/// first `;`; of the parameters, only `timeout` is interpreted.
pub(super) fn parse_session_header(value: &str) -> Option<SessionHeader> {
    let mut parts = value.split(';').map(str::trim);
    let id = parts.next().filter(|id| !id.is_empty())?;
    let mut timeout = None;
    for param in parts {
        if let Some(secs) = param.strip_prefix("timeout=") {
            match u64::from_str_radix(secs.trim(), 10) {
                Ok(secs) => timeout = Some(Duration::from_secs(secs)),
                Err(_) => log::warn!("ignoring unparseable Session timeout {secs:?}"),
            }
        }
    }
    Some(SessionHeader {
        id: id.into(),
        timeout,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::{HeaderMap, StatusCode, Version};
    use bytes::Bytes;

    fn response_with(name: &str, value: &str) -> Response {
        let mut headers = HeaderMap::new();
        headers.set(name, value);
        Response::new(Version::V1_0, StatusCode::OK, "OK", headers, Bytes::new())
    }

    #[test]
    fn public_header() {
        let r = response_with("Public", "OPTIONS, DESCRIBE, SETUP, PLAY, PAUSE, TEARDOWN");
        assert_eq!(
            public_methods(&r),
            vec![
                Method::Options,
                Method::Describe,
                Method::Setup,
                Method::Play,
                Method::Pause,
                Method::Teardown,
            ]
        );
        let r = response_with("CSeq", "1");
        assert!(public_methods(&r).is_empty());
    }

    #[test]
    fn session_header_with_timeout() {
        assert_eq!(
            parse_session_header("f8f3d1a2;timeout=60"),
            Some(SessionHeader {
                id: "f8f3d1a2".into(),
                timeout: Some(Duration::from_secs(60)),
            })
        );
    }

    #[test]
    fn session_header_bare() {
        assert_eq!(
            parse_session_header("ABCDEF01"),
            Some(SessionHeader {
                id: "ABCDEF01".into(),
                timeout: None,
            })
        );
        assert_eq!(parse_session_header(""), None);
    }
}
