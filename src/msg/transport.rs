// Copyright (C) 2023 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The structured `Transport` header (RFC 2326 §12.39, RFC 7826 §18.54).
//!
//! Only the parameters this crate acts on are given fields; anything else is
//! preserved verbatim in [`Transport::extra`] and round-trips unchanged, so
//! e.g. multicast negotiation parameters pass through untouched.

use std::fmt::Display;

/// The lower transport carrying media data.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Lower {
    Udp,
    Tcp,
}

impl Lower {
    fn as_str(self) -> &'static str {
        match self {
            Lower::Udp => "UDP",
            Lower::Tcp => "TCP",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CastMode {
    Unicast,
    Multicast,
}

impl CastMode {
    fn as_str(self) -> &'static str {
        match self {
            CastMode::Unicast => "unicast",
            CastMode::Multicast => "multicast",
        }
    }
}

/// A `start[-end]` port pair, as in `client_port=8000-8001`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: Option<u16>,
}

impl PortRange {
    pub fn pair(start: u16) -> Self {
        PortRange {
            start,
            end: Some(start + 1),
        }
    }

    fn parse(s: &str) -> Result<Self, String> {
        let (start, end) = match s.split_once('-') {
            Some((a, b)) => (a, Some(b)),
            None => (s, None),
        };
        let parse_port = |p: &str| {
            u16::from_str_radix(p.trim(), 10).map_err(|_| format!("bad port {p:?} in Transport"))
        };
        Ok(PortRange {
            start: parse_port(start)?,
            end: end.map(parse_port).transpose()?,
        })
    }
}

impl Display for PortRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.start)?;
        if let Some(end) = self.end {
            write!(f, "-{end}")?;
        }
        Ok(())
    }
}

/// An interleaved channel id pair, as in `interleaved=0-1`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChannelRange {
    pub start: u8,
    pub end: Option<u8>,
}

impl ChannelRange {
    fn parse(s: &str) -> Result<Self, String> {
        let (start, end) = match s.split_once('-') {
            Some((a, b)) => (a, Some(b)),
            None => (s, None),
        };
        let parse_ch = |c: &str| {
            u8::from_str_radix(c.trim(), 10).map_err(|_| format!("bad channel {c:?} in Transport"))
        };
        Ok(ChannelRange {
            start: parse_ch(start)?,
            end: end.map(parse_ch).transpose()?,
        })
    }
}

impl Display for ChannelRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.start)?;
        if let Some(end) = self.end {
            write!(f, "-{end}")?;
        }
        Ok(())
    }
}

/// A parsed `Transport` header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transport {
    /// Transport protocol, normally `RTP`.
    pub protocol: Box<str>,

    /// Profile, normally `AVP`.
    pub profile: Box<str>,

    pub lower: Option<Lower>,
    pub cast: Option<CastMode>,
    pub client_port: Option<PortRange>,
    pub server_port: Option<PortRange>,
    pub interleaved: Option<ChannelRange>,
    pub destination: Option<Box<str>>,
    pub source: Option<Box<str>>,

    /// Synchronization source, kept verbatim; servers disagree on casing
    /// and some emit decimal rather than the RFC's eight hex digits.
    pub ssrc: Option<Box<str>>,

    /// `mode` parameter, verbatim including any quotes (`mode="PLAY"`).
    pub mode: Option<Box<str>>,

    pub ttl: Option<u8>,

    /// Unrecognized parameters in arrival order, `value` of `None` for bare
    /// tokens.
    pub extra: Vec<(Box<str>, Option<Box<str>>)>,
}

impl Default for Transport {
    fn default() -> Self {
        Transport {
            protocol: "RTP".into(),
            profile: "AVP".into(),
            lower: None,
            cast: None,
            client_port: None,
            server_port: None,
            interleaved: None,
            destination: None,
            source: None,
            ssrc: None,
            mode: None,
            ttl: None,
            extra: Vec::new(),
        }
    }
}

impl Transport {
    /// The usual client offer for UDP unicast: `RTP/AVP;unicast;client_port=rtp-rtcp`.
    pub fn udp_unicast(rtp_port: u16) -> Self {
        Transport {
            cast: Some(CastMode::Unicast),
            client_port: Some(PortRange::pair(rtp_port)),
            ..Default::default()
        }
    }

    /// The usual client offer for TCP interleaving: `RTP/AVP/TCP;unicast;interleaved=ch-ch+1`.
    pub fn tcp_interleaved(channel: u8) -> Self {
        Transport {
            lower: Some(Lower::Tcp),
            cast: Some(CastMode::Unicast),
            interleaved: Some(ChannelRange {
                start: channel,
                end: Some(channel + 1),
            }),
            ..Default::default()
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        let mut parts = s.split(';').map(str::trim);
        let spec = parts.next().filter(|p| !p.is_empty()).ok_or_else(|| {
            format!("Transport header {s:?} missing transport-protocol spec")
        })?;
        let mut spec_parts = spec.split('/');
        let protocol = spec_parts.next().unwrap_or_default();
        if protocol.is_empty() {
            return Err(format!("Transport header {s:?} missing protocol"));
        }
        let profile = spec_parts.next().unwrap_or_default();
        let lower = match spec_parts.next() {
            None => None,
            Some(l) if l.eq_ignore_ascii_case("UDP") => Some(Lower::Udp),
            Some(l) if l.eq_ignore_ascii_case("TCP") => Some(Lower::Tcp),
            Some(l) => return Err(format!("unknown lower transport {l:?}")),
        };
        let mut t = Transport {
            protocol: protocol.into(),
            profile: profile.into(),
            lower,
            ..Default::default()
        };
        for param in parts {
            if param.is_empty() {
                continue;
            }
            let (key, value) = match param.split_once('=') {
                Some((k, v)) => (k.trim(), Some(v.trim())),
                None => (param, None),
            };
            match (key.to_ascii_lowercase().as_str(), value) {
                ("unicast", None) => t.cast = Some(CastMode::Unicast),
                ("multicast", None) => t.cast = Some(CastMode::Multicast),
                ("client_port", Some(v)) => t.client_port = Some(PortRange::parse(v)?),
                ("server_port", Some(v)) => t.server_port = Some(PortRange::parse(v)?),
                ("interleaved", Some(v)) => t.interleaved = Some(ChannelRange::parse(v)?),
                ("destination", Some(v)) => t.destination = Some(v.into()),
                ("source", Some(v)) => t.source = Some(v.into()),
                ("ssrc", Some(v)) => t.ssrc = Some(v.into()),
                ("mode", Some(v)) => t.mode = Some(v.into()),
                ("ttl", Some(v)) => {
                    t.ttl = Some(
                        u8::from_str_radix(v, 10).map_err(|_| format!("bad ttl {v:?}"))?,
                    )
                }
                _ => t
                    .extra
                    .push((key.into(), value.map(Into::into))),
            }
        }
        Ok(t)
    }
}

impl Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.protocol, self.profile)?;
        if let Some(lower) = self.lower {
            write!(f, "/{}", lower.as_str())?;
        }
        if let Some(cast) = self.cast {
            write!(f, ";{}", cast.as_str())?;
        }
        if let Some(ref d) = self.destination {
            write!(f, ";destination={d}")?;
        }
        if let Some(ref s) = self.source {
            write!(f, ";source={s}")?;
        }
        if let Some(ttl) = self.ttl {
            write!(f, ";ttl={ttl}")?;
        }
        if let Some(p) = self.client_port {
            write!(f, ";client_port={p}")?;
        }
        if let Some(p) = self.server_port {
            write!(f, ";server_port={p}")?;
        }
        if let Some(c) = self.interleaved {
            write!(f, ";interleaved={c}")?;
        }
        if let Some(ref s) = self.ssrc {
            write!(f, ";ssrc={s}")?;
        }
        if let Some(ref m) = self.mode {
            write!(f, ";mode={m}")?;
        }
        for (key, value) in &self.extra {
            match value {
                Some(v) => write!(f, ";{key}={v}")?,
                None => write!(f, ";{key}")?,
            }
        }
        Ok(())
    }
}
