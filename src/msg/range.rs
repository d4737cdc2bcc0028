// Copyright (C) 2023 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The structured `Range` header (RFC 2326 §12.29, RFC 7826 §18.40).

use std::fmt::Display;

/// A point on the "normal play time" axis.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum NptTime {
    /// The literal `now`, meaning the live edge.
    Now,

    /// Seconds since the start of the presentation.
    Seconds(f64),
}

impl NptTime {
    /// Parses either the decimal-seconds form (`123`, `12.5`) or the
    /// `hh:mm:ss[.fraction]` form.
    fn parse(s: &str) -> Result<Self, String> {
        if s.eq_ignore_ascii_case("now") {
            return Ok(NptTime::Now);
        }
        let fields: Vec<&str> = s.split(':').collect();
        let secs = match fields[..] {
            [secs] => secs
                .parse::<f64>()
                .map_err(|_| format!("bad npt time {s:?}"))?,
            [hh, mm, ss] => {
                let hh = u64::from_str_radix(hh, 10).map_err(|_| format!("bad npt hours in {s:?}"))?;
                let mm = u64::from_str_radix(mm, 10).map_err(|_| format!("bad npt minutes in {s:?}"))?;
                let ss = ss
                    .parse::<f64>()
                    .map_err(|_| format!("bad npt seconds in {s:?}"))?;
                (hh * 3600 + mm * 60) as f64 + ss
            }
            _ => return Err(format!("bad npt time {s:?}")),
        };
        if !secs.is_finite() || secs < 0.0 {
            return Err(format!("bad npt time {s:?}"));
        }
        Ok(NptTime::Seconds(secs))
    }
}

impl Display for NptTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NptTime::Now => f.pad("now"),
            NptTime::Seconds(s) => write!(f, "{s:.3}"),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SmpteVariant {
    Smpte,
    Smpte30Drop,
    Smpte25,
}

impl SmpteVariant {
    fn as_str(self) -> &'static str {
        match self {
            SmpteVariant::Smpte => "smpte",
            SmpteVariant::Smpte30Drop => "smpte-30-drop",
            SmpteVariant::Smpte25 => "smpte-25",
        }
    }
}

/// A parsed `Range` header: one of the three time formats RTSP defines.
///
/// SMPTE timestamps and UTC clock times are kept verbatim; this crate never
/// does arithmetic on them, so reformatting would only invite drift from
/// what the server sent.
#[derive(Clone, Debug, PartialEq)]
pub enum Range {
    Npt {
        start: NptTime,
        end: Option<NptTime>,
    },
    Smpte {
        variant: SmpteVariant,
        start: Box<str>,
        end: Option<Box<str>>,
    },
    Clock {
        start: Box<str>,
        end: Option<Box<str>>,
    },
}

impl Range {
    /// `npt=<seconds>-`: play from an absolute position to the end.
    pub fn npt_from(seconds: f64) -> Self {
        Range::Npt {
            start: NptTime::Seconds(seconds),
            end: None,
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        let (unit, value) = s
            .split_once('=')
            .ok_or_else(|| format!("Range header {s:?} has no unit"))?;
        let (start, end) = split_range_value(value);
        match unit.trim().to_ascii_lowercase().as_str() {
            "npt" => Ok(Range::Npt {
                start: NptTime::parse(start)?,
                end: end.map(NptTime::parse).transpose()?,
            }),
            "smpte" | "smpte-30-drop" | "smpte-25" => {
                let variant = match unit.len() {
                    5 => SmpteVariant::Smpte,
                    8 => SmpteVariant::Smpte25,
                    _ => SmpteVariant::Smpte30Drop,
                };
                Ok(Range::Smpte {
                    variant,
                    start: start.into(),
                    end: end.map(Into::into),
                })
            }
            "clock" => Ok(Range::Clock {
                start: start.into(),
                end: end.map(Into::into),
            }),
            u => Err(format!("unknown Range unit {u:?}")),
        }
    }
}

/// Splits `start[-[end]]`, treating both `a` and `a-` as open-ended.
fn split_range_value(value: &str) -> (&str, Option<&str>) {
    match value.split_once('-') {
        Some((start, "")) => (start, None),
        Some((start, end)) => (start, Some(end)),
        None => (value, None),
    }
}

impl Display for Range {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Range::Npt { start, end } => {
                write!(f, "npt={start}-")?;
                if let Some(end) = end {
                    write!(f, "{end}")?;
                }
                Ok(())
            }
            Range::Smpte {
                variant,
                start,
                end,
            } => {
                write!(f, "{}={start}-", variant.as_str())?;
                if let Some(end) = end {
                    write!(f, "{end}")?;
                }
                Ok(())
            }
            Range::Clock { start, end } => {
                write!(f, "clock={start}-")?;
                if let Some(end) = end {
                    write!(f, "{end}")?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn npt_open_ended() {
        for raw in ["npt=0-", "npt=0"] {
            let r = Range::parse(raw).unwrap();
            assert_eq!(
                r,
                Range::Npt {
                    start: NptTime::Seconds(0.0),
                    end: None
                },
                "{raw}"
            );
        }
        assert_eq!(Range::parse("npt=0-").unwrap().to_string(), "npt=0.000-");
    }

    #[test]
    fn npt_bounded() {
        let r = Range::parse("npt=2.5-10").unwrap();
        assert_eq!(
            r,
            Range::Npt {
                start: NptTime::Seconds(2.5),
                end: Some(NptTime::Seconds(10.0))
            }
        );
        assert_eq!(r.to_string(), "npt=2.500-10.000");
    }

    #[test]
    fn npt_hhmmss_and_now() {
        assert_eq!(
            Range::parse("npt=1:02:03.5-now").unwrap(),
            Range::Npt {
                start: NptTime::Seconds(3723.5),
                end: Some(NptTime::Now)
            }
        );
    }

    #[test]
    fn smpte_variants() {
        let r = Range::parse("smpte-25=10:07:00-10:07:33:05.01").unwrap();
        assert_eq!(
            r,
            Range::Smpte {
                variant: SmpteVariant::Smpte25,
                start: "10:07:00".into(),
                end: Some("10:07:33:05.01".into()),
            }
        );
        assert_eq!(r.to_string(), "smpte-25=10:07:00-10:07:33:05.01");
        assert!(matches!(
            Range::parse("smpte=0:10:20-").unwrap(),
            Range::Smpte {
                variant: SmpteVariant::Smpte,
                ..
            }
        ));
        assert!(matches!(
            Range::parse("smpte-30-drop=0:10:20-").unwrap(),
            Range::Smpte {
                variant: SmpteVariant::Smpte30Drop,
                ..
            }
        ));
    }

    #[test]
    fn clock_round_trip() {
        let raw = "clock=19961108T143720.25Z-19961108T143850.25Z";
        let r = Range::parse(raw).unwrap();
        assert_eq!(r.to_string(), raw);
    }

    #[test]
    fn rejects_unknown_unit_and_garbage() {
        assert!(Range::parse("frames=0-").is_err());
        assert!(Range::parse("npt=abc-").is_err());
        assert!(Range::parse("0-10").is_err());
    }

    #[test]
    fn npt_from_helper() {
        assert_eq!(Range::npt_from(0.0).to_string(), "npt=0.000-");
    }
}
