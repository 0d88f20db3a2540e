//! Codec specific parameter handling
//!
//! Every known encoding has a table of parameters with a class ([`ParamType`]) and a rule which decides how the
//! local and remote values are merged. Parameters without an entry must be equal if both sides carry them.

use super::{Codec, MediaType};
use bitflags::bitflags;
use nom::{
    IResult,
    character::complete::{char, digit1},
    combinator::{all_consuming, map_res, opt},
    multi::separated_list1,
    sequence::{pair, preceded},
};

bitflags! {
    /// Classes of codec parameters, used as mask when negotiating or filtering codecs
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ParamType: u8 {
        /// Restricts what the sender may produce
        const SEND = 1 << 0;
        /// Preference of the receiving side
        const RECV = 1 << 1;
        /// Decoder configuration which is produced by the encoder
        const CONFIG = 1 << 2;
        /// Only take the value the peer sent, never merge it with the local one
        const SEND_AVOID_NEGO = 1 << 3;

        const BOTH = Self::SEND.bits() | Self::RECV.bits();
        const ALL = Self::BOTH.bits() | Self::CONFIG.bits() | Self::SEND_AVOID_NEGO.bits();
    }
}

#[derive(Debug, Clone, Copy)]
enum Rule {
    /// Values must be equal when both sides have one, otherwise the existing value is kept
    Equal,
    /// A missing value is equal to the default, values are compared case insensitively
    EqualOrDefault(&'static str),
    /// Local value if present, otherwise the remote one
    Copy,
    /// Only the local value is used
    LocalOnly,
    /// Lowest numeric value, dropped unless both sides have one
    Minimum,
    /// iLBC frame mode, 30ms wins over 20ms, dropped unless both sides have one
    IlbcMode,
    /// Feature defaults to "yes", a single "no" disables it
    DefaultYes,
    /// Intersection of the event ranges of RFC 4733
    TelephoneEvents,
    /// H.264 profile-level-id, profiles must match and the lower level wins
    ProfileLevelId,
}

#[derive(Debug, Clone, Copy)]
struct ParamSpec {
    name: &'static str,
    kind: ParamType,
    rule: Rule,
}

const fn param(name: &'static str, kind: ParamType, rule: Rule) -> ParamSpec {
    ParamSpec { name, kind, rule }
}

struct CodecSpec {
    media_type: MediaType,
    encoding_name: &'static str,
    params: &'static [ParamSpec],
    /// Parameters which must be known before a receiver can be built
    required_config: &'static [&'static str],
}

const DEFAULT_PARAM: ParamSpec = param("", ParamType::BOTH, Rule::Equal);

const SEND_AVOID_NEGO: ParamType = ParamType::SEND.union(ParamType::SEND_AVOID_NEGO);

static AUDIO_PARAMS: &[ParamSpec] = &[
    param("ptime", ParamType::RECV, Rule::LocalOnly),
    param("maxptime", ParamType::RECV, Rule::LocalOnly),
];

static CODEC_SPECS: &[CodecSpec] = &[
    CodecSpec {
        media_type: MediaType::Audio,
        encoding_name: "telephone-event",
        params: &[param("events", ParamType::BOTH, Rule::TelephoneEvents)],
        required_config: &[],
    },
    CodecSpec {
        media_type: MediaType::Audio,
        encoding_name: "ILBC",
        params: &[param("mode", ParamType::BOTH, Rule::IlbcMode)],
        required_config: &[],
    },
    CodecSpec {
        media_type: MediaType::Audio,
        encoding_name: "G729",
        params: &[param("annexb", ParamType::BOTH, Rule::DefaultYes)],
        required_config: &[],
    },
    CodecSpec {
        media_type: MediaType::Audio,
        encoding_name: "AMR",
        params: &[
            param("octet-align", ParamType::BOTH, Rule::EqualOrDefault("0")),
            param("crc", ParamType::BOTH, Rule::EqualOrDefault("0")),
            param("robust-sorting", ParamType::BOTH, Rule::EqualOrDefault("0")),
            param("interleaving", ParamType::BOTH, Rule::Equal),
        ],
        required_config: &[],
    },
    CodecSpec {
        media_type: MediaType::Audio,
        encoding_name: "VORBIS",
        params: &[param("configuration", ParamType::CONFIG, Rule::Copy)],
        required_config: &["configuration"],
    },
    CodecSpec {
        media_type: MediaType::Video,
        encoding_name: "THEORA",
        params: &[
            param("configuration", ParamType::CONFIG, Rule::Copy),
            param("sampling", ParamType::CONFIG, Rule::Copy),
            param("width", ParamType::CONFIG, Rule::Copy),
            param("height", ParamType::CONFIG, Rule::Copy),
        ],
        required_config: &["configuration"],
    },
    CodecSpec {
        media_type: MediaType::Video,
        encoding_name: "H264",
        params: &[
            param("profile-level-id", ParamType::SEND, Rule::ProfileLevelId),
            param("packetization-mode", ParamType::BOTH, Rule::EqualOrDefault("0")),
            param("sprop-parameter-sets", ParamType::CONFIG, Rule::Copy),
            param("max-mbps", SEND_AVOID_NEGO, Rule::Minimum),
            param("max-fs", SEND_AVOID_NEGO, Rule::Minimum),
            param("max-br", SEND_AVOID_NEGO, Rule::Minimum),
        ],
        required_config: &["sprop-parameter-sets"],
    },
    CodecSpec {
        media_type: MediaType::Video,
        encoding_name: "MP4V-ES",
        params: &[
            param("profile-level-id", ParamType::SEND, Rule::Minimum),
            param("config", ParamType::CONFIG, Rule::Copy),
        ],
        required_config: &["config"],
    },
    CodecSpec {
        media_type: MediaType::Video,
        encoding_name: "H263-1998",
        params: &[
            param("profile", SEND_AVOID_NEGO, Rule::Equal),
            param("level", SEND_AVOID_NEGO, Rule::Minimum),
        ],
        required_config: &[],
    },
];

fn codec_spec(codec: &Codec) -> Option<&'static CodecSpec> {
    CODEC_SPECS
        .iter()
        .find(|spec| spec.media_type == codec.media_type && codec.name_matches(spec.encoding_name))
}

fn param_spec(codec: &Codec, name: &str) -> ParamSpec {
    let spec_params = codec_spec(codec).map(|spec| spec.params).unwrap_or_default();

    let common: &[ParamSpec] = if codec.media_type == MediaType::Audio {
        AUDIO_PARAMS
    } else {
        &[]
    };

    spec_params
        .iter()
        .chain(common)
        .find(|p| p.name.eq_ignore_ascii_case(name))
        .copied()
        .unwrap_or(DEFAULT_PARAM)
}

/// Negotiate two codecs, returns `None` if they cannot be used together
///
/// Only parameters whose class intersects the respective mask are considered from each side. The payload type of
/// the result is the remote's if it has one.
pub fn sdp_negotiate_codec(
    local: &Codec,
    local_mask: ParamType,
    remote: &Codec,
    remote_mask: ParamType,
) -> Option<Codec> {
    if local.media_type != remote.media_type || !local.name_matches(&remote.encoding_name) {
        return None;
    }

    let clock_rate = match (local.clock_rate, remote.clock_rate) {
        (0, 0) => return None,
        (0, rate) | (rate, 0) => rate,
        (a, b) if a == b => a,
        _ => return None,
    };

    let channels = match (local.channels, remote.channels) {
        (0, channels) | (channels, 0) => channels,
        (a, b) if a == b => a,
        _ => return None,
    };

    let id = if remote.id >= 0 { remote.id } else { local.id };

    let mut result = Codec::new(
        id,
        local.encoding_name.clone(),
        local.media_type,
        clock_rate,
    )
    .with_channels(channels);

    result.minimum_reporting_interval = remote
        .minimum_reporting_interval
        .or(local.minimum_reporting_interval);
    result.feedback_params = remote.feedback_params.clone();

    let names = local.optional_params.iter().map(|p| p.name.as_str()).chain(
        remote
            .optional_params
            .iter()
            .filter(|r| local.param(&r.name).is_none())
            .map(|p| p.name.as_str()),
    );

    for name in names {
        let spec = param_spec(local, name);

        let local_value = local
            .param_value(name)
            .filter(|_| spec.kind.intersects(local_mask));
        let remote_value = remote
            .param_value(name)
            .filter(|_| spec.kind.intersects(remote_mask));

        let value = if spec.kind.contains(ParamType::SEND_AVOID_NEGO)
            && remote_mask.contains(ParamType::SEND_AVOID_NEGO)
        {
            remote_value.map(ToOwned::to_owned)
        } else {
            match merge(spec.rule, local_value, remote_value) {
                Ok(value) => value,
                Err(()) => {
                    log::trace!(
                        "parameter {name} of {} does not match ({local_value:?} vs {remote_value:?})",
                        local.encoding_name
                    );
                    return None;
                }
            }
        };

        if let Some(value) = value {
            result.add_param(name, value);
        }
    }

    Some(result)
}

fn merge(rule: Rule, local: Option<&str>, remote: Option<&str>) -> Result<Option<String>, ()> {
    match rule {
        Rule::Equal => match (local, remote) {
            (Some(l), Some(r)) if l != r => Err(()),
            (l, r) => Ok(l.or(r).map(ToOwned::to_owned)),
        },
        Rule::EqualOrDefault(default) => {
            let value = local.or(remote);

            if !local
                .unwrap_or(default)
                .eq_ignore_ascii_case(remote.unwrap_or(default))
            {
                return Err(());
            }

            Ok(value.map(ToOwned::to_owned))
        }
        Rule::Copy => Ok(local.or(remote).map(ToOwned::to_owned)),
        Rule::LocalOnly => Ok(local.map(ToOwned::to_owned)),
        Rule::Minimum => match (local, remote) {
            (Some(l), Some(r)) => {
                let l: u64 = l.trim().parse().map_err(|_| ())?;
                let r: u64 = r.trim().parse().map_err(|_| ())?;

                Ok(Some(l.min(r).to_string()))
            }
            _ => Ok(None),
        },
        Rule::IlbcMode => match (local, remote) {
            (Some(l), Some(r)) => {
                let mode = if l.trim() == "30" || r.trim() == "30" {
                    "30"
                } else {
                    "20"
                };

                Ok(Some(mode.to_owned()))
            }
            _ => Ok(None),
        },
        Rule::DefaultYes => {
            let is_no = |v: Option<&str>| v.is_some_and(|v| v.trim().eq_ignore_ascii_case("no"));

            if is_no(local) || is_no(remote) {
                Ok(Some("no".to_owned()))
            } else {
                Ok(None)
            }
        }
        Rule::TelephoneEvents => match (local, remote) {
            (Some(l), Some(r)) => {
                let l = parse_events(l).ok_or(())?;
                let r = parse_events(r).ok_or(())?;

                let common: Vec<bool> = l.iter().zip(&r).map(|(l, r)| *l && *r).collect();

                if common.iter().any(|e| *e) {
                    Ok(Some(format_events(&common)))
                } else {
                    Err(())
                }
            }
            (Some(v), None) | (None, Some(v)) => {
                parse_events(v).ok_or(())?;
                Ok(Some(v.to_owned()))
            }
            (None, None) => Ok(None),
        },
        Rule::ProfileLevelId => match (local, remote) {
            (Some(l), Some(r)) => {
                let l = parse_profile_level_id(l).ok_or(())?;
                let r = parse_profile_level_id(r).ok_or(())?;

                if l[0] != r[0] {
                    return Err(());
                }

                Ok(Some(format!("{:02x}{:02x}{:02x}", l[0], l[1], l[2].min(r[2]))))
            }
            (l, r) => Ok(l.or(r).map(ToOwned::to_owned)),
        },
    }
}

fn event_number(i: &str) -> IResult<&str, u8> {
    map_res(digit1, |s: &str| s.parse::<u8>())(i)
}

fn event_range(i: &str) -> IResult<&str, (u8, u8)> {
    let (i, (start, end)) = pair(event_number, opt(preceded(char('-'), event_number)))(i)?;

    Ok((i, (start, end.unwrap_or(start))))
}

/// Parse a RFC 4733 event list (e.g. `0-15,32`) into a set of 256 flags
fn parse_events(events: &str) -> Option<Vec<bool>> {
    let (_, ranges) = all_consuming(separated_list1(char(','), event_range))(events.trim()).ok()?;

    let mut set = vec![false; 256];

    for (start, end) in ranges {
        if start > end {
            return None;
        }

        for event in start..=end {
            set[usize::from(event)] = true;
        }
    }

    Some(set)
}

fn format_events(set: &[bool]) -> String {
    let mut out = String::new();
    let mut i = 0;

    while i < set.len() {
        if !set[i] {
            i += 1;
            continue;
        }

        let start = i;
        while i + 1 < set.len() && set[i + 1] {
            i += 1;
        }

        if !out.is_empty() {
            out.push(',');
        }

        if start == i {
            out.push_str(&start.to_string());
        } else {
            out.push_str(&format!("{start}-{i}"));
        }

        i += 1;
    }

    out
}

fn parse_profile_level_id(s: &str) -> Option<[u8; 3]> {
    let s = s.trim();

    if s.len() != 6 || !s.is_ascii() {
        return None;
    }

    let mut out = [0u8; 3];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).ok()?;
    }

    Some(out)
}

/// Negotiate two codecs ignoring the decoder configuration
pub(crate) fn codec_sdp_compare(a: &Codec, b: &Codec) -> bool {
    let mask = ParamType::ALL.difference(ParamType::CONFIG);

    sdp_negotiate_codec(a, mask, b, mask).is_some()
}

/// Clone `codec` without the parameters whose class intersects `mask`
pub fn copy_filtered(codec: &Codec, mask: ParamType) -> Codec {
    let mut copy = codec.clone();

    copy.optional_params
        .retain(|p| !param_spec(codec, &p.name).kind.intersects(mask));

    copy
}

/// Returns if the codec is missing configuration its decoder requires
pub fn needs_config(codec: &Codec) -> bool {
    codec_spec(codec).is_some_and(|spec| {
        spec.required_config
            .iter()
            .any(|name| codec.param(name).is_none())
    })
}

/// Returns if `name` is a configuration parameter of this codec
pub fn has_config_data_named(codec: &Codec, name: &str) -> bool {
    config_param_names(codec).any(|n| n.eq_ignore_ascii_case(name))
}

pub(crate) fn config_param_names(codec: &Codec) -> impl Iterator<Item = &'static str> {
    codec_spec(codec)
        .map(|spec| spec.params)
        .unwrap_or_default()
        .iter()
        .filter(|p| p.kind.contains(ParamType::CONFIG))
        .map(|p| p.name)
}

/// Codecs of `new` whose configuration differs from the codec with the same payload type in `old`
pub fn codecs_list_has_codec_config_changed(old: &[Codec], new: &[Codec]) -> Vec<Codec> {
    new.iter()
        .filter(|new_codec| {
            let Some(old_codec) = old.iter().find(|old_codec| {
                old_codec.id == new_codec.id && old_codec.name_matches(&new_codec.encoding_name)
            }) else {
                return false;
            };

            config_param_names(new_codec)
                .any(|name| old_codec.param_value(name) != new_codec.param_value(name))
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn g729() -> Codec {
        Codec::new(18, "G729", MediaType::Audio, 8000)
    }

    fn ilbc(mode: Option<&str>) -> Codec {
        let codec = Codec::new(100, "ILBC", MediaType::Audio, 8000);

        match mode {
            Some(mode) => codec.with_param("mode", mode),
            None => codec,
        }
    }

    fn nego(local: &Codec, remote: &Codec) -> Option<Codec> {
        sdp_negotiate_codec(local, ParamType::ALL, remote, ParamType::SEND)
    }

    #[test]
    fn clock_rate_rules() {
        let with_rate = Codec::new(96, "X", MediaType::Audio, 8000);
        let without_rate = Codec::new(96, "X", MediaType::Audio, 0);

        assert_eq!(nego(&with_rate, &without_rate).map(|c| c.clock_rate), Some(8000));
        assert_eq!(nego(&without_rate, &with_rate).map(|c| c.clock_rate), Some(8000));
        assert!(nego(&without_rate, &without_rate).is_none());
        assert!(nego(&with_rate, &Codec::new(96, "X", MediaType::Audio, 16000)).is_none());
        assert!(nego(&with_rate, &Codec::new(96, "Y", MediaType::Audio, 8000)).is_none());
        assert!(nego(&with_rate, &Codec::new(96, "x", MediaType::Video, 8000)).is_none());
    }

    #[test]
    fn unknown_params_must_be_equal() {
        let remote = g729().with_param("p1", "v1");
        assert_eq!(nego(&g729(), &remote), Some(g729().with_param("p1", "v1")));

        let local = g729().with_param("p2", "v2");
        assert_eq!(nego(&local, &g729()), Some(g729().with_param("p2", "v2")));

        assert!(nego(&local, &g729().with_param("p2", "v2-2")).is_none());
    }

    #[test]
    fn g729_annexb() {
        assert_eq!(nego(&g729(), &g729().with_param("annexb", "yes")), Some(g729()));

        let no = g729().with_param("annexb", "no");
        assert_eq!(nego(&g729(), &no), Some(no.clone()));
        assert_eq!(nego(&no, &g729()), Some(no.clone()));
        assert_eq!(nego(&no, &g729().with_param("annexb", "yes")), Some(no));
    }

    #[test]
    fn ilbc_mode() {
        assert_eq!(nego(&ilbc(Some("20")), &ilbc(None)), Some(ilbc(None)));
        assert_eq!(nego(&ilbc(Some("20")), &ilbc(Some("30"))), Some(ilbc(Some("30"))));
        assert_eq!(nego(&ilbc(Some("20")), &ilbc(Some("20"))), Some(ilbc(Some("20"))));
        assert_eq!(nego(&ilbc(Some("30")), &ilbc(Some("20"))), Some(ilbc(Some("30"))));
        assert_eq!(nego(&ilbc(None), &ilbc(Some("30"))), Some(ilbc(None)));
        assert_eq!(nego(&ilbc(None), &ilbc(Some("20"))), Some(ilbc(None)));
    }

    #[test]
    fn telephone_events() {
        let te = |events: &str| {
            Codec::new(100, "telephone-event", MediaType::Audio, 8000).with_param("events", events)
        };

        let local = te("0-15");

        assert_eq!(nego(&local, &te("0-15")), Some(te("0-15")));
        assert_eq!(nego(&local, &te("0,2-15")), Some(te("0,2-15")));
        assert_eq!(nego(&local, &te("2")), Some(te("2")));
        assert_eq!(nego(&local, &te("2-3")), Some(te("2-3")));
        assert_eq!(nego(&local, &te("0,10-26,32")), Some(te("0,10-15")));
        assert_eq!(nego(&local, &te("0,10")), Some(te("0,10")));
        assert!(nego(&local, &te("0,2-15-2")).is_none());
        assert!(nego(&local, &te("0,,3")).is_none());
        assert!(nego(&local, &te("16-20")).is_none());
    }

    #[test]
    fn ptime_is_local_preference() {
        let local = Codec::PCMU.with_param("ptime", "10");
        let remote = Codec::PCMU.with_param("ptime", "30");

        let result = nego(&local, &remote).unwrap();
        assert_eq!(result.param_value("ptime"), Some("10"));
    }

    #[test]
    fn h264_profile_level() {
        let h264 = |plid: &str| Codec::new(96, "H264", MediaType::Video, 90000).with_param("profile-level-id", plid);

        let result = nego(&h264("42e01f"), &h264("42e00d")).unwrap();
        assert_eq!(result.param_value("profile-level-id"), Some("42e00d"));

        assert!(nego(&h264("42e01f"), &h264("64001f")).is_none());
    }

    #[test]
    fn send_avoid_nego_takes_peer_value() {
        let h264 = Codec::new(96, "H264", MediaType::Video, 90000);
        let local = h264.clone().with_param("max-mbps", "11880");

        let avoid = ParamType::SEND | ParamType::SEND_AVOID_NEGO;

        let result = sdp_negotiate_codec(&local, ParamType::ALL, &h264, avoid).unwrap();
        assert_eq!(result.param_value("max-mbps"), None);

        let remote = h264.clone().with_param("max-mbps", "40500");
        let result = sdp_negotiate_codec(&local, ParamType::ALL, &remote, avoid).unwrap();
        assert_eq!(result.param_value("max-mbps"), Some("40500"));

        let result = sdp_negotiate_codec(&local, ParamType::ALL, &remote, ParamType::SEND).unwrap();
        assert_eq!(result.param_value("max-mbps"), Some("11880"));
    }

    #[test]
    fn config_params() {
        let vorbis = Codec::new(96, "VORBIS", MediaType::Audio, 44100);
        let configured = vorbis.clone().with_param("configuration", "aaa");

        assert!(needs_config(&vorbis));
        assert!(!needs_config(&configured));
        assert!(!needs_config(&Codec::PCMU));
        assert!(has_config_data_named(&vorbis, "Configuration"));
        assert!(!has_config_data_named(&Codec::PCMU, "configuration"));

        assert_eq!(copy_filtered(&configured, ParamType::CONFIG), vorbis);

        // decoder config is only taken from the side whose mask includes CONFIG
        let result =
            sdp_negotiate_codec(&vorbis, ParamType::RECV, &configured, ParamType::RECV | ParamType::CONFIG)
                .unwrap();
        assert_eq!(result.param_value("configuration"), Some("aaa"));

        let result = sdp_negotiate_codec(&vorbis, ParamType::RECV, &configured, ParamType::RECV).unwrap();
        assert_eq!(result.param_value("configuration"), None);
    }

    #[test]
    fn config_changed() {
        let configured = vec![Codec::new(96, "VORBIS", MediaType::Audio, 90000).with_param("configuration", "aaa")];
        let unconfigured = vec![Codec::new(96, "VORBIS", MediaType::Audio, 90000)];
        let other = vec![Codec::new(96, "VORBIS", MediaType::Audio, 90000).with_param("configuration", "bbb")];

        assert!(codecs_list_has_codec_config_changed(&configured, &configured).is_empty());
        assert_eq!(
            codecs_list_has_codec_config_changed(&configured, &unconfigured),
            unconfigured
        );
        assert_eq!(
            codecs_list_has_codec_config_changed(&unconfigured, &configured),
            configured
        );
        assert_eq!(codecs_list_has_codec_config_changed(&configured, &other), other);
    }

    #[test]
    fn events_formatting() {
        let set = parse_events("5,1-3,4,10").unwrap();

        assert_eq!(format_events(&set), "1-5,10");
        assert!(parse_events("3-1").is_none());
        assert!(parse_events("256").is_none());
    }
}
