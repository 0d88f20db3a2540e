//! # Codec model
//!
//! [`Codec`] describes a single RTP payload format: payload type, encoding name, clock rate, channels plus the
//! optional (fmtp) and feedback (rtcp-fb) parameters. It is the unit exchanged with the application and the peers.
//!
//! [`CodecBlueprint`] describes a locally available codec handler, [`CodecPreference`] an application supplied
//! preference which steers the negotiation.

use crate::caps::{Caps, Structure};
use std::{borrow::Cow, fmt, str::FromStr};

mod blueprint;
pub mod keyfile;
mod specific;

pub use blueprint::{BlueprintCapability, CodecBlueprint, CodecPreference, RESERVE_PT};
pub use specific::{
    ParamType, codecs_list_has_codec_config_changed, copy_filtered, has_config_data_named,
    needs_config, sdp_negotiate_codec,
};

pub(crate) use specific::{codec_sdp_compare, config_param_names};

/// Payload type value of a codec which doesn't have a payload type assigned yet
pub const ID_ANY: i32 = -1;

/// Payload type value of a codec preference which disables the codec
pub const ID_DISABLE: i32 = -2;

/// Kind of media carried by a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaType {
    Audio,
    Video,
    Application,
}

impl MediaType {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaType::Audio => "audio",
            MediaType::Video => "video",
            MediaType::Application => "application",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown media type")]
pub struct UnknownMediaType;

impl FromStr for MediaType {
    type Err = UnknownMediaType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("audio") {
            Ok(MediaType::Audio)
        } else if s.eq_ignore_ascii_case("video") {
            Ok(MediaType::Video)
        } else if s.eq_ignore_ascii_case("application") {
            Ok(MediaType::Application)
        } else {
            Err(UnknownMediaType)
        }
    }
}

/// Optional (fmtp) parameter of a codec
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecParameter {
    pub name: String,
    pub value: String,
}

/// RTCP feedback parameter (RFC 4585) of a codec
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedbackParameter {
    pub type_: String,
    pub subtype: String,
    pub extra_params: String,
}

impl FeedbackParameter {
    fn matches(&self, type_: &str, subtype: &str) -> bool {
        self.type_.eq_ignore_ascii_case(type_) && self.subtype.eq_ignore_ascii_case(subtype)
    }
}

/// Description of a RTP payload format
///
/// Equality (`==`) compares the encoding name case insensitively and the optional and feedback parameters
/// independent of their order.
#[derive(Debug, Clone)]
pub struct Codec {
    /// Payload type in `0..=127`, [`ID_ANY`] or [`ID_DISABLE`]
    pub id: i32,
    pub media_type: MediaType,
    pub encoding_name: Cow<'static, str>,
    /// Clock rate, 0 if unknown
    pub clock_rate: u32,
    /// Number of channels, 0 if unknown
    pub channels: u32,
    /// Minimum RTCP reporting interval in milliseconds (`trr-int`)
    pub minimum_reporting_interval: Option<u32>,
    pub optional_params: Vec<CodecParameter>,
    pub feedback_params: Vec<FeedbackParameter>,
}

impl Codec {
    pub const PCMU: Self = Self::audio("PCMU", 8000).with_id(0);
    pub const GSM: Self = Self::audio("GSM", 8000).with_id(3);
    pub const PCMA: Self = Self::audio("PCMA", 8000).with_id(8);
    pub const G722: Self = Self::audio("G722", 8000).with_id(9).with_channels(1);
    pub const CN: Self = Self::audio("CN", 8000).with_id(13);
    pub const G729: Self = Self::audio("G729", 8000).with_id(18);
    pub const SPEEX: Self = Self::audio("SPEEX", 8000);
    pub const TELEPHONE_EVENT: Self = Self::audio("telephone-event", 8000);

    pub const H261: Self = Self::video("H261", 90_000).with_id(31);
    pub const H263: Self = Self::video("H263", 90_000).with_id(34);
    pub const H264: Self = Self::video("H264", 90_000);
    pub const THEORA: Self = Self::video("THEORA", 90_000);

    pub fn new(
        id: i32,
        encoding_name: impl Into<Cow<'static, str>>,
        media_type: MediaType,
        clock_rate: u32,
    ) -> Self {
        Codec {
            id,
            media_type,
            encoding_name: encoding_name.into(),
            clock_rate,
            channels: 0,
            minimum_reporting_interval: None,
            optional_params: Vec::new(),
            feedback_params: Vec::new(),
        }
    }

    pub const fn audio(encoding_name: &'static str, clock_rate: u32) -> Self {
        Self::new_static(encoding_name, MediaType::Audio, clock_rate)
    }

    pub const fn video(encoding_name: &'static str, clock_rate: u32) -> Self {
        Self::new_static(encoding_name, MediaType::Video, clock_rate)
    }

    const fn new_static(encoding_name: &'static str, media_type: MediaType, clock_rate: u32) -> Self {
        Codec {
            id: ID_ANY,
            media_type,
            encoding_name: Cow::Borrowed(encoding_name),
            clock_rate,
            channels: 0,
            minimum_reporting_interval: None,
            optional_params: Vec::new(),
            feedback_params: Vec::new(),
        }
    }

    pub const fn with_id(mut self, id: i32) -> Self {
        self.id = id;
        self
    }

    pub const fn with_channels(mut self, channels: u32) -> Self {
        self.channels = channels;
        self
    }

    pub const fn with_minimum_reporting_interval(mut self, interval: u32) -> Self {
        self.minimum_reporting_interval = Some(interval);
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.add_param(name, value);
        self
    }

    pub fn with_feedback(
        mut self,
        type_: impl Into<String>,
        subtype: impl Into<String>,
        extra_params: impl Into<String>,
    ) -> Self {
        self.add_feedback(type_, subtype, extra_params);
        self
    }

    /// The payload type if one is assigned
    pub fn pt(&self) -> Option<u8> {
        u8::try_from(self.id).ok().filter(|pt| *pt <= 127)
    }

    pub fn is_disabled(&self) -> bool {
        self.id == ID_DISABLE
    }

    pub fn name_matches(&self, name: &str) -> bool {
        self.encoding_name.eq_ignore_ascii_case(name)
    }

    /// Find a optional parameter by name, names are case insensitive
    pub fn param(&self, name: &str) -> Option<&CodecParameter> {
        self.optional_params
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    pub fn param_value(&self, name: &str) -> Option<&str> {
        self.param(name).map(|p| p.value.as_str())
    }

    /// Append a optional parameter, does not check for duplicates
    pub fn add_param(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.optional_params.push(CodecParameter {
            name: name.into(),
            value: value.into(),
        });
    }

    /// Replace the value of an existing parameter or add it
    pub fn set_param(&mut self, name: &str, value: impl Into<String>) {
        match self
            .optional_params
            .iter_mut()
            .find(|p| p.name.eq_ignore_ascii_case(name))
        {
            Some(param) => param.value = value.into(),
            None => self.add_param(name, value),
        }
    }

    /// Remove a parameter, returns its value
    pub fn remove_param(&mut self, name: &str) -> Option<String> {
        let position = self
            .optional_params
            .iter()
            .position(|p| p.name.eq_ignore_ascii_case(name))?;

        Some(self.optional_params.remove(position).value)
    }

    pub fn feedback(&self, type_: &str, subtype: &str) -> Option<&FeedbackParameter> {
        self.feedback_params
            .iter()
            .find(|fb| fb.matches(type_, subtype))
    }

    pub fn has_feedback(&self, feedback: &FeedbackParameter) -> bool {
        self.feedback_params
            .iter()
            .any(|fb| fb.matches(&feedback.type_, &feedback.subtype) && fb.extra_params == feedback.extra_params)
    }

    pub fn add_feedback(
        &mut self,
        type_: impl Into<String>,
        subtype: impl Into<String>,
        extra_params: impl Into<String>,
    ) {
        self.feedback_params.push(FeedbackParameter {
            type_: type_.into(),
            subtype: subtype.into(),
            extra_params: extra_params.into(),
        });
    }

    pub fn remove_feedback(&mut self, type_: &str, subtype: &str) {
        self.feedback_params.retain(|fb| !fb.matches(type_, subtype));
    }

    /// RTP caps of this codec as a pipeline would describe it
    pub fn to_rtp_caps(&self) -> Caps {
        let mut structure = Structure::new("application/x-rtp")
            .with_field("media", self.media_type.as_str());

        if self.clock_rate != 0 {
            structure.set("clock-rate", self.clock_rate);
        }

        if !self.encoding_name.is_empty() {
            structure.set("encoding-name", self.encoding_name.to_ascii_uppercase());
        }

        if let Some(pt) = self.pt() {
            structure.set("payload", u32::from(pt));
        }

        if self.channels != 0 {
            structure.set("encoding-params", self.channels.to_string());
        }

        if let Some(interval) = self.minimum_reporting_interval {
            structure.set("rtcp-fb-trr-int", interval);
        }

        for param in &self.optional_params {
            structure.set(param.name.to_ascii_lowercase(), param.value.clone());
        }

        for fb in &self.feedback_params {
            let name = if fb.subtype.is_empty() {
                format!("rtcp-fb-{}", fb.type_)
            } else {
                format!("rtcp-fb-{}-{}", fb.type_, fb.subtype)
            };

            structure.set(name.to_ascii_lowercase(), fb.extra_params.clone());
        }

        Caps::from(structure)
    }
}

impl PartialEq for Codec {
    fn eq(&self, other: &Self) -> bool {
        if self.id != other.id
            || self.media_type != other.media_type
            || self.clock_rate != other.clock_rate
            || self.channels != other.channels
            || self.minimum_reporting_interval != other.minimum_reporting_interval
            || !self.encoding_name.eq_ignore_ascii_case(&other.encoding_name)
        {
            return false;
        }

        if self.optional_params.len() != other.optional_params.len()
            || self.feedback_params.len() != other.feedback_params.len()
        {
            return false;
        }

        let params_equal = self.optional_params.iter().all(|param| {
            other
                .optional_params
                .iter()
                .any(|p| p.name.eq_ignore_ascii_case(&param.name) && p.value == param.value)
        });

        params_equal && self.feedback_params.iter().all(|fb| other.has_feedback(fb))
    }
}

impl Eq for Codec {}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} {} clock:{} channels:{}",
            self.id, self.media_type, self.encoding_name, self.clock_rate, self.channels
        )?;

        if let Some(interval) = self.minimum_reporting_interval {
            write!(f, " trr-int={interval}")?;
        }

        for param in &self.optional_params {
            write!(f, " {}={}", param.name, param.value)?;
        }

        for fb in &self.feedback_params {
            write!(f, " {}/{}={}", fb.type_, fb.subtype, fb.extra_params)?;
        }

        Ok(())
    }
}

/// Compare two codec lists element by element
pub fn list_are_equal(a: &[Codec], b: &[Codec]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(a, b)| a == b)
}
