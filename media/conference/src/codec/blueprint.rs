use super::{Codec, ID_DISABLE, MediaType};
use crate::caps::{Caps, Structure};

/// Encoding name of a preference which reserves a payload type
pub const RESERVE_PT: &str = "reserve-pt";

const RECV_PROFILE_PARAM: &str = "farstream-recv-profile";
const SEND_PROFILE_PARAM: &str = "farstream-send-profile";

/// Which directions a codec handler supports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlueprintCapability {
    Send,
    Recv,
    Both,
}

impl BlueprintCapability {
    pub fn can_send(self) -> bool {
        matches!(self, Self::Send | Self::Both)
    }

    pub fn can_recv(self) -> bool {
        matches!(self, Self::Recv | Self::Both)
    }
}

/// A locally available codec handler
#[derive(Debug, Clone)]
pub struct CodecBlueprint {
    /// Default description of the codec, its id is only used if in the static range
    pub codec: Codec,
    /// RTP caps produced by the payloader and accepted by the depayloader
    pub rtp_caps: Caps,
    /// Raw caps accepted by the encoder
    pub input_caps: Caps,
    /// Raw caps produced by the decoder
    pub output_caps: Caps,
    pub capability: BlueprintCapability,
}

impl CodecBlueprint {
    pub fn new(codec: Codec, capability: BlueprintCapability) -> Self {
        // Only describe the format itself, payload type and parameters are negotiated
        let mut rtp = Structure::new("application/x-rtp").with_field("media", codec.media_type.as_str());

        if codec.clock_rate != 0 {
            rtp.set("clock-rate", codec.clock_rate);
        }

        if !codec.encoding_name.is_empty() {
            rtp.set("encoding-name", codec.encoding_name.to_ascii_uppercase());
        }

        let rtp_caps = Caps::from(rtp);

        Self {
            codec,
            rtp_caps,
            input_caps: Caps::new_any(),
            output_caps: Caps::new_any(),
            capability,
        }
    }

    pub fn with_input_caps(mut self, caps: Caps) -> Self {
        self.input_caps = caps;
        self
    }

    pub fn with_output_caps(mut self, caps: Caps) -> Self {
        self.output_caps = caps;
        self
    }

    pub fn can_send(&self) -> bool {
        self.capability.can_send()
    }

    pub fn can_recv(&self) -> bool {
        self.capability.can_recv()
    }
}

/// Application preference for a codec
///
/// A preference can pin a payload type or parameters, disable a codec (id [`ID_DISABLE`]), reserve a payload type
/// (encoding name [`RESERVE_PT`]) or describe a codec without any local handler by providing build profiles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecPreference {
    pub codec: Codec,
    /// Pipeline description used to build the sending part
    pub send_profile: Option<String>,
    /// Pipeline description used to build the receiving part
    pub recv_profile: Option<String>,
}

impl CodecPreference {
    pub fn new(codec: Codec) -> Self {
        Self {
            codec,
            send_profile: None,
            recv_profile: None,
        }
    }

    /// Preference reserving the payload type `pt`
    pub fn reserve_pt(media_type: MediaType, pt: u8) -> Self {
        Self::new(Codec::new(i32::from(pt), RESERVE_PT, media_type, 0))
    }

    pub fn with_send_profile(mut self, profile: impl Into<String>) -> Self {
        self.send_profile = Some(profile.into());
        self
    }

    pub fn with_recv_profile(mut self, profile: impl Into<String>) -> Self {
        self.recv_profile = Some(profile.into());
        self
    }

    /// Create a preference from a codec which may carry its profiles as
    /// `farstream-send-profile` & `farstream-recv-profile` parameters
    pub fn from_codec(mut codec: Codec) -> Self {
        let recv_profile = codec.remove_param(RECV_PROFILE_PARAM);
        let send_profile = codec.remove_param(SEND_PROFILE_PARAM);

        Self {
            codec,
            send_profile,
            recv_profile,
        }
    }

    pub fn is_reservation(&self) -> bool {
        self.codec.name_matches(RESERVE_PT) && self.codec.pt().is_some()
    }

    pub fn is_disable(&self) -> bool {
        self.codec.id == ID_DISABLE
    }
}

impl From<Codec> for CodecPreference {
    fn from(codec: Codec) -> Self {
        Self::from_codec(codec)
    }
}
