use crate::hdrext::RtpHeaderExtension;

/// Default [`SessionConfig::no_rtcp_timeout`] in milliseconds
pub const DEFAULT_NO_RTCP_TIMEOUT: i64 = 7000;

/// TCP friendly rate control of a session's sending rate
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum TfrcMode {
    #[default]
    Disabled,
    /// Drive the encoder bitrate from TFRC feedback, requires the `tfrc` feedback parameter and the RTT/send
    /// timestamp header extension to be negotiated
    Enabled,
}

/// Configuration of a [`Conference`](crate::Conference)
#[derive(Debug, Clone)]
pub struct ConferenceConfig {
    /// CNAME sent in RTCP SDES packets, a random one is generated if not set
    pub sdes_cname: Option<String>,
    /// Default [`SessionConfig::no_rtcp_timeout`] of sessions created with
    /// [`Conference::new_session`](crate::Conference::new_session)
    pub no_rtcp_timeout: i64,
    /// Default [`SessionConfig::tfrc`] of video sessions created with
    /// [`Conference::new_session`](crate::Conference::new_session)
    pub tfrc: TfrcMode,
}

impl Default for ConferenceConfig {
    fn default() -> Self {
        Self {
            sdes_cname: None,
            no_rtcp_timeout: DEFAULT_NO_RTCP_TIMEOUT,
            tfrc: TfrcMode::default(),
        }
    }
}

/// Configuration of a [`Session`](crate::Session)
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Milliseconds to wait for a RTCP SDES before binding an unknown SSRC to the only stream of the session.
    ///
    /// `0` binds immediately, a negative value waits for the CNAME forever.
    pub no_rtcp_timeout: i64,
    pub tfrc: TfrcMode,
    /// Header extensions to offer, extensions without id get one assigned during negotiation
    pub rtp_header_extension_preferences: Vec<RtpHeaderExtension>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            no_rtcp_timeout: DEFAULT_NO_RTCP_TIMEOUT,
            tfrc: TfrcMode::default(),
            rtp_header_extension_preferences: Vec::new(),
        }
    }
}
