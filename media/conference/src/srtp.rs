//! SRTP keying parameters
//!
//! The session's encrypter and the per-stream decryption keys are configured with [`SrtpParameters`]. The cipher
//! primitives themselves live in the media backend.

use crate::Error;
use bytes::Bytes;
use std::{fmt, str::FromStr};

const DEFAULT_REPLAY_WINDOW_SIZE: u32 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SrtpCipher {
    Null,
    Aes128Icm,
    Aes256Icm,
}

impl SrtpCipher {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Aes128Icm => "aes-128-icm",
            Self::Aes256Icm => "aes-256-icm",
        }
    }

    /// Length of master key plus salt required by this cipher
    pub fn key_len(self) -> usize {
        match self {
            Self::Null | Self::Aes128Icm => 30,
            Self::Aes256Icm => 46,
        }
    }
}

impl FromStr for SrtpCipher {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "null" => Ok(Self::Null),
            "aes-128-icm" => Ok(Self::Aes128Icm),
            "aes-256-icm" => Ok(Self::Aes256Icm),
            _ => Err(Error::InvalidArguments(format!("invalid cipher value: {s}"))),
        }
    }
}

impl fmt::Display for SrtpCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SrtpAuth {
    Null,
    HmacSha1_32,
    HmacSha1_80,
}

impl SrtpAuth {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::HmacSha1_32 => "hmac-sha1-32",
            Self::HmacSha1_80 => "hmac-sha1-80",
        }
    }
}

impl FromStr for SrtpAuth {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "null" => Ok(Self::Null),
            "hmac-sha1-32" => Ok(Self::HmacSha1_32),
            "hmac-sha1-80" => Ok(Self::HmacSha1_80),
            _ => Err(Error::InvalidArguments(format!("invalid auth value: {s}"))),
        }
    }
}

impl fmt::Display for SrtpAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cipher, authentication and key material for one direction of a session
///
/// `rtp_*` and `rtcp_*` default to the values passed to [`SrtpParameters::new`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrtpParameters {
    pub rtp_cipher: SrtpCipher,
    pub rtcp_cipher: SrtpCipher,
    pub rtp_auth: SrtpAuth,
    pub rtcp_auth: SrtpAuth,
    pub key: Bytes,
    pub replay_window_size: u32,
}

impl SrtpParameters {
    pub fn new(cipher: SrtpCipher, auth: SrtpAuth, key: impl Into<Bytes>) -> Self {
        Self {
            rtp_cipher: cipher,
            rtcp_cipher: cipher,
            rtp_auth: auth,
            rtcp_auth: auth,
            key: key.into(),
            replay_window_size: DEFAULT_REPLAY_WINDOW_SIZE,
        }
    }

    /// Parameters which let packets through unprotected
    pub fn null() -> Self {
        Self::new(SrtpCipher::Null, SrtpAuth::Null, Bytes::new())
    }

    pub fn with_rtp_cipher(mut self, cipher: SrtpCipher) -> Self {
        self.rtp_cipher = cipher;
        self
    }

    pub fn with_rtcp_cipher(mut self, cipher: SrtpCipher) -> Self {
        self.rtcp_cipher = cipher;
        self
    }

    pub fn with_rtp_auth(mut self, auth: SrtpAuth) -> Self {
        self.rtp_auth = auth;
        self
    }

    pub fn with_rtcp_auth(mut self, auth: SrtpAuth) -> Self {
        self.rtcp_auth = auth;
        self
    }

    pub fn with_replay_window_size(mut self, size: u32) -> Self {
        self.replay_window_size = size;
        self
    }

    pub fn is_null(&self) -> bool {
        self.rtp_cipher == SrtpCipher::Null
            && self.rtcp_cipher == SrtpCipher::Null
            && self.rtp_auth == SrtpAuth::Null
            && self.rtcp_auth == SrtpAuth::Null
    }

    /// Key length required by the configured ciphers
    pub fn required_key_len(&self) -> usize {
        self.rtp_cipher.key_len().max(self.rtcp_cipher.key_len())
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if !(64..32768).contains(&self.replay_window_size) {
            return Err(Error::InvalidArguments(format!(
                "replay window size must be between 64 and 32768, got {}",
                self.replay_window_size
            )));
        }

        if self.is_null() {
            return Ok(());
        }

        let required = self.required_key_len();

        if self.key.len() != required {
            return Err(Error::InvalidArguments(format!(
                "key must be {required} bytes long for {}/{}, got {}",
                self.rtp_cipher,
                self.rtcp_cipher,
                self.key.len()
            )));
        }

        Ok(())
    }
}
