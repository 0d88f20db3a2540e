use super::{CodecAssociation, associations_to_codecs};
use crate::codec::{Codec, ParamType, has_config_data_named, sdp_negotiate_codec};

/// Codecs a single stream receives
///
/// The advertised codecs of the session are extended with the configuration parameters the stream's remote sent
/// for the matching codec, so that decoders can be built for this peer.
pub fn stream_negotiated_codecs(associations: &[CodecAssociation], remote_codecs: &[Codec]) -> Vec<Codec> {
    let mut codecs = associations_to_codecs(associations, false);

    for codec in &mut codecs {
        let remote = remote_codecs.iter().find(|remote| {
            sdp_negotiate_codec(codec, ParamType::RECV, remote, ParamType::RECV | ParamType::CONFIG).is_some()
        });

        let Some(remote) = remote else {
            continue;
        };

        for param in &remote.optional_params {
            if has_config_data_named(codec, &param.name) {
                log::trace!("Adding parameter to stream codec {}={}", param.name, param.value);

                codec.set_param(&param.name, param.value.clone());
            }
        }
    }

    codecs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MediaType;

    #[test]
    fn remote_config_is_added() {
        let theora = Codec::new(96, "THEORA", MediaType::Video, 90000);
        let associations = [
            CodecAssociation::new(theora.clone()),
            CodecAssociation::new(Codec::H263),
        ];

        let remote = [theora
            .clone()
            .with_param("configuration", "remote-config")
            .with_param("unrelated", "1")];

        let codecs = stream_negotiated_codecs(&associations, &remote);

        assert_eq!(codecs.len(), 2);
        assert_eq!(codecs[0].param_value("configuration"), Some("remote-config"));
        assert_eq!(codecs[0].param_value("unrelated"), None);
        assert_eq!(codecs[1], Codec::H263);
    }
}
