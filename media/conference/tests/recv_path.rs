use common::{Call, MockBackend, audio_blueprints, events, make_conference};
use ezk_conference::{
    Conference, ConferenceEvent, Direction, MediaType, RtpPipelineHooks, Session, SessionConfig, Stream,
    codec::Codec,
    srtp::{SrtpAuth, SrtpCipher, SrtpParameters},
    substream::SubStreamId,
};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

mod common;

fn session_with_timeout(no_rtcp_timeout: i64) -> (Conference, Arc<MockBackend>, Session) {
    let (conference, backend) = make_conference(audio_blueprints());

    let session = conference
        .new_session_with_config(
            MediaType::Audio,
            SessionConfig {
                no_rtcp_timeout,
                ..SessionConfig::default()
            },
        )
        .unwrap();

    (conference, backend, session)
}

fn add_stream(conference: &Conference, session: &Session, cname: &str) -> Stream {
    let participant = conference.new_participant(cname).unwrap();
    let stream = session.new_stream(&participant, Direction::BOTH).unwrap();
    stream.set_remote_codecs(vec![Codec::PCMU, Codec::PCMA]).unwrap();
    stream
}

fn recv_codec_changes(events: &[ConferenceEvent]) -> Vec<Vec<Codec>> {
    events
        .iter()
        .filter_map(|event| match event {
            ConferenceEvent::RecvCodecsChanged { codecs, .. } => Some(codecs.clone()),
            _ => None,
        })
        .collect()
}

fn built_decoders(calls: &[Call]) -> Vec<(SubStreamId, u32, Codec)> {
    calls
        .iter()
        .filter_map(|call| match call {
            Call::BuildDecoder { substream, ssrc, codec } => Some((*substream, *ssrc, codec.clone())),
            _ => None,
        })
        .collect()
}

#[test]
fn ssrc_binds_to_the_only_stream_without_timeout() {
    let (conference, backend, session) = session_with_timeout(0);
    let stream = add_stream(&conference, &session, "b@test");

    events(&conference);
    backend.take_calls();

    let substream = conference.new_recv_pad(session.id(), 0x1234, 0).unwrap();

    let calls = backend.take_calls();
    let decoders = built_decoders(&calls);
    assert_eq!(decoders.len(), 1);
    assert_eq!(decoders[0].0, substream);
    assert_eq!(decoders[0].1, 0x1234);
    assert!(decoders[0].2.name_matches("PCMU"));
    assert!(calls.contains(&Call::SetSubstreamReceiving(substream, true)));

    let changes = recv_codec_changes(&events(&conference));
    assert_eq!(changes.len(), 1);
    assert!(changes[0][0].name_matches("PCMU"));

    assert_eq!(stream.current_recv_codecs().len(), 1);
    assert_eq!(conference.timeout(Instant::now()), None);

    // Same pad again reuses the sub-stream
    assert_eq!(conference.new_recv_pad(session.id(), 0x1234, 0), Some(substream));
    assert!(built_decoders(&backend.take_calls()).is_empty());

    // A second payload type of the same ssrc gets its own sub-stream and decoder
    let pcma = conference.new_recv_pad(session.id(), 0x1234, 8).unwrap();
    assert_ne!(pcma, substream);
    assert!(built_decoders(&backend.take_calls())[0].2.name_matches("PCMA"));
    assert_eq!(stream.current_recv_codecs().len(), 2);
}

#[test]
fn ssrc_binds_after_the_no_rtcp_timeout() {
    let (conference, backend, session) = session_with_timeout(7000);
    let stream = add_stream(&conference, &session, "b@test");

    events(&conference);
    backend.take_calls();

    let substream = conference.new_recv_pad(session.id(), 7, 0).unwrap();

    // The decoder exists, but the sub-stream belongs to nobody yet
    let calls = backend.take_calls();
    assert_eq!(built_decoders(&calls).len(), 1);
    assert!(!calls.iter().any(|call| matches!(call, Call::SetSubstreamReceiving(..))));
    assert!(stream.current_recv_codecs().is_empty());

    let now = Instant::now();
    let timeout = conference.timeout(now).unwrap();
    assert!(timeout <= Duration::from_millis(7000));

    conference.poll(now);
    assert!(backend.take_calls().is_empty());

    conference.poll(now + Duration::from_secs(8));

    let calls = backend.take_calls();
    assert!(calls.contains(&Call::SetSubstreamReceiving(substream, true)));
    assert!(calls.contains(&Call::SetDecryptionKey(7, false)));

    assert_eq!(recv_codec_changes(&events(&conference)).len(), 1);
    assert_eq!(stream.current_recv_codecs().len(), 1);
    assert_eq!(conference.timeout(Instant::now()), None);
}

#[test]
fn negative_timeout_waits_for_rtcp() {
    let (conference, backend, session) = session_with_timeout(-1);
    let stream = add_stream(&conference, &session, "b@test");

    conference.new_recv_pad(session.id(), 7, 0).unwrap();
    assert_eq!(conference.timeout(Instant::now()), None);

    backend.take_calls();
    conference.ssrc_cname(session.id(), 7, "b@test");

    assert!(
        backend
            .take_calls()
            .iter()
            .any(|call| matches!(call, Call::SetSubstreamReceiving(_, true)))
    );
    assert_eq!(stream.current_recv_codecs().len(), 1);
}

#[test]
fn cname_selects_the_stream() {
    let (conference, backend, session) = session_with_timeout(0);
    let first = add_stream(&conference, &session, "b@test");
    let second = add_stream(&conference, &session, "c@test");

    events(&conference);
    backend.take_calls();

    // Two streams, the ssrc can't be bound without its cname
    let substream = conference.new_recv_pad(session.id(), 42, 0).unwrap();
    assert!(
        !backend
            .take_calls()
            .iter()
            .any(|call| matches!(call, Call::SetSubstreamReceiving(..)))
    );

    conference.ssrc_cname(session.id(), 42, "unknown@test");
    assert!(backend.take_calls().is_empty());

    conference.ssrc_cname(session.id(), 42, "c@test");
    assert!(backend.take_calls().contains(&Call::SetSubstreamReceiving(substream, true)));
    assert!(first.current_recv_codecs().is_empty());
    assert_eq!(second.current_recv_codecs().len(), 1);

    events(&conference);

    conference.bye_ssrc(session.id(), 42);
    assert!(backend.take_calls().contains(&Call::RemoveDecoder(substream)));

    let changes = recv_codec_changes(&events(&conference));
    assert_eq!(changes, [Vec::<Codec>::new()]);
    assert!(second.current_recv_codecs().is_empty());

    // The mapping left with the bye, the ssrc is unbound again
    conference.new_recv_pad(session.id(), 42, 0).unwrap();
    assert!(
        !backend
            .take_calls()
            .iter()
            .any(|call| matches!(call, Call::SetSubstreamReceiving(..)))
    );
}

#[test]
fn manual_ssrc_mapping_survives_bye() {
    let (conference, backend, session) = session_with_timeout(-1);
    let _first = add_stream(&conference, &session, "b@test");
    let second = add_stream(&conference, &session, "c@test");

    second.add_id(99).unwrap();
    backend.take_calls();

    let substream = conference.new_recv_pad(session.id(), 99, 8).unwrap();
    assert!(backend.take_calls().contains(&Call::SetSubstreamReceiving(substream, true)));
    assert!(second.current_recv_codecs()[0].name_matches("PCMA"));

    conference.bye_ssrc(session.id(), 99);
    assert!(second.current_recv_codecs().is_empty());

    let substream = conference.new_recv_pad(session.id(), 99, 8).unwrap();
    assert!(backend.take_calls().contains(&Call::SetSubstreamReceiving(substream, true)));
}

#[test]
fn direction_controls_receiving() {
    let (conference, backend, session) = session_with_timeout(0);
    let stream = add_stream(&conference, &session, "b@test");

    let substream = conference.new_recv_pad(session.id(), 1, 0).unwrap();
    backend.take_calls();

    stream.set_direction(Direction::SEND).unwrap();
    assert!(backend.take_calls().contains(&Call::SetSubstreamReceiving(substream, false)));

    stream.set_direction(Direction::BOTH).unwrap();
    assert!(backend.take_calls().contains(&Call::SetSubstreamReceiving(substream, true)));
}

#[test]
fn unknown_payload_type_is_dropped() {
    let (conference, backend, session) = session_with_timeout(0);
    let _stream = add_stream(&conference, &session, "b@test");

    events(&conference);
    backend.take_calls();

    assert_eq!(conference.new_recv_pad(session.id(), 1, 77), None);
    assert!(built_decoders(&backend.take_calls()).is_empty());

    assert!(events(&conference).iter().any(|event| matches!(
        event,
        ConferenceEvent::Error {
            error: ezk_conference::Error::UnknownCodec(..),
            ..
        }
    )));

    assert!(conference.request_pt_map(session.id(), 0).is_some());
    assert!(conference.request_pt_map(session.id(), 77).is_none());
}

#[test]
fn stream_dispose_removes_its_substreams() {
    let (conference, backend, session) = session_with_timeout(0);
    let stream = add_stream(&conference, &session, "b@test");

    let substream = conference.new_recv_pad(session.id(), 5, 0).unwrap();
    backend.take_calls();

    stream.dispose().unwrap();

    let calls = backend.take_calls();
    assert!(calls.contains(&Call::RemoveDecoder(substream)));
    assert!(calls.contains(&Call::SetDecryptionKey(5, false)));
    assert!(matches!(stream.add_id(1), Err(ezk_conference::Error::Disposed(..))));
}

#[test]
fn decryption_keys_follow_the_stream() {
    let (conference, backend, session) = session_with_timeout(-1);
    let first = add_stream(&conference, &session, "b@test");
    let second = add_stream(&conference, &session, "c@test");

    // Unknown ssrcs are accepted in the clear as long as nobody requires encryption
    assert_eq!(conference.request_decryption_key(session.id(), 1), Some(SrtpParameters::null()));

    second.set_require_encryption(true).unwrap();
    assert_eq!(conference.request_decryption_key(session.id(), 1), None);

    first.add_id(1).unwrap();
    second.add_id(2).unwrap();

    assert_eq!(conference.request_decryption_key(session.id(), 1), Some(SrtpParameters::null()));
    assert_eq!(conference.request_decryption_key(session.id(), 2), None);

    backend.take_calls();

    // New parameters clear the stream's keys, they are requested again
    let parameters = SrtpParameters::new(SrtpCipher::Aes128Icm, SrtpAuth::HmacSha1_80, vec![7u8; 30]);
    second.set_decryption_parameters(Some(parameters.clone())).unwrap();
    assert_eq!(backend.take_calls(), [Call::SetDecryptionKey(2, false)]);
    assert_eq!(conference.request_decryption_key(session.id(), 2), Some(parameters.clone()));

    // Unchanged parameters keep the installed keys
    second.set_decryption_parameters(Some(parameters.clone())).unwrap();
    assert!(backend.take_calls().is_empty());

    // A re-key never leaves the old key installed
    let rekeyed = SrtpParameters::new(SrtpCipher::Aes128Icm, SrtpAuth::HmacSha1_80, vec![9u8; 30]);
    second.set_decryption_parameters(Some(rekeyed.clone())).unwrap();
    assert_eq!(backend.take_calls(), [Call::SetDecryptionKey(2, false)]);
    assert_eq!(conference.request_decryption_key(session.id(), 2), Some(rekeyed));

    let short_key = SrtpParameters::new(SrtpCipher::Aes128Icm, SrtpAuth::HmacSha1_80, vec![7u8; 16]);
    assert!(matches!(
        second.set_decryption_parameters(Some(short_key)),
        Err(ezk_conference::Error::InvalidArguments(..))
    ));
}

#[test]
fn session_walks_use_a_snapshot() {
    let (conference, backend, first) = session_with_timeout(7000);
    let second = conference
        .new_session_with_config(
            MediaType::Audio,
            SessionConfig {
                no_rtcp_timeout: 7000,
                ..SessionConfig::default()
            },
        )
        .unwrap();

    add_stream(&conference, &first, "b@test");
    add_stream(&conference, &second, "c@test");

    conference.new_recv_pad(first.id(), 7, 0).unwrap();
    let substream = conference.new_recv_pad(second.id(), 8, 0).unwrap();

    let walk = conference.sessions();
    assert_eq!(walk.len(), 2);

    first.dispose().unwrap();
    let third = conference.new_session(MediaType::Audio).unwrap();

    // Changes made during a walk don't affect the walk
    assert_eq!(walk.len(), 2);
    assert!(walk[0].is_disposed());
    assert_eq!(
        conference.sessions().iter().map(Session::id).collect::<Vec<_>>(),
        [second.id(), third.id()]
    );

    backend.take_calls();
    conference.poll(Instant::now() + Duration::from_secs(8));

    let calls = backend.take_calls();
    assert!(calls.contains(&Call::SetSubstreamReceiving(substream, true)));
    assert_eq!(
        calls
            .iter()
            .filter(|call| matches!(call, Call::SetSubstreamReceiving(..)))
            .count(),
        1
    );
}

#[test]
fn validated_ssrc_requests_a_key_unit() {
    let (conference, backend, session) = session_with_timeout(0);
    let _stream = add_stream(&conference, &session, "b@test");

    conference.ssrc_validated(session.id(), 3);
    assert_eq!(backend.count(|call| *call == Call::RequestKeyUnit), 0);

    conference.send_path_blocked(session.id());
    conference.ssrc_validated(session.id(), 3);
    assert_eq!(backend.count(|call| *call == Call::RequestKeyUnit), 1);
}
