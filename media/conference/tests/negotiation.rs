use common::{MockBackend, audio_blueprints, conference_with_backend, events, make_conference, speex};
use ezk_conference::{
    ConferenceEvent, Direction, Error, MediaType,
    codec::{BlueprintCapability, Codec, CodecBlueprint, CodecPreference, ID_ANY, has_config_data_named},
    negotiation::CodecAssociation,
};
use std::collections::HashSet;

mod common;

fn active(associations: &[CodecAssociation]) -> Vec<&CodecAssociation> {
    associations.iter().filter(|ca| ca.is_active()).collect()
}

fn assert_unique_pts(associations: &[CodecAssociation]) {
    let mut seen = HashSet::new();

    for ca in active(associations) {
        assert!((0..=127).contains(&ca.codec.id), "{}", ca.codec);
        assert!(seen.insert(ca.codec.id), "duplicate pt {}", ca.codec.id);
    }
}

fn assert_send_codecs_without_config(associations: &[CodecAssociation]) {
    for ca in associations.iter().filter(|ca| ca.is_valid_for_sending(false)) {
        let Some(send_codec) = &ca.send_codec else {
            panic!("{} is valid for sending without send codec", ca.codec);
        };

        for param in &send_codec.optional_params {
            assert!(
                !has_config_data_named(send_codec, &param.name),
                "send codec {send_codec} has config param {}",
                param.name
            );
        }
    }
}

#[test]
fn two_party_pcmu() {
    let (conference, _backend) = conference_with_backend(MockBackend::without_special_sources(vec![
        CodecBlueprint::new(Codec::PCMU, BlueprintCapability::Both),
        CodecBlueprint::new(Codec::PCMA, BlueprintCapability::Both),
    ]));

    let session = conference.new_session(MediaType::Audio).unwrap();
    session
        .set_codec_preferences(vec![
            CodecPreference::new(Codec::PCMU),
            CodecPreference::new(Codec::PCMA),
        ])
        .unwrap();

    let participant = conference.new_participant("b@test").unwrap();
    let stream = session.new_stream(&participant, Direction::BOTH).unwrap();
    stream.set_remote_codecs(vec![Codec::PCMU]).unwrap();

    let associations = session.codec_associations();
    let active = active(&associations);

    assert_eq!(active.len(), 2);

    assert!(active[0].codec.name_matches("PCMU"));
    assert_eq!(active[0].codec.id, 0);
    assert!(active[0].is_valid_for_sending(true));
    assert!(!active[0].recv_only);

    assert!(active[1].codec.name_matches("PCMA"));
    assert_eq!(active[1].codec.id, 8);
    assert!(active[1].recv_only);

    let codecs = session.codecs().unwrap();
    assert_eq!(codecs.len(), 1);
    assert!(codecs[0].name_matches("PCMU"));

    let negotiated = stream.negotiated_codecs();
    assert_eq!(negotiated.len(), 1);
    assert_eq!(negotiated[0].id, 0);
}

#[test]
fn payload_type_collision_with_single_stream() {
    let (conference, _backend) = conference_with_backend(MockBackend::without_special_sources(vec![
        CodecBlueprint::new(Codec::PCMU, BlueprintCapability::Both),
        CodecBlueprint::new(speex(ID_ANY), BlueprintCapability::Both),
    ]));

    let session = conference.new_session(MediaType::Audio).unwrap();
    session
        .set_codec_preferences(vec![CodecPreference::new(Codec::PCMU), CodecPreference::new(speex(96))])
        .unwrap();

    let participant = conference.new_participant("b@test").unwrap();
    let stream = session.new_stream(&participant, Direction::BOTH).unwrap();
    stream
        .set_remote_codecs(vec![Codec::PCMU, Codec::PCMA.with_id(96)])
        .unwrap();

    let associations = session.codec_associations();

    let pcmu = associations
        .iter()
        .find(|ca| ca.codec.name_matches("PCMU"))
        .unwrap();
    assert_eq!(pcmu.codec.id, 0);
    assert!(pcmu.is_valid_for_sending(true));

    let pcma = associations
        .iter()
        .find(|ca| ca.codec.name_matches("PCMA") && ca.codec.id == 96)
        .unwrap();
    assert!(pcma.disable);

    // The disabled PCMA entry occupies 96, so the local Speex isn't kept as receive-only there
    // and it isn't moved to another payload type either
    assert!(!associations.iter().any(|ca| ca.codec.name_matches("SPEEX")));
    assert!(
        active(&associations)
            .iter()
            .all(|ca| ca.codec.id != 96)
    );

    assert_unique_pts(&associations);

    let codecs = session.codecs().unwrap();
    assert_eq!(codecs.len(), 1);
    assert!(codecs[0].name_matches("PCMU"));
}

#[test]
fn local_payload_type_wins_with_multiple_streams() {
    let (conference, _backend) = conference_with_backend(MockBackend::without_special_sources(vec![
        CodecBlueprint::new(Codec::PCMU, BlueprintCapability::Both),
        CodecBlueprint::new(speex(ID_ANY), BlueprintCapability::Both),
    ]));

    let session = conference.new_session(MediaType::Audio).unwrap();
    session
        .set_codec_preferences(vec![CodecPreference::new(Codec::PCMU), CodecPreference::new(speex(96))])
        .unwrap();

    let b = conference.new_participant("b@test").unwrap();
    let first = session.new_stream(&b, Direction::BOTH).unwrap();
    first.set_remote_codecs(vec![Codec::PCMU, speex(101)]).unwrap();

    let c = conference.new_participant("c@test").unwrap();
    let second = session.new_stream(&c, Direction::BOTH).unwrap();
    second.set_remote_codecs(vec![Codec::PCMU, speex(102)]).unwrap();

    let associations = session.codec_associations();
    assert_unique_pts(&associations);

    let advertised: Vec<_> = active(&associations)
        .into_iter()
        .filter(|ca| !ca.recv_only)
        .collect();
    assert_eq!(advertised.len(), 2);
    assert!(advertised[0].codec.name_matches("PCMU"));
    assert_eq!(advertised[0].codec.id, 0);
    assert!(advertised[1].codec.name_matches("SPEEX"));
    assert_eq!(advertised[1].codec.id, 96);
    assert_eq!(advertised[1].send_codec.as_ref().map(|codec| codec.id), Some(96));

    // Neither remote payload type is advertised
    assert!(!advertised.iter().any(|ca| ca.codec.id == 101 || ca.codec.id == 102));

    let codecs = session.codecs().unwrap();
    assert_eq!(codecs.iter().map(|codec| codec.id).collect::<Vec<_>>(), [0, 96]);

    for stream in [&first, &second] {
        let negotiated = stream.negotiated_codecs();
        assert_eq!(negotiated.len(), 2);
        assert!(negotiated[0].name_matches("PCMU"));
        assert_eq!(negotiated[0].id, 0);
        assert!(negotiated[1].name_matches("SPEEX"));
        assert_eq!(negotiated[1].id, 96);
    }

    // Back to a single stream, the remaining peer's payload type is taken
    first.dispose().unwrap();

    let codecs = session.codecs().unwrap();
    assert!(codecs.iter().any(|codec| codec.name_matches("SPEEX") && codec.id == 102));
    assert_unique_pts(&session.codec_associations());
}

#[test]
fn profile_only_codec() {
    let (conference, _backend) = make_conference(audio_blueprints());
    let session = conference.new_session(MediaType::Audio).unwrap();

    session
        .set_codec_preferences(vec![
            CodecPreference::new(Codec::new(ID_ANY, "X", MediaType::Audio, 8000)).with_recv_profile("xdepay ! xdec"),
        ])
        .unwrap();

    let associations = session.codec_associations();
    let x = associations
        .iter()
        .find(|ca| ca.codec.name_matches("X"))
        .unwrap();

    assert!((96..=127).contains(&x.codec.id));
    assert!(x.blueprint.is_none());
    assert!(!x.is_valid_for_sending(true));
    assert_unique_pts(&associations);

    // Sending is only possible with a send profile as well
    session
        .set_codec_preferences(vec![
            CodecPreference::new(Codec::new(ID_ANY, "X", MediaType::Audio, 8000))
                .with_recv_profile("xdepay ! xdec")
                .with_send_profile("xenc ! xpay"),
        ])
        .unwrap();

    let associations = session.codec_associations();
    let x = associations
        .iter()
        .find(|ca| ca.codec.name_matches("X"))
        .unwrap();

    assert!(x.is_valid_for_sending(true));
}

#[test]
fn invalid_profile_is_ignored() {
    let (conference, _backend) = make_conference(audio_blueprints());
    let session = conference.new_session(MediaType::Audio).unwrap();

    session
        .set_codec_preferences(vec![
            CodecPreference::new(Codec::new(ID_ANY, "X", MediaType::Audio, 8000)).with_recv_profile(""),
        ])
        .unwrap();

    assert!(
        !session
            .codec_associations()
            .iter()
            .any(|ca| ca.codec.name_matches("X"))
    );
}

#[test]
fn preferences_leaving_no_codec_are_rejected() {
    let (conference, _backend) = conference_with_backend(MockBackend::without_special_sources(vec![
        CodecBlueprint::new(Codec::PCMU, BlueprintCapability::Both),
    ]));

    let session = conference.new_session(MediaType::Audio).unwrap();
    let before = session.codec_associations();

    let result = session.set_codec_preferences(vec![CodecPreference::new(Codec::PCMU.with_id(-2))]);
    assert!(matches!(result, Err(Error::NoCodecsLeft(..))));

    // Nothing changed
    assert!(session.codec_preferences().is_empty());
    assert_eq!(session.codec_associations().len(), before.len());
    assert!(session.codecs().unwrap()[0].name_matches("PCMU"));
}

#[test]
fn reserved_payload_types_are_not_used() {
    let (conference, _backend) = make_conference(audio_blueprints());
    let session = conference.new_session(MediaType::Audio).unwrap();

    session
        .set_codec_preferences(vec![
            CodecPreference::reserve_pt(MediaType::Audio, 96),
            CodecPreference::reserve_pt(MediaType::Audio, 97),
        ])
        .unwrap();

    let associations = session.codec_associations();

    assert!(
        associations
            .iter()
            .filter(|ca| ca.codec.id == 96 || ca.codec.id == 97)
            .all(|ca| ca.reserved)
    );

    let speex = associations
        .iter()
        .find(|ca| ca.codec.name_matches("SPEEX"))
        .unwrap();
    assert!(speex.codec.id >= 98);

    assert_unique_pts(&associations);
}

#[test]
fn invariants_hold_over_remote_offers() {
    let offers = [
        vec![Codec::PCMU],
        vec![speex(101), Codec::PCMA],
        vec![Codec::PCMA.with_id(96), speex(97), Codec::PCMU],
        vec![speex(0), Codec::PCMU.with_id(8)],
        vec![
            Codec::PCMU,
            Codec::new(101, "telephone-event", MediaType::Audio, 8000).with_param("events", "0-15"),
        ],
    ];

    for offer in offers {
        let (conference, _backend) = make_conference(audio_blueprints());
        let session = conference.new_session(MediaType::Audio).unwrap();
        let participant = conference.new_participant("b@test").unwrap();
        let stream = session.new_stream(&participant, Direction::BOTH).unwrap();

        stream.set_remote_codecs(offer.clone()).unwrap();

        let first = session.codec_associations();
        assert_unique_pts(&first);
        assert_send_codecs_without_config(&first);

        // Same offer again: same result
        stream.set_remote_codecs(offer.clone()).unwrap();

        let second = session.codec_associations();
        assert_eq!(first.len(), second.len());

        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.codec, b.codec);
            assert_eq!(a.send_codec, b.send_codec);
            assert_eq!(a.recv_only, b.recv_only);
            assert_eq!(a.disable, b.disable);
        }
    }
}

#[test]
fn payload_types_are_stable_across_renegotiation() {
    let (conference, _backend) = make_conference(audio_blueprints());
    let session = conference.new_session(MediaType::Audio).unwrap();
    let participant = conference.new_participant("b@test").unwrap();
    let stream = session.new_stream(&participant, Direction::BOTH).unwrap();

    let offer = vec![speex(101), Codec::PCMU];

    stream.set_remote_codecs(offer.clone()).unwrap();
    let first = session.codecs_without_config();

    stream.dispose().unwrap();

    let stream = session.new_stream(&participant, Direction::BOTH).unwrap();
    stream.set_remote_codecs(offer).unwrap();
    let second = session.codecs_without_config();

    assert_eq!(first, second);
}

#[test]
fn remote_codecs_are_validated() {
    let (conference, _backend) = make_conference(audio_blueprints());
    let session = conference.new_session(MediaType::Audio).unwrap();
    let participant = conference.new_participant("b@test").unwrap();
    let stream = session.new_stream(&participant, Direction::BOTH).unwrap();

    assert!(matches!(stream.set_remote_codecs(vec![]), Err(Error::InvalidArguments(..))));
    assert!(matches!(
        stream.set_remote_codecs(vec![Codec::PCMU.with_id(128)]),
        Err(Error::InvalidArguments(..))
    ));
    assert!(matches!(
        stream.set_remote_codecs(vec![Codec::H263]),
        Err(Error::InvalidArguments(..))
    ));

    // No intersection: the previous (empty) remote codecs stay
    let result = stream.set_remote_codecs(vec![Codec::new(96, "OPUS", MediaType::Audio, 48000)]);
    assert!(matches!(result, Err(Error::NegotiationFailed(..))));
    assert!(stream.remote_codecs().is_empty());
}

#[test]
fn codecs_changed_only_on_structural_change() {
    let (conference, _backend) = make_conference(audio_blueprints());
    let session = conference.new_session(MediaType::Audio).unwrap();
    let participant = conference.new_participant("b@test").unwrap();
    let stream = session.new_stream(&participant, Direction::BOTH).unwrap();

    events(&conference);

    let count = |events: &[ConferenceEvent]| {
        events
            .iter()
            .filter(|event| matches!(event, ConferenceEvent::CodecsChanged { .. }))
            .count()
    };

    stream.set_remote_codecs(vec![Codec::PCMU]).unwrap();
    assert_eq!(count(&events(&conference)), 1);

    stream.set_remote_codecs(vec![Codec::PCMU]).unwrap();
    assert_eq!(count(&events(&conference)), 0);

    stream.set_remote_codecs(vec![Codec::PCMA, Codec::PCMU]).unwrap();
    assert_eq!(count(&events(&conference)), 1);
}

#[test]
fn duplicate_stream_for_participant() {
    let (conference, _backend) = make_conference(audio_blueprints());
    let session = conference.new_session(MediaType::Audio).unwrap();
    let participant = conference.new_participant("b@test").unwrap();

    session.new_stream(&participant, Direction::BOTH).unwrap();

    assert!(matches!(
        session.new_stream(&participant, Direction::RECV),
        Err(Error::AlreadyExists(..))
    ));

    assert!(matches!(conference.new_participant(""), Err(Error::InvalidArguments(..))));
}

#[test]
fn send_codecs_never_carry_config() {
    let (conference, _backend) = make_conference(vec![CodecBlueprint::new(
        Codec::new(ID_ANY, "THEORA", MediaType::Video, 90000),
        BlueprintCapability::Both,
    )]);

    let session = conference.new_session(MediaType::Video).unwrap();
    let participant = conference.new_participant("b@test").unwrap();
    let stream = session.new_stream(&participant, Direction::BOTH).unwrap();

    stream
        .set_remote_codecs(vec![
            Codec::new(96, "THEORA", MediaType::Video, 90000)
                .with_param("configuration", "remote"),
        ])
        .unwrap();

    let associations = session.codec_associations();
    assert_send_codecs_without_config(&associations);

    let negotiated = stream.negotiated_codecs();
    assert_eq!(negotiated[0].param_value("configuration"), Some("remote"));

    for codec in session.codecs_without_config() {
        assert!(
            codec
                .optional_params
                .iter()
                .all(|param| !has_config_data_named(&codec, &param.name))
        );
    }
}
