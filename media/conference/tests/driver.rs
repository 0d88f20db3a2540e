#![cfg(feature = "tokio")]

use common::{audio_blueprints, make_conference};
use ezk_conference::{
    ConferenceEvent, Direction, MediaType, RtpPipelineHooks, SessionConfig, codec::Codec,
    tokio::ConferenceDriver,
};
use std::time::Duration;
use tokio::time::timeout;

mod common;

#[tokio::test]
async fn returns_queued_events() {
    let (conference, _backend) = make_conference(audio_blueprints());
    let session = conference.new_session(MediaType::Audio).unwrap();

    let mut driver = ConferenceDriver::new();

    let event = timeout(Duration::from_secs(1), driver.poll_conference(&conference))
        .await
        .unwrap();

    assert!(matches!(
        event,
        ConferenceEvent::CodecsChanged { session: id } if id == session.id()
    ));
}

#[tokio::test]
async fn wakes_up_for_events_from_other_tasks() {
    let (conference, _backend) = make_conference(audio_blueprints());
    let mut driver = ConferenceDriver::new();

    let other = conference.clone();
    let task = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        other.new_session(MediaType::Audio).unwrap()
    });

    let event = timeout(Duration::from_secs(1), driver.poll_conference(&conference))
        .await
        .unwrap();

    let session = task.await.unwrap();

    assert!(matches!(
        event,
        ConferenceEvent::CodecsChanged { session: id } if id == session.id()
    ));
}

#[tokio::test]
async fn drives_the_no_rtcp_timer() {
    let (conference, _backend) = make_conference(audio_blueprints());

    let session = conference
        .new_session_with_config(
            MediaType::Audio,
            SessionConfig {
                no_rtcp_timeout: 50,
                ..SessionConfig::default()
            },
        )
        .unwrap();

    let participant = conference.new_participant("b@test").unwrap();
    let stream = session.new_stream(&participant, Direction::BOTH).unwrap();
    stream.set_remote_codecs(vec![Codec::PCMU]).unwrap();

    conference.new_recv_pad(session.id(), 1, 0).unwrap();
    common::events(&conference);

    let mut driver = ConferenceDriver::new();

    let event = timeout(Duration::from_secs(1), driver.poll_conference(&conference))
        .await
        .unwrap();

    assert!(matches!(
        event,
        ConferenceEvent::RecvCodecsChanged { stream: id, .. } if id == stream.id()
    ));
}
