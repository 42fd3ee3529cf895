use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::timeout;

use crate::arbiter::{PauseToken, ResourceBroker};
use crate::error::ErrorCode;
use crate::events::{Events, Outcome, TranscodeEvent};
use crate::format::{DEFAULT_VIDEO_BITRATE, TrackFormat, keys};
use crate::session::{SessionConfig, SessionState, TranscodeSession};
use crate::testing::{
    MemorySink, MemorySource, StubCodecs, audio_format, make_samples, video_format,
};

const WAIT: Duration = Duration::from_secs(5);

/// RUST_LOG=debug makes the worker loops narrate their shutdown ordering.
fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

async fn next_event(events: &mut Events) -> TranscodeEvent {
    timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event stream closed before a terminal event")
}

/// Collect events until the terminal one. Progress percentages are returned
/// separately so tests can check monotonicity.
async fn drain(events: &mut Events) -> (Vec<u32>, TranscodeEvent) {
    let mut progress = Vec::new();
    loop {
        match next_event(events).await {
            TranscodeEvent::Progress(p) => progress.push(p),
            TranscodeEvent::ResourceLost(_) => {}
            terminal => return (progress, terminal),
        }
    }
}

async fn wait_resource_lost(events: &mut Events) -> Bytes {
    loop {
        match next_event(events).await {
            TranscodeEvent::ResourceLost(token) => return token,
            TranscodeEvent::Progress(_) => {}
            other => panic!("expected ResourceLost, got {other:?}"),
        }
    }
}

/// Video track 0 (30 samples @ 30fps) and audio track 1 (20 samples).
fn two_track_source() -> MemorySource {
    let mut source = MemorySource::new();
    source.add_track(video_format(1280, 720, 30.0, 30), make_samples(0, 30, 33_333));
    source.add_track(audio_format(48_000, 2, 1_000_000), make_samples(1, 20, 50_000));
    source
}

#[tokio::test]
async fn transcode_and_passthrough_to_completion() -> anyhow::Result<()> {
    init_logs();
    let codecs = Arc::new(StubCodecs::new());
    let (session, mut events) = TranscodeSession::create(codecs.clone(), SessionConfig::default());

    session.configure_source(Box::new(two_track_source())).await?;
    let (sink, record) = MemorySink::new();
    session.configure_destination(Box::new(sink)).await?;

    let mut dest = TrackFormat::new();
    dest.set_i32(keys::BITRATE, 4_000_000);
    session.configure_track(0, Some(dest)).await?;
    session.configure_track(1, None).await?;

    let completion = session.start().await?;
    assert_eq!(session.state().await?, SessionState::Running);

    assert_eq!(timeout(WAIT, completion.wait()).await?, Some(Outcome::Finished));
    let (progress, terminal) = drain(&mut events).await;
    assert_eq!(terminal, TranscodeEvent::Finished);
    assert!(progress.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(progress.last(), Some(&100));

    assert!(record.finalized());
    assert_eq!(record.track_count(), 2);
    assert_eq!(record.samples(0).len(), 30);
    // Passthrough output is bit-identical, timestamps included.
    assert_eq!(record.samples(1), make_samples(1, 20, 50_000));

    // The encoder saw the override merged over carried-through source fields.
    let formats = codecs.encoder_formats.lock().unwrap();
    assert_eq!(formats.len(), 1);
    let (_, encoder_dest) = &formats[0];
    assert_eq!(encoder_dest.get_i32(keys::BITRATE), Some(4_000_000));
    assert_eq!(encoder_dest.get_i32(keys::WIDTH), Some(1280));
    assert_eq!(encoder_dest.mime(), Some("video/avc"));
    drop(formats);

    assert_eq!(session.state().await?, SessionState::Finished);
    Ok(())
}

#[tokio::test]
async fn unconfigured_tracks_are_excluded() -> anyhow::Result<()> {
    let (session, mut events) =
        TranscodeSession::create(Arc::new(StubCodecs::new()), SessionConfig::default());

    session.configure_source(Box::new(two_track_source())).await?;
    let (sink, record) = MemorySink::new();
    session.configure_destination(Box::new(sink)).await?;
    session.configure_track(1, None).await?;

    let completion = session.start().await?;
    assert_eq!(timeout(WAIT, completion.wait()).await?, Some(Outcome::Finished));
    let (_, terminal) = drain(&mut events).await;
    assert_eq!(terminal, TranscodeEvent::Finished);

    // Only the audio track made it to the destination, as sink track 0.
    assert_eq!(record.track_count(), 1);
    assert_eq!(record.samples(0), make_samples(1, 20, 50_000));
    Ok(())
}

#[tokio::test]
async fn default_bitrate_applied_when_unspecified() -> anyhow::Result<()> {
    let codecs = Arc::new(StubCodecs::new());
    let (session, mut events) = TranscodeSession::create(codecs.clone(), SessionConfig::default());

    session.configure_source(Box::new(two_track_source())).await?;
    let (sink, _record) = MemorySink::new();
    session.configure_destination(Box::new(sink)).await?;
    session.configure_track(0, Some(TrackFormat::new())).await?;

    let completion = session.start().await?;
    assert_eq!(timeout(WAIT, completion.wait()).await?, Some(Outcome::Finished));
    drain(&mut events).await;

    let formats = codecs.encoder_formats.lock().unwrap();
    let (_, encoder_dest) = &formats[0];
    assert_eq!(encoder_dest.get_i32(keys::BITRATE), Some(DEFAULT_VIDEO_BITRATE));
    Ok(())
}

#[tokio::test]
async fn track_formats_reflect_configuration() -> anyhow::Result<()> {
    let (session, _events) =
        TranscodeSession::create(Arc::new(StubCodecs::new()), SessionConfig::default());
    session.configure_source(Box::new(two_track_source())).await?;

    let before = session.track_formats().await?;
    assert_eq!(before.len(), 2);
    assert!(before.iter().all(|t| !t.included));
    assert_eq!(before[0].mime, "video/avc");

    let mut dest = TrackFormat::new();
    dest.set_i32(keys::BITRATE, 4_000_000);
    session.configure_track(0, Some(dest)).await?;
    session.configure_track(1, None).await?;

    let after = session.track_formats().await?;
    assert!(after[0].included && !after[0].passthrough());
    assert!(after[1].included && after[1].passthrough());
    assert_eq!(
        after[0].destination.as_ref().and_then(|d| d.get_i32(keys::BITRATE)),
        Some(4_000_000)
    );
    Ok(())
}

#[tokio::test]
async fn empty_source_is_rejected() -> anyhow::Result<()> {
    let (session, _events) =
        TranscodeSession::create(Arc::new(StubCodecs::new()), SessionConfig::default());
    let err = session
        .configure_source(Box::new(MemorySource::new()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidSource);
    Ok(())
}

#[tokio::test]
async fn invalid_track_configuration_is_rejected() -> anyhow::Result<()> {
    let (session, _events) =
        TranscodeSession::create(Arc::new(StubCodecs::new()), SessionConfig::default());
    session.configure_source(Box::new(two_track_source())).await?;

    let err = session.configure_track(5, None).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidTrackIndex);

    let mut zero_bitrate = TrackFormat::new();
    zero_bitrate.set_i32(keys::BITRATE, 0);
    let err = session.configure_track(0, Some(zero_bitrate)).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidTrackFormat);

    let mut negative_width = TrackFormat::new();
    negative_width.set_i32(keys::WIDTH, -1920);
    let err = session.configure_track(0, Some(negative_width)).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidTrackFormat);

    let mut zero_rate = TrackFormat::new();
    zero_rate.set_f64(keys::FRAME_RATE, 0.0);
    let err = session.configure_track(0, Some(zero_rate)).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidTrackFormat);
    Ok(())
}

#[tokio::test]
async fn unsupported_mime_blocks_transcode_not_passthrough() -> anyhow::Result<()> {
    // Audio-only codec stack: the video track can still pass through.
    let codecs = Arc::new(StubCodecs::supporting(&["audio/mp4a-latm"]));
    let (session, mut events) = TranscodeSession::create(codecs, SessionConfig::default());

    session.configure_source(Box::new(two_track_source())).await?;
    let (sink, record) = MemorySink::new();
    session.configure_destination(Box::new(sink)).await?;

    let err = session
        .configure_track(0, Some(TrackFormat::new()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::UnsupportedMime);

    session.configure_track(0, None).await?;
    let completion = session.start().await?;
    assert_eq!(timeout(WAIT, completion.wait()).await?, Some(Outcome::Finished));
    drain(&mut events).await;
    assert_eq!(record.samples(0), make_samples(0, 30, 33_333));
    Ok(())
}

#[tokio::test]
async fn start_requires_destination_and_tracks() -> anyhow::Result<()> {
    let (session, _events) =
        TranscodeSession::create(Arc::new(StubCodecs::new()), SessionConfig::default());
    session.configure_source(Box::new(two_track_source())).await?;

    let err = session.start().await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::StartFailure);

    let (sink, _record) = MemorySink::new();
    session.configure_destination(Box::new(sink)).await?;
    let err = session.start().await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::StartFailure);
    Ok(())
}

#[tokio::test]
async fn running_session_rejects_reconfiguration() -> anyhow::Result<()> {
    let (session, mut events) =
        TranscodeSession::create(Arc::new(StubCodecs::new()), SessionConfig::default());

    let mut source = MemorySource::new();
    source.add_track(audio_format(48_000, 2, 2_000_000), make_samples(0, 200, 10_000));
    source.delay_per_read(Duration::from_millis(2));
    session.configure_source(Box::new(source)).await?;
    let (sink, _record) = MemorySink::new();
    session.configure_destination(Box::new(sink)).await?;
    session.configure_track(0, None).await?;
    let completion = session.start().await?;

    let err = session.configure_track(0, None).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidState);
    let err = session.start().await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidState);

    session.cancel();
    assert_eq!(timeout(WAIT, completion.wait()).await?, Some(Outcome::Cancelled));
    drain(&mut events).await;
    Ok(())
}

#[tokio::test]
async fn rejected_destination_track_leaves_session_configured() -> anyhow::Result<()> {
    let (session, mut events) =
        TranscodeSession::create(Arc::new(StubCodecs::new()), SessionConfig::default());
    session.configure_source(Box::new(two_track_source())).await?;

    let (mut sink, record) = MemorySink::new();
    sink.fail_add_track();
    session.configure_destination(Box::new(sink)).await?;
    session.configure_track(1, None).await?;

    let err = session.start().await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::StartFailure);
    assert_eq!(session.state().await?, SessionState::Configured);
    assert!(!record.finalized());

    // A fresh destination makes the same session startable again.
    let (sink, record) = MemorySink::new();
    session.configure_destination(Box::new(sink)).await?;
    let completion = session.start().await?;
    assert_eq!(timeout(WAIT, completion.wait()).await?, Some(Outcome::Finished));
    drain(&mut events).await;
    assert!(record.finalized());
    Ok(())
}

#[tokio::test]
async fn demux_failure_emits_single_error() -> anyhow::Result<()> {
    let (session, mut events) =
        TranscodeSession::create(Arc::new(StubCodecs::new()), SessionConfig::default());

    let mut source = two_track_source();
    source.fail_after(10);
    session.configure_source(Box::new(source)).await?;
    let (sink, record) = MemorySink::new();
    session.configure_destination(Box::new(sink)).await?;
    session.configure_track(0, None).await?;
    session.configure_track(1, None).await?;

    let completion = session.start().await?;
    assert_eq!(
        timeout(WAIT, completion.wait()).await?,
        Some(Outcome::Error(ErrorCode::SourceFailure))
    );
    let (_, terminal) = drain(&mut events).await;
    assert_eq!(terminal, TranscodeEvent::Error(ErrorCode::SourceFailure));
    assert!(!record.finalized());
    assert_eq!(session.state().await?, SessionState::Failed);
    Ok(())
}

#[tokio::test]
async fn decode_failure_emits_single_error() -> anyhow::Result<()> {
    let codecs = Arc::new(StubCodecs::new().decoder_fail_after(5));
    let (session, mut events) = TranscodeSession::create(codecs, SessionConfig::default());

    session.configure_source(Box::new(two_track_source())).await?;
    let (sink, record) = MemorySink::new();
    session.configure_destination(Box::new(sink)).await?;
    session.configure_track(0, Some(TrackFormat::new())).await?;
    session.configure_track(1, None).await?;

    let completion = session.start().await?;
    assert_eq!(
        timeout(WAIT, completion.wait()).await?,
        Some(Outcome::Error(ErrorCode::DecodeFailure))
    );
    let (_, terminal) = drain(&mut events).await;
    assert_eq!(terminal, TranscodeEvent::Error(ErrorCode::DecodeFailure));
    assert!(!record.finalized());
    Ok(())
}

#[tokio::test]
async fn mux_write_failure_emits_single_error() -> anyhow::Result<()> {
    let (session, mut events) =
        TranscodeSession::create(Arc::new(StubCodecs::new()), SessionConfig::default());

    session.configure_source(Box::new(two_track_source())).await?;
    let (mut sink, record) = MemorySink::new();
    sink.fail_write_at(3);
    session.configure_destination(Box::new(sink)).await?;
    session.configure_track(0, None).await?;
    session.configure_track(1, None).await?;

    let completion = session.start().await?;
    assert_eq!(
        timeout(WAIT, completion.wait()).await?,
        Some(Outcome::Error(ErrorCode::MuxFailure))
    );
    let (_, terminal) = drain(&mut events).await;
    assert_eq!(terminal, TranscodeEvent::Error(ErrorCode::MuxFailure));
    assert!(!record.finalized());
    Ok(())
}

#[tokio::test]
async fn cancel_mid_run_acknowledges_once() -> anyhow::Result<()> {
    let (session, mut events) =
        TranscodeSession::create(Arc::new(StubCodecs::new()), SessionConfig::default());

    let mut source = MemorySource::new();
    source.add_track(audio_format(48_000, 2, 2_000_000), make_samples(0, 200, 10_000));
    source.delay_per_read(Duration::from_millis(2));
    session.configure_source(Box::new(source)).await?;
    let (sink, record) = MemorySink::new();
    session.configure_destination(Box::new(sink)).await?;
    session.configure_track(0, None).await?;
    let completion = session.start().await?;

    tokio::time::sleep(Duration::from_millis(20)).await;
    session.cancel();
    session.cancel(); // idempotent

    assert_eq!(timeout(WAIT, completion.wait()).await?, Some(Outcome::Cancelled));
    let (_, terminal) = drain(&mut events).await;
    assert_eq!(terminal, TranscodeEvent::Cancelled);
    assert!(!record.finalized());
    assert_eq!(session.state().await?, SessionState::Cancelled);
    Ok(())
}

#[tokio::test]
async fn cancel_before_start_is_terminal() -> anyhow::Result<()> {
    let (session, mut events) =
        TranscodeSession::create(Arc::new(StubCodecs::new()), SessionConfig::default());
    session.configure_source(Box::new(two_track_source())).await?;

    session.cancel();
    assert_eq!(next_event(&mut events).await, TranscodeEvent::Cancelled);
    let err = session.configure_track(0, None).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidState);
    Ok(())
}

#[tokio::test]
async fn reclaim_pauses_and_resume_completes() -> anyhow::Result<()> {
    init_logs();
    let broker = ResourceBroker::new();
    let config = SessionConfig {
        broker: Some(broker.clone()),
        ..SessionConfig::default()
    };
    let (session, mut events) = TranscodeSession::create(Arc::new(StubCodecs::new()), config);

    let mut source = MemorySource::new();
    source.add_track(video_format(1280, 720, 30.0, 60), make_samples(0, 60, 33_333));
    source.delay_per_read(Duration::from_millis(3));
    session.configure_source(Box::new(source)).await?;
    let (sink, record) = MemorySink::new();
    session.configure_destination(Box::new(sink)).await?;
    session.configure_track(0, Some(TrackFormat::new())).await?;
    let completion = session.start().await?;

    // A resume with nothing to resume is an ordering violation.
    let err = session.resume(b"whatever").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidState);

    broker.reclaim();
    let first = wait_resource_lost(&mut events).await;
    assert_eq!(session.state().await?, SessionState::Paused);
    assert_eq!(PauseToken::from_bytes(&first)?.tracks.len(), 1);

    // A repeated reclaim re-issues a checkpoint instead of failing.
    broker.reclaim();
    let token = wait_resource_lost(&mut events).await;
    assert_eq!(session.state().await?, SessionState::Paused);

    session.resume(&token).await?;
    assert_eq!(session.state().await?, SessionState::Running);

    assert_eq!(timeout(WAIT, completion.wait()).await?, Some(Outcome::Finished));
    let (_, terminal) = drain(&mut events).await;
    assert_eq!(terminal, TranscodeEvent::Finished);
    // Nothing was lost across the pause.
    assert!(record.finalized());
    assert_eq!(record.samples(0).len(), 60);
    Ok(())
}

#[tokio::test]
async fn resume_rejects_foreign_and_malformed_tokens() -> anyhow::Result<()> {
    let broker = ResourceBroker::new();
    let config = SessionConfig {
        broker: Some(broker.clone()),
        ..SessionConfig::default()
    };
    let (session, mut events) = TranscodeSession::create(Arc::new(StubCodecs::new()), config);

    let mut source = MemorySource::new();
    source.add_track(audio_format(48_000, 2, 2_000_000), make_samples(0, 200, 10_000));
    source.delay_per_read(Duration::from_millis(2));
    session.configure_source(Box::new(source)).await?;
    let (sink, _record) = MemorySink::new();
    session.configure_destination(Box::new(sink)).await?;
    session.configure_track(0, None).await?;
    let completion = session.start().await?;

    broker.reclaim();
    let token = wait_resource_lost(&mut events).await;

    let err = session.resume(b"not a token").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ResumeRejected);

    let mut foreign = PauseToken::from_bytes(&token)?;
    foreign.session += 1;
    let err = session.resume(&foreign.to_bytes()).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ResumeRejected);
    assert_eq!(session.state().await?, SessionState::Paused);

    // The genuine token still works after the rejected attempts.
    session.resume(&token).await?;
    assert_eq!(timeout(WAIT, completion.wait()).await?, Some(Outcome::Finished));
    drain(&mut events).await;
    Ok(())
}

#[tokio::test]
async fn grace_window_expiry_fails_the_session() -> anyhow::Result<()> {
    let broker = ResourceBroker::new();
    let config = SessionConfig {
        grace_window: Duration::from_millis(50),
        broker: Some(broker.clone()),
    };
    let (session, mut events) = TranscodeSession::create(Arc::new(StubCodecs::new()), config);

    let mut source = MemorySource::new();
    source.add_track(video_format(1280, 720, 30.0, 200), make_samples(0, 200, 33_333));
    source.delay_per_read(Duration::from_millis(3));
    session.configure_source(Box::new(source)).await?;
    let (sink, record) = MemorySink::new();
    session.configure_destination(Box::new(sink)).await?;
    session.configure_track(0, Some(TrackFormat::new())).await?;
    let completion = session.start().await?;

    broker.reclaim();
    let token = wait_resource_lost(&mut events).await;

    // No resume: the grace window runs out.
    assert_eq!(
        timeout(WAIT, completion.wait()).await?,
        Some(Outcome::Error(ErrorCode::Timeout))
    );
    let (_, terminal) = drain(&mut events).await;
    assert_eq!(terminal, TranscodeEvent::Error(ErrorCode::Timeout));
    assert_eq!(session.state().await?, SessionState::Failed);
    assert!(!record.finalized());

    let err = session.resume(&token).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidState);
    Ok(())
}
